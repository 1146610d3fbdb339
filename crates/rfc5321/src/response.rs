use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Hash)]
pub struct Response {
    pub code: u16,
    pub enhanced_code: Option<EnhancedStatusCode>,
    #[serde(serialize_with = "as_single_line")]
    pub content: String,
    pub command: Option<String>,
}

impl Response {
    pub fn to_single_line(&self) -> String {
        let mut line = format!("{} ", self.code);

        if let Some(enh) = &self.enhanced_code {
            line.push_str(&format!("{enh} "));
        }

        line.push_str(&remove_line_break(&self.content));

        line
    }

    /// The text of each response line with the enhanced status code
    /// restored, ready to be written back out behind the reply code.
    pub fn text_lines(&self) -> Vec<String> {
        self.content
            .lines()
            .map(|line| match &self.enhanced_code {
                Some(enh) => format!("{enh} {line}"),
                None => line.to_string(),
            })
            .collect()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_transient(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    pub fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    pub fn with_code_and_message(code: u16, message: &str) -> Self {
        let mut lines = message.lines();
        let first = lines.next().unwrap_or("");

        let mut builder = ResponseBuilder::new(&ResponseLine {
            code,
            content: first,
            is_final: true,
        });

        for line in lines {
            builder.add_line(&ResponseLine {
                code,
                content: line,
                is_final: false,
            });
        }

        builder.build(None)
    }
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Hash)]
pub struct EnhancedStatusCode {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

impl std::fmt::Display for EnhancedStatusCode {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

fn parse_enhanced_status_code(line: &str) -> Option<(EnhancedStatusCode, &str)> {
    let mut fields = line.splitn(3, '.');
    let class = fields.next()?.parse::<u8>().ok()?;
    if !matches!(class, 2 | 4 | 5) {
        // No other classes are defined
        return None;
    }
    let subject = fields.next()?.parse::<u16>().ok()?;

    let remainder = fields.next()?;
    let mut fields = remainder.splitn(2, ' ');
    let detail = fields.next()?.parse::<u16>().ok()?;
    let remainder = fields.next()?;

    Some((
        EnhancedStatusCode {
            class,
            subject,
            detail,
        },
        remainder,
    ))
}

pub(crate) fn remove_line_break(data: &str) -> String {
    let mut normalized = String::with_capacity(data.len());
    let mut chars = data.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() != Some(&'\n') {
                    normalized.push(' ');
                }
            }
            '\n' => normalized.push(' '),
            c => normalized.push(c),
        }
    }

    normalized
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ResponseLine<'a> {
    pub code: u16,
    pub is_final: bool,
    pub content: &'a str,
}

impl ResponseLine<'_> {
    /// Reconstitute the original line that we parsed
    #[cfg_attr(not(feature = "client"), allow(dead_code))]
    pub fn to_original_line(&self) -> String {
        format!(
            "{}{}{}",
            self.code,
            if self.is_final { " " } else { "-" },
            self.content
        )
    }
}

/// Splits `250-text` or `250 text` into its parts.
pub(crate) fn parse_response_line(line: &str) -> Option<ResponseLine<'_>> {
    let sep = *line.as_bytes().get(3)?;
    if sep != b' ' && sep != b'-' {
        return None;
    }
    let code = line.get(0..3)?.parse::<u16>().ok()?;
    Some(ResponseLine {
        code,
        is_final: sep == b' ',
        content: &line[4..],
    })
}

pub(crate) struct ResponseBuilder {
    pub code: u16,
    pub enhanced_code: Option<EnhancedStatusCode>,
    pub content: String,
}

impl ResponseBuilder {
    pub fn new(parsed: &ResponseLine) -> Self {
        let code = parsed.code;
        let (enhanced_code, content) = match parse_enhanced_status_code(parsed.content) {
            Some((enhanced, content)) => (Some(enhanced), content.to_string()),
            None => (None, parsed.content.to_string()),
        };

        Self {
            code,
            enhanced_code,
            content,
        }
    }

    /// Append a continuation line. Returns false when the line
    /// carries a different reply code.
    pub fn add_line(&mut self, parsed: &ResponseLine) -> bool {
        if parsed.code != self.code {
            return false;
        }

        self.content.push('\n');

        let mut content = parsed.content;

        if let Some(enh) = &self.enhanced_code {
            let prefix = format!("{enh} ");
            if let Some(remainder) = parsed.content.strip_prefix(&prefix) {
                content = remainder;
            }
        }

        self.content.push_str(content);
        true
    }

    pub fn build(self, command: Option<String>) -> Response {
        Response {
            code: self.code,
            content: self.content,
            enhanced_code: self.enhanced_code,
            command,
        }
    }
}

fn as_single_line<S>(content: &String, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&remove_line_break(content))
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn remove_crlf() {
        fn remove(s: &str, expect: &str) {
            assert_eq!(remove_line_break(s), expect, "input: {s:?}");
        }

        remove("hello\r\nthere\r\n", "hello there ");
        remove("hello\r", "hello ");
        remove("hello\nthere\r\n", "hello there ");
        remove("hello\r\nthere\n", "hello there ");
        remove("hello\r\r\r\nthere\n", "hello   there ");
    }

    #[test]
    fn enhanced_code_parsing() {
        assert_equal!(
            parse_enhanced_status_code("2.0.1 w00t"),
            Some((
                EnhancedStatusCode {
                    class: 2,
                    subject: 0,
                    detail: 1
                },
                "w00t"
            ))
        );

        assert_equal!(parse_enhanced_status_code("3.0.0 w00t"), None);
        assert_equal!(parse_enhanced_status_code("2.0.0.1 w00t"), None);
        assert_equal!(parse_enhanced_status_code("2.0.0.1w00t"), None);
    }

    #[test]
    fn response_line_parsing() {
        assert_equal!(
            parse_response_line("220 woot"),
            Some(ResponseLine {
                code: 220,
                is_final: true,
                content: "woot"
            })
        );
        assert_equal!(
            parse_response_line("220-woot"),
            Some(ResponseLine {
                code: 220,
                is_final: false,
                content: "woot"
            })
        );
        assert_equal!(parse_response_line("220_woot"), None);
        assert_equal!(parse_response_line("not really"), None);
        assert_equal!(parse_response_line("25"), None);
    }

    #[test]
    fn multi_line_with_enhanced_code() {
        let response =
            Response::with_code_and_message(550, "5.1.1 no such user\n5.1.1 try again later");
        assert_equal!(response.content, "no such user\ntry again later");
        assert_equal!(
            response.text_lines(),
            vec![
                "5.1.1 no such user".to_string(),
                "5.1.1 try again later".to_string()
            ]
        );
        assert_equal!(
            response.to_single_line(),
            "550 5.1.1 no such user try again later"
        );
        assert!(response.is_permanent());
        assert!(!response.is_success());
    }
}

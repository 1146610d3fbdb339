use rfc5321::Response;
use std::time::Duration;
use thiserror::Error;

/// A reply to be written to the client: a 3 digit code and one or
/// more lines of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new<S: AsRef<str>>(code: u16, text: S) -> Self {
        let mut lines: Vec<String> = text.as_ref().lines().map(str::to_string).collect();
        if lines.is_empty() {
            lines.push(String::new());
        }
        Self { code, lines }
    }

    /// Parse a literal reply such as `250 2.0.0 OK`, as found in
    /// scenario configuration and webhook responses. Multi-line text
    /// is accepted provided every line carries the same code.
    pub fn parse(text: &str) -> Option<Self> {
        let mut code = None;
        let mut lines = vec![];

        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            let this_code = line.get(0..3)?.parse::<u16>().ok()?;
            if !(100..600).contains(&this_code) {
                return None;
            }
            match code {
                None => code = Some(this_code),
                Some(prior) if prior != this_code => return None,
                Some(_) => {}
            }
            let rest = &line[3..];
            let text = if rest.is_empty() {
                rest
            } else {
                rest.strip_prefix([' ', '-'])?
            };
            lines.push(text.to_string());
        }

        Some(Self { code: code?, lines })
    }

    /// Append the session UID to the final line
    pub fn with_uid(mut self, uid: &str) -> Self {
        if let Some(last) = self.lines.last_mut() {
            last.push_str(&format!(" [{uid}]"));
        }
        self
    }

    /// 2xx or 3xx
    pub fn is_positive(&self) -> bool {
        self.code < 400
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn to_wire(&self) -> String {
        let mut text = String::new();
        let mut lines = self.lines.iter().peekable();
        while let Some(line) = lines.next() {
            let sep = if lines.peek().is_none() { ' ' } else { '-' };
            text.push_str(&format!("{}{sep}{line}\r\n", self.code));
        }
        text
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{} {}", self.code, self.lines.join(" "))
    }
}

/// A downstream response collapsed onto a single line, ready to be
/// relayed to our own client
impl From<&Response> for Reply {
    fn from(response: &Response) -> Self {
        let line = response.to_single_line();
        let text = line.split_once(' ').map(|(_, text)| text).unwrap_or_default();
        Self::new(response.code, text)
    }
}

/// The result of processing one command
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Outcome {
    /// The command completed and has written its own reply
    Ok,
    /// The command was refused; the caller writes the reply and
    /// the session carries on
    Rejected(Reply),
    /// The client asked to end the session
    Quit,
    /// The 220 has been sent; the stream must be upgraded to TLS
    StartTls,
}

/// A transport level failure. These end the connection.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Timed out after {duration:?} waiting for the client")]
    Timeout { duration: Duration },
    #[error("Line exceeds the maximum permitted length")]
    LineTooLong,
    #[error("Client disconnected")]
    Disconnected,
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn wire_format() {
        assert_equal!(Reply::new(250, "OK").to_wire(), "250 OK\r\n");
        assert_equal!(
            Reply::new(250, "Welcome\nPIPELINING\nSIZE 100").to_wire(),
            "250-Welcome\r\n250-PIPELINING\r\n250 SIZE 100\r\n"
        );
        assert_equal!(
            Reply::new(250, "2.0.0 Received OK")
                .with_uid("abc")
                .to_string(),
            "250 2.0.0 Received OK [abc]"
        );
    }

    #[test]
    fn parse_literal() {
        assert_equal!(
            Reply::parse("550 5.1.1 nope"),
            Some(Reply::new(550, "5.1.1 nope"))
        );
        assert_equal!(
            Reply::parse("250-one\r\n250 two"),
            Some(Reply::new(250, "one\ntwo"))
        );
        assert_equal!(Reply::parse("250"), Some(Reply::new(250, "")));
        assert_equal!(Reply::parse("250-one\r\n251 two"), None);
        assert_equal!(Reply::parse("OK then"), None);
        assert_equal!(Reply::parse("250OK"), None);
        assert_equal!(Reply::parse(""), None);
    }

    #[test]
    fn from_downstream_response() {
        let response = Response::with_code_and_message(250, "2.0.0 queued as 1234");
        assert_equal!(
            Reply::from(&response).with_uid("u1").to_string(),
            "250 2.0.0 queued as 1234 [u1]"
        );

        let response = Response::with_code_and_message(550, "5.1.1 no such user\nreally");
        let reply = Reply::from(&response);
        assert_equal!(reply.lines.len(), 1);
        assert_equal!(reply.code, 550);
    }
}

//! Tokenizer for command lines received by the server.
//!
//! A `Verb` never fails to parse: malformed input simply produces a
//! keyword that no registered extension answers to, and the dispatch
//! loop turns that into "command not recognized".
use pest::Parser as _;
use pest_derive::Parser;

#[derive(Parser)]
#[grammar = "verb.pest"]
struct PathParser;

/// An ESMTP `name[=value]` parameter trailing a MAIL or RCPT path.
/// The name is stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmtpParameter {
    pub name: String,
    pub value: Option<String>,
}

impl std::fmt::Display for EsmtpParameter {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.value {
            Some(value) => write!(fmt, "{}={value}", self.name.to_ascii_uppercase()),
            None => write!(fmt, "{}", self.name.to_ascii_uppercase()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verb {
    line: String,
    key: String,
    parts: Vec<String>,
    address: Option<String>,
    params: Vec<EsmtpParameter>,
}

impl Verb {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        let parts: Vec<String> = line.split_ascii_whitespace().map(str::to_string).collect();
        let key = parts
            .first()
            .map(|word| word.to_ascii_lowercase())
            .unwrap_or_default();

        let path = match key.as_str() {
            "mail" => parse_path(line, Rule::mail_command),
            "rcpt" => parse_path(line, Rule::rcpt_command),
            _ => None,
        };
        let (address, params) = match path {
            Some((address, params)) => (Some(address), params),
            None => (None, vec![]),
        };

        Self {
            line: line.to_string(),
            key,
            parts,
            address,
            params,
        }
    }

    /// The line as received, minus its line ending
    pub fn line(&self) -> &str {
        &self.line
    }

    /// Lowercased command keyword, used to look up the extension
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Number of whitespace separated parts, keyword included
    pub fn count(&self) -> usize {
        self.parts.len()
    }

    pub fn part(&self, idx: usize) -> Option<&str> {
        self.parts.get(idx).map(String::as_str)
    }

    /// The path carried by `MAIL FROM:` or `RCPT TO:`.
    /// `Some("")` is the null path `<>`; `None` means the path
    /// was missing or malformed.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn params(&self) -> &[EsmtpParameter] {
        &self.params
    }

    /// Value of a named ESMTP parameter. The lookup ignores case.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .and_then(|p| p.value.as_deref())
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.params.iter().any(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// True when the line cannot possibly be a command: there is no
    /// keyword, the keyword has characters other than letters and
    /// digits, or the line carries a NUL.
    pub fn is_error(&self) -> bool {
        self.key.is_empty()
            || !self.key.bytes().all(|b| b.is_ascii_alphanumeric())
            || self.line.contains('\0')
    }
}

/// Parses the arguments of MAIL and RCPT. `None` when the path is
/// missing or malformed.
fn parse_path(line: &str, rule: Rule) -> Option<(String, Vec<EsmtpParameter>)> {
    let command = PathParser::parse(rule, line).ok()?.next()?;

    let mut address = None;
    let mut params = vec![];
    for pair in command.into_inner() {
        match pair.as_rule() {
            Rule::mailbox | Rule::bare_mailbox => address = Some(pair.as_str().to_string()),
            Rule::parameter => {
                let mut iter = pair.into_inner();
                let Some(name) = iter.next() else {
                    continue;
                };
                params.push(EsmtpParameter {
                    name: name.as_str().to_ascii_lowercase(),
                    value: iter.next().map(|value| value.as_str().to_string()),
                });
            }
            _ => {}
        }
    }

    Some((address?, params))
}

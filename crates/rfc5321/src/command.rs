use crate::{ClientTimeouts, EsmtpParameter};
use std::time::Duration;

/// A command as sent by the client half of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ehlo(String),
    Helo(String),
    Lhlo(String),
    MailFrom {
        address: String,
        parameters: Vec<EsmtpParameter>,
    },
    RcptTo {
        address: String,
        parameters: Vec<EsmtpParameter>,
    },
    Data,
    DataDot,
    Bdat {
        size: u64,
        last: bool,
    },
    Rset,
    Quit,
    StartTls,
    Auth {
        sasl_mech: String,
        initial_response: Option<String>,
    },
    /// A line sent in reply to a 334 SASL challenge
    AuthResponse(String),
}

fn join_params(parameters: &[EsmtpParameter]) -> String {
    let mut params = String::new();
    for p in parameters {
        params.push(' ');
        params.push_str(&p.to_string());
    }
    params
}

impl Command {
    pub fn encode(&self) -> String {
        match self {
            Self::Ehlo(domain) => format!("EHLO {domain}\r\n"),
            Self::Helo(domain) => format!("HELO {domain}\r\n"),
            Self::Lhlo(domain) => format!("LHLO {domain}\r\n"),
            Self::MailFrom {
                address,
                parameters,
            } => format!("MAIL FROM:<{address}>{}\r\n", join_params(parameters)),
            Self::RcptTo {
                address,
                parameters,
            } => format!("RCPT TO:<{address}>{}\r\n", join_params(parameters)),
            Self::Data => "DATA\r\n".to_string(),
            Self::DataDot => ".\r\n".to_string(),
            Self::Bdat { size, last: true } => format!("BDAT {size} LAST\r\n"),
            Self::Bdat { size, last: false } => format!("BDAT {size}\r\n"),
            Self::Rset => "RSET\r\n".to_string(),
            Self::Quit => "QUIT\r\n".to_string(),
            Self::StartTls => "STARTTLS\r\n".to_string(),
            Self::Auth {
                sasl_mech,
                initial_response: None,
            } => format!("AUTH {sasl_mech}\r\n"),
            Self::Auth {
                sasl_mech,
                initial_response: Some(resp),
            } => format!("AUTH {sasl_mech} {resp}\r\n"),
            Self::AuthResponse(resp) => format!("{resp}\r\n"),
        }
    }

    /// The encoded command with any credentials masked, for logging
    pub fn redacted(&self) -> String {
        match self {
            Self::Auth {
                sasl_mech,
                initial_response: Some(_),
            } => format!("AUTH {sasl_mech} <redacted>\r\n"),
            Self::AuthResponse(_) => "<redacted>\r\n".to_string(),
            _ => self.encode(),
        }
    }

    /// Timeouts for reading the response
    pub fn client_timeout(&self, timeouts: &ClientTimeouts) -> Duration {
        match self {
            Self::Helo(_) | Self::Ehlo(_) | Self::Lhlo(_) => timeouts.ehlo_timeout,
            Self::MailFrom { .. } => timeouts.mail_from_timeout,
            Self::RcptTo { .. } => timeouts.rcpt_to_timeout,
            Self::Data => timeouts.data_timeout,
            Self::DataDot | Self::Bdat { .. } => timeouts.data_dot_timeout,
            Self::Rset => timeouts.rset_timeout,
            Self::StartTls => timeouts.starttls_timeout,
            Self::Quit => timeouts.idle_timeout,
            Self::Auth { .. } | Self::AuthResponse(_) => timeouts.auth_timeout,
        }
    }

    /// Timeouts for writing the request
    pub fn client_timeout_request(&self, timeouts: &ClientTimeouts) -> Duration {
        let one_minute = Duration::from_secs(60);
        self.client_timeout(timeouts).min(one_minute)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn encoding() {
        assert_equal!(
            Command::MailFrom {
                address: "sender@example.com".to_string(),
                parameters: vec![EsmtpParameter {
                    name: "size".to_string(),
                    value: Some("100".to_string()),
                }],
            }
            .encode(),
            "MAIL FROM:<sender@example.com> SIZE=100\r\n"
        );
        assert_equal!(
            Command::RcptTo {
                address: "rcpt@example.com".to_string(),
                parameters: vec![],
            }
            .encode(),
            "RCPT TO:<rcpt@example.com>\r\n"
        );
        assert_equal!(
            Command::Bdat {
                size: 42,
                last: true
            }
            .encode(),
            "BDAT 42 LAST\r\n"
        );
        assert_equal!(Command::Lhlo("relay".to_string()).encode(), "LHLO relay\r\n");
    }

    #[test]
    fn credentials_are_redacted() {
        let auth = Command::Auth {
            sasl_mech: "PLAIN".to_string(),
            initial_response: Some("AGFsaWNlAHNlY3JldA==".to_string()),
        };
        assert_equal!(auth.redacted(), "AUTH PLAIN <redacted>\r\n");
        assert_equal!(
            Command::AuthResponse("c2VjcmV0".to_string()).redacted(),
            "<redacted>\r\n"
        );
        assert_equal!(Command::Quit.redacted(), "QUIT\r\n");
    }

    #[test]
    fn request_timeout_is_capped() {
        let timeouts = ClientTimeouts::default();
        assert!(Command::DataDot.client_timeout(&timeouts) > Duration::from_secs(60));
        assert_equal!(
            Command::DataDot.client_timeout_request(&timeouts),
            Duration::from_secs(60)
        );
    }
}

//! One processor per command keyword.
mod auth;
mod control;
mod data;
mod ehlo;
mod mail;
mod rcpt;

pub use auth::AuthProcessor;
pub use control::{HelpProcessor, NoopProcessor, QuitProcessor, RsetProcessor, StartTlsProcessor};
pub use data::{BdatProcessor, DataProcessor};
pub use ehlo::EhloProcessor;
pub use mail::MailProcessor;
pub use rcpt::RcptProcessor;

use crate::connection::Connection;
use crate::outcome::{Outcome, Reply, SessionError};

pub(crate) fn internal_error(uid: &str) -> Reply {
    Reply::new(451, "4.3.2 Internal server error").with_uid(uid)
}

pub(crate) fn invalid_arguments() -> Reply {
    Reply::new(501, "5.5.4 Invalid arguments")
}

pub(crate) fn bad_sequence(text: &str) -> Reply {
    Reply::new(503, format!("5.5.1 {text}"))
}

/// Write a positive reply, or hand a negative one back to the loop
pub(crate) async fn respond(conn: &mut Connection, reply: Reply) -> Result<Outcome, SessionError> {
    if reply.is_positive() {
        conn.write_reply(&reply).await?;
        Ok(Outcome::Ok)
    } else {
        Ok(Outcome::Rejected(reply))
    }
}

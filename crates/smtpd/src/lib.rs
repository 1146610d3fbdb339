//! An SMTP receiver: a per-connection command state machine that
//! accepts mail into local storage, optionally relaying recipients to
//! downstream MTAs and consulting HTTP webhooks along the way.
pub mod backends;
pub mod config;
pub mod connection;
pub mod extension;
pub mod logging;
pub mod matcher;
pub mod outcome;
pub mod processors;
pub mod proxy;
pub mod scenario;
pub mod server;
pub mod session;
pub mod storage;
pub mod tls;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ServerConfig;
pub use extension::{Registry, ServerProcessor};
pub use outcome::{Outcome, Reply, SessionError};
pub use server::{ServerContext, SmtpServer};
pub use session::{Envelope, ListenerKind, Session};

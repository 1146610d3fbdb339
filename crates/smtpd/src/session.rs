use crate::outcome::Reply;
use crate::proxy::{ProxyConnection, ProxyRouteKey};
use crate::storage::StorageSink;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// The kind of listener that accepted the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    /// Plain MX listener; mail is inbound
    Smtp,
    /// Implicit TLS listener; TLS is already active when the
    /// session begins
    Secure,
    /// Message submission; mail is outbound
    Submission,
}

/// One command/response exchange, kept for audit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub command: String,
    pub payload: String,
    pub response: String,
    pub error: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TransactionLog {
    entries: Vec<Transaction>,
}

impl TransactionLog {
    pub fn push<C: Into<String>, P: Into<String>>(&mut self, command: C, payload: P, reply: &Reply) {
        self.entries.push(Transaction {
            command: command.into(),
            payload: payload.into(),
            response: reply.to_string(),
            error: !reply.is_positive(),
        });
    }

    pub fn entries(&self) -> &[Transaction] {
        &self.entries
    }

    pub fn last(&self) -> Option<&Transaction> {
        self.entries.last()
    }

    fn rcpts(&self) -> impl Iterator<Item = &Transaction> {
        self.entries.iter().filter(|t| t.command == "RCPT")
    }

    /// Recipients that were accepted
    pub fn recipients(&self) -> Vec<&str> {
        self.rcpts()
            .filter(|t| !t.error)
            .map(|t| t.payload.as_str())
            .collect()
    }

    /// Recipients that were refused
    pub fn failed_recipients(&self) -> Vec<&str> {
        self.rcpts()
            .filter(|t| t.error)
            .map(|t| t.payload.as_str())
            .collect()
    }

    pub fn rcpt_errors(&self) -> Vec<&Transaction> {
        self.rcpts().filter(|t| t.error).collect()
    }
}

/// Where the content of an envelope goes. Decided while the
/// envelope is built up by MAIL and RCPT; DATA and BDAT only read it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
    Store,
    Discard,
    Relay { route: ProxyRouteKey },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailParameters {
    pub size: Option<u64>,
    pub body: Option<String>,
    pub smtputf8: bool,
    pub ret: Option<String>,
    pub envid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub address: String,
    pub notify: Option<String>,
    pub orcpt: Option<String>,
}

#[derive(Debug)]
pub struct Envelope {
    /// Empty for the null sender
    pub sender: String,
    pub parameters: MailParameters,
    pub recipients: Vec<Recipient>,
    pub mode: DeliveryMode,
    /// Set once the content has been persisted
    pub file: Option<PathBuf>,
    pub byte_count: u64,
    /// Set when DATA or the final BDAT has been answered
    pub complete: bool,
    /// A BDAT sequence overflowed the size limit
    pub chunking_aborted: bool,
    pub log: TransactionLog,
}

impl Envelope {
    pub fn new<S: Into<String>>(sender: S, parameters: MailParameters) -> Self {
        Self {
            sender: sender.into(),
            parameters,
            recipients: vec![],
            mode: DeliveryMode::Store,
            file: None,
            byte_count: 0,
            complete: false,
            chunking_aborted: false,
            log: TransactionLog::default(),
        }
    }

    pub fn has_recipient(&self, address: &str) -> bool {
        self.recipients.iter().any(|r| r.address == address)
    }

    pub fn is_blackholed(&self) -> bool {
        self.mode == DeliveryMode::Discard
    }

    pub fn relay_route(&self) -> Option<&ProxyRouteKey> {
        match &self.mode {
            DeliveryMode::Relay { route } => Some(route),
            _ => None,
        }
    }
}

/// BDAT chunks received so far for the current envelope
pub(crate) struct PendingChunks {
    pub sink: Box<dyn StorageSink>,
    pub received: u64,
}

pub struct Session {
    pub uid: String,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub reverse_dns: Option<String>,
    pub listener: ListenerKind,
    pub ehlo: Option<String>,
    pub tls: bool,
    /// Implicit TLS listener
    pub secure_port: bool,
    pub auth: bool,
    pub username: Option<String>,
    pub direction: Direction,
    /// Set by EHLO-time blackhole matching
    pub blackholed: bool,
    pub envelopes: Vec<Envelope>,
    /// Session level exchanges: EHLO, STARTTLS, AUTH, RSET
    pub log: TransactionLog,
    pub(crate) proxies: HashMap<ProxyRouteKey, ProxyConnection>,
    pub(crate) pending_chunks: Option<PendingChunks>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Session")
            .field("uid", &self.uid)
            .field("peer", &self.peer)
            .field("ehlo", &self.ehlo)
            .field("tls", &self.tls)
            .field("auth", &self.auth)
            .field("direction", &self.direction)
            .field("envelopes", &self.envelopes.len())
            .finish()
    }
}

impl Session {
    pub fn new(peer: SocketAddr, local: SocketAddr, listener: ListenerKind) -> Self {
        let secure = listener == ListenerKind::Secure;
        Self {
            uid: uuid::Uuid::new_v4().to_string(),
            peer,
            local,
            reverse_dns: None,
            listener,
            ehlo: None,
            tls: secure,
            secure_port: secure,
            auth: false,
            username: None,
            direction: if listener == ListenerKind::Submission {
                Direction::Outbound
            } else {
                Direction::Inbound
            },
            blackholed: false,
            envelopes: vec![],
            log: TransactionLog::default(),
            proxies: HashMap::new(),
            pending_chunks: None,
        }
    }

    pub fn is_inbound(&self) -> bool {
        self.direction == Direction::Inbound
    }

    /// Reverse DNS name of the peer, or its address
    pub fn peer_name(&self) -> String {
        self.reverse_dns
            .clone()
            .unwrap_or_else(|| self.peer.ip().to_string())
    }

    /// The envelope that MAIL opened and that has not yet received
    /// its content
    pub fn current_envelope(&self) -> Option<&Envelope> {
        self.envelopes.last().filter(|e| !e.complete)
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current_envelope().map(|_| self.envelopes.len() - 1)
    }

    pub fn current_envelope_mut(&mut self) -> Option<&mut Envelope> {
        self.envelopes.last_mut().filter(|e| !e.complete)
    }

    /// Forget the in-progress envelope, if any, along with any
    /// partially received chunks
    pub fn discard_current_envelope(&mut self) {
        if self.current_envelope().is_some() {
            self.envelopes.pop();
        }
        self.pending_chunks = None;
        self.release_proxies();
    }

    /// Envelope indices are reused once an envelope is dropped, so no
    /// relay may stay bound to one
    fn release_proxies(&mut self) {
        for proxy in self.proxies.values_mut() {
            proxy.release();
        }
    }

    /// State that must be negotiated again after STARTTLS
    pub fn reset_for_tls(&mut self) {
        self.ehlo = None;
        self.auth = false;
        self.username = None;
        self.envelopes.clear();
        self.pending_chunks = None;
        self.release_proxies();
        self.tls = true;
    }
}

//! The per-connection command loop and the context shared by every
//! connection.
use crate::backends::{user_lookup_from_config, AuthBackend, AuthChain, UserLookup};
use crate::config::{ServerConfig, WebhookConfig};
use crate::connection::Connection;
use crate::extension::Registry;
use crate::matcher::{BlackholeMatcher, ProxyMatcher};
use crate::outcome::{Outcome, Reply, SessionError};
use crate::proxy::{RelayConnector, TcpRelayConnector};
use crate::scenario::Scenarios;
use crate::session::Session;
use crate::storage::{LocalDiskStorage, Storage};
use crate::tls::TlsUpgrader;
use crate::webhook::{HttpWebhook, WebhookCaller, WebhookResponse};
use rfc5321::{BoxedAsyncReadAndWrite, Verb};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Everything a connection needs besides its own state. Built once
/// and shared by all connections.
#[derive(Clone)]
pub struct ServerContext {
    pub config: ServerConfig,
    pub registry: Registry,
    pub blackhole: BlackholeMatcher,
    pub proxy: ProxyMatcher,
    pub scenarios: Scenarios,
    pub storage: Arc<dyn Storage>,
    pub webhook: Arc<dyn WebhookCaller>,
    pub auth: AuthChain,
    pub user_lookup: Option<Arc<dyn UserLookup>>,
    pub relay: Arc<dyn RelayConnector>,
    /// STARTTLS is offered only when this is set
    pub tls: Option<Arc<dyn TlsUpgrader>>,
}

impl ServerContext {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            registry: Registry::standard(),
            blackhole: BlackholeMatcher::new(&config.blackhole),
            proxy: ProxyMatcher::new(&config.proxy),
            scenarios: Scenarios::new(&config.scenarios),
            storage: Arc::new(LocalDiskStorage::new(
                config.storage.path.clone(),
                config.storage.flush,
            )),
            webhook: Arc::new(HttpWebhook::new()),
            auth: AuthChain::from_config(&config),
            user_lookup: user_lookup_from_config(&config),
            relay: Arc::new(TcpRelayConnector),
            tls: None,
            config,
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_webhook(mut self, webhook: Arc<dyn WebhookCaller>) -> Self {
        self.webhook = webhook;
        self
    }

    /// Install a SQL credential check ahead of the configured backends
    pub fn with_sql_auth(mut self, backend: Arc<dyn AuthBackend>) -> Self {
        self.auth = self.auth.with_sql(backend);
        self
    }

    pub fn with_user_lookup(mut self, lookup: Arc<dyn UserLookup>) -> Self {
        self.user_lookup.replace(lookup);
        self
    }

    pub fn with_relay(mut self, relay: Arc<dyn RelayConnector>) -> Self {
        self.relay = relay;
        self
    }

    pub fn with_tls(mut self, tls: Arc<dyn TlsUpgrader>) -> Self {
        self.tls.replace(tls);
        self
    }
}

/// What the loop does after a command line has been handled
enum Next {
    Continue,
    Close,
    StartTls,
}

/// The JSON document posted to a per-command webhook
fn webhook_payload(session: &Session, verb: &Verb) -> serde_json::Value {
    let envelope = session.envelopes.last().map(|envelope| {
        serde_json::json!({
            "sender": envelope.sender,
            "recipients": envelope
                .recipients
                .iter()
                .map(|r| r.address.as_str())
                .collect::<Vec<_>>(),
            "complete": envelope.complete,
        })
    });
    // Keep credentials out of the payload
    let line = if verb.key() == "auth" {
        format!("AUTH {}", verb.part(1).unwrap_or_default())
    } else {
        verb.line().to_string()
    };

    serde_json::json!({
        "session": {
            "uid": session.uid,
            "peer": session.peer.to_string(),
            "ehlo": session.ehlo,
            "direction": if session.is_inbound() { "inbound" } else { "outbound" },
            "tls": session.tls,
            "auth": session.auth,
        },
        "envelope": envelope,
        "verb": {
            "command": verb.key(),
            "line": line,
        },
    })
}

/// A reply that takes the place of running the command, if the
/// webhook asked for one or failed
fn webhook_reply(hook: &WebhookConfig, response: &WebhookResponse, uid: &str) -> Option<Reply> {
    if let Some(text) = response.smtp_response() {
        match Reply::parse(&text) {
            Some(reply) => return Some(reply),
            None => warn!("webhook {} returned malformed smtpResponse {text:?}", hook.url),
        }
    }
    if !response.success && !hook.ignore_errors {
        error!(
            "session {uid}: webhook {} failed with status {}",
            hook.url, response.status
        );
        return Some(crate::processors::internal_error(uid));
    }
    None
}

/// Read and dispatch one command line
async fn step(
    conn: &mut Connection,
    session: &mut Session,
    ctx: &ServerContext,
    errors_left: &mut usize,
) -> Result<Next, SessionError> {
    let Some(line) = conn.read_line().await? else {
        debug!("client closed the connection");
        return Ok(Next::Close);
    };

    let verb = Verb::parse(&line);
    if verb.is_error() {
        conn.write_reply(&Reply::new(500, "Syntax error")).await?;
        *errors_left = errors_left.saturating_sub(1);
        return Ok(if *errors_left == 0 {
            Next::Close
        } else {
            Next::Continue
        });
    }

    let Some(processor) = ctx.registry.get(verb.key()) else {
        *errors_left = errors_left.saturating_sub(1);
        if *errors_left == 0 {
            info!("session {} exhausted its error budget", session.uid);
            return Ok(Next::Close);
        }
        conn.write_reply(&Reply::new(500, "5.3.3 Unrecognized command"))
            .await?;
        return Ok(Next::Continue);
    };

    if let Some(hook) = ctx
        .config
        .webhooks
        .get(verb.key())
        .filter(|hook| hook.enabled)
    {
        let payload = webhook_payload(session, &verb);
        let response = ctx.webhook.call(hook, &payload).await;
        if let Some(reply) = webhook_reply(hook, &response, &session.uid) {
            conn.write_reply(&reply).await?;
            return Ok(Next::Continue);
        }
    }

    match processor.process(conn, session, ctx, &verb).await? {
        Outcome::Ok => Ok(Next::Continue),
        Outcome::Rejected(reply) => {
            conn.write_reply(&reply).await?;
            Ok(Next::Continue)
        }
        Outcome::Quit => Ok(Next::Close),
        Outcome::StartTls => Ok(Next::StartTls),
    }
}

/// Best effort notice to the client before a transport failure
/// closes the connection
fn farewell(err: &SessionError, hostname: &str) -> Option<Reply> {
    match err {
        SessionError::Timeout { .. } => Some(Reply::new(
            421,
            format!("4.4.2 {hostname} Connection timed out"),
        )),
        SessionError::LineTooLong => Some(Reply::new(500, "5.5.2 Line too long")),
        SessionError::Io(_) | SessionError::Disconnected => None,
    }
}

#[instrument(skip_all, fields(uid = %session.uid, peer = %session.peer))]
async fn serve(mut conn: Connection, session: &mut Session, ctx: &ServerContext) {
    let greeting = Reply::new(
        220,
        format!(
            "{} ready at {} with ESMTP; {}",
            ctx.config.hostname,
            session.peer_name(),
            chrono::Local::now().to_rfc2822()
        ),
    );
    if let Err(err) = conn.write_reply(&greeting).await {
        debug!("failed to send greeting: {err:#}");
        return;
    }

    let mut errors_left = ctx.config.limits.error_limit;
    for _ in 0..ctx.config.limits.transactions_limit {
        match step(&mut conn, session, ctx, &mut errors_left).await {
            Ok(Next::Continue) => {}
            Ok(Next::Close) => return,
            Ok(Next::StartTls) => {
                let Some(tls) = ctx.tls.clone() else {
                    return;
                };
                match tls.upgrade(conn.into_stream()).await {
                    Ok(stream) => {
                        conn = Connection::new(stream, &ctx.config.timeouts);
                        session.reset_for_tls();
                        debug!("TLS established");
                    }
                    Err(err) => {
                        warn!("TLS handshake failed: {err:#}");
                        return;
                    }
                }
            }
            Err(err) => {
                error!("Error in SmtpServer: {err:#}");
                if let Some(reply) = farewell(&err, &ctx.config.hostname) {
                    conn.write_reply(&reply).await.ok();
                }
                return;
            }
        }
    }
    info!(
        "session {} reached the limit of {} commands",
        session.uid, ctx.config.limits.transactions_limit
    );
}

/// Drives one accepted connection from greeting to close
pub struct SmtpServer {
    stream: BoxedAsyncReadAndWrite,
    session: Session,
    ctx: Arc<ServerContext>,
}

impl SmtpServer {
    pub fn new(stream: BoxedAsyncReadAndWrite, session: Session, ctx: Arc<ServerContext>) -> Self {
        Self {
            stream,
            session,
            ctx,
        }
    }

    /// Run the session to completion, returning its final state
    pub async fn run(self) -> Session {
        let Self {
            stream,
            mut session,
            ctx,
        } = self;

        let conn = Connection::new(stream, &ctx.config.timeouts);
        serve(conn, &mut session, &ctx).await;

        // Dropping the sink removes any partially received chunks
        session.pending_chunks = None;
        let proxies = std::mem::take(&mut session.proxies);
        for proxy in proxies.into_values() {
            proxy.close().await;
        }

        info!(
            "session {} closed after {} envelopes",
            session.uid,
            session.envelopes.len()
        );
        session
    }
}

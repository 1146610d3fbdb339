//! Test doubles for the collaborators, a scripted downstream MTA, and
//! a harness that runs sessions over in-memory pipes.
use crate::backends::{AuthBackend, AuthRequest, UserLookup};
use crate::config::{ProxyRule, ServerConfig, WebhookConfig};
use crate::proxy::RelayConnector;
use crate::server::{ServerContext, SmtpServer};
use crate::session::{ListenerKind, Session};
use crate::storage::{Storage, StorageSink};
use crate::tls::TlsUpgrader;
use crate::webhook::{WebhookCaller, WebhookResponse};
use async_trait::async_trait;
use parking_lot::Mutex;
use rfc5321::{BoxedAsyncReadAndWrite, ClientError, ClientTimeouts, SmtpClient};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf,
};
use tokio::task::JoinHandle;

/// Keeps everything written to it in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    data: Vec<u8>,
}

impl MemorySink {
    pub fn data(&self) -> Vec<u8> {
        self.data.clone()
    }
}

#[async_trait]
impl StorageSink for MemorySink {
    async fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    async fn save(self: Box<Self>) -> anyhow::Result<Option<PathBuf>> {
        Ok(None)
    }

    fn byte_count(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Accepts content but fails to save it
struct FullDisk;

struct FullDiskSink(u64);

#[async_trait]
impl StorageSink for FullDiskSink {
    async fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.0 += data.len() as u64;
        Ok(())
    }

    async fn save(self: Box<Self>) -> anyhow::Result<Option<PathBuf>> {
        anyhow::bail!("No space left on device")
    }

    fn byte_count(&self) -> u64 {
        self.0
    }
}

#[async_trait]
impl Storage for FullDisk {
    async fn create(&self, _uid: &str, _sequence: usize) -> anyhow::Result<Box<dyn StorageSink>> {
        Ok(Box::new(FullDiskSink(0)))
    }
}

struct Unreachable;

#[async_trait]
impl AuthBackend for Unreachable {
    async fn authenticate(&self, _request: &AuthRequest) -> anyhow::Result<bool> {
        anyhow::bail!("connection refused")
    }
}

#[async_trait]
impl UserLookup for Unreachable {
    async fn exists(&self, _address: &str, _service: &str) -> anyhow::Result<bool> {
        anyhow::bail!("connection refused")
    }
}

/// Hands the stream back untouched, standing in for a handshake
struct PassthroughTls;

#[async_trait]
impl TlsUpgrader for PassthroughTls {
    async fn upgrade(
        &self,
        stream: BoxedAsyncReadAndWrite,
    ) -> std::io::Result<BoxedAsyncReadAndWrite> {
        Ok(stream)
    }
}

#[derive(Default)]
struct WebhookState {
    response: Option<(u16, String)>,
    calls: Vec<serde_json::Value>,
    raw_calls: usize,
}

/// Records calls and answers with whatever `respond_with` last set;
/// 200 with an empty body until then
#[derive(Default)]
pub struct MockWebhook {
    state: Mutex<WebhookState>,
}

impl MockWebhook {
    pub fn respond_with(&self, status: u16, body: &str) {
        self.state.lock().response = Some((status, body.to_string()));
    }

    pub fn calls(&self) -> Vec<serde_json::Value> {
        self.state.lock().calls.clone()
    }

    pub fn raw_calls(&self) -> usize {
        self.state.lock().raw_calls
    }

    fn response(&self) -> WebhookResponse {
        let (status, body) = self
            .state
            .lock()
            .response
            .clone()
            .unwrap_or((200, String::new()));
        WebhookResponse {
            status,
            body,
            success: (200..300).contains(&status),
        }
    }
}

#[async_trait]
impl WebhookCaller for MockWebhook {
    async fn call(&self, _config: &WebhookConfig, payload: &serde_json::Value) -> WebhookResponse {
        self.state.lock().calls.push(payload.clone());
        self.response()
    }

    async fn call_raw(&self, _config: &WebhookConfig, _file: &Path) -> WebhookResponse {
        self.state.lock().raw_calls += 1;
        self.response()
    }
}

#[derive(Default)]
struct RelayState {
    connections: usize,
    commands: Vec<String>,
    messages: Vec<Vec<u8>>,
}

/// A scripted downstream MTA. Every connection is served over its own
/// duplex pipe; RCPT refuses any address containing "reject".
#[derive(Clone, Default)]
pub struct FakeRelay {
    state: Arc<Mutex<RelayState>>,
    chunking: bool,
}

impl FakeRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise CHUNKING
    pub fn with_chunking(mut self, chunking: bool) -> Self {
        self.chunking = chunking;
        self
    }

    pub fn connections(&self) -> usize {
        self.state.lock().connections
    }

    /// Command lines received, minus AUTH continuations
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Message content received via DATA or BDAT
    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.state.lock().messages.clone()
    }

    async fn serve(self, stream: DuplexStream) -> std::io::Result<()> {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        writer.write_all(b"220 relay.test ESMTP\r\n").await?;

        let mut hello = "250-relay.test\r\n250-PIPELINING\r\n".to_string();
        if self.chunking {
            hello.push_str("250-CHUNKING\r\n");
        }
        hello.push_str("250 AUTH PLAIN LOGIN\r\n");

        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            let line = line.trim_end().to_string();
            self.state.lock().commands.push(line.clone());

            let upper = line.to_ascii_uppercase();
            let reply: String = if upper.starts_with("EHLO ") || upper.starts_with("LHLO ") {
                hello.clone()
            } else if upper.starts_with("HELO ") {
                "250 relay.test\r\n".to_string()
            } else if upper.starts_with("MAIL FROM:") {
                "250 2.1.0 OK\r\n".to_string()
            } else if upper.starts_with("RCPT TO:") {
                if upper.contains("REJECT") {
                    "550 5.1.1 No such user\r\n".to_string()
                } else {
                    "250 2.1.5 OK\r\n".to_string()
                }
            } else if upper == "DATA" {
                writer.write_all(b"354 Go ahead\r\n").await?;
                let mut message = vec![];
                loop {
                    let mut body_line = vec![];
                    if reader.read_until(b'\n', &mut body_line).await? == 0 {
                        return Ok(());
                    }
                    if body_line == b".\r\n" {
                        break;
                    }
                    let unstuffed = body_line.strip_prefix(b".").unwrap_or(&body_line);
                    message.extend_from_slice(unstuffed);
                }
                self.state.lock().messages.push(message);
                "250 2.0.0 Queued\r\n".to_string()
            } else if upper.starts_with("BDAT ") {
                let size: usize = line
                    .split_ascii_whitespace()
                    .nth(1)
                    .and_then(|size| size.parse().ok())
                    .unwrap_or(0);
                let mut message = vec![0u8; size];
                reader.read_exact(&mut message).await?;
                self.state.lock().messages.push(message);
                "250 2.0.0 Queued\r\n".to_string()
            } else if upper.starts_with("AUTH PLAIN") {
                "235 2.7.0 Authentication successful\r\n".to_string()
            } else if upper.starts_with("AUTH LOGIN") {
                for _ in 0..2 {
                    writer.write_all(b"334 \r\n").await?;
                    let mut answer = String::new();
                    reader.read_line(&mut answer).await?;
                }
                "235 2.7.0 Authentication successful\r\n".to_string()
            } else if upper == "RSET" {
                "250 2.0.0 OK\r\n".to_string()
            } else if upper == "QUIT" {
                writer.write_all(b"221 2.0.0 Bye\r\n").await?;
                return Ok(());
            } else {
                "500 5.5.1 Unrecognized command\r\n".to_string()
            };
            writer.write_all(reply.as_bytes()).await?;
        }
    }
}

#[async_trait]
impl RelayConnector for FakeRelay {
    async fn connect(
        &self,
        rule: &ProxyRule,
        timeouts: &ClientTimeouts,
    ) -> Result<SmtpClient, ClientError> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.state.lock().connections += 1;
        tokio::spawn(self.clone().serve(server));
        Ok(SmtpClient::with_stream(client, &rule.hosts[0], *timeouts))
    }
}

/// A server context wired to test doubles, with storage in a
/// temporary directory
pub struct TestHarness {
    dir: TempDir,
    ctx: ServerContext,
    relay: FakeRelay,
    webhook: Arc<MockWebhook>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(serde_json::json!({}))
    }

    /// Build from a JSON configuration document. The hostname
    /// defaults to `mx.test` and storage always goes to a fresh
    /// temporary directory.
    pub fn with_config(mut config: serde_json::Value) -> Self {
        let dir = tempfile::tempdir().unwrap();
        if config.get("hostname").is_none() {
            config["hostname"] = "mx.test".into();
        }
        config["storage"] = serde_json::json!({"path": dir.path()});
        let config: ServerConfig = serde_json::from_value(config).unwrap();

        let relay = FakeRelay::new();
        let webhook = Arc::new(MockWebhook::default());
        let ctx = ServerContext::new(config)
            .with_relay(Arc::new(relay.clone()))
            .with_webhook(webhook.clone());

        Self {
            dir,
            ctx,
            relay,
            webhook,
        }
    }

    /// Offer STARTTLS, completing it without a real handshake
    pub fn with_tls(mut self) -> Self {
        self.ctx = self.ctx.with_tls(Arc::new(PassthroughTls));
        self
    }

    pub fn with_failing_auth(mut self) -> Self {
        self.ctx = self.ctx.with_sql_auth(Arc::new(Unreachable));
        self
    }

    pub fn with_failing_lookup(mut self) -> Self {
        self.ctx = self.ctx.with_user_lookup(Arc::new(Unreachable));
        self
    }

    /// Every save fails
    pub fn with_failing_storage(mut self) -> Self {
        self.ctx = self.ctx.with_storage(Arc::new(FullDisk));
        self
    }

    pub fn relay(&self) -> FakeRelay {
        self.relay.clone()
    }

    pub fn webhook(&self) -> &MockWebhook {
        &self.webhook
    }

    /// Messages that have been saved
    pub fn stored_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(self.dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "eml"))
            .collect();
        files.sort();
        files
    }

    /// Start a session on a listener of the given kind and read its
    /// greeting
    pub async fn connect(&self, kind: ListenerKind) -> TestClient {
        let port = match kind {
            ListenerKind::Smtp => 25,
            ListenerKind::Secure => 465,
            ListenerKind::Submission => 587,
        };
        let session = Session::new(
            SocketAddr::from(([127, 0, 0, 1], 40000)),
            SocketAddr::from(([127, 0, 0, 1], port)),
            kind,
        );
        let uid = session.uid.clone();

        let (client, server) = tokio::io::duplex(256 * 1024);
        let server = SmtpServer::new(Box::new(server), session, Arc::new(self.ctx.clone()));
        let handle = tokio::spawn(server.run());

        let (reader, writer) = tokio::io::split(client);
        let mut client = TestClient {
            reader: BufReader::new(reader),
            writer,
            uid,
            greeting: String::new(),
            server: handle,
        };
        client.greeting = client.read_reply().await;
        client
    }
}

/// The client end of a session started by `TestHarness::connect`
pub struct TestClient {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    uid: String,
    greeting: String,
    server: JoinHandle<Session>,
}

impl TestClient {
    pub fn uid(&self) -> String {
        self.uid.clone()
    }

    pub fn greeting(&self) -> &str {
        &self.greeting
    }

    /// Write raw bytes
    pub async fn send(&mut self, data: &str) {
        self.writer.write_all(data.as_bytes()).await.unwrap();
    }

    /// Read one complete reply, its lines joined with `\n`. Returns
    /// an empty string if the server has closed the connection.
    pub async fn read_reply(&mut self) -> String {
        let mut lines = vec![];
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                break;
            }
            let line = line.trim_end().to_string();
            let last = line.as_bytes().get(3) != Some(&b'-');
            lines.push(line);
            if last {
                break;
            }
        }
        lines.join("\n")
    }

    pub async fn command(&mut self, line: &str) -> String {
        self.send(&format!("{line}\r\n")).await;
        self.read_reply().await
    }

    /// Send a message body after DATA has been accepted
    pub async fn message(&mut self, body: &str) -> String {
        self.send(&format!("{body}\r\n.\r\n")).await;
        self.read_reply().await
    }

    pub async fn quit(mut self) -> Session {
        self.command("QUIT").await;
        self.close().await
    }

    /// Hang up and wait for the server to finish with the session
    pub async fn close(self) -> Session {
        let Self {
            reader,
            mut writer,
            server,
            ..
        } = self;
        writer.shutdown().await.ok();
        drop(writer);
        drop(reader);
        server.await.unwrap()
    }
}

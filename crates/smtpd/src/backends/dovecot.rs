//! Clients for the Dovecot auth protocol over its UNIX sockets.
//! Each request opens a fresh connection.
use super::{AuthBackend, AuthRequest, UserLookup};
use anyhow::Context;
use async_trait::async_trait;
use data_encoding::BASE64;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Send `request`, then read lines until one of `replies` followed by
/// a tab and `id` shows up. Returns the keyword that matched.
async fn exchange(
    socket: &Path,
    request: String,
    id: u32,
    replies: &[&'static str],
) -> anyhow::Result<&'static str> {
    tokio::time::timeout(EXCHANGE_TIMEOUT, send_and_wait(socket, request, id, replies))
        .await
        .with_context(|| format!("timed out waiting for {socket:?}"))?
}

async fn send_and_wait(
    socket: &Path,
    request: String,
    id: u32,
    replies: &[&'static str],
) -> anyhow::Result<&'static str> {
    let mut stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("connecting to {socket:?}"))?;
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        debug!("dovecot {socket:?} << {line}");
        let mut fields = line.split('\t');
        let keyword = fields.next().unwrap_or_default();
        let reply_id = fields.next().and_then(|id| id.parse::<u32>().ok());
        if reply_id != Some(id) {
            continue;
        }
        if let Some(matched) = replies.iter().find(|r| **r == keyword) {
            return Ok(*matched);
        }
    }
    anyhow::bail!("{socket:?} closed the connection before replying to request {id}");
}

/// Authenticates against the `auth-client` socket
#[derive(Debug)]
pub struct DovecotSasl {
    socket: PathBuf,
    next_id: AtomicU32,
}

impl DovecotSasl {
    pub fn new(socket: PathBuf) -> Self {
        Self {
            socket,
            next_id: AtomicU32::new(1),
        }
    }

    fn build_request(&self, id: u32, request: &AuthRequest) -> String {
        let resp = BASE64.encode(format!("\0{}\0{}", request.username, request.password).as_bytes());
        format!(
            "VERSION\t1\t2\nCPID\t{pid}\nAUTH\t{id}\t{mech}\tservice={service}\tlip={lip}\trip={rip}{secured}\tresp={resp}\n",
            pid = std::process::id(),
            mech = request.mechanism,
            service = request.service,
            lip = request.local_ip,
            rip = request.remote_ip,
            secured = if request.secure { "\tsecured" } else { "" },
        )
    }
}

#[async_trait]
impl AuthBackend for DovecotSasl {
    async fn authenticate(&self, request: &AuthRequest) -> anyhow::Result<bool> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let reply = exchange(
            &self.socket,
            self.build_request(id, request),
            id,
            &["OK", "FAIL"],
        )
        .await?;
        Ok(reply == "OK")
    }
}

/// Looks up users on the `auth-userdb` socket
#[derive(Debug)]
pub struct DovecotUserDb {
    socket: PathBuf,
    next_id: AtomicU32,
}

impl DovecotUserDb {
    pub fn new(socket: PathBuf) -> Self {
        Self {
            socket,
            next_id: AtomicU32::new(1),
        }
    }
}

#[async_trait]
impl UserLookup for DovecotUserDb {
    async fn exists(&self, address: &str, service: &str) -> anyhow::Result<bool> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = format!("VERSION\t1\t0\nUSER\t{id}\t{address}\tservice={service}\n");
        let reply = exchange(&self.socket, request, id, &["USER", "NOTFOUND", "FAIL"]).await?;
        Ok(reply == "USER")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;
    use tokio::net::UnixListener;

    /// Accept connections, hand each request line to `respond` and
    /// write back whatever it returns
    fn fake_dovecot<F>(listener: UnixListener, respond: F) -> tokio::task::JoinHandle<Vec<String>>
    where
        F: Fn(&str) -> Option<String> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut seen = vec![];
            while let Ok((stream, _)) = listener.accept().await {
                let (reader, mut writer) = stream.into_split();
                writer
                    .write_all(b"VERSION\t1\t2\nSPID\t1234\n")
                    .await
                    .unwrap();
                let mut lines = BufReader::new(reader).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    seen.push(line.clone());
                    if let Some(reply) = respond(&line) {
                        writer.write_all(reply.as_bytes()).await.unwrap();
                        break;
                    }
                }
                if seen.len() >= 6 {
                    break;
                }
            }
            seen
        })
    }

    fn request(password: &str) -> AuthRequest {
        AuthRequest {
            mechanism: "PLAIN".to_string(),
            username: "alice".to_string(),
            password: password.to_string(),
            secure: true,
            service: "smtp".to_string(),
            local_ip: "10.0.0.1".parse().unwrap(),
            remote_ip: "10.0.0.2".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn sasl_auth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth-client");
        let listener = UnixListener::bind(&path).unwrap();
        let good = BASE64.encode(b"\0alice\0secret");
        let server = fake_dovecot(listener, move |line| {
            let id = line.split('\t').nth(1)?.to_string();
            if !line.starts_with("AUTH\t") {
                return None;
            }
            if line.ends_with(&format!("resp={good}")) {
                Some(format!("OK\t{id}\tuser=alice\n"))
            } else {
                Some(format!("FAIL\t{id}\tuser=alice\n"))
            }
        });

        let sasl = DovecotSasl::new(path);
        assert!(sasl.authenticate(&request("secret")).await.unwrap());
        assert!(!sasl.authenticate(&request("wrong")).await.unwrap());
        drop(sasl);

        server.abort();
        let _ = server.await;
    }

    #[test]
    fn sasl_request_format() {
        let sasl = DovecotSasl::new("/dev/null".into());
        let text = sasl.build_request(7, &request("secret"));
        let lines: Vec<&str> = text.lines().collect();
        assert_equal!(lines[0], "VERSION\t1\t2");
        assert!(lines[1].starts_with("CPID\t"));
        assert_equal!(
            lines[2].to_string(),
            format!(
                "AUTH\t7\tPLAIN\tservice=smtp\tlip=10.0.0.1\trip=10.0.0.2\tsecured\tresp={}",
                BASE64.encode(b"\0alice\0secret")
            )
        );
    }

    #[tokio::test]
    async fn userdb_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth-userdb");
        let listener = UnixListener::bind(&path).unwrap();
        let server = fake_dovecot(listener, |line| {
            let mut fields = line.split('\t');
            if fields.next()? != "USER" {
                return None;
            }
            let id = fields.next()?;
            let user = fields.next()?;
            if user == "bob@example.com" {
                Some(format!("USER\t{id}\t{user}\thome=/home/bob\n"))
            } else {
                Some(format!("NOTFOUND\t{id}\n"))
            }
        });

        let userdb = DovecotUserDb::new(path);
        assert!(userdb.exists("bob@example.com", "smtp").await.unwrap());
        assert!(!userdb.exists("eve@example.com", "smtp").await.unwrap());

        server.abort();
        let _ = server.await;
    }

    #[tokio::test]
    async fn missing_socket_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let userdb = DovecotUserDb::new(dir.path().join("nope"));
        assert!(userdb.exists("bob@example.com", "smtp").await.is_err());
    }
}

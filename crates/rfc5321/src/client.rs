use crate::response::{parse_response_line, ResponseBuilder};
use crate::tls::TlsOptions;
use crate::{
    AsyncReadAndWrite, BoxedAsyncReadAndWrite, ClientTimeouts, Command, EsmtpParameter, Response,
};
use data_encoding::BASE64;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;

const MAX_LINE_LEN: usize = 4096;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("response is not UTF8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed Response: {0}")]
    MalformedResponseLine(String),
    #[error("Response line is too long")]
    ResponseTooLong,
    #[error("Not connected")]
    NotConnected,
    #[error("Command rejected {0:?}")]
    Rejected(Response),
    #[error("STARTTLS: {0} is not a valid DNS name")]
    InvalidDnsName(String),
    #[error("TLS handshake failed: {0}")]
    Tls(String),
    #[error("Timed Out connecting after {duration:?}")]
    TimeOutConnect { duration: Duration },
    #[error("Timed Out waiting {duration:?} for response to {command:?}")]
    TimeOutResponse {
        command: Option<Command>,
        duration: Duration,
    },
    #[error("Timed Out writing {duration:?} {command:?}")]
    TimeOutRequest {
        command: Command,
        duration: Duration,
    },
    #[error("Timed Out sending message payload data")]
    TimeOutData,
    #[error("MAIL FROM has not been issued for this transaction")]
    MailNotSent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmtpCapability {
    pub name: String,
    pub param: Option<String>,
}

/// Which greeting verb to open the session with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Greeting {
    Ehlo,
    Helo,
    Lhlo,
}

#[derive(Debug)]
pub struct SmtpClient {
    socket: Option<BoxedAsyncReadAndWrite>,
    hostname: String,
    capabilities: HashMap<String, EsmtpCapability>,
    read_buffer: Vec<u8>,
    timeouts: ClientTimeouts,
}

fn extract_hostname(hostname: &str) -> &str {
    // Just the hostname, without any :port
    let hostname = match hostname.rsplit_once(':') {
        Some((host, _port)) => host,
        None => hostname,
    };

    hostname
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(hostname)
}

impl SmtpClient {
    pub async fn new<A: ToSocketAddrs + ToString + Clone>(
        addr: A,
        timeouts: ClientTimeouts,
    ) -> Result<Self, ClientError> {
        let stream = timeout(timeouts.connect_timeout, TcpStream::connect(addr.clone()))
            .await
            .map_err(|_| ClientError::TimeOutConnect {
                duration: timeouts.connect_timeout,
            })??;
        // No need for Nagle with SMTP request/response
        stream.set_nodelay(true)?;
        Ok(Self::with_stream(stream, addr.to_string(), timeouts))
    }

    pub fn with_stream<S: AsyncReadAndWrite + 'static, H: AsRef<str>>(
        stream: S,
        peer_hostname: H,
        timeouts: ClientTimeouts,
    ) -> Self {
        let hostname = extract_hostname(peer_hostname.as_ref()).to_string();

        Self {
            socket: Some(Box::new(stream)),
            hostname,
            capabilities: HashMap::new(),
            read_buffer: Vec::with_capacity(1024),
            timeouts,
        }
    }

    pub fn timeouts(&self) -> &ClientTimeouts {
        &self.timeouts
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.contains_key(&name.to_ascii_uppercase())
    }

    fn socket(&mut self) -> Result<&mut BoxedAsyncReadAndWrite, ClientError> {
        self.socket.as_mut().ok_or(ClientError::NotConnected)
    }

    async fn read_line(
        &mut self,
        timeout_duration: Duration,
        cmd: Option<&Command>,
    ) -> Result<String, ClientError> {
        let mut too_long = false;
        loop {
            let mut iter = self.read_buffer.iter().enumerate();
            while let Some((i, &b)) = iter.next() {
                if b != b'\r' {
                    continue;
                }
                if let Some((_, b'\n')) = iter.next() {
                    if too_long {
                        self.read_buffer.drain(0..i + 2);
                        return Err(ClientError::ResponseTooLong);
                    }

                    let line = String::from_utf8(self.read_buffer[0..i].to_vec());
                    self.read_buffer.drain(0..i + 2);
                    return Ok(line?);
                }
            }
            if self.read_buffer.len() > MAX_LINE_LEN {
                self.read_buffer.clear();
                too_long = true;
            }

            // Didn't find a complete line, fill up the rest of the buffer
            let mut data = [0u8; MAX_LINE_LEN];
            let socket = self.socket()?;
            let size = match timeout(timeout_duration, socket.read(&mut data)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(ClientError::TimeOutResponse {
                        command: cmd.cloned(),
                        duration: timeout_duration,
                    })
                }
            };
            if size == 0 {
                self.socket.take();
                return Err(ClientError::NotConnected);
            }
            self.read_buffer.extend_from_slice(&data[0..size]);
        }
    }

    pub async fn read_response(
        &mut self,
        command: Option<&Command>,
        timeout_duration: Duration,
    ) -> Result<Response, ClientError> {
        self.socket()?.flush().await?;

        let line = self.read_line(timeout_duration, command).await?;
        tracing::trace!("recv<-{}: {line}", self.hostname);
        let parsed = parse_response_line(&line)
            .ok_or_else(|| ClientError::MalformedResponseLine(line.clone()))?;
        let mut is_final = parsed.is_final;
        let mut builder = ResponseBuilder::new(&parsed);

        let subsequent_line_timeout_duration = Duration::from_secs(60).min(timeout_duration);
        while !is_final {
            let line = self
                .read_line(subsequent_line_timeout_duration, command)
                .await?;
            tracing::trace!("recv<-{}: {line}", self.hostname);
            let parsed = parse_response_line(&line)
                .ok_or_else(|| ClientError::MalformedResponseLine(line.clone()))?;
            if !builder.add_line(&parsed) {
                return Err(ClientError::MalformedResponseLine(
                    parsed.to_original_line(),
                ));
            }
            is_final = parsed.is_final;
        }

        let response = builder.build(command.map(|cmd| cmd.redacted()));
        tracing::trace!("{}: {command:?} response: {response:?}", self.hostname);
        Ok(response)
    }

    async fn write_command(&mut self, command: &Command) -> Result<(), ClientError> {
        let line = command.encode();
        tracing::trace!("send->{}: {}", self.hostname, command.redacted().trim_end());
        let duration = command.client_timeout_request(&self.timeouts);
        let socket = self.socket()?;
        match timeout(duration, socket.write_all(line.as_bytes())).await {
            Ok(result) => result.map_err(|_| ClientError::NotConnected),
            Err(_) => Err(ClientError::TimeOutRequest {
                command: command.clone(),
                duration,
            }),
        }
    }

    pub async fn send_command(&mut self, command: &Command) -> Result<Response, ClientError> {
        self.write_command(command).await?;
        self.read_response(Some(command), command.client_timeout(&self.timeouts))
            .await
    }

    /// Issue a series of commands, and return the responses to
    /// those commands.
    ///
    /// If the server advertised the RFC 2920 PIPELINING extension,
    /// the commands are written one after the other before waiting
    /// to read any data. Otherwise each command is written and its
    /// response read before attempting to write the next command.
    ///
    /// The number of returned responses may be smaller than the
    /// number of requested commands if there is an issue with
    /// the network connection.
    pub async fn pipeline_commands(
        &mut self,
        commands: Vec<Command>,
    ) -> Vec<Result<Response, ClientError>> {
        let pipeline = self.has_capability("PIPELINING");
        let mut results: Vec<Result<Response, ClientError>> = vec![];

        for cmd in &commands {
            if let Err(err) = self.write_command(cmd).await {
                results.push(Err(err));
                return results;
            }
            if !pipeline {
                // Immediately request the response if the server
                // doesn't support pipelining
                results.push(
                    self.read_response(Some(cmd), cmd.client_timeout(&self.timeouts))
                        .await,
                );
            }
        }

        if pipeline {
            // Now read the responses effectively in a batch
            for cmd in &commands {
                results.push(
                    self.read_response(Some(cmd), cmd.client_timeout(&self.timeouts))
                        .await,
                );
            }
        }

        results
    }

    /// Read the 220 banner that opens a session
    pub async fn read_greeting(&mut self) -> Result<Response, ClientError> {
        let response = self.read_response(None, self.timeouts.ehlo_timeout).await?;
        if response.code != 220 {
            return Err(ClientError::Rejected(response));
        }
        Ok(response)
    }

    /// Introduce ourselves. For EHLO and LHLO the advertised
    /// capabilities are recorded and returned.
    pub async fn greet(
        &mut self,
        greeting: Greeting,
        name: &str,
    ) -> Result<&HashMap<String, EsmtpCapability>, ClientError> {
        let command = match greeting {
            Greeting::Ehlo => Command::Ehlo(name.to_string()),
            Greeting::Helo => Command::Helo(name.to_string()),
            Greeting::Lhlo => Command::Lhlo(name.to_string()),
        };
        let response = self.send_command(&command).await?;
        if response.code != 250 {
            return Err(ClientError::Rejected(response));
        }

        let mut capabilities = HashMap::new();

        if greeting != Greeting::Helo {
            for line in response.content.lines().skip(1) {
                let mut fields = line.splitn(2, ' ');
                if let Some(name) = fields.next() {
                    let param = fields.next().map(|s| s.to_string());
                    let cap = EsmtpCapability {
                        name: name.to_string(),
                        param,
                    };
                    capabilities.insert(name.to_ascii_uppercase(), cap);
                }
            }
        }

        self.capabilities = capabilities;
        Ok(&self.capabilities)
    }

    pub async fn auth_plain(&mut self, username: &str, password: &str) -> Result<(), ClientError> {
        // RFC 4616 says that the format is:
        // [authzid] NUL authcid NUL passwd
        let payload = format!("\x00{username}\x00{password}");
        let payload = BASE64.encode(payload.as_bytes());

        let response = self
            .send_command(&Command::Auth {
                sasl_mech: "PLAIN".to_string(),
                initial_response: Some(payload),
            })
            .await?;

        if response.code != 235 {
            return Err(ClientError::Rejected(response));
        }

        Ok(())
    }

    pub async fn auth_login(&mut self, username: &str, password: &str) -> Result<(), ClientError> {
        let response = self
            .send_command(&Command::Auth {
                sasl_mech: "LOGIN".to_string(),
                initial_response: None,
            })
            .await?;
        if response.code != 334 {
            return Err(ClientError::Rejected(response));
        }

        let response = self
            .send_command(&Command::AuthResponse(BASE64.encode(username.as_bytes())))
            .await?;
        if response.code != 334 {
            return Err(ClientError::Rejected(response));
        }

        let response = self
            .send_command(&Command::AuthResponse(BASE64.encode(password.as_bytes())))
            .await?;
        if response.code != 235 {
            return Err(ClientError::Rejected(response));
        }

        Ok(())
    }

    /// Upgrade the connection. The capabilities are forgotten and
    /// the caller is expected to greet again.
    pub async fn starttls(&mut self, options: TlsOptions) -> Result<(), ClientError> {
        let resp = self.send_command(&Command::StartTls).await?;
        if resp.code != 220 {
            return Err(ClientError::Rejected(resp));
        }

        let connector = options
            .build_tls_connector()
            .map_err(|err| ClientError::Tls(err.to_string()))?;
        let server_name = ServerName::try_from(self.hostname.clone())
            .map_err(|_| ClientError::InvalidDnsName(self.hostname.clone()))?;
        let socket = self.socket.take().ok_or(ClientError::NotConnected)?;

        let stream = connector
            .connect(server_name, socket)
            .await
            .map_err(|err| ClientError::Tls(format!("{err:#}")))?;

        self.socket.replace(Box::new(stream));
        self.read_buffer.clear();
        self.capabilities.clear();
        Ok(())
    }

    pub async fn mail_from(
        &mut self,
        address: &str,
        parameters: Vec<EsmtpParameter>,
    ) -> Result<Response, ClientError> {
        self.send_command(&Command::MailFrom {
            address: address.to_string(),
            parameters,
        })
        .await
    }

    pub async fn rcpt_to(
        &mut self,
        address: &str,
        parameters: Vec<EsmtpParameter>,
    ) -> Result<Response, ClientError> {
        self.send_command(&Command::RcptTo {
            address: address.to_string(),
            parameters,
        })
        .await
    }

    pub async fn rset(&mut self) -> Result<Response, ClientError> {
        self.send_command(&Command::Rset).await
    }

    pub async fn quit(&mut self) -> Result<Response, ClientError> {
        let response = self.send_command(&Command::Quit).await;
        self.socket.take();
        response
    }

    /// Send the message via DATA, applying dot-stuffing as the
    /// content is streamed from `reader`. The returned response is
    /// the final word on the transaction: either the refusal of the
    /// DATA command itself or the reply to the terminating dot.
    pub async fn send_data_from<R: AsyncBufRead + Unpin>(
        &mut self,
        reader: R,
    ) -> Result<Response, ClientError> {
        let response = self.send_command(&Command::Data).await?;
        if response.code != 354 {
            return Ok(response);
        }

        let duration = self.timeouts.data_timeout;
        let socket = self.socket()?;
        let size = match timeout(duration, write_dot_stuffed(reader, socket)).await {
            Ok(result) => result?,
            Err(_) => return Err(ClientError::TimeOutData),
        };
        tracing::trace!("send->{}: {size} bytes of message data", self.hostname);

        let data_dot = Command::DataDot;
        self.read_response(Some(&data_dot), data_dot.client_timeout(&self.timeouts))
            .await
    }

    /// Send the message as a single `BDAT <size> LAST` chunk
    pub async fn send_bdat_from<R: AsyncRead + Unpin>(
        &mut self,
        reader: R,
        size: u64,
    ) -> Result<Response, ClientError> {
        let command = Command::Bdat { size, last: true };
        self.write_command(&command).await?;

        let duration = self.timeouts.data_timeout;
        let socket = self.socket()?;
        let mut chunk = reader.take(size);
        let copied = match timeout(duration, tokio::io::copy(&mut chunk, socket)).await {
            Ok(result) => result?,
            Err(_) => return Err(ClientError::TimeOutData),
        };
        if copied != size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("message source yielded {copied} of {size} bytes"),
            )
            .into());
        }
        tracing::trace!("send->{}: {size} bytes of chunk data", self.hostname);

        self.read_response(Some(&command), command.client_timeout(&self.timeouts))
            .await
    }
}

/// Copy `reader` to `writer`, doubling any leading `.` on a line
/// and finishing with the `.` terminator line. Returns the number
/// of content bytes read.
pub async fn write_dot_stuffed<R, W>(mut reader: R, writer: &mut W) -> std::io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut line = Vec::with_capacity(1024);
    let mut total = 0u64;
    let mut needs_newline = false;

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            break;
        }
        total += n as u64;
        if line.first() == Some(&b'.') {
            writer.write_all(b".").await?;
        }
        writer.write_all(&line).await?;
        needs_newline = line.last() != Some(&b'\n');
    }

    let marker: &[u8] = if needs_newline { b"\r\n.\r\n" } else { b".\r\n" };
    writer.write_all(marker).await?;
    writer.flush().await?;
    Ok(total)
}

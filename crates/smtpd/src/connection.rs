//! Framing for the server side of a connection: command lines,
//! dot-terminated bodies and BDAT chunks, each read under a timeout.
use crate::config::TimeoutsConfig;
use crate::outcome::{Reply, SessionError};
use crate::storage::StorageSink;
use rfc5321::BoxedAsyncReadAndWrite;
use std::ops::{Deref, DerefMut};
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf,
};
use tracing::{trace, warn};

/// Longest permitted command line, including its CRLF
pub const MAX_LINE_LENGTH: usize = 1000;
/// Body lines longer than this are passed through in pieces
const BODY_READ_SIZE: usize = 64 * 1024;

/// What happened to a message body
#[derive(Debug)]
pub enum BodyRead {
    /// The body was read and written to the sink
    Complete { bytes: u64 },
    /// The body was read to its end but exceeded the limit; nothing
    /// past the limit was written
    TooLarge,
    /// The body was read to its end but the sink failed
    StorageFailed(anyhow::Error),
}

async fn with_timeout<T, F>(duration: Duration, fut: F) -> Result<T, SessionError>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(SessionError::Timeout { duration }),
    }
}

pub struct Connection {
    reader: BufReader<ReadHalf<BoxedAsyncReadAndWrite>>,
    writer: BufWriter<WriteHalf<BoxedAsyncReadAndWrite>>,
    read_timeout: Duration,
    command_timeout: Duration,
    extended_timeout: Duration,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Connection")
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}

/// Holds the connection in its extended timeout mode; the command
/// timeout comes back when this is dropped.
pub struct ExtendedTimeout<'a> {
    conn: &'a mut Connection,
}

impl Deref for ExtendedTimeout<'_> {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn
    }
}

impl DerefMut for ExtendedTimeout<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn
    }
}

impl Drop for ExtendedTimeout<'_> {
    fn drop(&mut self) {
        self.conn.read_timeout = self.conn.command_timeout;
    }
}

impl Connection {
    pub fn new(stream: BoxedAsyncReadAndWrite, timeouts: &TimeoutsConfig) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            read_timeout: timeouts.command,
            command_timeout: timeouts.command,
            extended_timeout: timeouts.extended,
        }
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Switch to the extended timeout until the returned guard is
    /// dropped
    pub fn extended(&mut self) -> ExtendedTimeout<'_> {
        self.read_timeout = self.extended_timeout;
        ExtendedTimeout { conn: self }
    }

    /// Reassemble the stream, eg: to hand it to a TLS acceptor.
    /// Anything the client sent ahead of the handshake is dropped.
    pub fn into_stream(self) -> BoxedAsyncReadAndWrite {
        if !self.reader.buffer().is_empty() {
            warn!(
                "discarding {} bytes pipelined ahead of the TLS handshake",
                self.reader.buffer().len()
            );
        }
        let reader = self.reader.into_inner();
        let writer = self.writer.into_inner();
        reader.unsplit(writer)
    }

    /// Read one command line, minus its line ending. Returns None
    /// when the client has closed the connection.
    pub async fn read_line(&mut self) -> Result<Option<String>, SessionError> {
        let mut line = Vec::new();
        let mut limited = (&mut self.reader).take(MAX_LINE_LENGTH as u64);
        let size = with_timeout(self.read_timeout, limited.read_until(b'\n', &mut line)).await?;

        if size == 0 {
            return Ok(None);
        }
        if size == MAX_LINE_LENGTH && line.last() != Some(&b'\n') {
            return Err(SessionError::LineTooLong);
        }

        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        let line = String::from_utf8_lossy(&line).into_owned();
        trace!("recv<-{line}");
        Ok(Some(line))
    }

    pub async fn write_reply(&mut self, reply: &Reply) -> Result<(), SessionError> {
        let text = reply.to_wire();
        trace!("send->{}", text.trim_end());
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read a dot-terminated body, removing dot-stuffing, writing at
    /// most `limit` bytes to `sink`. The body is always consumed up to
    /// its terminating dot so that the session stays in sync.
    pub async fn read_dot_body(
        &mut self,
        sink: &mut dyn StorageSink,
        limit: u64,
    ) -> Result<BodyRead, SessionError> {
        let mut line = Vec::with_capacity(1024);
        let mut at_line_start = true;
        let mut bytes = 0u64;
        let mut too_large = false;
        let mut storage_error = None;

        loop {
            line.clear();
            let mut limited = (&mut self.reader).take(BODY_READ_SIZE as u64);
            let size =
                with_timeout(self.read_timeout, limited.read_until(b'\n', &mut line)).await?;
            if size == 0 {
                return Err(SessionError::Disconnected);
            }

            let mut data = &line[..];
            if at_line_start {
                if data == b".\r\n" || data == b".\n" {
                    break;
                }
                if data.first() == Some(&b'.') {
                    data = &data[1..];
                }
            }
            at_line_start = line.last() == Some(&b'\n');

            if too_large {
                continue;
            }
            if bytes + data.len() as u64 > limit {
                too_large = true;
                continue;
            }
            bytes += data.len() as u64;
            if storage_error.is_none() {
                if let Err(err) = sink.write(data).await {
                    storage_error.replace(err);
                }
            }
        }

        Ok(match (too_large, storage_error) {
            (true, _) => BodyRead::TooLarge,
            (false, Some(err)) => BodyRead::StorageFailed(err),
            (false, None) => BodyRead::Complete { bytes },
        })
    }

    /// Read exactly `size` bytes of a BDAT chunk into `sink`
    pub async fn read_chunk(
        &mut self,
        size: u64,
        sink: &mut dyn StorageSink,
    ) -> Result<BodyRead, SessionError> {
        let mut buf = vec![0u8; BODY_READ_SIZE];
        let mut remaining = size;
        let mut storage_error = None;

        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = with_timeout(self.read_timeout, self.reader.read(&mut buf[..want])).await?;
            if n == 0 {
                return Err(SessionError::Disconnected);
            }
            remaining -= n as u64;
            if storage_error.is_none() {
                if let Err(err) = sink.write(&buf[..n]).await {
                    storage_error.replace(err);
                }
            }
        }

        Ok(match storage_error {
            Some(err) => BodyRead::StorageFailed(err),
            None => BodyRead::Complete { bytes: size },
        })
    }

    /// Consume a BDAT chunk that is not going to be kept
    pub async fn discard_chunk(&mut self, size: u64) -> Result<(), SessionError> {
        let mut limited = (&mut self.reader).take(size);
        let copied = with_timeout(
            self.read_timeout,
            tokio::io::copy(&mut limited, &mut tokio::io::sink()),
        )
        .await?;
        if copied < size {
            return Err(SessionError::Disconnected);
        }
        Ok(())
    }
}

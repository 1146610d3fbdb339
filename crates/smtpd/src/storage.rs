//! Message content sinks.
use anyhow::Context;
use async_trait::async_trait;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

/// Receives the content of one message
#[async_trait]
pub trait StorageSink: Send {
    async fn write(&mut self, data: &[u8]) -> anyhow::Result<()>;

    /// Make the content durable. Returns where it was stored, or
    /// None for sinks that keep nothing.
    async fn save(self: Box<Self>) -> anyhow::Result<Option<PathBuf>>;

    fn byte_count(&self) -> u64;
}

/// Creates a sink per message
#[async_trait]
pub trait Storage: Send + Sync {
    async fn create(&self, uid: &str, sequence: usize) -> anyhow::Result<Box<dyn StorageSink>>;
}

/// Stores each message as `<path>/<uid>-<sequence>.eml`. Content is
/// written to a temporary file under `<path>/new` and renamed into
/// place by `save`, so a partially received message never appears
/// at its final name.
pub struct LocalDiskStorage {
    path: PathBuf,
    flush: bool,
}

impl LocalDiskStorage {
    pub fn new(path: PathBuf, flush: bool) -> Self {
        Self { path, flush }
    }
}

#[async_trait]
impl Storage for LocalDiskStorage {
    async fn create(&self, uid: &str, sequence: usize) -> anyhow::Result<Box<dyn StorageSink>> {
        let new_dir = self.path.join("new");
        tokio::fs::create_dir_all(&new_dir)
            .await
            .with_context(|| format!("failed to create dir structure {new_dir:?}"))?;

        let temp = tokio::task::spawn_blocking(move || NamedTempFile::new_in(new_dir))
            .await?
            .with_context(|| format!("failed to create a temporary file to store {uid}"))?;
        let file = temp
            .reopen()
            .with_context(|| format!("failed to open temporary file for {uid}"))?;

        Ok(Box::new(LocalDiskSink {
            temp,
            file: tokio::fs::File::from_std(file),
            target: self.path.join(format!("{uid}-{sequence}.eml")),
            flush: self.flush,
            written: 0,
        }))
    }
}

struct LocalDiskSink {
    temp: NamedTempFile,
    file: tokio::fs::File,
    target: PathBuf,
    flush: bool,
    written: u64,
}

#[async_trait]
impl StorageSink for LocalDiskSink {
    async fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.file
            .write_all(data)
            .await
            .with_context(|| format!("failed to write data for {:?}", self.target))?;
        self.written += data.len() as u64;
        Ok(())
    }

    async fn save(self: Box<Self>) -> anyhow::Result<Option<PathBuf>> {
        let LocalDiskSink {
            temp,
            mut file,
            target,
            flush,
            ..
        } = *self;

        file.flush()
            .await
            .with_context(|| format!("failed to flush data for {target:?}"))?;
        if flush {
            file.sync_data()
                .await
                .with_context(|| format!("failed to sync data for {target:?}"))?;
        }
        drop(file);

        tokio::task::spawn_blocking(move || {
            temp.persist(&target)
                .with_context(|| format!("failed to move temp file to {target:?}"))?;
            Ok(Some(target))
        })
        .await?
    }

    fn byte_count(&self) -> u64 {
        self.written
    }
}

/// Counts and drops everything written to it
#[derive(Debug, Default)]
pub struct NullSink {
    written: u64,
}

#[async_trait]
impl StorageSink for NullSink {
    async fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.written += data.len() as u64;
        Ok(())
    }

    async fn save(self: Box<Self>) -> anyhow::Result<Option<PathBuf>> {
        Ok(None)
    }

    fn byte_count(&self) -> u64 {
        self.written
    }
}

use anyhow::Context;
use clap::ValueEnum;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
#[clap(rename_all = "kebab_case")]
pub enum DiagnosticFormat {
    Pretty,
    Full,
    Compact,
    Json,
}

pub struct LoggingConfig<'a> {
    /// Hourly rotated files are written here instead of stderr
    pub log_dir: Option<PathBuf>,
    pub filter_env_var: &'a str,
    pub default_filter: &'a str,
    pub diag_format: DiagnosticFormat,
}

impl Default for LoggingConfig<'_> {
    fn default() -> Self {
        Self {
            log_dir: None,
            filter_env_var: "SMTPD_LOG",
            default_filter: "smtpd=info,rfc5321=info",
            diag_format: DiagnosticFormat::Full,
        }
    }
}

impl LoggingConfig<'_> {
    fn filter(&self) -> anyhow::Result<EnvFilter> {
        let filter = std::env::var(self.filter_env_var);
        let filter = filter.as_deref().unwrap_or(self.default_filter);
        EnvFilter::try_new(filter).with_context(|| format!("parsing log filter '{filter}'"))
    }

    /// Install the global subscriber. When logging to files, the
    /// returned guard must be held until shutdown or buffered records
    /// are lost.
    pub fn init(&self) -> anyhow::Result<Option<WorkerGuard>> {
        let env_filter = self.filter()?;

        let mut guard = None;
        let log_writer = if let Some(log_dir) = &self.log_dir {
            let file_appender = tracing_appender::rolling::hourly(log_dir, "log");
            let (non_blocking, flusher) = tracing_appender::non_blocking(file_appender);
            guard.replace(flusher);
            BoxMakeWriter::new(non_blocking)
        } else {
            BoxMakeWriter::new(std::io::stderr)
        };

        let layer = fmt::layer().with_thread_names(true).with_writer(log_writer);
        let layer = match self.diag_format {
            DiagnosticFormat::Pretty => layer.pretty().boxed(),
            DiagnosticFormat::Full => layer.boxed(),
            DiagnosticFormat::Compact => layer.compact().boxed(),
            DiagnosticFormat::Json => layer.json().boxed(),
        };

        tracing_subscriber::registry()
            .with(layer.with_filter(env_filter))
            .try_init()
            .context("installing diagnostic logger")?;
        Ok(guard)
    }
}

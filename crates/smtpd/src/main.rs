use anyhow::Context;
use clap::Parser;
use rfc5321::BoxedAsyncReadAndWrite;
use smtpd::logging::{DiagnosticFormat, LoggingConfig};
use smtpd::tls::{make_server_config, RustlsUpgrader, TlsUpgrader};
use smtpd::{ListenerKind, ServerConfig, ServerContext, Session, SmtpServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// A receiving SMTP server.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Opt {
    /// JSON configuration document. Built-in defaults apply when
    /// omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides the hostname from the configuration
    #[arg(long)]
    hostname: Option<String>,

    /// Address for plain SMTP (MX) connections
    #[arg(long, default_value = "0.0.0.0:25")]
    listen: SocketAddr,

    /// Address for implicit TLS connections
    #[arg(long)]
    secure_listen: Option<SocketAddr>,

    /// Address for message submission connections
    #[arg(long)]
    submission_listen: Option<SocketAddr>,

    /// PEM encoded private key. A self-signed certificate is generated
    /// when omitted.
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// PEM encoded certificate chain to go with --tls-key
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// Directory where diagnostic log files will be placed.
    ///
    /// If omitted, diagnostics will be printed to stderr.
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    /// How diagnostic logs render. full, compact and pretty are intended
    /// for human consumption.
    ///
    /// json outputs machine readable records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();
    let _flusher = LoggingConfig {
        log_dir: opts.diag_log_dir.clone(),
        diag_format: opts.diag_format,
        ..Default::default()
    }
    .init()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(async move { run(opts).await })
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    let mut config = match &opts.config {
        Some(path) => ServerConfig::load_json(path)?,
        None => ServerConfig::default(),
    };
    if let Some(hostname) = &opts.hostname {
        config.hostname = hostname.clone();
    }

    let tls_config = make_server_config(
        &config.hostname,
        opts.tls_key.as_deref(),
        opts.tls_cert.as_deref(),
    )
    .await?;
    let tls: Arc<dyn TlsUpgrader> = Arc::new(RustlsUpgrader::new(tls_config));
    let ctx = Arc::new(ServerContext::new(config).with_tls(tls.clone()));

    let mut listeners = vec![(opts.listen, ListenerKind::Smtp)];
    if let Some(addr) = opts.secure_listen {
        listeners.push((addr, ListenerKind::Secure));
    }
    if let Some(addr) = opts.submission_listen {
        listeners.push((addr, ListenerKind::Submission));
    }

    let mut tasks = vec![];
    for (addr, kind) in listeners {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {kind:?} listener to {addr}"))?;
        info!("{kind:?} listener on {addr}");
        tasks.push(tokio::spawn(accept_loop(
            listener,
            kind,
            ctx.clone(),
            tls.clone(),
        )));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted; shutting down");
        }
        _ = wait_for_listeners(tasks) => {}
    }
    Ok(())
}

async fn wait_for_listeners(tasks: Vec<tokio::task::JoinHandle<()>>) {
    for task in tasks {
        if let Err(err) = task.await {
            error!("listener task failed: {err:#}");
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    kind: ListenerKind,
    ctx: Arc<ServerContext>,
    tls: Arc<dyn TlsUpgrader>,
) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!("accept failed: {err:#}");
                continue;
            }
        };
        let local = match socket.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                error!("failed to query local address for {peer}: {err:#}");
                continue;
            }
        };
        let ctx = ctx.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            let stream: BoxedAsyncReadAndWrite = if kind == ListenerKind::Secure {
                match tls.upgrade(Box::new(socket)).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        info!("TLS handshake with {peer} failed: {err:#}");
                        return;
                    }
                }
            } else {
                Box::new(socket)
            };
            let session = Session::new(peer, local, kind);
            SmtpServer::new(stream, session, ctx).run().await;
        });
    }
}

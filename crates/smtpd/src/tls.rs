//! Server side TLS for STARTTLS and the implicit TLS listener.
use anyhow::Context;
use async_trait::async_trait;
use rfc5321::BoxedAsyncReadAndWrite;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::crypto::aws_lc_rs;
use rustls::ServerConfig;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Performs the server half of a TLS handshake over an accepted
/// stream
#[async_trait]
pub trait TlsUpgrader: Send + Sync {
    async fn upgrade(
        &self,
        stream: BoxedAsyncReadAndWrite,
    ) -> std::io::Result<BoxedAsyncReadAndWrite>;
}

pub struct RustlsUpgrader {
    acceptor: TlsAcceptor,
}

impl RustlsUpgrader {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
        }
    }
}

#[async_trait]
impl TlsUpgrader for RustlsUpgrader {
    async fn upgrade(
        &self,
        stream: BoxedAsyncReadAndWrite,
    ) -> std::io::Result<BoxedAsyncReadAndWrite> {
        let stream = self.acceptor.accept(stream).await?;
        Ok(Box::new(stream))
    }
}

/// Load the key and certificate chain from PEM files. Without a key,
/// a self-signed certificate for `hostname` is generated.
pub async fn make_server_config(
    hostname: &str,
    private_key: Option<&Path>,
    certificate: Option<&Path>,
) -> anyhow::Result<Arc<ServerConfig>> {
    let mut certificates = vec![];
    let private_key = match private_key {
        Some(path) => {
            let data = tokio::fs::read(path)
                .await
                .with_context(|| format!("reading private key {}", path.display()))?;
            PrivateKeyDer::from_pem_slice(&data)
                .with_context(|| format!("loading private key from {}", path.display()))?
        }
        None => {
            let key = rcgen::generate_simple_self_signed(vec![hostname.to_string()])?;
            certificates.push(CertificateDer::from_slice(key.cert.der()).into_owned());
            PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.key_pair.serialize_der()))
        }
    };

    if let Some(path) = certificate {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading certificate {}", path.display()))?;
        certificates = CertificateDer::pem_slice_iter(&data)
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("loading certificates from {}", path.display()))?;
    }

    let config = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)?;

    Ok(Arc::new(config))
}

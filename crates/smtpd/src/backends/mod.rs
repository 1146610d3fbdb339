//! Credential checks and recipient lookups.
use crate::config::ServerConfig;
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;

pub mod dovecot;
pub mod static_users;

pub use dovecot::{DovecotSasl, DovecotUserDb};
pub use static_users::StaticUsers;

/// Everything a backend may want to know about an AUTH attempt
#[derive(Debug, Clone)]
pub struct AuthRequest {
    /// `PLAIN` or `LOGIN`
    pub mechanism: String,
    pub username: String,
    pub password: String,
    /// TLS is active on the connection
    pub secure: bool,
    pub service: String,
    pub local_ip: IpAddr,
    pub remote_ip: IpAddr,
}

#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Ok(false) means the credentials were refused; Err means the
    /// backend could not be asked
    async fn authenticate(&self, request: &AuthRequest) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait UserLookup: Send + Sync {
    async fn exists(&self, address: &str, service: &str) -> anyhow::Result<bool>;
}

/// The configured credential backends. Exactly one is consulted per
/// attempt: sql, then sasl, then the static list.
#[derive(Clone, Default)]
pub struct AuthChain {
    pub sql: Option<Arc<dyn AuthBackend>>,
    pub sasl: Option<Arc<dyn AuthBackend>>,
    pub users: Option<Arc<dyn AuthBackend>>,
}

impl AuthChain {
    pub fn from_config(config: &ServerConfig) -> Self {
        let sasl: Option<Arc<dyn AuthBackend>> = if config.dovecot.auth {
            Some(Arc::new(DovecotSasl::new(config.dovecot.auth_socket.clone())))
        } else {
            None
        };
        let users: Option<Arc<dyn AuthBackend>> = if config.users.list_enabled {
            Some(Arc::new(StaticUsers::new(config.users.list.clone())))
        } else {
            None
        };
        Self {
            sql: None,
            sasl,
            users,
        }
    }

    pub fn with_sql(mut self, backend: Arc<dyn AuthBackend>) -> Self {
        self.sql.replace(backend);
        self
    }

    pub fn backend(&self) -> Option<&Arc<dyn AuthBackend>> {
        self.sql
            .as_ref()
            .or(self.sasl.as_ref())
            .or(self.users.as_ref())
    }
}

/// The recipient lookup for inbound mail, if any is configured.
/// Dovecot takes precedence over the static list.
pub fn user_lookup_from_config(config: &ServerConfig) -> Option<Arc<dyn UserLookup>> {
    if config.dovecot.user_lookup {
        Some(Arc::new(DovecotUserDb::new(
            config.dovecot.userdb_socket.clone(),
        )))
    } else if config.users.list_enabled {
        Some(Arc::new(StaticUsers::new(config.users.list.clone())))
    } else {
        None
    }
}

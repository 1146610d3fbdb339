use super::{AuthBackend, AuthRequest, UserLookup};
use crate::config::UserEntry;
use async_trait::async_trait;

/// A fixed list of users, from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticUsers {
    users: Vec<UserEntry>,
}

impl StaticUsers {
    pub fn new(users: Vec<UserEntry>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl AuthBackend for StaticUsers {
    async fn authenticate(&self, request: &AuthRequest) -> anyhow::Result<bool> {
        Ok(self
            .users
            .iter()
            .any(|user| user.name == request.username && user.pass == request.password))
    }
}

#[async_trait]
impl UserLookup for StaticUsers {
    async fn exists(&self, address: &str, _service: &str) -> anyhow::Result<bool> {
        Ok(self
            .users
            .iter()
            .any(|user| user.name.eq_ignore_ascii_case(address)))
    }
}

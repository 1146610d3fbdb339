//! The table of commands the server answers to.
use crate::connection::Connection;
use crate::outcome::{Outcome, SessionError};
use crate::server::ServerContext;
use crate::session::Session;
use async_trait::async_trait;
use rfc5321::Verb;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Server side handling of one command keyword
#[async_trait]
pub trait ServerProcessor: Send + Sync {
    /// The EHLO keyword this command contributes, if any
    fn advert(&self, _session: &Session, _ctx: &ServerContext) -> Option<String> {
        None
    }

    async fn process(
        &self,
        conn: &mut Connection,
        session: &mut Session,
        ctx: &ServerContext,
        verb: &Verb,
    ) -> Result<Outcome, SessionError>;
}

/// Built once at startup and shared, read-only, by every connection
#[derive(Clone)]
pub struct Registry {
    processors: BTreeMap<&'static str, Arc<dyn ServerProcessor>>,
}

impl Registry {
    pub fn empty() -> Self {
        Self {
            processors: BTreeMap::new(),
        }
    }

    /// Every command this server implements
    pub fn standard() -> Self {
        use crate::processors::*;

        let hello: Arc<dyn ServerProcessor> = Arc::new(EhloProcessor);

        let mut registry = Self::empty();
        registry
            .register("helo", hello.clone())
            .register("ehlo", hello.clone())
            .register("lhlo", hello)
            .register("starttls", Arc::new(StartTlsProcessor))
            .register("auth", Arc::new(AuthProcessor))
            .register("mail", Arc::new(MailProcessor))
            .register("rcpt", Arc::new(RcptProcessor))
            .register("data", Arc::new(DataProcessor))
            .register("bdat", Arc::new(BdatProcessor))
            .register("rset", Arc::new(RsetProcessor))
            .register("noop", Arc::new(NoopProcessor))
            .register("help", Arc::new(HelpProcessor))
            .register("quit", Arc::new(QuitProcessor));
        registry
    }

    pub fn register(
        &mut self,
        keyword: &'static str,
        processor: Arc<dyn ServerProcessor>,
    ) -> &mut Self {
        self.processors.insert(keyword, processor);
        self
    }

    pub fn get(&self, keyword: &str) -> Option<&Arc<dyn ServerProcessor>> {
        self.processors.get(keyword)
    }

    /// True if `line` starts with a keyword we answer to
    pub fn is_extension(&self, line: &str) -> bool {
        self.get(Verb::parse(line).key()).is_some()
    }

    pub fn keywords(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.processors.keys().copied()
    }

    /// The adverts of every registered command, deduplicated
    pub fn adverts(&self, session: &Session, ctx: &ServerContext) -> BTreeSet<String> {
        self.processors
            .values()
            .filter_map(|processor| processor.advert(session, ctx))
            .filter(|advert| !advert.trim().is_empty())
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn lookup() {
        let registry = Registry::standard();
        assert!(registry.get("ehlo").is_some());
        assert!(registry.get("vrfy").is_none());
        assert!(registry.is_extension("MAIL FROM:<a@b.c>"));
        assert!(registry.is_extension("quit"));
        assert!(!registry.is_extension("AGFsaWNlAHNlY3JldA=="));
        assert!(!registry.is_extension(""));
        assert_equal!(
            registry.keywords().collect::<Vec<_>>(),
            vec![
                "auth", "bdat", "data", "ehlo", "helo", "help", "lhlo", "mail", "noop", "quit",
                "rcpt", "rset", "starttls"
            ]
        );
    }
}

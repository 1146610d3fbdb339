use crate::connection::Connection;
use crate::extension::ServerProcessor;
use crate::outcome::{Outcome, Reply, SessionError};
use crate::server::ServerContext;
use crate::session::Session;
use async_trait::async_trait;
use rfc5321::Verb;

pub struct RsetProcessor;

#[async_trait]
impl ServerProcessor for RsetProcessor {
    async fn process(
        &self,
        conn: &mut Connection,
        session: &mut Session,
        _ctx: &ServerContext,
        _verb: &Verb,
    ) -> Result<Outcome, SessionError> {
        // Relay connections stay open; they reset downstream before
        // their next MAIL.
        session.discard_current_envelope();
        let reply = Reply::new(250, "2.1.5 All clear");
        session.log.push("RSET", "", &reply);
        conn.write_reply(&reply).await?;
        Ok(Outcome::Ok)
    }
}

pub struct NoopProcessor;

#[async_trait]
impl ServerProcessor for NoopProcessor {
    async fn process(
        &self,
        conn: &mut Connection,
        _session: &mut Session,
        _ctx: &ServerContext,
        _verb: &Verb,
    ) -> Result<Outcome, SessionError> {
        conn.write_reply(&Reply::new(250, "2.0.0 OK")).await?;
        Ok(Outcome::Ok)
    }
}

pub struct QuitProcessor;

#[async_trait]
impl ServerProcessor for QuitProcessor {
    async fn process(
        &self,
        conn: &mut Connection,
        _session: &mut Session,
        _ctx: &ServerContext,
        _verb: &Verb,
    ) -> Result<Outcome, SessionError> {
        conn.write_reply(&Reply::new(221, "2.0.0 Closing connection"))
            .await?;
        Ok(Outcome::Quit)
    }
}

pub struct HelpProcessor;

#[async_trait]
impl ServerProcessor for HelpProcessor {
    async fn process(
        &self,
        conn: &mut Connection,
        _session: &mut Session,
        ctx: &ServerContext,
        _verb: &Verb,
    ) -> Result<Outcome, SessionError> {
        let keywords: Vec<String> = ctx
            .registry
            .keywords()
            .map(|keyword| keyword.to_ascii_uppercase())
            .collect();
        conn.write_reply(&Reply::new(214, keywords.join(" "))).await?;
        Ok(Outcome::Ok)
    }
}

pub struct StartTlsProcessor;

#[async_trait]
impl ServerProcessor for StartTlsProcessor {
    fn advert(&self, session: &Session, ctx: &ServerContext) -> Option<String> {
        (ctx.tls.is_some() && !session.tls).then(|| "STARTTLS".to_string())
    }

    async fn process(
        &self,
        conn: &mut Connection,
        session: &mut Session,
        ctx: &ServerContext,
        _verb: &Verb,
    ) -> Result<Outcome, SessionError> {
        if ctx.tls.is_none() {
            return Ok(Outcome::Rejected(Reply::new(
                502,
                "5.5.1 Command not implemented",
            )));
        }
        if session.tls {
            return Ok(Outcome::Rejected(Reply::new(503, "5.5.1 TLS already active")));
        }

        let reply = Reply::new(220, "Ready for handshake").with_uid(&session.uid);
        session.log.push("STARTTLS", "", &reply);
        conn.write_reply(&reply).await?;
        Ok(Outcome::StartTls)
    }
}

#[cfg(test)]
mod test {
    use crate::session::ListenerKind;
    use crate::testing::TestHarness;
    use k9::assert_equal;

    #[tokio::test]
    async fn basic_commands() {
        let harness = TestHarness::new();
        let mut client = harness.connect(ListenerKind::Smtp).await;
        assert_equal!(client.command("NOOP").await, "250 2.0.0 OK");
        assert_equal!(
            client.command("HELP").await,
            "214 AUTH BDAT DATA EHLO HELO HELP LHLO MAIL NOOP QUIT RCPT RSET STARTTLS"
        );
        assert_equal!(
            client.command("STARTTLS").await,
            "502 5.5.1 Command not implemented"
        );
        assert_equal!(client.command("RSET").await, "250 2.1.5 All clear");
        assert_equal!(client.command("QUIT").await, "221 2.0.0 Closing connection");
        let session = client.close().await;
        assert_equal!(session.log.entries()[0].command, "RSET");
    }

    #[tokio::test]
    async fn rset_discards_the_open_envelope() {
        let harness = TestHarness::new();
        let mut client = harness.connect(ListenerKind::Smtp).await;
        client.command("EHLO client.test").await;
        client.command("MAIL FROM:<a@example.com>").await;
        client.command("RCPT TO:<b@example.com>").await;
        client.command("RSET").await;
        assert_equal!(
            client.command("DATA").await,
            "503 5.5.1 Need MAIL before DATA"
        );
        let session = client.quit().await;
        assert!(session.envelopes.is_empty());
    }

    #[tokio::test]
    async fn starttls_resets_the_session() {
        let harness = TestHarness::new().with_tls();
        let mut client = harness.connect(ListenerKind::Smtp).await;
        let reply = client.command("EHLO client.test").await;
        assert!(reply.ends_with("250 STARTTLS"), "{reply}");
        client.command("MAIL FROM:<a@example.com>").await;

        let reply = client.command("STARTTLS").await;
        assert!(reply.starts_with("220 Ready for handshake ["), "{reply}");

        let reply = client.command("EHLO client.test").await;
        assert!(!reply.contains("STARTTLS"), "{reply}");
        assert_equal!(
            client.command("STARTTLS").await,
            "503 5.5.1 TLS already active"
        );
        let session = client.quit().await;
        assert!(session.tls);
        assert!(session.envelopes.is_empty());
        assert_equal!(session.ehlo.as_deref(), Some("client.test"));
    }
}

use crate::connection::Connection;
use crate::extension::ServerProcessor;
use crate::matcher::MatchInput;
use crate::outcome::{Outcome, Reply, SessionError};
use crate::processors::invalid_arguments;
use crate::server::ServerContext;
use crate::session::Session;
use async_trait::async_trait;
use rfc5321::Verb;
use tracing::info;

/// HELO, EHLO and LHLO
pub struct EhloProcessor;

#[async_trait]
impl ServerProcessor for EhloProcessor {
    async fn process(
        &self,
        conn: &mut Connection,
        session: &mut Session,
        ctx: &ServerContext,
        verb: &Verb,
    ) -> Result<Outcome, SessionError> {
        let Some(domain) = verb.part(1) else {
            return Ok(Outcome::Rejected(invalid_arguments()));
        };
        session.ehlo.replace(domain.to_string());

        let input = MatchInput {
            ip: Some(session.peer.ip()),
            ehlo: Some(domain),
            ..Default::default()
        };
        if ctx.blackhole.should_blackhole(&input) {
            info!("session {} blackholed by EHLO {domain}", session.uid);
            session.blackholed = true;
        }

        let scenario = ctx.scenarios.select(Some(domain));
        let canned = scenario.and_then(|scenario| match verb.key() {
            "ehlo" => scenario.ehlo.clone(),
            "helo" => scenario.helo.clone(),
            _ => scenario.lhlo.clone(),
        });

        let welcome = format!("Welcome [{} ({})]", session.peer_name(), session.peer.ip());
        let reply = match canned {
            Some(reply) => reply,
            None if verb.key() == "ehlo" => {
                let mut lines = vec![welcome, "PIPELINING".to_string()];
                lines.extend(
                    ctx.registry
                        .adverts(session, ctx)
                        .into_iter()
                        .filter(|advert| advert != "PIPELINING"),
                );
                Reply { code: 250, lines }
            }
            None => Reply::new(250, welcome),
        };

        session
            .log
            .push(verb.key().to_ascii_uppercase(), domain, &reply);
        conn.write_reply(&reply).await?;
        Ok(Outcome::Ok)
    }
}

#[cfg(test)]
mod test {
    use crate::session::ListenerKind;
    use crate::testing::TestHarness;
    use k9::assert_equal;

    #[tokio::test]
    async fn ehlo_adverts() {
        let harness = TestHarness::with_config(serde_json::json!({
            "auth": {"enabled": true},
            "users": {"list_enabled": true, "list": [{"name": "alice", "pass": "secret"}]}
        }));

        let mut client = harness.connect(ListenerKind::Smtp).await;
        let reply = client.command("EHLO client.test").await;
        assert_equal!(
            reply,
            "250-Welcome [127.0.0.1 (127.0.0.1)]\n\
             250-PIPELINING\n\
             250-CHUNKING\n\
             250-SIZE 10242400\n\
             250 SMTPUTF8"
        );
        let session = client.quit().await;
        assert_equal!(session.ehlo.as_deref(), Some("client.test"));
        assert_equal!(session.log.entries()[0].command, "EHLO");

        let mut client = harness.connect(ListenerKind::Submission).await;
        let reply = client.command("EHLO client.test").await;
        assert!(reply.contains("250-AUTH PLAIN LOGIN\n"), "{reply}");
        client.quit().await;

        let mut client = harness.connect(ListenerKind::Secure).await;
        let reply = client.command("EHLO client.test").await;
        assert!(reply.contains("AUTH PLAIN LOGIN"), "{reply}");
        client.quit().await;
    }

    #[tokio::test]
    async fn helo_and_lhlo_are_single_line() {
        let harness = TestHarness::new();
        let mut client = harness.connect(ListenerKind::Smtp).await;
        assert_equal!(
            client.command("HELO client.test").await,
            "250 Welcome [127.0.0.1 (127.0.0.1)]"
        );
        assert_equal!(
            client.command("LHLO client.test").await,
            "250 Welcome [127.0.0.1 (127.0.0.1)]"
        );
        assert_equal!(client.command("EHLO").await, "501 5.5.4 Invalid arguments");
        client.quit().await;
    }

    #[tokio::test]
    async fn blackhole_by_ehlo_is_invisible() {
        let harness = TestHarness::with_config(serde_json::json!({
            "blackhole": {"enabled": true, "rules": [{"ehlo": "spam\\.test"}]}
        }));
        let mut client = harness.connect(ListenerKind::Smtp).await;
        let clean = client.command("EHLO clean.test").await;
        let session = client.quit().await;
        assert!(!session.blackholed);

        let mut client = harness.connect(ListenerKind::Smtp).await;
        let spam = client.command("EHLO spam.test").await;
        let session = client.quit().await;
        assert!(session.blackholed);
        assert_equal!(clean, spam);
    }

    #[tokio::test]
    async fn scenario_reply() {
        let harness = TestHarness::with_config(serde_json::json!({
            "scenarios": {"odd.test": {"ehlo": "250 Custom hello", "helo": "550 Go away"}}
        }));
        let mut client = harness.connect(ListenerKind::Smtp).await;
        assert_equal!(client.command("EHLO odd.test").await, "250 Custom hello");
        assert_equal!(client.command("HELO odd.test").await, "550 Go away");
        client.quit().await;
    }
}

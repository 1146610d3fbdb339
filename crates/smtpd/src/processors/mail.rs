use crate::config::MailPolicy;
use crate::connection::Connection;
use crate::extension::ServerProcessor;
use crate::outcome::{Outcome, Reply, SessionError};
use crate::processors::{bad_sequence, invalid_arguments, respond};
use crate::server::ServerContext;
use crate::session::{DeliveryMode, Envelope, MailParameters, Session};
use async_trait::async_trait;
use rfc5321::Verb;
use tracing::info;

fn policy_allows(policy: MailPolicy, session: &Session) -> bool {
    let outbound = !session.is_inbound();
    match policy {
        MailPolicy::Accept => true,
        MailPolicy::RequireAuthForOutbound => !(outbound && !session.auth),
        MailPolicy::RejectAuthenticatedOutbound => !(outbound && session.auth),
    }
}

fn policy_refusal(policy: MailPolicy, uid: &str) -> Reply {
    match policy {
        MailPolicy::RejectAuthenticatedOutbound => {
            Reply::new(550, "5.7.1 Authenticated sessions may not send mail here")
        }
        _ => Reply::new(530, "5.7.57 Authentication required to relay mail"),
    }
    .with_uid(uid)
}

/// SIZE, BODY, SMTPUTF8, RET and ENVID. Anything else is ignored.
fn parse_parameters(verb: &Verb) -> Option<MailParameters> {
    let size = if verb.has_param("size") {
        Some(verb.param("size")?.parse::<u64>().ok()?)
    } else {
        None
    };
    Some(MailParameters {
        size,
        body: verb.param("body").map(str::to_ascii_uppercase),
        smtputf8: verb.has_param("smtputf8"),
        ret: verb.param("ret").map(str::to_ascii_uppercase),
        envid: verb.param("envid").map(str::to_string),
    })
}

/// MAIL FROM
pub struct MailProcessor;

#[async_trait]
impl ServerProcessor for MailProcessor {
    fn advert(&self, _session: &Session, _ctx: &ServerContext) -> Option<String> {
        Some("SMTPUTF8".to_string())
    }

    async fn process(
        &self,
        conn: &mut Connection,
        session: &mut Session,
        ctx: &ServerContext,
        verb: &Verb,
    ) -> Result<Outcome, SessionError> {
        let policy = ctx.config.auth.mail_policy;
        if !policy_allows(policy, session) {
            return Ok(Outcome::Rejected(policy_refusal(policy, &session.uid)));
        }
        if session.current_envelope().is_some() {
            return Ok(Outcome::Rejected(bad_sequence("Sender already specified")));
        }
        if session.envelopes.len() >= ctx.config.limits.envelope_limit {
            return Ok(Outcome::Rejected(
                Reply::new(452, "4.5.3 Too many envelopes").with_uid(&session.uid),
            ));
        }
        let Some(sender) = verb.address() else {
            return Ok(Outcome::Rejected(invalid_arguments()));
        };
        let Some(parameters) = parse_parameters(verb) else {
            return Ok(Outcome::Rejected(invalid_arguments()));
        };
        if parameters
            .size
            .is_some_and(|size| size > ctx.config.limits.email_size_limit)
        {
            return Ok(Outcome::Rejected(
                Reply::new(552, "5.3.4 Message size exceeds fixed limit").with_uid(&session.uid),
            ));
        }

        session.pending_chunks = None;

        let reply = ctx
            .scenarios
            .select(session.ehlo.as_deref())
            .and_then(|scenario| scenario.mail.clone())
            .unwrap_or_else(|| Reply::new(250, "2.1.0 Sender OK").with_uid(&session.uid));

        if reply.is_success() {
            let mut envelope = Envelope::new(sender, parameters);
            if session.blackholed {
                envelope.mode = DeliveryMode::Discard;
            }
            envelope.log.push("MAIL", sender, &reply);
            session.envelopes.push(envelope);
            info!("session {} MAIL FROM:<{sender}>", session.uid);
        } else {
            session.log.push("MAIL", sender, &reply);
        }
        respond(conn, reply).await
    }
}

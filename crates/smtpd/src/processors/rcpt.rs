use crate::config::{ProxyAction, ProxyRule};
use crate::connection::Connection;
use crate::extension::ServerProcessor;
use crate::matcher::MatchInput;
use crate::outcome::{Outcome, Reply, SessionError};
use crate::processors::{bad_sequence, internal_error, invalid_arguments, respond};
use crate::proxy::{ProxyConnection, ProxyRouteKey};
use crate::server::ServerContext;
use crate::session::{DeliveryMode, Recipient, Session};
use async_trait::async_trait;
use rfc5321::Verb;
use tracing::{error, info};

fn different_relay(uid: &str) -> Reply {
    Reply::new(451, "4.3.0 Recipient routed to a different relay").with_uid(uid)
}

/// The reply given to a recipient we are willing to take
fn accepted(session: &Session, ctx: &ServerContext, address: &str) -> Reply {
    ctx.scenarios
        .select(session.ehlo.as_deref())
        .and_then(|scenario| scenario.rcpt_response(address))
        .cloned()
        .unwrap_or_else(|| Reply::new(250, "2.1.5 Recipient OK").with_uid(&session.uid))
}

fn parse_recipient(verb: &Verb, address: &str) -> Recipient {
    Recipient {
        address: address.to_string(),
        notify: verb.param("notify").map(str::to_ascii_uppercase),
        orcpt: verb.param("orcpt").map(|orcpt| {
            match orcpt.get(..7) {
                Some(prefix) if prefix.eq_ignore_ascii_case("rfc822;") => &orcpt[7..],
                _ => orcpt,
            }
            .to_string()
        }),
    }
}

/// Hand the recipient to the relay that `rule` names, opening the
/// connection and issuing MAIL FROM as needed
async fn relay_recipient(
    session: &mut Session,
    ctx: &ServerContext,
    index: usize,
    rule: &ProxyRule,
    recipient: Recipient,
) -> Reply {
    let key = ProxyRouteKey::from_rule(rule);
    let conflicting = {
        let envelope = &session.envelopes[index];
        match &envelope.mode {
            DeliveryMode::Relay { route } => *route != key,
            DeliveryMode::Store => !envelope.recipients.is_empty(),
            DeliveryMode::Discard => false,
        }
    };
    if conflicting {
        return different_relay(&session.uid);
    }

    if !session.proxies.contains_key(&key) {
        match ProxyConnection::establish(
            ctx.relay.as_ref(),
            rule,
            &ctx.config.hostname,
            &ctx.config.relay_timeouts,
        )
        .await
        {
            Ok(proxy) => {
                session.proxies.insert(key.clone(), proxy);
            }
            Err(err) => {
                error!("session {}: unable to reach relay {:?}: {err:#}", session.uid, rule.hosts);
                return internal_error(&session.uid);
            }
        }
    }

    let Session {
        proxies,
        envelopes,
        uid,
        ..
    } = session;
    let Some(proxy) = proxies.get_mut(&key) else {
        return internal_error(uid);
    };
    let envelope = &mut envelopes[index];

    if !proxy.serves(index) {
        match proxy.prepare_for_envelope(index, envelope).await {
            Ok(response) if response.is_success() => {}
            Ok(response) => return Reply::from(&response).with_uid(uid),
            Err(err) => {
                error!("session {uid}: relay refused MAIL FROM: {err:#}");
                if let Some(proxy) = proxies.remove(&key) {
                    proxy.close().await;
                }
                return internal_error(uid);
            }
        }
    }

    match proxy.relay_recipient(index, &recipient).await {
        Ok(response) => {
            let reply = Reply::from(&response).with_uid(uid);
            if response.is_success() {
                envelope.recipients.push(recipient);
                envelope.mode = DeliveryMode::Relay { route: key };
            }
            reply
        }
        Err(err) => {
            error!("session {uid}: relay failed on RCPT: {err:#}");
            if let Some(proxy) = proxies.remove(&key) {
                proxy.close().await;
            }
            internal_error(uid)
        }
    }
}

/// RCPT TO
pub struct RcptProcessor;

#[async_trait]
impl ServerProcessor for RcptProcessor {
    async fn process(
        &self,
        conn: &mut Connection,
        session: &mut Session,
        ctx: &ServerContext,
        verb: &Verb,
    ) -> Result<Outcome, SessionError> {
        let Some(index) = session.current_index() else {
            return Ok(Outcome::Rejected(bad_sequence("Need MAIL before RCPT")));
        };
        let Some(address) = verb.address().filter(|address| !address.is_empty()) else {
            return Ok(Outcome::Rejected(invalid_arguments()));
        };
        let (duplicate, blackholed, rule, relay_action) = {
            let envelope = &session.envelopes[index];
            if envelope.recipients.len() >= ctx.config.limits.recipients_limit {
                return Ok(Outcome::Rejected(
                    Reply::new(452, "4.5.3 Too many recipients").with_uid(&session.uid),
                ));
            }
            let input = MatchInput {
                ip: Some(session.peer.ip()),
                ehlo: session.ehlo.as_deref(),
                mail: Some(&envelope.sender),
                rcpt: Some(address),
            };
            let blackholed = session.blackholed || ctx.blackhole.should_blackhole(&input);
            let rule = if blackholed {
                None
            } else {
                ctx.proxy.find_matching_rule(&input, session.direction)
            };
            let relay_action = envelope
                .relay_route()
                .and_then(|route| session.proxies.get(route))
                .map(|proxy| proxy.action());
            (envelope.has_recipient(address), blackholed, rule, relay_action)
        };

        if duplicate {
            let reply = accepted(session, ctx, address);
            return respond(conn, reply).await;
        }

        let recipient = parse_recipient(verb, address);

        let reply = if blackholed {
            let reply = accepted(session, ctx, address);
            let envelope = &mut session.envelopes[index];
            if reply.is_success() && envelope.recipients.is_empty() {
                envelope.mode = DeliveryMode::Discard;
            }
            info!("session {} blackholed RCPT TO:<{address}>", session.uid);
            reply
        } else if let Some(rule) = rule {
            relay_recipient(session, ctx, index, rule, recipient).await
        } else if relay_action == Some(ProxyAction::Reject) {
            Reply::new(550, "5.7.1 Recipient not permitted for relayed transaction")
                .with_uid(&session.uid)
        } else {
            let known = match (&ctx.user_lookup, session.is_inbound()) {
                (Some(lookup), true) => {
                    lookup.exists(address, &ctx.config.dovecot.service).await
                }
                _ => Ok(true),
            };
            match known {
                Ok(true) => {
                    let reply = accepted(session, ctx, address);
                    if reply.is_success() {
                        let envelope = &mut session.envelopes[index];
                        envelope.recipients.push(recipient);
                        if envelope.mode == DeliveryMode::Discard {
                            envelope.mode = DeliveryMode::Store;
                        }
                    }
                    reply
                }
                Ok(false) => Reply::new(550, "5.1.1 Unknown destination mailbox address")
                    .with_uid(&session.uid),
                Err(err) => {
                    error!("user lookup for {address} failed: {err:#}");
                    internal_error(&session.uid)
                }
            }
        };

        info!("session {} RCPT TO:<{address}>: {reply}", session.uid);
        session.envelopes[index].log.push("RCPT", address, &reply);
        respond(conn, reply).await
    }
}

//! DATA and BDAT. Both end in `finish_transfer`, which picks between
//! storing, discarding and relaying the content according to the
//! delivery mode that MAIL and RCPT settled on.
use crate::connection::{BodyRead, Connection};
use crate::extension::ServerProcessor;
use crate::outcome::{Outcome, Reply, SessionError};
use crate::processors::{bad_sequence, internal_error, invalid_arguments, respond};
use crate::server::ServerContext;
use crate::session::{DeliveryMode, PendingChunks, Session};
use crate::storage::{NullSink, StorageSink};
use async_trait::async_trait;
use rfc5321::Verb;
use std::path::Path;
use tracing::{error, info, warn};

fn too_large(uid: &str) -> Reply {
    Reply::new(552, "5.3.4 Message size exceeds fixed limit").with_uid(uid)
}

fn no_recipients(uid: &str) -> Reply {
    Reply::new(554, "5.5.1 No valid recipients").with_uid(uid)
}

/// A sink for the content of the current envelope
async fn open_sink(
    ctx: &ServerContext,
    uid: &str,
    index: usize,
    blackholed: bool,
) -> anyhow::Result<Box<dyn StorageSink>> {
    if blackholed {
        Ok(Box::<NullSink>::default())
    } else {
        ctx.storage.create(uid, index + 1).await
    }
}

/// Run the RAW webhook against the stored message. Returns a reply
/// that takes the place of the default acceptance, if any.
async fn raw_webhook(ctx: &ServerContext, uid: &str, file: &Path) -> Option<Reply> {
    let hook = ctx.config.raw_webhook.as_ref().filter(|hook| hook.enabled)?;
    let response = ctx.webhook.call_raw(hook, file).await;

    if let Some(text) = response.smtp_response() {
        match Reply::parse(&text) {
            Some(reply) => return Some(reply),
            None => warn!("RAW webhook returned malformed smtpResponse {text:?}"),
        }
    }
    if !response.success && !hook.ignore_errors {
        error!("session {uid}: RAW webhook failed with status {}", response.status);
        return Some(internal_error(uid));
    }
    None
}

/// Stream the stored content to the relay bound to envelope `index`
/// and turn its verdict into the reply for the client
async fn relay_content(
    session: &mut Session,
    index: usize,
    mode: &DeliveryMode,
    file: Option<&Path>,
) -> Reply {
    let Session { proxies, uid, .. } = session;
    let (DeliveryMode::Relay { route }, Some(file)) = (mode, file) else {
        error!("session {uid}: envelope {index} has no stored content to relay");
        return internal_error(uid);
    };
    let Some(proxy) = proxies.get_mut(route) else {
        error!("session {uid}: relay connection for envelope {index} has gone");
        return internal_error(uid);
    };
    match proxy.relay_data(index, file).await {
        Ok(response) => Reply::from(&response).with_uid(uid),
        Err(err) => {
            error!("session {uid}: relay failed on DATA: {err:#}");
            if let Some(proxy) = proxies.remove(route) {
                proxy.close().await;
            }
            internal_error(uid)
        }
    }
}

/// Conclude a transfer whose content has been read into `sink`
async fn finish_transfer(
    conn: &mut Connection,
    session: &mut Session,
    ctx: &ServerContext,
    command: &'static str,
    sink: Box<dyn StorageSink>,
    read: BodyRead,
) -> Result<Outcome, SessionError> {
    let Some(index) = session.current_index() else {
        return Ok(Outcome::Rejected(internal_error(&session.uid)));
    };

    let bytes = match read {
        BodyRead::Complete { bytes } => bytes,
        BodyRead::TooLarge => {
            let reply = too_large(&session.uid);
            session.discard_current_envelope();
            session.log.push(command, "", &reply);
            return Ok(Outcome::Rejected(reply));
        }
        BodyRead::StorageFailed(err) => {
            error!("session {}: failed to store message: {err:#}", session.uid);
            let reply = internal_error(&session.uid);
            session.discard_current_envelope();
            session.log.push(command, "", &reply);
            return Ok(Outcome::Rejected(reply));
        }
    };

    let mode = session.envelopes[index].mode.clone();
    let file = if mode == DeliveryMode::Discard {
        None
    } else {
        match sink.save().await {
            Ok(file) => file,
            Err(err) => {
                error!("session {}: failed to save message: {err:#}", session.uid);
                let reply = internal_error(&session.uid);
                session.discard_current_envelope();
                session.log.push(command, "", &reply);
                return Ok(Outcome::Rejected(reply));
            }
        }
    };

    let webhook_reply = match &file {
        Some(file) => raw_webhook(ctx, &session.uid, file).await,
        None => None,
    };

    let reply = match (webhook_reply, &mode) {
        // a positive verdict still leaves delivery to the relay
        (Some(reply), DeliveryMode::Relay { .. }) if reply.is_positive() => {
            relay_content(session, index, &mode, file.as_deref()).await
        }
        (Some(reply), _) => reply,
        (None, DeliveryMode::Relay { .. }) => {
            relay_content(session, index, &mode, file.as_deref()).await
        }
        _ => ctx
            .scenarios
            .select(session.ehlo.as_deref())
            .and_then(|scenario| scenario.data.clone())
            .unwrap_or_else(|| Reply::new(250, "2.0.0 Received OK").with_uid(&session.uid)),
    };

    if !reply.is_positive() {
        if let Some(file) = &file {
            if let Err(err) = tokio::fs::remove_file(file).await {
                warn!("session {}: unable to remove {file:?}: {err:#}", session.uid);
            }
        }
        info!(
            "session {} refused {bytes} bytes from <{}>: {reply}",
            session.uid, session.envelopes[index].sender
        );
        session.discard_current_envelope();
        session.log.push(command, bytes.to_string(), &reply);
        return Ok(Outcome::Rejected(reply));
    }

    let envelope = &mut session.envelopes[index];
    envelope.file = file;
    envelope.byte_count = bytes;
    envelope.complete = true;
    envelope.log.push(command, bytes.to_string(), &reply);
    info!(
        "session {} received {bytes} bytes from <{}> for {} recipients: {reply}",
        session.uid,
        envelope.sender,
        envelope.recipients.len()
    );

    respond(conn, reply).await
}

/// Checks shared by DATA and BDAT before any content is accepted
fn check_ready(session: &Session, command: &str) -> Result<usize, Reply> {
    let Some(index) = session.current_index() else {
        return Err(bad_sequence(&format!("Need MAIL before {command}")));
    };
    let envelope = &session.envelopes[index];
    if envelope.recipients.is_empty() && !envelope.is_blackholed() {
        return Err(no_recipients(&session.uid));
    }
    Ok(index)
}

/// DATA
pub struct DataProcessor;

#[async_trait]
impl ServerProcessor for DataProcessor {
    fn advert(&self, _session: &Session, ctx: &ServerContext) -> Option<String> {
        Some(format!("SIZE {}", ctx.config.limits.email_size_limit))
    }

    async fn process(
        &self,
        conn: &mut Connection,
        session: &mut Session,
        ctx: &ServerContext,
        _verb: &Verb,
    ) -> Result<Outcome, SessionError> {
        let index = match check_ready(session, "DATA") {
            Ok(index) => index,
            Err(reply) => return Ok(Outcome::Rejected(reply)),
        };
        if session.pending_chunks.is_some() {
            return Ok(Outcome::Rejected(bad_sequence(
                "DATA not permitted during BDAT transfer",
            )));
        }

        let blackholed = session.envelopes[index].is_blackholed();
        let mut sink = match open_sink(ctx, &session.uid, index, blackholed).await {
            Ok(sink) => sink,
            Err(err) => {
                error!("session {}: unable to open storage: {err:#}", session.uid);
                return Ok(Outcome::Rejected(internal_error(&session.uid)));
            }
        };

        conn.write_reply(&Reply::new(354, "Ready and willing"))
            .await?;
        let read = conn
            .extended()
            .read_dot_body(sink.as_mut(), ctx.config.limits.email_size_limit)
            .await?;

        finish_transfer(conn, session, ctx, "DATA", sink, read).await
    }
}

/// BDAT, as described by RFC 3030
pub struct BdatProcessor;

#[async_trait]
impl ServerProcessor for BdatProcessor {
    fn advert(&self, _session: &Session, _ctx: &ServerContext) -> Option<String> {
        Some("CHUNKING".to_string())
    }

    async fn process(
        &self,
        conn: &mut Connection,
        session: &mut Session,
        ctx: &ServerContext,
        verb: &Verb,
    ) -> Result<Outcome, SessionError> {
        let Some(size) = verb.part(1).and_then(|size| size.parse::<u64>().ok()) else {
            return Ok(Outcome::Rejected(invalid_arguments()));
        };
        let last = match verb.part(2) {
            None => false,
            Some(flag) if flag.eq_ignore_ascii_case("last") => true,
            Some(_) => return Ok(Outcome::Rejected(invalid_arguments())),
        };
        let limit = ctx.config.limits.email_size_limit;
        if size > limit {
            return Ok(Outcome::Rejected(too_large(&session.uid)));
        }

        let index = match check_ready(session, "BDAT") {
            Ok(index) => index,
            Err(reply) => {
                conn.extended().discard_chunk(size).await?;
                return Ok(Outcome::Rejected(reply));
            }
        };

        if session.envelopes[index].chunking_aborted {
            conn.extended().discard_chunk(size).await?;
            if last {
                session.discard_current_envelope();
            }
            return Ok(Outcome::Rejected(too_large(&session.uid)));
        }

        let received = session
            .pending_chunks
            .as_ref()
            .map(|pending| pending.received)
            .unwrap_or(0);
        if received + size > limit {
            conn.extended().discard_chunk(size).await?;
            session.pending_chunks = None;
            if last {
                session.discard_current_envelope();
            } else {
                session.envelopes[index].chunking_aborted = true;
            }
            return Ok(Outcome::Rejected(too_large(&session.uid)));
        }

        let mut pending = match session.pending_chunks.take() {
            Some(pending) => pending,
            None => match open_sink(
                ctx,
                &session.uid,
                index,
                session.envelopes[index].is_blackholed(),
            )
            .await
            {
                Ok(sink) => PendingChunks { sink, received: 0 },
                Err(err) => {
                    error!("session {}: unable to open storage: {err:#}", session.uid);
                    conn.extended().discard_chunk(size).await?;
                    return Ok(Outcome::Rejected(internal_error(&session.uid)));
                }
            },
        };

        let read = conn
            .extended()
            .read_chunk(size, pending.sink.as_mut())
            .await?;
        match read {
            BodyRead::Complete { bytes } => pending.received += bytes,
            read => {
                return finish_transfer(conn, session, ctx, "BDAT", pending.sink, read).await;
            }
        }

        if last {
            let read = BodyRead::Complete {
                bytes: pending.received,
            };
            return finish_transfer(conn, session, ctx, "BDAT", pending.sink, read).await;
        }

        let reply = Reply::new(250, "2.0.0 Chunk OK").with_uid(&session.uid);
        session.envelopes[index]
            .log
            .push("BDAT", size.to_string(), &reply);
        session.pending_chunks = Some(pending);
        respond(conn, reply).await
    }
}

use crate::backends::AuthRequest;
use crate::connection::Connection;
use crate::extension::ServerProcessor;
use crate::outcome::{Outcome, Reply, SessionError};
use crate::processors::{bad_sequence, internal_error, invalid_arguments, respond};
use crate::server::ServerContext;
use crate::session::{Direction, Session};
use async_trait::async_trait;
use data_encoding::BASE64;
use rfc5321::Verb;
use tracing::{error, info, warn};

const PAYLOAD_PROMPT: &str = "UGF5bG9hZDo";
const USERNAME_PROMPT: &str = "VXNlcm5hbWU6";
const PASSWORD_PROMPT: &str = "UGFzc3dvcmQ6";

fn unauthorized() -> Reply {
    Reply::new(535, "5.7.1 Unauthorized")
}

/// The result of asking the client for the next piece of a
/// credential exchange
enum Answer {
    Credentials(String, String),
    /// The client sent `*`
    Cancelled,
    /// Undecodable, malformed, or an SMTP command where a
    /// credential was expected
    Invalid,
}

/// Read one continuation line. A line that looks like an SMTP
/// command is never taken as a credential.
async fn read_answer(
    conn: &mut Connection,
    ctx: &ServerContext,
    prompt: &str,
) -> Result<Result<String, Answer>, SessionError> {
    conn.write_reply(&Reply::new(334, prompt)).await?;
    let Some(line) = conn.read_line().await? else {
        return Err(SessionError::Disconnected);
    };
    let line = line.trim();
    if line == "*" {
        return Ok(Err(Answer::Cancelled));
    }
    if ctx.registry.is_extension(line) {
        warn!("SMTP command received in place of AUTH credentials");
        return Ok(Err(Answer::Invalid));
    }
    Ok(decode(line, ctx).ok_or(Answer::Invalid))
}

fn decode(text: &str, ctx: &ServerContext) -> Option<String> {
    if text == "=" {
        return Some(String::new());
    }
    let decoded = BASE64.decode(text.as_bytes()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    if ctx.registry.is_extension(&decoded) {
        warn!("SMTP command received in place of AUTH credentials");
        return None;
    }
    Some(decoded)
}

/// `[authzid] NUL authcid NUL passwd`
fn split_plain(payload: &str) -> Answer {
    let parts: Vec<&str> = payload.split('\0').collect();
    match parts.as_slice() {
        [_authzid, user, pass] => Answer::Credentials(user.to_string(), pass.to_string()),
        _ => Answer::Invalid,
    }
}

async fn plain(
    conn: &mut Connection,
    ctx: &ServerContext,
    verb: &Verb,
) -> Result<Answer, SessionError> {
    let payload = match verb.part(2) {
        Some(initial) => match decode(initial, ctx) {
            Some(payload) => payload,
            None => return Ok(Answer::Invalid),
        },
        None => match read_answer(conn, ctx, PAYLOAD_PROMPT).await? {
            Ok(payload) => payload,
            Err(answer) => return Ok(answer),
        },
    };
    Ok(split_plain(&payload))
}

async fn login(
    conn: &mut Connection,
    ctx: &ServerContext,
    verb: &Verb,
) -> Result<Answer, SessionError> {
    let username = match verb.part(2) {
        Some(initial) => match decode(initial, ctx) {
            Some(username) => username,
            None => return Ok(Answer::Invalid),
        },
        None => match read_answer(conn, ctx, USERNAME_PROMPT).await? {
            Ok(username) => username,
            Err(answer) => return Ok(answer),
        },
    };
    let password = match read_answer(conn, ctx, PASSWORD_PROMPT).await? {
        Ok(password) => password,
        Err(answer) => return Ok(answer),
    };
    Ok(Answer::Credentials(username, password))
}

/// AUTH PLAIN and AUTH LOGIN
pub struct AuthProcessor;

#[async_trait]
impl ServerProcessor for AuthProcessor {
    fn advert(&self, session: &Session, ctx: &ServerContext) -> Option<String> {
        let permitted = !(session.is_inbound() && !session.secure_port);
        (ctx.config.auth.enabled && permitted).then(|| "AUTH PLAIN LOGIN".to_string())
    }

    async fn process(
        &self,
        conn: &mut Connection,
        session: &mut Session,
        ctx: &ServerContext,
        verb: &Verb,
    ) -> Result<Outcome, SessionError> {
        if session.is_inbound() && !session.secure_port {
            return Ok(Outcome::Rejected(Reply::new(
                538,
                "5.7.1 Authentication not supported",
            )));
        }
        if !session.tls {
            return Ok(Outcome::Rejected(Reply::new(
                538,
                "5.7.1 Connection not secured",
            )));
        }
        if session.auth {
            return Ok(Outcome::Rejected(bad_sequence("Already authenticated")));
        }
        let Some(mechanism) = verb.part(1).map(str::to_ascii_uppercase) else {
            return Ok(Outcome::Rejected(invalid_arguments()));
        };
        if mechanism != "PLAIN" && mechanism != "LOGIN" {
            return Ok(Outcome::Rejected(Reply::new(
                504,
                "5.7.4 Unrecognized authentication mechanism",
            )));
        }
        let backend = match ctx.auth.backend() {
            Some(backend) if ctx.config.auth.enabled => backend,
            _ => {
                return Ok(Outcome::Rejected(Reply::new(
                    538,
                    "5.7.1 Authentication not supported",
                )))
            }
        };

        let answer = if mechanism == "PLAIN" {
            plain(conn, ctx, verb).await?
        } else {
            login(conn, ctx, verb).await?
        };

        let (username, password) = match answer {
            Answer::Credentials(username, password) => (username, password),
            Answer::Cancelled => {
                let reply = Reply::new(501, "5.7.0 Authentication cancelled");
                session.log.push("AUTH", &mechanism, &reply);
                return Ok(Outcome::Rejected(reply));
            }
            Answer::Invalid => {
                let reply = unauthorized();
                session.log.push("AUTH", &mechanism, &reply);
                return Ok(Outcome::Rejected(reply));
            }
        };

        let request = AuthRequest {
            mechanism: mechanism.clone(),
            username,
            password,
            secure: session.tls,
            service: ctx.config.dovecot.service.clone(),
            local_ip: session.local.ip(),
            remote_ip: session.peer.ip(),
        };

        let reply = match backend.authenticate(&request).await {
            Ok(true) => {
                info!("session {} authenticated as {}", session.uid, request.username);
                session.auth = true;
                session.direction = Direction::Outbound;
                session.username.replace(request.username);
                Reply::new(235, "2.7.0 Authorized")
            }
            Ok(false) => {
                info!("session {} failed to authenticate", session.uid);
                unauthorized()
            }
            Err(err) => {
                error!("authentication backend error: {err:#}");
                internal_error(&session.uid)
            }
        };

        session.log.push("AUTH", &mechanism, &reply);
        respond(conn, reply).await
    }
}

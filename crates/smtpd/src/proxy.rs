//! Relays a transaction to a downstream server, playing the client
//! role of SMTP on behalf of the session.
use crate::config::{ProxyAction, ProxyRule, RelayAuthMechanism, RelayProtocol};
use crate::session::{Envelope, Recipient};
use async_trait::async_trait;
use rfc5321::{
    ClientError, ClientTimeouts, EsmtpParameter, Greeting, Response, SmtpClient, TlsOptions,
};
use std::path::Path;
use tokio::io::BufReader;
use tracing::{debug, error, warn};

/// Identifies a downstream relay. Envelopes within a session whose
/// recipients route to the same key share one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyRouteKey {
    pub hosts: Vec<String>,
    pub port: u16,
    pub protocol: RelayProtocol,
    pub tls: bool,
    pub auth_username: Option<String>,
}

impl ProxyRouteKey {
    pub fn from_rule(rule: &ProxyRule) -> Self {
        Self {
            hosts: rule.hosts.clone(),
            port: rule.port,
            protocol: rule.protocol,
            tls: rule.tls,
            auth_username: rule.auth_username.clone(),
        }
    }
}

/// Opens the transport to a relay
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(
        &self,
        rule: &ProxyRule,
        timeouts: &ClientTimeouts,
    ) -> Result<SmtpClient, ClientError>;
}

/// Connects over TCP, trying each of the rule's hosts in turn
#[derive(Debug, Default)]
pub struct TcpRelayConnector;

fn host_and_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[async_trait]
impl RelayConnector for TcpRelayConnector {
    async fn connect(
        &self,
        rule: &ProxyRule,
        timeouts: &ClientTimeouts,
    ) -> Result<SmtpClient, ClientError> {
        let mut last_error = ClientError::NotConnected;
        for host in &rule.hosts {
            let addr = host_and_port(host, rule.port);
            match SmtpClient::new(addr.as_str(), timeouts.clone()).await {
                Ok(client) => return Ok(client),
                Err(err) => {
                    warn!("failed to connect to relay {addr}: {err:#}");
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }
}

fn greeting_for(protocol: RelayProtocol) -> Greeting {
    match protocol {
        RelayProtocol::Esmtp => Greeting::Ehlo,
        RelayProtocol::Smtp => Greeting::Helo,
        RelayProtocol::Lmtp => Greeting::Lhlo,
    }
}

fn param(name: &str, value: Option<&str>) -> EsmtpParameter {
    EsmtpParameter {
        name: name.to_string(),
        value: value.map(str::to_string),
    }
}

/// An open, greeted and authenticated connection to a relay
#[derive(Debug)]
pub struct ProxyConnection {
    client: SmtpClient,
    key: ProxyRouteKey,
    /// Applies to recipients matching no rule once relaying
    action: ProxyAction,
    /// The session envelope that downstream MAIL FROM was issued for
    envelope: Option<usize>,
    /// A downstream transaction may be open and must be RSET before
    /// the next MAIL
    in_transaction: bool,
}

impl ProxyConnection {
    /// Connect and run through greeting, STARTTLS and AUTH as the
    /// rule asks
    pub async fn establish(
        connector: &dyn RelayConnector,
        rule: &ProxyRule,
        ehlo_name: &str,
        timeouts: &ClientTimeouts,
    ) -> Result<Self, ClientError> {
        let mut client = connector.connect(rule, timeouts).await?;
        client.read_greeting().await?;

        let greeting = greeting_for(rule.protocol);
        client.greet(greeting, ehlo_name).await?;

        if rule.tls {
            client
                .starttls(TlsOptions {
                    insecure: rule.tls_insecure,
                })
                .await?;
            client.greet(greeting, ehlo_name).await?;
        }

        if let (Some(username), Some(password)) = (&rule.auth_username, &rule.auth_password) {
            match rule.auth_mechanism {
                RelayAuthMechanism::Plain => client.auth_plain(username, password).await?,
                RelayAuthMechanism::Login => client.auth_login(username, password).await?,
            }
        }

        debug!("established relay connection to {}", client.hostname());
        Ok(Self {
            client,
            key: ProxyRouteKey::from_rule(rule),
            action: rule.action,
            envelope: None,
            in_transaction: false,
        })
    }

    pub fn key(&self) -> &ProxyRouteKey {
        &self.key
    }

    pub fn action(&self) -> ProxyAction {
        self.action
    }

    /// Stop serving the current envelope. An open downstream
    /// transaction is reset before the next MAIL.
    pub fn release(&mut self) {
        self.envelope = None;
    }

    /// True if MAIL FROM has been issued for `index`
    pub fn serves(&self, index: usize) -> bool {
        self.envelope == Some(index)
    }

    fn mail_parameters(&self, envelope: &Envelope) -> Vec<EsmtpParameter> {
        let params = &envelope.parameters;
        let mut result = vec![];
        if self.client.has_capability("SIZE") {
            if let Some(size) = params.size {
                result.push(param("size", Some(&size.to_string())));
            }
        }
        if self.client.has_capability("8BITMIME") {
            if let Some(body) = &params.body {
                result.push(param("body", Some(body)));
            }
        }
        if params.smtputf8 && self.client.has_capability("SMTPUTF8") {
            result.push(param("smtputf8", None));
        }
        if self.client.has_capability("DSN") {
            if let Some(ret) = &params.ret {
                result.push(param("ret", Some(ret)));
            }
            if let Some(envid) = &params.envid {
                result.push(param("envid", Some(envid)));
            }
        }
        result
    }

    /// Bind the connection to envelope `index` by issuing its MAIL
    /// FROM, resetting whatever transaction was left open for a
    /// previous envelope. The downstream reply is returned whatever
    /// its code.
    pub async fn prepare_for_envelope(
        &mut self,
        index: usize,
        envelope: &Envelope,
    ) -> Result<Response, ClientError> {
        if self.in_transaction {
            let response = self.client.rset().await?;
            if !response.is_success() {
                return Err(ClientError::Rejected(response));
            }
            self.in_transaction = false;
        }
        self.envelope = None;

        let parameters = self.mail_parameters(envelope);
        let response = self.client.mail_from(&envelope.sender, parameters).await?;
        if response.is_success() {
            self.envelope = Some(index);
            self.in_transaction = true;
        }
        Ok(response)
    }

    fn check_serving(&self, index: usize, what: &str) -> Result<(), ClientError> {
        if self.serves(index) {
            Ok(())
        } else {
            error!(
                "{what} for envelope {index} on relay {} before MAIL FROM (serving {:?})",
                self.client.hostname(),
                self.envelope
            );
            Err(ClientError::MailNotSent)
        }
    }

    pub async fn relay_recipient(
        &mut self,
        index: usize,
        recipient: &Recipient,
    ) -> Result<Response, ClientError> {
        self.check_serving(index, "RCPT")?;

        let mut parameters = vec![];
        if self.client.has_capability("DSN") {
            if let Some(notify) = &recipient.notify {
                parameters.push(param("notify", Some(notify)));
            }
            if let Some(orcpt) = &recipient.orcpt {
                parameters.push(param("orcpt", Some(&format!("rfc822;{orcpt}"))));
            }
        }
        self.client.rcpt_to(&recipient.address, parameters).await
    }

    /// Stream the stored message at `path`, using BDAT when the relay
    /// supports CHUNKING
    pub async fn relay_data(&mut self, index: usize, path: &Path) -> Result<Response, ClientError> {
        self.check_serving(index, "DATA")?;

        let file = tokio::fs::File::open(path).await?;
        let response = if self.client.has_capability("CHUNKING") {
            let size = file.metadata().await?.len();
            self.client.send_bdat_from(file, size).await?
        } else {
            self.client.send_data_from(BufReader::new(file)).await?
        };

        self.envelope = None;
        if response.is_success() {
            self.in_transaction = false;
        }
        Ok(response)
    }

    pub async fn close(mut self) {
        if let Err(err) = self.client.quit().await {
            debug!(
                "error while closing relay connection to {}: {err:#}",
                self.client.hostname()
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::session::MailParameters;
    use crate::testing::FakeRelay;
    use k9::assert_equal;

    fn rule() -> ProxyRule {
        serde_json::from_value(serde_json::json!({
            "rcpt": ".*@relay\\.test",
            "hosts": ["relay.test"],
        }))
        .unwrap()
    }

    fn recipient(address: &str) -> Recipient {
        Recipient {
            address: address.to_string(),
            notify: None,
            orcpt: None,
        }
    }

    #[test]
    fn addresses() {
        assert_equal!(host_and_port("mx.test", 25), "mx.test:25");
        assert_equal!(host_and_port("::1", 2525), "[::1]:2525");
        assert_equal!(host_and_port("[::1]", 25), "[::1]:25");
    }

    #[tokio::test]
    async fn envelope_binding() {
        let relay = FakeRelay::new();
        let timeouts = ClientTimeouts::short_timeouts();
        let mut conn = ProxyConnection::establish(&relay, &rule(), "mx.local", &timeouts)
            .await
            .unwrap();
        assert_equal!(conn.key().hosts, vec!["relay.test".to_string()]);

        let first = Envelope::new("sender@example.com", MailParameters::default());
        assert!(matches!(
            conn.relay_recipient(0, &recipient("bob@relay.test")).await,
            Err(ClientError::MailNotSent)
        ));

        let response = conn.prepare_for_envelope(0, &first).await.unwrap();
        assert_equal!(response.code, 250);
        assert!(conn.serves(0));
        let response = conn
            .relay_recipient(0, &recipient("bob@relay.test"))
            .await
            .unwrap();
        assert_equal!(response.code, 250);

        // abandon the first envelope; the next one must reset
        let second = Envelope::new("other@example.com", MailParameters::default());
        conn.prepare_for_envelope(1, &second).await.unwrap();
        assert!(!conn.serves(0));
        assert!(matches!(
            conn.relay_recipient(0, &recipient("bob@relay.test")).await,
            Err(ClientError::MailNotSent)
        ));

        conn.close().await;

        assert_equal!(relay.connections(), 1);
        assert_equal!(
            relay.commands(),
            vec![
                "EHLO mx.local".to_string(),
                "MAIL FROM:<sender@example.com>".to_string(),
                "RCPT TO:<bob@relay.test>".to_string(),
                "RSET".to_string(),
                "MAIL FROM:<other@example.com>".to_string(),
                "QUIT".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn data_and_chunking() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("msg.eml");
        std::fs::write(&path, "Subject: hi\r\n\r\n.dot\r\n").unwrap();
        let timeouts = ClientTimeouts::short_timeouts();
        let envelope = Envelope::new("a@example.com", MailParameters::default());

        for chunking in [false, true] {
            let relay = FakeRelay::new().with_chunking(chunking);
            let mut conn = ProxyConnection::establish(&relay, &rule(), "mx.local", &timeouts)
                .await
                .unwrap();
            conn.prepare_for_envelope(0, &envelope).await.unwrap();
            conn.relay_recipient(0, &recipient("bob@relay.test"))
                .await
                .unwrap();
            let response = conn.relay_data(0, &path).await.unwrap();
            assert_equal!(response.code, 250);
            assert!(!conn.serves(0));
            conn.close().await;

            assert_equal!(
                relay.messages(),
                vec![b"Subject: hi\r\n\r\n.dot\r\n".to_vec()]
            );
            let data_command = if chunking { "BDAT 21 LAST" } else { "DATA" };
            assert!(relay.commands().iter().any(|c| c == data_command));
        }
    }

    #[tokio::test]
    async fn lmtp_greeting_and_auth() {
        let relay = FakeRelay::new();
        let mut rule = rule();
        rule.protocol = RelayProtocol::Lmtp;
        rule.auth_username = Some("relayuser".to_string());
        rule.auth_password = Some("relaypass".to_string());
        let conn = ProxyConnection::establish(
            &relay,
            &rule,
            "mx.local",
            &ClientTimeouts::short_timeouts(),
        )
        .await
        .unwrap();
        conn.close().await;

        let commands = relay.commands();
        assert_equal!(commands[0], "LHLO mx.local");
        assert!(commands[1].starts_with("AUTH PLAIN "));
    }
}

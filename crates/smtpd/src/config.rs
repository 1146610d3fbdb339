//! Configuration types. These are plain serde structs; the engine
//! receives an already-built `ServerConfig`.
use anyhow::Context;
use rfc5321::ClientTimeouts;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "ServerConfig::default_hostname")]
    pub hostname: String,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub users: UsersConfig,
    #[serde(default)]
    pub dovecot: DovecotConfig,
    #[serde(default)]
    pub blackhole: BlackholeConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Called with the stored message after DATA/BDAT
    #[serde(default)]
    pub raw_webhook: Option<WebhookConfig>,
    /// Called before the named command is processed
    #[serde(default)]
    pub webhooks: HashMap<String, WebhookConfig>,
    /// Canned responses, keyed by EHLO domain or `*`
    #[serde(default)]
    pub scenarios: HashMap<String, ScenarioConfig>,
    #[serde(default)]
    pub relay_timeouts: ClientTimeouts,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: Self::default_hostname(),
            limits: LimitsConfig::default(),
            timeouts: TimeoutsConfig::default(),
            auth: AuthConfig::default(),
            users: UsersConfig::default(),
            dovecot: DovecotConfig::default(),
            blackhole: BlackholeConfig::default(),
            proxy: ProxyConfig::default(),
            storage: StorageConfig::default(),
            raw_webhook: None,
            webhooks: HashMap::new(),
            scenarios: HashMap::new(),
            relay_timeouts: ClientTimeouts::default(),
        }
    }
}

impl ServerConfig {
    fn default_hostname() -> String {
        gethostname::gethostname().to_string_lossy().into_owned()
    }

    pub fn load_json(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    /// Maximum number of commands read on one connection
    #[serde(default = "LimitsConfig::default_transactions_limit")]
    pub transactions_limit: usize,
    /// Number of syntax errors or unknown commands tolerated
    #[serde(default = "LimitsConfig::default_error_limit")]
    pub error_limit: usize,
    #[serde(default = "LimitsConfig::default_envelope_limit")]
    pub envelope_limit: usize,
    #[serde(default = "LimitsConfig::default_recipients_limit")]
    pub recipients_limit: usize,
    #[serde(default = "LimitsConfig::default_email_size_limit")]
    pub email_size_limit: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            transactions_limit: Self::default_transactions_limit(),
            error_limit: Self::default_error_limit(),
            envelope_limit: Self::default_envelope_limit(),
            recipients_limit: Self::default_recipients_limit(),
            email_size_limit: Self::default_email_size_limit(),
        }
    }
}

impl LimitsConfig {
    fn default_transactions_limit() -> usize {
        200
    }
    fn default_error_limit() -> usize {
        3
    }
    fn default_envelope_limit() -> usize {
        100
    }
    fn default_recipients_limit() -> usize {
        100
    }
    fn default_email_size_limit() -> u64 {
        10242400
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TimeoutsConfig {
    /// Applies while waiting for a command line
    #[serde(default = "TimeoutsConfig::default_command", with = "duration_serde")]
    pub command: Duration,
    /// Applies while receiving message content
    #[serde(default = "TimeoutsConfig::default_extended", with = "duration_serde")]
    pub extended: Duration,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            command: Self::default_command(),
            extended: Self::default_extended(),
        }
    }
}

impl TimeoutsConfig {
    fn default_command() -> Duration {
        Duration::from_secs(60)
    }
    fn default_extended() -> Duration {
        Duration::from_secs(120)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mail_policy: MailPolicy,
}

/// How MAIL treats the authentication state of the session
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MailPolicy {
    #[default]
    Accept,
    /// Outbound sessions must have authenticated
    RequireAuthForOutbound,
    /// Refuse MAIL on sessions that have authenticated for relay
    RejectAuthenticatedOutbound,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct UsersConfig {
    #[serde(default)]
    pub list_enabled: bool,
    #[serde(default)]
    pub list: Vec<UserEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct UserEntry {
    pub name: String,
    pub pass: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct DovecotConfig {
    /// Authenticate AUTH credentials over the SASL client socket
    #[serde(default)]
    pub auth: bool,
    #[serde(default = "DovecotConfig::default_auth_socket")]
    pub auth_socket: PathBuf,
    /// Validate inbound recipients over the userdb socket
    #[serde(default)]
    pub user_lookup: bool,
    #[serde(default = "DovecotConfig::default_userdb_socket")]
    pub userdb_socket: PathBuf,
    #[serde(default = "DovecotConfig::default_service")]
    pub service: String,
}

impl Default for DovecotConfig {
    fn default() -> Self {
        Self {
            auth: false,
            auth_socket: Self::default_auth_socket(),
            user_lookup: false,
            userdb_socket: Self::default_userdb_socket(),
            service: Self::default_service(),
        }
    }
}

impl DovecotConfig {
    fn default_auth_socket() -> PathBuf {
        "/run/dovecot/auth-client".into()
    }
    fn default_userdb_socket() -> PathBuf {
        "/run/dovecot/auth-userdb".into()
    }
    fn default_service() -> String {
        "smtp".to_string()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct BlackholeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<BlackholeRule>,
}

/// Each supplied pattern must fully match its field for the rule to apply
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct BlackholeRule {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub ehlo: Option<String>,
    #[serde(default)]
    pub mail: Option<String>,
    #[serde(default)]
    pub rcpt: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<ProxyRule>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ProxyRule {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub ehlo: Option<String>,
    #[serde(default)]
    pub mail: Option<String>,
    #[serde(default)]
    pub rcpt: Option<String>,
    /// Candidate relays, tried in order
    pub hosts: Vec<String>,
    #[serde(default = "ProxyRule::default_port")]
    pub port: u16,
    #[serde(default)]
    pub protocol: RelayProtocol,
    /// Issue STARTTLS after the greeting
    #[serde(default)]
    pub tls: bool,
    /// Skip certificate verification when `tls` is set
    #[serde(default)]
    pub tls_insecure: bool,
    #[serde(default)]
    pub direction: DirectionFilter,
    #[serde(default)]
    pub action: ProxyAction,
    #[serde(default)]
    pub auth_username: Option<String>,
    #[serde(default)]
    pub auth_password: Option<String>,
    #[serde(default)]
    pub auth_mechanism: RelayAuthMechanism,
}

impl ProxyRule {
    fn default_port() -> u16 {
        25
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelayProtocol {
    #[default]
    Esmtp,
    Smtp,
    Lmtp,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DirectionFilter {
    #[default]
    Both,
    Inbound,
    Outbound,
}

/// What happens to recipients that match no rule once an envelope
/// is being relayed
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyAction {
    #[default]
    None,
    Accept,
    Reject,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum RelayAuthMechanism {
    #[default]
    Plain,
    Login,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default = "StorageConfig::default_path")]
    pub path: PathBuf,
    /// sync_data() each message before it is renamed into place
    #[serde(default)]
    pub flush: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
            flush: false,
        }
    }
}

impl StorageConfig {
    fn default_path() -> PathBuf {
        std::env::temp_dir().join("smtpd")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct WebhookConfig {
    #[serde(default = "WebhookConfig::default_enabled")]
    pub enabled: bool,
    pub url: String,
    #[serde(default = "WebhookConfig::default_method")]
    pub method: String,
    #[serde(default = "WebhookConfig::default_timeout", with = "duration_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub auth_type: WebhookAuth,
    /// `user:pass` for basic, the token for bearer
    #[serde(default)]
    pub auth_value: Option<String>,
    /// Treat a failed call as success
    #[serde(default)]
    pub ignore_errors: bool,
    /// Base64 encode the message content of RAW calls
    #[serde(default)]
    pub base64: bool,
    /// When false the call is made in the background and
    /// always treated as a success
    #[serde(default = "WebhookConfig::default_wait_for_response")]
    pub wait_for_response: bool,
}

impl WebhookConfig {
    fn default_enabled() -> bool {
        true
    }
    fn default_method() -> String {
        "POST".to_string()
    }
    fn default_timeout() -> Duration {
        Duration::from_secs(10)
    }
    fn default_wait_for_response() -> bool {
        true
    }

    pub fn new<S: Into<String>>(url: S) -> Self {
        Self {
            enabled: true,
            url: url.into(),
            method: Self::default_method(),
            timeout: Self::default_timeout(),
            headers: BTreeMap::new(),
            auth_type: WebhookAuth::None,
            auth_value: None,
            ignore_errors: false,
            base64: false,
            wait_for_response: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WebhookAuth {
    #[default]
    None,
    Basic,
    Bearer,
}

/// Canned replies used in place of the defaults
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ScenarioConfig {
    #[serde(default)]
    pub ehlo: Option<String>,
    #[serde(default)]
    pub helo: Option<String>,
    #[serde(default)]
    pub lhlo: Option<String>,
    #[serde(default)]
    pub mail: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    /// First entry whose pattern fully matches the recipient wins
    #[serde(default)]
    pub rcpt: Vec<RcptScenario>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RcptScenario {
    pub value: String,
    pub response: String,
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn defaults_from_empty_document() {
        let config: ServerConfig = serde_json::from_str("{}").unwrap();
        assert_equal!(config.limits.error_limit, 3);
        assert_equal!(config.limits.email_size_limit, 10242400);
        assert_equal!(config.timeouts.extended, Duration::from_secs(120));
        assert_equal!(config.auth.mail_policy, MailPolicy::Accept);
        assert_equal!(config.dovecot.service, "smtp");
        assert!(!config.proxy.enabled);
        assert!(config.raw_webhook.is_none());
    }

    #[test]
    fn full_document() {
        let config: ServerConfig = serde_json::from_str(
            r#"{
                "hostname": "mx.example.com",
                "timeouts": {"command": "30s", "extended": 300},
                "auth": {"enabled": true, "mail_policy": "require_auth_for_outbound"},
                "users": {"list_enabled": true, "list": [{"name": "alice", "pass": "secret"}]},
                "proxy": {
                    "enabled": true,
                    "rules": [{
                        "rcpt": ".*@relay\\.test",
                        "hosts": ["relay1", "relay2"],
                        "protocol": "lmtp",
                        "direction": "inbound",
                        "action": "reject",
                        "auth_username": "relay",
                        "auth_password": "pw",
                        "auth_mechanism": "LOGIN"
                    }]
                },
                "webhooks": {"mail": {"url": "http://localhost/mail", "auth_type": "bearer", "auth_value": "t"}},
                "scenarios": {"*": {"rcpt": [{"value": "fail@.*", "response": "550 no"}]}},
                "relay_timeouts": {"connect_timeout": "5s"}
            }"#,
        )
        .unwrap();

        assert_equal!(config.hostname, "mx.example.com");
        assert_equal!(config.timeouts.command, Duration::from_secs(30));
        assert_equal!(config.timeouts.extended, Duration::from_secs(300));
        assert_equal!(config.auth.mail_policy, MailPolicy::RequireAuthForOutbound);
        let rule = &config.proxy.rules[0];
        assert_equal!(rule.port, 25);
        assert_equal!(rule.protocol, RelayProtocol::Lmtp);
        assert_equal!(rule.direction, DirectionFilter::Inbound);
        assert_equal!(rule.action, ProxyAction::Reject);
        assert_equal!(rule.auth_mechanism, RelayAuthMechanism::Login);
        let hook = &config.webhooks["mail"];
        assert_equal!(hook.method, "POST");
        assert_equal!(hook.auth_type, WebhookAuth::Bearer);
        assert!(hook.wait_for_response);
        assert_equal!(config.scenarios["*"].rcpt[0].response, "550 no");
        assert_equal!(config.relay_timeouts.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<ServerConfig>(r#"{"hostnme": "x"}"#).is_err());
        assert!(serde_json::from_str::<LimitsConfig>(r#"{"error_limt": 1}"#).is_err());
    }
}

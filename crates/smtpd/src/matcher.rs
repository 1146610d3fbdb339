//! Regex rule matching for blackhole and proxy routing rules.
use crate::config::{BlackholeConfig, BlackholeRule, DirectionFilter, ProxyConfig, ProxyRule};
use crate::session::Direction;
use regex::Regex;
use std::net::IpAddr;
use tracing::warn;

/// A rule field, compiled once. Patterns must match the whole value.
#[derive(Debug, Clone)]
pub enum Pattern {
    Any,
    Regex(Regex),
    /// Failed to compile; never matches
    Invalid,
}

impl Pattern {
    pub fn compile(pattern: Option<&str>) -> Self {
        match pattern {
            None => Self::Any,
            Some(p) if p.is_empty() => Self::Any,
            Some(p) => match Regex::new(&format!("^(?:{p})$")) {
                Ok(re) => Self::Regex(re),
                Err(err) => {
                    warn!("ignoring invalid rule pattern {p:?}: {err}");
                    Self::Invalid
                }
            },
        }
    }

    /// A present pattern never matches an absent value
    pub fn matches(&self, value: Option<&str>) -> bool {
        match (self, value) {
            (Self::Any, _) => true,
            (Self::Regex(re), Some(value)) => re.is_match(value),
            (Self::Regex(_), None) => false,
            (Self::Invalid, _) => false,
        }
    }
}

/// The values a rule is tested against. Fields that are not yet
/// known at the time of matching are None.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchInput<'a> {
    pub ip: Option<IpAddr>,
    pub ehlo: Option<&'a str>,
    pub mail: Option<&'a str>,
    pub rcpt: Option<&'a str>,
}

#[derive(Debug, Clone)]
struct CompiledFields {
    ip: Pattern,
    ehlo: Pattern,
    mail: Pattern,
    rcpt: Pattern,
}

impl CompiledFields {
    fn new(
        ip: &Option<String>,
        ehlo: &Option<String>,
        mail: &Option<String>,
        rcpt: &Option<String>,
    ) -> Self {
        Self {
            ip: Pattern::compile(ip.as_deref()),
            ehlo: Pattern::compile(ehlo.as_deref()),
            mail: Pattern::compile(mail.as_deref()),
            rcpt: Pattern::compile(rcpt.as_deref()),
        }
    }

    fn matches(&self, input: &MatchInput) -> bool {
        let ip = input.ip.map(|ip| ip.to_string());
        self.ip.matches(ip.as_deref())
            && self.ehlo.matches(input.ehlo)
            && self.mail.matches(input.mail)
            && self.rcpt.matches(input.rcpt)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BlackholeMatcher {
    rules: Vec<CompiledFields>,
}

impl BlackholeMatcher {
    pub fn new(config: &BlackholeConfig) -> Self {
        if !config.enabled {
            return Self::default();
        }
        Self {
            rules: config
                .rules
                .iter()
                .map(|BlackholeRule { ip, ehlo, mail, rcpt }| {
                    CompiledFields::new(ip, ehlo, mail, rcpt)
                })
                .collect(),
        }
    }

    /// Any one matching rule blackholes
    pub fn should_blackhole(&self, input: &MatchInput) -> bool {
        self.rules.iter().any(|rule| rule.matches(input))
    }
}

#[derive(Debug, Clone)]
struct CompiledProxyRule {
    fields: CompiledFields,
    rule: ProxyRule,
}

#[derive(Debug, Clone, Default)]
pub struct ProxyMatcher {
    rules: Vec<CompiledProxyRule>,
}

impl ProxyMatcher {
    pub fn new(config: &ProxyConfig) -> Self {
        if !config.enabled {
            return Self::default();
        }
        Self {
            rules: config
                .rules
                .iter()
                .filter(|rule| {
                    if rule.hosts.is_empty() {
                        warn!("ignoring proxy rule with no hosts: {rule:?}");
                        false
                    } else {
                        true
                    }
                })
                .map(|rule| CompiledProxyRule {
                    fields: CompiledFields::new(&rule.ip, &rule.ehlo, &rule.mail, &rule.rcpt),
                    rule: rule.clone(),
                })
                .collect(),
        }
    }

    /// First matching rule wins
    pub fn find_matching_rule(
        &self,
        input: &MatchInput,
        direction: Direction,
    ) -> Option<&ProxyRule> {
        self.rules
            .iter()
            .find(|compiled| {
                let direction_ok = match compiled.rule.direction {
                    DirectionFilter::Both => true,
                    DirectionFilter::Inbound => direction == Direction::Inbound,
                    DirectionFilter::Outbound => direction == Direction::Outbound,
                };
                direction_ok && compiled.fields.matches(input)
            })
            .map(|compiled| &compiled.rule)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    fn input<'a>(ehlo: Option<&'a str>, mail: Option<&'a str>, rcpt: Option<&'a str>) -> MatchInput<'a> {
        MatchInput {
            ip: Some("192.168.1.10".parse().unwrap()),
            ehlo,
            mail,
            rcpt,
        }
    }

    #[test]
    fn patterns() {
        assert!(Pattern::compile(None).matches(None));
        assert!(Pattern::compile(Some("")).matches(Some("anything")));
        let p = Pattern::compile(Some(r".*@example\.com"));
        assert!(p.matches(Some("a@example.com")));
        assert!(!p.matches(Some("a@example.com.evil")));
        assert!(!p.matches(None));
        assert!(!Pattern::compile(Some("(unclosed")).matches(Some("(unclosed")));
    }

    #[test]
    fn blackhole_rules() {
        let config: BlackholeConfig = serde_json::from_value(serde_json::json!({
            "enabled": true,
            "rules": [
                {"ip": r"192\.168\.1\..*", "rcpt": "trap@.*"},
                {"ehlo": "spammer\\.example"}
            ]
        }))
        .unwrap();
        let matcher = BlackholeMatcher::new(&config);

        assert!(matcher.should_blackhole(&input(None, None, Some("trap@example.com"))));
        assert!(!matcher.should_blackhole(&input(None, None, Some("user@example.com"))));
        assert!(!matcher.should_blackhole(&input(None, None, None)));
        assert!(matcher.should_blackhole(&input(Some("spammer.example"), None, None)));

        let mut disabled = config.clone();
        disabled.enabled = false;
        assert!(!BlackholeMatcher::new(&disabled)
            .should_blackhole(&input(Some("spammer.example"), None, None)));
    }

    #[test]
    fn proxy_rules() {
        let config: ProxyConfig = serde_json::from_value(serde_json::json!({
            "enabled": true,
            "rules": [
                {"rcpt": ".*@nohosts\\.test", "hosts": []},
                {"rcpt": ".*@relay\\.test", "hosts": ["mx1.relay.test"], "direction": "outbound"},
                {"rcpt": ".*@relay\\.test", "hosts": ["mx2.relay.test"], "port": 2525},
                {"mail": "bounce@.*", "hosts": ["mx3.relay.test"]}
            ]
        }))
        .unwrap();
        let matcher = ProxyMatcher::new(&config);

        let rule = matcher
            .find_matching_rule(
                &input(None, Some("a@b.c"), Some("bob@relay.test")),
                Direction::Inbound,
            )
            .unwrap();
        assert_equal!(rule.hosts, vec!["mx2.relay.test".to_string()]);
        assert_equal!(rule.port, 2525);

        let rule = matcher
            .find_matching_rule(
                &input(None, Some("a@b.c"), Some("bob@relay.test")),
                Direction::Outbound,
            )
            .unwrap();
        assert_equal!(rule.hosts, vec!["mx1.relay.test".to_string()]);

        assert!(matcher
            .find_matching_rule(
                &input(None, Some("a@b.c"), Some("x@nohosts.test")),
                Direction::Inbound
            )
            .is_none());
        assert!(matcher
            .find_matching_rule(
                &input(None, Some("bounce@b.c"), Some("x@y.z")),
                Direction::Inbound
            )
            .is_some());
    }
}

//! Canned replies, selected by the domain the client announced.
use crate::config::ScenarioConfig;
use crate::matcher::Pattern;
use crate::outcome::Reply;
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct Scenario {
    pub ehlo: Option<Reply>,
    pub helo: Option<Reply>,
    pub lhlo: Option<Reply>,
    pub mail: Option<Reply>,
    pub data: Option<Reply>,
    rcpt: Vec<(Pattern, Reply)>,
}

fn compile_reply(domain: &str, command: &str, text: &Option<String>) -> Option<Reply> {
    let text = text.as_deref()?;
    let reply = Reply::parse(text);
    if reply.is_none() {
        warn!("scenario {domain}: ignoring malformed {command} reply {text:?}");
    }
    reply
}

impl Scenario {
    fn new(domain: &str, config: &ScenarioConfig) -> Self {
        Self {
            ehlo: compile_reply(domain, "ehlo", &config.ehlo),
            helo: compile_reply(domain, "helo", &config.helo),
            lhlo: compile_reply(domain, "lhlo", &config.lhlo),
            mail: compile_reply(domain, "mail", &config.mail),
            data: compile_reply(domain, "data", &config.data),
            rcpt: config
                .rcpt
                .iter()
                .filter_map(|entry| {
                    let reply = compile_reply(domain, "rcpt", &Some(entry.response.clone()))?;
                    Some((Pattern::compile(Some(&entry.value)), reply))
                })
                .collect(),
        }
    }

    /// The reply for the first rcpt entry whose pattern matches
    pub fn rcpt_response(&self, rcpt: &str) -> Option<&Reply> {
        self.rcpt
            .iter()
            .find(|(pattern, _)| pattern.matches(Some(rcpt)))
            .map(|(_, reply)| reply)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Scenarios {
    by_domain: HashMap<String, Scenario>,
}

impl Scenarios {
    pub fn new(config: &HashMap<String, ScenarioConfig>) -> Self {
        Self {
            by_domain: config
                .iter()
                .map(|(domain, scenario)| {
                    (domain.to_ascii_lowercase(), Scenario::new(domain, scenario))
                })
                .collect(),
        }
    }

    /// The scenario for `ehlo`, falling back to the `*` entry
    pub fn select(&self, ehlo: Option<&str>) -> Option<&Scenario> {
        ehlo.and_then(|domain| self.by_domain.get(&domain.to_ascii_lowercase()))
            .or_else(|| self.by_domain.get("*"))
    }
}

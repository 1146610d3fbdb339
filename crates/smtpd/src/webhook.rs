//! HTTP callbacks made before commands are processed and after a
//! message has been stored.
use crate::config::{WebhookAuth, WebhookConfig};
use async_trait::async_trait;
use data_encoding::BASE64;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: String,
    pub success: bool,
}

impl WebhookResponse {
    fn ok() -> Self {
        Self {
            status: 200,
            body: String::new(),
            success: true,
        }
    }

    /// A literal SMTP reply supplied by the webhook, if any
    pub fn smtp_response(&self) -> Option<String> {
        extract_smtp_response(&self.body)
    }
}

#[async_trait]
pub trait WebhookCaller: Send + Sync {
    /// Post a JSON description of a command
    async fn call(&self, config: &WebhookConfig, payload: &serde_json::Value) -> WebhookResponse;

    /// Send the stored message at `file`
    async fn call_raw(&self, config: &WebhookConfig, file: &Path) -> WebhookResponse;
}

/// Reads the `smtpResponse` field of a JSON response body
pub fn extract_smtp_response(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("smtpResponse")?
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, Default)]
pub struct HttpWebhook {
    client: reqwest::Client,
}

impl HttpWebhook {
    pub fn new() -> Self {
        Self::default()
    }

    fn request(&self, config: &WebhookConfig) -> anyhow::Result<reqwest::RequestBuilder> {
        let method = reqwest::Method::from_bytes(config.method.to_ascii_uppercase().as_bytes())?;
        let mut request = self
            .client
            .request(method, &config.url)
            .timeout(config.timeout)
            .header("Accept", "application/json");

        match (config.auth_type, &config.auth_value) {
            (WebhookAuth::Basic, Some(value)) => {
                let (user, pass) = match value.split_once(':') {
                    Some((user, pass)) => (user, Some(pass)),
                    None => (value.as_str(), None),
                };
                request = request.basic_auth(user, pass);
            }
            (WebhookAuth::Bearer, Some(token)) => {
                request = request.bearer_auth(token);
            }
            _ => {}
        }

        for (name, value) in &config.headers {
            request = request.header(name, value);
        }

        Ok(request)
    }

    async fn execute(
        config: &WebhookConfig,
        request: anyhow::Result<reqwest::RequestBuilder>,
    ) -> WebhookResponse {
        let result = async {
            let response = request?.send().await?;
            let status = response.status();
            let body = response.text().await?;
            anyhow::Ok((status, body))
        }
        .await;

        match result {
            Ok((status, body)) => {
                tracing::debug!("webhook {} returned {status}", config.url);
                if !status.is_success() && config.ignore_errors {
                    tracing::warn!("webhook {} returned {status}, ignoring", config.url);
                }
                WebhookResponse {
                    status: status.as_u16(),
                    body,
                    success: status.is_success() || config.ignore_errors,
                }
            }
            Err(err) if config.ignore_errors => {
                tracing::warn!("webhook {} failed, ignoring: {err:#}", config.url);
                WebhookResponse::ok()
            }
            Err(err) => {
                tracing::error!("webhook {} failed: {err:#}", config.url);
                WebhookResponse {
                    status: 500,
                    body: format!("{err:#}"),
                    success: false,
                }
            }
        }
    }

    async fn dispatch(
        &self,
        config: &WebhookConfig,
        request: anyhow::Result<reqwest::RequestBuilder>,
    ) -> WebhookResponse {
        if config.wait_for_response {
            return Self::execute(config, request).await;
        }

        let config = config.clone();
        tokio::spawn(async move {
            Self::execute(&config, request).await;
        });
        WebhookResponse::ok()
    }
}

fn has_body(method: &str) -> bool {
    ["POST", "PUT", "PATCH"]
        .iter()
        .any(|m| m.eq_ignore_ascii_case(method))
}

#[async_trait]
impl WebhookCaller for HttpWebhook {
    async fn call(&self, config: &WebhookConfig, payload: &serde_json::Value) -> WebhookResponse {
        if !config.enabled || config.url.is_empty() {
            return WebhookResponse::ok();
        }

        let request = self.request(config).map(|request| {
            if has_body(&config.method) {
                request.json(payload)
            } else {
                request
            }
        });
        self.dispatch(config, request).await
    }

    async fn call_raw(&self, config: &WebhookConfig, file: &Path) -> WebhookResponse {
        if !config.enabled || config.url.is_empty() {
            return WebhookResponse::ok();
        }

        let content = match tokio::fs::read(file).await {
            Ok(content) => content,
            Err(err) => {
                let err = anyhow::Error::from(err).context(format!("reading {file:?}"));
                return Self::execute(config, Err(err)).await;
            }
        };

        let request = self.request(config).map(|request| {
            let request = request.header("Content-Type", "text/plain; charset=utf-8");
            if !has_body(&config.method) {
                request
            } else if config.base64 {
                request
                    .header("Content-Transfer-Encoding", "base64")
                    .body(BASE64.encode(&content))
            } else {
                request.body(content)
            }
        });
        self.dispatch(config, request).await
    }
}

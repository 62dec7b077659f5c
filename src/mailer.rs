use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::config::AppConfig;

/// Outbound mail transport. Delivery failures are reported to the
/// caller but never roll back the event that produced the mail.
#[async_trait]
pub trait Mailer: Send + Sync + 'static {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()>;
}

/// Posts messages to an HTTP mail relay (api-key authenticated).
pub struct HttpMailer {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    from: String,
}

impl HttpMailer {
    pub fn new(endpoint: String, api_key: Option<String>, from: String) -> Self {
        Self {
            client: Client::new(),
            endpoint,
            api_key,
            from,
        }
    }

    pub fn from_config(config: &AppConfig) -> Option<Self> {
        config.mail_api_url.as_ref().map(|endpoint| {
            Self::new(
                endpoint.clone(),
                config.mail_api_key.clone(),
                config.mail_from.clone(),
            )
        })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        let mut request = self.client.post(&self.endpoint).json(&json!({
            "from": self.from,
            "to": to,
            "subject": subject,
            "text": body,
        }));

        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request.send().await.context("mail relay unreachable")?;
        if !response.status().is_success() {
            anyhow::bail!("mail relay returned {}", response.status());
        }
        Ok(())
    }
}

/// Used when no relay is configured; logs and drops the message.
pub struct NoopMailer;

#[async_trait]
impl Mailer for NoopMailer {
    async fn send(&self, to: &str, subject: &str, _body: &str) -> Result<()> {
        tracing::debug!(%to, %subject, "mail relay not configured, dropping message");
        Ok(())
    }
}

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::channel::{AddressRule, ChannelSender};
use crate::error::SendError;
use crate::signing::build_signature_headers;

/// Channel that posts notifications to an HTTP relay endpoint.
///
/// The endpoint receives `{destination, subject, message}` and is expected
/// to forward it to the actual transport (SMS gateway, chat bridge, queue).
pub struct WebhookSender {
    client: reqwest::Client,
    url: String,
    secret: Option<Vec<u8>>,
    timeout: Duration,
    rule: AddressRule,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    destination: &'a str,
    subject: &'a str,
    message: &'a str,
}

impl WebhookSender {
    pub fn new(url: impl Into<String>, rule: AddressRule) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            secret: None,
            timeout: Duration::from_secs(5),
            rule,
        }
    }

    /// Sign every request with HMAC-SHA256.
    pub fn with_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ChannelSender for WebhookSender {
    async fn send(&self, address: &str, subject: &str, body: &str) -> Result<(), SendError> {
        if address.is_empty() {
            return Err(SendError::EmptyAddress);
        }

        let payload = serde_json::to_vec(&WebhookPayload {
            destination: address,
            subject,
            message: body,
        })
        .map_err(|e| SendError::transport("encode webhook payload", e))?;

        let mut request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .header("Content-Type", "application/json");

        if let Some(secret) = &self.secret {
            let headers = build_signature_headers(secret, &payload);
            let (name, value) = headers.signature;
            request = request.header(name, value);
            let (name, value) = headers.timestamp;
            request = request.header(name, value);
        }

        let response = request.body(payload).send().await.map_err(|e| {
            if e.is_timeout() {
                SendError::Timeout
            } else {
                SendError::transport(format!("POST {}", self.url), e)
            }
        })?;

        response
            .error_for_status()
            .map(|_| ())
            .map_err(|e| SendError::transport(format!("POST {}", self.url), e))
    }

    fn validate(&self, address: &str) -> bool {
        self.rule.matches(address)
    }

    fn validation_rule(&self) -> &str {
        self.rule.pattern()
    }
}

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac as _};
use reqwest::Client;
use sha2::Sha256;

use super::{Event, Transport};
use crate::config::WebhookConfig;
use crate::error::{AppError, Result};

/// Header carrying `sha256=<hex>` when a secret is configured.
pub const SIGNATURE_HEADER: &str = "X-GSM-Signature";

const USER_AGENT: &str = "gsm-orchestrator";

/// HMAC-SHA256 of `body` under `secret`, formatted for [`SIGNATURE_HEADER`].
pub fn sign_payload(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::invalid_config(format!("Invalid webhook secret: {}", e)))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// POSTs each event as JSON to a primary and optional secondary URL.
pub struct WebhookTransport {
    client: Client,
    urls: Vec<String>,
    secret: Option<String>,
    timeout: Duration,
    retries: u32,
}

impl WebhookTransport {
    pub fn new(
        urls: Vec<String>,
        secret: Option<String>,
        timeout: Duration,
        retries: u32,
    ) -> Result<Self> {
        let urls: Vec<String> = urls.into_iter().filter(|u| !u.trim().is_empty()).collect();
        if urls.is_empty() {
            return Err(AppError::invalid_config("Webhook enabled without a URL"));
        }
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| AppError::transport(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            urls,
            secret: secret.filter(|s| !s.is_empty()),
            timeout,
            retries,
        })
    }

    pub fn from_config(config: &WebhookConfig) -> Result<Self> {
        Self::new(
            vec![config.url.clone(), config.secondary_url.clone()],
            Some(config.secret.clone()),
            Duration::from_secs(config.timeout_secs.max(1)),
            config.retries,
        )
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    async fn post_once(&self, url: &str, body: &str, signature: Option<&str>) -> Result<()> {
        let mut request = self
            .client
            .post(url)
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_string());
        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| AppError::transport_with_url(url, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AppError::transport_with_url(
                url,
                format!("status {}", resp.status()),
            ));
        }
        Ok(())
    }

    /// One URL, up to `1 + retries` sequential attempts.
    async fn post_with_retries(&self, url: &str, body: &str, signature: Option<&str>) -> Result<()> {
        let mut last_err = None;
        for attempt in 0..=self.retries {
            match self.post_once(url, body, signature).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::debug!("Webhook attempt {} to {} failed: {}", attempt + 1, url, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| AppError::transport_with_url(url, "no attempt made")))
    }

    async fn deliver(&self, event: &Event) -> Result<()> {
        let body = event.to_json()?;
        let signature = match &self.secret {
            Some(secret) => Some(sign_payload(secret, body.as_bytes())?),
            None => None,
        };

        // Every URL is tried even after an earlier one succeeded.
        let mut delivered = 0;
        let mut failures = Vec::new();
        for url in &self.urls {
            match self.post_with_retries(url, &body, signature.as_deref()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::warn!("Webhook delivery to {} failed: {}", url, e);
                    failures.push(e.to_string());
                }
            }
        }

        if delivered > 0 {
            Ok(())
        } else {
            Err(AppError::transport(format!(
                "No webhook URL reachable: {}",
                failures.join("; ")
            )))
        }
    }
}

#[async_trait]
impl Transport for WebhookTransport {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, event: &Event) -> Result<()> {
        self.deliver(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_hex_hmac_sha256() {
        // RFC 4231 test case 2
        let sig = sign_payload("Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            sig,
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn requires_at_least_one_url() {
        let err = WebhookTransport::new(
            vec![String::new(), " ".into()],
            None,
            Duration::from_secs(1),
            0,
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidConfig);
    }

    #[test]
    fn empty_secondary_is_ignored() {
        let config = WebhookConfig {
            enabled: true,
            url: "http://127.0.0.1:9/hook".into(),
            ..WebhookConfig::default()
        };
        let transport = WebhookTransport::from_config(&config).unwrap();
        assert_eq!(transport.urls().len(), 1);
        assert!(transport.secret.is_none());
    }
}

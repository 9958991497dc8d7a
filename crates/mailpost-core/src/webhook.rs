//! Webhook dispatcher - posts finished envelopes to the configured endpoint

use mailpost_common::config::WebhookConfig;
use mailpost_common::types::MailEnvelope;
use mailpost_common::{Error, Result};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Longest response body excerpt written to the log
const MAX_LOGGED_BODY: usize = 512;

/// Result of the single delivery attempt for one envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The endpoint answered 200
    Delivered,
    /// The endpoint answered with any other status
    Rejected { status: u16 },
    /// The request never got a response
    Failed { error: String },
    /// Delivery is disabled by configuration
    Skipped,
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered)
    }
}

/// Webhook dispatcher
pub struct WebhookDispatcher {
    http_client: Client,
    url: String,
    form_field: String,
    enabled: bool,
}

impl WebhookDispatcher {
    /// Create a dispatcher from config
    pub fn new(config: &WebhookConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Webhook(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            url: config.url.clone(),
            form_field: config.form_field.clone(),
            enabled: config.enabled,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Post the envelope once. Failures are logged and never retried.
    pub async fn deliver(&self, envelope: &MailEnvelope) -> DeliveryOutcome {
        let payload = match serde_json::to_string(envelope) {
            Ok(payload) => payload,
            Err(e) => {
                error!(staging_id = %envelope.id, "Failed to serialize envelope: {}", e);
                return DeliveryOutcome::Failed {
                    error: e.to_string(),
                };
            }
        };

        if !self.enabled {
            info!(staging_id = %envelope.id, "Webhook disabled, not delivering envelope");
            debug!(staging_id = %envelope.id, envelope = %payload, "Undelivered envelope");
            return DeliveryOutcome::Skipped;
        }

        debug!(staging_id = %envelope.id, url = %self.url, "Posting envelope to webhook");

        let response = match self
            .http_client
            .post(&self.url)
            .form(&[(self.form_field.as_str(), payload.as_str())])
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!(staging_id = %envelope.id, url = %self.url, "Webhook request failed: {}", e);
                return DeliveryOutcome::Failed {
                    error: e.to_string(),
                };
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let excerpt: String = body.chars().take(MAX_LOGGED_BODY).collect();

        if status == StatusCode::OK {
            info!(staging_id = %envelope.id, status = status.as_u16(), "Webhook delivery succeeded");
            debug!(staging_id = %envelope.id, response = %excerpt, "Webhook response");
            DeliveryOutcome::Delivered
        } else {
            warn!(
                staging_id = %envelope.id,
                status = status.as_u16(),
                response = %excerpt,
                "Webhook delivery failed"
            );
            DeliveryOutcome::Rejected {
                status: status.as_u16(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailpost_common::types::{Headers, Verdict};
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn envelope() -> MailEnvelope {
        MailEnvelope {
            id: "00ff".to_string(),
            headers: Headers::new(),
            subject: Some("Hi".to_string()),
            from: vec!["alice@example.com".to_string()],
            to: vec!["bob@example.org".to_string()],
            cc: vec![],
            date: None,
            message_id: None,
            text: "Hello".to_string(),
            html: "<p>Hello</p>".to_string(),
            attachments: vec![],
            dkim: Verdict::Failed,
            spf: Verdict::Pass,
            language: "eng".to_string(),
            envelope_from: Some("alice@example.com".to_string()),
            envelope_to: vec!["bob@example.org".to_string()],
            remote_address: "127.0.0.1".to_string(),
            remote_host: "[127.0.0.1]".to_string(),
            helo: Some("client.example.com".to_string()),
            received_at: "2024-01-01T00:00:00+00:00".to_string(),
        }
    }

    fn dispatcher(url: String) -> WebhookDispatcher {
        WebhookDispatcher::new(&WebhookConfig {
            url,
            timeout_secs: 5,
            ..WebhookConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_deliver_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(body_string_contains("mailpost=%7B"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = dispatcher(format!("{}/hook", server.uri()))
            .deliver(&envelope())
            .await;
        assert_eq!(outcome, DeliveryOutcome::Delivered);
    }

    #[tokio::test]
    async fn test_non_200_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = dispatcher(server.uri()).deliver(&envelope()).await;
        assert_eq!(outcome, DeliveryOutcome::Rejected { status: 500 });
    }

    #[tokio::test]
    async fn test_only_200_counts_as_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = dispatcher(server.uri()).deliver(&envelope()).await;
        assert_eq!(outcome, DeliveryOutcome::Rejected { status: 202 });
    }

    #[tokio::test]
    async fn test_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let outcome = dispatcher(format!("http://127.0.0.1:{}/hook", port))
            .deliver(&envelope())
            .await;
        assert!(matches!(outcome, DeliveryOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_disabled_dispatcher_skips() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dispatcher = WebhookDispatcher::new(&WebhookConfig {
            url: server.uri(),
            enabled: false,
            ..WebhookConfig::default()
        })
        .unwrap();

        assert_eq!(dispatcher.deliver(&envelope()).await, DeliveryOutcome::Skipped);
    }
}

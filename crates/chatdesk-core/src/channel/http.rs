//! HTTP channel gateway client

use async_trait::async_trait;
use chatdesk_common::config::ChannelConfig;
use chatdesk_common::{Error, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::{ChannelAdapter, OutboundMessage};

/// Channel adapter posting JSON messages to a gateway endpoint
pub struct HttpChannelAdapter {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(alias = "message_id")]
    id: Option<String>,
}

impl HttpChannelAdapter {
    pub fn new(config: &ChannelConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build channel client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        })
    }
}

#[async_trait]
impl ChannelAdapter for HttpChannelAdapter {
    async fn send(&self, message: &OutboundMessage) -> Result<String> {
        let body = json!({
            "to": message.destination,
            "text": message.text,
            "template": message.template_ref,
            "conversation_id": message.conversation_id,
            "reference": message.recipient_id,
        });

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("Idempotency-Key", message.recipient_id.to_string())
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Channel("Channel request timed out".to_string())
            } else {
                Error::Channel(format!("Channel request failed: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Channel(format!(
                "Channel returned {}: {}",
                status,
                detail.chars().take(200).collect::<String>()
            )));
        }

        let parsed: SendResponse = response
            .json()
            .await
            .map_err(|e| Error::Channel(format!("Invalid channel response: {}", e)))?;

        let id = parsed
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::Channel("Channel response carried no message id".to_string()))?;

        debug!(recipient_id = %message.recipient_id, external_id = %id, "Message accepted by channel");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn message() -> OutboundMessage {
        OutboundMessage {
            campaign_id: Uuid::new_v4(),
            recipient_id: Uuid::new_v4(),
            conversation_id: None,
            destination: "+15550001111".to_string(),
            text: "Hello!".to_string(),
            template_ref: Some("promo_v1".to_string()),
        }
    }

    fn adapter(server: &MockServer) -> HttpChannelAdapter {
        HttpChannelAdapter::new(&ChannelConfig {
            endpoint: format!("{}/messages", server.uri()),
            api_key: Some("gateway-key".to_string()),
            timeout_secs: 2,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_returns_external_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("Authorization", "Bearer gateway-key"))
            .and(body_partial_json(serde_json::json!({
                "to": "+15550001111",
                "text": "Hello!",
                "template": "promo_v1"
            })))
            .respond_with(
                ResponseTemplate::new(202).set_body_json(serde_json::json!({"message_id": "wamid.42"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let id = adapter(&server).send(&message()).await.unwrap();
        assert_eq!(id, "wamid.42");
    }

    #[tokio::test]
    async fn test_send_maps_rejection_to_channel_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid number"))
            .mount(&server)
            .await;

        let err = adapter(&server).send(&message()).await.unwrap_err();
        assert!(matches!(err, Error::Channel(ref m) if m.contains("invalid number")));
    }

    #[tokio::test]
    async fn test_send_requires_message_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        assert!(adapter(&server).send(&message()).await.is_err());
    }
}

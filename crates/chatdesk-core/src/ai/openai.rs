//! OpenAI-compatible chat completions client

use async_trait::async_trait;
use chatdesk_common::config::AiConfig;
use chatdesk_common::{Error, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::{ContactContext, TextGenerator};

const DEFAULT_SYSTEM_PROMPT: &str = "You write short, friendly, personalised outbound messages \
for a customer support team. Reply with the message body only, without greetings addressed to \
the team and without placeholders.";

/// Text generator backed by any OpenAI-compatible `/chat/completions` endpoint
pub struct HttpTextGenerator {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    system_prompt: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl HttpTextGenerator {
    pub fn new(config: &AiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build AI client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            model: config.model.clone(),
            temperature: config.temperature,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        })
    }

    fn user_message(prompt: &str, contact: &ContactContext) -> String {
        let mut message = format!("Campaign instructions:\n{}\n\nRecipient name: {}", prompt, contact.name);
        if contact.attributes.as_object().map_or(false, |o| !o.is_empty()) {
            message.push_str("\nRecipient details: ");
            message.push_str(&contact.attributes.to_string());
        }
        message
    }
}

#[async_trait]
impl TextGenerator for HttpTextGenerator {
    async fn generate(&self, prompt: &str, contact: &ContactContext) -> Result<String> {
        let body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                { "role": "system", "content": self.system_prompt },
                { "role": "user", "content": Self::user_message(prompt, contact) },
            ],
        });

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Generation("AI request timed out".to_string())
            } else {
                Error::Generation(format!("AI request failed: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Generation(format!(
                "AI service returned {}: {}",
                status,
                detail.chars().take(200).collect::<String>()
            )));
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::Generation(format!("Invalid AI response: {}", e)))?;

        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|t| t.trim().to_string())
            .unwrap_or_default();

        if text.is_empty() {
            return Err(Error::Generation("AI service returned an empty message".to_string()));
        }

        debug!(model = %self.model, chars = text.len(), "Generated message");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(endpoint: String) -> AiConfig {
        AiConfig {
            endpoint,
            api_key: Some("sk-test".to_string()),
            timeout_secs: 2,
            ..AiConfig::default()
        }
    }

    fn contact() -> ContactContext {
        ContactContext {
            name: "Maria".to_string(),
            attributes: serde_json::json!({"city": "Lisbon"}),
        }
    }

    #[tokio::test]
    async fn test_generate_returns_trimmed_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({"model": "gpt-4o-mini"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "  Hi Maria!  "}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let generator = HttpTextGenerator::new(&config(server.uri())).unwrap();
        let text = generator.generate("Say hi", &contact()).await.unwrap();
        assert_eq!(text, "Hi Maria!");
    }

    #[tokio::test]
    async fn test_generate_maps_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let generator = HttpTextGenerator::new(&config(server.uri())).unwrap();
        let err = generator.generate("Say hi", &contact()).await.unwrap_err();
        assert!(matches!(err, Error::Generation(ref m) if m.contains("429")));
    }

    #[tokio::test]
    async fn test_generate_rejects_empty_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "   "}}]
            })))
            .mount(&server)
            .await;

        let generator = HttpTextGenerator::new(&config(server.uri())).unwrap();
        assert!(generator.generate("Say hi", &contact()).await.is_err());
    }

    #[test]
    fn test_user_message_includes_attributes() {
        let message = HttpTextGenerator::user_message("Offer 10% off", &contact());
        assert!(message.contains("Offer 10% off"));
        assert!(message.contains("Maria"));
        assert!(message.contains("Lisbon"));
    }
}

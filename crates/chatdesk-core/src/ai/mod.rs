//! AI text generation
//!
//! The engine only needs one operation from the AI service: turn a campaign
//! prompt and a contact's display attributes into a message body.

mod openai;

pub use openai::HttpTextGenerator;

use async_trait::async_trait;
use chatdesk_common::Result;
use chatdesk_storage::Contact;
use serde::Serialize;

/// Contact attributes handed to the AI service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContactContext {
    pub name: String,
    pub attributes: serde_json::Value,
}

impl From<&Contact> for ContactContext {
    fn from(contact: &Contact) -> Self {
        Self {
            name: contact.name.clone(),
            attributes: contact.attributes.clone(),
        }
    }
}

/// Text generation service
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate a message body. Failures are reported as `Error::Generation`.
    async fn generate(&self, prompt: &str, contact: &ContactContext) -> Result<String>;
}

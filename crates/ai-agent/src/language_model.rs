use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messages::{ContentBlock, Message};
use crate::tools::ToolDefinition;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LanguageModelUsage {
    #[serde(default)]
    pub input_tokens: Option<u32>,
    #[serde(default)]
    pub output_tokens: Option<u32>,
}

/// Body of one "messages with tools" request.
#[derive(Debug, Clone, Serialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system: String,
    pub tools: Vec<ToolDefinition>,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<LanguageModelUsage>,
}

impl MessagesResponse {
    pub fn new(content: Vec<ContentBlock>) -> Self {
        Self {
            content,
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum ReasoningError {
    #[error("reasoning service returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("reasoning request failed: {0}")]
    Transport(String),
    #[error("invalid reasoning response: {0}")]
    Decode(String),
    #[error("reasoning request timed out after {0} ms")]
    Timeout(u64),
}

/// Opaque request/response reasoning service.
#[async_trait]
pub trait ReasoningClient: Send + Sync {
    async fn send(&self, request: &MessagesRequest) -> Result<MessagesResponse, ReasoningError>;
}

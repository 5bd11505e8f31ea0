//! Thin client for the external chat-completions capability. The prompt
//! content lives with the callers; this module only speaks the wire format.

use crate::config::CompletionsConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, trace};

#[derive(Error, Debug)]
pub enum CompletionError {
    #[error("Completions request failed: {0}")]
    Http(String),
    #[error("Completions request timed out")]
    Timeout,
    #[error("Completions response malformed: {0}")]
    BadResponse(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: String,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
}

/// Seam between the pipeline and the external model. The engine, the
/// synthesizer, and the tests all go through this trait.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<ChatCompletion, CompletionError>;
}

pub struct HttpCompletions {
    client: reqwest::Client,
    config: CompletionsConfig,
}

impl HttpCompletions {
    pub fn new(config: CompletionsConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("Could not build completions HTTP client");
        Self { client, config }
    }
}

#[async_trait]
impl CompletionBackend for HttpCompletions {
    async fn complete(&self, request: ChatRequest) -> Result<ChatCompletion, CompletionError> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let body = json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": false,
        });

        trace!("Sending completion request to {}", url);

        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                CompletionError::Timeout
            } else {
                error!("Completions request failed: {}", e);
                CompletionError::Http(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            error!("Completions API returned {}: {}", status, detail);
            return Err(CompletionError::Http(format!("upstream status {}", status)));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| CompletionError::BadResponse(e.to_string()))?;

        parse_completion(&payload)
    }
}

fn parse_completion(payload: &Value) -> Result<ChatCompletion, CompletionError> {
    let content = payload
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| CompletionError::BadResponse("missing choices[0].message.content".to_string()))?
        .to_string();

    let usage_tokens = |field: &str| {
        payload
            .get("usage")
            .and_then(|u| u.get(field))
            .and_then(|v| v.as_i64())
            .unwrap_or(0) as i32
    };

    Ok(ChatCompletion {
        content,
        prompt_tokens: usage_tokens("prompt_tokens"),
        completion_tokens: usage_tokens("completion_tokens"),
    })
}

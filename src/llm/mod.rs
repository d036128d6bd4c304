//! Completion service boundary. The engine only ever talks to a language
//! model through this trait; credentials and transport live with the caller.

use crate::core::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One role-tagged message in a completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling parameters. All optional; the service applies its own defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionParams {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

/// Generated text plus usage accounting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub tokens_used: u64,
    pub latency_ms: u64,
    pub model: String,
}

impl Completion {
    pub fn usage(&self) -> CompletionUsage {
        CompletionUsage {
            tokens_used: self.tokens_used,
            latency_ms: self.latency_ms,
        }
    }
}

/// Aggregatable usage slice of a completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionUsage {
    pub tokens_used: u64,
    pub latency_ms: u64,
}

impl CompletionUsage {
    pub fn add(&mut self, other: CompletionUsage) {
        self.tokens_used += other.tokens_used;
        self.latency_ms += other.latency_ms;
    }
}

/// Language-model completion service consumed by the engine
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<Completion>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let msg = ChatMessage::system("you are an evaluator");
        assert_eq!(msg.role, ChatRole::System);

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "system");
    }

    #[test]
    fn test_usage_aggregation() {
        let mut total = CompletionUsage::default();
        total.add(CompletionUsage {
            tokens_used: 120,
            latency_ms: 40,
        });
        total.add(CompletionUsage {
            tokens_used: 80,
            latency_ms: 60,
        });
        assert_eq!(total.tokens_used, 200);
        assert_eq!(total.latency_ms, 100);
    }
}

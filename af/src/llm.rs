//! LLM provider abstraction
//!
//! The engine consumes an opaque completion function: one prompt in, one
//! text plus optional token usage out. Each call is independent - no
//! conversation state survives between steps, which is what keeps the
//! context bounded.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from an LLM provider
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Provider error: {0}")]
    Provider(String),
}

/// Token usage reported by a provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// One completion: the response text and usage when the provider knows it
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }
}

/// Stateless LLM provider - each call is a fresh context window
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send one prompt and block until the completion arrives
    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<Completion, LlmError>;

    /// Coarse token estimate; providers with a real tokenizer override this
    fn count_tokens(&self, text: &str) -> usize {
        text.len() / 4
    }
}

/// Scripted provider for tests: returns canned responses in order.
pub mod mock {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    pub struct MockProvider {
        responses: Vec<String>,
        call_count: AtomicUsize,
    }

    impl MockProvider {
        pub fn new(responses: Vec<String>) -> Self {
            Self {
                responses,
                call_count: AtomicUsize::new(0),
            }
        }

        /// Script a sequence of `action:` responses wrapped in action fences
        pub fn scripted(actions: &[&str]) -> Self {
            Self::new(actions.iter().map(|a| format!("```action\n{}\n```", a)).collect())
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmProvider for MockProvider {
        async fn generate(&self, _prompt: &str, _max_tokens: u32) -> Result<Completion, LlmError> {
            let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
            self.responses
                .get(idx)
                .cloned()
                .map(Completion::text)
                .ok_or_else(|| LlmError::InvalidResponse("No more scripted responses".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockProvider;
    use super::*;

    #[tokio::test]
    async fn test_mock_returns_responses_in_order() {
        let provider = MockProvider::new(vec!["first".into(), "second".into()]);

        let r1 = provider.generate("prompt", 1000).await.unwrap();
        assert_eq!(r1.text, "first");
        let r2 = provider.generate("prompt", 1000).await.unwrap();
        assert_eq!(r2.text, "second");
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_errors_when_exhausted() {
        let provider = MockProvider::new(vec![]);
        assert!(provider.generate("prompt", 1000).await.is_err());
    }

    #[test]
    fn test_default_token_estimate() {
        let provider = MockProvider::new(vec![]);
        assert_eq!(provider.count_tokens("x".repeat(400).as_str()), 100);
    }
}

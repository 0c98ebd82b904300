//! Test-only mock LLM provider.

use std::sync::{Arc, Mutex, PoisonError};

use crate::error::LlmError;
use crate::provider::{BoxFuture, ChatResponse, CompletionRequest, LlmProvider};

#[derive(Debug, Clone)]
pub struct MockProvider {
    name: String,
    responses: Arc<Mutex<Vec<ChatResponse>>>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
    pub default_response: String,
    pub fail_chat: bool,
    /// Milliseconds to sleep before returning a response.
    pub delay_ms: u64,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            name: "mock".into(),
            responses: Arc::new(Mutex::new(Vec::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
            default_response: "mock response".into(),
            fail_chat: false,
            delay_ms: 0,
        }
    }
}

impl MockProvider {
    /// Responses are returned in order; once exhausted, `default_response` is used.
    #[must_use]
    pub fn with_responses(responses: Vec<ChatResponse>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail_chat: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_delay(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    /// Every request seen so far, in call order.
    #[must_use]
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> BoxFuture<'a, Result<ChatResponse, LlmError>> {
        Box::pin(async move {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request.clone());
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail_chat {
                return Err(LlmError::Other("mock LLM error".into()));
            }
            let mut responses = self
                .responses
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if responses.is_empty() {
                Ok(ChatResponse::text(self.default_response.clone()))
            } else {
                Ok(responses.remove(0))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Message;

    fn req() -> CompletionRequest {
        CompletionRequest::new("m", vec![Message::user("hi")])
    }

    #[tokio::test]
    async fn scripted_then_default() {
        let mock = MockProvider::with_responses(vec![ChatResponse::text("first")]);
        assert_eq!(mock.complete(&req()).await.unwrap().text, "first");
        assert_eq!(mock.complete(&req()).await.unwrap().text, "mock response");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn failing_records_request() {
        let mock = MockProvider::failing().with_name("broken");
        assert!(mock.complete(&req()).await.is_err());
        assert_eq!(mock.requests()[0].model, "m");
        assert_eq!(mock.name(), "broken");
    }
}

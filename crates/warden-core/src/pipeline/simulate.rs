use std::sync::Arc;

use warden_llm::{CompletionRequest, Message, ProviderRouter};
use warden_tools::{BoxFuture, Simulator, ToolError};

const SIMULATION_MAX_TOKENS: u32 = 512;

const SIMULATION_SYSTEM: &str = "You review tool calls before an autonomous agent runs them. \
Deny anything whose effect cannot be undone unless the request clearly asks for it.";

/// Answers simulation prompts with a completion on the agent's own model chain.
pub struct RouterSimulator {
    router: Arc<ProviderRouter>,
    model: String,
    fallbacks: Vec<String>,
}

impl RouterSimulator {
    #[must_use]
    pub fn new(router: Arc<ProviderRouter>, model: impl Into<String>, fallbacks: Vec<String>) -> Self {
        Self {
            router,
            model: model.into(),
            fallbacks,
        }
    }
}

impl Simulator for RouterSimulator {
    fn simulate<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String, ToolError>> {
        Box::pin(async move {
            let mut request = CompletionRequest::new(self.model.clone(), vec![Message::user(prompt)]);
            request.system = Some(SIMULATION_SYSTEM.to_owned());
            request.max_tokens = SIMULATION_MAX_TOKENS;
            let response = self
                .router
                .complete_with_failover(&request, &self.fallbacks)
                .await
                .map_err(|e| ToolError::other(format!("simulation call failed: {e}")))?;
            Ok(response.text)
        })
    }
}

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::error::LlmError;
use crate::provider::{ChatResponse, CompletionRequest, LlmProvider};

/// Model-name prefixes accepted by the fallback heuristic when no provider
/// lists the model explicitly. Such models route to the first registered provider.
const KNOWN_FAMILY_PREFIXES: &[&str] = &[
    "claude-", "gpt-", "o1", "o3", "o4", "gemini-", "llama", "mistral", "qwen", "deepseek",
];

pub struct ProviderEntry {
    pub name: String,
    pub provider: Arc<dyn LlmProvider>,
    pub models: HashSet<String>,
}

impl fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("name", &self.name)
            .field("provider", &self.provider.name())
            .field("models", &self.models)
            .finish()
    }
}

/// Ordered provider registry. Populated once at startup, read-only afterwards.
#[derive(Debug, Default)]
pub struct ProviderRouter {
    entries: Vec<ProviderEntry>,
}

impl ProviderRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<I, S>(&mut self, name: impl Into<String>, provider: Arc<dyn LlmProvider>, models: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry = ProviderEntry {
            name: name.into(),
            provider,
            models: models.into_iter().map(Into::into).collect(),
        };
        tracing::debug!(provider = %entry.name, models = entry.models.len(), "provider registered");
        self.entries.push(entry);
    }

    #[must_use]
    pub fn entries(&self) -> &[ProviderEntry] {
        &self.entries
    }

    /// Find the provider serving `model`.
    ///
    /// # Errors
    ///
    /// Returns `LlmError::NoProvider` when neither an exact model match nor the
    /// family-prefix fallback applies.
    pub fn resolve(&self, model: &str) -> Result<&ProviderEntry, LlmError> {
        if let Some(entry) = self.entries.iter().find(|e| e.models.contains(model)) {
            return Ok(entry);
        }
        let lower = model.to_lowercase();
        if KNOWN_FAMILY_PREFIXES.iter().any(|p| lower.starts_with(p))
            && let Some(first) = self.entries.first()
        {
            return Ok(first);
        }
        Err(LlmError::NoProvider {
            model: model.to_owned(),
        })
    }

    /// Run one completion against the provider resolved for `request.model`.
    ///
    /// # Errors
    ///
    /// Returns resolution failures and provider errors unchanged.
    pub async fn complete(&self, request: &CompletionRequest) -> Result<ChatResponse, LlmError> {
        let entry = self.resolve(&request.model)?;
        entry.provider.complete(request).await
    }

    /// Try the primary model, then each fallback model in order, re-resolving a
    /// provider per model.
    ///
    /// # Errors
    ///
    /// Returns the primary model's error when every fallback also fails.
    pub async fn complete_with_failover(
        &self,
        request: &CompletionRequest,
        fallbacks: &[String],
    ) -> Result<ChatResponse, LlmError> {
        let primary_err = match self.complete(request).await {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };
        if fallbacks.is_empty() {
            return Err(primary_err);
        }
        tracing::warn!(model = %request.model, error = %primary_err, "primary model failed, trying fallbacks");

        for model in fallbacks {
            match self.complete(&request.for_model(model)).await {
                Ok(response) => {
                    tracing::info!(model = %model, "fallback model succeeded");
                    return Ok(response);
                }
                Err(e) => {
                    tracing::warn!(model = %model, error = %e, "fallback model failed");
                }
            }
        }
        Err(primary_err)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::provider::{BoxFuture, Message};

    /// Succeeds or fails per model name; records the models it was asked for.
    struct ScriptedProvider {
        label: &'static str,
        failing: Vec<&'static str>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(label: &'static str, failing: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                label,
                failing,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            self.label
        }

        fn complete<'a>(
            &'a self,
            request: &'a CompletionRequest,
        ) -> BoxFuture<'a, Result<ChatResponse, LlmError>> {
            Box::pin(async move {
                self.seen.lock().unwrap().push(request.model.clone());
                if self.failing.contains(&request.model.as_str()) {
                    Err(LlmError::Other(format!("{} failed", request.model)))
                } else {
                    Ok(ChatResponse::text(format!("{}:{}", self.label, request.model)))
                }
            })
        }
    }

    fn request(model: &str) -> CompletionRequest {
        CompletionRequest::new(model, vec![Message::user("hi")])
    }

    #[test]
    fn resolve_exact_match() {
        let mut router = ProviderRouter::new();
        router.register("a", ScriptedProvider::new("a", vec![]), ["m1"]);
        router.register("b", ScriptedProvider::new("b", vec![]), ["m2"]);
        assert_eq!(router.resolve("m2").unwrap().name, "b");
    }

    #[test]
    fn resolve_family_prefix_routes_to_first() {
        let mut router = ProviderRouter::new();
        router.register("a", ScriptedProvider::new("a", vec![]), ["m1"]);
        router.register("b", ScriptedProvider::new("b", vec![]), ["m2"]);
        assert_eq!(router.resolve("claude-unlisted").unwrap().name, "a");
        assert_eq!(router.resolve("GPT-5").unwrap().name, "a");
    }

    #[test]
    fn resolve_unknown_is_no_provider() {
        let mut router = ProviderRouter::new();
        router.register("a", ScriptedProvider::new("a", vec![]), ["m1"]);
        let err = router.resolve("mystery-model").unwrap_err();
        assert!(matches!(err, LlmError::NoProvider { ref model } if model == "mystery-model"));
    }

    #[test]
    fn empty_router_has_no_provider_even_for_known_family() {
        let router = ProviderRouter::new();
        assert!(matches!(
            router.resolve("claude-x"),
            Err(LlmError::NoProvider { .. })
        ));
    }

    #[tokio::test]
    async fn failover_returns_second_fallback_result() {
        let provider = ScriptedProvider::new("p", vec!["primary", "fb1"]);
        let mut router = ProviderRouter::new();
        router.register("p", provider.clone(), ["primary", "fb1", "fb2"]);

        let resp = router
            .complete_with_failover(&request("primary"), &["fb1".into(), "fb2".into()])
            .await
            .unwrap();
        assert_eq!(resp.text, "p:fb2");
        assert_eq!(
            *provider.seen.lock().unwrap(),
            vec!["primary".to_owned(), "fb1".into(), "fb2".into()]
        );
    }

    #[tokio::test]
    async fn failover_exhausted_returns_primary_error() {
        let provider = ScriptedProvider::new("p", vec!["primary", "fb1", "fb2"]);
        let mut router = ProviderRouter::new();
        router.register("p", provider, ["primary", "fb1", "fb2"]);

        let err = router
            .complete_with_failover(&request("primary"), &["fb1".into(), "fb2".into()])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "primary failed");
    }

    #[tokio::test]
    async fn failover_reresolves_provider_per_model() {
        let mut router = ProviderRouter::new();
        router.register("a", ScriptedProvider::new("a", vec!["m1"]), ["m1"]);
        router.register("b", ScriptedProvider::new("b", vec![]), ["m2"]);

        let resp = router
            .complete_with_failover(&request("m1"), &["m2".into()])
            .await
            .unwrap();
        assert_eq!(resp.text, "b:m2");
    }

    #[tokio::test]
    async fn unresolvable_primary_falls_over() {
        let mut router = ProviderRouter::new();
        router.register("b", ScriptedProvider::new("b", vec![]), ["m2"]);

        let resp = router
            .complete_with_failover(&request("unknown"), &["m2".into()])
            .await
            .unwrap();
        assert_eq!(resp.text, "b:m2");
    }

    #[test]
    fn entry_debug_shows_provider_name() {
        let mut router = ProviderRouter::new();
        router.register("a", ScriptedProvider::new("alpha", vec![]), ["m1"]);
        let debug = format!("{:?}", router.entries()[0]);
        assert!(debug.contains("alpha"));
    }
}

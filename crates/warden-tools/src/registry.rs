use std::sync::Arc;

use serde_json::Value;
use warden_llm::ToolDefinition;

use crate::batch::ParallelPolicy;
use crate::executor::{Tool, ToolCall, ToolContext, ToolError};

/// Static description of a tool: its model-facing contract plus scheduling policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub parallel: ParallelPolicy,
}

impl ToolDef {
    /// Build a definition whose input schema is derived from `T`.
    #[must_use]
    pub fn new<T: schemars::JsonSchema>(
        name: impl Into<String>,
        description: impl Into<String>,
        parallel: ParallelPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: serde_json::to_value(schemars::schema_for!(T)).unwrap_or_default(),
            parallel,
        }
    }

    #[must_use]
    pub fn with_schema(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        parallel: ParallelPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            parallel,
        }
    }

    #[must_use]
    pub fn required_fields(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.input_schema.clone(),
        }
    }
}

struct Entry {
    def: ToolDef,
    tool: Arc<dyn Tool>,
}

/// Name-indexed tool table. Registration order is preserved for prompt listing.
#[derive(Default)]
pub struct ToolRegistry {
    entries: Vec<Entry>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool, replacing any earlier tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let def = tool.definition();
        if let Some(pos) = self.entries.iter().position(|e| e.def.name == def.name) {
            tracing::warn!(tool = %def.name, "replacing previously registered tool");
            self.entries.remove(pos);
        }
        tracing::debug!(tool = %def.name, "tool registered");
        self.entries.push(Entry { def, tool });
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.entries
            .iter()
            .find(|e| e.def.name == name)
            .map(|e| Arc::clone(&e.tool))
    }

    #[must_use]
    pub fn def(&self, name: &str) -> Option<&ToolDef> {
        self.entries.iter().find(|e| e.def.name == name).map(|e| &e.def)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.def.name.as_str()).collect()
    }

    /// Model-facing definitions in registration order.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.entries.iter().map(|e| e.def.to_definition()).collect()
    }

    /// Scheduling policy; unknown tools are treated as `Never`.
    #[must_use]
    pub fn parallel_policy(&self, name: &str) -> ParallelPolicy {
        self.def(name).map_or(ParallelPolicy::NEVER, |d| d.parallel)
    }

    /// Validate `call.input` against the declared required fields and run the tool.
    ///
    /// # Errors
    ///
    /// Returns `ToolError::UnknownTool`, `ToolError::InvalidParams`, or the tool's own error.
    pub async fn dispatch(&self, call: &ToolCall, ctx: &ToolContext) -> Result<String, ToolError> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.def.name == call.name)
            .ok_or_else(|| ToolError::UnknownTool {
                name: call.name.clone(),
            })?;

        let Some(obj) = call.input.as_object() else {
            return Err(ToolError::InvalidParams {
                message: format!("input for `{}` must be a JSON object", call.name),
            });
        };
        let missing: Vec<&str> = entry
            .def
            .required_fields()
            .into_iter()
            .filter(|f| obj.get(*f).is_none_or(Value::is_null))
            .collect();
        if !missing.is_empty() {
            return Err(ToolError::InvalidParams {
                message: format!(
                    "`{}` missing required field(s): {}",
                    call.name,
                    missing.join(", ")
                ),
            });
        }

        entry.tool.execute(&call.input, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use schemars::JsonSchema;
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::executor::BoxFuture;

    #[derive(Deserialize, JsonSchema)]
    #[allow(dead_code)]
    struct EchoParams {
        text: String,
        #[serde(default)]
        repeat: Option<u32>,
    }

    struct Echo;

    impl Tool for Echo {
        fn definition(&self) -> ToolDef {
            ToolDef::new::<EchoParams>("echo", "Echo text back.", ParallelPolicy::ALWAYS)
        }

        fn execute<'a>(
            &'a self,
            input: &'a Value,
            _ctx: &'a ToolContext,
        ) -> BoxFuture<'a, Result<String, ToolError>> {
            Box::pin(async move { Ok(input["text"].as_str().unwrap_or_default().to_owned()) })
        }
    }

    fn ctx() -> ToolContext {
        ToolContext::new("a", "s", "/w")
    }

    #[test]
    fn schema_lists_required_fields() {
        let def = Echo.definition();
        assert_eq!(def.required_fields(), vec!["text"]);
        assert_eq!(def.input_schema["type"], "object");
    }

    #[tokio::test]
    async fn dispatch_runs_registered_tool() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Echo));
        let out = reg
            .dispatch(&ToolCall::new("1", "echo", json!({"text": "hi"})), &ctx())
            .await
            .unwrap();
        assert_eq!(out, "hi");
    }

    #[tokio::test]
    async fn dispatch_unknown_tool() {
        let reg = ToolRegistry::new();
        let err = reg
            .dispatch(&ToolCall::new("1", "nope", json!({})), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool { ref name } if name == "nope"));
    }

    #[tokio::test]
    async fn dispatch_missing_required_field() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Echo));
        let err = reg
            .dispatch(&ToolCall::new("1", "echo", json!({"repeat": 2})), &ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("text"));
        let err = reg
            .dispatch(&ToolCall::new("1", "echo", json!("text")), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams { .. }));
    }

    #[test]
    fn unknown_tool_policy_is_never() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Echo));
        assert_eq!(reg.parallel_policy("echo"), ParallelPolicy::ALWAYS);
        assert_eq!(reg.parallel_policy("ghost"), ParallelPolicy::NEVER);
    }

    #[test]
    fn register_replaces_same_name() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Echo));
        reg.register(Arc::new(Echo));
        assert_eq!(reg.names(), vec!["echo"]);
        assert_eq!(reg.definitions()[0].name, "echo");
    }
}

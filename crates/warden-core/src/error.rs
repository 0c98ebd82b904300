#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("unknown agent `{agent_id}`")]
    UnknownAgent { agent_id: String },

    #[error(transparent)]
    Llm(#[from] warden_llm::LlmError),

    #[error(transparent)]
    Store(#[from] warden_store::StoreError),

    #[error(transparent)]
    Tool(#[from] warden_tools::ToolError),

    #[error(transparent)]
    Audit(#[from] warden_tools::AuditError),

    #[error("agent `{agent_id}` cannot address itself")]
    SelfAddressed { agent_id: String },

    #[error("agent `{to}` did not answer within {timeout_ms}ms")]
    AskTimeout { to: String, timeout_ms: u64 },

    #[error("no turn dispatcher attached to the agent bus")]
    DispatcherUnavailable,

    #[error("{0}")]
    Other(String),
}

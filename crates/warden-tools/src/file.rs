//! Workspace file tools: `read`, `list`, `write`.

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::batch::ParallelPolicy;
use crate::executor::{BoxFuture, Tool, ToolContext, ToolError, deserialize_params};
use crate::path_guard::safe_path;
use crate::registry::ToolDef;

const MAX_LIST_ENTRIES: usize = 1_000;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReadParams {
    /// File path relative to the workspace.
    pub path: String,
    /// First line to return (1-based).
    #[serde(default)]
    pub offset: Option<usize>,
    /// Maximum number of lines to return.
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Default)]
pub struct ReadTool;

impl ReadTool {
    async fn run(params: ReadParams, ctx: &ToolContext) -> Result<String, ToolError> {
        let path = safe_path(&ctx.workspace, &params.path, &ctx.extra_roots)?;
        let content = tokio::fs::read_to_string(&path).await?;
        if params.offset.is_none() && params.limit.is_none() {
            return Ok(content);
        }
        let skip = params.offset.unwrap_or(1).saturating_sub(1);
        let take = params.limit.unwrap_or(usize::MAX);
        Ok(content
            .lines()
            .skip(skip)
            .take(take)
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

impl Tool for ReadTool {
    fn definition(&self) -> ToolDef {
        ToolDef::new::<ReadParams>(
            "read",
            "Read a text file from the workspace, optionally a line range.",
            ParallelPolicy::ALWAYS,
        )
    }

    fn execute<'a>(
        &'a self,
        input: &'a Value,
        ctx: &'a ToolContext,
    ) -> BoxFuture<'a, Result<String, ToolError>> {
        Box::pin(async move { Self::run(deserialize_params(input)?, ctx).await })
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListParams {
    /// Directory relative to the workspace. Defaults to the workspace root.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Default)]
pub struct ListTool;

impl ListTool {
    async fn run(params: ListParams, ctx: &ToolContext) -> Result<String, ToolError> {
        let dir = safe_path(
            &ctx.workspace,
            params.path.as_deref().unwrap_or("."),
            &ctx.extra_roots,
        )?;
        let mut reader = tokio::fs::read_dir(&dir).await?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await?.is_dir() {
                name.push('/');
            }
            entries.push(name);
            if entries.len() >= MAX_LIST_ENTRIES {
                break;
            }
        }
        entries.sort();
        if entries.is_empty() {
            return Ok("(empty directory)".to_owned());
        }
        Ok(entries.join("\n"))
    }
}

impl Tool for ListTool {
    fn definition(&self) -> ToolDef {
        ToolDef::new::<ListParams>(
            "list",
            "List entries of a workspace directory. Directories end with `/`.",
            ParallelPolicy::ALWAYS,
        )
    }

    fn execute<'a>(
        &'a self,
        input: &'a Value,
        ctx: &'a ToolContext,
    ) -> BoxFuture<'a, Result<String, ToolError>> {
        Box::pin(async move { Self::run(deserialize_params(input)?, ctx).await })
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WriteParams {
    /// File path relative to the workspace. Parent directories are created.
    pub path: String,
    /// Full new file content.
    pub content: String,
}

#[derive(Debug, Default)]
pub struct WriteTool;

impl WriteTool {
    async fn run(params: WriteParams, ctx: &ToolContext) -> Result<String, ToolError> {
        let path = safe_path(&ctx.workspace, &params.path, &ctx.extra_roots)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, params.content.as_bytes()).await?;
        tracing::debug!(agent = %ctx.agent_id, path = %path.display(), "file written");
        Ok(format!(
            "wrote {} bytes to {}",
            params.content.len(),
            params.path
        ))
    }
}

impl Tool for WriteTool {
    fn definition(&self) -> ToolDef {
        ToolDef::new::<WriteParams>(
            "write",
            "Create or overwrite a workspace file.",
            ParallelPolicy::conditional("path"),
        )
    }

    fn execute<'a>(
        &'a self,
        input: &'a Value,
        ctx: &'a ToolContext,
    ) -> BoxFuture<'a, Result<String, ToolError>> {
        Box::pin(async move { Self::run(deserialize_params(input)?, ctx).await })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn ctx(dir: &tempfile::TempDir) -> ToolContext {
        ToolContext::new("agent", "session", dir.path())
    }

    #[tokio::test]
    async fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir);
        let msg = WriteTool
            .execute(&json!({"path": "sub/a.txt", "content": "one\ntwo\nthree"}), &ctx)
            .await
            .unwrap();
        assert_eq!(msg, "wrote 13 bytes to sub/a.txt");

        let all = ReadTool
            .execute(&json!({"path": "sub/a.txt"}), &ctx)
            .await
            .unwrap();
        assert_eq!(all, "one\ntwo\nthree");

        let slice = ReadTool
            .execute(&json!({"path": "sub/a.txt", "offset": 2, "limit": 1}), &ctx)
            .await
            .unwrap();
        assert_eq!(slice, "two");
    }

    #[tokio::test]
    async fn read_outside_workspace_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = ReadTool
            .execute(&json!({"path": "../../etc/passwd"}), &ctx(&dir))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::PathOutsideWorkspace { .. }));
    }

    #[tokio::test]
    async fn write_outside_workspace_never_touches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let inner = dir.path().join("ws");
        std::fs::create_dir(&inner).unwrap();
        let ctx = ToolContext::new("a", "s", &inner);
        let err = WriteTool
            .execute(&json!({"path": "../escaped.txt", "content": "x"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::PathOutsideWorkspace { .. }));
        assert!(!dir.path().join("escaped.txt").exists());
    }

    #[tokio::test]
    async fn list_marks_directories_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        let out = ListTool.execute(&json!({}), &ctx(&dir)).await.unwrap();
        assert_eq!(out, "a/\nb.txt");
    }

    #[tokio::test]
    async fn list_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = ListTool
            .execute(&json!({"path": "."}), &ctx(&dir))
            .await
            .unwrap();
        assert_eq!(out, "(empty directory)");
    }

    #[test]
    fn write_is_conditional_on_path() {
        assert_eq!(
            WriteTool.definition().parallel,
            ParallelPolicy::conditional("path")
        );
        assert_eq!(ReadTool.definition().parallel, ParallelPolicy::ALWAYS);
    }
}

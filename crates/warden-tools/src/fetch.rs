use std::time::Duration;

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::batch::ParallelPolicy;
use crate::config::FetchConfig;
use crate::executor::{BoxFuture, Tool, ToolContext, ToolError, deserialize_params};
use crate::network::{NetworkGuard, ResolvedUrl};
use crate::registry::ToolDef;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FetchParams {
    /// Absolute http(s) URL to fetch.
    pub url: String,
}

/// `web_fetch`: GET a public URL. Redirects are not followed so a public host
/// cannot bounce the request onto a private address, and each request connects
/// only to the addresses the guard vetted.
#[derive(Debug)]
pub struct WebFetchTool {
    guard: NetworkGuard,
    timeout: Duration,
    max_body_bytes: usize,
}

impl WebFetchTool {
    #[must_use]
    pub fn new(config: &FetchConfig) -> Self {
        Self {
            guard: NetworkGuard::new(),
            timeout: Duration::from_secs(config.timeout_secs),
            max_body_bytes: config.max_body_bytes,
        }
    }

    /// Client whose DNS for the checked host is pinned to the vetted addresses.
    fn client_for(&self, target: &ResolvedUrl) -> Result<reqwest::Client, ToolError> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .user_agent(concat!("warden/", env!("CARGO_PKG_VERSION")));
        if let Some(domain) = target.domain() {
            builder = builder.resolve_to_addrs(domain, &target.addrs);
        }
        builder
            .build()
            .map_err(|e| ToolError::other(format!("http client: {e}")))
    }

    async fn fetch(&self, raw: &str) -> Result<String, ToolError> {
        let target = self.guard.resolve(raw).await?;
        self.fetch_resolved(&target).await
    }

    async fn fetch_resolved(&self, target: &ResolvedUrl) -> Result<String, ToolError> {
        let resp = self
            .client_for(target)?
            .get(target.url.clone())
            .send()
            .await
            .map_err(|e| ToolError::other(e.to_string()))?;

        let status = resp.status();
        if status.is_redirection() {
            let location = resp
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            return Ok(format!("HTTP {status}: redirect to {location} (not followed)"));
        }
        if !status.is_success() {
            return Err(ToolError::other(format!("HTTP {status}")));
        }
        if let Some(len) = resp.content_length()
            && usize::try_from(len).unwrap_or(usize::MAX) > self.max_body_bytes
        {
            return Err(ToolError::other(format!(
                "response too large: {len} bytes (max: {})",
                self.max_body_bytes
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ToolError::other(e.to_string()))?;
        if bytes.len() > self.max_body_bytes {
            return Err(ToolError::other(format!(
                "response too large: {} bytes (max: {})",
                bytes.len(),
                self.max_body_bytes
            )));
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl Tool for WebFetchTool {
    fn definition(&self) -> ToolDef {
        ToolDef::new::<FetchParams>(
            "web_fetch",
            "Fetch the body of a public web page over http(s).",
            ParallelPolicy::ALWAYS,
        )
    }

    fn execute<'a>(
        &'a self,
        input: &'a Value,
        _ctx: &'a ToolContext,
    ) -> BoxFuture<'a, Result<String, ToolError>> {
        Box::pin(async move {
            let params: FetchParams = deserialize_params(input)?;
            self.fetch(&params.url).await
        })
    }
}

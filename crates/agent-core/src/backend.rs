use ai_agent::ToolResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::input::ToolInput;
use crate::page::PageContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Dom,
    Native,
}

/// Executes validated tool input against a page. Capability problems are
/// reported as failed [`ToolResult`]s; `Err` is reserved for transport faults.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn execute(
        &self,
        input: &ToolInput,
        page: &dyn PageContext,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ToolResult>;
}

/// Output of the `complete` tool, shared by both backends.
pub(crate) fn completion_result(summary: Option<&str>, data: Option<&serde_json::Value>) -> ToolResult {
    ToolResult::ok(serde_json::json!({
        "summary": summary,
        "result": data.cloned().unwrap_or(serde_json::Value::Null),
        "completed": true,
    }))
}

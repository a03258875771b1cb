use std::sync::Arc;

use ai_agent::{ToolCall, ToolExecutor, ToolName, ToolResult};
use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::ToolBackend;
use crate::driver::RpcReply;
use crate::input::ToolInput;
use crate::native::{NativeBackend, SessionState};
use crate::page::PageContext;

pub const NATIVE_HOST_ENV: &str = "BROWSING_AGENT_NATIVE";

/// Tells the dispatcher whether it runs inside the native host.
pub trait HostEnvironment: Send + Sync {
    fn is_native_host(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct StaticEnvironment {
    pub native: bool,
}

impl StaticEnvironment {
    pub fn native() -> Self {
        Self { native: true }
    }

    pub fn embedded() -> Self {
        Self { native: false }
    }
}

impl HostEnvironment for StaticEnvironment {
    fn is_native_host(&self) -> bool {
        self.native
    }
}

/// Reads the host kind from an environment variable on every call.
#[derive(Debug, Clone)]
pub struct EnvEnvironment {
    var: String,
}

impl Default for EnvEnvironment {
    fn default() -> Self {
        Self::new(NATIVE_HOST_ENV)
    }
}

impl EnvEnvironment {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl HostEnvironment for EnvEnvironment {
    fn is_native_host(&self) -> bool {
        std::env::var(&self.var)
            .map(|value| {
                let value = value.trim();
                !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false")
            })
            .unwrap_or(false)
    }
}

/// Routes each tool call to one backend and normalizes the outcome.
pub struct ToolDispatcher {
    dom: Arc<dyn ToolBackend>,
    native: Option<Arc<NativeBackend>>,
    environment: Arc<dyn HostEnvironment>,
    page: Arc<dyn PageContext>,
}

impl ToolDispatcher {
    pub fn new(
        dom: Arc<dyn ToolBackend>,
        native: Option<Arc<NativeBackend>>,
        environment: Arc<dyn HostEnvironment>,
        page: Arc<dyn PageContext>,
    ) -> Self {
        Self {
            dom,
            native,
            environment,
            page,
        }
    }

    pub fn native_backend(&self) -> Option<&Arc<NativeBackend>> {
        self.native.as_ref()
    }

    pub async fn native_session_state(&self) -> Option<SessionState> {
        match &self.native {
            Some(native) => Some(native.state().await),
            None => None,
        }
    }

    pub async fn stop_native_session(&self) -> Result<Option<RpcReply>> {
        match &self.native {
            Some(native) => native.stop().await.map(Some),
            None => Ok(None),
        }
    }

    // Decided per call, never cached.
    fn select_backend(&self) -> Result<Arc<dyn ToolBackend>, &'static str> {
        if !self.environment.is_native_host() {
            return Ok(self.dom.clone());
        }
        match &self.native {
            Some(native) => Ok(native.clone() as Arc<dyn ToolBackend>),
            None => Err("Native host detected but no native driver is configured"),
        }
    }
}

#[async_trait]
impl ToolExecutor for ToolDispatcher {
    async fn execute(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolResult {
        let Some(tool) = ToolName::parse(&call.name) else {
            return ToolResult::failure(format!("Unknown tool: {}", call.name));
        };
        let input = match ToolInput::parse(tool, &call.input) {
            Ok(input) => input,
            Err(err) => return ToolResult::failure(format!("Invalid input for {tool}: {err}")),
        };
        let backend = match self.select_backend() {
            Ok(backend) => backend,
            Err(message) => return ToolResult::failure(message),
        };

        debug!(target: "tool_dispatcher", %tool, backend = ?backend.kind(), "dispatching tool call");
        match backend.execute(&input, self.page.as_ref(), cancel).await {
            Ok(result) if result.success => result,
            Ok(result) => {
                let error = result
                    .error
                    .filter(|error| !error.trim().is_empty())
                    .unwrap_or_else(|| format!("{tool} failed"));
                ToolResult {
                    error: Some(error),
                    ..result
                }
            }
            Err(err) => {
                warn!(target: "tool_dispatcher", %tool, error = %format!("{err:#}"), "backend error");
                ToolResult::failure(format!("{err:#}"))
            }
        }
    }
}

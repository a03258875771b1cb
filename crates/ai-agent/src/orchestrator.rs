use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::language_model::{MessagesRequest, MessagesResponse, ReasoningClient, ReasoningError};
use crate::messages::{ContentBlock, Message, ToolUse};
use crate::tools::{list_tools, ToolCall, ToolDefinition, ToolExecutor, ToolName, ToolResult};

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_SUMMARY: &str = "Task completed";
const CANCELLED: &str = "run cancelled";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub model: String,
    pub max_tokens: u32,
    pub max_iterations: usize,
    pub system_prompt: String,
    /// Pause after `navigate`, `click` and `fill_form` so the page can settle.
    pub post_action_delay_ms: u64,
    /// Upper bound on a single reasoning-service call.
    pub request_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 4096,
            max_iterations: crate::DEFAULT_AGENT_MAX_ITERATIONS,
            system_prompt: DEFAULT_SYSTEM_PROMPT.trim().to_string(),
            post_action_delay_ms: 1_000,
            request_timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Thinking,
    ExecutingTools,
    Completed,
    ExhaustedIterations,
    Failed,
}

/// Lifecycle events streamed while a run progresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Thinking {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        id: String,
        name: String,
        result: ToolResult,
    },
    Completed {
        summary: String,
        data: Option<Value>,
    },
    Error {
        message: String,
    },
}

/// Optional receiver of [`AgentEvent`]s. Dropped receivers are ignored.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl EventSink {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

impl From<mpsc::UnboundedSender<AgentEvent>> for EventSink {
    fn from(tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        Self { tx: Some(tx) }
    }
}

/// Terminal output of one orchestration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRunResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub state: RunState,
    /// Reasoning-service calls made by the run.
    pub iterations: usize,
}

impl AgentRunResult {
    fn completed(summary: String, data: Option<Value>, iterations: usize) -> Self {
        Self {
            success: true,
            summary: Some(summary),
            data,
            error: None,
            state: RunState::Completed,
            iterations,
        }
    }

    fn failed(state: RunState, error: String, iterations: usize) -> Self {
        Self {
            success: false,
            summary: None,
            data: None,
            error: Some(error),
            state,
            iterations,
        }
    }
}

/// Drives the turn-based loop between the reasoning service and a tool executor.
/// Holds no per-run state, so one orchestrator may serve concurrent runs.
pub struct AgentOrchestrator {
    client: Arc<dyn ReasoningClient>,
    executor: Arc<dyn ToolExecutor>,
    config: AgentConfig,
}

impl AgentOrchestrator {
    pub fn new(
        client: Arc<dyn ReasoningClient>,
        executor: Arc<dyn ToolExecutor>,
        config: AgentConfig,
    ) -> Self {
        Self {
            client,
            executor,
            config,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn tool_definitions(&self) -> &'static [ToolDefinition] {
        list_tools()
    }

    pub async fn run(
        &self,
        task: &str,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> AgentRunResult {
        let max_iterations = self.config.max_iterations;
        let mut messages = vec![Message::user_text(task)];
        let mut state = RunState::Idle;
        debug!(target: "agent_orchestrator", ?state, max_iterations, "starting run");

        for iteration in 1..=max_iterations {
            if cancel.is_cancelled() {
                return self.fail(events, RunState::Failed, CANCELLED.into(), iteration - 1);
            }

            state = RunState::Thinking;
            debug!(target: "agent_orchestrator", ?state, iteration, messages = messages.len(), "calling reasoning service");
            let request = self.build_request(&messages, list_tools().to_vec());
            let response = match self.call_reasoning(&request, cancel).await {
                Ok(response) => response,
                Err(message) => {
                    return self.fail(events, RunState::Failed, message, iteration);
                }
            };

            let turn = Turn::partition(response.content);
            for block in &turn.blocks {
                if let Some(text) = block.as_text() {
                    events.emit(AgentEvent::Thinking {
                        text: text.to_string(),
                    });
                } else if let Some(tool_use) = ToolUse::from_block(block) {
                    events.emit(AgentEvent::ToolCall {
                        id: tool_use.id,
                        name: tool_use.name,
                        input: Value::Object(tool_use.input),
                    });
                }
            }
            messages.push(Message::assistant_blocks(turn.blocks));

            if turn.tool_uses.is_empty() {
                let summary = turn
                    .texts
                    .last()
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_SUMMARY.to_string());
                info!(target: "agent_orchestrator", iteration, "run finished with a plain answer");
                events.emit(AgentEvent::Completed {
                    summary: summary.clone(),
                    data: None,
                });
                return AgentRunResult::completed(summary, None, iteration);
            }

            if let Some(complete) = turn
                .tool_uses
                .iter()
                .find(|tool_use| tool_use.name == ToolName::Complete.as_str())
            {
                let summary = complete
                    .input
                    .get("summary")
                    .and_then(Value::as_str)
                    .filter(|summary| !summary.is_empty())
                    .unwrap_or(DEFAULT_SUMMARY)
                    .to_string();
                let data = complete.input.get("data").cloned().filter(|d| !d.is_null());
                let skipped = turn.tool_uses.len() - 1;
                if skipped > 0 {
                    debug!(target: "agent_orchestrator", skipped, "complete preempts sibling tool calls");
                }
                info!(target: "agent_orchestrator", iteration, "run completed");
                events.emit(AgentEvent::Completed {
                    summary: summary.clone(),
                    data: data.clone(),
                });
                return AgentRunResult::completed(summary, data, iteration);
            }

            state = RunState::ExecutingTools;
            debug!(target: "agent_orchestrator", ?state, calls = turn.tool_uses.len(), "executing tool calls");
            let mut results = Vec::with_capacity(turn.tool_uses.len());
            for tool_use in &turn.tool_uses {
                if cancel.is_cancelled() {
                    return self.fail(events, RunState::Failed, CANCELLED.into(), iteration);
                }
                let call = ToolCall {
                    name: tool_use.name.clone(),
                    input: tool_use.input.clone(),
                };
                let result = self.executor.execute(&call, cancel).await;
                if !result.success {
                    debug!(
                        target: "agent_orchestrator",
                        tool = %tool_use.name,
                        error = result.error_message().unwrap_or_default(),
                        "tool call failed"
                    );
                }
                events.emit(AgentEvent::ToolResult {
                    id: tool_use.id.clone(),
                    name: tool_use.name.clone(),
                    result: result.clone(),
                });
                results.push(ContentBlock::tool_result(
                    tool_use.id.clone(),
                    serialize_result(&result),
                    !result.success,
                ));

                let settles = ToolName::parse(&tool_use.name).is_some_and(|name| name.mutates_page());
                if settles && self.config.post_action_delay_ms > 0 {
                    let delay = Duration::from_millis(self.config.post_action_delay_ms);
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return self.fail(events, RunState::Failed, CANCELLED.into(), iteration);
                        }
                        _ = sleep(delay) => {}
                    }
                }
            }
            messages.push(Message::user_blocks(results));
        }

        warn!(target: "agent_orchestrator", max_iterations, "iteration limit reached");
        self.fail(
            events,
            RunState::ExhaustedIterations,
            format!("Max iterations ({max_iterations}) reached without completion"),
            max_iterations,
        )
    }

    /// Single tool-less question, optionally grounded in page content.
    pub async fn query(
        &self,
        question: &str,
        page_context: Option<&str>,
    ) -> Result<String, ReasoningError> {
        let prompt = match page_context {
            Some(context) => format!("Page content:\n{context}\n\nUser question: {question}"),
            None => question.to_string(),
        };
        let mut request = self.build_request(&[Message::user_text(prompt)], Vec::new());
        request.system = QUERY_SYSTEM_PROMPT.to_string();
        let timeout_ms = self.config.request_timeout_ms;
        let response = timeout(Duration::from_millis(timeout_ms), self.client.send(&request))
            .await
            .map_err(|_| ReasoningError::Timeout(timeout_ms))??;
        Ok(response
            .content
            .iter()
            .find_map(ContentBlock::as_text)
            .unwrap_or("No response")
            .to_string())
    }

    fn build_request(&self, messages: &[Message], tools: Vec<ToolDefinition>) -> MessagesRequest {
        MessagesRequest {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            system: self.config.system_prompt.clone(),
            tools,
            messages: messages.to_vec(),
        }
    }

    async fn call_reasoning(
        &self,
        request: &MessagesRequest,
        cancel: &CancellationToken,
    ) -> Result<MessagesResponse, String> {
        let timeout_ms = self.config.request_timeout_ms;
        tokio::select! {
            _ = cancel.cancelled() => Err(CANCELLED.to_string()),
            outcome = timeout(Duration::from_millis(timeout_ms), self.client.send(request)) => {
                match outcome {
                    Ok(Ok(response)) => Ok(response),
                    Ok(Err(err)) => Err(err.to_string()),
                    Err(_) => Err(ReasoningError::Timeout(timeout_ms).to_string()),
                }
            }
        }
    }

    fn fail(
        &self,
        events: &EventSink,
        state: RunState,
        message: String,
        iterations: usize,
    ) -> AgentRunResult {
        warn!(target: "agent_orchestrator", ?state, error = %message, "run failed");
        events.emit(AgentEvent::Error {
            message: message.clone(),
        });
        AgentRunResult::failed(state, message, iterations)
    }
}

/// Assistant turn split into what the loop needs.
struct Turn {
    blocks: Vec<ContentBlock>,
    texts: Vec<String>,
    tool_uses: Vec<ToolUse>,
}

impl Turn {
    fn partition(content: Vec<ContentBlock>) -> Self {
        let blocks: Vec<ContentBlock> = content
            .into_iter()
            .filter(|block| !matches!(block, ContentBlock::Unsupported))
            .collect();
        let texts = blocks
            .iter()
            .filter_map(ContentBlock::as_text)
            .map(str::to_string)
            .collect();
        let tool_uses = blocks.iter().filter_map(ToolUse::from_block).collect();
        Self {
            blocks,
            texts,
            tool_uses,
        }
    }
}

fn serialize_result(result: &ToolResult) -> String {
    serde_json::to_string(result).unwrap_or_else(|err| {
        format!("{{\"success\":false,\"error\":\"unserializable tool result: {err}\"}}")
    })
}

const DEFAULT_SYSTEM_PROMPT: &str = r#"
You are a browsing agent that controls a web browser to accomplish tasks for the user.

You have access to browser tools that let you navigate, extract content, click elements, fill forms, and more.

Guidelines:
1. Start by understanding what the user wants to accomplish.
2. Break complex tasks into smaller steps.
3. Use extract_text or get_page_info to understand the current page before taking actions.
4. After navigating, let the page load before extracting content.
5. Be careful with forms: verify you are on the right page before filling.
6. If something fails, try an alternative approach.
7. Call the "complete" tool when you have finished the task.
"#;

const QUERY_SYSTEM_PROMPT: &str =
    "You are a helpful browser assistant. Answer questions concisely based on the provided context.";

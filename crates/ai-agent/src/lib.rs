//! Tool-using agent loop for browser automation.
//! The crate owns the tool catalog, the conversation wire types and the
//! orchestrator that alternates between a reasoning service and a
//! [`ToolExecutor`] supplied by the host.

pub mod language_model;
pub mod messages;
pub mod orchestrator;
pub mod tools;

pub use language_model::{
    LanguageModelUsage, MessagesRequest, MessagesResponse, ReasoningClient, ReasoningError,
};
pub use messages::{ContentBlock, Message, MessageContent, Role, ToolUse};
pub use orchestrator::{
    AgentConfig, AgentEvent, AgentOrchestrator, AgentRunResult, EventSink, RunState,
    DEFAULT_MODEL,
};
pub use tools::{
    list_tools, tool_definition, ToolCall, ToolDefinition, ToolExecutor, ToolName, ToolResult,
};

pub const DEFAULT_AGENT_MAX_ITERATIONS: usize = 15;

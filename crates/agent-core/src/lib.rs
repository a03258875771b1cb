//! Tool execution for the browsing agent: page context, document
//! instrumentation, the DOM and native backends, and the dispatcher and
//! runtime that connect them to the orchestrator.

pub mod backend;
pub mod dispatcher;
pub mod dom;
pub mod dom_backend;
pub mod driver;
pub mod input;
pub mod native;
pub mod page;
pub mod query;
pub mod runtime;

pub use backend::{BackendKind, ToolBackend};
pub use dispatcher::{EnvEnvironment, HostEnvironment, StaticEnvironment, ToolDispatcher};
pub use dom::{DocumentHandle, DomAction, DomEvent, SyntheticEvent, Viewport};
pub use dom_backend::DomBackend;
pub use driver::{NativeDriver, NativeDriverConfig, RpcReply, StdioDriver};
pub use input::{ClickTarget, ScrollDirection, ToolInput, ValidationError};
pub use native::{BackendSession, NativeBackend, SessionError, SessionState};
pub use page::{MemoryPage, PageContext, TabId};
pub use query::QueryError;
pub use runtime::{AgentRuntime, AgentRuntimeBuilder};

use std::sync::{Arc, Mutex, PoisonError};

use ai_agent::{
    AgentConfig, AgentOrchestrator, AgentRunResult, EventSink, ReasoningClient, ReasoningError,
    ToolDefinition,
};
use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backend::ToolBackend;
use crate::dispatcher::{HostEnvironment, StaticEnvironment, ToolDispatcher};
use crate::dom_backend::DomBackend;
use crate::driver::NativeDriver;
use crate::native::{NativeBackend, SessionState};
use crate::page::{MemoryPage, PageContext};

/// Orchestrator wired to a dispatcher, a page context and optional native driver.
pub struct AgentRuntime {
    orchestrator: AgentOrchestrator,
    dispatcher: Arc<ToolDispatcher>,
    cancel: Mutex<CancellationToken>,
}

impl AgentRuntime {
    pub fn builder(client: Arc<dyn ReasoningClient>) -> AgentRuntimeBuilder {
        AgentRuntimeBuilder::new(client)
    }

    pub async fn run(&self, task: &str) -> AgentRunResult {
        self.run_with_events(task, EventSink::none()).await
    }

    pub async fn run_with_events(&self, task: &str, events: EventSink) -> AgentRunResult {
        let cancel = self.current_token().child_token();
        self.orchestrator.run(task, &cancel, &events).await
    }

    fn current_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Cancels every in-flight run. Runs started afterwards are unaffected.
    pub fn stop(&self) {
        let mut guard = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        guard.cancel();
        *guard = CancellationToken::new();
        info!(target: "agent_orchestrator", "in-flight runs cancelled");
    }

    /// Cancels runs and stops the native session if one is live.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop();
        self.dispatcher.stop_native_session().await?;
        Ok(())
    }

    pub async fn query(
        &self,
        question: &str,
        page_context: Option<&str>,
    ) -> Result<String, ReasoningError> {
        self.orchestrator.query(question, page_context).await
    }

    pub fn tool_definitions(&self) -> &'static [ToolDefinition] {
        self.orchestrator.tool_definitions()
    }

    pub fn config(&self) -> &AgentConfig {
        self.orchestrator.config()
    }

    pub async fn native_session_state(&self) -> Option<SessionState> {
        self.dispatcher.native_session_state().await
    }

    pub fn dispatcher(&self) -> &Arc<ToolDispatcher> {
        &self.dispatcher
    }
}

pub struct AgentRuntimeBuilder {
    client: Arc<dyn ReasoningClient>,
    config: AgentConfig,
    page: Option<Arc<dyn PageContext>>,
    dom: Option<Arc<dyn ToolBackend>>,
    native: Option<(Arc<dyn NativeDriver>, bool)>,
    environment: Option<Arc<dyn HostEnvironment>>,
}

impl AgentRuntimeBuilder {
    fn new(client: Arc<dyn ReasoningClient>) -> Self {
        Self {
            client,
            config: AgentConfig::default(),
            page: None,
            dom: None,
            native: None,
            environment: None,
        }
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_page_context(mut self, page: Arc<dyn PageContext>) -> Self {
        self.page = Some(page);
        self
    }

    pub fn with_dom_backend(mut self, backend: Arc<dyn ToolBackend>) -> Self {
        self.dom = Some(backend);
        self
    }

    pub fn with_native_driver(mut self, driver: Arc<dyn NativeDriver>, headless: bool) -> Self {
        self.native = Some((driver, headless));
        self
    }

    /// Overrides host detection. Defaults to native whenever a driver is set.
    pub fn with_environment(mut self, environment: Arc<dyn HostEnvironment>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn build(self) -> AgentRuntime {
        let environment = self.environment.unwrap_or_else(|| {
            Arc::new(StaticEnvironment {
                native: self.native.is_some(),
            })
        });
        let native = self
            .native
            .map(|(driver, headless)| Arc::new(NativeBackend::new(driver, headless)));
        let dom = self
            .dom
            .unwrap_or_else(|| Arc::new(DomBackend::new()));
        let page = self
            .page
            .unwrap_or_else(|| Arc::new(MemoryPage::new()));

        let dispatcher = Arc::new(ToolDispatcher::new(dom, native, environment, page));
        let orchestrator = AgentOrchestrator::new(self.client, dispatcher.clone(), self.config);
        AgentRuntime {
            orchestrator,
            dispatcher,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }
}

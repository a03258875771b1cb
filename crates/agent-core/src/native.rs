use std::sync::Arc;
use std::time::Duration;

use ai_agent::ToolResult;
use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{completion_result, BackendKind, ToolBackend};
use crate::driver::{NativeDriver, RpcReply};
use crate::input::{search_url, ClickTarget, ScrollDirection, ToolInput, DEFAULT_WAIT_TIMEOUT_MS};
use crate::page::PageContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    NotStarted,
    Starting,
    Running,
    Stopped,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0}")]
    Rejected(String),
    #[error("native driver unavailable: {0:#}")]
    Transport(anyhow::Error),
}

/// Extra read time granted to `agent_wait` beyond its own timeout.
const WAIT_REPLY_MARGIN: Duration = Duration::from_secs(5);

/// Lifecycle of the native browser session. `start` is idempotent and legal
/// from `NotStarted` or `Stopped`; `stop` is always legal. A session lives in
/// one driver process: when the driver reports a new generation, the session
/// falls back to `NotStarted`.
#[derive(Debug)]
pub struct BackendSession {
    state: SessionState,
    generation: u64,
}

impl Default for BackendSession {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::NotStarted,
            generation: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Forgets a live session whose driver process has since been replaced.
    pub fn observe(&mut self, driver: &dyn NativeDriver) -> SessionState {
        let live = matches!(self.state, SessionState::Running | SessionState::Starting);
        if live && driver.generation() != self.generation {
            warn!(
                target: "native_backend",
                generation = driver.generation(),
                "native driver restarted, session must start again"
            );
            self.state = SessionState::NotStarted;
        }
        self.state
    }

    pub async fn start(
        &mut self,
        driver: &dyn NativeDriver,
        headless: bool,
    ) -> Result<(), SessionError> {
        if self.observe(driver) == SessionState::Running {
            return Ok(());
        }
        let previous = self.state;
        self.state = SessionState::Starting;
        debug!(target: "native_backend", headless, "starting native session");
        match driver.call("agent_start", json!({ "headless": headless })).await {
            Ok(reply) if reply.success => {
                self.state = SessionState::Running;
                self.generation = driver.generation();
                info!(target: "native_backend", "native session running");
                Ok(())
            }
            Ok(reply) => {
                self.state = previous;
                let message = reply
                    .error
                    .filter(|error| !error.is_empty())
                    .unwrap_or_else(|| "Failed to start agent".to_string());
                Err(SessionError::Rejected(message))
            }
            Err(err) => {
                self.state = previous;
                Err(SessionError::Transport(err))
            }
        }
    }

    /// Calls `agent_stop` when a session is live and marks it stopped.
    pub async fn stop(&mut self, driver: &dyn NativeDriver) -> Result<RpcReply> {
        if !matches!(
            self.observe(driver),
            SessionState::Running | SessionState::Starting
        ) {
            return Ok(RpcReply::ok(json!({ "stopped": false })));
        }
        let reply = driver.call("agent_stop", json!({})).await;
        self.state = SessionState::Stopped;
        info!(target: "native_backend", "native session stopped");
        reply
    }
}

/// Delegates tools to an out-of-process browser through [`NativeDriver`].
/// The session lock is held for a whole call, so concurrent runs take turns.
pub struct NativeBackend {
    driver: Arc<dyn NativeDriver>,
    session: Mutex<BackendSession>,
    headless: bool,
}

impl NativeBackend {
    pub fn new(driver: Arc<dyn NativeDriver>, headless: bool) -> Self {
        Self {
            driver,
            session: Mutex::new(BackendSession::new()),
            headless,
        }
    }

    pub async fn state(&self) -> SessionState {
        self.session.lock().await.observe(self.driver.as_ref())
    }

    pub async fn ensure_started(&self) -> Result<(), SessionError> {
        self.session
            .lock()
            .await
            .start(self.driver.as_ref(), self.headless)
            .await
    }

    pub async fn stop(&self) -> Result<RpcReply> {
        self.session.lock().await.stop(self.driver.as_ref()).await
    }

    /// Fetches a URL through the driver without touching the live page.
    pub async fn fetch_page(&self, url: &str) -> Result<ToolResult> {
        let reply = self
            .driver
            .call("agent_fetch_page", json!({ "url": url }))
            .await?;
        Ok(into_result(reply))
    }

    pub async fn evaluate_js(&self, script: &str) -> Result<ToolResult> {
        let mut session = self.session.lock().await;
        if let Err(err) = session.start(self.driver.as_ref(), self.headless).await {
            return start_failure(err);
        }
        let reply = self
            .driver
            .call("agent_evaluate_js", json!({ "script": script }))
            .await?;
        Ok(into_result(reply))
    }

    async fn call(
        &self,
        method: &str,
        params: Value,
        budget: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<RpcReply> {
        let reply = async {
            match budget {
                Some(budget) => self.driver.call_with_budget(method, params, budget).await,
                None => self.driver.call(method, params).await,
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => Ok(RpcReply::failure("tool call cancelled")),
            reply = reply => reply,
        }
    }
}

#[async_trait]
impl ToolBackend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    async fn execute(
        &self,
        input: &ToolInput,
        _page: &dyn PageContext,
        cancel: &CancellationToken,
    ) -> Result<ToolResult> {
        if let ToolInput::Complete { summary, data } = input {
            return Ok(completion_result(summary.as_deref(), data.as_ref()));
        }

        let mut session = self.session.lock().await;
        if let Err(err) = session.start(self.driver.as_ref(), self.headless).await {
            return start_failure(err);
        }

        let result = match input {
            ToolInput::SearchGoogle { query } => {
                let url = search_url(query);
                let reply = self
                    .call("agent_navigate", json!({ "url": url }), None, cancel)
                    .await?;
                with_error(
                    reply.success,
                    json!({ "searched": query, "url": url, "navigated": reply.data }),
                    reply.error,
                )
            }
            ToolInput::OpenTab { url: Some(url) } => {
                let reply = self
                    .call("agent_navigate", json!({ "url": url }), None, cancel)
                    .await?;
                with_error(
                    reply.success,
                    json!({ "url": url, "navigated": reply.data }),
                    reply.error,
                )
            }
            ToolInput::OpenTab { url: None } => ToolResult::ok(json!({ "note": "New tab opened" })),
            // One browser instance per session: closing the tab ends the session.
            ToolInput::CloseTab => into_result(session.stop(self.driver.as_ref()).await?),
            other => {
                let Some((method, params)) = rpc_request(other) else {
                    return Ok(ToolResult::failure(format!(
                        "{} has no native procedure",
                        other.tool()
                    )));
                };
                let reply = self.call(method, params, reply_budget(other), cancel).await?;
                match other {
                    ToolInput::Screenshot { .. } => lift_screenshot(into_result(reply)),
                    _ => into_result(reply),
                }
            }
        };
        Ok(result)
    }
}

fn start_failure(err: SessionError) -> Result<ToolResult> {
    match err {
        SessionError::Rejected(message) => {
            warn!(target: "native_backend", error = %message, "native session refused to start");
            Ok(ToolResult::failure(message))
        }
        SessionError::Transport(err) => Err(err.context("Failed to start agent")),
    }
}

/// How long `agent_wait` may take to answer.
fn reply_budget(input: &ToolInput) -> Option<Duration> {
    match input {
        ToolInput::Wait { timeout_ms, .. } => {
            let wait = Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS));
            Some(wait.saturating_add(WAIT_REPLY_MARGIN))
        }
        _ => None,
    }
}

/// Procedure name and camelCase params for tools that map 1:1.
fn rpc_request(input: &ToolInput) -> Option<(&'static str, Value)> {
    let mut params = Map::new();
    let mut put = |key: &str, value: Option<Value>| {
        if let Some(value) = value {
            params.insert(key.to_string(), value);
        }
    };
    let method = match input {
        ToolInput::Navigate { url } => {
            put("url", Some(json!(url)));
            "agent_navigate"
        }
        ToolInput::ExtractText {
            selector,
            max_length,
        } => {
            put("selector", selector.as_ref().map(|s| json!(s)));
            put("maxLength", Some(json!(max_length)));
            "agent_extract_text"
        }
        ToolInput::ExtractLinks {
            selector,
            max_links,
        } => {
            put("selector", selector.as_ref().map(|s| json!(s)));
            put("maxLinks", Some(json!(max_links)));
            "agent_extract_links"
        }
        ToolInput::Click { target } => {
            match target {
                ClickTarget::Selector(selector) => put("selector", Some(json!(selector))),
                ClickTarget::Text(text) => put("text", Some(json!(text))),
            }
            "agent_click"
        }
        ToolInput::FillForm {
            selector,
            value,
            submit,
        } => {
            put("selector", Some(json!(selector)));
            put("value", Some(json!(value)));
            put("submit", Some(json!(submit)));
            "agent_fill_form"
        }
        ToolInput::Scroll {
            direction, amount, ..
        } => {
            let direction = direction.unwrap_or(ScrollDirection::Down);
            put("direction", Some(json!(direction.as_str())));
            put("amount", amount.map(|amount| json!(amount)));
            "agent_scroll"
        }
        ToolInput::Wait {
            selector,
            timeout_ms,
        } => {
            put("selector", selector.as_ref().map(|s| json!(s)));
            put("timeout", timeout_ms.map(|timeout| json!(timeout)));
            "agent_wait"
        }
        ToolInput::Screenshot { full_page } => {
            put("fullPage", Some(json!(full_page)));
            "agent_screenshot"
        }
        ToolInput::GetPageInfo => "agent_get_page_info",
        ToolInput::SearchGoogle { .. }
        | ToolInput::OpenTab { .. }
        | ToolInput::CloseTab
        | ToolInput::Complete { .. } => return None,
    };
    Some((method, Value::Object(params)))
}

fn into_result(reply: RpcReply) -> ToolResult {
    with_error(reply.success, reply.data.unwrap_or(Value::Null), reply.error)
}

fn with_error(success: bool, data: Value, error: Option<String>) -> ToolResult {
    let data = (!data.is_null()).then_some(data);
    if success {
        return ToolResult {
            success: true,
            data,
            error: None,
            screenshot: None,
        };
    }
    ToolResult {
        data,
        ..ToolResult::failure(error.unwrap_or_default())
    }
}

/// Moves a `data:` URL screenshot out of `data` into the raw base64 field.
fn lift_screenshot(mut result: ToolResult) -> ToolResult {
    let Some(data) = result.data.as_mut().and_then(Value::as_object_mut) else {
        return result;
    };
    let Some(Value::String(encoded)) = data.remove("screenshot") else {
        return result;
    };
    let raw = match encoded.split_once("base64,") {
        Some((_, raw)) => raw.to_string(),
        None => encoded,
    };
    if !data.contains_key("size") {
        if let Ok(bytes) = STANDARD.decode(raw.as_bytes()) {
            data.insert("size".to_string(), json!(bytes.len()));
        }
    }
    data.insert("format".to_string(), json!("png"));
    result.screenshot = Some(raw);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::MemoryPage;
    use std::collections::HashMap;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[derive(Default)]
    struct RecordingDriver {
        calls: std::sync::Mutex<Vec<(String, Value)>>,
        replies: HashMap<&'static str, RpcReply>,
        budgets: std::sync::Mutex<Vec<(String, Duration)>>,
        active: AtomicUsize,
        peak: AtomicUsize,
        latency: Option<Duration>,
        // Losing the process on this method bumps the generation.
        crash_on: Option<&'static str>,
        generation: AtomicU64,
    }

    impl RecordingDriver {
        fn with_reply(mut self, method: &'static str, reply: RpcReply) -> Self {
            self.replies.insert(method, reply);
            self
        }

        fn methods(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(method, _)| method.clone())
                .collect()
        }

        fn params(&self, index: usize) -> Value {
            self.calls.lock().unwrap()[index].1.clone()
        }
    }

    #[async_trait]
    impl NativeDriver for RecordingDriver {
        async fn call(&self, method: &str, params: Value) -> Result<RpcReply> {
            self.calls
                .lock()
                .unwrap()
                .push((method.to_string(), params));
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.crash_on == Some(method) {
                self.generation.fetch_add(1, Ordering::SeqCst);
                return Err(anyhow!("native driver closed stdout"));
            }
            Ok(self
                .replies
                .get(method)
                .cloned()
                .unwrap_or_else(|| RpcReply::ok(json!({ "method": method }))))
        }

        async fn call_with_budget(
            &self,
            method: &str,
            params: Value,
            budget: Duration,
        ) -> Result<RpcReply> {
            self.budgets
                .lock()
                .unwrap()
                .push((method.to_string(), budget));
            self.call(method, params).await
        }

        fn generation(&self) -> u64 {
            self.generation.load(Ordering::SeqCst)
        }
    }

    async fn run(backend: &NativeBackend, input: ToolInput) -> ToolResult {
        backend
            .execute(&input, &MemoryPage::new(), &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn starts_once_and_delegates() {
        let driver = Arc::new(RecordingDriver::default());
        let backend = NativeBackend::new(driver.clone(), true);
        assert_eq!(backend.state().await, SessionState::NotStarted);

        run(&backend, ToolInput::Navigate { url: "https://a.test".into() }).await;
        let result = run(
            &backend,
            ToolInput::ExtractText {
                selector: None,
                max_length: 8000,
            },
        )
        .await;

        assert!(result.success);
        assert_eq!(
            driver.methods(),
            vec!["agent_start", "agent_navigate", "agent_extract_text"]
        );
        assert_eq!(driver.params(0), json!({"headless": true}));
        assert_eq!(driver.params(2), json!({"maxLength": 8000}));
        assert_eq!(backend.state().await, SessionState::Running);
    }

    #[tokio::test]
    async fn complete_never_starts_session() {
        let driver = Arc::new(RecordingDriver::default());
        let backend = NativeBackend::new(driver.clone(), false);
        let result = run(
            &backend,
            ToolInput::Complete {
                summary: Some("done".into()),
                data: None,
            },
        )
        .await;
        assert_eq!(result.data.unwrap()["completed"], true);
        assert!(driver.methods().is_empty());
    }

    #[tokio::test]
    async fn rejected_start_fails_the_call() {
        let driver = Arc::new(
            RecordingDriver::default().with_reply("agent_start", RpcReply::failure("")),
        );
        let backend = NativeBackend::new(driver.clone(), false);
        let result = run(&backend, ToolInput::GetPageInfo).await;
        assert_eq!(result.error.as_deref(), Some("Failed to start agent"));
        assert_eq!(backend.state().await, SessionState::NotStarted);
        assert_eq!(driver.methods(), vec!["agent_start"]);
    }

    #[tokio::test]
    async fn close_tab_stops_and_next_call_restarts() {
        let driver = Arc::new(RecordingDriver::default());
        let backend = NativeBackend::new(driver.clone(), false);
        run(&backend, ToolInput::CloseTab).await;
        assert_eq!(backend.state().await, SessionState::Stopped);
        run(&backend, ToolInput::GetPageInfo).await;
        assert_eq!(
            driver.methods(),
            vec!["agent_start", "agent_stop", "agent_start", "agent_get_page_info"]
        );
    }

    #[tokio::test]
    async fn search_wraps_navigation_reply() {
        let driver = Arc::new(RecordingDriver::default());
        let backend = NativeBackend::new(driver.clone(), false);
        let result = run(&backend, ToolInput::SearchGoogle { query: "cats".into() }).await;
        let data = result.data.unwrap();
        assert_eq!(data["searched"], "cats");
        assert_eq!(data["url"], "https://www.google.com/search?q=cats");
        assert_eq!(data["navigated"]["method"], "agent_navigate");
    }

    #[tokio::test]
    async fn screenshots_are_lifted_out_of_data() {
        let encoded = STANDARD.encode(b"not really a png");
        let driver = Arc::new(RecordingDriver::default().with_reply(
            "agent_screenshot",
            RpcReply::ok(json!({ "screenshot": format!("data:image/png;base64,{encoded}") })),
        ));
        let backend = NativeBackend::new(driver, false);
        let result = run(&backend, ToolInput::Screenshot { full_page: true }).await;
        assert_eq!(result.screenshot.as_deref(), Some(encoded.as_str()));
        let data = result.data.unwrap();
        assert_eq!(data["size"], 16);
        assert!(data.get("screenshot").is_none());
    }

    #[tokio::test]
    async fn driver_failures_keep_their_message() {
        let driver = Arc::new(RecordingDriver::default().with_reply(
            "agent_click",
            RpcReply::failure("Element not found: #buy"),
        ));
        let backend = NativeBackend::new(driver, false);
        let result = run(
            &backend,
            ToolInput::Click {
                target: ClickTarget::Selector("#buy".into()),
            },
        )
        .await;
        assert_eq!(result, ToolResult::failure("Element not found: #buy"));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_calls_are_serialized() {
        let driver = Arc::new(RecordingDriver {
            latency: Some(Duration::from_millis(20)),
            ..RecordingDriver::default()
        });
        let backend = Arc::new(NativeBackend::new(driver.clone(), false));
        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let backend = backend.clone();
                tokio::spawn(async move { run(&backend, ToolInput::GetPageInfo).await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().success);
        }
        assert_eq!(driver.peak.load(Ordering::SeqCst), 1);
        assert_eq!(
            driver.methods().iter().filter(|m| *m == "agent_start").count(),
            1
        );
    }

    #[tokio::test]
    async fn lost_driver_process_forces_a_new_start() {
        let driver = Arc::new(RecordingDriver {
            crash_on: Some("agent_extract_text"),
            ..RecordingDriver::default()
        });
        let backend = NativeBackend::new(driver.clone(), false);
        run(&backend, ToolInput::Navigate { url: "https://a.test".into() }).await;

        let lost = backend
            .execute(
                &ToolInput::ExtractText {
                    selector: None,
                    max_length: 8000,
                },
                &MemoryPage::new(),
                &CancellationToken::new(),
            )
            .await;
        assert!(lost.is_err());
        assert_eq!(backend.state().await, SessionState::NotStarted);

        assert!(run(&backend, ToolInput::GetPageInfo).await.success);
        assert_eq!(backend.state().await, SessionState::Running);
        assert_eq!(
            driver.methods(),
            vec![
                "agent_start",
                "agent_navigate",
                "agent_extract_text",
                "agent_start",
                "agent_get_page_info"
            ]
        );
    }

    #[tokio::test]
    async fn stop_after_process_loss_skips_agent_stop() {
        let driver = Arc::new(RecordingDriver {
            crash_on: Some("agent_get_page_info"),
            ..RecordingDriver::default()
        });
        let backend = NativeBackend::new(driver.clone(), false);
        let _ = backend
            .execute(&ToolInput::GetPageInfo, &MemoryPage::new(), &CancellationToken::new())
            .await;

        let reply = backend.stop().await.unwrap();
        assert_eq!(reply, RpcReply::ok(json!({ "stopped": false })));
        assert_eq!(driver.methods(), vec!["agent_start", "agent_get_page_info"]);
    }

    #[tokio::test]
    async fn native_wait_extends_the_reply_budget() {
        let driver = Arc::new(RecordingDriver::default());
        let backend = NativeBackend::new(driver.clone(), false);
        run(
            &backend,
            ToolInput::Wait {
                selector: Some("#late".into()),
                timeout_ms: Some(60_000),
            },
        )
        .await;
        run(&backend, ToolInput::GetPageInfo).await;

        assert_eq!(
            *driver.budgets.lock().unwrap(),
            vec![("agent_wait".to_string(), Duration::from_secs(65))]
        );
        assert_eq!(driver.params(1), json!({"selector": "#late", "timeout": 60000}));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_abandons_the_in_flight_call() {
        let driver = Arc::new(RecordingDriver {
            latency: Some(Duration::from_secs(10)),
            ..RecordingDriver::default()
        });
        let backend = NativeBackend {
            driver: driver.clone(),
            session: Mutex::new(BackendSession {
                state: SessionState::Running,
                generation: 0,
            }),
            headless: false,
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = backend
            .execute(&ToolInput::GetPageInfo, &MemoryPage::new(), &cancel)
            .await
            .unwrap();
        assert_eq!(result, ToolResult::failure("tool call cancelled"));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(driver.methods(), vec!["agent_get_page_info"]);
    }

    #[test]
    fn only_one_to_one_tools_have_procedures() {
        assert!(rpc_request(&ToolInput::CloseTab).is_none());
        assert!(rpc_request(&ToolInput::Complete {
            summary: None,
            data: None
        })
        .is_none());
        assert!(rpc_request(&ToolInput::SearchGoogle { query: "cats".into() }).is_none());

        let (method, params) = rpc_request(&ToolInput::Scroll {
            direction: None,
            selector: Some("#ignored".into()),
            amount: Some(300),
        })
        .unwrap();
        assert_eq!(method, "agent_scroll");
        assert_eq!(params, json!({"direction": "down", "amount": 300}));
    }
}

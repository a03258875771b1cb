use std::collections::VecDeque;
use std::sync::Arc;

use agent_core::{
    AgentRuntime, MemoryPage, NativeDriver, PageContext, RpcReply, SessionState,
    StaticEnvironment,
};
use ai_agent::{
    AgentConfig, AgentEvent, ContentBlock, EventSink, MessagesRequest, MessagesResponse,
    ReasoningClient, ReasoningError,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

struct ScriptedModel {
    turns: Mutex<VecDeque<Vec<ContentBlock>>>,
    requests: Mutex<Vec<MessagesRequest>>,
}

impl ScriptedModel {
    fn new(turns: Vec<Vec<ContentBlock>>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ReasoningClient for ScriptedModel {
    async fn send(&self, request: &MessagesRequest) -> Result<MessagesResponse, ReasoningError> {
        self.requests.lock().await.push(request.clone());
        let content = self
            .turns
            .lock()
            .await
            .pop_front()
            .expect("scripted model ran out of turns");
        Ok(MessagesResponse::new(content))
    }
}

fn tool_use(id: &str, name: &str, input: Value) -> ContentBlock {
    ContentBlock::ToolUse {
        id: id.into(),
        name: name.into(),
        input,
    }
}

#[tokio::test(start_paused = true)]
async fn search_for_cats_end_to_end() {
    let model = ScriptedModel::new(vec![
        vec![
            ContentBlock::text("I'll search for that."),
            tool_use("t1", "search_google", json!({"query": "cats"})),
        ],
        vec![tool_use("t2", "complete", json!({"summary": "Searched for cats"}))],
    ]);
    let page = Arc::new(MemoryPage::new().with_tab("vyber://newtab"));
    let runtime = AgentRuntime::builder(model.clone())
        .with_page_context(page.clone())
        .with_environment(Arc::new(StaticEnvironment::embedded()))
        .build();

    let (sink, mut events) = EventSink::channel();
    let result = runtime.run_with_events("search for cats", sink).await;

    assert!(result.success);
    assert_eq!(result.summary.as_deref(), Some("Searched for cats"));

    let tab = page.active_tab().unwrap();
    assert_eq!(
        page.url_of(&tab).as_deref(),
        Some("https://www.google.com/search?q=cats")
    );

    let requests = model.requests.lock().await;
    let answer = &requests[1].messages[2].blocks()[0];
    let ContentBlock::ToolResult {
        tool_use_id,
        content,
        is_error,
    } = answer
    else {
        panic!("expected a tool_result block, got {answer:?}");
    };
    assert_eq!(tool_use_id, "t1");
    assert!(!is_error);
    let decoded: Value = serde_json::from_str(content).unwrap();
    assert_eq!(
        decoded,
        json!({
            "success": true,
            "data": {"searched": "cats", "url": "https://www.google.com/search?q=cats"}
        })
    );

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen[0], AgentEvent::Thinking { .. }));
    assert!(matches!(seen[1], AgentEvent::ToolCall { ref name, .. } if name == "search_google"));
    assert!(matches!(seen[2], AgentEvent::ToolResult { ref result, .. } if result.success));
    assert_eq!(
        seen.last(),
        Some(&AgentEvent::Completed {
            summary: "Searched for cats".into(),
            data: None
        })
    );
}

#[tokio::test]
async fn failed_tools_are_fed_back_as_errors() {
    let model = ScriptedModel::new(vec![
        vec![tool_use(
            "f1",
            "fill_form",
            json!({"selector": "#missing", "value": "x"}),
        )],
        vec![ContentBlock::text("The form has no such field.")],
    ]);
    let page = Arc::new(
        MemoryPage::new()
            .serve("https://form.test/", "<body><form><input id=\"name\"></form></body>")
            .with_tab("https://form.test/"),
    );
    let runtime = AgentRuntime::builder(model.clone())
        .with_config(AgentConfig {
            post_action_delay_ms: 0,
            ..AgentConfig::default()
        })
        .with_page_context(page)
        .build();

    let result = runtime.run("fill the missing field").await;
    assert!(result.success);
    assert_eq!(result.iterations, 2);

    let requests = model.requests.lock().await;
    match &requests[1].messages[2].blocks()[0] {
        ContentBlock::ToolResult {
            content, is_error, ..
        } => {
            assert!(*is_error);
            let decoded: Value = serde_json::from_str(content).unwrap();
            assert_eq!(decoded["error"], "Input not found: #missing");
        }
        other => panic!("expected tool_result, got {other:?}"),
    }
}

#[derive(Default)]
struct RecordingDriver {
    methods: std::sync::Mutex<Vec<String>>,
}

#[async_trait]
impl NativeDriver for RecordingDriver {
    async fn call(&self, method: &str, _params: Value) -> anyhow::Result<RpcReply> {
        self.methods.lock().unwrap().push(method.to_string());
        Ok(RpcReply::ok(json!({ "method": method })))
    }
}

#[tokio::test(start_paused = true)]
async fn native_session_spans_runs_until_shutdown() {
    let model = ScriptedModel::new(vec![
        vec![tool_use("n1", "navigate", json!({"url": "https://example.com"}))],
        vec![ContentBlock::text("Opened example.com")],
        vec![tool_use("p1", "get_page_info", json!({}))],
        vec![tool_use("c1", "complete", json!({"summary": "Read the page", "data": {"ok": true}}))],
    ]);
    let driver = Arc::new(RecordingDriver::default());
    let runtime = AgentRuntime::builder(model)
        .with_native_driver(driver.clone(), true)
        .build();

    assert_eq!(runtime.native_session_state().await, Some(SessionState::NotStarted));
    assert!(runtime.run("open example.com").await.success);
    let second = runtime.run("read the page").await;
    assert!(second.success);
    assert_eq!(second.data, Some(json!({"ok": true})));
    assert_eq!(runtime.native_session_state().await, Some(SessionState::Running));

    runtime.shutdown().await.unwrap();
    assert_eq!(runtime.native_session_state().await, Some(SessionState::Stopped));
    assert_eq!(
        *driver.methods.lock().unwrap(),
        vec!["agent_start", "agent_navigate", "agent_get_page_info", "agent_stop"]
    );
}

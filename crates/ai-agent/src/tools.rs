use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

/// Tool exposed to the reasoning service: name, description and the JSON schema
/// its `tool_use.input` must satisfy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// Fixed vocabulary of browser tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    Navigate,
    ExtractText,
    ExtractLinks,
    Click,
    FillForm,
    Screenshot,
    Scroll,
    Wait,
    GetPageInfo,
    SearchGoogle,
    OpenTab,
    CloseTab,
    Complete,
}

impl ToolName {
    pub const ALL: [ToolName; 13] = [
        Self::Navigate,
        Self::ExtractText,
        Self::ExtractLinks,
        Self::Click,
        Self::FillForm,
        Self::Screenshot,
        Self::Scroll,
        Self::Wait,
        Self::GetPageInfo,
        Self::SearchGoogle,
        Self::OpenTab,
        Self::CloseTab,
        Self::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Navigate => "navigate",
            Self::ExtractText => "extract_text",
            Self::ExtractLinks => "extract_links",
            Self::Click => "click",
            Self::FillForm => "fill_form",
            Self::Screenshot => "screenshot",
            Self::Scroll => "scroll",
            Self::Wait => "wait",
            Self::GetPageInfo => "get_page_info",
            Self::SearchGoogle => "search_google",
            Self::OpenTab => "open_tab",
            Self::CloseTab => "close_tab",
            Self::Complete => "complete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|name| name.as_str() == value)
    }

    /// Tools that change what the page shows and need time to settle afterwards.
    pub fn mutates_page(&self) -> bool {
        matches!(self, Self::Navigate | Self::Click | Self::FillForm)
    }
}

impl FromStr for ToolName {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or(())
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static CATALOG: Lazy<IndexMap<ToolName, ToolDefinition>> = Lazy::new(|| {
    ToolName::ALL
        .into_iter()
        .map(|name| (name, build_definition(name)))
        .collect()
});

static CATALOG_LIST: Lazy<Vec<ToolDefinition>> = Lazy::new(|| CATALOG.values().cloned().collect());

/// The static tool catalog, in presentation order. Constant for the process lifetime.
pub fn list_tools() -> &'static [ToolDefinition] {
    &CATALOG_LIST
}

pub fn tool_definition(name: ToolName) -> &'static ToolDefinition {
    &CATALOG[&name]
}

fn build_definition(name: ToolName) -> ToolDefinition {
    let (description, schema) = match name {
        ToolName::Navigate => (
            "Navigate to a URL in the current tab. Use this to open websites, search Google, or go to specific pages.",
            object_schema(
                json!({
                    "url": {
                        "type": "string",
                        "description": "The URL to navigate to. Can be a full URL or a search query (will search Google)."
                    }
                }),
                &["url"],
            ),
        ),
        ToolName::ExtractText => (
            "Extract all visible text content from the current page. Use this to read and understand page content.",
            object_schema(
                json!({
                    "selector": {
                        "type": "string",
                        "description": "Optional CSS selector to extract text from a specific element. If not provided, extracts all visible text."
                    },
                    "max_length": {
                        "type": "number",
                        "description": "Maximum characters to return. Default is 8000."
                    }
                }),
                &[],
            ),
        ),
        ToolName::ExtractLinks => (
            "Extract all links from the current page with their text and URLs.",
            object_schema(
                json!({
                    "selector": {
                        "type": "string",
                        "description": "Optional CSS selector to limit link extraction to a specific area."
                    },
                    "max_links": {
                        "type": "number",
                        "description": "Maximum number of links to return. Default is 50."
                    }
                }),
                &[],
            ),
        ),
        ToolName::Click => (
            "Click on an element on the page by CSS selector or visible text.",
            object_schema(
                json!({
                    "selector": { "type": "string", "description": "CSS selector of the element to click." },
                    "text": { "type": "string", "description": "Visible text of the element to click (alternative to selector)." }
                }),
                &[],
            ),
        ),
        ToolName::FillForm => (
            "Fill in a form field with text.",
            object_schema(
                json!({
                    "selector": { "type": "string", "description": "CSS selector of the input field." },
                    "value": { "type": "string", "description": "The text to fill in." },
                    "submit": { "type": "boolean", "description": "Whether to submit the form after filling. Default false." }
                }),
                &["selector", "value"],
            ),
        ),
        ToolName::Screenshot => (
            "Take a screenshot of the current page or a specific element.",
            object_schema(
                json!({
                    "selector": { "type": "string", "description": "Optional CSS selector to screenshot only a specific element." },
                    "full_page": { "type": "boolean", "description": "Whether to capture the full scrollable page. Default false." }
                }),
                &[],
            ),
        ),
        ToolName::Scroll => (
            "Scroll the page in a direction or to a specific element.",
            object_schema(
                json!({
                    "direction": {
                        "type": "string",
                        "enum": ["up", "down", "top", "bottom"],
                        "description": "Direction to scroll."
                    },
                    "selector": { "type": "string", "description": "CSS selector of element to scroll into view (alternative to direction)." },
                    "amount": { "type": "number", "description": "Pixels to scroll. Default is one viewport height." }
                }),
                &[],
            ),
        ),
        ToolName::Wait => (
            "Wait for a condition before proceeding.",
            object_schema(
                json!({
                    "selector": { "type": "string", "description": "Wait for this element to appear on the page." },
                    "timeout": { "type": "number", "description": "Maximum milliseconds to wait. Default is 5000." }
                }),
                &[],
            ),
        ),
        ToolName::GetPageInfo => (
            "Get information about the current page including URL, title, and metadata.",
            object_schema(json!({}), &[]),
        ),
        ToolName::SearchGoogle => (
            "Search Google for a query and return the results.",
            object_schema(
                json!({
                    "query": { "type": "string", "description": "The search query." }
                }),
                &["query"],
            ),
        ),
        ToolName::OpenTab => (
            "Open a new browser tab.",
            object_schema(
                json!({
                    "url": { "type": "string", "description": "Optional URL to open in the new tab. If not provided, opens a blank tab." }
                }),
                &[],
            ),
        ),
        ToolName::CloseTab => ("Close the current tab.", object_schema(json!({}), &[])),
        ToolName::Complete => (
            "Mark the task as complete and provide a final response to the user.",
            object_schema(
                json!({
                    "summary": { "type": "string", "description": "A summary of what was accomplished." },
                    "data": { "type": "object", "description": "Any structured data to return (e.g., extracted information)." }
                }),
                &["summary"],
            ),
        ),
    };
    ToolDefinition::new(name.as_str(), description, schema)
}

fn object_schema(properties: Value, required: &[&str]) -> Value {
    let mut schema = json!({
        "type": "object",
        "properties": properties,
    });
    if !required.is_empty() {
        schema["required"] = json!(required);
    }
    schema
}

/// One invocation requested by the reasoning service. `input` is untrusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub input: Map<String, Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, input: Value) -> Self {
        let input = match input {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            name: name.into(),
            input,
        }
    }
}

/// Normalized outcome of one tool call, whichever backend ran it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Base64-encoded image, set only by backends that can capture the page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

impl ToolResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            screenshot: None,
        }
    }

    /// A failed result. Failures always carry a non-empty message.
    pub fn failure(error: impl Into<String>) -> Self {
        let mut error = error.into();
        if error.trim().is_empty() {
            error = "tool call failed".to_string();
        }
        Self {
            success: false,
            data: None,
            error: Some(error),
            screenshot: None,
        }
    }

    pub fn with_screenshot(mut self, screenshot: String) -> Self {
        self.screenshot = Some(screenshot);
        self
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// Executes tool calls on behalf of the orchestrator. Implementations must never
/// fail: every problem is reported through `ToolResult::failure`.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolResult;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn catalog_lists_every_tool_once() {
        let tools = list_tools();
        assert_eq!(tools.len(), 13);
        let names: HashSet<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names.len(), 13);
        for name in ToolName::ALL {
            assert!(names.contains(name.as_str()), "missing {name}");
        }
        assert_eq!(tools[0].name, "navigate");
        assert_eq!(tools[12].name, "complete");
    }

    #[test]
    fn schemas_are_objects_with_properties() {
        for tool in list_tools() {
            assert_eq!(tool.input_schema["type"], "object", "{}", tool.name);
            assert!(tool.input_schema["properties"].is_object(), "{}", tool.name);
        }
        let fill = tool_definition(ToolName::FillForm);
        assert_eq!(fill.input_schema["required"], json!(["selector", "value"]));
        let info = tool_definition(ToolName::GetPageInfo);
        assert!(info.input_schema.get("required").is_none());
    }

    #[test]
    fn definition_serializes_in_wire_shape() {
        let value = serde_json::to_value(tool_definition(ToolName::SearchGoogle)).unwrap();
        assert_eq!(value["name"], "search_google");
        assert_eq!(value["input_schema"]["required"], json!(["query"]));
        assert!(value["description"].as_str().unwrap().contains("Search Google"));
    }

    #[test]
    fn tool_names_round_trip_through_strings() {
        assert_eq!(ToolName::parse("fill_form"), Some(ToolName::FillForm));
        assert_eq!("close_tab".parse::<ToolName>(), Ok(ToolName::CloseTab));
        assert_eq!(ToolName::parse("evaluate_js"), None);
        assert!(ToolName::Click.mutates_page());
        assert!(!ToolName::ExtractText.mutates_page());
    }

    #[test]
    fn failure_always_has_message() {
        let result = ToolResult::failure("");
        assert!(!result.success);
        assert!(!result.error_message().unwrap().is_empty());

        let serialized = serde_json::to_value(ToolResult::ok(json!({"x": 1}))).unwrap();
        assert_eq!(serialized, json!({"success": true, "data": {"x": 1}}));
    }

    #[test]
    fn tool_call_ignores_non_object_input() {
        let call = ToolCall::new("wait", json!("soon"));
        assert!(call.input.is_empty());
    }
}

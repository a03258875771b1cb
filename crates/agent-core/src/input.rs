use ai_agent::ToolName;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const DEFAULT_MAX_TEXT_LENGTH: usize = 8000;
pub const DEFAULT_MAX_LINKS: usize = 50;
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{tool} requires {field}")]
    MissingField {
        tool: &'static str,
        field: &'static str,
    },
    #[error("{field} must be one of {expected}")]
    InvalidValue {
        field: &'static str,
        expected: &'static str,
    },
    #[error("{0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Top,
    Bottom,
}

impl ScrollDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrollDirection::Up => "up",
            ScrollDirection::Down => "down",
            ScrollDirection::Top => "top",
            ScrollDirection::Bottom => "bottom",
        }
    }

    fn parse(raw: &str) -> Result<Self, ValidationError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(ScrollDirection::Up),
            "down" => Ok(ScrollDirection::Down),
            "top" => Ok(ScrollDirection::Top),
            "bottom" => Ok(ScrollDirection::Bottom),
            _ => Err(ValidationError::InvalidValue {
                field: "direction",
                expected: "up, down, top, bottom",
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickTarget {
    Selector(String),
    Text(String),
}

impl ClickTarget {
    pub fn label(&self) -> &str {
        match self {
            ClickTarget::Selector(value) | ClickTarget::Text(value) => value,
        }
    }
}

/// Tool input after validation, one variant per catalog entry.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInput {
    Navigate {
        url: String,
    },
    ExtractText {
        selector: Option<String>,
        max_length: usize,
    },
    ExtractLinks {
        selector: Option<String>,
        max_links: usize,
    },
    Click {
        target: ClickTarget,
    },
    FillForm {
        selector: String,
        value: String,
        submit: bool,
    },
    Screenshot {
        full_page: bool,
    },
    Scroll {
        direction: Option<ScrollDirection>,
        selector: Option<String>,
        amount: Option<u64>,
    },
    Wait {
        selector: Option<String>,
        timeout_ms: Option<u64>,
    },
    GetPageInfo,
    SearchGoogle {
        query: String,
    },
    OpenTab {
        url: Option<String>,
    },
    CloseTab,
    Complete {
        summary: Option<String>,
        data: Option<Value>,
    },
}

impl ToolInput {
    pub fn parse(tool: ToolName, input: &Map<String, Value>) -> Result<Self, ValidationError> {
        let raw: RawInput = serde_json::from_value(Value::Object(input.clone()))
            .map_err(|err| ValidationError::Malformed(err.to_string()))?;
        let name = tool.as_str();
        let required = |value: Option<String>, field: &'static str| {
            non_empty(value).ok_or(ValidationError::MissingField { tool: name, field })
        };

        Ok(match tool {
            ToolName::Navigate => ToolInput::Navigate {
                url: required(raw.url, "url")?,
            },
            ToolName::ExtractText => ToolInput::ExtractText {
                selector: non_empty(raw.selector),
                max_length: raw
                    .max_length
                    .map_or(DEFAULT_MAX_TEXT_LENGTH, |value| value as usize),
            },
            ToolName::ExtractLinks => ToolInput::ExtractLinks {
                selector: non_empty(raw.selector),
                max_links: raw.max_links.map_or(DEFAULT_MAX_LINKS, |value| value as usize),
            },
            ToolName::Click => {
                let target = match (non_empty(raw.selector), non_empty(raw.text)) {
                    (Some(selector), _) => ClickTarget::Selector(selector),
                    (None, Some(text)) => ClickTarget::Text(text),
                    (None, None) => {
                        return Err(ValidationError::MissingField {
                            tool: name,
                            field: "selector or text",
                        })
                    }
                };
                ToolInput::Click { target }
            }
            ToolName::FillForm => ToolInput::FillForm {
                selector: required(raw.selector, "selector")?,
                value: raw.value.ok_or(ValidationError::MissingField {
                    tool: name,
                    field: "value",
                })?,
                submit: raw.submit.unwrap_or(false),
            },
            ToolName::Screenshot => ToolInput::Screenshot {
                full_page: raw.full_page.unwrap_or(false),
            },
            ToolName::Scroll => ToolInput::Scroll {
                direction: non_empty(raw.direction)
                    .map(|direction| ScrollDirection::parse(&direction))
                    .transpose()?,
                selector: non_empty(raw.selector),
                amount: raw.amount,
            },
            ToolName::Wait => ToolInput::Wait {
                selector: non_empty(raw.selector),
                timeout_ms: raw.timeout,
            },
            ToolName::GetPageInfo => ToolInput::GetPageInfo,
            ToolName::SearchGoogle => ToolInput::SearchGoogle {
                query: required(raw.query, "query")?,
            },
            ToolName::OpenTab => ToolInput::OpenTab {
                url: non_empty(raw.url),
            },
            ToolName::CloseTab => ToolInput::CloseTab,
            ToolName::Complete => ToolInput::Complete {
                summary: non_empty(raw.summary),
                data: raw.data.filter(|data| !data.is_null()),
            },
        })
    }

    pub fn tool(&self) -> ToolName {
        match self {
            ToolInput::Navigate { .. } => ToolName::Navigate,
            ToolInput::ExtractText { .. } => ToolName::ExtractText,
            ToolInput::ExtractLinks { .. } => ToolName::ExtractLinks,
            ToolInput::Click { .. } => ToolName::Click,
            ToolInput::FillForm { .. } => ToolName::FillForm,
            ToolInput::Screenshot { .. } => ToolName::Screenshot,
            ToolInput::Scroll { .. } => ToolName::Scroll,
            ToolInput::Wait { .. } => ToolName::Wait,
            ToolInput::GetPageInfo => ToolName::GetPageInfo,
            ToolInput::SearchGoogle { .. } => ToolName::SearchGoogle,
            ToolInput::OpenTab { .. } => ToolName::OpenTab,
            ToolInput::CloseTab => ToolName::CloseTab,
            ToolInput::Complete { .. } => ToolName::Complete,
        }
    }
}

pub fn search_url(query: &str) -> String {
    format!(
        "https://www.google.com/search?q={}",
        urlencoding::encode(query)
    )
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawInput {
    url: Option<String>,
    selector: Option<String>,
    text: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    value: Option<String>,
    query: Option<String>,
    summary: Option<String>,
    direction: Option<String>,
    data: Option<Value>,
    #[serde(deserialize_with = "lenient_count")]
    max_length: Option<u64>,
    #[serde(deserialize_with = "lenient_count")]
    max_links: Option<u64>,
    #[serde(deserialize_with = "lenient_count")]
    amount: Option<u64>,
    #[serde(deserialize_with = "lenient_count")]
    timeout: Option<u64>,
    #[serde(deserialize_with = "lenient_flag")]
    submit: Option<bool>,
    #[serde(deserialize_with = "lenient_flag")]
    full_page: Option<bool>,
}

// Zero and null mean "use the default".
fn lenient_count<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let number = match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => text.trim().parse::<f64>().ok(),
        Some(_) => None,
    };
    match number {
        Some(number) if number.is_finite() && number >= 0.0 => {
            let count = number.floor() as u64;
            Ok((count > 0).then_some(count))
        }
        _ => Err(de::Error::custom("expected a non-negative number")),
    }
}

fn lenient_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(flag)) => Ok(Some(flag)),
        Some(Value::String(text)) => match text.trim() {
            "true" => Ok(Some(true)),
            "false" | "" => Ok(Some(false)),
            _ => Err(de::Error::custom("expected a boolean")),
        },
        Some(_) => Err(de::Error::custom("expected a boolean")),
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text)),
        Some(Value::Number(number)) => Ok(Some(number.to_string())),
        Some(Value::Bool(flag)) => Ok(Some(flag.to_string())),
        Some(_) => Err(de::Error::custom("expected a string")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(tool: ToolName, input: Value) -> Result<ToolInput, ValidationError> {
        ToolInput::parse(tool, input.as_object().unwrap())
    }

    #[test]
    fn fills_defaults_for_zero_or_missing_numbers() {
        assert_eq!(
            parse(ToolName::ExtractText, json!({"max_length": 0})).unwrap(),
            ToolInput::ExtractText {
                selector: None,
                max_length: DEFAULT_MAX_TEXT_LENGTH
            }
        );
        assert_eq!(
            parse(ToolName::ExtractLinks, json!({"selector": "main", "max_links": "5"})).unwrap(),
            ToolInput::ExtractLinks {
                selector: Some("main".into()),
                max_links: 5
            }
        );
    }

    #[test]
    fn rejects_missing_required_fields() {
        assert_eq!(
            parse(ToolName::FillForm, json!({"value": "x"})).unwrap_err().to_string(),
            "fill_form requires selector"
        );
        assert_eq!(
            parse(ToolName::Navigate, json!({"url": "  "})).unwrap_err().to_string(),
            "navigate requires url"
        );
        assert!(parse(ToolName::Click, json!({})).is_err());
    }

    #[test]
    fn rejects_wrong_types() {
        let err = parse(ToolName::Wait, json!({"timeout": -5})).unwrap_err();
        assert!(matches!(err, ValidationError::Malformed(_)));
        let err = parse(ToolName::Navigate, json!({"url": 42})).unwrap_err();
        assert!(matches!(err, ValidationError::Malformed(_)));
        let err = parse(ToolName::Scroll, json!({"direction": "sideways"})).unwrap_err();
        assert_eq!(err.to_string(), "direction must be one of up, down, top, bottom");
    }

    #[test]
    fn click_prefers_selector_over_text() {
        let input = parse(ToolName::Click, json!({"selector": "#go", "text": "Go"})).unwrap();
        assert_eq!(
            input,
            ToolInput::Click {
                target: ClickTarget::Selector("#go".into())
            }
        );
        let input = parse(ToolName::Click, json!({"text": "Go"})).unwrap();
        assert_eq!(input.tool(), ToolName::Click);
    }

    #[test]
    fn fill_form_accepts_scalar_values() {
        let input = parse(
            ToolName::FillForm,
            json!({"selector": "#age", "value": 42, "submit": true}),
        )
        .unwrap();
        assert_eq!(
            input,
            ToolInput::FillForm {
                selector: "#age".into(),
                value: "42".into(),
                submit: true
            }
        );
    }

    #[test]
    fn search_urls_are_encoded() {
        assert_eq!(search_url("cats"), "https://www.google.com/search?q=cats");
        assert_eq!(
            search_url("cats & dogs"),
            "https://www.google.com/search?q=cats%20%26%20dogs"
        );
    }
}

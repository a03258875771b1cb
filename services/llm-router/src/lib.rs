use std::sync::Arc;
use std::time::Duration;

use ai_agent::{MessagesRequest, MessagesResponse, ReasoningClient, ReasoningError};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_API_BASE: &str = "https://api.anthropic.com/v1";
pub const DEFAULT_PROXY_URL: &str = "http://localhost:8888/.netlify/functions/claude-proxy";
pub const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

/// How requests reach the reasoning service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Straight to the provider with an API key header.
    Direct,
    /// Through a trusted proxy that holds the key.
    Proxy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouterConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "RouterConfig::default_api_base")]
    pub api_base: String,
    #[serde(default = "RouterConfig::default_proxy_url")]
    pub proxy_url: String,
    #[serde(default = "RouterConfig::default_anthropic_version")]
    pub anthropic_version: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl RouterConfig {
    fn default_api_base() -> String {
        DEFAULT_API_BASE.to_string()
    }

    fn default_proxy_url() -> String {
        DEFAULT_PROXY_URL.to_string()
    }

    fn default_anthropic_version() -> String {
        DEFAULT_ANTHROPIC_VERSION.to_string()
    }

    /// Reads `ANTHROPIC_API_KEY`, `ANTHROPIC_API_BASE` and `AGENT_PROXY_URL`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();
        Self {
            api_key: read("ANTHROPIC_API_KEY"),
            api_base: read("ANTHROPIC_API_BASE").unwrap_or(defaults.api_base),
            proxy_url: read("AGENT_PROXY_URL").unwrap_or(defaults.proxy_url),
            anthropic_version: defaults.anthropic_version,
            timeout_ms: defaults.timeout_ms,
        }
    }

    /// Direct whenever a key is configured.
    pub fn auth_mode(&self) -> AuthMode {
        match self.api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => AuthMode::Direct,
            _ => AuthMode::Proxy,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(120_000))
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: Self::default_api_base(),
            proxy_url: Self::default_proxy_url(),
            anthropic_version: Self::default_anthropic_version(),
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no endpoint configured for {0:?} mode")]
    MissingEndpoint(AuthMode),
}

#[derive(Debug, Clone)]
enum Auth {
    ApiKey { key: String, version: String },
    None,
}

/// "Messages with tools" client over HTTP.
#[derive(Debug, Clone)]
pub struct MessagesClient {
    http: Client,
    endpoint: String,
    auth: Auth,
    timeout_ms: u64,
}

impl MessagesClient {
    pub fn new(config: &RouterConfig) -> Result<Self> {
        let timeout = config.request_timeout();
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("building reasoning HTTP client")?;
        let (endpoint, auth) = match config.auth_mode() {
            AuthMode::Direct => {
                let base = config.api_base.trim_end_matches('/');
                if base.is_empty() {
                    return Err(anyhow!(RouterError::MissingEndpoint(AuthMode::Direct)));
                }
                let key = config.api_key.clone().unwrap_or_default();
                (
                    format!("{base}/messages"),
                    Auth::ApiKey {
                        key: key.trim().to_string(),
                        version: config.anthropic_version.clone(),
                    },
                )
            }
            AuthMode::Proxy => {
                if config.proxy_url.trim().is_empty() {
                    return Err(anyhow!(RouterError::MissingEndpoint(AuthMode::Proxy)));
                }
                (config.proxy_url.clone(), Auth::None)
            }
        };
        Ok(Self {
            http,
            endpoint,
            auth,
            timeout_ms: timeout.as_millis() as u64,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build_request(&self, request: &MessagesRequest) -> RequestBuilder {
        let builder = self
            .http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .json(request);
        match &self.auth {
            Auth::ApiKey { key, version } => builder
                .header("x-api-key", key)
                .header("anthropic-version", version),
            Auth::None => builder,
        }
    }
}

#[async_trait]
impl ReasoningClient for MessagesClient {
    async fn send(&self, request: &MessagesRequest) -> Result<MessagesResponse, ReasoningError> {
        debug!(
            target: "llm_router",
            endpoint = %self.endpoint,
            model = %request.model,
            messages = request.messages.len(),
            "sending reasoning request"
        );
        let response = self.build_request(request).send().await.map_err(|err| {
            if err.is_timeout() {
                ReasoningError::Timeout(self.timeout_ms)
            } else {
                ReasoningError::Transport(err.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(target: "llm_router", status = status.as_u16(), "reasoning service rejected request");
            return Err(ReasoningError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|err| ReasoningError::Decode(err.to_string()))?;
        if let Some(usage) = &parsed.usage {
            debug!(
                target: "llm_router",
                input_tokens = ?usage.input_tokens,
                output_tokens = ?usage.output_tokens,
                "reasoning response received"
            );
        }
        Ok(parsed)
    }
}

/// Picks the reasoning client for a configuration.
#[derive(Clone)]
pub struct LlmRouter {
    config: RouterConfig,
    client: Arc<MessagesClient>,
}

impl LlmRouter {
    pub fn new(config: RouterConfig) -> Result<Self> {
        let client = MessagesClient::new(&config)?;
        Ok(Self {
            config,
            client: Arc::new(client),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(RouterConfig::from_env())
    }

    pub fn route(&self) -> Arc<dyn ReasoningClient> {
        self.client.clone()
    }

    pub fn auth_mode(&self) -> AuthMode {
        self.config.auth_mode()
    }

    pub fn endpoint(&self) -> &str {
        self.client.endpoint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ai_agent::{list_tools, ContentBlock, Message};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn request() -> MessagesRequest {
        MessagesRequest {
            model: "claude-sonnet-4-20250514".into(),
            max_tokens: 4096,
            system: "be brief".into(),
            tools: list_tools().to_vec(),
            messages: vec![Message::user_text("search for cats")],
        }
    }

    fn config_with_key(key: Option<&str>) -> RouterConfig {
        RouterConfig {
            api_key: key.map(str::to_string),
            ..RouterConfig::default()
        }
    }

    #[test]
    fn mode_follows_key_presence() {
        assert_eq!(config_with_key(Some("sk-test")).auth_mode(), AuthMode::Direct);
        assert_eq!(config_with_key(Some("  ")).auth_mode(), AuthMode::Proxy);
        assert_eq!(config_with_key(None).auth_mode(), AuthMode::Proxy);
    }

    #[test]
    fn env_lookup_fills_defaults() {
        let vars: HashMap<&str, &str> = [("ANTHROPIC_API_KEY", "sk-env"), ("AGENT_PROXY_URL", "")]
            .into_iter()
            .collect();
        let config = RouterConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.api_key.as_deref(), Some("sk-env"));
        assert_eq!(config.api_base, DEFAULT_API_BASE);
        assert_eq!(config.proxy_url, DEFAULT_PROXY_URL);
    }

    #[test]
    fn direct_requests_carry_key_headers() {
        let client = MessagesClient::new(&config_with_key(Some("sk-test"))).unwrap();
        let built = client.build_request(&request()).build().unwrap();
        assert_eq!(built.url().as_str(), "https://api.anthropic.com/v1/messages");
        assert_eq!(built.headers()["x-api-key"], "sk-test");
        assert_eq!(built.headers()["anthropic-version"], DEFAULT_ANTHROPIC_VERSION);

        let body: Value =
            serde_json::from_slice(built.body().and_then(|b| b.as_bytes()).unwrap()).unwrap();
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["tools"].as_array().unwrap().len(), 13);
        assert_eq!(body["messages"][0], json!({"role": "user", "content": "search for cats"}));
    }

    #[test]
    fn proxy_requests_have_no_credentials() {
        let router = LlmRouter::new(config_with_key(None)).unwrap();
        assert_eq!(router.auth_mode(), AuthMode::Proxy);
        assert_eq!(router.endpoint(), DEFAULT_PROXY_URL);

        let client = MessagesClient::new(&config_with_key(None)).unwrap();
        let built = client.build_request(&request()).build().unwrap();
        assert!(built.headers().get("x-api-key").is_none());
        assert!(built.headers().get("anthropic-version").is_none());
    }

    /// Answers one HTTP request with `status` and `body`.
    async fn serve_once(status: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let read = socket.read(&mut chunk).await.unwrap();
                if read == 0 {
                    break;
                }
                received.extend_from_slice(&chunk[..read]);
                let text = String::from_utf8_lossy(&received);
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if received.len() >= split + 4 + length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{addr}/messages-proxy")
    }

    fn proxy_client(url: String) -> MessagesClient {
        MessagesClient::new(&RouterConfig {
            proxy_url: url,
            ..RouterConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn error_status_surfaces_status_and_body() {
        let url = serve_once("529 Site Overloaded", "{\"error\":\"overloaded\"}".into()).await;
        let err = proxy_client(url).send(&request()).await.unwrap_err();
        match &err {
            ReasoningError::Http { status, body } => {
                assert_eq!(*status, 529);
                assert!(body.contains("overloaded"));
            }
            other => panic!("expected HTTP error, got {other:?}"),
        }
        assert!(err.to_string().contains("529"));
    }

    #[tokio::test]
    async fn decodes_content_blocks() {
        let body = json!({
            "id": "msg_1",
            "content": [
                {"type": "text", "text": "Searching"},
                {"type": "tool_use", "id": "toolu_1", "name": "search_google", "input": {"query": "cats"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 12, "output_tokens": 7}
        });
        let url = serve_once("200 OK", body.to_string()).await;
        let response = proxy_client(url).send(&request()).await.unwrap();
        assert_eq!(response.content.len(), 2);
        assert_eq!(response.content[0], ContentBlock::text("Searching"));
        assert_eq!(response.stop_reason.as_deref(), Some("tool_use"));
    }
}

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Reply shape shared by every native procedure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcReply {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Remote procedure boundary to the out-of-process browser.
#[async_trait]
pub trait NativeDriver: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> Result<RpcReply>;

    /// Like [`NativeDriver::call`] for procedures that may legitimately run
    /// for `budget` before replying.
    async fn call_with_budget(
        &self,
        method: &str,
        params: Value,
        budget: Duration,
    ) -> Result<RpcReply> {
        let _ = budget;
        self.call(method, params).await
    }

    /// Bumped whenever the process behind the driver is lost, so state kept
    /// in it (the browser session) must be rebuilt.
    fn generation(&self) -> u64 {
        0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeDriverConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: IndexMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub headless: bool,
}

impl NativeDriverConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: IndexMap::new(),
            timeout_ms: None,
            headless: false,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(30_000))
    }
}

struct DriverProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    in_flight: bool,
}

impl Drop for DriverProcess {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

/// Speaks JSON-RPC 2.0 with `Content-Length` framing to a companion process
/// spawned on first use.
pub struct StdioDriver {
    config: NativeDriverConfig,
    request_timeout: Duration,
    request_id: AtomicU64,
    generation: AtomicU64,
    state: Mutex<Option<DriverProcess>>,
}

/// Bumps the generation unless disarmed, covering calls dropped mid-exchange.
struct InFlight<'a> {
    generation: &'a AtomicU64,
    armed: bool,
}

impl InFlight<'_> {
    fn settle(mut self, process_lost: bool) {
        self.armed = process_lost;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl StdioDriver {
    pub fn new(config: NativeDriverConfig) -> Self {
        let request_timeout = config.request_timeout();
        Self {
            config,
            request_timeout,
            request_id: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            state: Mutex::new(None),
        }
    }

    /// Read deadline for one request: never below the configured timeout.
    pub fn read_timeout(&self, budget: Option<Duration>) -> Duration {
        budget.map_or(self.request_timeout, |budget| budget.max(self.request_timeout))
    }

    async fn spawn(&self) -> Result<DriverProcess> {
        let mut command = Command::new(&self.config.program);
        if !self.config.args.is_empty() {
            command.args(&self.config.args);
        }
        if !self.config.env.is_empty() {
            command.envs(self.config.env.clone());
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .with_context(|| format!("spawning native driver {}", self.config.program))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to capture stdin for native driver"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture stdout for native driver"))?;
        debug!(target: "native_driver", program = %self.config.program, "spawned native driver");
        Ok(DriverProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            in_flight: false,
        })
    }

    async fn request(
        &self,
        method: &str,
        params: Value,
        budget: Option<Duration>,
    ) -> Result<RpcReply> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let mut guard = self.state.lock().await;
        // A call dropped mid-flight leaves the stream mid-frame.
        if guard.as_ref().is_some_and(|process| process.in_flight) {
            warn!(target: "native_driver", "restarting native driver after an interrupted call");
            guard.take();
        }
        if guard.is_none() {
            *guard = Some(self.spawn().await?);
        }
        let process = guard
            .as_mut()
            .ok_or_else(|| anyhow!("missing native driver process"))?;

        process.in_flight = true;
        let in_flight = InFlight {
            generation: &self.generation,
            armed: true,
        };
        let outcome = exchange(
            &mut process.stdout,
            &mut process.stdin,
            &body,
            id,
            self.read_timeout(budget),
        )
        .await;
        match outcome {
            Ok(payload) => {
                process.in_flight = false;
                in_flight.settle(false);
                extract_reply(payload, method)
            }
            Err(err) => {
                warn!(target: "native_driver", method, error = %err, "native driver transport failed");
                guard.take();
                in_flight.settle(true);
                Err(err)
            }
        }
    }
}

#[async_trait]
impl NativeDriver for StdioDriver {
    async fn call(&self, method: &str, params: Value) -> Result<RpcReply> {
        self.request(method, params, None).await
    }

    async fn call_with_budget(
        &self,
        method: &str,
        params: Value,
        budget: Duration,
    ) -> Result<RpcReply> {
        self.request(method, params, Some(budget)).await
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Sends `body` and reads frames until the reply carrying `request_id` arrives.
pub async fn exchange<R, W>(
    reader: &mut R,
    writer: &mut W,
    body: &Value,
    request_id: u64,
    timeout_dur: Duration,
) -> Result<Value>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    write_frame(writer, body).await?;
    loop {
        let payload = read_frame(reader, timeout_dur).await?;
        if matches_request(&payload, request_id) {
            return Ok(payload);
        }
        if let Some(method) = payload.get("method").and_then(Value::as_str) {
            debug!(target: "native_driver", method, "ignoring driver notification");
        }
    }
}

pub async fn write_frame<W>(writer: &mut W, body: &Value) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let payload = serde_json::to_vec(body)?;
    let header = format!("Content-Length: {}\r\n\r\n", payload.len());
    writer
        .write_all(header.as_bytes())
        .await
        .context("writing Content-Length header")?;
    writer
        .write_all(&payload)
        .await
        .context("writing driver payload")?;
    writer.flush().await.context("flushing driver stdin")?;
    Ok(())
}

pub async fn read_frame<R>(reader: &mut R, timeout_dur: Duration) -> Result<Value>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let read = timeout(timeout_dur, reader.read_line(&mut line))
            .await
            .map_err(|_| anyhow!("timed out waiting for driver headers"))??;
        if read == 0 {
            return Err(anyhow!("native driver closed stdout"));
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            if content_length.is_some() {
                break;
            }
            continue;
        }
        if let Some(value) = trimmed.strip_prefix("Content-Length:") {
            content_length = value.trim().parse::<usize>().ok();
        }
    }

    let length = content_length.ok_or_else(|| anyhow!("missing Content-Length header"))?;
    let mut buffer = vec![0u8; length];
    timeout(timeout_dur, reader.read_exact(&mut buffer))
        .await
        .map_err(|_| anyhow!("timed out waiting for driver body"))??;
    serde_json::from_slice(&buffer).context("decoding driver JSON payload")
}

fn matches_request(payload: &Value, request_id: u64) -> bool {
    match payload.get("id") {
        Some(Value::Number(num)) => num.as_u64() == Some(request_id),
        Some(Value::String(text)) => text.parse::<u64>().map_or(false, |id| id == request_id),
        _ => false,
    }
}

fn extract_reply(payload: Value, method: &str) -> Result<RpcReply> {
    if let Some(error) = payload.get("error") {
        return Err(anyhow!("native driver returned error for {method}: {error}"));
    }
    let result = payload
        .get("result")
        .cloned()
        .ok_or_else(|| anyhow!("native driver reply for {method} has no result"))?;
    serde_json::from_value(result).with_context(|| format!("decoding {method} reply"))
}

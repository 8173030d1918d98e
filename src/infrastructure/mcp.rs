use crate::application::backend::{BackendError, CapabilityBackend};
use crate::config::ServerConfig;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tracing::{debug, info, warn};

const PROTOCOL_VERSION: &str = "2025-06-18";
const METHOD_NOT_FOUND: i64 = -32601;

/// A capability server spawned as a child process and spoken to over
/// newline-delimited JSON-RPC on its stdio.
#[derive(Clone)]
pub struct McpServerProcess {
    inner: Arc<ProcessInner>,
}

struct ProcessInner {
    config: ServerConfig,
    state: AsyncMutex<Option<RunningState>>,
    writer: AsyncMutex<Option<BufWriter<ChildStdin>>>,
    pending: AsyncMutex<HashMap<String, oneshot::Sender<Result<Value, BackendError>>>>,
    id_counter: AtomicU64,
}

struct RunningState {
    child: Child,
}

impl McpServerProcess {
    /// Spawns the configured server and completes the initialize handshake.
    /// Callers treat failure here as fatal; there is no degraded mode
    /// without a capability server.
    pub async fn connect(config: ServerConfig) -> Result<Self, BackendError> {
        let process = Self {
            inner: Arc::new(ProcessInner {
                config,
                state: AsyncMutex::new(None),
                writer: AsyncMutex::new(None),
                pending: AsyncMutex::new(HashMap::new()),
                id_counter: AtomicU64::new(1),
            }),
        };
        process.inner.spawn_and_initialize().await?;
        Ok(process)
    }

    pub async fn shutdown(&self) {
        self.inner.reset().await;
    }

    /// Servers that do not implement a discovery method get an empty
    /// listing instead of a fatal error, matching how the original client
    /// treats partially capable servers.
    async fn list(&self, method: &str, field: &str) -> Result<Vec<Value>, BackendError> {
        match self.inner.send_request(method, json!({})).await {
            Ok(result) => Ok(result
                .get(field)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()),
            Err(BackendError::Rpc { code, .. }) if code == METHOD_NOT_FOUND => {
                info!(method, "Server does not support this capability");
                Ok(Vec::new())
            }
            Err(other) => Err(other),
        }
    }
}

#[async_trait]
impl CapabilityBackend for McpServerProcess {
    async fn list_resources(&self) -> Result<Vec<Value>, BackendError> {
        self.list("resources/list", "resources").await
    }

    async fn list_prompts(&self) -> Result<Vec<Value>, BackendError> {
        self.list("prompts/list", "prompts").await
    }

    async fn list_tools(&self) -> Result<Vec<Value>, BackendError> {
        self.list("tools/list", "tools").await
    }

    async fn read_resource(&self, uri: &str) -> Result<Value, BackendError> {
        self.inner
            .send_request("resources/read", json!({ "uri": uri }))
            .await
    }

    async fn render_prompt(&self, name: &str, arguments: Value) -> Result<Value, BackendError> {
        self.inner
            .send_request(
                "prompts/get",
                json!({ "name": name, "arguments": ensure_object(arguments) }),
            )
            .await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, BackendError> {
        self.inner
            .send_request(
                "tools/call",
                json!({ "name": name, "arguments": ensure_object(arguments) }),
            )
            .await
    }
}

fn ensure_object(arguments: Value) -> Value {
    match arguments {
        Value::Null => Value::Object(Default::default()),
        other => other,
    }
}

impl ProcessInner {
    async fn spawn_and_initialize(self: &Arc<Self>) -> Result<(), BackendError> {
        let mut command = Command::new(&self.config.command);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = &self.config.workdir {
            command.current_dir(dir);
        }
        if !self.config.args.is_empty() {
            command.args(&self.config.args);
        }
        for (key, value) in &self.config.env {
            command.env(key, value);
        }

        info!(command = %self.config.command, "Spawning capability server");
        let mut child = command.spawn().map_err(|source| BackendError::Spawn {
            command: self.config.command.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Transport("failed to capture server stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Transport("failed to capture server stdout".into()))?;

        {
            let mut writer = self.writer.lock().await;
            *writer = Some(BufWriter::new(stdin));
        }
        {
            let mut state = self.state.lock().await;
            *state = Some(RunningState { child });
        }

        let reader_self = Arc::clone(self);
        tokio::spawn(async move {
            reader_self.reader_loop(stdout).await;
        });

        match self.initialize_sequence().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.reset().await;
                Err(err)
            }
        }
    }

    async fn initialize_sequence(self: &Arc<Self>) -> Result<(), BackendError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {}
        });
        self.send_request("initialize", params).await?;
        self.send_notification("notifications/initialized", json!({}))
            .await?;
        debug!("Capability server handshake complete");
        Ok(())
    }

    async fn reader_loop(self: Arc<Self>, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(item) = lines.next_line().await {
            match item {
                Some(raw) => {
                    if raw.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(&raw) {
                        Ok(value) => {
                            if let Err(err) = self.process_inbound_message(value).await {
                                warn!(%err, "failed to process message from capability server");
                            }
                        }
                        Err(source) => {
                            warn!(line = raw, %source, "received invalid JSON from capability server");
                        }
                    }
                }
                None => break,
            }
        }

        self.reset().await;
    }

    async fn process_inbound_message(&self, value: Value) -> Result<(), BackendError> {
        if let Some(id) = value.get("id").cloned() {
            if value.get("method").is_some() {
                self.handle_server_request(id, value).await
            } else {
                self.handle_response(id, value).await
            }
        } else {
            if let Some(method) = value.get("method").and_then(Value::as_str) {
                debug!(method, "received notification from capability server");
            }
            Ok(())
        }
    }

    async fn handle_response(&self, id: Value, value: Value) -> Result<(), BackendError> {
        let key = match response_key(&id) {
            Some(key) => key,
            None => return Ok(()),
        };

        let responder = {
            let mut pending = self.pending.lock().await;
            pending.remove(&key)
        };

        let Some(sender) = responder else {
            debug!(response_id = key, "received response for unknown request");
            return Ok(());
        };

        if let Some(error) = value.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32000);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            let _ = sender.send(Err(BackendError::Rpc { code, message }));
        } else {
            let _ = sender.send(Ok(value));
        }
        Ok(())
    }

    async fn handle_server_request(&self, id: Value, value: Value) -> Result<(), BackendError> {
        let method = value
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match method {
            "ping" => {
                self.send_response(id, json!({})).await?;
            }
            other => {
                warn!(method = other, "capability server sent unsupported request");
                let error = json!({
                    "code": METHOD_NOT_FOUND,
                    "message": format!("client does not implement method '{other}'"),
                });
                self.send_error(id, error).await?;
            }
        }
        Ok(())
    }

    async fn send_request(&self, method: &str, params: Value) -> Result<Value, BackendError> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id.clone(), tx);
        }

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        });
        if let Err(err) = self.write_message(&payload).await {
            // No response will ever arrive for a request that was never
            // written; drop the entry instead of waiting for a reset.
            let mut pending = self.pending.lock().await;
            pending.remove(&id);
            return Err(err);
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(BackendError::Terminated),
        }
    }

    async fn send_notification(&self, method: &str, params: Value) -> Result<(), BackendError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });
        self.write_message(&payload).await
    }

    async fn send_response(&self, id: Value, result: Value) -> Result<(), BackendError> {
        let mut payload = json!({
            "jsonrpc": "2.0",
            "result": result
        });
        if let Value::Object(ref mut map) = payload {
            map.insert("id".to_string(), id);
        }
        self.write_message(&payload).await
    }

    async fn send_error(&self, id: Value, error: Value) -> Result<(), BackendError> {
        let mut payload = json!({
            "jsonrpc": "2.0",
            "error": error
        });
        if let Value::Object(ref mut map) = payload {
            map.insert("id".to_string(), id);
        }
        self.write_message(&payload).await
    }

    async fn write_message(&self, message: &Value) -> Result<(), BackendError> {
        let encoded = serde_json::to_string(message)?;

        let mut writer = self.writer.lock().await;
        let stream = writer
            .as_mut()
            .ok_or_else(|| BackendError::Transport("writer not initialised".into()))?;
        stream
            .write_all(encoded.as_bytes())
            .await
            .map_err(|source| BackendError::Transport(source.to_string()))?;
        stream
            .write_all(b"\n")
            .await
            .map_err(|source| BackendError::Transport(source.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|source| BackendError::Transport(source.to_string()))?;
        Ok(())
    }

    async fn reset(&self) {
        {
            let mut writer = self.writer.lock().await;
            *writer = None;
        }

        let mut state = self.state.lock().await;
        if let Some(mut running) = state.take() {
            if let Err(err) = running.child.kill().await {
                debug!(%err, "failed to kill capability server process (may have already exited)");
            }
            let _ = running.child.wait().await;
        }
        drop(state);

        self.fail_all_pending().await;
    }

    async fn fail_all_pending(&self) {
        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(BackendError::Terminated));
        }
    }

    fn next_id(&self) -> String {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        format!("req-{id}")
    }
}

fn response_key(id: &Value) -> Option<String> {
    match id {
        Value::String(value) => Some(value.clone()),
        Value::Number(num) => Some(num.to_string()),
        _ => None,
    }
}

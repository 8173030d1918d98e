use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by the capability server transport.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to spawn capability server '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("capability server transport error: {0}")]
    Transport(String),
    #[error("capability server returned invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("capability server returned JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("capability server terminated unexpectedly")]
    Terminated,
}

/// The six calls the client makes against a capability server: three
/// discovery listings and three invocations. Implemented by the stdio
/// JSON-RPC process in `infrastructure::mcp` and by stubs in tests.
#[async_trait]
pub trait CapabilityBackend: Send + Sync {
    async fn list_resources(&self) -> Result<Vec<Value>, BackendError>;

    async fn list_prompts(&self) -> Result<Vec<Value>, BackendError>;

    async fn list_tools(&self) -> Result<Vec<Value>, BackendError>;

    async fn read_resource(&self, uri: &str) -> Result<Value, BackendError>;

    async fn render_prompt(&self, name: &str, arguments: Value) -> Result<Value, BackendError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, BackendError>;
}

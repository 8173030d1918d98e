use crate::application::backend::{BackendError, CapabilityBackend};
use crate::application::binder::ArgumentMap;
use crate::application::registry::CapabilityRegistry;
use crate::domain::types::{CapabilityDescriptor, CapabilityKind};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: CapabilityKind, name: String },
    #[error("remote {kind} call failed: {message}")]
    Remote { kind: CapabilityKind, message: String },
    #[error("tool '{name}' reported an error: {message}")]
    Tool { name: String, message: String },
    #[error("capability server unreachable: {0}")]
    Transport(#[source] BackendError),
}

impl InvokeError {
    pub fn user_message(&self) -> String {
        match self {
            InvokeError::NotFound { kind, name } => {
                format!("No {kind} named '{name}' is available on this server.")
            }
            InvokeError::Remote { kind, message } => {
                format!("The server could not complete the {kind} call: {message}")
            }
            InvokeError::Tool { name, message } => {
                format!("Tool '{name}' failed: {message}")
            }
            InvokeError::Transport(_) => {
                "Lost the connection to the capability server. Check that it is still running."
                    .to_string()
            }
        }
    }

    /// Failures the mediation loop relays back to the model as a tool turn.
    /// Transport failures abort the query instead.
    pub fn is_relayable(&self) -> bool {
        !matches!(self, InvokeError::Transport(_))
    }
}

/// Executes a single validated resource fetch, prompt render, or tool call.
/// Holds no state between calls.
pub struct CapabilityInvoker {
    backend: Arc<dyn CapabilityBackend>,
    registry: Arc<CapabilityRegistry>,
}

impl CapabilityInvoker {
    pub fn new(backend: Arc<dyn CapabilityBackend>, registry: Arc<CapabilityRegistry>) -> Self {
        Self { backend, registry }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub async fn invoke(
        &self,
        kind: CapabilityKind,
        name: &str,
        arguments: &ArgumentMap,
    ) -> Result<Value, InvokeError> {
        let descriptor = self
            .registry
            .lookup(kind, name)
            .ok_or_else(|| InvokeError::NotFound {
                kind,
                name: name.to_string(),
            })?;
        info!(%kind, name, arguments = arguments.len(), "Invoking capability");

        match kind {
            CapabilityKind::Resource => self.fetch_resource(descriptor).await,
            CapabilityKind::Prompt => self.render_prompt(descriptor, arguments).await,
            CapabilityKind::Tool => self.call_tool(descriptor, arguments).await,
        }
    }

    async fn fetch_resource(
        &self,
        descriptor: &CapabilityDescriptor,
    ) -> Result<Value, InvokeError> {
        let uri = descriptor.uri.as_deref().unwrap_or(&descriptor.name);
        let result = self
            .backend
            .read_resource(uri)
            .await
            .map_err(|error| map_backend_error(error, CapabilityKind::Resource))?;

        let text = result
            .get("contents")
            .and_then(Value::as_array)
            .and_then(|contents| contents.first())
            .and_then(|content| content.get("text"))
            .and_then(Value::as_str);
        match text {
            Some(text) => Ok(parse_payload(text)),
            None => {
                debug!(name = %descriptor.name, "Resource response had no text content");
                Ok(result)
            }
        }
    }

    async fn render_prompt(
        &self,
        descriptor: &CapabilityDescriptor,
        arguments: &ArgumentMap,
    ) -> Result<Value, InvokeError> {
        let result = self
            .backend
            .render_prompt(&descriptor.name, arguments_json(arguments))
            .await
            .map_err(|error| map_backend_error(error, CapabilityKind::Prompt))?;

        let rendered = result
            .get("messages")
            .and_then(Value::as_array)
            .map(|messages| {
                messages
                    .iter()
                    .filter_map(|message| {
                        message
                            .get("content")
                            .and_then(|content| content.get("text"))
                            .and_then(Value::as_str)
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        if rendered.is_empty() {
            warn!(name = %descriptor.name, "Prompt rendered to empty text");
        }
        Ok(Value::String(rendered))
    }

    async fn call_tool(
        &self,
        descriptor: &CapabilityDescriptor,
        arguments: &ArgumentMap,
    ) -> Result<Value, InvokeError> {
        let result = self
            .backend
            .call_tool(&descriptor.name, arguments_json(arguments))
            .await
            .map_err(|error| match error {
                BackendError::Rpc { message, .. } => InvokeError::Tool {
                    name: descriptor.name.clone(),
                    message,
                },
                transport => InvokeError::Transport(transport),
            })?;

        let payload = tool_payload(&result);
        if result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return Err(InvokeError::Tool {
                name: descriptor.name.clone(),
                message: payload_text(&payload),
            });
        }
        Ok(payload)
    }
}

fn map_backend_error(error: BackendError, kind: CapabilityKind) -> InvokeError {
    match error {
        BackendError::Rpc { message, .. } => InvokeError::Remote { kind, message },
        transport => InvokeError::Transport(transport),
    }
}

fn arguments_json(arguments: &ArgumentMap) -> Value {
    let mut map = Map::new();
    for (key, value) in arguments {
        map.insert(key.clone(), Value::String(value.clone()));
    }
    Value::Object(map)
}

/// Tool results prefer structured content, then the first text block.
fn tool_payload(result: &Value) -> Value {
    if let Some(structured) = result.get("structuredContent") {
        return structured.clone();
    }
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|content| content.first())
        .and_then(|block| block.get("text"))
        .and_then(Value::as_str);
    match text {
        Some(text) => parse_payload(text),
        None => result.clone(),
    }
}

/// Payload text that happens to be JSON is surfaced structured, so the user
/// and the model both see records instead of an escaped string.
fn parse_payload(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn payload_text(payload: &Value) -> String {
    match payload {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

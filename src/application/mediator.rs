use crate::application::binder::{self, BindError};
use crate::application::invoker::{CapabilityInvoker, InvokeError};
use crate::domain::types::{CapabilityKind, ToolCallRequest, Turn};
use crate::infrastructure::model::{CompletionRequest, ModelError, ModelProvider};
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Invoke(#[from] InvokeError),
    #[error("model did not reach a final answer within {rounds} tool rounds")]
    LoopExceeded { rounds: usize },
}

impl QueryError {
    pub fn user_message(&self) -> String {
        match self {
            QueryError::Model(error) => error.user_message(),
            QueryError::Invoke(error) => error.user_message(),
            QueryError::LoopExceeded { rounds } => format!(
                "The model kept requesting tools without answering and was stopped after {rounds} rounds."
            ),
        }
    }
}

/// What one completion call produced, decided in a single classification
/// step before the loop acts on the reply.
#[derive(Debug, PartialEq)]
pub enum ModelReply {
    FinalText(String),
    ToolCall(ToolCallRequest),
}

#[derive(Debug, Clone)]
pub struct MediatorOptions {
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_rounds: usize,
}

/// Alternates between model completions and tool executions until the model
/// produces a final answer or the round bound is hit.
///
/// Every tool outcome, success or failure, goes back into the conversation
/// as a tool turn so the model can correct itself instead of the whole
/// query failing.
pub struct Mediator<P: ModelProvider> {
    model: P,
    invoker: Arc<CapabilityInvoker>,
    options: MediatorOptions,
}

impl<P: ModelProvider> Mediator<P> {
    pub fn new(model: P, invoker: Arc<CapabilityInvoker>, options: MediatorOptions) -> Self {
        Self {
            model,
            invoker,
            options,
        }
    }

    pub async fn resolve(&self, query: impl Into<String>) -> Result<String, QueryError> {
        let mut turns = vec![Turn::user(query)];
        let system = self.system_instruction();
        let mut rounds_used = 0usize;

        loop {
            debug!(
                turns = turns.len(),
                rounds_used, "Submitting conversation to model"
            );
            let reply = self
                .model
                .complete(CompletionRequest {
                    model: self.options.model.clone(),
                    system: system.clone(),
                    turns: turns.clone(),
                })
                .await?;

            match classify(&reply) {
                ModelReply::FinalText(text) => {
                    info!(rounds_used, "Model produced final answer");
                    return Ok(text);
                }
                ModelReply::ToolCall(request) => {
                    if rounds_used == self.options.max_rounds {
                        warn!(
                            rounds = self.options.max_rounds,
                            "Tool round bound exceeded"
                        );
                        return Err(QueryError::LoopExceeded {
                            rounds: self.options.max_rounds,
                        });
                    }
                    rounds_used += 1;
                    info!(tool = %request.tool, rounds_used, "Model requested tool call");
                    turns.push(Turn::model(reply));
                    let outcome = self.execute(&request).await?;
                    turns.push(outcome);
                }
            }
        }
    }

    /// Runs one requested tool call and folds the outcome into a tool turn.
    /// Only transport failures abort the query.
    async fn execute(&self, request: &ToolCallRequest) -> Result<Turn, QueryError> {
        let descriptor = match self
            .invoker
            .registry()
            .lookup(CapabilityKind::Tool, &request.tool)
        {
            Some(descriptor) => descriptor,
            None => {
                warn!(tool = %request.tool, "Model requested a tool absent from the catalog");
                return Ok(failure_turn(
                    &request.tool,
                    format!("unknown tool '{}'", request.tool),
                ));
            }
        };

        let arguments = match binder::bind_object(descriptor, &request.arguments) {
            Ok(arguments) => arguments,
            Err(error) => {
                warn!(tool = %request.tool, %error, "Model-supplied arguments failed to bind");
                return Ok(failure_turn(&request.tool, bind_detail(&error)));
            }
        };

        match self
            .invoker
            .invoke(CapabilityKind::Tool, &request.tool, &arguments)
            .await
        {
            Ok(payload) => Ok(Turn::tool(
                request.tool.clone(),
                json!({
                    "tool": request.tool,
                    "success": true,
                    "result": payload,
                })
                .to_string(),
            )),
            Err(error) if error.is_relayable() => {
                warn!(tool = %request.tool, %error, "Tool invocation failed; relaying to model");
                Ok(failure_turn(&request.tool, error.to_string()))
            }
            Err(transport) => Err(transport.into()),
        }
    }

    fn system_instruction(&self) -> String {
        let mut lines = vec![
            "You are a chatbot that can call server-side tools to answer user requests."
                .to_string(),
            "To call a tool, reply with exactly one JSON object: {\"action\":\"call_tool\",\"tool\":\"<name>\",\"arguments\":{...}}."
                .to_string(),
            "Tool outcomes come back as a message of the form {\"tool\":...,\"success\":...,\"result\"|\"error\":...}; on an error you may retry with corrected arguments."
                .to_string(),
            "When you have the answer, reply with plain text and no JSON.".to_string(),
        ];

        let tools = self.invoker.registry().list(CapabilityKind::Tool);
        if tools.is_empty() {
            lines.push("No tools are available; always answer directly.".to_string());
        } else {
            lines.push("Available tools:".to_string());
            for tool in tools {
                let params = if tool.params.is_empty() {
                    "none".to_string()
                } else {
                    tool.params
                        .iter()
                        .map(|param| {
                            let requirement = if param.required { "required" } else { "optional" };
                            format!("{} ({}, {requirement})", param.name, param.type_hint)
                        })
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                let description = if tool.description.is_empty() {
                    "No description provided."
                } else {
                    &tool.description
                };
                lines.push(format!("- {}: {} Arguments: {}", tool.name, description, params));
            }
        }

        if let Some(extra) = &self.options.system_prompt {
            if !extra.trim().is_empty() {
                lines.push(extra.trim().to_string());
            }
        }

        lines.join("\n")
    }
}

fn failure_turn(tool: &str, detail: String) -> Turn {
    Turn::tool(
        tool.to_string(),
        json!({
            "tool": tool,
            "success": false,
            "error": detail,
        })
        .to_string(),
    )
}

fn bind_detail(error: &BindError) -> String {
    match error {
        BindError::MalformedToken(token) => format!("arguments were not an object: {token}"),
        other => other.to_string(),
    }
}

/// Classifies one model reply as a final answer or a tool call.
///
/// The only recognized tool-call shape is a JSON object with
/// `"action":"call_tool"` (bare, fenced, or embedded in surrounding text).
/// Everything else is treated as a final answer, so a misformatted reply
/// degrades to visible text rather than a silent misparse.
pub fn classify(content: &str) -> ModelReply {
    if let Some(value) = extract_json(content) {
        if value.get("action").and_then(Value::as_str) == Some("call_tool") {
            let tool = value
                .get("tool")
                .or_else(|| value.get("tool_name"))
                .or_else(|| value.get("name"))
                .and_then(Value::as_str);
            if let Some(tool) = tool {
                let arguments = value
                    .get("arguments")
                    .or_else(|| value.get("input"))
                    .cloned()
                    .unwrap_or(Value::Null);
                return ModelReply::ToolCall(ToolCallRequest {
                    tool: tool.to_string(),
                    arguments,
                });
            }
        }
    }
    ModelReply::FinalText(content.trim().to_string())
}

fn extract_json(content: &str) -> Option<Value> {
    let trimmed = content.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    if trimmed.starts_with("```") {
        let stripped = trimmed.trim_start_matches("```json");
        let stripped = stripped.trim_start_matches("```JSON");
        let stripped = stripped.trim_start_matches("```");
        if let Some(end) = stripped.rfind("```") {
            let slice = &stripped[..end];
            if let Ok(value) = serde_json::from_str::<Value>(slice.trim()) {
                return Some(value);
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            let candidate = &trimmed[start..=end];
            if let Ok(value) = serde_json::from_str::<Value>(candidate) {
                return Some(value);
            }
        }
    }

    None
}

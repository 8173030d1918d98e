use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The three asset classes a capability server advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Resource,
    Prompt,
    Tool,
}

impl CapabilityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CapabilityKind::Resource => "resource",
            CapabilityKind::Prompt => "prompt",
            CapabilityKind::Tool => "tool",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parameter of a capability's argument schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub type_hint: String,
    pub required: bool,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, type_hint: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            type_hint: type_hint.into(),
            required,
        }
    }
}

/// A normalized descriptor for one resource, prompt, or tool.
///
/// Built once at discovery time from the server's loosely structured
/// listings; read-only for the rest of the session. Resources keep the URI
/// the server reads them by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub kind: CapabilityKind,
    pub description: String,
    pub params: Vec<ParamSpec>,
    pub uri: Option<String>,
}

impl CapabilityDescriptor {
    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|param| param.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
            Role::Tool => "tool",
        }
    }
}

/// One entry in the conversation sent to the model.
///
/// The sequence grows within a single query resolution and is discarded
/// once a final answer is produced; there is no cross-query memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    /// Set on tool turns only: the tool whose outcome this turn reports.
    pub tool: Option<String>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool: None,
        }
    }

    pub fn model(content: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            content: content.into(),
            tool: None,
        }
    }

    pub fn tool(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool: Some(name.into()),
        }
    }
}

/// A tool invocation the model asked for, decoded from its reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub tool: String,
    pub arguments: Value,
}

use crate::application::backend::{BackendError, CapabilityBackend};
use crate::domain::types::{CapabilityDescriptor, CapabilityKind, ParamSpec};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("capability discovery for {kind}s failed: {source}")]
    Discovery {
        kind: CapabilityKind,
        #[source]
        source: BackendError,
    },
}

/// The catalog of resources, prompts, and tools advertised by the server.
///
/// Populated once at startup and read-only afterwards; discovery failure is
/// fatal because no session command can be serviced without a catalog.
#[derive(Debug)]
pub struct CapabilityRegistry {
    entries: Vec<CapabilityDescriptor>,
    index: HashMap<(CapabilityKind, String), usize>,
}

impl CapabilityRegistry {
    pub async fn discover(backend: &dyn CapabilityBackend) -> Result<Self, RegistryError> {
        let resources = backend
            .list_resources()
            .await
            .map_err(|source| RegistryError::Discovery {
                kind: CapabilityKind::Resource,
                source,
            })?;
        let prompts = backend
            .list_prompts()
            .await
            .map_err(|source| RegistryError::Discovery {
                kind: CapabilityKind::Prompt,
                source,
            })?;
        let tools = backend
            .list_tools()
            .await
            .map_err(|source| RegistryError::Discovery {
                kind: CapabilityKind::Tool,
                source,
            })?;

        let mut registry = Self {
            entries: Vec::new(),
            index: HashMap::new(),
        };
        for raw in &resources {
            registry.insert(normalize_resource(raw), CapabilityKind::Resource);
        }
        for raw in &prompts {
            registry.insert(normalize_prompt(raw), CapabilityKind::Prompt);
        }
        for raw in &tools {
            registry.insert(normalize_tool(raw), CapabilityKind::Tool);
        }

        info!(
            resources = registry.list(CapabilityKind::Resource).len(),
            prompts = registry.list(CapabilityKind::Prompt).len(),
            tools = registry.list(CapabilityKind::Tool).len(),
            "Capability catalog discovered"
        );
        Ok(registry)
    }

    fn insert(&mut self, descriptor: Option<CapabilityDescriptor>, kind: CapabilityKind) {
        let Some(descriptor) = descriptor else {
            warn!(%kind, "Skipping advertised descriptor without a name");
            return;
        };
        let key = (kind, descriptor.name.clone());
        if self.index.contains_key(&key) {
            warn!(%kind, name = %descriptor.name, "Duplicate descriptor ignored");
            return;
        }
        debug!(%kind, name = %descriptor.name, "Registered capability");
        self.index.insert(key, self.entries.len());
        self.entries.push(descriptor);
    }

    /// Descriptors of one kind, in the order the server advertised them.
    pub fn list(&self, kind: CapabilityKind) -> Vec<&CapabilityDescriptor> {
        self.entries
            .iter()
            .filter(|entry| entry.kind == kind)
            .collect()
    }

    pub fn lookup(&self, kind: CapabilityKind, name: &str) -> Option<&CapabilityDescriptor> {
        self.index
            .get(&(kind, name.to_string()))
            .map(|&position| &self.entries[position])
    }
}

fn normalize_resource(raw: &Value) -> Option<CapabilityDescriptor> {
    let name = raw.get("name").and_then(Value::as_str)?;
    Some(CapabilityDescriptor {
        name: name.to_string(),
        kind: CapabilityKind::Resource,
        description: description_of(raw),
        params: Vec::new(),
        uri: raw
            .get("uri")
            .and_then(Value::as_str)
            .map(|uri| uri.to_string()),
    })
}

fn normalize_prompt(raw: &Value) -> Option<CapabilityDescriptor> {
    let name = raw.get("name").and_then(Value::as_str)?;
    let params = raw
        .get("arguments")
        .and_then(Value::as_array)
        .map(|arguments| {
            arguments
                .iter()
                .filter_map(|argument| {
                    let param = argument.get("name").and_then(Value::as_str)?;
                    let required = argument
                        .get("required")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    Some(ParamSpec::new(param, "string", required))
                })
                .collect()
        })
        .unwrap_or_default();
    Some(CapabilityDescriptor {
        name: name.to_string(),
        kind: CapabilityKind::Prompt,
        description: description_of(raw),
        params,
        uri: None,
    })
}

fn normalize_tool(raw: &Value) -> Option<CapabilityDescriptor> {
    let name = raw.get("name").and_then(Value::as_str)?;
    let schema = raw.get("inputSchema");
    let required: Vec<&str> = schema
        .and_then(|schema| schema.get("required"))
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let params = schema
        .and_then(|schema| schema.get("properties"))
        .and_then(Value::as_object)
        .map(|properties| {
            properties
                .iter()
                .map(|(param, spec)| {
                    let type_hint = spec
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("string");
                    ParamSpec::new(param, type_hint, required.contains(&param.as_str()))
                })
                .collect()
        })
        .unwrap_or_default();
    Some(CapabilityDescriptor {
        name: name.to_string(),
        kind: CapabilityKind::Tool,
        description: description_of(raw),
        params,
        uri: None,
    })
}

fn description_of(raw: &Value) -> String {
    raw.get("description")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct StubBackend {
        resources: Vec<Value>,
        prompts: Vec<Value>,
        tools: Vec<Value>,
    }

    #[async_trait]
    impl CapabilityBackend for StubBackend {
        async fn list_resources(&self) -> Result<Vec<Value>, BackendError> {
            Ok(self.resources.clone())
        }

        async fn list_prompts(&self) -> Result<Vec<Value>, BackendError> {
            Ok(self.prompts.clone())
        }

        async fn list_tools(&self) -> Result<Vec<Value>, BackendError> {
            Ok(self.tools.clone())
        }

        async fn read_resource(&self, _uri: &str) -> Result<Value, BackendError> {
            Ok(Value::Null)
        }

        async fn render_prompt(
            &self,
            _name: &str,
            _arguments: Value,
        ) -> Result<Value, BackendError> {
            Ok(Value::Null)
        }

        async fn call_tool(&self, _name: &str, _arguments: Value) -> Result<Value, BackendError> {
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn normalizes_all_three_kinds() {
        let backend = StubBackend {
            resources: vec![json!({
                "uri": "api://get_data",
                "name": "api_get_data",
                "description": "Call the get data endpoint"
            })],
            prompts: vec![json!({
                "name": "summarize",
                "description": "Summarize a document",
                "arguments": [
                    {"name": "topic", "required": true},
                    {"name": "tone", "required": false}
                ]
            })],
            tools: vec![json!({
                "name": "execute_gpt4all",
                "description": "Generate a response using the local model",
                "inputSchema": {
                    "type": "object",
                    "properties": {"prompt": {"type": "string"}},
                    "required": ["prompt"]
                }
            })],
        };

        let registry = CapabilityRegistry::discover(&backend)
            .await
            .expect("discovery succeeds");

        let resource = registry
            .lookup(CapabilityKind::Resource, "api_get_data")
            .expect("resource registered");
        assert_eq!(resource.uri.as_deref(), Some("api://get_data"));
        assert!(resource.params.is_empty());

        let prompt = registry
            .lookup(CapabilityKind::Prompt, "summarize")
            .expect("prompt registered");
        assert_eq!(prompt.params.len(), 2);
        assert!(prompt.param("topic").expect("topic param").required);
        assert!(!prompt.param("tone").expect("tone param").required);

        let tool = registry
            .lookup(CapabilityKind::Tool, "execute_gpt4all")
            .expect("tool registered");
        assert_eq!(tool.params.len(), 1);
        assert_eq!(tool.params[0].type_hint, "string");
        assert!(tool.params[0].required);
    }

    #[tokio::test]
    async fn skips_descriptors_without_a_name() {
        let backend = StubBackend {
            resources: vec![
                json!({"uri": "api://anonymous"}),
                json!({"uri": "api://test", "name": "api_test"}),
            ],
            prompts: Vec::new(),
            tools: Vec::new(),
        };

        let registry = CapabilityRegistry::discover(&backend)
            .await
            .expect("discovery succeeds");
        let resources = registry.list(CapabilityKind::Resource);
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].name, "api_test");
    }

    #[tokio::test]
    async fn lookup_misses_return_none() {
        let backend = StubBackend {
            resources: Vec::new(),
            prompts: Vec::new(),
            tools: Vec::new(),
        };
        let registry = CapabilityRegistry::discover(&backend)
            .await
            .expect("discovery succeeds");
        assert!(registry.lookup(CapabilityKind::Tool, "missing").is_none());
    }

    struct FailingBackend;

    #[async_trait]
    impl CapabilityBackend for FailingBackend {
        async fn list_resources(&self) -> Result<Vec<Value>, BackendError> {
            Err(BackendError::Terminated)
        }

        async fn list_prompts(&self) -> Result<Vec<Value>, BackendError> {
            Ok(Vec::new())
        }

        async fn list_tools(&self) -> Result<Vec<Value>, BackendError> {
            Ok(Vec::new())
        }

        async fn read_resource(&self, _uri: &str) -> Result<Value, BackendError> {
            Ok(Value::Null)
        }

        async fn render_prompt(
            &self,
            _name: &str,
            _arguments: Value,
        ) -> Result<Value, BackendError> {
            Ok(Value::Null)
        }

        async fn call_tool(&self, _name: &str, _arguments: Value) -> Result<Value, BackendError> {
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn failed_handshake_is_an_error() {
        let error = CapabilityRegistry::discover(&FailingBackend)
            .await
            .expect_err("discovery fails");
        assert!(matches!(
            error,
            RegistryError::Discovery {
                kind: CapabilityKind::Resource,
                ..
            }
        ));
    }
}

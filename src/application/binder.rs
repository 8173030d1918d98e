use crate::domain::types::CapabilityDescriptor;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Validated arguments for one invocation. Values stay strings; any
/// coercion is the invoker's concern.
pub type ArgumentMap = BTreeMap<String, String>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BindError {
    #[error("malformed argument '{0}': expected key=value")]
    MalformedToken(String),
    #[error("missing required argument '{0}'")]
    MissingArgument(String),
    #[error("unknown argument '{0}'")]
    UnknownArgument(String),
}

/// Binds user-typed `key=value` tokens against a descriptor's schema.
pub fn bind_tokens(
    descriptor: &CapabilityDescriptor,
    tokens: &[String],
) -> Result<ArgumentMap, BindError> {
    let mut arguments = ArgumentMap::new();
    for token in tokens {
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| BindError::MalformedToken(token.clone()))?;
        arguments.insert(key.to_string(), strip_quotes(value).to_string());
    }
    validate(descriptor, &arguments)?;
    Ok(arguments)
}

/// Binds model-supplied arguments, which arrive as a JSON object. Values
/// that are not strings are carried over as their JSON text.
pub fn bind_object(
    descriptor: &CapabilityDescriptor,
    arguments: &Value,
) -> Result<ArgumentMap, BindError> {
    let mut bound = ArgumentMap::new();
    match arguments {
        Value::Null => {}
        Value::Object(map) => {
            for (key, value) in map {
                let text = match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                bound.insert(key.clone(), text);
            }
        }
        other => return Err(BindError::MalformedToken(other.to_string())),
    }
    validate(descriptor, &bound)?;
    Ok(bound)
}

fn validate(descriptor: &CapabilityDescriptor, arguments: &ArgumentMap) -> Result<(), BindError> {
    for key in arguments.keys() {
        if descriptor.param(key).is_none() {
            return Err(BindError::UnknownArgument(key.clone()));
        }
    }
    for param in &descriptor.params {
        if param.required && !arguments.contains_key(&param.name) {
            return Err(BindError::MissingArgument(param.name.clone()));
        }
    }
    Ok(())
}

fn strip_quotes(value: &str) -> &str {
    let stripped = value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'));
    let stripped = stripped.or_else(|| {
        value
            .strip_prefix('\'')
            .and_then(|rest| rest.strip_suffix('\''))
    });
    stripped.unwrap_or(value)
}

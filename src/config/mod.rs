use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

const DEFAULT_MODEL: &str = "llama3";
const DEFAULT_MODEL_URL: &str = "http://127.0.0.1:11434";
const DEFAULT_CONFIG_PATH: &str = "config/chatbot.toml";
pub const DEFAULT_MAX_ROUNDS: usize = 8;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub model: String,
    pub model_url: String,
    pub max_rounds: usize,
    pub system_prompt: Option<String>,
    pub server: ServerConfig,
}

/// Launch configuration for the capability server process.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub workdir: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: "fastmcp".to_string(),
            args: vec!["run".to_string(), "mcp_server.py".to_string()],
            env: HashMap::new(),
            workdir: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config from {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    model: Option<String>,
    model_url: Option<String>,
    max_rounds: Option<usize>,
    system_prompt: Option<String>,
    server: Option<ServerConfig>,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return read_config(path);
        }
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        match read_config(default_path) {
            Ok(config) => Ok(config),
            Err(ConfigError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                info!("Configuration file not found; using defaults");
                Ok(Self::default())
            }
            Err(other) => Err(other),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            model_url: DEFAULT_MODEL_URL.to_string(),
            max_rounds: DEFAULT_MAX_ROUNDS,
            system_prompt: None,
            server: ServerConfig::default(),
        }
    }
}

fn read_config(path: &Path) -> Result<AppConfig, ConfigError> {
    debug!(path = %path.display(), "Reading chatbot configuration file");
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: RawConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(AppConfig {
        model: parsed.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        model_url: parsed
            .model_url
            .unwrap_or_else(|| DEFAULT_MODEL_URL.to_string()),
        max_rounds: parsed.max_rounds.unwrap_or(DEFAULT_MAX_ROUNDS),
        system_prompt: parsed.system_prompt,
        server: parsed.server.unwrap_or_default(),
    })
}

//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level sidecar configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SidecarConfig {
    pub api_port: u16,

    /// Simultaneous in-flight proxy calls admitted by the API layer.
    /// The upstream server does its own queuing beyond this.
    pub max_concurrent_requests: usize,

    pub graceful_shutdown_timeout_secs: u64,

    pub server: ServerConfig,
    pub readiness: ReadinessConfig,
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            max_concurrent_requests: default_max_concurrent_requests(),
            graceful_shutdown_timeout_secs: default_graceful_shutdown_timeout(),
            server: ServerConfig::default(),
            readiness: ReadinessConfig::default(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
        }
    }
}

impl SidecarConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(port) = std::env::var("SIDECAR_API_PORT") {
            config.api_port = port.parse().context("Invalid SIDECAR_API_PORT value")?;
        }
        if let Ok(model_id) = std::env::var("SIDECAR_MODEL_ID") {
            config.server.model_id = model_id;
        }
        if let Ok(port) = std::env::var("SIDECAR_SERVER_PORT") {
            config.server.port = port.parse().context("Invalid SIDECAR_SERVER_PORT value")?;
        }
        if let Ok(binary_path) = std::env::var("SIDECAR_BINARY_PATH") {
            config.server.binary_path = Some(binary_path);
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_port < 1024 {
            anyhow::bail!("API port must be >= 1024 (got {})", self.api_port);
        }
        if self.server.port < 1024 {
            anyhow::bail!("Server port must be >= 1024 (got {})", self.server.port);
        }
        if self.server.port == self.api_port {
            anyhow::bail!(
                "Server port {} conflicts with API port",
                self.server.port
            );
        }
        if self.server.model_id.is_empty() {
            anyhow::bail!("Model id cannot be empty");
        }
        if self.embedding.batch_size == 0 {
            anyhow::bail!("Embedding batch size must be > 0");
        }
        if self.max_concurrent_requests == 0 {
            anyhow::bail!("max_concurrent_requests must be > 0");
        }

        Ok(())
    }
}

/// Which pre-built inference server this sidecar fronts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    Embedding,
    Generation,
}

impl ServerRole {
    /// Binary shipped in the corresponding upstream container image
    pub fn default_binary(&self) -> &'static str {
        match self {
            ServerRole::Embedding => "text-embeddings-router",
            ServerRole::Generation => "text-generation-launcher",
        }
    }
}

/// Configuration for the launched inference server process
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub role: ServerRole,

    /// Override for the launcher executable; defaults to the role's binary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary_path: Option<String>,

    pub model_id: String,

    /// Optional revision pin (commit hash or tag on the model repo)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    /// Quantization mode, e.g. "gptq" or "bitsandbytes"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantize: Option<String>,

    /// Loopback port the server listens on
    pub port: u16,

    /// Additional CLI args passed through to the launcher
    pub extra_args: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            role: ServerRole::Generation,
            binary_path: None,
            model_id: default_model_id(),
            revision: None,
            quantize: None,
            port: default_server_port(),
            extra_args: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn binary(&self) -> &str {
        self.binary_path
            .as_deref()
            .unwrap_or_else(|| self.role.default_binary())
    }
}

/// Readiness gate polling knobs
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ReadinessConfig {
    pub poll_interval_ms: u64,
    pub connect_timeout_ms: u64,

    /// Total probe budget. None polls until the subprocess either accepts
    /// a connection or exits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_attempts: None,
        }
    }
}

/// Embedding proxy knobs
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Texts per upstream /embed call
    pub batch_size: usize,

    /// Batches submitted concurrently
    pub max_in_flight: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

/// Generation proxy knobs
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_new_tokens: u32,
    pub request_timeout_secs: u64,

    /// System prompt substituted into the instruction template
    pub system_prompt: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: default_max_new_tokens(),
            request_timeout_secs: default_request_timeout(),
            system_prompt: String::new(),
        }
    }
}

// Default functions
fn default_api_port() -> u16 {
    9000
}
fn default_server_port() -> u16 {
    8000
}
fn default_max_concurrent_requests() -> usize {
    10
}
fn default_graceful_shutdown_timeout() -> u64 {
    30
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_connect_timeout_ms() -> u64 {
    1000
}
fn default_batch_size() -> usize {
    32
}
fn default_max_in_flight() -> usize {
    10
}
fn default_max_new_tokens() -> u32 {
    1024
}
fn default_request_timeout() -> u64 {
    60
}
fn default_model_id() -> String {
    "meta-llama/Llama-2-70b-chat-hf".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SidecarConfig::default();
        assert_eq!(config.api_port, 9000);
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.embedding.batch_size, 32);
        assert_eq!(config.max_concurrent_requests, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_role_binary_defaults() {
        let mut config = ServerConfig::default();
        assert_eq!(config.binary(), "text-generation-launcher");

        config.role = ServerRole::Embedding;
        assert_eq!(config.binary(), "text-embeddings-router");

        config.binary_path = Some("/opt/bin/router".to_string());
        assert_eq!(config.binary(), "/opt/bin/router");
    }

    #[test]
    fn test_port_validation() {
        let config = SidecarConfig {
            api_port: 500, // Below 1024
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_port_conflict_detection() {
        let mut config = SidecarConfig::default();
        config.server.port = config.api_port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = SidecarConfig::default();
        config.embedding.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let toml_src = r#"
api_port = 9100

[server]
role = "embedding"
model_id = "BAAI/bge-base-en-v1.5"
port = 8001

[embedding]
batch_size = 16

[readiness]
max_attempts = 5
"#;
        let config: SidecarConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.server.role, ServerRole::Embedding);
        assert_eq!(config.server.model_id, "BAAI/bge-base-en-v1.5");
        assert_eq!(config.embedding.batch_size, 16);
        assert_eq!(config.readiness.max_attempts, Some(5));
        // Unspecified sections keep defaults
        assert_eq!(config.generation.max_new_tokens, 1024);
        assert!(config.validate().is_ok());
    }
}

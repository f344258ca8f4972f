//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{EngineError, Result};
use crate::protocol::{Protocol, ProtocolRegistry};

/// Logging options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of plain text.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Engine settings. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Prefix of topic names and bucket config ids.
    pub topic_prefix: String,
    /// Consolidation tries per AddListener before giving up.
    pub consolidation_attempts: u32,
    /// Events routed by every bucket config entry.
    pub event_names: Vec<String>,
    /// Partition used in the publish policy source ARN.
    pub source_arn_partition: String,
    /// Protocols accepted by AddListener.
    pub enabled_protocols: Vec<Protocol>,
    /// Delete the topics of notifications retired by a successful config rewrite.
    pub delete_retired_topics: bool,
    /// Logging options.
    pub log: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "iris-".to_string(),
            consolidation_attempts: 3,
            event_names: vec!["s3:ObjectCreated:*".to_string()],
            source_arn_partition: "aws".to_string(),
            enabled_protocols: Protocol::ALL.to_vec(),
            delete_retired_topics: false,
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: EngineConfig = match ext.to_lowercase().as_str() {
            "toml" => Self::parse_toml(&contents)?,
            "json" => serde_json::from_str(&contents).map_err(|e| EngineError::Config(e.to_string()))?,
            _ => {
                return Err(EngineError::Config(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config = Self::parse_toml(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn parse_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.topic_prefix.is_empty() {
            return Err(EngineError::Config("topic_prefix must not be empty".to_string()));
        }
        if self.consolidation_attempts == 0 {
            return Err(EngineError::Config(
                "consolidation_attempts must be at least 1".to_string(),
            ));
        }
        if self.event_names.is_empty() {
            return Err(EngineError::Config("event_names must not be empty".to_string()));
        }
        if self.enabled_protocols.is_empty() {
            return Err(EngineError::Config(
                "enabled_protocols must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Registry of the enabled protocols.
    pub fn protocol_registry(&self) -> ProtocolRegistry {
        ProtocolRegistry::new(self.enabled_protocols.iter().copied())
    }
}

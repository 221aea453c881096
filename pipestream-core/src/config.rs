use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::encoding::EncodingKind;

/// Node process configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub streaming: StreamingConfig,
    pub data_server: DataServerConfig,
    pub logging: LoggingConfig,
}

/// Identity and topology of the pipeline node this process runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Name of this node in the pipeline definition
    pub name: String,
    /// Downstream node types this node produces for (empty = no producer)
    pub consumer_types: Vec<String>,
    /// Upstream producers this node listens to
    pub upstreams: Vec<UpstreamConfig>,
    /// Named flow patterns available to `send`
    pub flows: HashMap<String, Vec<FlowHopConfig>>,
    /// Flow used when a message is sent without a flow name or inbound pattern
    pub default_flow: Option<String>,
    /// Re-publish every inbound message along its remaining flow
    pub relay: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "node".to_string(),
            consumer_types: Vec::new(),
            upstreams: Vec::new(),
            flows: HashMap::new(),
            default_flow: None,
            relay: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub node_name: String,
    pub host: String,
    pub port: u16,
}

impl UpstreamConfig {
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One hop of a flow pattern as written in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowHopConfig {
    pub source: String,
    pub next: Vec<String>,
}

/// Streaming bus tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Producer listen port (0 picks an ephemeral port)
    pub port: u16,
    pub host: String,
    pub heartbeat_interval_ms: u64,
    pub liveness_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
    pub reconnect_max_ms: u64,
    /// Byte budget of the outbound queue (sum of payload sizes)
    pub max_queue_bytes: usize,
    pub statistics_interval_ms: u64,
    /// Bounded wait of a single listener fetch
    pub poll_interval_ms: u64,
    pub connect_timeout_ms: u64,
    /// Upper bound of a graceful stop
    pub drain_timeout_ms: u64,
    pub encoding: String,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            port: 9022,
            host: "0.0.0.0".to_string(),
            heartbeat_interval_ms: 1000,
            liveness_timeout_ms: 5000,
            reconnect_interval_ms: 1000,
            reconnect_max_ms: 32000,
            max_queue_bytes: 5 * 1024 * 1024,
            statistics_interval_ms: 2000,
            poll_interval_ms: 1000,
            connect_timeout_ms: 3000,
            drain_timeout_ms: 30000,
            encoding: "json".to_string(),
        }
    }
}

impl StreamingConfig {
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub const fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    #[must_use]
    pub const fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    #[must_use]
    pub const fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    #[must_use]
    pub const fn statistics_interval(&self) -> Duration {
        Duration::from_millis(self.statistics_interval_ms)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Peer data server (serves task results to sibling nodes)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub max_cache_size: usize,
    pub encoding: String,
    /// Connect timeout used by clients before a peer is declared unreachable
    pub ping_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for DataServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "0.0.0.0".to_string(),
            port: 9020,
            max_cache_size: 10,
            encoding: "json".to_string(),
            ping_timeout_ms: 600,
            request_timeout_ms: 30000,
        }
    }
}

impl DataServerConfig {
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub const fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // PIPESTREAM_STREAMING__PORT, PIPESTREAM_NODE__CONSUMER_TYPES=b,c, ...
        builder = builder.add_source(
            Environment::with_prefix("PIPESTREAM")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("node.consumer_types")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check the configuration, collecting every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let streaming = &self.streaming;

        if self.node.name.trim().is_empty() {
            errors.push("node.name must not be empty".to_string());
        }
        if streaming.heartbeat_interval_ms == 0 {
            errors.push("streaming.heartbeat_interval_ms must be greater than 0".to_string());
        }
        if streaming.liveness_timeout_ms <= streaming.heartbeat_interval_ms {
            errors.push(format!(
                "streaming.liveness_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                streaming.liveness_timeout_ms, streaming.heartbeat_interval_ms
            ));
        }
        if streaming.reconnect_interval_ms == 0 {
            errors.push("streaming.reconnect_interval_ms must be greater than 0".to_string());
        }
        if streaming.reconnect_max_ms < streaming.reconnect_interval_ms {
            errors.push(format!(
                "streaming.reconnect_max_ms ({}) must be at least reconnect_interval_ms ({})",
                streaming.reconnect_max_ms, streaming.reconnect_interval_ms
            ));
        }
        if streaming.max_queue_bytes == 0 {
            errors.push("streaming.max_queue_bytes must be greater than 0".to_string());
        }
        if streaming.statistics_interval_ms == 0 {
            errors.push("streaming.statistics_interval_ms must be greater than 0".to_string());
        }
        if streaming.poll_interval_ms == 0 {
            errors.push("streaming.poll_interval_ms must be greater than 0".to_string());
        }
        if EncodingKind::from_name(&streaming.encoding).is_none() {
            errors.push(format!("streaming.encoding '{}' is not supported", streaming.encoding));
        }
        if self.data_server.enabled {
            if self.data_server.max_cache_size == 0 {
                errors.push("data_server.max_cache_size must be greater than 0".to_string());
            }
            if EncodingKind::from_name(&self.data_server.encoding).is_none() {
                errors.push(format!(
                    "data_server.encoding '{}' is not supported",
                    self.data_server.encoding
                ));
            }
        }
        if let Some(default_flow) = &self.node.default_flow {
            if !self.node.flows.contains_key(default_flow) {
                errors.push(format!("node.default_flow '{default_flow}' is not defined in node.flows"));
            }
        }
        for (name, hops) in &self.node.flows {
            if hops.is_empty() {
                errors.push(format!("flow '{name}' has no hops"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.streaming.encoding, "json");
        assert_eq!(config.streaming.heartbeat_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.node.name = String::new();
        config.streaming.liveness_timeout_ms = 10;
        config.streaming.heartbeat_interval_ms = 100;
        config.streaming.max_queue_bytes = 0;
        config.streaming.encoding = "xml".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("node.name")));
        assert!(errors.iter().any(|e| e.contains("liveness_timeout_ms")));
        assert!(errors.iter().any(|e| e.contains("max_queue_bytes")));
        assert!(errors.iter().any(|e| e.contains("xml")));
    }

    #[test]
    fn test_default_flow_must_exist() {
        let mut config = Config::default();
        config.node.default_flow = Some("main".to_string());
        let errors = config.validate().unwrap_err();
        assert!(errors[0].contains("main"));

        config.node.flows.insert(
            "main".to_string(),
            vec![FlowHopConfig {
                source: "a".to_string(),
                next: vec!["b".to_string()],
            }],
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_upstream_address() {
        let upstream = UpstreamConfig {
            node_name: "a".to_string(),
            host: "10.0.0.1".to_string(),
            port: 9022,
        };
        assert_eq!(upstream.address(), "10.0.0.1:9022");
    }
}

/// Configuration management for redfleet

use crate::core::NodeRole;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main redfleet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node identity and filesystem layout
    pub node: NodeConfig,
    /// Sync protocol configuration
    pub sync: SyncConfig,
    /// Health probe configuration
    pub health: HealthConfig,
    /// Sentinel configuration
    pub sentinel: SentinelConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Initial fleet role of this node (the persisted role file wins once written)
    pub role: NodeRole,
    /// Hostname reported to the master, detected when absent
    pub hostname: Option<String>,
    /// Root directory for instance metadata and node state
    pub data_dir: PathBuf,
    /// Directory holding instance PID files
    pub pid_dir: PathBuf,
    /// Directory holding generated instance configuration files
    pub config_dir: PathBuf,
    /// Floating IP that the master must hold
    pub virtual_ip: Option<String>,
    /// Instance N listens on base_port + N
    pub base_port: u16,
    /// Highest allocatable instance ID
    pub max_instances: u32,
    /// Path to the redis-server binary
    pub redis_binary: PathBuf,
    /// Password used by the protocol probe
    pub probe_password: Option<String>,
}

/// Sync protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Master sync daemon URL (required on minions and sentinels)
    pub master_url: Option<String>,
    /// Address the master sync daemon listens on
    pub listen_addr: String,
    /// Fleet-wide shared secret
    pub token: String,
    /// Queue poll interval in seconds
    pub poll_interval_sec: u64,
    /// Request timeout in seconds
    pub request_timeout_sec: u64,
    /// Silence after which a client is possibly down
    pub possible_down_sec: u64,
    /// Silence after which a client is down
    pub down_sec: u64,
    /// Silence after which a client is dead
    pub dead_sec: u64,
    /// Silence after which a dead client is evicted
    pub gc_sec: u64,
    /// Journal for undelivered fleet commands
    pub queue_file: PathBuf,
    /// Allow minions to run destructive commands locally
    pub allow_commands: bool,
    /// Superuser credential bundle handed out at hello
    pub superuser_pepper: Option<String>,
    pub superuser_hash: Option<String>,
}

/// Health probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Protocol call timeout in milliseconds
    pub probe_timeout_ms: u64,
    /// Below this many ops/sec an instance is idle
    pub idle_ops_threshold: u64,
    /// PID files younger than this are treated as still starting
    pub pid_grace_sec: u64,
    /// Save-completion poll interval in milliseconds
    pub save_poll_interval_ms: u64,
    /// Save-completion maximum wait in seconds
    pub save_max_wait_sec: u64,
    /// How long start waits for an instance to answer PING
    pub start_timeout_sec: u64,
}

/// Sentinel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelConfig {
    /// Whether sentinel monitoring is part of this fleet
    pub enabled: bool,
    /// Sentinel port
    pub port: u16,
    /// Quorum for monitored masters
    pub quorum: u32,
    /// Path to the redis-sentinel binary
    pub binary: PathBuf,
    /// Sentinel configuration file
    pub config_file: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                role: NodeRole::Master,
                hostname: None,
                data_dir: PathBuf::from("/opt/redfleet/meta"),
                pid_dir: PathBuf::from("/opt/redfleet/pid"),
                config_dir: PathBuf::from("/opt/redfleet/conf"),
                virtual_ip: None,
                base_port: 63000,
                max_instances: 1024,
                redis_binary: PathBuf::from("/usr/bin/redis-server"),
                probe_password: None,
            },
            sync: SyncConfig {
                master_url: None,
                listen_addr: "0.0.0.0:33000".to_string(),
                token: "change-me".to_string(),
                poll_interval_sec: 2,
                request_timeout_sec: 5,
                possible_down_sec: 15,
                down_sec: 60,
                dead_sec: 300,
                gc_sec: 3600,
                queue_file: PathBuf::from("/opt/redfleet/queue.jsonl"),
                allow_commands: false,
                superuser_pepper: None,
                superuser_hash: None,
            },
            health: HealthConfig {
                probe_timeout_ms: 3000,
                idle_ops_threshold: 5,
                pid_grace_sec: 5,
                save_poll_interval_ms: 500,
                save_max_wait_sec: 600,
                start_timeout_sec: 30,
            },
            sentinel: SentinelConfig {
                enabled: false,
                port: 26379,
                quorum: 2,
                binary: PathBuf::from("/usr/bin/redis-sentinel"),
                config_file: PathBuf::from("/opt/redfleet/conf/sentinel.conf"),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.max_instances == 0 {
            return Err(ConfigError::ValidationError(
                "max_instances must be greater than 0".to_string(),
            ));
        }

        if u32::from(self.node.base_port) + self.node.max_instances > u32::from(u16::MAX) {
            return Err(ConfigError::ValidationError(
                "base_port + max_instances exceeds the port range".to_string(),
            ));
        }

        if let Some(vip) = &self.node.virtual_ip {
            vip.parse::<std::net::IpAddr>().map_err(|_| {
                ConfigError::ValidationError(format!("Invalid virtual IP: {}", vip))
            })?;
        }

        // Sync
        if self.sync.token.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "sync token cannot be empty".to_string(),
            ));
        }

        match self.node.role {
            NodeRole::Master => {
                self.sync.listen_addr.parse::<std::net::SocketAddr>().map_err(|_| {
                    ConfigError::ValidationError(format!(
                        "Invalid sync listen address: {}",
                        self.sync.listen_addr
                    ))
                })?;
            }
            NodeRole::Minion | NodeRole::Sentinel => match &self.sync.master_url {
                Some(url) if url.starts_with("http://") || url.starts_with("https://") => {}
                Some(url) => {
                    return Err(ConfigError::ValidationError(format!(
                        "master_url must be an http(s) URL: {}",
                        url
                    )))
                }
                None => {
                    return Err(ConfigError::ValidationError(format!(
                        "master_url is required on a {} node",
                        self.node.role
                    )))
                }
            },
        }

        if self.sync.poll_interval_sec == 0 || self.sync.request_timeout_sec == 0 {
            return Err(ConfigError::ValidationError(
                "sync poll_interval_sec and request_timeout_sec must be greater than 0".to_string(),
            ));
        }

        let windows = [
            self.sync.possible_down_sec,
            self.sync.down_sec,
            self.sync.dead_sec,
            self.sync.gc_sec,
        ];
        if windows[0] == 0 || windows.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::ValidationError(
                "heartbeat windows must be increasing: possible_down < down < dead < gc".to_string(),
            ));
        }

        if self.sync.possible_down_sec <= self.sync.poll_interval_sec {
            return Err(ConfigError::ValidationError(
                "possible_down_sec must be longer than poll_interval_sec".to_string(),
            ));
        }

        // Health
        if self.health.probe_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "probe_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.health.save_poll_interval_ms == 0
            || self.health.save_poll_interval_ms >= self.health.save_max_wait_sec * 1000
        {
            return Err(ConfigError::ValidationError(
                "save_poll_interval_ms must be greater than 0 and below save_max_wait_sec".to_string(),
            ));
        }

        // Logging
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, role: &str) -> Result<(), ConfigError> {
        let mut config = Config::default();
        match role {
            "master" => {
                config.node.virtual_ip = Some("10.0.1.100".to_string());
            }
            "minion" => {
                config.node.role = NodeRole::Minion;
                config.sync.master_url = Some("http://10.0.1.100:33000".to_string());
            }
            "sentinel" => {
                config.node.role = NodeRole::Sentinel;
                config.sync.master_url = Some("http://10.0.1.100:33000".to_string());
                config.sentinel.enabled = true;
            }
            _ => {
                return Err(ConfigError::ValidationError(
                    "Role must be 'master', 'minion' or 'sentinel'".to_string(),
                ))
            }
        }

        config.save_to_file(path)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.health.probe_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.sync.poll_interval_sec)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.request_timeout_sec)
    }

    /// File holding the persisted node role
    pub fn role_file(&self) -> PathBuf {
        self.node.data_dir.join("role")
    }

    /// File holding the last fleet state snapshot
    pub fn snapshot_file(&self) -> PathBuf {
        self.node.data_dir.join("states.json")
    }

    /// Directory of per-client outbox journals, next to the queue journal
    pub fn outbox_dir(&self) -> PathBuf {
        self.sync.queue_file.with_extension("outbox")
    }

    /// PID file of the sync daemon
    pub fn daemon_pid_file(&self) -> PathBuf {
        self.node.pid_dir.join("sync.pid")
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

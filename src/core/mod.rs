/// Core fleet abstractions: instance metadata, node roles and the
/// collaborators that store and drive instances
pub mod batch;
pub mod control;
pub mod registry;
pub mod snapshot;

pub use batch::{BatchAction, BatchReport, BatchRunner};
pub use control::{InstanceControl, ProcessControl, RespSentinel, SentinelControl};
pub use registry::{DirRegistry, InstanceRegistry, MemoryRegistry};
pub use snapshot::StateSnapshot;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::config::Config;

/// Fleet role of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Minion,
    Sentinel,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Master => write!(f, "master"),
            NodeRole::Minion => write!(f, "minion"),
            NodeRole::Sentinel => write!(f, "sentinel"),
        }
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "master" => Ok(NodeRole::Master),
            "minion" => Ok(NodeRole::Minion),
            "sentinel" => Ok(NodeRole::Sentinel),
            other => Err(format!("unknown node role '{}'", other)),
        }
    }
}

/// How a minion keeps its copy of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationType {
    /// Read-only replica serving traffic
    Replica,
    /// Hot standby, not serving traffic
    Standby,
}

impl Default for ReplicationType {
    fn default() -> Self {
        ReplicationType::Replica
    }
}

/// Salted password hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub pepper: String,
    pub hash: String,
}

impl Credential {
    /// Hash a password with a fresh random pepper
    pub fn generate(password: &str) -> Self {
        let pepper: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        let hash = Self::digest(&pepper, password);
        Self { pepper, hash }
    }

    pub fn verify(&self, password: &str) -> bool {
        Self::digest(&self.pepper, password) == self.hash
    }

    fn digest(pepper: &str, password: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(pepper.as_bytes());
        hasher.update(password.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Instance credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceAuth {
    pub user: String,
    pub password: Credential,
    /// Service user used by the fleet tooling itself
    pub service: Option<Credential>,
}

/// Hash and mtime of the last configuration written for an instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedConfig {
    pub hash: String,
    pub mtime: u64,
}

/// Metadata of one managed Redis instance.
///
/// Values are treated as immutable snapshots: edits produce a new value that
/// is saved back through the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMeta {
    pub id: u32,
    pub uuid: Uuid,
    pub owner: String,
    pub description: String,
    /// Unix seconds
    pub created: u64,
    pub auth: InstanceAuth,
    #[serde(default)]
    pub replication_type: ReplicationType,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Last Redis version known to work with this instance's configuration
    #[serde(default)]
    pub compatible: String,
    #[serde(default)]
    pub config: AppliedConfig,
}

impl InstanceMeta {
    /// Build metadata for a freshly allocated ID with generated credentials
    pub fn new(id: u32, owner: &str, description: &str, password: &str) -> Self {
        Self {
            id,
            uuid: Uuid::new_v4(),
            owner: owner.to_string(),
            description: description.to_string(),
            created: crate::utils::unix_now(),
            auth: InstanceAuth {
                user: owner.to_string(),
                password: Credential::generate(password),
                service: Some(Credential::generate(&crate::utils::random_secret(24))),
            },
            replication_type: ReplicationType::default(),
            tags: BTreeSet::new(),
            compatible: String::new(),
            config: AppliedConfig::default(),
        }
    }

    pub fn with_description(&self, description: &str) -> Self {
        Self {
            description: description.to_string(),
            ..self.clone()
        }
    }

    pub fn with_replication_type(&self, replication_type: ReplicationType) -> Self {
        Self {
            replication_type,
            ..self.clone()
        }
    }

    pub fn with_tag(&self, tag: &str) -> Self {
        let mut tags = self.tags.clone();
        tags.insert(tag.to_string());
        Self {
            tags,
            ..self.clone()
        }
    }

    pub fn without_tag(&self, tag: &str) -> Self {
        let mut tags = self.tags.clone();
        tags.remove(tag);
        Self {
            tags,
            ..self.clone()
        }
    }

    pub fn with_applied_config(&self, hash: String, mtime: u64) -> Self {
        Self {
            config: AppliedConfig { hash, mtime },
            ..self.clone()
        }
    }

    pub fn with_password(&self, password: &str) -> Self {
        Self {
            auth: InstanceAuth {
                password: Credential::generate(password),
                ..self.auth.clone()
            },
            ..self.clone()
        }
    }

    /// Whether a queued command addressed to `uuid` targets this generation
    pub fn is_generation(&self, uuid: &Uuid) -> bool {
        uuid.is_nil() || &self.uuid == uuid
    }
}

/// Filesystem and network layout of instances on one node
#[derive(Debug, Clone)]
pub struct InstancePaths {
    pub pid_dir: PathBuf,
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub base_port: u16,
}

impl InstancePaths {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pid_dir: config.node.pid_dir.clone(),
            config_dir: config.node.config_dir.clone(),
            data_dir: config.node.data_dir.clone(),
            base_port: config.node.base_port,
        }
    }

    pub fn pid_file(&self, id: u32) -> PathBuf {
        self.pid_dir.join(format!("redis-{}.pid", id))
    }

    pub fn config_file(&self, id: u32) -> PathBuf {
        self.config_dir.join(format!("redis-{}.conf", id))
    }

    pub fn storage_dir(&self, id: u32) -> PathBuf {
        self.data_dir.join("storage").join(id.to_string())
    }

    /// Port of instance `id`, `None` when it falls outside the port range
    pub fn port(&self, id: u32) -> Option<u16> {
        u16::try_from(id)
            .ok()
            .and_then(|id| self.base_port.checked_add(id))
    }
}

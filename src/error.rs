/// Unified error handling for redfleet
///
/// Errors are grouped by the collaborator that produced them: the instance
/// registry, local instance control, the Redis protocol probe, the sync
/// protocol and the role-switch orchestrator. `FleetError` wraps all of them.

use std::fmt;
use std::io;
use thiserror::Error;

pub use crate::config::ConfigError;

/// Main error type for fleet operations
#[derive(Debug, Error)]
pub enum FleetError {
    /// Filesystem and socket errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Instance registry errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Local instance control errors
    #[error("Instance control error: {0}")]
    Control(#[from] ControlError),

    /// Redis protocol probe errors
    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    /// Sync protocol errors
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Role switch errors
    #[error("Role switch error: {0}")]
    RoleSwitch(#[from] RoleSwitchError),

    /// Instance is in the wrong state for the requested action
    #[error("Precondition failed: {message}")]
    Precondition { message: String },

    /// Batch finished with failed items
    #[error("Batch failed for {failed} of {total} instances")]
    Batch { failed: usize, total: usize },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Instance registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Instance {0} not found")]
    NotFound(u32),

    #[error("No free instance ID (limit {0})")]
    Exhausted(u32),

    #[error("Instance {0} already exists")]
    AlreadyExists(u32),

    #[error("Storage error: {message}")]
    Storage { message: String },
}

/// Local instance control errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Failed to start instance {id}: {message}")]
    Start { id: u32, message: String },

    #[error("Failed to stop instance {id}: {message}")]
    Stop { id: u32, message: String },

    #[error("Failed to kill instance {id}: {message}")]
    Kill { id: u32, message: String },

    #[error("Failed to write configuration for instance {id}: {message}")]
    Config { id: u32, message: String },

    #[error("Sentinel error: {message}")]
    Sentinel { message: String },
}

/// Redis protocol probe errors
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Connection refused or reset before any reply was read
    #[error("Connection failed: {0}")]
    Connect(String),

    /// No complete reply within the timeout
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Malformed reply
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Redis answered with an error reply
    #[error("Redis error: {0}")]
    Server(String),
}

/// Sync protocol errors
#[derive(Debug, Error)]
pub enum SyncError {
    /// Master unreachable or the request could not be sent
    #[error("Transport error: {0}")]
    Transport(String),

    /// Master answered with a non-ok status code
    #[error("Rejected by master: {code} ({description})")]
    Rejected {
        code: crate::sync::StatusCode,
        description: String,
    },

    #[error("Client is not registered with the master")]
    NotRegistered,

    #[error("Queue journal error: {0}")]
    Journal(String),
}

/// Role switch errors
#[derive(Debug, Error)]
pub enum RoleSwitchError {
    #[error("Role switch requires confirmation")]
    NotConfirmed,

    #[error("Node is already {0}")]
    AlreadyInRole(crate::core::NodeRole),

    #[error("Role switch from {0} is not supported")]
    Unsupported(crate::core::NodeRole),

    #[error("Sync daemon is running, stop it first")]
    DaemonActive,

    #[error("Node has no instances")]
    NoInstances,

    #[error("Node does not hold virtual IP {0}")]
    VirtualIpNotHeld(String),

    #[error("Step '{step}' failed for {failed} instances")]
    StepFailed { step: &'static str, failed: usize },
}

/// Result type alias for fleet operations
pub type FleetResult<T> = Result<T, FleetError>;

impl FleetError {
    /// Create a precondition error
    pub fn precondition<S: Into<String>>(message: S) -> Self {
        FleetError::Precondition {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        FleetError::Internal {
            message: message.into(),
        }
    }

    /// Transport-level failures that may succeed if the operator retries
    pub fn is_recoverable(&self) -> bool {
        match self {
            FleetError::Io(_) => true,
            FleetError::Probe(ProbeError::Timeout(_)) => true,
            FleetError::Probe(ProbeError::Connect(_)) => true,
            FleetError::Sync(SyncError::Transport(_)) => true,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            FleetError::Config(_) => ErrorSeverity::Critical,
            FleetError::Internal { .. } => ErrorSeverity::Critical,
            FleetError::RoleSwitch(_) => ErrorSeverity::Critical,
            FleetError::Io(_) => ErrorSeverity::Warning,
            FleetError::Probe(_) => ErrorSeverity::Warning,
            FleetError::Sync(SyncError::Transport(_)) => ErrorSeverity::Warning,
            FleetError::Precondition { .. } => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about refused operations
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

impl RegistryError {
    pub fn storage<S: Into<String>>(message: S) -> Self {
        RegistryError::Storage {
            message: message.into(),
        }
    }
}

impl ControlError {
    pub fn start<S: Into<String>>(id: u32, message: S) -> Self {
        ControlError::Start {
            id,
            message: message.into(),
        }
    }

    pub fn stop<S: Into<String>>(id: u32, message: S) -> Self {
        ControlError::Stop {
            id,
            message: message.into(),
        }
    }

    pub fn config<S: Into<String>>(id: u32, message: S) -> Self {
        ControlError::Config {
            id,
            message: message.into(),
        }
    }

    pub fn sentinel<S: Into<String>>(message: S) -> Self {
        ControlError::Sentinel {
            message: message.into(),
        }
    }
}

impl ProbeError {
    /// Whether the failure is evidence of a hung process rather than a dead one
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProbeError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_creation() {
        let error = FleetError::precondition("instance 3 is dead");
        assert!(matches!(error, FleetError::Precondition { .. }));
        assert_eq!(error.to_string(), "Precondition failed: instance 3 is dead");
    }

    #[test]
    fn test_error_severity() {
        let config_error = FleetError::Config(ConfigError::ValidationError("test".to_string()));
        assert_eq!(config_error.severity(), ErrorSeverity::Critical);

        let probe_error = FleetError::Probe(ProbeError::Timeout(Duration::from_secs(1)));
        assert_eq!(probe_error.severity(), ErrorSeverity::Warning);
    }

    #[test]
    fn test_error_recoverability() {
        let transport = FleetError::Sync(SyncError::Transport("refused".to_string()));
        assert!(transport.is_recoverable());

        let missing = FleetError::Registry(RegistryError::NotFound(4));
        assert!(!missing.is_recoverable());
    }

    #[test]
    fn test_probe_timeout_detection() {
        assert!(ProbeError::Timeout(Duration::from_millis(10)).is_timeout());
        assert!(!ProbeError::Connect("refused".to_string()).is_timeout());
    }
}

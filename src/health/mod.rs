/// Instance health classification
///
/// Raw signals (PID file, process liveness, an INFO call bounded by a timeout
/// and the configuration hash) are gathered into a `Probe`, and `classify`
/// turns a probe into a composite `State`. Every destructive fleet operation
/// is gated on the result, so ambiguous evidence always leans towards `hang`
/// and never towards `stopped`.
pub mod redis;
pub mod resp;

use crate::core::{InstancePaths, InstanceRegistry};
use crate::error::{FleetError, ProbeError};
use async_trait::async_trait;
use redis::{InfoReply, RedisProbe};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Primary state, exactly one per observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimaryState {
    Stopped,
    Dead,
    Hang,
    Works,
}

impl fmt::Display for PrimaryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryState::Stopped => write!(f, "stopped"),
            PrimaryState::Dead => write!(f, "dead"),
            PrimaryState::Hang => write!(f, "hang"),
            PrimaryState::Works => write!(f, "works"),
        }
    }
}

/// Modifiers observed on a working instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Modifiers {
    pub loading: bool,
    pub saving: bool,
    pub syncing: bool,
    pub idle: bool,
    pub replica: bool,
    pub master_down: bool,
    pub has_replica: bool,
    pub with_errors: bool,
    pub config_outdated: bool,
}

/// Composite instance state.
///
/// Modifiers only exist on `works`, so every predicate below is false for
/// stopped, dead and hung instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct State {
    primary: PrimaryState,
    modifiers: Modifiers,
}

impl State {
    pub fn stopped() -> Self {
        Self {
            primary: PrimaryState::Stopped,
            modifiers: Modifiers::default(),
        }
    }

    pub fn dead() -> Self {
        Self {
            primary: PrimaryState::Dead,
            modifiers: Modifiers::default(),
        }
    }

    pub fn hang() -> Self {
        Self {
            primary: PrimaryState::Hang,
            modifiers: Modifiers::default(),
        }
    }

    pub fn works(modifiers: Modifiers) -> Self {
        Self {
            primary: PrimaryState::Works,
            modifiers,
        }
    }

    pub fn primary(&self) -> PrimaryState {
        self.primary
    }

    pub fn is_stopped(&self) -> bool {
        self.primary == PrimaryState::Stopped
    }

    pub fn is_dead(&self) -> bool {
        self.primary == PrimaryState::Dead
    }

    pub fn is_hang(&self) -> bool {
        self.primary == PrimaryState::Hang
    }

    pub fn is_works(&self) -> bool {
        self.primary == PrimaryState::Works
    }

    pub fn is_loading(&self) -> bool {
        self.is_works() && self.modifiers.loading
    }

    pub fn is_saving(&self) -> bool {
        self.is_works() && self.modifiers.saving
    }

    pub fn is_syncing(&self) -> bool {
        self.is_works() && self.modifiers.syncing
    }

    pub fn is_idle(&self) -> bool {
        self.is_works() && self.modifiers.idle
    }

    pub fn is_active(&self) -> bool {
        self.is_works() && !self.modifiers.idle
    }

    pub fn is_replica(&self) -> bool {
        self.is_works() && self.modifiers.replica
    }

    pub fn master_up(&self) -> bool {
        self.is_replica() && !self.modifiers.master_down
    }

    pub fn master_down(&self) -> bool {
        self.is_replica() && self.modifiers.master_down
    }

    pub fn has_replica(&self) -> bool {
        self.is_works() && self.modifiers.has_replica
    }

    pub fn no_replica(&self) -> bool {
        self.is_works() && !self.modifiers.has_replica
    }

    pub fn with_errors(&self) -> bool {
        self.is_works() && self.modifiers.with_errors
    }

    pub fn config_outdated(&self) -> bool {
        self.is_works() && self.modifiers.config_outdated
    }

    /// Dead and hung instances block fleet-wide batch operations
    pub fn blocks_batch(&self) -> bool {
        self.is_dead() || self.is_hang()
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.primary)?;
        if !self.is_works() {
            return Ok(());
        }

        let mut tags = vec![if self.is_idle() { "idle" } else { "active" }];
        if self.is_loading() {
            tags.push("loading");
        }
        if self.is_saving() {
            tags.push("saving");
        }
        if self.is_syncing() {
            tags.push("syncing");
        }
        if self.master_up() {
            tags.push("master-up");
        }
        if self.master_down() {
            tags.push("master-down");
        }
        if self.has_replica() {
            tags.push("has-replica");
        }
        if self.with_errors() {
            tags.push("with-errors");
        }
        if self.config_outdated() {
            tags.push("config-outdated");
        }
        write!(f, " ({})", tags.join(", "))
    }
}

/// PID file contents and age
#[derive(Debug, Clone, PartialEq)]
pub struct PidInfo {
    pub pid: u32,
    pub modified: SystemTime,
}

/// Result of the bounded protocol call
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolOutcome {
    /// INFO answered
    Reply(InfoReply),
    /// Instance answered with an error reply (LOADING, NOAUTH, ...)
    Rejected(String),
    /// Connection refused or reset immediately
    Failed(String),
    /// No complete reply within the timeout
    TimedOut,
}

/// Raw signals for one instance at one moment
#[derive(Debug, Clone)]
pub struct Probe {
    pub pid_file: Option<PidInfo>,
    pub process_alive: bool,
    pub protocol: ProtocolOutcome,
    pub config_hash_matches: Option<bool>,
    pub observed_at: SystemTime,
}

/// Thresholds used by the classifier
#[derive(Debug, Clone)]
pub struct ClassifierSettings {
    /// Below this many ops/sec a working instance is idle
    pub idle_ops_threshold: u64,
    /// A refused connection with a PID file younger than this is not yet dead
    pub pid_grace: Duration,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            idle_ops_threshold: 5,
            pid_grace: Duration::from_secs(5),
        }
    }
}

/// Classify a probe with default thresholds
pub fn classify(probe: &Probe) -> State {
    classify_with(probe, &ClassifierSettings::default())
}

/// Classify a probe, first match wins for the primary state
pub fn classify_with(probe: &Probe, settings: &ClassifierSettings) -> State {
    let Some(pid) = &probe.pid_file else {
        return State::stopped();
    };

    if !probe.process_alive {
        return State::dead();
    }

    match &probe.protocol {
        ProtocolOutcome::TimedOut => State::hang(),
        ProtocolOutcome::Failed(_) => {
            // Process still binding its port right after start
            let fresh = probe
                .observed_at
                .duration_since(pid.modified)
                .map(|age| age < settings.pid_grace)
                .unwrap_or(true);
            if fresh {
                State::hang()
            } else {
                State::dead()
            }
        }
        ProtocolOutcome::Rejected(message) => State::works(Modifiers {
            loading: message.starts_with("LOADING"),
            idle: true,
            with_errors: true,
            config_outdated: probe.config_hash_matches == Some(false),
            ..Modifiers::default()
        }),
        ProtocolOutcome::Reply(info) => {
            let replica = info.is_replica();
            let link_up = info.master_link_up();
            State::works(Modifiers {
                loading: info.is_loading(),
                saving: info.is_saving(),
                syncing: replica && (!link_up || info.master_sync_in_progress()),
                idle: info.ops_per_sec() < settings.idle_ops_threshold,
                replica,
                master_down: replica && !link_up,
                has_replica: info.connected_replicas() > 0,
                with_errors: info.has_errors(),
                config_outdated: probe.config_hash_matches == Some(false),
            })
        }
    }
}

/// Anything that can report the current state of an instance
#[async_trait]
pub trait StateSource: Send + Sync {
    async fn state(&self, id: u32) -> State;
}

/// Gathers probes from the local host and classifies them
pub struct StateProber {
    paths: InstancePaths,
    probe: Arc<dyn RedisProbe>,
    registry: Option<Arc<dyn InstanceRegistry>>,
    timeout: Duration,
    settings: ClassifierSettings,
}

impl StateProber {
    pub fn new(paths: InstancePaths, probe: Arc<dyn RedisProbe>, timeout: Duration) -> Self {
        Self {
            paths,
            probe,
            registry: None,
            timeout,
            settings: ClassifierSettings::default(),
        }
    }

    /// Compare configuration files against the hash recorded in the registry
    pub fn with_registry(mut self, registry: Arc<dyn InstanceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_settings(mut self, settings: ClassifierSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Collect raw signals for one instance
    pub async fn probe(&self, id: u32) -> Probe {
        let observed_at = SystemTime::now();
        let pid_file = read_pid_file(&self.paths.pid_file(id)).await;
        let process_alive = pid_file
            .as_ref()
            .map(|info| process_exists(info.pid))
            .unwrap_or(false);

        let protocol = if process_alive {
            match self.probe.execute(id, &["INFO"], self.timeout).await {
                Ok(reply) => match InfoReply::from_reply(&reply) {
                    Ok(info) => ProtocolOutcome::Reply(info),
                    Err(_) => ProtocolOutcome::TimedOut,
                },
                Err(ProbeError::Connect(message)) => ProtocolOutcome::Failed(message),
                Err(ProbeError::Server(message)) => ProtocolOutcome::Rejected(message),
                // Partial or malformed replies are as ambiguous as timeouts
                Err(ProbeError::Timeout(_)) | Err(ProbeError::Protocol(_)) => {
                    ProtocolOutcome::TimedOut
                }
            }
        } else {
            ProtocolOutcome::Failed("process is not running".to_string())
        };

        Probe {
            pid_file,
            process_alive,
            protocol,
            config_hash_matches: self.config_hash_matches(id).await,
            observed_at,
        }
    }

    async fn config_hash_matches(&self, id: u32) -> Option<bool> {
        let registry = self.registry.as_ref()?;
        let meta = registry.find(id).await.ok().flatten()?;
        if meta.config.hash.is_empty() {
            return None;
        }
        let current = crate::utils::file_md5(&self.paths.config_file(id)).await?;
        Some(current == meta.config.hash)
    }
}

#[async_trait]
impl StateSource for StateProber {
    async fn state(&self, id: u32) -> State {
        let probe = self.probe(id).await;
        let state = classify_with(&probe, &self.settings);
        tracing::debug!(id, state = %state, "Classified instance");
        state
    }
}

async fn read_pid_file(path: &Path) -> Option<PidInfo> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    let modified = tokio::fs::metadata(path)
        .await
        .and_then(|m| m.modified())
        .unwrap_or_else(|_| SystemTime::now());
    // An unreadable PID still proves the file exists, pid 0 never matches a process
    let pid = content.trim().parse::<u32>().unwrap_or(0);
    Some(PidInfo { pid, modified })
}

/// Liveness check through procfs
pub fn process_exists(pid: u32) -> bool {
    pid != 0 && Path::new("/proc").join(pid.to_string()).exists()
}

/// Call `check` every `interval` until it returns true or `max_wait` elapses
pub async fn poll_until<F, Fut>(interval: Duration, max_wait: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = Instant::now();
    loop {
        if check().await {
            return true;
        }
        if started.elapsed() + interval > max_wait {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

/// Wait until no background save or AOF rewrite is running on the instance.
///
/// Timed-out INFO calls count as "still busy" rather than failures.
pub async fn await_save_completion(
    probe: &dyn RedisProbe,
    id: u32,
    call_timeout: Duration,
    interval: Duration,
    max_wait: Duration,
) -> Result<(), FleetError> {
    let finished = poll_until(interval, max_wait, move || async move {
        match probe.execute(id, &["INFO", "persistence"], call_timeout).await {
            Ok(reply) => InfoReply::from_reply(&reply)
                .map(|info| !info.is_saving())
                .unwrap_or(false),
            Err(e) => {
                tracing::debug!(id, error = %e, "Save status unavailable");
                false
            }
        }
    })
    .await;

    if finished {
        Ok(())
    } else {
        Err(FleetError::Probe(ProbeError::Timeout(max_wait)))
    }
}

/// Wait until the instance answers PING
pub async fn await_ready(
    probe: &dyn RedisProbe,
    id: u32,
    call_timeout: Duration,
    interval: Duration,
    max_wait: Duration,
) -> bool {
    poll_until(interval, max_wait, move || async move {
        matches!(
            probe.execute(id, &["PING"], call_timeout).await,
            Ok(resp::RespValue::SimpleString(ref s)) if s == "PONG"
        )
    })
    .await
}

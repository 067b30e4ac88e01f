/// Local instance and sentinel control
///
/// `InstanceControl` drives redis-server processes on this host and
/// `SentinelControl` drives the local sentinel. Both are treated as
/// collaborators by the fleet logic, so tests replace them with fakes.

use crate::core::{InstancePaths, InstanceRegistry, NodeRole, ReplicationType};
use crate::error::{ControlError, ProbeError};
use crate::health::redis::RedisProbe;
use crate::health::resp::RespValue;
use crate::health::{await_ready, await_save_completion, poll_until, process_exists};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

/// Directives that cannot be changed on a running instance
const STATIC_DIRECTIVES: &[&str] = &[
    "daemonize",
    "port",
    "bind",
    "pidfile",
    "dir",
    "dbfilename",
    "replicaof",
];

/// Remove a file that may already be gone
async fn remove_stale(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = ?path, error = %e, "Failed to remove file"),
    }
}

/// Lifecycle control of local instances
#[async_trait]
pub trait InstanceControl: Send + Sync {
    /// Start an instance, optionally waiting until it answers PING
    async fn start(&self, id: u32, await_ready: bool) -> Result<(), ControlError>;

    /// Stop an instance, `force` skips the final save
    async fn stop(&self, id: u32, force: bool) -> Result<(), ControlError>;

    /// Kill the instance process
    async fn kill(&self, id: u32) -> Result<(), ControlError>;

    /// Rewrite the configuration file for the given node role
    async fn regenerate_config(&self, id: u32, role: NodeRole) -> Result<(), ControlError>;

    /// Push the configuration file into the running instance
    async fn reload_config(&self, id: u32) -> Vec<ControlError>;

    /// Remove the configuration file of an instance that is going away
    async fn discard_config(&self, id: u32) -> Result<(), ControlError>;
}

/// Black-box sentinel verbs
#[async_trait]
pub trait SentinelControl: Send + Sync {
    async fn monitor(&self, id: u32) -> Result<(), ControlError>;
    async fn remove(&self, id: u32) -> Result<(), ControlError>;
    async fn reset(&self, id: u32) -> Result<(), ControlError>;
    async fn failover(&self, id: u32) -> Result<(), ControlError>;
    async fn get_master_ip(&self, id: u32) -> Result<Option<String>, ControlError>;
    async fn check_quorum(&self, id: u32) -> Result<bool, ControlError>;

    /// Start the sentinel daemon
    async fn start(&self) -> Result<(), ControlError>;
    /// Stop the sentinel daemon
    async fn stop(&self) -> Result<(), ControlError>;
    async fn is_running(&self) -> bool;
}

/// Controls redis-server processes through their binary, PID files and
/// the protocol probe
pub struct ProcessControl {
    paths: InstancePaths,
    registry: Arc<dyn InstanceRegistry>,
    probe: Arc<dyn RedisProbe>,
    redis_binary: PathBuf,
    master_host: Option<String>,
    call_timeout: Duration,
    start_timeout: Duration,
    save_interval: Duration,
    save_max_wait: Duration,
}

impl ProcessControl {
    pub fn new(
        paths: InstancePaths,
        registry: Arc<dyn InstanceRegistry>,
        probe: Arc<dyn RedisProbe>,
        redis_binary: PathBuf,
    ) -> Self {
        Self {
            paths,
            registry,
            probe,
            redis_binary,
            master_host: None,
            call_timeout: Duration::from_secs(3),
            start_timeout: Duration::from_secs(30),
            save_interval: Duration::from_millis(500),
            save_max_wait: Duration::from_secs(600),
        }
    }

    /// Host that minion instances replicate from
    pub fn with_master_host(mut self, host: Option<String>) -> Self {
        self.master_host = host;
        self
    }

    pub fn with_timeouts(mut self, call_timeout: Duration, start_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self.start_timeout = start_timeout;
        self
    }

    /// Bounds of the wait for a running background save before a clean stop
    pub fn with_save_wait(mut self, interval: Duration, max_wait: Duration) -> Self {
        self.save_interval = interval;
        self.save_max_wait = max_wait;
        self
    }

    async fn running_pid(&self, id: u32) -> Option<u32> {
        let content = tokio::fs::read_to_string(self.paths.pid_file(id)).await.ok()?;
        let pid = content.trim().parse::<u32>().ok()?;
        process_exists(pid).then_some(pid)
    }

    async fn pid_file_gone(&self, id: u32) -> bool {
        poll_until(Duration::from_millis(100), self.start_timeout, move || async move {
            !self.paths.pid_file(id).exists()
        })
        .await
    }

    /// Render the configuration of one instance
    pub fn render_config(
        &self,
        meta: &crate::core::InstanceMeta,
        role: NodeRole,
    ) -> Result<String, ControlError> {
        let id = meta.id;
        let port = self
            .paths
            .port(id)
            .ok_or_else(|| ControlError::config(id, "instance id is outside the port range"))?;
        let mut lines = vec![
            format!("# redfleet instance {} ({})", id, meta.uuid),
            "daemonize yes".to_string(),
            "bind 0.0.0.0".to_string(),
            format!("port {}", port),
            format!("pidfile {}", self.paths.pid_file(id).display()),
            format!("dir {}", self.paths.storage_dir(id).display()),
            "dbfilename dump.rdb".to_string(),
        ];

        if role == NodeRole::Minion {
            let host = self.master_host.as_deref().ok_or_else(|| {
                ControlError::config(id, "master host is unknown on a minion")
            })?;
            lines.push(format!("replicaof {} {}", host, port));
            match meta.replication_type {
                ReplicationType::Replica => {
                    lines.push("replica-read-only yes".to_string());
                    lines.push("replica-serve-stale-data yes".to_string());
                }
                ReplicationType::Standby => {
                    lines.push("replica-read-only yes".to_string());
                    lines.push("replica-serve-stale-data no".to_string());
                }
            }
        }

        lines.push(String::new());
        Ok(lines.join("\n"))
    }
}

/// Parse `key value...` lines of a configuration file
pub fn parse_directives(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(char::is_whitespace))
        .map(|(key, value)| (key.to_lowercase(), value.trim().to_string()))
        .collect()
}

#[async_trait]
impl InstanceControl for ProcessControl {
    async fn start(&self, id: u32, await_ready_flag: bool) -> Result<(), ControlError> {
        if self.running_pid(id).await.is_some() {
            tracing::debug!(id, "Instance already running");
            return Ok(());
        }

        let config_file = self.paths.config_file(id);
        if !config_file.exists() {
            return Err(ControlError::start(
                id,
                format!("configuration file {} is missing", config_file.display()),
            ));
        }

        tokio::fs::create_dir_all(self.paths.storage_dir(id))
            .await
            .map_err(|e| ControlError::start(id, e.to_string()))?;

        let output = Command::new(&self.redis_binary)
            .arg(&config_file)
            .output()
            .await
            .map_err(|e| ControlError::start(id, e.to_string()))?;

        if !output.status.success() {
            return Err(ControlError::start(
                id,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        if await_ready_flag
            && !await_ready(
                self.probe.as_ref(),
                id,
                self.call_timeout,
                Duration::from_millis(250),
                self.start_timeout,
            )
            .await
        {
            return Err(ControlError::start(
                id,
                format!("no PING reply within {:?}", self.start_timeout),
            ));
        }

        tracing::info!(id, "Instance started");
        Ok(())
    }

    async fn stop(&self, id: u32, force: bool) -> Result<(), ControlError> {
        if !self.paths.pid_file(id).exists() {
            tracing::debug!(id, "Instance already stopped");
            return Ok(());
        }

        if !force {
            await_save_completion(
                self.probe.as_ref(),
                id,
                self.call_timeout,
                self.save_interval,
                self.save_max_wait,
            )
            .await
            .map_err(|_| {
                ControlError::stop(
                    id,
                    format!("background save still running after {:?}", self.save_max_wait),
                )
            })?;
        }

        let command: &[&str] = if force {
            &["SHUTDOWN", "NOSAVE"]
        } else {
            &["SHUTDOWN"]
        };

        match self.probe.execute(id, command, self.call_timeout).await {
            // SHUTDOWN closes the connection instead of replying
            Ok(_) | Err(ProbeError::Connect(_)) | Err(ProbeError::Protocol(_)) => {}
            Err(e) if force => {
                tracing::warn!(id, error = %e, "Shutdown failed, killing instance");
                return self.kill(id).await;
            }
            Err(e) => return Err(ControlError::stop(id, e.to_string())),
        }

        if self.pid_file_gone(id).await {
            tracing::info!(id, "Instance stopped");
            return Ok(());
        }

        if force {
            return self.kill(id).await;
        }

        Err(ControlError::stop(
            id,
            format!("still running after {:?}", self.start_timeout),
        ))
    }

    async fn kill(&self, id: u32) -> Result<(), ControlError> {
        let Some(pid) = self.running_pid(id).await else {
            remove_stale(&self.paths.pid_file(id)).await;
            return Ok(());
        };

        let status = Command::new("kill")
            .arg("-9")
            .arg(pid.to_string())
            .status()
            .await
            .map_err(|e| ControlError::Kill {
                id,
                message: e.to_string(),
            })?;

        if !status.success() {
            return Err(ControlError::Kill {
                id,
                message: format!("kill exited with {}", status),
            });
        }

        remove_stale(&self.paths.pid_file(id)).await;
        tracing::warn!(id, pid, "Instance killed");
        Ok(())
    }

    async fn regenerate_config(&self, id: u32, role: NodeRole) -> Result<(), ControlError> {
        let meta = self
            .registry
            .get(id)
            .await
            .map_err(|e| ControlError::config(id, e.to_string()))?;
        let content = self.render_config(&meta, role)?;

        tokio::fs::create_dir_all(&self.paths.config_dir)
            .await
            .map_err(|e| ControlError::config(id, e.to_string()))?;
        tokio::fs::write(self.paths.config_file(id), content.as_bytes())
            .await
            .map_err(|e| ControlError::config(id, e.to_string()))?;

        let hash = format!("{:x}", md5::compute(content.as_bytes()));
        self.registry
            .save(&meta.with_applied_config(hash, crate::utils::unix_now()))
            .await
            .map_err(|e| ControlError::config(id, e.to_string()))?;

        tracing::info!(id, %role, "Configuration regenerated");
        Ok(())
    }

    async fn discard_config(&self, id: u32) -> Result<(), ControlError> {
        match tokio::fs::remove_file(self.paths.config_file(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ControlError::config(id, e.to_string())),
        }
    }

    async fn reload_config(&self, id: u32) -> Vec<ControlError> {
        let content = match tokio::fs::read_to_string(self.paths.config_file(id)).await {
            Ok(content) => content,
            Err(e) => return vec![ControlError::config(id, e.to_string())],
        };

        let mut errors = Vec::new();
        for (key, value) in parse_directives(&content) {
            if STATIC_DIRECTIVES.contains(&key.as_str()) {
                continue;
            }
            let command = ["CONFIG", "SET", key.as_str(), value.as_str()];
            match self.probe.execute(id, &command, self.call_timeout).await {
                Ok(reply) if reply.is_ok() => {}
                Ok(reply) => errors.push(ControlError::config(
                    id,
                    format!("{}: unexpected reply {:?}", key, reply),
                )),
                Err(e) => errors.push(ControlError::config(id, format!("{}: {}", key, e))),
            }
        }
        errors
    }
}

/// Sentinel driven through its own RESP port
pub struct RespSentinel {
    probe: Arc<dyn RedisProbe>,
    paths: InstancePaths,
    master_host: String,
    quorum: u32,
    binary: PathBuf,
    config_file: PathBuf,
    call_timeout: Duration,
}

impl RespSentinel {
    /// `probe` must target the sentinel port
    pub fn new(
        probe: Arc<dyn RedisProbe>,
        paths: InstancePaths,
        master_host: String,
        quorum: u32,
        binary: PathBuf,
        config_file: PathBuf,
    ) -> Self {
        Self {
            probe,
            paths,
            master_host,
            quorum,
            binary,
            config_file,
            call_timeout: Duration::from_secs(3),
        }
    }

    fn master_name(id: u32) -> String {
        format!("redis-{}", id)
    }

    async fn sentinel(&self, args: &[&str]) -> Result<RespValue, ControlError> {
        let mut command = vec!["SENTINEL"];
        command.extend_from_slice(args);
        self.probe
            .execute(0, &command, self.call_timeout)
            .await
            .map_err(|e| ControlError::sentinel(format!("SENTINEL {}: {}", args.join(" "), e)))
    }
}

#[async_trait]
impl SentinelControl for RespSentinel {
    async fn monitor(&self, id: u32) -> Result<(), ControlError> {
        let name = Self::master_name(id);
        let port = self
            .paths
            .port(id)
            .ok_or_else(|| ControlError::sentinel(format!("instance {} has no valid port", id)))?
            .to_string();
        let quorum = self.quorum.to_string();
        self.sentinel(&["MONITOR", &name, &self.master_host, &port, &quorum])
            .await?;
        tracing::info!(id, "Sentinel monitoring enabled");
        Ok(())
    }

    async fn remove(&self, id: u32) -> Result<(), ControlError> {
        let name = Self::master_name(id);
        self.sentinel(&["REMOVE", &name]).await.map(|_| ())
    }

    async fn reset(&self, id: u32) -> Result<(), ControlError> {
        let pattern = if id == 0 {
            "*".to_string()
        } else {
            Self::master_name(id)
        };
        self.sentinel(&["RESET", &pattern]).await.map(|_| ())
    }

    async fn failover(&self, id: u32) -> Result<(), ControlError> {
        let name = Self::master_name(id);
        self.sentinel(&["FAILOVER", &name]).await.map(|_| ())
    }

    async fn get_master_ip(&self, id: u32) -> Result<Option<String>, ControlError> {
        let name = Self::master_name(id);
        match self.sentinel(&["GET-MASTER-ADDR-BY-NAME", &name]).await? {
            RespValue::Array(Some(items)) => Ok(items.first().and_then(RespValue::as_text)),
            _ => Ok(None),
        }
    }

    async fn check_quorum(&self, id: u32) -> Result<bool, ControlError> {
        let name = Self::master_name(id);
        match self.sentinel(&["CKQUORUM", &name]).await {
            Ok(_) => Ok(true),
            Err(ControlError::Sentinel { message }) if message.contains("NOQUORUM") => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn start(&self) -> Result<(), ControlError> {
        if self.is_running().await {
            return Ok(());
        }

        let status = Command::new(&self.binary)
            .arg(&self.config_file)
            .arg("--daemonize")
            .arg("yes")
            .status()
            .await
            .map_err(|e| ControlError::sentinel(e.to_string()))?;

        if status.success() {
            tracing::info!("Sentinel started");
            Ok(())
        } else {
            Err(ControlError::sentinel(format!(
                "redis-sentinel exited with {}",
                status
            )))
        }
    }

    async fn stop(&self) -> Result<(), ControlError> {
        match self.probe.execute(0, &["SHUTDOWN"], self.call_timeout).await {
            Ok(_) | Err(ProbeError::Connect(_)) | Err(ProbeError::Protocol(_)) => {
                tracing::info!("Sentinel stopped");
                Ok(())
            }
            Err(e) => Err(ControlError::sentinel(e.to_string())),
        }
    }

    async fn is_running(&self) -> bool {
        matches!(
            self.probe.execute(0, &["PING"], self.call_timeout).await,
            Ok(RespValue::SimpleString(ref s)) if s == "PONG"
        )
    }
}

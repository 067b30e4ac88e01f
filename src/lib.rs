/// Redfleet - fleet coordinator for Redis instances
///
/// One master node owns the authoritative instance registry and the command
/// queue. Minion nodes keep replicas of every instance and sentinel nodes
/// monitor them; both pull lifecycle commands from the master over a small
/// JSON/HTTP sync protocol.
pub mod config;
pub mod core;
pub mod error;
pub mod health;
pub mod replication;
pub mod role;
pub mod sync;
pub mod utils;

use crate::config::Config;
use crate::core::{
    BatchAction, BatchReport, BatchRunner, Credential, InstanceControl, InstanceMeta,
    InstancePaths, InstanceRegistry, NodeRole, ProcessControl, RespSentinel, SentinelControl,
    StateSnapshot,
};
use crate::error::{FleetError, FleetResult};
use crate::health::redis::{RedisProbe, RespProbe};
use crate::health::{ClassifierSettings, State, StateProber, StateSource};
use crate::role::{FileRoleStore, PidFileDaemon, RoleStore, RoleSwitch};
use crate::sync::{
    ClientRole, ClientRoster, CommandApplier, CommandQueue, CommandQueueItem, CommandVerb,
    MasterInfo, ReplicationInfo, RosterSettings, ServerState, StatsInfo, SyncAgent, SyncClient,
    SyncServer,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Result of forwarding a local action to the master's queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Propagation {
    /// Queued, with the queue modification time
    Queued(u64),
    /// Nothing to propagate from this node
    Skipped,
    /// The local effect stands, remote nodes were not told
    Failed(String),
}

/// Host part of an http(s) URL
fn url_host(url: &str) -> Option<String> {
    reqwest::Url::parse(url)
        .ok()?
        .host_str()
        .map(str::to_string)
}

/// All collaborators of one node, wired from its configuration
pub struct FleetNode {
    config: Config,
    role: NodeRole,
    registry: Arc<dyn InstanceRegistry>,
    control: Arc<dyn InstanceControl>,
    states: Arc<dyn StateSource>,
    probe: Arc<dyn RedisProbe>,
    sentinel: Option<Arc<dyn SentinelControl>>,
    role_store: Arc<dyn RoleStore>,
}

impl FleetNode {
    /// Build a node backed by the local filesystem and Redis processes
    pub async fn from_config(config: Config) -> FleetResult<Self> {
        config.validate()?;

        let role_store: Arc<dyn RoleStore> = Arc::new(FileRoleStore::new(config.role_file()));
        let role = role_store.load().await?.unwrap_or(config.node.role);

        let paths = InstancePaths::from_config(&config);
        let registry: Arc<dyn InstanceRegistry> = Arc::new(crate::core::DirRegistry::new(
            &config.node.data_dir,
            config.node.max_instances,
        ));
        let probe: Arc<dyn RedisProbe> = Arc::new(
            RespProbe::new(paths.clone()).with_password(config.node.probe_password.clone()),
        );

        let states: Arc<dyn StateSource> = Arc::new(
            StateProber::new(paths.clone(), probe.clone(), config.probe_timeout())
                .with_registry(registry.clone())
                .with_settings(ClassifierSettings {
                    idle_ops_threshold: config.health.idle_ops_threshold,
                    pid_grace: Duration::from_secs(config.health.pid_grace_sec),
                }),
        );

        let master_host = config.sync.master_url.as_deref().and_then(url_host);
        let control: Arc<dyn InstanceControl> = Arc::new(
            ProcessControl::new(
                paths.clone(),
                registry.clone(),
                probe.clone(),
                config.node.redis_binary.clone(),
            )
            .with_master_host(master_host.clone())
            .with_timeouts(
                config.probe_timeout(),
                Duration::from_secs(config.health.start_timeout_sec),
            )
            .with_save_wait(
                Duration::from_millis(config.health.save_poll_interval_ms),
                Duration::from_secs(config.health.save_max_wait_sec),
            ),
        );

        let sentinel: Option<Arc<dyn SentinelControl>> = if config.sentinel.enabled {
            Some(Arc::new(RespSentinel::new(
                Arc::new(RespProbe::fixed(config.sentinel.port)),
                paths,
                master_host.unwrap_or_else(|| "127.0.0.1".to_string()),
                config.sentinel.quorum,
                config.sentinel.binary.clone(),
                config.sentinel.config_file.clone(),
            )))
        } else {
            None
        };

        Ok(Self {
            config,
            role,
            registry,
            control,
            states,
            probe,
            sentinel,
            role_store,
        })
    }

    /// Build a node from explicit collaborators
    pub fn with_components(
        config: Config,
        role: NodeRole,
        registry: Arc<dyn InstanceRegistry>,
        control: Arc<dyn InstanceControl>,
        states: Arc<dyn StateSource>,
        probe: Arc<dyn RedisProbe>,
        role_store: Arc<dyn RoleStore>,
    ) -> Self {
        Self {
            config,
            role,
            registry,
            control,
            states,
            probe,
            sentinel: None,
            role_store,
        }
    }

    pub fn with_sentinel(mut self, sentinel: Arc<dyn SentinelControl>) -> Self {
        self.sentinel = Some(sentinel);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn registry(&self) -> &Arc<dyn InstanceRegistry> {
        &self.registry
    }

    fn hostname(&self) -> String {
        self.config
            .node
            .hostname
            .clone()
            .unwrap_or_else(utils::hostname)
    }

    fn runner(&self) -> BatchRunner {
        BatchRunner::new(self.control.clone(), self.states.clone())
    }

    /// Local destructive commands belong to the master unless a minion is
    /// explicitly allowed to run them
    fn guard_local(&self, action: &str) -> FleetResult<()> {
        match self.role {
            NodeRole::Master => Ok(()),
            NodeRole::Minion if self.config.sync.allow_commands => Ok(()),
            NodeRole::Minion => Err(FleetError::precondition(format!(
                "{} must run on the master (or set sync.allow_commands on this minion)",
                action
            ))),
            NodeRole::Sentinel => Err(FleetError::precondition(format!(
                "{} is not available on a sentinel node",
                action
            ))),
        }
    }

    /// URL of the sync daemon this node talks to
    fn sync_url(&self) -> FleetResult<String> {
        match self.role {
            NodeRole::Master => {
                let addr = self
                    .config
                    .sync
                    .listen_addr
                    .parse::<std::net::SocketAddr>()
                    .map_err(|e| FleetError::precondition(format!("bad listen_addr: {}", e)))?;
                let port = addr.port();
                let host = if addr.ip().is_unspecified() {
                    "127.0.0.1".to_string()
                } else {
                    addr.ip().to_string()
                };
                Ok(format!("http://{}:{}", host, port))
            }
            _ => self
                .config
                .sync
                .master_url
                .clone()
                .ok_or_else(|| FleetError::precondition("sync.master_url is not configured")),
        }
    }

    fn sync_client(&self) -> FleetResult<SyncClient> {
        let client = SyncClient::new(
            &self.sync_url()?,
            &self.config.sync.token,
            self.config.request_timeout(),
        )?;
        Ok(client.with_hostname(&self.hostname()))
    }

    /// Queue `item` on the master's daemon, keeping the local effect on failure
    async fn propagate(&self, item: CommandQueueItem) -> Propagation {
        if self.role != NodeRole::Master {
            return Propagation::Skipped;
        }

        let pushed = match self.sync_client() {
            Ok(client) => client.push(&item).await.map_err(FleetError::from),
            Err(e) => Err(e),
        };

        match pushed {
            Ok(mod_time) => {
                tracing::info!(%item, mod_time, "Command propagated");
                Propagation::Queued(mod_time)
            }
            Err(e) => {
                tracing::warn!(%item, error = %e, "Propagation failed, local change kept");
                Propagation::Failed(e.to_string())
            }
        }
    }

    /// Create and start a new instance
    pub async fn create(
        &self,
        owner: &str,
        description: &str,
        password: &str,
        initiator: &str,
    ) -> FleetResult<(InstanceMeta, Propagation)> {
        self.guard_local("create")?;

        let id = self.registry.allocate_id().await?;
        let meta = InstanceMeta::new(id, owner, description, password);
        self.registry.save(&meta).await?;
        if let Err(e) = self.bring_up(id).await {
            self.roll_back(id).await;
            return Err(e);
        }
        tracing::info!(id, uuid = %meta.uuid, owner, "Instance created");
        self.refresh_snapshot().await;

        let propagation = self
            .propagate(CommandQueueItem::new(
                CommandVerb::Create,
                id,
                meta.uuid,
                initiator,
            ))
            .await;
        Ok((meta, propagation))
    }

    async fn bring_up(&self, id: u32) -> FleetResult<()> {
        self.control.regenerate_config(id, self.role).await?;
        self.control.start(id, true).await?;
        Ok(())
    }

    /// Undo a half-finished create so no orphan entry stays behind
    async fn roll_back(&self, id: u32) {
        if !self.states.state(id).await.is_stopped() {
            if let Err(e) = self.control.kill(id).await {
                tracing::warn!(id, error = %e, "Rollback could not kill instance");
            }
        }
        if let Err(e) = self.control.discard_config(id).await {
            tracing::warn!(id, error = %e, "Rollback could not remove config");
        }
        match self.registry.delete(id).await {
            Ok(()) => tracing::warn!(id, "Create rolled back"),
            Err(e) => tracing::error!(id, error = %e, "Rollback could not delete registry entry"),
        }
    }

    /// Change the metadata of one instance and tell the fleet.
    ///
    /// `change` receives the current metadata; returning it unchanged is a
    /// no-op. The ID and generation UUID are fixed.
    pub async fn edit<F>(
        &self,
        id: u32,
        change: F,
        initiator: &str,
    ) -> FleetResult<(InstanceMeta, Propagation)>
    where
        F: FnOnce(InstanceMeta) -> InstanceMeta + Send,
    {
        self.guard_local("edit")?;

        let current = self.registry.get(id).await?;
        let edited = change(current.clone());
        if edited.id != current.id || edited.uuid != current.uuid {
            return Err(FleetError::precondition(format!(
                "instance {} keeps its id and uuid across edits",
                id
            )));
        }
        if edited == current {
            return Ok((current, Propagation::Skipped));
        }

        self.registry.save(&edited).await?;
        self.control.regenerate_config(id, self.role).await?;
        if self.states.state(id).await.is_works() {
            for e in self.control.reload_config(id).await {
                tracing::warn!(id, error = %e, "Config reload incomplete");
            }
        }
        tracing::info!(id, uuid = %edited.uuid, "Instance edited");

        let propagation = self
            .propagate(CommandQueueItem::new(
                CommandVerb::Edit,
                id,
                edited.uuid,
                initiator,
            ))
            .await;
        Ok((edited, propagation))
    }

    /// Remove a stopped instance from the fleet
    pub async fn destroy(&self, id: u32, initiator: &str) -> FleetResult<Propagation> {
        self.guard_local("destroy")?;

        let meta = self.registry.get(id).await?;
        let state = self.states.state(id).await;
        if !state.is_stopped() {
            return Err(FleetError::precondition(format!(
                "instance {} is {}, stop it first",
                id, state
            )));
        }

        self.registry.delete(id).await?;
        tracing::info!(id, uuid = %meta.uuid, "Instance destroyed");
        self.refresh_snapshot().await;

        Ok(self
            .propagate(CommandQueueItem::new(
                CommandVerb::Destroy,
                id,
                meta.uuid,
                initiator,
            ))
            .await)
    }

    /// Start, stop or restart one instance
    pub async fn lifecycle(
        &self,
        action: BatchAction,
        id: u32,
        force: bool,
        initiator: &str,
    ) -> FleetResult<(BatchReport, Propagation)> {
        self.guard_local(&action.to_string())?;

        let meta = self.registry.get(id).await?;
        let report = self.runner().run(action, &[id], force).await?.into_result()?;
        self.refresh_snapshot().await;

        let verb = match action {
            BatchAction::Start => CommandVerb::Start,
            BatchAction::Stop => CommandVerb::Stop,
            BatchAction::Restart => CommandVerb::Restart,
        };
        let propagation = self
            .propagate(CommandQueueItem::new(verb, id, meta.uuid, initiator))
            .await;
        Ok((report, propagation))
    }

    /// Apply `action` to every local instance.
    ///
    /// Failed items do not stop the batch; the report carries them.
    pub async fn batch(
        &self,
        action: BatchAction,
        force: bool,
        initiator: &str,
    ) -> FleetResult<(BatchReport, Propagation)> {
        self.guard_local(&format!("{}-all", action))?;
        if action == BatchAction::Restart && self.role == NodeRole::Master && !force {
            self.refuse_while_syncing().await?;
        }

        let ids = self.registry.list().await?;
        let report = self.runner().run(action, &ids, force).await?;
        self.refresh_snapshot().await;

        let verb = match action {
            BatchAction::Start => CommandVerb::StartAll,
            BatchAction::Stop => CommandVerb::StopAll,
            BatchAction::Restart => CommandVerb::RestartAll,
        };
        let propagation = self
            .propagate(CommandQueueItem::fleet(verb, initiator))
            .await;
        Ok((report, propagation))
    }

    /// Minions still catching up block a restart of every master instance
    async fn refuse_while_syncing(&self) -> FleetResult<()> {
        match self.replication().await {
            Ok(info) if info.has_syncing_clients() => Err(FleetError::precondition(format!(
                "minions are still syncing (lag up to {} ms), retry later or force",
                info.max_sync_lag_ms()
            ))),
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "Replication status unavailable, restarting anyway");
                Ok(())
            }
        }
    }

    /// Metadata and current state of instances, all of them when `ids` is empty
    pub async fn status(&self, ids: &[u32]) -> FleetResult<Vec<(InstanceMeta, State)>> {
        let ids = if ids.is_empty() {
            self.registry.list().await?
        } else {
            ids.to_vec()
        };

        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            let meta = self.registry.get(id).await?;
            rows.push((meta, self.states.state(id).await));
        }
        Ok(rows)
    }

    pub async fn switch_role(&self, target: NodeRole, confirmed: bool) -> FleetResult<()> {
        let switch = RoleSwitch::new(
            self.registry.clone(),
            self.control.clone(),
            self.states.clone(),
            self.probe.clone(),
            self.role_store.clone(),
            Arc::new(PidFileDaemon::new(self.config.daemon_pid_file())),
            self.config.node.role,
        )
        .with_virtual_ip(self.config.node.virtual_ip.clone())
        .with_call_timeout(self.config.probe_timeout());

        switch.switch(target, confirmed).await
    }

    pub async fn replication(&self) -> FleetResult<ReplicationInfo> {
        Ok(self.sync_client()?.replication().await?)
    }

    pub async fn stats(&self) -> FleetResult<StatsInfo> {
        Ok(self.sync_client()?.stats().await?)
    }

    /// Record the current state of every instance
    pub async fn save_snapshot(&self) -> FleetResult<StateSnapshot> {
        let ids = self.registry.list().await?;
        let snapshot =
            StateSnapshot::capture(self.states.as_ref(), &ids, utils::unix_now()).await;
        snapshot.save(self.config.snapshot_file()).await?;
        Ok(snapshot)
    }

    /// Keep the snapshot current after a state change, a failure only warns
    async fn refresh_snapshot(&self) {
        if let Err(e) = self.save_snapshot().await {
            tracing::warn!(error = %e, "Could not save state snapshot");
        }
    }

    /// Restart instances that were working before a host reboot.
    ///
    /// Returns `None` when no reboot happened since the last snapshot.
    pub async fn restore_after_reboot(&self) -> FleetResult<Option<BatchReport>> {
        let Some(snapshot) = StateSnapshot::load(self.config.snapshot_file()).await? else {
            return Ok(None);
        };
        let Some(uptime) = utils::host_uptime() else {
            tracing::warn!("Host uptime unavailable, skipping reboot detection");
            return Ok(None);
        };
        self.restore_since(snapshot, uptime).await
    }

    async fn restore_since(
        &self,
        snapshot: StateSnapshot,
        uptime: Duration,
    ) -> FleetResult<Option<BatchReport>> {
        if !snapshot.reboot_since(utils::unix_now(), uptime) {
            return Ok(None);
        }

        tracing::info!(uptime = %utils::format_duration(uptime), "Reboot detected");
        let report = snapshot.restore(&self.runner()).await?;
        self.save_snapshot().await?;
        Ok(Some(report))
    }

    async fn write_daemon_pid(&self) -> FleetResult<()> {
        let path = self.config.daemon_pid_file();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, format!("{}\n", std::process::id())).await?;
        Ok(())
    }

    async fn remove_daemon_pid(&self) {
        if let Err(e) = tokio::fs::remove_file(self.config.daemon_pid_file()).await {
            tracing::debug!(error = %e, "Daemon PID file already gone");
        }
    }

    /// Run the sync server until `shutdown` turns true
    pub async fn serve(&self, shutdown: watch::Receiver<bool>) -> FleetResult<()> {
        if self.role != NodeRole::Master {
            return Err(FleetError::precondition(format!(
                "the sync server runs on the master, this node is {}",
                self.role
            )));
        }

        let queue = Arc::new(CommandQueue::open(&self.config.sync.queue_file).await?);
        let roster = Arc::new(
            ClientRoster::new(RosterSettings::from_config(&self.config.sync))
                .with_outbox_dir(self.config.outbox_dir()),
        );

        let superuser = match (
            &self.config.sync.superuser_pepper,
            &self.config.sync.superuser_hash,
        ) {
            (Some(pepper), Some(hash)) => Some(Credential {
                pepper: pepper.clone(),
                hash: hash.clone(),
            }),
            _ => None,
        };

        let listener = tokio::net::TcpListener::bind(&self.config.sync.listen_addr).await?;
        let master = MasterInfo {
            version: sync::CORE_VERSION.to_string(),
            hostname: self.hostname(),
            ip: self
                .config
                .node
                .virtual_ip
                .clone()
                .unwrap_or_else(|| listener.local_addr().map(|a| a.ip().to_string()).unwrap_or_default()),
        };

        let state = ServerState::new(
            self.registry.clone(),
            self.states.clone(),
            queue,
            roster,
            &self.config.sync.token,
            master,
        )
        .with_superuser(superuser);
        let recovered = state.recover().await?;
        if recovered > 0 {
            tracing::info!(count = recovered, "Requeued commands from the previous run");
        }

        self.write_daemon_pid().await?;
        let served = SyncServer::new(state).serve(listener, shutdown).await;
        self.remove_daemon_pid().await;
        served
    }

    /// Run the pull loop of a minion or sentinel until `shutdown` turns true
    pub async fn run_agent(&self, shutdown: watch::Receiver<bool>) -> FleetResult<()> {
        let role = ClientRole::try_from(self.role)?;
        let client = Arc::new(self.sync_client()?);

        let mut applier = CommandApplier::new(
            role,
            self.registry.clone(),
            self.control.clone(),
            self.states.clone(),
        );
        if let Some(sentinel) = &self.sentinel {
            applier = applier.with_sentinel(sentinel.clone());
        }

        let agent = SyncAgent::new(client, applier, role, self.config.poll_interval());

        self.write_daemon_pid().await?;
        let ran = agent.run(shutdown).await;
        self.remove_daemon_pid().await;
        ran
    }
}

/// Guarded master ↔ minion role switch
///
/// A switch either completes every step and persists the new role, or stops
/// at the first failing step with the stored role untouched.
use crate::core::{InstanceControl, InstanceRegistry, NodeRole};
use crate::error::{FleetError, FleetResult, RoleSwitchError};
use crate::health::redis::RedisProbe;
use crate::health::{process_exists, StateSource};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Persisted node role
#[async_trait]
pub trait RoleStore: Send + Sync {
    async fn load(&self) -> FleetResult<Option<NodeRole>>;
    async fn store(&self, role: NodeRole) -> FleetResult<()>;
}

/// Role kept as a single word in a file
pub struct FileRoleStore {
    path: PathBuf,
}

impl FileRoleStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RoleStore for FileRoleStore {
    async fn load(&self) -> FleetResult<Option<NodeRole>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content
                .parse::<NodeRole>()
                .map(Some)
                .map_err(FleetError::internal),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, role: NodeRole) -> FleetResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, format!("{}\n", role)).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Whether the local sync daemon is running
#[async_trait]
pub trait DaemonProbe: Send + Sync {
    async fn is_active(&self) -> bool;
}

/// Daemon liveness from its PID file
pub struct PidFileDaemon {
    path: PathBuf,
}

impl PidFileDaemon {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DaemonProbe for PidFileDaemon {
    async fn is_active(&self) -> bool {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content
                .trim()
                .parse::<u32>()
                .map(process_exists)
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// Ownership of the fleet virtual IP
#[async_trait]
pub trait VirtualIpCheck: Send + Sync {
    async fn holds(&self, vip: &str) -> bool;
}

/// A node holds the address when it can bind a socket to it
pub struct BindCheck;

#[async_trait]
impl VirtualIpCheck for BindCheck {
    async fn holds(&self, vip: &str) -> bool {
        let Ok(ip) = vip.trim().parse::<IpAddr>() else {
            tracing::warn!(vip, "Virtual IP is not an address");
            return false;
        };
        tokio::net::UdpSocket::bind(SocketAddr::new(ip, 0))
            .await
            .is_ok()
    }
}

pub struct RoleSwitch {
    registry: Arc<dyn InstanceRegistry>,
    control: Arc<dyn InstanceControl>,
    states: Arc<dyn StateSource>,
    probe: Arc<dyn RedisProbe>,
    store: Arc<dyn RoleStore>,
    daemon: Arc<dyn DaemonProbe>,
    vip_check: Arc<dyn VirtualIpCheck>,
    virtual_ip: Option<String>,
    /// Role assumed when nothing has been persisted yet
    configured: NodeRole,
    call_timeout: Duration,
}

impl RoleSwitch {
    pub fn new(
        registry: Arc<dyn InstanceRegistry>,
        control: Arc<dyn InstanceControl>,
        states: Arc<dyn StateSource>,
        probe: Arc<dyn RedisProbe>,
        store: Arc<dyn RoleStore>,
        daemon: Arc<dyn DaemonProbe>,
        configured: NodeRole,
    ) -> Self {
        Self {
            registry,
            control,
            states,
            probe,
            store,
            daemon,
            vip_check: Arc::new(BindCheck),
            virtual_ip: None,
            configured,
            call_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_virtual_ip(mut self, virtual_ip: Option<String>) -> Self {
        self.virtual_ip = virtual_ip;
        self
    }

    pub fn with_vip_check(mut self, vip_check: Arc<dyn VirtualIpCheck>) -> Self {
        self.vip_check = vip_check;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub async fn current_role(&self) -> FleetResult<NodeRole> {
        Ok(self.store.load().await?.unwrap_or(self.configured))
    }

    /// Switch the node to `target`
    pub async fn switch(&self, target: NodeRole, confirmed: bool) -> FleetResult<()> {
        if !confirmed {
            return Err(RoleSwitchError::NotConfirmed.into());
        }

        let current = self.current_role().await?;
        if current == target {
            return Err(RoleSwitchError::AlreadyInRole(target).into());
        }
        if current == NodeRole::Sentinel || target == NodeRole::Sentinel {
            return Err(RoleSwitchError::Unsupported(NodeRole::Sentinel).into());
        }
        if self.daemon.is_active().await {
            return Err(RoleSwitchError::DaemonActive.into());
        }

        let ids = self.registry.list().await?;
        if ids.is_empty() {
            return Err(RoleSwitchError::NoInstances.into());
        }

        tracing::info!(from = %current, to = %target, instances = ids.len(), "Switching role");
        match target {
            NodeRole::Minion => self.demote(&ids).await?,
            _ => self.promote(&ids).await?,
        }

        self.store.store(target).await?;
        tracing::info!(role = %target, "Role switched");
        Ok(())
    }

    async fn working(&self, ids: &[u32]) -> Vec<u32> {
        let mut working = Vec::new();
        for &id in ids {
            if self.states.state(id).await.is_works() {
                working.push(id);
            }
        }
        working
    }

    /// Master to minion: stop, then rewrite configs as replicas
    async fn demote(&self, ids: &[u32]) -> FleetResult<()> {
        let mut failed = 0;
        for id in self.working(ids).await {
            if let Err(e) = self.control.stop(id, false).await {
                tracing::warn!(id, error = %e, "Stop failed");
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(RoleSwitchError::StepFailed { step: "stop", failed }.into());
        }

        self.regenerate(ids, NodeRole::Minion).await
    }

    /// Minion to master: detach replicas, rewrite configs, reload live ones
    async fn promote(&self, ids: &[u32]) -> FleetResult<()> {
        let vip = self
            .virtual_ip
            .as_deref()
            .ok_or_else(|| RoleSwitchError::VirtualIpNotHeld("not configured".to_string()))?;
        if !self.vip_check.holds(vip).await {
            return Err(RoleSwitchError::VirtualIpNotHeld(vip.to_string()).into());
        }

        let working = self.working(ids).await;

        let mut failed = 0;
        for &id in &working {
            match self
                .probe
                .execute(id, &["REPLICAOF", "NO", "ONE"], self.call_timeout)
                .await
            {
                Ok(reply) if reply.is_ok() => {}
                Ok(reply) => {
                    tracing::warn!(id, ?reply, "REPLICAOF NO ONE refused");
                    failed += 1;
                }
                Err(e) => {
                    tracing::warn!(id, error = %e, "REPLICAOF NO ONE failed");
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            return Err(RoleSwitchError::StepFailed {
                step: "replicaof",
                failed,
            }
            .into());
        }

        self.regenerate(ids, NodeRole::Master).await?;

        let mut failed = 0;
        for &id in &working {
            let errors = self.control.reload_config(id).await;
            for e in &errors {
                tracing::warn!(id, error = %e, "Reload failed");
            }
            if !errors.is_empty() {
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(RoleSwitchError::StepFailed {
                step: "reload",
                failed,
            }
            .into());
        }
        Ok(())
    }

    async fn regenerate(&self, ids: &[u32], role: NodeRole) -> FleetResult<()> {
        let mut failed = 0;
        for &id in ids {
            if let Err(e) = self.control.regenerate_config(id, role).await {
                tracing::warn!(id, error = %e, "Config regeneration failed");
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(RoleSwitchError::StepFailed {
                step: "regenerate",
                failed,
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::batch::tests::FakeNode;
    use crate::core::{InstanceMeta, MemoryRegistry};
    use crate::error::ProbeError;
    use crate::health::resp::RespValue;
    use crate::health::{Modifiers, State};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MemoryRoleStore {
        role: Mutex<Option<NodeRole>>,
    }

    #[async_trait]
    impl RoleStore for MemoryRoleStore {
        async fn load(&self) -> FleetResult<Option<NodeRole>> {
            Ok(*self.role.lock().unwrap())
        }

        async fn store(&self, role: NodeRole) -> FleetResult<()> {
            *self.role.lock().unwrap() = Some(role);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Switchable(AtomicBool);

    #[async_trait]
    impl DaemonProbe for Switchable {
        async fn is_active(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl VirtualIpCheck for Switchable {
        async fn holds(&self, _vip: &str) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct ReplicaofProbe {
        commands: Mutex<Vec<(u32, String)>>,
    }

    #[async_trait]
    impl RedisProbe for ReplicaofProbe {
        async fn execute(
            &self,
            id: u32,
            command: &[&str],
            _timeout: Duration,
        ) -> Result<RespValue, ProbeError> {
            self.commands.lock().unwrap().push((id, command.join(" ")));
            Ok(RespValue::SimpleString("OK".to_string()))
        }
    }

    struct Fixture {
        node: Arc<FakeNode>,
        store: Arc<MemoryRoleStore>,
        daemon: Arc<Switchable>,
        vip: Arc<Switchable>,
        probe: Arc<ReplicaofProbe>,
        switch: RoleSwitch,
    }

    fn fixture(role: NodeRole, states: &[(u32, State)]) -> Fixture {
        let metas = states
            .iter()
            .map(|(id, _)| InstanceMeta::new(*id, "ops", "", "p"))
            .collect();
        let registry = Arc::new(MemoryRegistry::with_instances(16, metas));
        let node = Arc::new(FakeNode::with_states(states));
        let store = Arc::new(MemoryRoleStore::default());
        let daemon = Arc::new(Switchable::default());
        let vip = Arc::new(Switchable(AtomicBool::new(true)));
        let probe = Arc::new(ReplicaofProbe::default());

        let switch = RoleSwitch::new(
            registry,
            node.clone(),
            node.clone(),
            probe.clone(),
            store.clone(),
            daemon.clone(),
            role,
        )
        .with_virtual_ip(Some("10.0.0.100".to_string()))
        .with_vip_check(vip.clone());

        Fixture {
            node,
            store,
            daemon,
            vip,
            probe,
            switch,
        }
    }

    fn works() -> State {
        State::works(Modifiers::default())
    }

    #[tokio::test]
    async fn test_guards() {
        let f = fixture(NodeRole::Master, &[(1, works())]);

        assert!(matches!(
            f.switch.switch(NodeRole::Minion, false).await,
            Err(FleetError::RoleSwitch(RoleSwitchError::NotConfirmed))
        ));
        assert!(matches!(
            f.switch.switch(NodeRole::Master, true).await,
            Err(FleetError::RoleSwitch(RoleSwitchError::AlreadyInRole(_)))
        ));
        assert!(matches!(
            f.switch.switch(NodeRole::Sentinel, true).await,
            Err(FleetError::RoleSwitch(RoleSwitchError::Unsupported(_)))
        ));

        f.daemon.0.store(true, Ordering::SeqCst);
        assert!(matches!(
            f.switch.switch(NodeRole::Minion, true).await,
            Err(FleetError::RoleSwitch(RoleSwitchError::DaemonActive))
        ));
        assert!(f.node.calls().is_empty());

        let empty = fixture(NodeRole::Master, &[]);
        assert!(matches!(
            empty.switch.switch(NodeRole::Minion, true).await,
            Err(FleetError::RoleSwitch(RoleSwitchError::NoInstances))
        ));
    }

    #[tokio::test]
    async fn test_master_to_minion() {
        let f = fixture(NodeRole::Master, &[(1, works()), (2, State::stopped())]);

        f.switch.switch(NodeRole::Minion, true).await.unwrap();

        assert_eq!(
            f.node.calls(),
            vec!["stop 1", "regenerate 1 minion", "regenerate 2 minion"]
        );
        assert_eq!(f.switch.current_role().await.unwrap(), NodeRole::Minion);
    }

    #[tokio::test]
    async fn test_failed_stop_changes_nothing() {
        let f = fixture(NodeRole::Master, &[(1, works()), (2, works())]);
        f.node.fail(2);

        let result = f.switch.switch(NodeRole::Minion, true).await;

        assert!(matches!(
            result,
            Err(FleetError::RoleSwitch(RoleSwitchError::StepFailed { step: "stop", failed: 1 }))
        ));
        assert!(f.node.calls().iter().all(|call| !call.starts_with("regenerate")));
        assert!(f.store.role.lock().unwrap().is_none());
        assert_eq!(f.switch.current_role().await.unwrap(), NodeRole::Master);
    }

    #[tokio::test]
    async fn test_minion_to_master() {
        let f = fixture(NodeRole::Minion, &[(1, works()), (2, State::stopped())]);

        f.switch.switch(NodeRole::Master, true).await.unwrap();

        assert_eq!(
            *f.probe.commands.lock().unwrap(),
            vec![(1, "REPLICAOF NO ONE".to_string())]
        );
        assert_eq!(
            f.node.calls(),
            vec!["regenerate 1 master", "regenerate 2 master", "reload 1"]
        );
        assert_eq!(*f.store.role.lock().unwrap(), Some(NodeRole::Master));
    }

    #[tokio::test]
    async fn test_promotion_needs_virtual_ip() {
        let f = fixture(NodeRole::Minion, &[(1, works())]);
        f.vip.0.store(false, Ordering::SeqCst);

        assert!(matches!(
            f.switch.switch(NodeRole::Master, true).await,
            Err(FleetError::RoleSwitch(RoleSwitchError::VirtualIpNotHeld(_)))
        ));
        assert!(f.probe.commands.lock().unwrap().is_empty());
        assert!(f.store.role.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_role_store() {
        let dir = TempDir::new().unwrap();
        let store = FileRoleStore::new(dir.path().join("state").join("role"));

        assert_eq!(store.load().await.unwrap(), None);
        store.store(NodeRole::Minion).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(NodeRole::Minion));
    }

    #[tokio::test]
    async fn test_bind_check_rejects_garbage() {
        assert!(BindCheck.holds("127.0.0.1").await);
        assert!(!BindCheck.holds("not-an-ip").await);
    }
}

/// Applying pulled fleet commands on minion and sentinel nodes
///
/// Every command is re-checked against the local registry before it runs:
/// a command addressed to another generation of the instance (different
/// UUID) is skipped. Failures are reported per item and never stop the rest
/// of the list.
use super::{ClientRole, CommandQueueItem, CommandVerb};
use crate::core::{
    BatchAction, BatchReport, BatchRunner, InstanceControl, InstanceMeta, InstanceRegistry,
    NodeRole, SentinelControl,
};
use crate::error::{FleetError, FleetResult, SyncError};
use crate::health::StateSource;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Where authoritative instance metadata comes from
#[async_trait]
pub trait MetaSource: Send + Sync {
    async fn instance(&self, id: u32, uuid: Uuid) -> Result<InstanceMeta, SyncError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Skipped(String),
    Failed(String),
}

impl ApplyOutcome {
    fn skipped<S: Into<String>>(reason: S) -> Self {
        ApplyOutcome::Skipped(reason.into())
    }

    fn from_batch(report: BatchReport) -> Self {
        if let Some((id, error)) = report.failed.first() {
            ApplyOutcome::Failed(format!("instance {}: {}", id, error))
        } else if report.succeeded.is_empty() && !report.skipped.is_empty() {
            ApplyOutcome::skipped("already in the requested state")
        } else {
            ApplyOutcome::Applied
        }
    }
}

/// Outcome counts of one apply pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub skipped: usize,
    pub failed: Vec<String>,
}

impl ApplyReport {
    fn record(&mut self, what: &str, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied => {
                tracing::info!(command = what, "Applied");
                self.applied += 1;
            }
            ApplyOutcome::Skipped(reason) => {
                tracing::warn!(command = what, %reason, "Skipped");
                self.skipped += 1;
            }
            ApplyOutcome::Failed(error) => {
                tracing::warn!(command = what, %error, "Apply failed");
                self.failed.push(format!("{}: {}", what, error));
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.applied == 0 && self.skipped == 0 && self.failed.is_empty()
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} applied, {} skipped, {} failed",
            self.applied,
            self.skipped,
            self.failed.len()
        )
    }
}

/// Metadata equality ignoring the locally written configuration record
fn same_settings(local: &InstanceMeta, remote: &InstanceMeta) -> bool {
    local.with_applied_config(String::new(), 0) == remote.with_applied_config(String::new(), 0)
}

pub struct CommandApplier {
    role: ClientRole,
    registry: Arc<dyn InstanceRegistry>,
    control: Arc<dyn InstanceControl>,
    states: Arc<dyn StateSource>,
    sentinel: Option<Arc<dyn SentinelControl>>,
}

impl CommandApplier {
    pub fn new(
        role: ClientRole,
        registry: Arc<dyn InstanceRegistry>,
        control: Arc<dyn InstanceControl>,
        states: Arc<dyn StateSource>,
    ) -> Self {
        Self {
            role,
            registry,
            control,
            states,
            sentinel: None,
        }
    }

    pub fn with_sentinel(mut self, sentinel: Arc<dyn SentinelControl>) -> Self {
        self.sentinel = Some(sentinel);
        self
    }

    fn runner(&self) -> BatchRunner {
        BatchRunner::new(self.control.clone(), self.states.clone()).with_await_ready(false)
    }

    fn sentinel(&self) -> FleetResult<&Arc<dyn SentinelControl>> {
        self.sentinel
            .as_ref()
            .ok_or_else(|| FleetError::precondition("no sentinel configured on this node"))
    }

    /// Local metadata if it belongs to the generation the command addresses
    async fn local_generation(&self, item: &CommandQueueItem) -> FleetResult<Option<InstanceMeta>> {
        Ok(self
            .registry
            .find(item.instance_id)
            .await?
            .filter(|meta| meta.is_generation(&item.instance_uuid)))
    }

    /// Apply commands in order, continuing past failures
    pub async fn apply_all(&self, items: &[CommandQueueItem], source: &dyn MetaSource) -> ApplyReport {
        let mut report = ApplyReport::default();
        for item in items {
            let outcome = self.apply(item, source).await;
            report.record(&item.to_string(), outcome);
        }
        report
    }

    pub async fn apply(&self, item: &CommandQueueItem, source: &dyn MetaSource) -> ApplyOutcome {
        let result = match self.role {
            ClientRole::Minion => self.apply_minion(item, source).await,
            ClientRole::Sentinel => self.apply_sentinel(item, source).await,
        };
        result.unwrap_or_else(|e| ApplyOutcome::Failed(e.to_string()))
    }

    async fn apply_minion(
        &self,
        item: &CommandQueueItem,
        source: &dyn MetaSource,
    ) -> FleetResult<ApplyOutcome> {
        let id = item.instance_id;

        match item.command {
            CommandVerb::Create => {
                if let Some(local) = self.registry.find(id).await? {
                    if local.is_generation(&item.instance_uuid) {
                        return Ok(ApplyOutcome::skipped("instance already exists"));
                    }
                    self.destroy_local(id).await?;
                }
                let meta = source.instance(id, item.instance_uuid).await?;
                self.install(&meta).await?;
                Ok(ApplyOutcome::Applied)
            }
            CommandVerb::Destroy => {
                if self.local_generation(item).await?.is_none() {
                    return Ok(ApplyOutcome::skipped("no such instance generation"));
                }
                self.destroy_local(id).await?;
                Ok(ApplyOutcome::Applied)
            }
            CommandVerb::Edit => {
                if self.local_generation(item).await?.is_none() {
                    return Ok(ApplyOutcome::skipped("no such instance generation"));
                }
                let meta = source.instance(id, item.instance_uuid).await?;
                self.update(&meta).await
            }
            CommandVerb::Start | CommandVerb::Stop | CommandVerb::Restart => {
                if self.local_generation(item).await?.is_none() {
                    return Ok(ApplyOutcome::skipped("no such instance generation"));
                }
                let action = match item.command {
                    CommandVerb::Start => BatchAction::Start,
                    CommandVerb::Stop => BatchAction::Stop,
                    _ => BatchAction::Restart,
                };
                let report = self.runner().run(action, &[id], false).await?;
                Ok(ApplyOutcome::from_batch(report))
            }
            CommandVerb::StartAll | CommandVerb::StopAll | CommandVerb::RestartAll => {
                let action = match item.command {
                    CommandVerb::StartAll => BatchAction::Start,
                    CommandVerb::StopAll => BatchAction::Stop,
                    _ => BatchAction::Restart,
                };
                let ids = self.registry.list().await?;
                let report = self.runner().run(action, &ids, false).await?;
                Ok(ApplyOutcome::from_batch(report))
            }
            CommandVerb::SentinelStart | CommandVerb::SentinelStop | CommandVerb::SentinelReset => {
                Ok(ApplyOutcome::skipped("sentinel command"))
            }
        }
    }

    async fn apply_sentinel(
        &self,
        item: &CommandQueueItem,
        source: &dyn MetaSource,
    ) -> FleetResult<ApplyOutcome> {
        let id = item.instance_id;

        match item.command {
            CommandVerb::Create => {
                if let Some(local) = self.registry.find(id).await? {
                    if local.is_generation(&item.instance_uuid) {
                        return Ok(ApplyOutcome::skipped("instance already monitored"));
                    }
                    self.unmonitor(id).await?;
                }
                let meta = source.instance(id, item.instance_uuid).await?;
                self.monitor(&meta).await?;
                Ok(ApplyOutcome::Applied)
            }
            CommandVerb::Destroy => {
                if self.local_generation(item).await?.is_none() {
                    return Ok(ApplyOutcome::skipped("no such instance generation"));
                }
                self.unmonitor(id).await?;
                Ok(ApplyOutcome::Applied)
            }
            CommandVerb::Edit => {
                if self.local_generation(item).await?.is_none() {
                    return Ok(ApplyOutcome::skipped("no such instance generation"));
                }
                let meta = source.instance(id, item.instance_uuid).await?;
                self.registry.save(&meta).await?;
                self.sentinel()?.reset(id).await?;
                Ok(ApplyOutcome::Applied)
            }
            CommandVerb::SentinelStart => {
                self.sentinel()?.start().await?;
                Ok(ApplyOutcome::Applied)
            }
            CommandVerb::SentinelStop => {
                self.sentinel()?.stop().await?;
                Ok(ApplyOutcome::Applied)
            }
            CommandVerb::SentinelReset => {
                self.sentinel()?.reset(0).await?;
                Ok(ApplyOutcome::Applied)
            }
            CommandVerb::Start
            | CommandVerb::Stop
            | CommandVerb::Restart
            | CommandVerb::StartAll
            | CommandVerb::StopAll
            | CommandVerb::RestartAll => Ok(ApplyOutcome::skipped(
                "instance lifecycle is not managed on sentinel nodes",
            )),
        }
    }

    /// Bring the local registry in line with the master's instance list
    pub async fn resync(&self, remote: &[InstanceMeta]) -> ApplyReport {
        let mut report = ApplyReport::default();

        let local = match self.registry.all().await {
            Ok(local) => local,
            Err(e) => {
                report.record("resync", ApplyOutcome::Failed(e.to_string()));
                return report;
            }
        };

        for meta in remote {
            let what = format!("resync {}", meta.id);
            let outcome = match local.iter().find(|l| l.id == meta.id) {
                None => self.adopt(meta).await,
                Some(existing) if existing.uuid != meta.uuid => self.replace(meta).await,
                Some(existing) if !same_settings(existing, meta) => self.refresh(meta).await,
                Some(_) => Ok(ApplyOutcome::skipped("up to date")),
            };
            report.record(&what, outcome.unwrap_or_else(|e| ApplyOutcome::Failed(e.to_string())));
        }

        for extra in local
            .iter()
            .filter(|l| remote.iter().all(|meta| meta.id != l.id))
        {
            let what = format!("resync {}", extra.id);
            let outcome = match self.role {
                ClientRole::Minion => self.destroy_local(extra.id).await,
                ClientRole::Sentinel => self.unmonitor(extra.id).await,
            };
            report.record(
                &what,
                outcome
                    .map(|_| ApplyOutcome::Applied)
                    .unwrap_or_else(|e| ApplyOutcome::Failed(e.to_string())),
            );
        }

        tracing::info!(%report, "Resynchronized with master");
        report
    }

    async fn adopt(&self, meta: &InstanceMeta) -> FleetResult<ApplyOutcome> {
        match self.role {
            ClientRole::Minion => self.install(meta).await?,
            ClientRole::Sentinel => self.monitor(meta).await?,
        }
        Ok(ApplyOutcome::Applied)
    }

    async fn replace(&self, meta: &InstanceMeta) -> FleetResult<ApplyOutcome> {
        match self.role {
            ClientRole::Minion => self.destroy_local(meta.id).await?,
            ClientRole::Sentinel => self.unmonitor(meta.id).await?,
        }
        self.adopt(meta).await
    }

    async fn refresh(&self, meta: &InstanceMeta) -> FleetResult<ApplyOutcome> {
        match self.role {
            ClientRole::Minion => self.update(meta).await,
            ClientRole::Sentinel => {
                self.registry.save(meta).await?;
                Ok(ApplyOutcome::Applied)
            }
        }
    }

    async fn install(&self, meta: &InstanceMeta) -> FleetResult<()> {
        self.registry.save(meta).await?;
        self.control
            .regenerate_config(meta.id, NodeRole::Minion)
            .await?;
        self.control.start(meta.id, false).await?;
        Ok(())
    }

    async fn update(&self, meta: &InstanceMeta) -> FleetResult<ApplyOutcome> {
        self.registry.save(meta).await?;
        self.control
            .regenerate_config(meta.id, NodeRole::Minion)
            .await?;

        if self.states.state(meta.id).await.is_works() {
            let errors = self.control.reload_config(meta.id).await;
            if !errors.is_empty() {
                let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
                return Ok(ApplyOutcome::Failed(messages.join("; ")));
            }
        }
        Ok(ApplyOutcome::Applied)
    }

    async fn destroy_local(&self, id: u32) -> FleetResult<()> {
        if !self.states.state(id).await.is_stopped() {
            self.control.stop(id, true).await?;
        }
        self.registry.delete(id).await?;
        Ok(())
    }

    async fn monitor(&self, meta: &InstanceMeta) -> FleetResult<()> {
        self.registry.save(meta).await?;
        self.sentinel()?.monitor(meta.id).await?;
        Ok(())
    }

    async fn unmonitor(&self, id: u32) -> FleetResult<()> {
        self.sentinel()?.remove(id).await?;
        self.registry.delete(id).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::batch::tests::FakeNode;
    use crate::core::MemoryRegistry;
    use crate::error::ControlError;
    use crate::health::{Modifiers, State};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Master-side metadata served from memory
    #[derive(Default)]
    pub(crate) struct FakeMaster {
        pub metas: Mutex<HashMap<u32, InstanceMeta>>,
    }

    impl FakeMaster {
        pub fn with(metas: &[InstanceMeta]) -> Self {
            let master = Self::default();
            for meta in metas {
                master.metas.lock().unwrap().insert(meta.id, meta.clone());
            }
            master
        }
    }

    #[async_trait]
    impl MetaSource for FakeMaster {
        async fn instance(&self, id: u32, uuid: Uuid) -> Result<InstanceMeta, SyncError> {
            self.metas
                .lock()
                .unwrap()
                .get(&id)
                .filter(|meta| meta.is_generation(&uuid))
                .cloned()
                .ok_or(SyncError::Rejected {
                    code: crate::sync::StatusCode::UnknownInstance,
                    description: format!("instance {}", id),
                })
        }
    }

    #[derive(Default)]
    struct FakeSentinel {
        calls: Mutex<Vec<String>>,
    }

    impl FakeSentinel {
        fn record(&self, call: String) -> Result<(), ControlError> {
            self.calls.lock().unwrap().push(call);
            Ok(())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SentinelControl for FakeSentinel {
        async fn monitor(&self, id: u32) -> Result<(), ControlError> {
            self.record(format!("monitor {}", id))
        }
        async fn remove(&self, id: u32) -> Result<(), ControlError> {
            self.record(format!("remove {}", id))
        }
        async fn reset(&self, id: u32) -> Result<(), ControlError> {
            self.record(format!("reset {}", id))
        }
        async fn failover(&self, id: u32) -> Result<(), ControlError> {
            self.record(format!("failover {}", id))
        }
        async fn get_master_ip(&self, _id: u32) -> Result<Option<String>, ControlError> {
            Ok(None)
        }
        async fn check_quorum(&self, _id: u32) -> Result<bool, ControlError> {
            Ok(true)
        }
        async fn start(&self) -> Result<(), ControlError> {
            self.record("start".to_string())
        }
        async fn stop(&self) -> Result<(), ControlError> {
            self.record("stop".to_string())
        }
        async fn is_running(&self) -> bool {
            true
        }
    }

    fn minion(registry: &Arc<MemoryRegistry>, node: &Arc<FakeNode>) -> CommandApplier {
        CommandApplier::new(
            ClientRole::Minion,
            registry.clone(),
            node.clone(),
            node.clone(),
        )
    }

    fn item(command: CommandVerb, meta: &InstanceMeta) -> CommandQueueItem {
        CommandQueueItem::new(command, meta.id, meta.uuid, "ops")
    }

    #[tokio::test]
    async fn test_create_installs_and_starts() {
        let meta = InstanceMeta::new(7, "ops", "cache", "p");
        let registry = Arc::new(MemoryRegistry::new(16));
        let node = Arc::new(FakeNode::default());
        let master = FakeMaster::with(&[meta.clone()]);

        let outcome = minion(&registry, &node)
            .apply(&item(CommandVerb::Create, &meta), &master)
            .await;

        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(registry.get(7).await.unwrap().uuid, meta.uuid);
        assert_eq!(node.calls(), vec!["regenerate 7 minion", "start 7"]);
    }

    #[tokio::test]
    async fn test_stale_generation_is_ignored() {
        let current = InstanceMeta::new(3, "ops", "", "p");
        let registry = Arc::new(MemoryRegistry::with_instances(16, vec![current.clone()]));
        let node = Arc::new(FakeNode::with_states(&[(3, State::works(Modifiers::default()))]));

        // Addressed to an older generation of instance 3
        let stale = CommandQueueItem::new(CommandVerb::Stop, 3, Uuid::new_v4(), "ops");
        let outcome = minion(&registry, &node)
            .apply(&stale, &FakeMaster::default())
            .await;

        assert!(matches!(outcome, ApplyOutcome::Skipped(_)));
        assert!(node.calls().is_empty());
        assert!(registry.find(3).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_commands_apply_in_arrival_order() {
        let meta = InstanceMeta::new(3, "ops", "", "p");
        let registry = Arc::new(MemoryRegistry::with_instances(16, vec![meta.clone()]));
        let node = Arc::new(FakeNode::default());

        // Start then stop leaves the instance stopped
        let report = minion(&registry, &node)
            .apply_all(
                &[item(CommandVerb::Start, &meta), item(CommandVerb::Stop, &meta)],
                &FakeMaster::default(),
            )
            .await;

        assert_eq!(report.applied, 2);
        assert_eq!(node.calls(), vec!["start 3", "stop 3"]);
        assert!(node.states.lock().unwrap()[&3].is_stopped());
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_list() {
        let a = InstanceMeta::new(1, "ops", "", "p");
        let b = InstanceMeta::new(2, "ops", "", "p");
        let registry = Arc::new(MemoryRegistry::with_instances(16, vec![a.clone(), b.clone()]));
        let node = Arc::new(FakeNode::default());
        node.fail(1);

        let report = minion(&registry, &node)
            .apply_all(
                &[item(CommandVerb::Start, &a), item(CommandVerb::Start, &b)],
                &FakeMaster::default(),
            )
            .await;

        assert_eq!(report.applied, 1);
        assert_eq!(report.failed.len(), 1);
        assert!(node.states.lock().unwrap()[&2].is_works());
    }

    #[tokio::test]
    async fn test_locally_running_instance_is_not_restarted() {
        let meta = InstanceMeta::new(5, "ops", "", "p");
        let registry = Arc::new(MemoryRegistry::with_instances(16, vec![meta.clone()]));
        let node = Arc::new(FakeNode::with_states(&[(5, State::works(Modifiers::default()))]));

        let outcome = minion(&registry, &node)
            .apply(&item(CommandVerb::Start, &meta), &FakeMaster::default())
            .await;

        assert!(matches!(outcome, ApplyOutcome::Skipped(_)));
        assert!(node.calls().is_empty());
    }

    #[tokio::test]
    async fn test_resync_creates_replaces_and_destroys() {
        let kept = InstanceMeta::new(1, "ops", "", "p");
        let old = InstanceMeta::new(2, "ops", "", "p");
        let extra = InstanceMeta::new(3, "ops", "", "p");
        let registry = Arc::new(MemoryRegistry::with_instances(
            16,
            vec![kept.clone(), old, extra],
        ));
        let node = Arc::new(FakeNode::default());

        let replacement = InstanceMeta::new(2, "ops", "", "p");
        let fresh = InstanceMeta::new(4, "ops", "", "p");
        let remote = vec![kept.clone(), replacement.clone(), fresh.clone()];

        let report = minion(&registry, &node).resync(&remote).await;

        assert_eq!(report.skipped, 1);
        assert_eq!(report.applied, 3);
        assert_eq!(registry.list().await.unwrap(), vec![1, 2, 4]);
        assert_eq!(registry.get(2).await.unwrap().uuid, replacement.uuid);
    }

    #[tokio::test]
    async fn test_sentinel_maps_verbs_to_monitoring() {
        let meta = InstanceMeta::new(6, "ops", "", "p");
        let registry = Arc::new(MemoryRegistry::new(16));
        let node = Arc::new(FakeNode::default());
        let sentinel = Arc::new(FakeSentinel::default());
        let applier = CommandApplier::new(
            ClientRole::Sentinel,
            registry.clone(),
            node.clone(),
            node.clone(),
        )
        .with_sentinel(sentinel.clone());
        let master = FakeMaster::with(&[meta.clone()]);

        let report = applier
            .apply_all(
                &[
                    item(CommandVerb::Create, &meta),
                    item(CommandVerb::Start, &meta),
                    item(CommandVerb::Edit, &meta),
                    CommandQueueItem::fleet(CommandVerb::SentinelReset, "ops"),
                    item(CommandVerb::Destroy, &meta),
                ],
                &master,
            )
            .await;

        assert_eq!(report.applied, 4);
        assert_eq!(report.skipped, 1);
        assert_eq!(
            sentinel.calls(),
            vec!["monitor 6", "reset 6", "reset 0", "remove 6"]
        );
        assert!(node.calls().is_empty());
        assert!(registry.find(6).await.unwrap().is_none());
    }
}

/// Persisted fleet state snapshot used to bring instances back after a reboot
use crate::core::{BatchAction, BatchReport, BatchRunner};
use crate::error::FleetResult;
use crate::health::{PrimaryState, StateSource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Last known working/stopped status of every instance on a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Unix seconds
    pub taken_at: u64,
    pub states: BTreeMap<u32, PrimaryState>,
}

impl StateSnapshot {
    /// Record each instance as `works` or `stopped`.
    ///
    /// Dead and hung instances were meant to be running, so they are recorded
    /// as `works`.
    pub async fn capture(states: &dyn StateSource, ids: &[u32], taken_at: u64) -> Self {
        let mut recorded = BTreeMap::new();
        for &id in ids {
            let primary = if states.state(id).await.is_stopped() {
                PrimaryState::Stopped
            } else {
                PrimaryState::Works
            };
            recorded.insert(id, primary);
        }

        Self {
            taken_at,
            states: recorded,
        }
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> FleetResult<Option<Self>> {
        let content = match tokio::fs::read(path.as_ref()).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let snapshot = serde_json::from_slice(&content).map_err(|e| {
            crate::error::FleetError::internal(format!("corrupted state snapshot: {}", e))
        })?;
        Ok(Some(snapshot))
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> FleetResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_vec_pretty(self)
            .map_err(|e| crate::error::FleetError::internal(e.to_string()))?;
        let temp = path.with_extension("tmp");
        tokio::fs::write(&temp, content).await?;
        tokio::fs::rename(&temp, path).await?;
        Ok(())
    }

    /// Whether the host booted after this snapshot was taken
    pub fn reboot_since(&self, now: u64, uptime: Duration) -> bool {
        now.saturating_sub(uptime.as_secs()) > self.taken_at
    }

    /// IDs recorded as working
    pub fn working(&self) -> Vec<u32> {
        self.states
            .iter()
            .filter(|(_, state)| **state == PrimaryState::Works)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Start every instance recorded as working.
    ///
    /// Stale PID files left by the reboot classify as dead, so the batch is
    /// forced.
    pub async fn restore(&self, runner: &BatchRunner) -> FleetResult<BatchReport> {
        let ids = self.working();
        tracing::info!(count = ids.len(), "Restoring instances after reboot");
        runner.run(BatchAction::Start, &ids, true).await
    }
}

/// Client roster on the master
///
/// One entry per registered minion or sentinel. `ClientState` is never
/// stored: it is derived from the time since the client was last seen, so
/// every accessor takes an explicit `now`.
use super::queue::parse_journal;
use super::{ClientInfo, ClientRole, ClientState, CommandQueue, CommandQueueItem};
use crate::config::SyncConfig;
use crate::error::SyncError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Missed-heartbeat windows
#[derive(Debug, Clone)]
pub struct RosterSettings {
    pub possible_down: Duration,
    pub down: Duration,
    pub dead: Duration,
    /// Silence after which an entry is evicted
    pub gc: Duration,
}

impl RosterSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            possible_down: Duration::from_secs(config.possible_down_sec),
            down: Duration::from_secs(config.down_sec),
            dead: Duration::from_secs(config.dead_sec),
            gc: Duration::from_secs(config.gc_sec),
        }
    }
}

impl Default for RosterSettings {
    fn default() -> Self {
        Self::from_config(&crate::config::Config::default().sync)
    }
}

/// Derive the liveness of a client
pub fn derive_state(
    last_seen: SystemTime,
    syncing: bool,
    now: SystemTime,
    settings: &RosterSettings,
) -> ClientState {
    let Ok(silence) = now.duration_since(last_seen) else {
        return ClientState::Unknown;
    };

    if silence >= settings.dead {
        ClientState::Dead
    } else if silence >= settings.down {
        ClientState::Down
    } else if silence >= settings.possible_down {
        ClientState::PossibleDown
    } else if syncing {
        ClientState::Syncing
    } else {
        ClientState::Online
    }
}

struct ClientEntry {
    role: ClientRole,
    version: String,
    hostname: String,
    ip: String,
    connected: SystemTime,
    last_seen: SystemTime,
    syncing: bool,
    /// Commands waiting for this client's next pull
    outbox: Arc<CommandQueue>,
    /// State logged by the last reconciliation
    reported: ClientState,
}

pub struct ClientRoster {
    entries: RwLock<BTreeMap<String, ClientEntry>>,
    settings: RosterSettings,
    /// Outboxes are journaled here as `<cid>.jsonl` when set
    outbox_dir: Option<PathBuf>,
}

impl ClientRoster {
    pub fn new(settings: RosterSettings) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            settings,
            outbox_dir: None,
        }
    }

    pub fn with_outbox_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.outbox_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Collect commands left in outbox journals by a previous run.
    ///
    /// The journals are removed; items come back oldest first with
    /// duplicates (the same command sent to several clients) merged.
    pub async fn recover(&self) -> Result<Vec<CommandQueueItem>, SyncError> {
        let Some(dir) = &self.outbox_dir else {
            return Ok(Vec::new());
        };
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| SyncError::Journal(e.to_string()))?;

        let mut reader = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| SyncError::Journal(e.to_string()))?;
        let mut items: Vec<CommandQueueItem> = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| SyncError::Journal(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| SyncError::Journal(e.to_string()))?;
            for item in parse_journal(&content) {
                if !items.contains(&item) {
                    items.push(item);
                }
            }
            CommandQueue::journaled(&path).discard_journal().await;
        }

        items.sort_by_key(|item| item.timestamp);
        if !items.is_empty() {
            tracing::info!(count = items.len(), path = ?dir, "Recovered undelivered commands");
        }
        Ok(items)
    }

    fn new_outbox(&self, cid: &str) -> CommandQueue {
        match &self.outbox_dir {
            Some(dir) => CommandQueue::journaled(dir.join(format!("{}.jsonl", cid))),
            None => CommandQueue::in_memory(),
        }
    }

    pub fn settings(&self) -> &RosterSettings {
        &self.settings
    }

    /// Add a client and return its freshly issued CID
    pub async fn register(
        &self,
        role: ClientRole,
        version: &str,
        hostname: &str,
        ip: &str,
        now: SystemTime,
    ) -> String {
        let cid = crate::utils::generate_id(&role.to_string());
        let entry = ClientEntry {
            role,
            version: version.to_string(),
            hostname: hostname.to_string(),
            ip: ip.to_string(),
            connected: now,
            last_seen: now,
            syncing: false,
            outbox: Arc::new(self.new_outbox(&cid)),
            reported: ClientState::Online,
        };

        self.entries.write().await.insert(cid.clone(), entry);
        tracing::info!(%cid, %role, hostname, "Client registered");
        cid
    }

    /// Record contact from a client, false if the CID is unknown
    pub async fn touch(&self, cid: &str, now: SystemTime) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(cid) {
            Some(entry) => {
                entry.last_seen = entry.last_seen.max(now);
                true
            }
            None => false,
        }
    }

    pub async fn mark_syncing(&self, cid: &str, syncing: bool) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(cid) {
            Some(entry) => {
                entry.syncing = syncing;
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, cid: &str) -> bool {
        let removed = self.entries.write().await.remove(cid);
        match removed {
            Some(entry) => {
                entry.outbox.discard_journal().await;
                tracing::info!(%cid, "Client left");
                true
            }
            None => false,
        }
    }

    pub async fn contains(&self, cid: &str) -> bool {
        self.entries.read().await.contains_key(cid)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn outbox(&self, cid: &str) -> Option<Arc<CommandQueue>> {
        self.entries
            .read()
            .await
            .get(cid)
            .map(|entry| entry.outbox.clone())
    }

    /// Copy items into every client's outbox, returning the number of clients
    pub async fn fan_out(&self, items: &[CommandQueueItem]) -> Result<usize, SyncError> {
        if items.is_empty() {
            return Ok(0);
        }

        let outboxes: Vec<Arc<CommandQueue>> = self
            .entries
            .read()
            .await
            .values()
            .map(|entry| entry.outbox.clone())
            .collect();

        for outbox in &outboxes {
            outbox.push_all(items).await?;
        }
        Ok(outboxes.len())
    }

    pub async fn state(&self, cid: &str, now: SystemTime) -> Option<ClientState> {
        self.entries
            .read()
            .await
            .get(cid)
            .map(|entry| derive_state(entry.last_seen, entry.syncing, now, &self.settings))
    }

    /// Whether a client with `role` is currently online
    pub async fn has_online(&self, role: ClientRole, now: SystemTime) -> bool {
        self.entries.read().await.values().any(|entry| {
            entry.role == role
                && matches!(
                    derive_state(entry.last_seen, entry.syncing, now, &self.settings),
                    ClientState::Online | ClientState::Syncing
                )
        })
    }

    /// Roster entries as of `now`, in CID order
    pub async fn snapshot(&self, now: SystemTime) -> Vec<ClientInfo> {
        let now_ms = unix_ms(now);
        let entries = self.entries.read().await;
        let mut clients = Vec::with_capacity(entries.len());

        for (cid, entry) in entries.iter() {
            let last_sync_lag_ms = entry
                .outbox
                .oldest()
                .await
                .map(|oldest| now_ms.saturating_sub(oldest))
                .unwrap_or(0);

            clients.push(ClientInfo {
                cid: cid.clone(),
                role: entry.role,
                version: entry.version.clone(),
                hostname: entry.hostname.clone(),
                ip: entry.ip.clone(),
                connected: unix_ms(entry.connected),
                last_seen_lag_ms: now
                    .duration_since(entry.last_seen)
                    .map(|lag| lag.as_millis() as u64)
                    .unwrap_or(0),
                last_sync_lag_ms,
                state: derive_state(entry.last_seen, entry.syncing, now, &self.settings),
            });
        }
        clients
    }

    /// Log state transitions and evict clients silent beyond the gc window.
    ///
    /// Returns the evicted CIDs.
    pub async fn reconcile(&self, now: SystemTime) -> Vec<String> {
        let mut entries = self.entries.write().await;
        let mut evicted = Vec::new();

        for (cid, entry) in entries.iter_mut() {
            let silence = now.duration_since(entry.last_seen).unwrap_or_default();
            if silence >= self.settings.gc {
                evicted.push(cid.clone());
                continue;
            }

            let state = derive_state(entry.last_seen, entry.syncing, now, &self.settings);
            if state != entry.reported {
                tracing::warn!(
                    %cid,
                    hostname = %entry.hostname,
                    from = %entry.reported,
                    to = %state,
                    "Client state changed"
                );
                entry.reported = state;
            }
        }

        for cid in &evicted {
            if let Some(entry) = entries.remove(cid) {
                entry.outbox.discard_journal().await;
            }
            tracing::warn!(%cid, "Evicted silent client");
        }
        evicted
    }
}

fn unix_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::CommandVerb;
    use uuid::Uuid;

    fn settings() -> RosterSettings {
        RosterSettings {
            possible_down: Duration::from_secs(15),
            down: Duration::from_secs(60),
            dead: Duration::from_secs(300),
            gc: Duration::from_secs(3600),
        }
    }

    #[test]
    fn test_derive_state_windows() {
        let seen = UNIX_EPOCH + Duration::from_secs(1_000_000);
        let s = settings();
        let at = |secs| seen + Duration::from_secs(secs);

        assert_eq!(derive_state(seen, false, at(0), &s), ClientState::Online);
        assert_eq!(derive_state(seen, true, at(5), &s), ClientState::Syncing);
        assert_eq!(derive_state(seen, true, at(15), &s), ClientState::PossibleDown);
        assert_eq!(derive_state(seen, false, at(60), &s), ClientState::Down);
        assert_eq!(derive_state(seen, false, at(300), &s), ClientState::Dead);
        assert_eq!(
            derive_state(seen, false, seen - Duration::from_secs(1), &s),
            ClientState::Unknown
        );
    }

    #[tokio::test]
    async fn test_register_touch_and_remove() {
        let roster = ClientRoster::new(settings());
        let t0 = SystemTime::now();
        let cid = roster
            .register(ClientRole::Minion, "0.1.0", "node-2", "10.0.0.2", t0)
            .await;

        assert!(cid.starts_with("minion-"));
        assert_eq!(roster.state(&cid, t0 + Duration::from_secs(20)).await, Some(ClientState::PossibleDown));

        assert!(roster.touch(&cid, t0 + Duration::from_secs(20)).await);
        assert_eq!(roster.state(&cid, t0 + Duration::from_secs(21)).await, Some(ClientState::Online));

        assert!(!roster.touch("nobody", t0).await);
        assert!(roster.remove(&cid).await);
        assert!(!roster.remove(&cid).await);
        assert!(roster.is_empty().await);
    }

    #[tokio::test]
    async fn test_fan_out_and_sync_lag() {
        let roster = ClientRoster::new(settings());
        let now = SystemTime::now();
        let a = roster.register(ClientRole::Minion, "0.1.0", "a", "10.0.0.2", now).await;
        let b = roster.register(ClientRole::Sentinel, "0.1.0", "b", "10.0.0.3", now).await;

        let mut item = CommandQueueItem::new(CommandVerb::Stop, 3, Uuid::new_v4(), "ops");
        item.timestamp = unix_ms(now) - 2_000;
        assert_eq!(roster.fan_out(&[item]).await.unwrap(), 2);

        let snapshot = roster.snapshot(now).await;
        assert!(snapshot.iter().all(|c| c.last_sync_lag_ms >= 2_000));

        assert_eq!(roster.outbox(&a).await.unwrap().drain().await.unwrap().len(), 1);
        assert_eq!(roster.outbox(&b).await.unwrap().len().await, 1);

        let snapshot = roster.snapshot(now).await;
        let lag_of = |cid: &str| {
            snapshot
                .iter()
                .find(|c| c.cid == cid)
                .map(|c| c.last_sync_lag_ms)
        };
        assert_eq!(lag_of(a.as_str()), Some(0));
        assert!(lag_of(b.as_str()).unwrap() >= 2_000);
    }

    #[tokio::test]
    async fn test_reconcile_evicts_after_gc() {
        let roster = ClientRoster::new(settings());
        let t0 = SystemTime::now();
        let stale = roster.register(ClientRole::Minion, "0.1.0", "a", "", t0).await;
        let fresh = roster.register(ClientRole::Minion, "0.1.0", "b", "", t0).await;

        let later = t0 + Duration::from_secs(3600);
        roster.touch(&fresh, later).await;

        assert_eq!(roster.reconcile(later).await, vec![stale.clone()]);
        assert!(!roster.contains(&stale).await);
        assert!(roster.contains(&fresh).await);
    }

    #[tokio::test]
    async fn test_outbox_journals_survive_and_are_recovered_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let now = SystemTime::now();
        let roster = ClientRoster::new(settings()).with_outbox_dir(dir.path());
        roster.register(ClientRole::Minion, "0.1.0", "a", "", now).await;
        roster.register(ClientRole::Sentinel, "0.1.0", "b", "", now).await;

        let mut first = CommandQueueItem::new(CommandVerb::Stop, 3, Uuid::new_v4(), "ops");
        first.timestamp = 1_000;
        let mut second = CommandQueueItem::new(CommandVerb::Start, 3, first.instance_uuid, "ops");
        second.timestamp = 2_000;
        roster.fan_out(&[first.clone(), second.clone()]).await.unwrap();
        drop(roster);

        let restarted = ClientRoster::new(settings()).with_outbox_dir(dir.path());
        assert_eq!(restarted.recover().await.unwrap(), vec![first, second]);
        assert!(restarted.recover().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_leaving_client_drops_its_outbox_journal() {
        let dir = tempfile::TempDir::new().unwrap();
        let roster = ClientRoster::new(settings()).with_outbox_dir(dir.path());
        let cid = roster
            .register(ClientRole::Minion, "0.1.0", "a", "", SystemTime::now())
            .await;
        let item = CommandQueueItem::new(CommandVerb::Stop, 3, Uuid::new_v4(), "ops");
        roster.fan_out(&[item]).await.unwrap();
        assert!(dir.path().join(format!("{}.jsonl", cid)).exists());

        assert!(roster.remove(&cid).await);
        assert!(!dir.path().join(format!("{}.jsonl", cid)).exists());
        assert!(roster.recover().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_has_online_sentinel() {
        let roster = ClientRoster::new(settings());
        let t0 = SystemTime::now();
        assert!(!roster.has_online(ClientRole::Sentinel, t0).await);

        roster.register(ClientRole::Sentinel, "0.1.0", "s", "", t0).await;
        assert!(roster.has_online(ClientRole::Sentinel, t0).await);
        assert!(!roster.has_online(ClientRole::Sentinel, t0 + Duration::from_secs(61)).await);
    }
}

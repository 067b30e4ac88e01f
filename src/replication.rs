/// Replication info aggregation
///
/// Read-only composition of the master's self description and the client
/// roster. Recomputed per request and never stored.
use crate::sync::{ClientInfo, ClientRole, ClientState, MasterInfo, ReplicationInfo};

/// Order clients (minions first, then by connection time and CID) and mark
/// the suppliant when it is part of the roster
pub fn aggregate(
    master: MasterInfo,
    mut clients: Vec<ClientInfo>,
    suppliant: Option<&str>,
) -> ReplicationInfo {
    clients.sort_by(|a, b| {
        a.role
            .rank()
            .cmp(&b.role.rank())
            .then(a.connected.cmp(&b.connected))
            .then_with(|| a.cid.cmp(&b.cid))
    });

    let suppliant = suppliant
        .filter(|cid| clients.iter().any(|client| client.cid == *cid))
        .map(str::to_string);

    ReplicationInfo {
        master,
        clients,
        suppliant,
    }
}

impl ReplicationInfo {
    pub fn minions(&self) -> impl Iterator<Item = &ClientInfo> {
        self.clients
            .iter()
            .filter(|client| client.role == ClientRole::Minion)
    }

    pub fn sentinels(&self) -> impl Iterator<Item = &ClientInfo> {
        self.clients
            .iter()
            .filter(|client| client.role == ClientRole::Sentinel)
    }

    pub fn is_suppliant(&self, cid: &str) -> bool {
        self.suppliant.as_deref() == Some(cid)
    }

    /// Bulk restarts should wait while any minion is still catching up
    pub fn has_syncing_clients(&self) -> bool {
        self.minions()
            .any(|client| client.state == ClientState::Syncing || client.last_sync_lag_ms > 0)
    }

    /// Largest sync lag among minions
    pub fn max_sync_lag_ms(&self) -> u64 {
        self.minions()
            .map(|client| client.last_sync_lag_ms)
            .max()
            .unwrap_or(0)
    }
}

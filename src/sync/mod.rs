/// Master ↔ minion/sentinel synchronization protocol
///
/// JSON over HTTP, one POST path per method. Every response is a `Reply`
/// carrying a `{code, description}` status, so a client can always tell a
/// rejection apart from an unreachable master.
pub mod apply;
pub mod auth;
pub mod client;
pub mod queue;
pub mod roster;
pub mod server;

pub use apply::{ApplyOutcome, ApplyReport, CommandApplier, MetaSource};
pub use auth::{AuthDecision, AuthReason};
pub use client::{SyncAgent, SyncClient};
pub use queue::CommandQueue;
pub use roster::{ClientRoster, RosterSettings};
pub use server::{ServerState, SyncServer};

use crate::core::{Credential, InstanceMeta, NodeRole};
use crate::error::SyncError;
use crate::health::PrimaryState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Version spoken by this build, compared by major number at hello
pub const CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Closed set of response status codes, serialized as integers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum StatusCode {
    Ok,
    WrongRequest,
    WrongAuthToken,
    UnknownClient,
    WrongMethod,
    WrongArgs,
    IncorrectRequest,
    UnknownInstance,
    IncompatibleCoreVersion,
    UnknownError,
}

impl StatusCode {
    pub fn description(&self) -> &'static str {
        match self {
            StatusCode::Ok => "ok",
            StatusCode::WrongRequest => "wrong request",
            StatusCode::WrongAuthToken => "wrong auth token",
            StatusCode::UnknownClient => "unknown client",
            StatusCode::WrongMethod => "wrong method",
            StatusCode::WrongArgs => "wrong arguments",
            StatusCode::IncorrectRequest => "incorrect request",
            StatusCode::UnknownInstance => "unknown instance",
            StatusCode::IncompatibleCoreVersion => "incompatible core version",
            StatusCode::UnknownError => "unknown error",
        }
    }
}

impl From<StatusCode> for u8 {
    fn from(code: StatusCode) -> Self {
        match code {
            StatusCode::Ok => 0,
            StatusCode::WrongRequest => 1,
            StatusCode::WrongAuthToken => 2,
            StatusCode::UnknownClient => 3,
            StatusCode::WrongMethod => 4,
            StatusCode::WrongArgs => 5,
            StatusCode::IncorrectRequest => 6,
            StatusCode::UnknownInstance => 7,
            StatusCode::IncompatibleCoreVersion => 8,
            StatusCode::UnknownError => 9,
        }
    }
}

impl TryFrom<u8> for StatusCode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => StatusCode::Ok,
            1 => StatusCode::WrongRequest,
            2 => StatusCode::WrongAuthToken,
            3 => StatusCode::UnknownClient,
            4 => StatusCode::WrongMethod,
            5 => StatusCode::WrongArgs,
            6 => StatusCode::IncorrectRequest,
            7 => StatusCode::UnknownInstance,
            8 => StatusCode::IncompatibleCoreVersion,
            9 => StatusCode::UnknownError,
            other => return Err(format!("unknown status code {}", other)),
        })
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Status envelope of every response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseStatus {
    pub code: StatusCode,
    pub description: String,
}

/// Response body: status plus payload on success
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct Reply<T> {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Reply<T> {
    pub fn ok(data: T) -> Self {
        Self {
            status: ResponseStatus {
                code: StatusCode::Ok,
                description: StatusCode::Ok.description().to_string(),
            },
            data: Some(data),
        }
    }

    pub fn error<S: Into<String>>(code: StatusCode, description: S) -> Self {
        Self {
            status: ResponseStatus {
                code,
                description: description.into(),
            },
            data: None,
        }
    }

    pub fn into_result(self) -> Result<T, SyncError> {
        match (self.status.code, self.data) {
            (StatusCode::Ok, Some(data)) => Ok(data),
            (StatusCode::Ok, None) => Err(SyncError::Transport(
                "ok reply without payload".to_string(),
            )),
            (code, _) => Err(SyncError::Rejected {
                code,
                description: self.status.description,
            }),
        }
    }
}

/// Payload of replies that carry nothing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

/// Protocol methods, one endpoint path each
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Hello,
    Push,
    Pull,
    Fetch,
    Info,
    Replication,
    Stats,
    Bye,
}

impl Method {
    pub fn path(&self) -> &'static str {
        match self {
            Method::Hello => "/hello",
            Method::Push => "/push",
            Method::Pull => "/pull",
            Method::Fetch => "/fetch",
            Method::Info => "/info",
            Method::Replication => "/replication",
            Method::Stats => "/stats",
            Method::Bye => "/bye",
        }
    }
}

/// Role of a connected client as seen by the master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    Minion,
    Sentinel,
}

impl ClientRole {
    /// Minions are listed before sentinels
    pub fn rank(&self) -> u8 {
        match self {
            ClientRole::Minion => 0,
            ClientRole::Sentinel => 1,
        }
    }
}

impl TryFrom<NodeRole> for ClientRole {
    type Error = SyncError;

    fn try_from(role: NodeRole) -> Result<Self, Self::Error> {
        match role {
            NodeRole::Minion => Ok(ClientRole::Minion),
            NodeRole::Sentinel => Ok(ClientRole::Sentinel),
            NodeRole::Master => Err(SyncError::Transport(
                "a master node cannot register as a client".to_string(),
            )),
        }
    }
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientRole::Minion => write!(f, "minion"),
            ClientRole::Sentinel => write!(f, "sentinel"),
        }
    }
}

/// Liveness of a client, derived from the time since it was last seen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientState {
    Unknown,
    Online,
    PossibleDown,
    Down,
    Syncing,
    Dead,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Unknown => "unknown",
            ClientState::Online => "online",
            ClientState::PossibleDown => "possible-down",
            ClientState::Down => "down",
            ClientState::Syncing => "syncing",
            ClientState::Dead => "dead",
        };
        write!(f, "{}", name)
    }
}

/// Fleet command verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandVerb {
    Create,
    Destroy,
    Edit,
    Start,
    Stop,
    Restart,
    StartAll,
    StopAll,
    RestartAll,
    SentinelStart,
    SentinelStop,
    SentinelReset,
}

impl CommandVerb {
    /// Verbs that address the whole node rather than one instance
    pub fn is_fleet_wide(&self) -> bool {
        matches!(
            self,
            CommandVerb::StartAll
                | CommandVerb::StopAll
                | CommandVerb::RestartAll
                | CommandVerb::SentinelStart
                | CommandVerb::SentinelStop
                | CommandVerb::SentinelReset
        )
    }
}

impl fmt::Display for CommandVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandVerb::Create => "create",
            CommandVerb::Destroy => "destroy",
            CommandVerb::Edit => "edit",
            CommandVerb::Start => "start",
            CommandVerb::Stop => "stop",
            CommandVerb::Restart => "restart",
            CommandVerb::StartAll => "start-all",
            CommandVerb::StopAll => "stop-all",
            CommandVerb::RestartAll => "restart-all",
            CommandVerb::SentinelStart => "sentinel-start",
            CommandVerb::SentinelStop => "sentinel-stop",
            CommandVerb::SentinelReset => "sentinel-reset",
        };
        write!(f, "{}", name)
    }
}

/// One pending fleet command.
///
/// The UUID travels with the ID so a node holding a different generation of
/// the instance can recognise the command as stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandQueueItem {
    pub command: CommandVerb,
    pub instance_id: u32,
    pub instance_uuid: Uuid,
    pub initiator: String,
    /// Unix milliseconds
    pub timestamp: u64,
}

impl CommandQueueItem {
    pub fn new(command: CommandVerb, instance_id: u32, instance_uuid: Uuid, initiator: &str) -> Self {
        Self {
            command,
            instance_id,
            instance_uuid,
            initiator: initiator.to_string(),
            timestamp: crate::utils::unix_now_ms(),
        }
    }

    /// Command addressed to the whole node
    pub fn fleet(command: CommandVerb, initiator: &str) -> Self {
        Self::new(command, 0, Uuid::nil(), initiator)
    }
}

impl fmt::Display for CommandQueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.command.is_fleet_wide() {
            write!(f, "{} by {}", self.command, self.initiator)
        } else {
            write!(
                f,
                "{} {} ({}) by {}",
                self.command, self.instance_id, self.instance_uuid, self.initiator
            )
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloRequest {
    pub version: String,
    pub hostname: String,
    pub role: ClientRole,
    /// Shared secret, carried in the body because hello has no bearer header
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResponse {
    pub cid: String,
    pub superuser: Option<Credential>,
    /// Whether a sentinel node is currently online
    pub sentinel_works: bool,
    pub master: MasterInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    /// Absent when the master itself enqueues
    #[serde(default)]
    pub cid: Option<String>,
    pub command: CommandVerb,
    pub instance_id: u32,
    pub instance_uuid: Uuid,
    pub initiator: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub mod_time: u64,
}

/// Request of methods that only identify the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
    pub cid: String,
}

/// Request of read-only methods also used by tooling on the master
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub cid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub mod_time: u64,
    pub items: Vec<CommandQueueItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub instances: Vec<InstanceMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoRequest {
    pub cid: String,
    pub instance_id: u32,
    pub instance_uuid: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub meta: InstanceMeta,
    pub state: PrimaryState,
    /// Full state rendering, e.g. "works (idle, has-replica)"
    pub details: String,
}

/// Roster entry as reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub cid: String,
    pub role: ClientRole,
    pub version: String,
    pub hostname: String,
    pub ip: String,
    /// Unix milliseconds
    pub connected: u64,
    pub last_seen_lag_ms: u64,
    /// Age of the oldest command not yet pulled by this client
    pub last_sync_lag_ms: u64,
    pub state: ClientState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterInfo {
    pub version: String,
    pub hostname: String,
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationInfo {
    pub master: MasterInfo,
    pub clients: Vec<ClientInfo>,
    /// CID of the node the snapshot was computed for
    pub suppliant: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsInfo {
    pub instances: usize,
    /// Instance count per primary state
    pub states: BTreeMap<String, usize>,
    pub queue_len: usize,
    pub clients: usize,
    pub clients_by_state: BTreeMap<String, usize>,
    pub uptime_sec: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_serializes_as_integer() {
        let reply: Reply<Empty> = Reply::error(StatusCode::UnknownClient, "who are you");
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["status"]["code"], 3);
        assert!(json.get("data").is_none());

        let parsed: Reply<Empty> = serde_json::from_value(json).unwrap();
        assert!(matches!(
            parsed.into_result(),
            Err(SyncError::Rejected {
                code: StatusCode::UnknownClient,
                ..
            })
        ));
    }

    #[test]
    fn test_unknown_status_code_is_rejected() {
        let result: Result<ResponseStatus, _> =
            serde_json::from_str(r#"{"code": 42, "description": "?"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_ok_reply_with_empty_payload() {
        let json = serde_json::to_string(&Reply::ok(Empty {})).unwrap();
        let parsed: Reply<Empty> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.into_result().unwrap(), Empty {});
    }

    #[test]
    fn test_verb_names() {
        assert_eq!(
            serde_json::to_string(&CommandVerb::RestartAll).unwrap(),
            "\"restart-all\""
        );
        assert!(CommandVerb::SentinelReset.is_fleet_wide());
        assert!(!CommandVerb::Destroy.is_fleet_wide());

        let item = CommandQueueItem::fleet(CommandVerb::StopAll, "ops");
        assert_eq!(item.instance_id, 0);
        assert!(item.instance_uuid.is_nil());
    }

    #[test]
    fn test_client_state_names() {
        assert_eq!(
            serde_json::to_string(&ClientState::PossibleDown).unwrap(),
            "\"possible-down\""
        );
        assert_eq!(ClientState::PossibleDown.to_string(), "possible-down");
    }
}

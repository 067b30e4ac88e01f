/// Sync server on the master node
///
/// Handlers share one `ServerState` holding the registry, the journaled
/// command queue and the client roster. Commands are journaled on push and
/// copied into per-client outboxes as soon as at least one client is
/// registered; `/pull` drains only the caller's outbox.
use super::auth;
use super::{
    ClientRequest, ClientRole, ClientRoster, CommandQueue, CommandQueueItem, Empty,
    FetchResponse, HelloRequest, HelloResponse, InfoRequest, InstanceInfo, MasterInfo, Method,
    PullResponse, PushRequest, PushResponse, QueryRequest, Reply, ReplicationInfo, StatsInfo,
    StatusCode, CORE_VERSION,
};
use crate::core::{Credential, InstanceRegistry};
use crate::error::{FleetError, SyncError};
use crate::health::StateSource;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::error::Category;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

/// Refused request: status code plus description
#[derive(Debug)]
struct Refusal {
    code: StatusCode,
    description: String,
}

impl Refusal {
    fn new<S: Into<String>>(code: StatusCode, description: S) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    fn internal<E: std::fmt::Display>(error: E) -> Self {
        Self::new(StatusCode::UnknownError, error.to_string())
    }
}

type Handled<T> = Result<T, Refusal>;

fn respond<T: Serialize>(method: Method, result: Handled<T>) -> Json<Reply<T>> {
    match result {
        Ok(data) => Json(Reply::ok(data)),
        Err(refusal) => {
            tracing::warn!(
                path = method.path(),
                code = %refusal.code,
                description = %refusal.description,
                "Request refused"
            );
            Json(Reply::error(refusal.code, refusal.description))
        }
    }
}

fn parse<T: DeserializeOwned>(body: &Bytes) -> Handled<T> {
    serde_json::from_slice(body).map_err(|e| match e.classify() {
        Category::Data => Refusal::new(StatusCode::WrongArgs, e.to_string()),
        _ => Refusal::new(StatusCode::IncorrectRequest, e.to_string()),
    })
}

/// Query bodies may be empty
fn parse_query(body: &Bytes) -> Handled<QueryRequest> {
    if body.iter().all(u8::is_ascii_whitespace) {
        Ok(QueryRequest::default())
    } else {
        parse(body)
    }
}

/// Shared state of the sync server
pub struct ServerState {
    registry: Arc<dyn InstanceRegistry>,
    states: Arc<dyn StateSource>,
    queue: Arc<CommandQueue>,
    roster: Arc<ClientRoster>,
    token: String,
    master: MasterInfo,
    superuser: Option<Credential>,
    version: semver::Version,
    started: Instant,
    /// Keeps outboxes in arrival order when dispatches overlap
    dispatch_lock: Mutex<()>,
}

impl ServerState {
    pub fn new(
        registry: Arc<dyn InstanceRegistry>,
        states: Arc<dyn StateSource>,
        queue: Arc<CommandQueue>,
        roster: Arc<ClientRoster>,
        token: &str,
        master: MasterInfo,
    ) -> Self {
        Self {
            registry,
            states,
            queue,
            roster,
            token: token.to_string(),
            master,
            superuser: None,
            version: semver::Version::parse(CORE_VERSION)
                .unwrap_or_else(|_| semver::Version::new(0, 0, 0)),
            started: Instant::now(),
            dispatch_lock: Mutex::new(()),
        }
    }

    pub fn with_superuser(mut self, superuser: Option<Credential>) -> Self {
        self.superuser = superuser;
        self
    }

    pub fn with_version(mut self, version: semver::Version) -> Self {
        self.version = version;
        self
    }

    pub fn roster(&self) -> &Arc<ClientRoster> {
        &self.roster
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    fn authorize(&self, headers: &HeaderMap) -> Handled<()> {
        let decision = auth::authorize(headers, &self.token);
        if decision.authorized {
            Ok(())
        } else {
            Err(Refusal::new(
                StatusCode::WrongAuthToken,
                decision.reason.to_string(),
            ))
        }
    }

    async fn known(&self, cid: &str) -> Handled<()> {
        if self.roster.touch(cid, SystemTime::now()).await {
            Ok(())
        } else {
            Err(Refusal::new(
                StatusCode::UnknownClient,
                format!("unknown client {}", cid),
            ))
        }
    }

    /// Move journaled commands into client outboxes.
    ///
    /// Without registered clients the commands stay in the journal. Items
    /// leave the journal only after every outbox holds them.
    async fn dispatch(&self) -> Handled<()> {
        let _guard = self.dispatch_lock.lock().await;
        if self.roster.is_empty().await {
            return Ok(());
        }

        let items = self.queue.peek().await;
        if items.is_empty() {
            return Ok(());
        }

        let clients = self
            .roster
            .fan_out(&items)
            .await
            .map_err(Refusal::internal)?;
        self.queue
            .remove_front(items.len())
            .await
            .map_err(Refusal::internal)?;
        tracing::debug!(items = items.len(), clients, "Dispatched commands");
        Ok(())
    }

    /// Requeue commands a previous run handed to clients that never pulled
    /// them. Call once before serving.
    pub async fn recover(&self) -> Result<usize, SyncError> {
        let _guard = self.dispatch_lock.lock().await;
        let pending = self.queue.peek().await;
        let leftover: Vec<CommandQueueItem> = self
            .roster
            .recover()
            .await?
            .into_iter()
            .filter(|item| !pending.contains(item))
            .collect();

        if !leftover.is_empty() {
            self.queue.prepend(&leftover).await?;
        }
        Ok(leftover.len())
    }

    async fn hello(&self, ip: &str, body: &Bytes) -> Handled<HelloResponse> {
        let request: HelloRequest = parse(body)?;

        let decision = auth::check_token(&request.token, &self.token);
        if !decision.authorized {
            return Err(Refusal::new(
                StatusCode::WrongAuthToken,
                decision.reason.to_string(),
            ));
        }

        let version = semver::Version::parse(&request.version).map_err(|e| {
            Refusal::new(
                StatusCode::WrongArgs,
                format!("bad version '{}': {}", request.version, e),
            )
        })?;
        if version.major != self.version.major {
            return Err(Refusal::new(
                StatusCode::IncompatibleCoreVersion,
                format!("client {} is incompatible with master {}", version, self.version),
            ));
        }

        let now = SystemTime::now();
        let cid = self
            .roster
            .register(request.role, &request.version, &request.hostname, ip, now)
            .await;

        Ok(HelloResponse {
            cid,
            superuser: self.superuser.clone(),
            sentinel_works: self.roster.has_online(ClientRole::Sentinel, now).await,
            master: self.master.clone(),
        })
    }

    async fn push(&self, headers: &HeaderMap, body: &Bytes) -> Handled<PushResponse> {
        self.authorize(headers)?;
        let request: PushRequest = parse(body)?;
        if let Some(cid) = &request.cid {
            self.known(cid).await?;
        }

        if !request.command.is_fleet_wide() && request.instance_id == 0 {
            return Err(Refusal::new(
                StatusCode::WrongArgs,
                format!("{} needs an instance id", request.command),
            ));
        }

        let item = CommandQueueItem {
            command: request.command,
            instance_id: request.instance_id,
            instance_uuid: request.instance_uuid,
            initiator: request.initiator,
            timestamp: crate::utils::unix_now_ms(),
        };
        tracing::info!(%item, "Command queued");

        let mod_time = self.queue.push(item).await.map_err(Refusal::internal)?;
        self.dispatch().await?;
        Ok(PushResponse { mod_time })
    }

    async fn pull(&self, headers: &HeaderMap, body: &Bytes) -> Handled<PullResponse> {
        self.authorize(headers)?;
        let request: ClientRequest = parse(body)?;
        self.known(&request.cid).await?;
        self.dispatch().await?;

        let outbox = self.roster.outbox(&request.cid).await.ok_or_else(|| {
            Refusal::new(StatusCode::UnknownClient, "client evicted during pull")
        })?;
        let items = outbox.drain().await.map_err(Refusal::internal)?;
        self.roster.mark_syncing(&request.cid, false).await;

        Ok(PullResponse {
            mod_time: outbox.mod_time().await,
            items,
        })
    }

    async fn fetch(&self, headers: &HeaderMap, body: &Bytes) -> Handled<FetchResponse> {
        self.authorize(headers)?;
        let request: ClientRequest = parse(body)?;
        self.known(&request.cid).await?;
        self.roster.mark_syncing(&request.cid, true).await;

        let instances = self.registry.all().await.map_err(Refusal::internal)?;
        Ok(FetchResponse { instances })
    }

    async fn info(&self, headers: &HeaderMap, body: &Bytes) -> Handled<InstanceInfo> {
        self.authorize(headers)?;
        let request: InfoRequest = parse(body)?;
        self.known(&request.cid).await?;

        let meta = self
            .registry
            .find(request.instance_id)
            .await
            .map_err(Refusal::internal)?
            .ok_or_else(|| {
                Refusal::new(
                    StatusCode::UnknownInstance,
                    format!("instance {} does not exist", request.instance_id),
                )
            })?;

        if !meta.is_generation(&request.instance_uuid) {
            return Err(Refusal::new(
                StatusCode::UnknownInstance,
                format!(
                    "instance {} is now {}, not {}",
                    meta.id, meta.uuid, request.instance_uuid
                ),
            ));
        }

        let state = self.states.state(meta.id).await;
        Ok(InstanceInfo {
            meta,
            state: state.primary(),
            details: state.to_string(),
        })
    }

    async fn replication(&self, headers: &HeaderMap, body: &Bytes) -> Handled<ReplicationInfo> {
        self.authorize(headers)?;
        let request = parse_query(body)?;
        if let Some(cid) = &request.cid {
            self.known(cid).await?;
        }

        let clients = self.roster.snapshot(SystemTime::now()).await;
        Ok(crate::replication::aggregate(
            self.master.clone(),
            clients,
            request.cid.as_deref(),
        ))
    }

    async fn stats(&self, headers: &HeaderMap, body: &Bytes) -> Handled<StatsInfo> {
        self.authorize(headers)?;
        let request = parse_query(body)?;
        if let Some(cid) = &request.cid {
            self.known(cid).await?;
        }

        let ids = self.registry.list().await.map_err(Refusal::internal)?;
        let observed =
            futures::future::join_all(ids.iter().map(|id| self.states.state(*id))).await;

        let mut states = BTreeMap::new();
        for state in &observed {
            *states.entry(state.primary().to_string()).or_insert(0) += 1;
        }

        let clients = self.roster.snapshot(SystemTime::now()).await;
        let mut clients_by_state = BTreeMap::new();
        for client in &clients {
            *clients_by_state.entry(client.state.to_string()).or_insert(0) += 1;
        }

        Ok(StatsInfo {
            instances: ids.len(),
            states,
            queue_len: self.queue.len().await,
            clients: clients.len(),
            clients_by_state,
            uptime_sec: self.started.elapsed().as_secs(),
        })
    }

    async fn bye(&self, headers: &HeaderMap, body: &Bytes) -> Handled<Empty> {
        self.authorize(headers)?;
        let request: ClientRequest = parse(body)?;
        if self.roster.remove(&request.cid).await {
            Ok(Empty {})
        } else {
            Err(Refusal::new(
                StatusCode::UnknownClient,
                format!("unknown client {}", request.cid),
            ))
        }
    }
}

type Shared = State<Arc<ServerState>>;

async fn hello(
    State(state): Shared,
    connect: Option<ConnectInfo<SocketAddr>>,
    body: Bytes,
) -> Json<Reply<HelloResponse>> {
    let ip = connect
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default();
    respond(Method::Hello, state.hello(&ip, &body).await)
}

async fn push(State(state): Shared, headers: HeaderMap, body: Bytes) -> Json<Reply<PushResponse>> {
    respond(Method::Push, state.push(&headers, &body).await)
}

async fn pull(State(state): Shared, headers: HeaderMap, body: Bytes) -> Json<Reply<PullResponse>> {
    respond(Method::Pull, state.pull(&headers, &body).await)
}

async fn fetch(
    State(state): Shared,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Reply<FetchResponse>> {
    respond(Method::Fetch, state.fetch(&headers, &body).await)
}

async fn info(State(state): Shared, headers: HeaderMap, body: Bytes) -> Json<Reply<InstanceInfo>> {
    respond(Method::Info, state.info(&headers, &body).await)
}

async fn replication(
    State(state): Shared,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Reply<ReplicationInfo>> {
    respond(Method::Replication, state.replication(&headers, &body).await)
}

async fn stats(State(state): Shared, headers: HeaderMap, body: Bytes) -> Json<Reply<StatsInfo>> {
    respond(Method::Stats, state.stats(&headers, &body).await)
}

async fn bye(State(state): Shared, headers: HeaderMap, body: Bytes) -> Json<Reply<Empty>> {
    respond(Method::Bye, state.bye(&headers, &body).await)
}

async fn wrong_method() -> Json<Reply<Empty>> {
    Json(Reply::error(
        StatusCode::WrongMethod,
        "sync methods only accept POST",
    ))
}

async fn wrong_request() -> Json<Reply<Empty>> {
    Json(Reply::error(StatusCode::WrongRequest, "unknown method path"))
}

/// HTTP front of the sync protocol
pub struct SyncServer {
    state: Arc<ServerState>,
    reconcile_interval: Duration,
}

impl SyncServer {
    pub fn new(state: ServerState) -> Self {
        Self {
            state: Arc::new(state),
            reconcile_interval: Duration::from_secs(1),
        }
    }

    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(Method::Hello.path(), post(hello).fallback(wrong_method))
            .route(Method::Push.path(), post(push).fallback(wrong_method))
            .route(Method::Pull.path(), post(pull).fallback(wrong_method))
            .route(Method::Fetch.path(), post(fetch).fallback(wrong_method))
            .route(Method::Info.path(), post(info).fallback(wrong_method))
            .route(
                Method::Replication.path(),
                post(replication).fallback(wrong_method),
            )
            .route(Method::Stats.path(), post(stats).fallback(wrong_method))
            .route(Method::Bye.path(), post(bye).fallback(wrong_method))
            .fallback(wrong_request)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Periodically log roster transitions and evict silent clients
    pub fn spawn_reconciler(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let roster = self.state.roster.clone();
        let mut ticker = tokio::time::interval(self.reconcile_interval);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        roster.reconcile(SystemTime::now()).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Serve until `shutdown` turns true
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), FleetError> {
        let addr = listener.local_addr()?;
        tracing::info!(%addr, "Sync server listening");

        let reconciler = self.spawn_reconciler(shutdown.clone());
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await?;

        reconciler.abort();
        tracing::info!("Sync server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::batch::tests::FakeNode;
    use crate::core::{InstanceMeta, MemoryRegistry};
    use crate::sync::{CommandVerb, RosterSettings};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    const TOKEN: &str = "fleet-secret";

    async fn server_with(metas: Vec<InstanceMeta>) -> SyncServer {
        let state = ServerState::new(
            Arc::new(MemoryRegistry::with_instances(16, metas)),
            Arc::new(FakeNode::default()),
            Arc::new(CommandQueue::in_memory()),
            Arc::new(ClientRoster::new(RosterSettings::default())),
            TOKEN,
            MasterInfo {
                version: CORE_VERSION.to_string(),
                hostname: "master".to_string(),
                ip: "10.0.0.1".to_string(),
            },
        )
        .with_superuser(Some(Credential::generate("root")));
        SyncServer::new(state)
    }

    async fn call(server: &SyncServer, path: &str, token: Option<&str>, body: Value) -> Value {
        let mut request = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            request = request.header("authorization", format!("Bearer {}", token));
        }
        let request = request.body(Body::from(body.to_string())).unwrap();

        let response = server.router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), 200);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn hello(server: &SyncServer, role: &str) -> String {
        let reply = call(
            server,
            "/hello",
            None,
            json!({"version": CORE_VERSION, "hostname": "node", "role": role, "token": TOKEN}),
        )
        .await;
        assert_eq!(reply["status"]["code"], 0);
        reply["data"]["cid"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_hello_issues_cid_and_superuser() {
        let server = server_with(vec![]).await;
        let reply = call(
            &server,
            "/hello",
            None,
            json!({"version": CORE_VERSION, "hostname": "node-2", "role": "minion", "token": TOKEN}),
        )
        .await;

        assert_eq!(reply["status"]["code"], 0);
        assert!(reply["data"]["cid"].as_str().unwrap().starts_with("minion-"));
        assert_eq!(reply["data"]["superuser"]["hash"].as_str().unwrap().len(), 64);
        assert_eq!(reply["data"]["sentinel_works"], false);
    }

    #[tokio::test]
    async fn test_hello_rejections() {
        let server = server_with(vec![]).await;

        let wrong_token = call(
            &server,
            "/hello",
            None,
            json!({"version": CORE_VERSION, "hostname": "n", "role": "minion", "token": "nope"}),
        )
        .await;
        assert_eq!(wrong_token["status"]["code"], 2);

        let incompatible = call(
            &server,
            "/hello",
            None,
            json!({"version": "99.0.0", "hostname": "n", "role": "minion", "token": TOKEN}),
        )
        .await;
        assert_eq!(incompatible["status"]["code"], 8);
    }

    #[tokio::test]
    async fn test_status_codes_for_bad_requests() {
        let server = server_with(vec![]).await;

        let no_token = call(&server, "/pull", None, json!({"cid": "x"})).await;
        assert_eq!(no_token["status"]["code"], 2);

        let unknown = call(&server, "/pull", Some(TOKEN), json!({"cid": "x"})).await;
        assert_eq!(unknown["status"]["code"], 3);

        let wrong_args = call(&server, "/pull", Some(TOKEN), json!({"cid": 5})).await;
        assert_eq!(wrong_args["status"]["code"], 5);

        let unknown_path = call(&server, "/reboot", Some(TOKEN), json!({})).await;
        assert_eq!(unknown_path["status"]["code"], 1);
    }

    #[tokio::test]
    async fn test_malformed_body_and_wrong_method() {
        let server = server_with(vec![]).await;

        let request = Request::builder()
            .method("POST")
            .uri("/bye")
            .header("authorization", format!("Bearer {}", TOKEN))
            .body(Body::from("{not json"))
            .unwrap();
        let response = server.router().oneshot(request).await.unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let reply: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reply["status"]["code"], 6);

        let request = Request::builder()
            .method("GET")
            .uri("/pull")
            .body(Body::empty())
            .unwrap();
        let response = server.router().oneshot(request).await.unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let reply: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reply["status"]["code"], 4);
    }

    #[tokio::test]
    async fn test_push_is_held_until_a_client_pulls() {
        let server = server_with(vec![]).await;
        let uuid = Uuid::new_v4();

        let pushed = call(
            &server,
            "/push",
            Some(TOKEN),
            json!({"command": "start", "instance_id": 3, "instance_uuid": uuid, "initiator": "ops"}),
        )
        .await;
        assert_eq!(pushed["status"]["code"], 0);
        assert_eq!(server.state().queue().len().await, 1);

        let cid = hello(&server, "minion").await;
        let pulled = call(&server, "/pull", Some(TOKEN), json!({ "cid": cid })).await;
        let items = pulled["data"]["items"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["command"], "start");
        assert_eq!(items[0]["instance_uuid"], uuid.to_string());

        let again = call(&server, "/pull", Some(TOKEN), json!({ "cid": cid })).await;
        assert!(again["data"]["items"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_every_client_receives_each_command_in_order() {
        let server = server_with(vec![]).await;
        let minion = hello(&server, "minion").await;
        let sentinel = hello(&server, "sentinel").await;

        for command in ["start", "stop"] {
            call(
                &server,
                "/push",
                Some(TOKEN),
                json!({"command": command, "instance_id": 3, "instance_uuid": Uuid::nil(), "initiator": "ops"}),
            )
            .await;
        }

        for cid in [&minion, &sentinel] {
            let pulled = call(&server, "/pull", Some(TOKEN), json!({ "cid": cid })).await;
            let verbs: Vec<&str> = pulled["data"]["items"]
                .as_array()
                .unwrap()
                .iter()
                .map(|item| item["command"].as_str().unwrap())
                .collect();
            assert_eq!(verbs, vec!["start", "stop"]);
        }
    }

    #[tokio::test]
    async fn test_undelivered_commands_survive_master_restart() {
        let dir = tempfile::TempDir::new().unwrap();
        let journal = dir.path().join("queue.jsonl");
        let outboxes = dir.path().join("queue.outbox");

        let durable = |queue: CommandQueue| {
            let state = ServerState::new(
                Arc::new(MemoryRegistry::new(16)),
                Arc::new(FakeNode::default()),
                Arc::new(queue),
                Arc::new(ClientRoster::new(RosterSettings::default()).with_outbox_dir(&outboxes)),
                TOKEN,
                MasterInfo {
                    version: CORE_VERSION.to_string(),
                    hostname: "master".to_string(),
                    ip: "10.0.0.1".to_string(),
                },
            );
            SyncServer::new(state)
        };

        let server = durable(CommandQueue::open(&journal).await.unwrap());
        hello(&server, "minion").await;
        for command in ["stop", "start"] {
            call(
                &server,
                "/push",
                Some(TOKEN),
                json!({"command": command, "instance_id": 3, "instance_uuid": Uuid::nil(), "initiator": "ops"}),
            )
            .await;
        }
        // Dispatched to the minion's outbox, nothing left in the global journal
        assert!(server.state().queue().is_empty().await);
        drop(server);

        let restarted = durable(CommandQueue::open(&journal).await.unwrap());
        assert_eq!(restarted.state().recover().await.unwrap(), 2);
        assert_eq!(restarted.state().queue().len().await, 2);

        let cid = hello(&restarted, "minion").await;
        let pulled = call(&restarted, "/pull", Some(TOKEN), json!({ "cid": cid })).await;
        let verbs: Vec<&str> = pulled["data"]["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|item| item["command"].as_str().unwrap())
            .collect();
        assert_eq!(verbs, vec!["stop", "start"]);

        // Recovered once, a second restart has nothing to replay
        let again = durable(CommandQueue::open(&journal).await.unwrap());
        assert_eq!(again.state().recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_instance_verb_without_id_is_rejected() {
        let server = server_with(vec![]).await;
        let reply = call(
            &server,
            "/push",
            Some(TOKEN),
            json!({"command": CommandVerb::Destroy, "instance_id": 0, "instance_uuid": Uuid::nil(), "initiator": "ops"}),
        )
        .await;
        assert_eq!(reply["status"]["code"], 5);
    }

    #[tokio::test]
    async fn test_info_checks_generation() {
        let meta = InstanceMeta::new(4, "ops", "cache", "p");
        let server = server_with(vec![meta.clone()]).await;
        let cid = hello(&server, "minion").await;

        let found = call(
            &server,
            "/info",
            Some(TOKEN),
            json!({"cid": cid, "instance_id": 4, "instance_uuid": meta.uuid}),
        )
        .await;
        assert_eq!(found["status"]["code"], 0);
        assert_eq!(found["data"]["state"], "stopped");

        let stale = call(
            &server,
            "/info",
            Some(TOKEN),
            json!({"cid": cid, "instance_id": 4, "instance_uuid": Uuid::new_v4()}),
        )
        .await;
        assert_eq!(stale["status"]["code"], 7);

        let missing = call(
            &server,
            "/info",
            Some(TOKEN),
            json!({"cid": cid, "instance_id": 9, "instance_uuid": Uuid::nil()}),
        )
        .await;
        assert_eq!(missing["status"]["code"], 7);
    }

    #[tokio::test]
    async fn test_fetch_marks_client_syncing_until_pull() {
        let server = server_with(vec![InstanceMeta::new(1, "ops", "", "p")]).await;
        let cid = hello(&server, "minion").await;

        let fetched = call(&server, "/fetch", Some(TOKEN), json!({ "cid": cid })).await;
        assert_eq!(fetched["data"]["instances"].as_array().unwrap().len(), 1);

        let replication = call(&server, "/replication", Some(TOKEN), json!({ "cid": cid })).await;
        assert_eq!(replication["data"]["clients"][0]["state"], "syncing");
        assert_eq!(replication["data"]["suppliant"], cid.as_str());

        call(&server, "/pull", Some(TOKEN), json!({ "cid": cid })).await;
        let replication = call(&server, "/replication", Some(TOKEN), json!({})).await;
        assert_eq!(replication["data"]["clients"][0]["state"], "online");
    }

    #[tokio::test]
    async fn test_stats_and_bye() {
        let server = server_with(vec![
            InstanceMeta::new(1, "ops", "", "p"),
            InstanceMeta::new(2, "ops", "", "p"),
        ])
        .await;
        let cid = hello(&server, "sentinel").await;

        let stats = call(&server, "/stats", Some(TOKEN), json!({ "cid": cid })).await;
        assert_eq!(stats["data"]["instances"], 2);
        assert_eq!(stats["data"]["states"]["stopped"], 2);
        assert_eq!(stats["data"]["clients"], 1);

        let bye = call(&server, "/bye", Some(TOKEN), json!({ "cid": cid })).await;
        assert_eq!(bye["status"]["code"], 0);
        let again = call(&server, "/bye", Some(TOKEN), json!({ "cid": cid })).await;
        assert_eq!(again["status"]["code"], 3);
    }
}

/// Sync client and the polling agent run by minion and sentinel nodes
use super::{
    ClientRequest, ClientRole, CommandApplier, CommandQueueItem, Empty, FetchResponse,
    HelloRequest, HelloResponse, InfoRequest, InstanceInfo, MetaSource, Method, PullResponse,
    PushRequest, PushResponse, QueryRequest, Reply, ReplicationInfo, StatsInfo, StatusCode,
    CORE_VERSION,
};
use crate::core::InstanceMeta;
use crate::error::{FleetError, SyncError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

fn transport<E: std::fmt::Display>(error: E) -> SyncError {
    SyncError::Transport(error.to_string())
}

/// HTTP client of the sync protocol
pub struct SyncClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    hostname: String,
    cid: RwLock<Option<String>>,
}

impl SyncClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(transport)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            hostname: crate::utils::hostname(),
            cid: RwLock::new(None),
        })
    }

    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.hostname = hostname.to_string();
        self
    }

    pub async fn cid(&self) -> Option<String> {
        self.cid.read().await.clone()
    }

    /// Drop the session, the next call that needs one must hello first
    pub async fn forget(&self) {
        *self.cid.write().await = None;
    }

    async fn session(&self) -> Result<String, SyncError> {
        self.cid().await.ok_or(SyncError::NotRegistered)
    }

    async fn call<B, T>(&self, method: Method, body: &B) -> Result<T, SyncError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, method.path());
        let mut request = self.http.post(&url).json(body);
        if method != Method::Hello {
            request = request.bearer_auth(&self.token);
        }

        let response = request
            .send()
            .await
            .map_err(transport)?
            .error_for_status()
            .map_err(transport)?;

        let reply: Reply<T> = response.json().await.map_err(transport)?;
        reply.into_result()
    }

    /// Register with the master and keep the issued CID
    pub async fn hello(&self, role: ClientRole) -> Result<HelloResponse, SyncError> {
        let request = HelloRequest {
            version: CORE_VERSION.to_string(),
            hostname: self.hostname.clone(),
            role,
            token: self.token.clone(),
        };
        let response: HelloResponse = self.call(Method::Hello, &request).await?;

        *self.cid.write().await = Some(response.cid.clone());
        tracing::info!(
            cid = %response.cid,
            master = %response.master.hostname,
            "Registered with master"
        );
        Ok(response)
    }

    /// Enqueue a command, returning the queue modification time
    pub async fn push(&self, item: &CommandQueueItem) -> Result<u64, SyncError> {
        let request = PushRequest {
            cid: self.cid().await,
            command: item.command,
            instance_id: item.instance_id,
            instance_uuid: item.instance_uuid,
            initiator: item.initiator.clone(),
        };
        let response: PushResponse = self.call(Method::Push, &request).await?;
        Ok(response.mod_time)
    }

    pub async fn pull(&self) -> Result<PullResponse, SyncError> {
        let request = ClientRequest {
            cid: self.session().await?,
        };
        self.call(Method::Pull, &request).await
    }

    pub async fn fetch(&self) -> Result<Vec<InstanceMeta>, SyncError> {
        let request = ClientRequest {
            cid: self.session().await?,
        };
        let response: FetchResponse = self.call(Method::Fetch, &request).await?;
        Ok(response.instances)
    }

    pub async fn info(&self, instance_id: u32, instance_uuid: Uuid) -> Result<InstanceInfo, SyncError> {
        let request = InfoRequest {
            cid: self.session().await?,
            instance_id,
            instance_uuid,
        };
        self.call(Method::Info, &request).await
    }

    pub async fn replication(&self) -> Result<ReplicationInfo, SyncError> {
        let request = QueryRequest {
            cid: self.cid().await,
        };
        self.call(Method::Replication, &request).await
    }

    pub async fn stats(&self) -> Result<StatsInfo, SyncError> {
        let request = QueryRequest {
            cid: self.cid().await,
        };
        self.call(Method::Stats, &request).await
    }

    /// Leave the roster and drop the session
    pub async fn bye(&self) -> Result<(), SyncError> {
        let request = ClientRequest {
            cid: self.session().await?,
        };
        let _: Empty = self.call(Method::Bye, &request).await?;
        self.forget().await;
        Ok(())
    }
}

#[async_trait]
impl MetaSource for SyncClient {
    async fn instance(&self, id: u32, uuid: Uuid) -> Result<InstanceMeta, SyncError> {
        self.info(id, uuid).await.map(|info| info.meta)
    }
}

/// Registration, resync and the pull-apply loop of a client node
pub struct SyncAgent {
    client: Arc<SyncClient>,
    applier: CommandApplier,
    role: ClientRole,
    poll_interval: Duration,
}

impl SyncAgent {
    pub fn new(
        client: Arc<SyncClient>,
        applier: CommandApplier,
        role: ClientRole,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            applier,
            role,
            poll_interval,
        }
    }

    /// Hello, then align the local registry with the master's
    async fn register(&self) -> Result<(), SyncError> {
        let hello = self.client.hello(self.role).await?;
        if self.role == ClientRole::Minion && !hello.sentinel_works {
            tracing::warn!("No sentinel is online, failover is unavailable");
        }

        let instances = self.client.fetch().await?;
        self.applier.resync(&instances).await;
        Ok(())
    }

    /// One pull and apply round
    pub async fn sync_once(&self) -> Result<(), SyncError> {
        let pulled = self.client.pull().await?;
        if pulled.items.is_empty() {
            return Ok(());
        }

        tracing::info!(
            count = pulled.items.len(),
            mod_time = pulled.mod_time,
            "Pulled commands"
        );
        let report = self.applier.apply_all(&pulled.items, &*self.client).await;
        if !report.failed.is_empty() {
            tracing::warn!(%report, "Some commands failed");
        }
        Ok(())
    }

    /// Poll until `shutdown` turns true.
    ///
    /// Transport failures are retried on the next tick. Only a wrong token
    /// or an incompatible master ends the loop with an error.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), FleetError> {
        let mut ticker = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let step = if self.client.cid().await.is_some() {
                self.sync_once().await
            } else {
                self.register().await
            };

            match step {
                Ok(()) => {}
                Err(SyncError::Rejected {
                    code: StatusCode::UnknownClient,
                    ..
                })
                | Err(SyncError::NotRegistered) => {
                    tracing::warn!("Master does not know this client, registering again");
                    self.client.forget().await;
                }
                Err(
                    e @ SyncError::Rejected {
                        code: StatusCode::WrongAuthToken | StatusCode::IncompatibleCoreVersion,
                        ..
                    },
                ) => {
                    tracing::error!(error = %e, "Master refused this client");
                    return Err(e.into());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Sync round failed, retrying");
                }
            }
        }

        if self.client.cid().await.is_some() {
            if let Err(e) = self.client.bye().await {
                tracing::warn!(error = %e, "Failed to leave the roster");
            }
        }
        tracing::info!("Sync agent stopped");
        Ok(())
    }
}

/// Redis instance probe
///
/// Executes a single command against a local instance over a fresh TCP
/// connection, bounded by a timeout. Connection failures are reported
/// separately from timeouts so the classifier can tell a dead process from a
/// hung one.

use super::resp::{self, RespValue};
use crate::core::InstancePaths;
use crate::error::ProbeError;
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Black-box command execution against an instance
#[async_trait]
pub trait RedisProbe: Send + Sync {
    /// Execute `command` on instance `id`, failing with `ProbeError::Timeout`
    /// when no complete reply arrives in time
    async fn execute(
        &self,
        id: u32,
        command: &[&str],
        timeout: Duration,
    ) -> Result<RespValue, ProbeError>;
}

enum Target {
    Instances(InstancePaths),
    Fixed(u16),
}

/// Probe talking RESP to instances on localhost
pub struct RespProbe {
    host: String,
    target: Target,
    password: Option<String>,
}

impl RespProbe {
    pub fn new(paths: InstancePaths) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            target: Target::Instances(paths),
            password: None,
        }
    }

    /// Probe a single daemon on `port` regardless of the instance ID
    pub fn fixed(port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            target: Target::Fixed(port),
            password: None,
        }
    }

    fn port(&self, id: u32) -> Result<u16, ProbeError> {
        match &self.target {
            Target::Instances(paths) => paths
                .port(id)
                .ok_or_else(|| ProbeError::Connect(format!("instance {} has no valid port", id))),
            Target::Fixed(port) => Ok(*port),
        }
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    async fn round_trip(
        &self,
        stream: &mut TcpStream,
        buf: &mut BytesMut,
        command: &[&str],
    ) -> Result<RespValue, ProbeError> {
        stream
            .write_all(&resp::encode_command(command))
            .await
            .map_err(|e| ProbeError::Connect(format!("write failed: {}", e)))?;

        loop {
            if let Some(value) =
                resp::decode(buf).map_err(|e| ProbeError::Protocol(e.to_string()))?
            {
                return Ok(value);
            }

            let read = stream
                .read_buf(buf)
                .await
                .map_err(|e| ProbeError::Protocol(format!("read failed: {}", e)))?;
            if read == 0 {
                return Err(ProbeError::Protocol(
                    "connection closed before a complete reply".to_string(),
                ));
            }
        }
    }

    async fn run(&self, id: u32, command: &[&str]) -> Result<RespValue, ProbeError> {
        let addr = format!("{}:{}", self.host, self.port(id)?);
        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| ProbeError::Connect(format!("{}: {}", addr, e)))?;
        let mut buf = BytesMut::with_capacity(4096);

        if let Some(password) = &self.password {
            if let RespValue::Error(message) =
                self.round_trip(&mut stream, &mut buf, &["AUTH", password]).await?
            {
                return Err(ProbeError::Server(message));
            }
        }

        match self.round_trip(&mut stream, &mut buf, command).await? {
            RespValue::Error(message) => Err(ProbeError::Server(message)),
            value => Ok(value),
        }
    }
}

#[async_trait]
impl RedisProbe for RespProbe {
    async fn execute(
        &self,
        id: u32,
        command: &[&str],
        limit: Duration,
    ) -> Result<RespValue, ProbeError> {
        tracing::trace!(id, command = ?command, "Executing probe command");

        match timeout(limit, self.run(id, command)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(limit)),
        }
    }
}

/// Parsed reply of the INFO command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InfoReply {
    fields: HashMap<String, String>,
}

impl InfoReply {
    pub fn parse(text: &str) -> Self {
        let fields = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self { fields }
    }

    pub fn from_reply(reply: &RespValue) -> Result<Self, ProbeError> {
        reply
            .as_text()
            .map(|text| Self::parse(&text))
            .ok_or_else(|| ProbeError::Protocol(format!("unexpected INFO reply: {:?}", reply)))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    fn number(&self, key: &str) -> u64 {
        self.get(key)
            .and_then(|v| v.parse::<f64>().ok())
            .map(|v| v.max(0.0) as u64)
            .unwrap_or(0)
    }

    fn flag(&self, key: &str) -> bool {
        self.number(key) > 0
    }

    pub fn is_loading(&self) -> bool {
        self.flag("loading") || self.flag("async_loading")
    }

    pub fn is_saving(&self) -> bool {
        self.flag("rdb_bgsave_in_progress") || self.flag("aof_rewrite_in_progress")
    }

    pub fn is_replica(&self) -> bool {
        matches!(self.get("role"), Some("slave") | Some("replica"))
    }

    pub fn master_link_up(&self) -> bool {
        self.get("master_link_status") == Some("up")
    }

    pub fn master_sync_in_progress(&self) -> bool {
        self.flag("master_sync_in_progress")
    }

    pub fn connected_replicas(&self) -> u64 {
        self.number("connected_slaves")
    }

    pub fn ops_per_sec(&self) -> u64 {
        self.number("instantaneous_ops_per_sec")
    }

    /// Any error counter with a non-zero value
    pub fn has_errors(&self) -> bool {
        self.flag("total_error_replies")
            || self.flag("rdb_last_bgsave_status_err")
            || self.get("rdb_last_bgsave_status") == Some("err")
            || self.get("aof_last_write_status") == Some("err")
            || self
                .fields
                .iter()
                .any(|(k, v)| k.starts_with("errorstat_") && !v.ends_with("count=0"))
    }

    pub fn redis_version(&self) -> Option<&str> {
        self.get("redis_version")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::net::TcpListener;

    fn paths_for(port: u16) -> InstancePaths {
        InstancePaths {
            pid_dir: PathBuf::from("/tmp"),
            config_dir: PathBuf::from("/tmp"),
            data_dir: PathBuf::from("/tmp"),
            base_port: port - 1,
        }
    }

    #[tokio::test]
    async fn test_id_beyond_port_range_never_wraps() {
        let probe = RespProbe::new(paths_for(65_000));
        let result = probe
            .execute(1_000, &["PING"], Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(ProbeError::Connect(_))));
    }

    #[tokio::test]
    async fn test_connection_refused_is_connect_error() {
        // Bind and drop to get a port that is very likely closed
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = RespProbe::new(paths_for(port));
        let result = probe.execute(1, &["PING"], Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ProbeError::Connect(_))));
    }

    #[tokio::test]
    async fn test_silent_server_is_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let probe = RespProbe::new(paths_for(port));
        let result = probe.execute(1, &["INFO"], Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ProbeError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(b"+PONG\r\n").await.unwrap();
        });

        let probe = RespProbe::new(paths_for(port));
        let reply = probe
            .execute(1, &["PING"], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, RespValue::SimpleString("PONG".to_string()));
    }

    #[tokio::test]
    async fn test_fixed_probe_ignores_instance_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(b":1\r\n").await.unwrap();
        });

        let probe = RespProbe::fixed(port);
        let reply = probe
            .execute(999, &["PING"], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, RespValue::Integer(1));
    }

    #[test]
    fn test_info_parse() {
        let info = InfoReply::parse(
            "# Server\r\nredis_version:7.2.4\r\n# Replication\r\nrole:slave\r\nmaster_link_status:down\r\nconnected_slaves:0\r\n# Stats\r\ninstantaneous_ops_per_sec:12\r\nerrorstat_ERR:count=3\r\n",
        );

        assert_eq!(info.redis_version(), Some("7.2.4"));
        assert!(info.is_replica());
        assert!(!info.master_link_up());
        assert_eq!(info.ops_per_sec(), 12);
        assert!(info.has_errors());
        assert!(!info.is_saving());
    }
}

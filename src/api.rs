//! Wire types for the HTTP/JSON protocol spoken between components, plus the
//! axum glue that maps them (and errors) onto requests and responses. Unknown
//! JSON fields are ignored everywhere; missing required fields surface as a
//! 400 invalid-input error.

use crate::errinput;
use crate::error::{Error, Result};

use axum::extract::{FromRequest, Request};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A record version. Starts at 0 (absent) and is incremented by the leader on
/// each accepted write, so the first write of a key produces version 1.
pub type Version = u64;

/// A node's replication role, fixed for the process lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Role::Leader => write!(f, "leader"),
            Role::Follower => write!(f, "follower"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "leader" => Ok(Role::Leader),
            "follower" => Ok(Role::Follower),
            role => errinput!("invalid role {role}, expected leader or follower"),
        }
    }
}

/// A versioned value as stored on a node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub value: String,
    pub version: Version,
}

/// A client write as accepted by the leader. The follower lists are filled in
/// by the coordinator; a bare {key, value} write replicates to nobody.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteRequest {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub sync_followers: Vec<String>,
    #[serde(default)]
    pub async_followers: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteResponse {
    pub key: String,
    pub version: Version,
    /// Sync followers that acknowledged the replicate before the deadline.
    pub sync_acks: usize,
    pub sync_acked_by: Vec<String>,
    /// Async followers the write was queued to, without waiting.
    pub async_queued: usize,
}

/// A replicated write from the leader to a follower.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicateRequest {
    pub key: String,
    pub value: String,
    pub version: Version,
    /// The replicating node's id, for log correlation.
    #[serde(default)]
    pub source: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicateResponse {
    /// False when the incoming version was not newer than the local one and
    /// the update was dropped (still a successful, idempotent call).
    pub accepted: bool,
    pub local_version: Version,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadResponse {
    pub node_id: String,
    pub key: String,
    pub value: String,
    pub version: Version,
}

/// A full copy of a node's store, used by catch-up.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub records: BTreeMap<String, Record>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BulkLoadResponse {
    /// Number of records applied. Records whose local version was already
    /// newer are skipped and not counted.
    pub loaded: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub node_id: String,
    pub role: Role,
    pub uptime_s: u64,
    pub record_count: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeStats {
    pub node_id: String,
    pub role: Role,
    pub active_requests: usize,
    pub total_writes: u64,
    pub total_reads: u64,
    pub replications_sent: u64,
    pub replications_received: u64,
    pub record_count: usize,
    pub load_factor: u32,
}

/// Identity and address of a node, as registered with the registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: String,
    pub role: Role,
    pub host: String,
    pub port: u16,
    /// Incremented each time the same node id is respawned.
    #[serde(default)]
    pub startup_epoch: u64,
}

impl NodeDescriptor {
    /// The node's base URL.
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// The registry's view of a node's liveness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MembershipState {
    Alive,
    /// Heartbeats have been missed but the prune threshold has not elapsed.
    SuspectedDead,
    Pruned,
}

impl std::fmt::Display for MembershipState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            MembershipState::Alive => write!(f, "alive"),
            MembershipState::SuspectedDead => write!(f, "suspected-dead"),
            MembershipState::Pruned => write!(f, "pruned"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MembershipEntry {
    pub node_id: String,
    pub role: Role,
    pub host: String,
    pub port: u16,
    pub startup_epoch: u64,
    pub state: MembershipState,
    pub last_seen_s: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
    /// The current alive set, so nodes learn the membership for free.
    pub alive: Vec<NodeDescriptor>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeregisterRequest {
    pub node_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

/// A client write as accepted by the coordinator or gateway.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientWriteRequest {
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientWriteResponse {
    pub key: String,
    pub version: Version,
    pub sync_acks: usize,
    pub synced_followers: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientReadResponse {
    pub key: String,
    pub value: String,
    pub version: Version,
    /// The follower whose answer had the highest version.
    pub source_node_id: String,
}

/// An optional spawn hint, e.g. from the registry's auto-respawn: prefer
/// resurrecting this node id on its original port.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SpawnRequest {
    #[serde(default)]
    pub node_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpawnResponse {
    pub node_id: String,
    pub port: u16,
    pub was_respawn: bool,
}

/// A catch-up trigger, typically emitted by the registry when a follower
/// (re)appears.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatchupRequest {
    pub node_id: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatchupResponse {
    pub node_id: String,
    pub keys_loaded: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaderStatus {
    pub node_id: String,
    pub url: String,
    pub alive: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FollowerStatus {
    pub node_id: String,
    pub url: String,
    pub port: u16,
    pub alive: bool,
    pub startup_epoch: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuorumStatus {
    pub write_quorum: usize,
    pub read_quorum: usize,
    pub live_followers: usize,
    pub can_write: bool,
    pub can_read: bool,
}

/// The coordinator's full view of the cluster, including the port-derived
/// sync, async and read sets.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub leader: Option<LeaderStatus>,
    pub followers: Vec<FollowerStatus>,
    pub quorum: QuorumStatus,
    pub sync_set: Vec<String>,
    pub async_set: Vec<String>,
    pub read_set: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimiterStats {
    pub strategy: String,
    pub max_requests: usize,
    pub window_seconds: u64,
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub rejected_requests: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpstreamStats {
    pub url: String,
    pub weight: u32,
    pub active_requests: usize,
    pub total_requests: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BalancerStats {
    pub strategy: String,
    pub upstreams: Vec<UpstreamStats>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayStats {
    pub total_requests: u64,
    pub forwarded_requests: u64,
    pub rate_limited_requests: u64,
    pub errors: u64,
    pub rate_limiter: Option<LimiterStats>,
    pub load_balancer: Option<BalancerStats>,
}

/// The JSON body of every error response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl From<&Error> for ErrorBody {
    fn from(error: &Error) -> Self {
        let retry_after = match error {
            Error::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        };
        Self { error: error.to_string(), code: error.code().into(), retry_after }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody::from(&self);
        let mut response = (status, Json(body)).into_response();
        if let Error::RateLimited { retry_after } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// A JSON request body. Unlike the stock Json extractor this rejects all
/// malformed bodies, missing fields included, with a 400 invalid-input error.
pub struct Body<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for Body<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = Error;

    async fn from_request(req: Request, state: &S) -> Result<Self> {
        let Json(value) = Json::<serde_json::Value>::from_request(req, state)
            .await
            .map_err(|e| Error::InvalidInput(format!("invalid request body: {e}")))?;
        let inner = serde_json::from_value(value)
            .map_err(|e| Error::InvalidInput(format!("invalid request body: {e}")))?;
        Ok(Self(inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_request_defaults_follower_lists() {
        let req: WriteRequest =
            serde_json::from_str(r#"{"key": "a", "value": "1"}"#).expect("decode failed");
        assert_eq!(req.key, "a");
        assert!(req.sync_followers.is_empty());
        assert!(req.async_followers.is_empty());
    }

    #[test]
    fn write_request_ignores_unknown_fields() {
        let req: WriteRequest =
            serde_json::from_str(r#"{"key": "a", "value": "1", "bogus": true}"#)
                .expect("decode failed");
        assert_eq!(req.value, "1");
    }

    #[test]
    fn membership_state_uses_kebab_case() {
        let state = serde_json::to_string(&MembershipState::SuspectedDead).unwrap();
        assert_eq!(state, r#""suspected-dead""#);
    }

    #[test]
    fn descriptor_url() {
        let desc = NodeDescriptor {
            node_id: "follower-1".into(),
            role: Role::Follower,
            host: "127.0.0.1".into(),
            port: 7002,
            startup_epoch: 0,
        };
        assert_eq!(desc.url(), "http://127.0.0.1:7002");
    }
}

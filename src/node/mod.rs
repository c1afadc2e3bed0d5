//! The replicated node: a process holding a versioned key/value map behind an
//! HTTP server. In the leader role it accepts client writes and fans them out
//! to sync followers (waiting) and async followers (fire-and-forget). In the
//! follower role it accepts replicated writes after its configured delay and
//! applies them monotonically. Every node heartbeats to the registry and
//! serves reads, snapshots and bulk loads regardless of role.

pub mod load;
pub mod store;

use crate::api::{
    Body, HealthResponse, NodeDescriptor, NodeStats, ReadResponse, ReplicateRequest,
    ReplicateResponse, Role, Snapshot, WriteRequest, WriteResponse,
};
use crate::client::{NodeClient, RegistryClient};
use crate::errinput;
use crate::error::{Error, Result};
use crate::gateway::limiter::{self, LimiterConfig};
use store::Store;

use axum::extract::{Path, Request, State};
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

/// Interval between heartbeats to the registry.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Deadline for a single replicate call during the leader's fan-out.
const REPLICATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Node configuration, normally assembled from CLI flags by the binary or by
/// the coordinator at spawn time.
#[derive(Clone)]
pub struct NodeConfig {
    pub id: String,
    pub role: Role,
    /// Host the node advertises in its heartbeat descriptor.
    pub host: String,
    pub port: u16,
    /// Registry base URL. None disables heartbeats entirely.
    pub registry: Option<String>,
    /// Delay applied before a replicated write lands. Set by the coordinator
    /// at spawn: 500ms for sync-set followers, 5s for async followers.
    pub replication_delay: Duration,
    pub load_factor: u32,
    pub rate_limit: Option<LimiterConfig>,
    pub startup_epoch: u64,
}

impl NodeConfig {
    pub fn new(id: impl Into<String>, role: Role, port: u16) -> Self {
        Self {
            id: id.into(),
            role,
            host: "127.0.0.1".into(),
            port,
            registry: None,
            replication_delay: Duration::ZERO,
            load_factor: 0,
            rate_limit: None,
            startup_epoch: 0,
        }
    }
}

#[derive(Default)]
struct Stats {
    active_requests: AtomicUsize,
    total_writes: AtomicU64,
    total_reads: AtomicU64,
    replications_sent: AtomicU64,
    replications_received: AtomicU64,
}

/// A node handle. Cheaply cloneable; all clones share the same store.
#[derive(Clone)]
pub struct Node(Arc<Shared>);

struct Shared {
    config: NodeConfig,
    store: Store,
    stats: Stats,
    started: Instant,
    http: reqwest::Client,
    limiter: Option<limiter::SharedLimiter>,
    role_header: HeaderValue,
    id_header: HeaderValue,
}

impl Node {
    pub fn new(config: NodeConfig) -> Result<Self> {
        if config.id.is_empty() {
            return errinput!("node id must not be empty");
        }
        let limiter = config.rate_limit.as_ref().map(limiter::shared).transpose()?;
        let id_header = HeaderValue::from_str(&config.id)
            .map_err(|_| Error::InvalidInput(format!("node id {} not header-safe", config.id)))?;
        let role_header = match config.role {
            Role::Leader => HeaderValue::from_static("leader"),
            Role::Follower => HeaderValue::from_static("follower"),
        };
        Ok(Self(Arc::new(Shared {
            config,
            store: Store::new(),
            stats: Stats::default(),
            started: Instant::now(),
            http: reqwest::Client::new(),
            limiter,
            role_header,
            id_header,
        })))
    }

    /// The descriptor this node announces in heartbeats.
    pub fn descriptor(&self) -> NodeDescriptor {
        let config = &self.0.config;
        NodeDescriptor {
            node_id: config.id.clone(),
            role: config.role,
            host: config.host.clone(),
            port: config.port,
            startup_epoch: config.startup_epoch,
        }
    }

    pub fn router(&self) -> Router {
        // The limiter covers client data traffic only; replication and
        // control endpoints must never be rate limited.
        let mut data = Router::new()
            .route("/write", post(write))
            .route("/read/:key", get(read))
            .with_state(self.clone());
        if let Some(limiter) = &self.0.limiter {
            data = data.layer(middleware::from_fn_with_state(limiter.clone(), limiter::middleware));
        }
        let internal = Router::new()
            .route("/replicate", post(replicate))
            .route("/snapshot", get(snapshot))
            .route("/bulk-load", post(bulk_load))
            .route("/health", get(health))
            .route("/stats", get(stats))
            .with_state(self.clone());
        // Outermost: tags every response (rate-limit rejections included)
        // and tracks in-flight requests.
        data.merge(internal).layer(middleware::from_fn_with_state(self.clone(), tag_response))
    }

    /// Serves the node on the given listener until SIGINT/SIGTERM, then
    /// deregisters from the registry and drains.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        let config = &self.0.config;
        info!("{} node {} listening on {addr}", config.role, config.id);

        if let Some(registry) = config.registry.clone() {
            let node = self.clone();
            tokio::spawn(async move { node.heartbeat_loop(registry).await });
        }

        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();
        let id = self.0.config.id.clone();
        axum::serve(listener, app).with_graceful_shutdown(self.drain_signal()).await?;
        info!("node {id} exited cleanly");
        Ok(())
    }

    /// Emits a heartbeat every tick, forever. Failures are retried on the
    /// next tick; the node keeps serving data traffic regardless.
    async fn heartbeat_loop(self, registry: String) {
        let client = RegistryClient::new(self.0.http.clone(), registry);
        let descriptor = self.descriptor();
        let mut registered = false;
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match client.heartbeat(&descriptor).await {
                Ok(_) if !registered => {
                    registered = true;
                    info!("node {} registered with registry", descriptor.node_id);
                }
                Ok(_) => {}
                Err(e) => debug!("node {} heartbeat failed: {e}", descriptor.node_id),
            }
        }
    }

    /// Resolves on SIGINT or SIGTERM, after deregistering from the registry.
    async fn drain_signal(self) {
        let ctrl_c = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!("cannot install SIGTERM handler: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let config = &self.0.config;
        info!("node {} draining", config.id);
        if let Some(registry) = &config.registry {
            let client = RegistryClient::new(self.0.http.clone(), registry.clone());
            if let Err(e) = client.deregister(&config.id).await {
                warn!("node {} deregister failed: {e}", config.id);
            }
        }
    }

    /// Accepts a client write: stores locally at the next version under the
    /// key's lock, replicates to all sync followers in parallel waiting for
    /// every ack, queues async replication without waiting, and reports the
    /// ack count. The lock is held across the sync fan-out so concurrent
    /// writes to the same key replicate in version order.
    async fn write(&self, req: WriteRequest) -> Result<WriteResponse> {
        let config = &self.0.config;
        if config.role != Role::Leader {
            return errinput!("followers do not accept client writes");
        }
        if req.key.is_empty() {
            return errinput!("key must not be empty");
        }
        load::simulate(config.load_factor).await;

        let _guard = self.0.store.lock_key(&req.key).await;
        let version = self.0.store.put(&req.key, req.value.clone());
        self.0.stats.total_writes.fetch_add(1, Ordering::Relaxed);
        info!("node {}: wrote {}={} (v{version})", config.id, req.key, req.value);

        let replicate = ReplicateRequest {
            key: req.key.clone(),
            value: req.value,
            version,
            source: config.id.clone(),
        };

        // Sync fan-out: every sync follower in parallel, waiting for all of
        // them or their individual deadlines.
        let sync_total = req.sync_followers.len();
        let results = futures::future::join_all(req.sync_followers.into_iter().map(|url| {
            let http = self.0.http.clone();
            let request = replicate.clone();
            async move {
                let result =
                    NodeClient::new(http, url.clone()).replicate(&request, REPLICATE_TIMEOUT).await;
                (url, result)
            }
        }))
        .await;

        let mut sync_acked_by = Vec::new();
        for (url, result) in results {
            match result {
                Ok(resp) => {
                    self.0.stats.replications_sent.fetch_add(1, Ordering::Relaxed);
                    if !resp.accepted {
                        debug!(
                            "node {}: {url} dropped {} v{version} as stale (local v{})",
                            config.id, replicate.key, resp.local_version
                        );
                    }
                    sync_acked_by.push(url);
                }
                Err(e) => {
                    warn!(
                        "node {}: sync replicate of {} v{version} to {url} failed: {e}",
                        config.id, replicate.key
                    );
                }
            }
        }

        // Async fan-out: detached tasks, so neither this request completing
        // nor the client going away cancels an in-flight replicate.
        let async_queued = req.async_followers.len();
        for url in req.async_followers {
            let node = self.clone();
            let request = replicate.clone();
            tokio::spawn(async move {
                let client = NodeClient::new(node.0.http.clone(), url);
                match client.replicate(&request, REPLICATE_TIMEOUT).await {
                    Ok(_) => {
                        node.0.stats.replications_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => warn!(
                        "node {}: async replicate of {} v{} to {} failed: {e}",
                        node.0.config.id,
                        request.key,
                        request.version,
                        client.url()
                    ),
                }
            });
        }
        if async_queued > 0 {
            debug!("node {}: queued async replication to {async_queued} followers", config.id);
        }

        let sync_acks = sync_acked_by.len();
        if sync_acks < sync_total {
            // The local write is retained; the version chain stays monotonic
            // and later successful writes will build on it.
            return Err(Error::QuorumUnavailable(format!(
                "{sync_acks} of {sync_total} sync follower acks for {} v{version}",
                replicate.key
            )));
        }
        Ok(WriteResponse { key: req.key, version, sync_acks, sync_acked_by, async_queued })
    }

    /// Applies a replicated write after the configured delay, if its version
    /// is newer than the local one.
    async fn replicate(&self, req: ReplicateRequest) -> Result<ReplicateResponse> {
        let config = &self.0.config;
        if config.role == Role::Leader {
            return errinput!("the leader does not accept replicated writes");
        }
        if req.key.is_empty() {
            return errinput!("key must not be empty");
        }

        let delay = config.replication_delay;
        if !delay.is_zero() {
            debug!("node {}: delaying {} v{} by {delay:?}", config.id, req.key, req.version);
            tokio::time::sleep(delay).await;
        }

        let (accepted, local_version) = self.0.store.apply(&req.key, req.value.clone(), req.version);
        if accepted {
            self.0.stats.replications_received.fetch_add(1, Ordering::Relaxed);
            info!(
                "node {}: applied {}={} (v{}) from {}",
                config.id, req.key, req.value, req.version, req.source
            );
        } else {
            debug!(
                "node {}: dropped stale {} v{} (local v{local_version})",
                config.id, req.key, req.version
            );
        }
        Ok(ReplicateResponse { accepted, local_version })
    }
}

async fn write(
    State(node): State<Node>,
    Body(req): Body<WriteRequest>,
) -> Result<Json<WriteResponse>> {
    // Run the write on a detached task: dropping this handler future (client
    // disconnect) must not cancel replication of an accepted write.
    let task = tokio::spawn(async move { node.write(req).await });
    match task.await {
        Ok(result) => result.map(Json),
        Err(e) => Err(Error::IO(format!("write task failed: {e}"))),
    }
}

async fn replicate(
    State(node): State<Node>,
    Body(req): Body<ReplicateRequest>,
) -> Result<Json<ReplicateResponse>> {
    node.replicate(req).await.map(Json)
}

async fn read(State(node): State<Node>, Path(key): Path<String>) -> Result<Json<ReadResponse>> {
    load::simulate(node.0.config.load_factor).await;
    match node.0.store.get(&key) {
        Some(record) => {
            node.0.stats.total_reads.fetch_add(1, Ordering::Relaxed);
            Ok(Json(ReadResponse {
                node_id: node.0.config.id.clone(),
                key,
                value: record.value,
                version: record.version,
            }))
        }
        None => Err(Error::NotFound(format!("key '{key}'"))),
    }
}

async fn snapshot(State(node): State<Node>) -> Json<Snapshot> {
    Json(node.0.store.snapshot())
}

/// Bulk-loads a snapshot, bypassing the replication delay: catch-up is
/// urgent. Records already present at a newer version are kept.
async fn bulk_load(
    State(node): State<Node>,
    Body(snapshot): Body<Snapshot>,
) -> Json<crate::api::BulkLoadResponse> {
    let loaded = node.0.store.bulk_load(snapshot);
    info!("node {}: bulk-loaded {loaded} records", node.0.config.id);
    Json(crate::api::BulkLoadResponse { loaded })
}

async fn health(State(node): State<Node>) -> Json<HealthResponse> {
    Json(HealthResponse {
        node_id: node.0.config.id.clone(),
        role: node.0.config.role,
        uptime_s: node.0.started.elapsed().as_secs(),
        record_count: node.0.store.len(),
    })
}

async fn stats(State(node): State<Node>) -> Json<NodeStats> {
    let stats = &node.0.stats;
    Json(NodeStats {
        node_id: node.0.config.id.clone(),
        role: node.0.config.role,
        active_requests: stats.active_requests.load(Ordering::Relaxed),
        total_writes: stats.total_writes.load(Ordering::Relaxed),
        total_reads: stats.total_reads.load(Ordering::Relaxed),
        replications_sent: stats.replications_sent.load(Ordering::Relaxed),
        replications_received: stats.replications_received.load(Ordering::Relaxed),
        record_count: node.0.store.len(),
        load_factor: node.0.config.load_factor,
    })
}

/// Tags every response with the node's identity and tracks in-flight
/// requests for the stats endpoint.
async fn tag_response(State(node): State<Node>, req: Request, next: Next) -> Response {
    node.0.stats.active_requests.fetch_add(1, Ordering::Relaxed);
    let mut response = next.run(req).await;
    node.0.stats.active_requests.fetch_sub(1, Ordering::Relaxed);
    let headers = response.headers_mut();
    headers.insert("x-node-id", node.0.id_header.clone());
    headers.insert("x-node-role", node.0.role_header.clone());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn leader() -> Node {
        Node::new(NodeConfig::new("leader", Role::Leader, 7001)).expect("node config invalid")
    }

    fn follower(delay: Duration) -> Node {
        let mut config = NodeConfig::new("follower-1", Role::Follower, 7002);
        config.replication_delay = delay;
        Node::new(config).expect("node config invalid")
    }

    #[tokio::test]
    async fn leader_write_without_followers_succeeds() {
        let node = leader();
        let req = WriteRequest {
            key: "a".into(),
            value: "1".into(),
            sync_followers: vec![],
            async_followers: vec![],
        };
        let resp = node.write(req).await.expect("write failed");
        assert_eq!(resp.version, 1);
        assert_eq!(resp.sync_acks, 0);
    }

    #[tokio::test]
    async fn leader_write_with_unreachable_sync_follower_fails_but_retains() {
        let node = leader();
        let req = WriteRequest {
            key: "a".into(),
            value: "1".into(),
            // Nothing listens here; the ack fails and the write errors.
            sync_followers: vec!["http://127.0.0.1:1".into()],
            async_followers: vec![],
        };
        let err = node.write(req).await.expect_err("write should fail");
        assert!(matches!(err, Error::QuorumUnavailable(_)), "unexpected error {err:?}");
        // The locally-applied value is retained, not rolled back.
        let record = node.0.store.get("a").expect("record missing");
        assert_eq!(record.version, 1);
    }

    #[tokio::test]
    async fn follower_rejects_client_writes() {
        let node = follower(Duration::ZERO);
        let req = WriteRequest {
            key: "a".into(),
            value: "1".into(),
            sync_followers: vec![],
            async_followers: vec![],
        };
        let err = node.write(req).await.expect_err("write should fail");
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn leader_rejects_replicate() {
        let node = leader();
        let req = ReplicateRequest {
            key: "a".into(),
            value: "1".into(),
            version: 1,
            source: "other".into(),
        };
        assert!(node.replicate(req).await.is_err());
    }

    #[tokio::test]
    async fn replicate_applies_monotonically() {
        let node = follower(Duration::ZERO);
        let newer = ReplicateRequest {
            key: "k".into(),
            value: "v2".into(),
            version: 2,
            source: "leader".into(),
        };
        let older = ReplicateRequest {
            key: "k".into(),
            value: "v1".into(),
            version: 1,
            source: "leader".into(),
        };
        let resp = node.replicate(newer).await.expect("replicate failed");
        assert!(resp.accepted);
        // Delivered out of order: the stale version is dropped but reported
        // as success.
        let resp = node.replicate(older).await.expect("replicate failed");
        assert!(!resp.accepted);
        assert_eq!(resp.local_version, 2);
        let record = node.0.store.get("k").expect("record missing");
        assert_eq!((record.value.as_str(), record.version), ("v2", 2));
    }

    #[tokio::test]
    async fn empty_key_is_invalid() {
        let node = leader();
        let req = WriteRequest {
            key: "".into(),
            value: "1".into(),
            sync_followers: vec![],
            async_followers: vec![],
        };
        assert!(matches!(node.write(req).await, Err(Error::InvalidInput(_))));
    }
}

//! The cluster coordinator: owns the layout (one leader plus N followers),
//! speaks quorum on behalf of clients, spawns and kills node processes, and
//! orchestrates catch-up for replacement followers. It is the only component
//! that understands W and R; nodes just fan out to whatever follower lists
//! they are handed.

pub mod catchup;
pub mod process;
pub mod quorum;

use crate::api::{
    Body, CatchupRequest, CatchupResponse, ClientReadResponse, ClientWriteRequest,
    ClientWriteResponse, ClusterStatus, FollowerStatus, LeaderStatus, NodeDescriptor, OkResponse,
    QuorumStatus, ReadResponse, Role, SpawnRequest, SpawnResponse, WriteRequest,
};
use crate::client::NodeClient;
use crate::errinput;
use crate::error::{Error, Result};
use process::NodeProcess;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::future::join_all;
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

/// Deadline for the leader write call. Must exceed the leader's own 60 s
/// sync fan-out deadline so the leader's verdict is always preferred over a
/// coordinator-side timeout.
const LEADER_WRITE_TIMEOUT: Duration = Duration::from_secs(65);

/// Deadline for each follower read during a quorum read.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a freshly spawned node may take to answer its health endpoint.
const SPAWN_READY_TIMEOUT: Duration = Duration::from_secs(15);

/// Replication delay handed to sync-set followers at spawn. Fixed for demo
/// stability.
pub const DEFAULT_SYNC_DELAY: Duration = Duration::from_millis(500);

/// Replication delay handed to async followers at spawn, making replication
/// lag visible.
pub const DEFAULT_ASYNC_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct CoordinatorConfig {
    /// Registry base URL, passed to spawned nodes for heartbeats.
    pub registry: Option<String>,
    /// Number of followers to boot.
    pub followers: usize,
    pub write_quorum: usize,
    pub read_quorum: usize,
    pub host: String,
    /// Nodes listen on node_base_port + 1 (leader) and + 1 + K (follower-K).
    pub node_base_port: u16,
    /// Node binary path; defaults to a sibling of the running executable.
    pub node_bin: Option<PathBuf>,
    pub sync_delay: Duration,
    pub async_delay: Duration,
    /// Retry reads against live followers outside the read set when fewer
    /// than R answers arrive. Off by default to keep the strict W+R>N demo.
    pub read_retry: bool,
    pub health_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            registry: None,
            followers: 2,
            write_quorum: 2,
            read_quorum: 1,
            host: "127.0.0.1".into(),
            node_base_port: 7000,
            node_bin: None,
            sync_delay: DEFAULT_SYNC_DELAY,
            async_delay: DEFAULT_ASYNC_DELAY,
            read_retry: false,
            health_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Clone)]
struct ManagedNode {
    descriptor: NodeDescriptor,
    alive: bool,
}

#[derive(Default)]
struct Layout {
    leader: Option<ManagedNode>,
    followers: BTreeMap<String, ManagedNode>,
    /// Highest follower index allocated so far, for new follower-K ids.
    next_follower: u32,
}

/// A coordinator handle. Cheaply cloneable.
#[derive(Clone)]
pub struct Coordinator(Arc<Shared>);

struct Shared {
    config: CoordinatorConfig,
    layout: RwLock<Layout>,
    children: Mutex<HashMap<String, NodeProcess>>,
    /// Serializes bootstrap and spawn so port and id allocation stay
    /// race-free.
    spawn_lock: tokio::sync::Mutex<()>,
    http: reqwest::Client,
}

fn follower_index(node_id: &str) -> Option<u32> {
    node_id.strip_prefix("follower-")?.parse().ok()
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self(Arc::new(Shared {
            config,
            layout: RwLock::new(Layout::default()),
            children: Mutex::new(HashMap::new()),
            spawn_lock: tokio::sync::Mutex::new(()),
            http: reqwest::Client::new(),
        }))
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.0.config
    }

    /// Adds an externally managed leader to the layout, e.g. one running
    /// in-process in tests.
    pub fn attach_leader(&self, descriptor: NodeDescriptor) {
        let mut layout = self.0.layout.write().expect("layout lock poisoned");
        layout.leader = Some(ManagedNode { descriptor, alive: true });
    }

    /// Adds an externally managed follower to the layout.
    pub fn attach_follower(&self, descriptor: NodeDescriptor) {
        let mut layout = self.0.layout.write().expect("layout lock poisoned");
        if let Some(index) = follower_index(&descriptor.node_id) {
            layout.next_follower = layout.next_follower.max(index);
        }
        layout.followers.insert(descriptor.node_id.clone(), ManagedNode { descriptor, alive: true });
    }

    fn node_bin(&self) -> Result<PathBuf> {
        match &self.0.config.node_bin {
            Some(bin) => Ok(bin.clone()),
            None => process::default_node_bin(),
        }
    }

    /// Live followers, for quorum set computation.
    fn live_followers(&self) -> Vec<NodeDescriptor> {
        let layout = self.0.layout.read().expect("layout lock poisoned");
        layout.followers.values().filter(|f| f.alive).map(|f| f.descriptor.clone()).collect()
    }

    fn live_leader(&self) -> Option<NodeDescriptor> {
        let layout = self.0.layout.read().expect("layout lock poisoned");
        layout.leader.as_ref().filter(|l| l.alive).map(|l| l.descriptor.clone())
    }

    /// Boots the cluster: spawns the leader and the configured number of
    /// followers as child processes, waiting for each to become healthy.
    /// Followers in the initial sync set (the W smallest ports) get the fast
    /// replication delay, the rest the slow one.
    pub async fn bootstrap(&self) -> Result<()> {
        let _guard = self.0.spawn_lock.lock().await;
        let config = &self.0.config;
        let bin = self.node_bin()?;
        info!(
            "booting cluster: {} followers, W={}, R={}",
            config.followers, config.write_quorum, config.read_quorum
        );

        let leader = NodeDescriptor {
            node_id: "leader".into(),
            role: Role::Leader,
            host: config.host.clone(),
            port: config.node_base_port + 1,
            startup_epoch: 0,
        };
        self.spawn_process(&bin, leader.clone(), Duration::ZERO)?;
        self.wait_ready(&leader).await?;
        self.attach_leader(leader);

        for i in 1..=config.followers {
            let descriptor = NodeDescriptor {
                node_id: format!("follower-{i}"),
                role: Role::Follower,
                host: config.host.clone(),
                port: config.node_base_port + 1 + i as u16,
                startup_epoch: 0,
            };
            let delay =
                if i <= config.write_quorum { config.sync_delay } else { config.async_delay };
            self.spawn_process(&bin, descriptor.clone(), delay)?;
            self.wait_ready(&descriptor).await?;
            self.attach_follower(descriptor);
        }
        info!("cluster up: leader plus {} followers", config.followers);
        Ok(())
    }

    fn spawn_process(
        &self,
        bin: &std::path::Path,
        descriptor: NodeDescriptor,
        delay: Duration,
    ) -> Result<()> {
        // Reap any previous process for this id before rebinding its port.
        self.0.children.lock().expect("children lock poisoned").remove(&descriptor.node_id);
        let child =
            NodeProcess::spawn(bin, descriptor.clone(), self.0.config.registry.as_deref(), delay)?;
        self.0
            .children
            .lock()
            .expect("children lock poisoned")
            .insert(descriptor.node_id.clone(), child);
        Ok(())
    }

    /// Polls a node's health endpoint until it answers or the readiness
    /// deadline expires.
    async fn wait_ready(&self, descriptor: &NodeDescriptor) -> Result<()> {
        let client = NodeClient::new(self.0.http.clone(), descriptor.url());
        let started = Instant::now();
        loop {
            match client.health().await {
                Ok(_) => return Ok(()),
                Err(_) if started.elapsed() < SPAWN_READY_TIMEOUT => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => {
                    return Err(Error::Unavailable(format!(
                        "node {} not ready after {SPAWN_READY_TIMEOUT:?}: {e}",
                        descriptor.node_id
                    )))
                }
            }
        }
    }

    /// Background task: checks every node's health and updates liveness in
    /// the layout. This keeps write/read quorum checks off the network hot
    /// path.
    async fn health_loop(self) {
        let mut ticker = tokio::time::interval(self.0.config.health_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let targets: Vec<NodeDescriptor> = {
                let layout = self.0.layout.read().expect("layout lock poisoned");
                layout
                    .leader
                    .iter()
                    .chain(layout.followers.values())
                    .map(|n| n.descriptor.clone())
                    .collect()
            };
            let checks = join_all(targets.into_iter().map(|descriptor| {
                let client = NodeClient::new(self.0.http.clone(), descriptor.url());
                async move {
                    let alive = client.health().await.is_ok();
                    (descriptor, alive)
                }
            }))
            .await;

            let mut layout = self.0.layout.write().expect("layout lock poisoned");
            for (descriptor, alive) in checks {
                let node = if descriptor.role == Role::Leader {
                    layout.leader.as_mut().filter(|l| l.descriptor.node_id == descriptor.node_id)
                } else {
                    layout.followers.get_mut(&descriptor.node_id)
                };
                if let Some(node) = node {
                    if node.alive != alive {
                        if alive {
                            info!("node {} is back up", descriptor.node_id);
                        } else {
                            warn!("node {} is down", descriptor.node_id);
                        }
                        node.alive = alive;
                    }
                }
            }
        }
    }

    /// Quorum write: requires W live followers, computes the sync set (the W
    /// smallest ports) and async set (the rest), and drives the leader. The
    /// leader's verdict is surfaced unchanged; failed writes are never
    /// retried here.
    async fn write(&self, req: ClientWriteRequest) -> Result<ClientWriteResponse> {
        if req.key.is_empty() {
            return errinput!("key must not be empty");
        }
        let w = self.0.config.write_quorum;
        let live = self.live_followers();
        if live.len() < w {
            return Err(Error::QuorumUnavailable(format!("{} live followers < W={w}", live.len())));
        }
        let Some(leader) = self.live_leader() else {
            return Err(Error::QuorumUnavailable("leader is not alive".into()));
        };

        let sync_set = quorum::sync_set(&live, w);
        let async_set = quorum::async_set(&live, w);
        debug!(
            "write {}: sync={:?} async={:?}",
            req.key,
            sync_set.iter().map(|f| &f.node_id).collect::<Vec<_>>(),
            async_set.iter().map(|f| &f.node_id).collect::<Vec<_>>()
        );

        let request = WriteRequest {
            key: req.key,
            value: req.value,
            sync_followers: sync_set.iter().map(|f| f.url()).collect(),
            async_followers: async_set.iter().map(|f| f.url()).collect(),
        };
        let client = NodeClient::new(self.0.http.clone(), leader.url());
        let resp = client.write(&request, LEADER_WRITE_TIMEOUT).await?;

        // Map acked URLs back to follower ids for the client.
        let synced_followers = resp
            .sync_acked_by
            .iter()
            .filter_map(|url| sync_set.iter().find(|f| &f.url() == url))
            .map(|f| f.node_id.clone())
            .collect();
        Ok(ClientWriteResponse {
            key: resp.key,
            version: resp.version,
            sync_acks: resp.sync_acks,
            synced_followers,
        })
    }

    /// Quorum read: queries the R live followers with the largest ports in
    /// parallel and returns the freshest answer. A follower's not-found
    /// still counts as an answer; peers that fail or time out do not.
    async fn read(&self, key: String) -> Result<ClientReadResponse> {
        let r = self.0.config.read_quorum;
        let live = self.live_followers();
        if live.len() < r {
            return Err(Error::QuorumUnavailable(format!(
                "{} live followers < R={r}",
                live.len()
            )));
        }

        let read_set = quorum::read_set(&live, r);
        let mut outcomes = self.query_followers(&read_set, &key).await;
        let mut answers = outcomes.iter().filter(|o| o.is_some()).count();

        // Optional fallback: pull in spare followers outside the read set
        // until R answers are collected.
        if answers < r && self.0.config.read_retry {
            for spare in quorum::read_spares(&live, r) {
                let outcome = self.query_followers(&[spare], &key).await.pop().flatten();
                if outcome.is_some() {
                    answers += 1;
                }
                outcomes.push(outcome);
                if answers >= r {
                    break;
                }
            }
        }

        if answers < r {
            return Err(Error::QuorumUnavailable(format!(
                "{answers} of {r} read-quorum answers for '{key}'"
            )));
        }

        let best = outcomes
            .into_iter()
            .flatten()
            .flatten()
            .max_by_key(|resp: &ReadResponse| resp.version);
        match best {
            Some(resp) => Ok(ClientReadResponse {
                key: resp.key,
                value: resp.value,
                version: resp.version,
                source_node_id: resp.node_id,
            }),
            None => Err(Error::NotFound(format!("key '{key}'"))),
        }
    }

    /// Queries followers in parallel. The outer Option is whether the
    /// follower answered at all, the inner whether it holds the key.
    async fn query_followers(
        &self,
        followers: &[NodeDescriptor],
        key: &str,
    ) -> Vec<Option<Option<ReadResponse>>> {
        join_all(followers.iter().map(|descriptor| {
            let client = NodeClient::new(self.0.http.clone(), descriptor.url());
            let node_id = descriptor.node_id.clone();
            let key = key.to_string();
            async move {
                match client.read(&key, READ_TIMEOUT).await {
                    Ok(resp) => Some(Some(resp)),
                    Err(Error::NotFound(_)) => Some(None),
                    Err(e) => {
                        debug!("read of '{key}' from {node_id} failed: {e}");
                        None
                    }
                }
            }
        }))
        .await
    }

    /// Spawns a follower. A pruned or dead follower id is respawned on its
    /// original port with a bumped startup epoch, keeping the topology
    /// stable; otherwise the next follower-K id and port are allocated.
    /// Catch-up runs before the follower joins the active set.
    async fn spawn(&self, hint: Option<String>) -> Result<SpawnResponse> {
        let _guard = self.0.spawn_lock.lock().await;
        let bin = self.node_bin()?;
        let config = &self.0.config;

        let (descriptor, was_respawn) = {
            let layout = self.0.layout.read().expect("layout lock poisoned");
            let target = match &hint {
                Some(id) => match layout.followers.get(id) {
                    Some(node) if !node.alive => Some(node.clone()),
                    Some(_) => return errinput!("follower {id} is still alive"),
                    None => return Err(Error::NotFound(format!("follower '{id}'"))),
                },
                None => {
                    let mut dead: Vec<_> =
                        layout.followers.values().filter(|f| !f.alive).collect();
                    dead.sort_by_key(|f| f.descriptor.port);
                    dead.first().map(|f| (*f).clone())
                }
            };
            match target {
                Some(node) => {
                    let mut descriptor = node.descriptor.clone();
                    descriptor.startup_epoch += 1;
                    (descriptor, true)
                }
                None => {
                    let index = layout.next_follower + 1;
                    let descriptor = NodeDescriptor {
                        node_id: format!("follower-{index}"),
                        role: Role::Follower,
                        host: config.host.clone(),
                        port: config.node_base_port + 1 + index as u16,
                        startup_epoch: 0,
                    };
                    (descriptor, false)
                }
            }
        };

        // The replication delay depends on whether the follower's port lands
        // in the sync set (the W smallest ports of the resulting topology).
        let delay = {
            let layout = self.0.layout.read().expect("layout lock poisoned");
            let mut ports: Vec<u16> =
                layout.followers.values().map(|f| f.descriptor.port).collect();
            if !ports.contains(&descriptor.port) {
                ports.push(descriptor.port);
            }
            ports.sort_unstable();
            let rank = ports.iter().position(|&p| p == descriptor.port).unwrap_or(ports.len());
            if rank < config.write_quorum {
                config.sync_delay
            } else {
                config.async_delay
            }
        };

        info!(
            "spawning {} on port {} (respawn: {was_respawn}, epoch {})",
            descriptor.node_id, descriptor.port, descriptor.startup_epoch
        );
        self.spawn_process(&bin, descriptor.clone(), delay)?;
        self.wait_ready(&descriptor).await?;

        // Catch the follower up from the leader's snapshot before it counts
        // as a replication target.
        if let Some(leader) = self.live_leader() {
            let leader_client = NodeClient::new(self.0.http.clone(), leader.url());
            match leader_client.health().await {
                Ok(health) if health.record_count > 0 => {
                    catchup::run(&self.0.http, &leader.url(), &descriptor.url()).await?;
                }
                Ok(_) => debug!("leader holds no data, skipping catch-up"),
                Err(e) => warn!("cannot check leader for catch-up: {e}"),
            }
        }

        let mut layout = self.0.layout.write().expect("layout lock poisoned");
        if let Some(index) = follower_index(&descriptor.node_id) {
            layout.next_follower = layout.next_follower.max(index);
        }
        layout.followers.insert(
            descriptor.node_id.clone(),
            ManagedNode { descriptor: descriptor.clone(), alive: true },
        );
        Ok(SpawnResponse {
            node_id: descriptor.node_id,
            port: descriptor.port,
            was_respawn,
        })
    }

    /// Kills a follower process with a signal. The registry is not told; it
    /// observes the heartbeat gap exactly as it would for a real crash.
    fn kill(&self, node_id: &str) -> Result<OkResponse> {
        if node_id == "leader" {
            return errinput!("the leader cannot be killed");
        }
        let known = {
            let layout = self.0.layout.read().expect("layout lock poisoned");
            layout.followers.contains_key(node_id)
        };
        let mut children = self.0.children.lock().expect("children lock poisoned");
        match children.remove(node_id) {
            Some(mut child) => {
                child.kill()?;
                info!("killed {node_id}");
                Ok(OkResponse { ok: true })
            }
            None if known => errinput!("follower {node_id} is not managed by this coordinator"),
            None => Err(Error::NotFound(format!("follower '{node_id}'"))),
        }
    }

    fn status(&self) -> ClusterStatus {
        let config = &self.0.config;
        let layout = self.0.layout.read().expect("layout lock poisoned");
        let live: Vec<NodeDescriptor> =
            layout.followers.values().filter(|f| f.alive).map(|f| f.descriptor.clone()).collect();
        let leader_alive = layout.leader.as_ref().is_some_and(|l| l.alive);
        let ids = |set: Vec<NodeDescriptor>| set.into_iter().map(|f| f.node_id).collect();
        ClusterStatus {
            leader: layout.leader.as_ref().map(|l| LeaderStatus {
                node_id: l.descriptor.node_id.clone(),
                url: l.descriptor.url(),
                alive: l.alive,
            }),
            followers: layout
                .followers
                .values()
                .map(|f| FollowerStatus {
                    node_id: f.descriptor.node_id.clone(),
                    url: f.descriptor.url(),
                    port: f.descriptor.port,
                    alive: f.alive,
                    startup_epoch: f.descriptor.startup_epoch,
                })
                .collect(),
            quorum: QuorumStatus {
                write_quorum: config.write_quorum,
                read_quorum: config.read_quorum,
                live_followers: live.len(),
                can_write: leader_alive && live.len() >= config.write_quorum,
                can_read: live.len() >= config.read_quorum,
            },
            sync_set: ids(quorum::sync_set(&live, config.write_quorum)),
            async_set: ids(quorum::async_set(&live, config.write_quorum)),
            read_set: ids(quorum::read_set(&live, config.read_quorum)),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/write", post(write))
            .route("/read/:key", get(read))
            .route("/status", get(status))
            .route("/spawn", post(spawn))
            .route("/kill/:node_id", post(kill))
            .route("/catchup", post(catchup_trigger))
            .with_state(self.clone())
    }

    /// Serves the coordinator API, with the health loop running in the
    /// background. On SIGINT/SIGTERM, stops every node process it spawned
    /// before exiting, so the cluster does not leak orphans.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!("coordinator listening on {addr}");
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.health_loop().await });
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        info!("coordinator shutting down, stopping node processes");
        self.0.children.lock().expect("children lock poisoned").clear();
        Ok(())
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
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
}

async fn write(
    State(coordinator): State<Coordinator>,
    Body(req): Body<ClientWriteRequest>,
) -> Result<Json<ClientWriteResponse>> {
    coordinator.write(req).await.map(Json)
}

async fn read(
    State(coordinator): State<Coordinator>,
    Path(key): Path<String>,
) -> Result<Json<ClientReadResponse>> {
    coordinator.read(key).await.map(Json)
}

async fn status(State(coordinator): State<Coordinator>) -> Json<ClusterStatus> {
    Json(coordinator.status())
}

async fn spawn(
    State(coordinator): State<Coordinator>,
    body: Option<Body<SpawnRequest>>,
) -> Result<Json<SpawnResponse>> {
    let hint = body.and_then(|Body(req)| req.node_id);
    coordinator.spawn(hint).await.map(Json)
}

async fn kill(
    State(coordinator): State<Coordinator>,
    Path(node_id): Path<String>,
) -> Result<Json<OkResponse>> {
    coordinator.kill(&node_id).map(Json)
}

/// Runs catch-up for a follower, typically on a hint from the registry after
/// the follower (re)appeared.
async fn catchup_trigger(
    State(coordinator): State<Coordinator>,
    Body(req): Body<CatchupRequest>,
) -> Result<Json<CatchupResponse>> {
    let Some(leader) = coordinator.live_leader() else {
        return Err(Error::Unavailable("no live leader for catch-up".into()));
    };
    let url = match &req.url {
        Some(url) => url.clone(),
        None => {
            let layout = coordinator.0.layout.read().expect("layout lock poisoned");
            match layout.followers.get(&req.node_id) {
                Some(follower) => follower.descriptor.url(),
                None => return Err(Error::NotFound(format!("follower '{}'", req.node_id))),
            }
        }
    };
    let keys_loaded = catchup::run(&coordinator.0.http, &leader.url(), &url).await?;
    Ok(Json(CatchupResponse { node_id: req.node_id, keys_loaded }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn descriptor(node_id: &str, role: Role, port: u16) -> NodeDescriptor {
        NodeDescriptor {
            node_id: node_id.into(),
            role,
            host: "127.0.0.1".into(),
            port,
            startup_epoch: 0,
        }
    }

    fn coordinator(w: usize, r: usize) -> Coordinator {
        let config = CoordinatorConfig { write_quorum: w, read_quorum: r, ..Default::default() };
        Coordinator::new(config)
    }

    #[tokio::test]
    async fn write_without_quorum_is_rejected() {
        let coordinator = coordinator(2, 1);
        coordinator.attach_leader(descriptor("leader", Role::Leader, 7001));
        coordinator.attach_follower(descriptor("follower-1", Role::Follower, 7002));
        let err = coordinator
            .write(ClientWriteRequest { key: "a".into(), value: "1".into() })
            .await
            .expect_err("write should fail");
        assert!(matches!(err, Error::QuorumUnavailable(_)), "unexpected error {err:?}");
    }

    #[tokio::test]
    async fn write_without_live_leader_is_rejected() {
        let coordinator = coordinator(1, 1);
        coordinator.attach_follower(descriptor("follower-1", Role::Follower, 7002));
        let err = coordinator
            .write(ClientWriteRequest { key: "a".into(), value: "1".into() })
            .await
            .expect_err("write should fail");
        assert!(matches!(err, Error::QuorumUnavailable(_)));
    }

    #[tokio::test]
    async fn read_without_quorum_is_rejected() {
        let coordinator = coordinator(1, 2);
        coordinator.attach_follower(descriptor("follower-1", Role::Follower, 7002));
        let err = coordinator.read("a".into()).await.expect_err("read should fail");
        assert!(matches!(err, Error::QuorumUnavailable(_)));
    }

    #[test]
    fn status_reports_quorum_sets_and_liveness() {
        let coordinator = coordinator(2, 2);
        coordinator.attach_leader(descriptor("leader", Role::Leader, 7001));
        for i in 1..=3u16 {
            coordinator.attach_follower(descriptor(
                &format!("follower-{i}"),
                Role::Follower,
                7001 + i,
            ));
        }
        let status = coordinator.status();
        assert!(status.quorum.can_write);
        assert!(status.quorum.can_read);
        assert_eq!(status.quorum.live_followers, 3);
        assert_eq!(status.sync_set, vec!["follower-1", "follower-2"]);
        assert_eq!(status.async_set, vec!["follower-3"]);
        assert_eq!(status.read_set, vec!["follower-3", "follower-2"]);
    }

    #[test]
    fn kill_of_unknown_follower_is_not_found() {
        let coordinator = coordinator(1, 1);
        assert!(matches!(coordinator.kill("follower-9"), Err(Error::NotFound(_))));
        assert!(matches!(coordinator.kill("leader"), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn follower_index_parses_only_follower_ids() {
        assert_eq!(follower_index("follower-3"), Some(3));
        assert_eq!(follower_index("leader"), None);
        assert_eq!(follower_index("follower-x"), None);
    }
}

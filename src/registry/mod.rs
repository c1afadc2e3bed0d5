//! The membership registry: receives node heartbeats, prunes nodes that go
//! silent past the threshold, and optionally respawns pruned followers via
//! the coordinator after a cool-down. The pruner is the single background
//! writer; heartbeat handlers are the concurrent foreground writers; both
//! take the same table mutex, and external reads see consistent snapshots.

use crate::api::{
    Body, HeartbeatResponse, MembershipEntry, MembershipState, NodeDescriptor, OkResponse, Role,
    SpawnRequest,
};
use crate::client::CoordinatorClient;
use crate::error::Result;
use crate::node::HEARTBEAT_INTERVAL;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

/// How often the pruner scans the table.
const PRUNE_INTERVAL: Duration = Duration::from_secs(1);

/// Default silence threshold before a node is pruned.
pub const DEFAULT_PRUNE_THRESHOLD: Duration = Duration::from_secs(5);

/// A node is reported as suspected-dead once it misses two heartbeats,
/// before the prune threshold elapses.
const SUSPECT_AFTER: Duration = Duration::from_secs(2 * HEARTBEAT_INTERVAL.as_secs());

#[derive(Clone)]
pub struct RegistryConfig {
    /// Coordinator base URL for catch-up hints and respawn requests.
    pub coordinator: Option<String>,
    pub prune_threshold: Duration,
    pub prune_interval: Duration,
    pub auto_spawn: bool,
    /// Cool-down between pruning a follower and requesting its respawn. Must
    /// exceed prune_threshold + heartbeat interval, or a transiently-delayed
    /// heartbeat can produce a duplicate process (the ghost-node failure
    /// mode).
    pub spawn_delay: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            coordinator: None,
            prune_threshold: DEFAULT_PRUNE_THRESHOLD,
            prune_interval: PRUNE_INTERVAL,
            auto_spawn: false,
            spawn_delay: Duration::from_secs(10),
        }
    }
}

struct Member {
    descriptor: NodeDescriptor,
    last_heartbeat: Instant,
    pruned: bool,
}

impl Member {
    /// The externally visible state, derived from heartbeat age.
    fn state(&self, now: Instant, suspect_after: Duration) -> MembershipState {
        if self.pruned {
            MembershipState::Pruned
        } else if now.duration_since(self.last_heartbeat) > suspect_after {
            MembershipState::SuspectedDead
        } else {
            MembershipState::Alive
        }
    }
}

/// A registry handle. Cheaply cloneable.
#[derive(Clone)]
pub struct Registry(Arc<Shared>);

struct Shared {
    config: RegistryConfig,
    members: Mutex<HashMap<String, Member>>,
    http: reqwest::Client,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        if config.auto_spawn
            && config.spawn_delay < config.prune_threshold + HEARTBEAT_INTERVAL
        {
            // Deliberately allowed: short delays demonstrate ghost nodes.
            warn!(
                "spawn delay {:?} is below prune threshold {:?} + heartbeat interval; \
                 a delayed heartbeat can cause duplicate processes",
                config.spawn_delay, config.prune_threshold
            );
        }
        Self(Arc::new(Shared {
            config,
            members: Mutex::new(HashMap::new()),
            http: reqwest::Client::new(),
        }))
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/heartbeat", post(heartbeat))
            .route("/deregister", post(deregister))
            .route("/nodes", get(nodes))
            .route("/alive", get(alive))
            .with_state(self.clone())
    }

    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!(
            "registry listening on {addr} (prune threshold {:?}, auto-spawn {})",
            self.0.config.prune_threshold, self.0.config.auto_spawn
        );
        let registry = self.clone();
        tokio::spawn(async move { registry.prune_loop().await });
        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Records a heartbeat. New and resurrected followers additionally emit
    /// a catch-up hint to the coordinator.
    fn record_heartbeat(&self, descriptor: NodeDescriptor) -> (bool, Vec<NodeDescriptor>) {
        let mut members = self.0.members.lock().expect("members lock poisoned");
        let needs_catchup = match members.get(&descriptor.node_id) {
            None => {
                info!(
                    "node {} ({}) registered at {}",
                    descriptor.node_id,
                    descriptor.role,
                    descriptor.url()
                );
                descriptor.role == Role::Follower
            }
            Some(member) if member.pruned => {
                info!("pruned node {} re-registered, resurrecting", descriptor.node_id);
                descriptor.role == Role::Follower
            }
            Some(_) => false,
        };
        // last_heartbeat only moves forward: it is always stamped with the
        // receipt time.
        members.insert(
            descriptor.node_id.clone(),
            Member { descriptor, last_heartbeat: Instant::now(), pruned: false },
        );
        let alive = alive_descriptors(&members);
        (needs_catchup, alive)
    }

    /// Background task: scans the table every interval and prunes silent
    /// nodes. Pruned followers are handed to the respawner when auto-spawn
    /// is on.
    async fn prune_loop(self) {
        let mut ticker = tokio::time::interval(self.0.config.prune_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let pruned = {
                let mut members = self.0.members.lock().expect("members lock poisoned");
                prune_expired(&mut members, Instant::now(), self.0.config.prune_threshold)
            };
            for descriptor in pruned {
                warn!(
                    "node {} missed heartbeats past {:?}, pruned",
                    descriptor.node_id, self.0.config.prune_threshold
                );
                if self.0.config.auto_spawn && descriptor.role == Role::Follower {
                    let registry = self.clone();
                    tokio::spawn(async move { registry.respawn_after_delay(descriptor).await });
                }
            }
        }
    }

    /// Waits out the spawn cool-down, then asks the coordinator to respawn
    /// the follower under its original id and port. Skipped if the node
    /// resurrected in the meantime.
    async fn respawn_after_delay(self, descriptor: NodeDescriptor) {
        tokio::time::sleep(self.0.config.spawn_delay).await;
        {
            let members = self.0.members.lock().expect("members lock poisoned");
            match members.get(&descriptor.node_id) {
                Some(member) if member.pruned => {}
                _ => {
                    info!(
                        "node {} recovered during spawn delay, not respawning",
                        descriptor.node_id
                    );
                    return;
                }
            }
        }
        let Some(coordinator) = self.0.config.coordinator.clone() else {
            warn!("auto-spawn enabled but no coordinator configured");
            return;
        };
        info!("requesting respawn of {} from coordinator", descriptor.node_id);
        let client = CoordinatorClient::new(self.0.http.clone(), coordinator);
        let request = SpawnRequest { node_id: Some(descriptor.node_id.clone()) };
        if let Err(e) = client.spawn(&request).await {
            warn!("respawn request for {} failed: {e}", descriptor.node_id);
        }
    }

    /// Emits a catch-up hint for a follower to the coordinator, detached.
    fn hint_catchup(&self, node_id: String, url: String) {
        let Some(coordinator) = self.0.config.coordinator.clone() else {
            return;
        };
        let http = self.0.http.clone();
        tokio::spawn(async move {
            debug!("hinting catch-up for {node_id} to coordinator");
            let client = CoordinatorClient::new(http, coordinator);
            let request = crate::api::CatchupRequest { node_id: node_id.clone(), url: Some(url) };
            if let Err(e) = client.catchup(&request).await {
                warn!("catch-up hint for {node_id} failed: {e}");
            }
        });
    }
}

/// Prunes alive members whose heartbeat age exceeds the threshold, returning
/// their descriptors. Pruned entries stay in the table; only a successful
/// re-registration clears them.
fn prune_expired(
    members: &mut HashMap<String, Member>,
    now: Instant,
    threshold: Duration,
) -> Vec<NodeDescriptor> {
    let mut pruned = Vec::new();
    for member in members.values_mut() {
        if !member.pruned && now.duration_since(member.last_heartbeat) > threshold {
            member.pruned = true;
            pruned.push(member.descriptor.clone());
        }
    }
    pruned
}

fn alive_descriptors(members: &HashMap<String, Member>) -> Vec<NodeDescriptor> {
    members.values().filter(|m| !m.pruned).map(|m| m.descriptor.clone()).collect()
}

async fn heartbeat(
    State(registry): State<Registry>,
    Body(descriptor): Body<NodeDescriptor>,
) -> Result<Json<HeartbeatResponse>> {
    if descriptor.node_id.is_empty() {
        return Err(crate::error::Error::InvalidInput("node_id must not be empty".into()));
    }
    let url = descriptor.url();
    let node_id = descriptor.node_id.clone();
    let (needs_catchup, alive) = registry.record_heartbeat(descriptor);
    if needs_catchup {
        registry.hint_catchup(node_id, url);
    }
    Ok(Json(HeartbeatResponse { ok: true, alive }))
}

async fn deregister(
    State(registry): State<Registry>,
    Body(req): Body<crate::api::DeregisterRequest>,
) -> Json<OkResponse> {
    let mut members = registry.0.members.lock().expect("members lock poisoned");
    if members.remove(&req.node_id).is_some() {
        info!("node {} deregistered", req.node_id);
    }
    Json(OkResponse { ok: true })
}

async fn nodes(State(registry): State<Registry>) -> Json<Vec<MembershipEntry>> {
    let members = registry.0.members.lock().expect("members lock poisoned");
    let now = Instant::now();
    let mut entries: Vec<MembershipEntry> = members
        .values()
        .map(|member| MembershipEntry {
            node_id: member.descriptor.node_id.clone(),
            role: member.descriptor.role,
            host: member.descriptor.host.clone(),
            port: member.descriptor.port,
            startup_epoch: member.descriptor.startup_epoch,
            state: member.state(now, SUSPECT_AFTER),
            last_seen_s: now.duration_since(member.last_heartbeat).as_secs_f64(),
        })
        .collect();
    entries.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    Json(entries)
}

async fn alive(State(registry): State<Registry>) -> Json<Vec<NodeDescriptor>> {
    let members = registry.0.members.lock().expect("members lock poisoned");
    let mut alive = alive_descriptors(&members);
    alive.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    Json(alive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn descriptor(node_id: &str, port: u16) -> NodeDescriptor {
        NodeDescriptor {
            node_id: node_id.into(),
            role: Role::Follower,
            host: "127.0.0.1".into(),
            port,
            startup_epoch: 0,
        }
    }

    fn member(node_id: &str, last_heartbeat: Instant) -> Member {
        Member { descriptor: descriptor(node_id, 7002), last_heartbeat, pruned: false }
    }

    #[test]
    fn prune_expired_transitions_only_stale_members() {
        let now = Instant::now();
        let mut members = HashMap::new();
        members.insert("fresh".to_string(), member("fresh", now));
        members.insert("stale".to_string(), member("stale", now - Duration::from_secs(6)));

        let pruned = prune_expired(&mut members, now, Duration::from_secs(5));
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].node_id, "stale");
        assert!(members["stale"].pruned);
        assert!(!members["fresh"].pruned);

        // A second scan does not re-prune.
        let pruned = prune_expired(&mut members, now, Duration::from_secs(5));
        assert!(pruned.is_empty());
    }

    #[test]
    fn heartbeat_resurrects_pruned_member() {
        let registry = Registry::new(RegistryConfig::default());
        registry.record_heartbeat(descriptor("follower-1", 7002));
        {
            let mut members = registry.0.members.lock().unwrap();
            members.get_mut("follower-1").unwrap().pruned = true;
        }
        let (needs_catchup, alive) = registry.record_heartbeat(descriptor("follower-1", 7002));
        assert!(needs_catchup);
        assert_eq!(alive.len(), 1);
        assert!(!registry.0.members.lock().unwrap()["follower-1"].pruned);
    }

    #[test]
    fn first_follower_heartbeat_needs_catchup_but_repeat_does_not() {
        let registry = Registry::new(RegistryConfig::default());
        let (needs, _) = registry.record_heartbeat(descriptor("follower-1", 7002));
        assert!(needs);
        let (needs, _) = registry.record_heartbeat(descriptor("follower-1", 7002));
        assert!(!needs);
    }

    #[test]
    fn leader_heartbeats_never_hint_catchup() {
        let registry = Registry::new(RegistryConfig::default());
        let mut desc = descriptor("leader", 7001);
        desc.role = Role::Leader;
        let (needs, _) = registry.record_heartbeat(desc);
        assert!(!needs);
    }

    #[test]
    fn member_state_derivation() {
        let now = Instant::now();
        let suspect_after = Duration::from_secs(4);
        let mut m = member("n", now);
        assert_eq!(m.state(now, suspect_after), MembershipState::Alive);
        m.last_heartbeat = now - Duration::from_secs(5);
        assert_eq!(m.state(now, suspect_after), MembershipState::SuspectedDead);
        m.pruned = true;
        assert_eq!(m.state(now, suspect_after), MembershipState::Pruned);
    }
}

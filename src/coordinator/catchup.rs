//! Catch-up: brings a freshly started or resurrected follower to a recent
//! state by copying the leader's full snapshot into it via the bulk-load
//! endpoint, which bypasses the replication delay. Writes accepted while the
//! copy is in flight may or may not land on the follower; once it re-enters
//! the normal replication path, subsequent writes close the gap.

use crate::client::NodeClient;
use crate::error::Result;

use log::info;

/// Copies the leader's snapshot into the follower. Returns the number of
/// records the follower actually applied; records it already held at newer
/// versions are left alone, so running catch-up twice cannot regress keys.
pub async fn run(http: &reqwest::Client, leader_url: &str, follower_url: &str) -> Result<usize> {
    let leader = NodeClient::new(http.clone(), leader_url);
    let snapshot = leader.snapshot().await?;
    let keys = snapshot.records.len();
    info!("catch-up: copying {keys} records from {leader_url} to {follower_url}");

    let follower = NodeClient::new(http.clone(), follower_url);
    let loaded = follower.bulk_load(&snapshot).await?.loaded;
    info!("catch-up: {follower_url} applied {loaded} of {keys} records");
    Ok(loaded)
}

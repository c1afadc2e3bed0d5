//! Quorum set selection. The rules are deliberately literal: the sync set is
//! the W live followers with the smallest ports, the read set the R with the
//! largest. With disjoint ends, the two sets overlap in at least one
//! follower exactly when W + R > N, which is what makes the overlap property
//! visually obvious in the workshop demos. Do not replace with random or
//! hash-based selection.

use crate::api::NodeDescriptor;

use itertools::Itertools as _;

/// Followers sorted by ascending port, with the node id as a deterministic
/// tie-break (ports are unique within a run, so the tie-break is for safety
/// only).
fn by_port(live: &[NodeDescriptor]) -> Vec<NodeDescriptor> {
    live.iter().cloned().sorted_by_key(|f| (f.port, f.node_id.clone())).collect()
}

/// The W live followers with the smallest ports. Their acks count toward the
/// write quorum and they receive the fast replication delay.
pub fn sync_set(live: &[NodeDescriptor], w: usize) -> Vec<NodeDescriptor> {
    by_port(live).into_iter().take(w).collect()
}

/// All live followers not in the sync set. They receive the slow replication
/// delay and their acks are not awaited.
pub fn async_set(live: &[NodeDescriptor], w: usize) -> Vec<NodeDescriptor> {
    by_port(live).into_iter().skip(w).collect()
}

/// The R live followers with the largest ports, queried in parallel on
/// reads.
pub fn read_set(live: &[NodeDescriptor], r: usize) -> Vec<NodeDescriptor> {
    let mut sorted = by_port(live);
    sorted.reverse();
    sorted.into_iter().take(r).collect()
}

/// Live followers outside the read set, usable as spares when read retries
/// are enabled.
pub fn read_spares(live: &[NodeDescriptor], r: usize) -> Vec<NodeDescriptor> {
    let mut sorted = by_port(live);
    sorted.reverse();
    sorted.into_iter().skip(r).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Role;
    use pretty_assertions::assert_eq;

    fn followers(ports: &[u16]) -> Vec<NodeDescriptor> {
        ports
            .iter()
            .enumerate()
            .map(|(i, &port)| NodeDescriptor {
                node_id: format!("follower-{}", i + 1),
                role: Role::Follower,
                host: "127.0.0.1".into(),
                port,
                startup_epoch: 0,
            })
            .collect()
    }

    fn ids(set: &[NodeDescriptor]) -> Vec<&str> {
        set.iter().map(|f| f.node_id.as_str()).collect()
    }

    #[test]
    fn sync_set_takes_smallest_ports() {
        let live = followers(&[7004, 7002, 7003]);
        assert_eq!(ids(&sync_set(&live, 2)), vec!["follower-2", "follower-3"]);
        assert_eq!(ids(&async_set(&live, 2)), vec!["follower-1"]);
    }

    #[test]
    fn read_set_takes_largest_ports() {
        let live = followers(&[7004, 7002, 7003]);
        assert_eq!(ids(&read_set(&live, 2)), vec!["follower-1", "follower-3"]);
        assert_eq!(ids(&read_spares(&live, 2)), vec!["follower-2"]);
    }

    #[test]
    fn oversized_quorums_return_everyone() {
        let live = followers(&[7002, 7003]);
        assert_eq!(sync_set(&live, 5).len(), 2);
        assert_eq!(read_set(&live, 5).len(), 2);
        assert!(async_set(&live, 5).is_empty());
    }

    /// With sets taken from opposite ends of the port order, the read and
    /// sync sets intersect iff W + R > N.
    #[test]
    fn sets_overlap_iff_quorums_intersect() {
        for n in 1..=5usize {
            let ports: Vec<u16> = (0..n as u16).map(|i| 7002 + i).collect();
            let live = followers(&ports);
            for w in 1..=n {
                for r in 1..=n {
                    let sync: Vec<_> =
                        sync_set(&live, w).into_iter().map(|f| f.node_id).collect();
                    let read: Vec<_> =
                        read_set(&live, r).into_iter().map(|f| f.node_id).collect();
                    let overlaps = read.iter().any(|id| sync.contains(id));
                    assert_eq!(
                        overlaps,
                        w + r > n,
                        "W={w} R={r} N={n}: sync={sync:?} read={read:?}"
                    );
                }
            }
        }
    }
}

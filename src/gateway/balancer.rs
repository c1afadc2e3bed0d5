//! Load balancing across upstream nodes with pluggable strategies. The
//! gateway maintains each upstream's active-request count and latency
//! average from its own observations; upstreams do not report anything.

use crate::api::{BalancerStats, UpstreamStats};
use crate::errinput;
use crate::error::Result;

/// An upstream node and the gateway's local view of its load.
pub struct Upstream {
    pub url: String,
    pub weight: u32,
    active: usize,
    total: u64,
    failures: u64,
    total_latency_ms: f64,
}

impl Upstream {
    pub fn new(url: impl Into<String>, weight: u32) -> Self {
        Self {
            url: url.into(),
            weight: weight.max(1),
            active: 0,
            total: 0,
            failures: 0,
            total_latency_ms: 0.0,
        }
    }

    fn avg_latency_ms(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.total_latency_ms / self.total as f64
        }
    }

    fn stats(&self) -> UpstreamStats {
        UpstreamStats {
            url: self.url.clone(),
            weight: self.weight,
            active_requests: self.active,
            total_requests: self.total,
            failures: self.failures,
            avg_latency_ms: self.avg_latency_ms(),
        }
    }
}

/// A load-balancing strategy: picks the index of the next upstream.
pub trait Strategy: Send {
    fn name(&self) -> &'static str;
    fn pick(&mut self, upstreams: &[Upstream]) -> usize;
}

/// Rotates through upstreams in order.
pub struct RoundRobin {
    counter: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self { counter: 0 }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn pick(&mut self, upstreams: &[Upstream]) -> usize {
        let index = self.counter % upstreams.len();
        self.counter = self.counter.wrapping_add(1);
        index
    }
}

/// Least-loaded selection: picks the upstream minimizing
/// active_requests + k * average latency, breaking ties round-robin. Good
/// for heterogeneous upstreams where some nodes are slower than others.
pub struct Adaptive {
    /// Weight of a millisecond of average latency relative to one in-flight
    /// request.
    latency_weight: f64,
    tiebreak: usize,
}

impl Adaptive {
    pub fn new(latency_weight: f64) -> Self {
        Self { latency_weight, tiebreak: 0 }
    }

    fn score(&self, upstream: &Upstream) -> f64 {
        upstream.active as f64 + self.latency_weight * upstream.avg_latency_ms()
    }
}

impl Strategy for Adaptive {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn pick(&mut self, upstreams: &[Upstream]) -> usize {
        let best = upstreams
            .iter()
            .map(|u| self.score(u))
            .fold(f64::INFINITY, f64::min);
        let tied: Vec<usize> = upstreams
            .iter()
            .enumerate()
            .filter(|(_, u)| self.score(u) <= best)
            .map(|(i, _)| i)
            .collect();
        let index = tied[self.tiebreak % tied.len()];
        self.tiebreak = self.tiebreak.wrapping_add(1);
        index
    }
}

/// Smooth weighted round-robin: each upstream is picked in proportion to its
/// static capacity weight, interleaved rather than in runs.
pub struct Weighted {
    current: Vec<i64>,
}

impl Weighted {
    pub fn new() -> Self {
        Self { current: Vec::new() }
    }
}

impl Default for Weighted {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for Weighted {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn pick(&mut self, upstreams: &[Upstream]) -> usize {
        if self.current.len() != upstreams.len() {
            self.current = vec![0; upstreams.len()];
        }
        let total: i64 = upstreams.iter().map(|u| u.weight as i64).sum();
        for (current, upstream) in self.current.iter_mut().zip(upstreams) {
            *current += upstream.weight as i64;
        }
        let index = self
            .current
            .iter()
            .enumerate()
            .max_by_key(|(_, &c)| c)
            .map(|(i, _)| i)
            .unwrap_or(0);
        self.current[index] -= total;
        index
    }
}

/// A load balancer over a fixed upstream list.
pub struct LoadBalancer {
    strategy: Box<dyn Strategy>,
    upstreams: Vec<Upstream>,
}

impl LoadBalancer {
    /// Creates a load balancer by strategy name: round-robin, adaptive or
    /// weighted.
    pub fn new(strategy: &str, upstreams: Vec<Upstream>) -> Result<Self> {
        if upstreams.is_empty() {
            return errinput!("at least one upstream is required");
        }
        let strategy: Box<dyn Strategy> = match strategy {
            "round-robin" | "round_robin" => Box::new(RoundRobin::new()),
            "adaptive" => Box::new(Adaptive::new(0.01)),
            "weighted" => Box::new(Weighted::new()),
            name => return errinput!("unknown load-balance strategy {name}"),
        };
        Ok(Self { strategy, upstreams })
    }

    /// Picks the next upstream and marks a request started on it. The caller
    /// must pair this with finish().
    pub fn pick(&mut self) -> (usize, String) {
        let index = if self.upstreams.len() == 1 { 0 } else { self.strategy.pick(&self.upstreams) };
        let upstream = &mut self.upstreams[index];
        upstream.active += 1;
        (index, upstream.url.clone())
    }

    /// Records a completed request against an upstream.
    pub fn finish(&mut self, index: usize, latency_ms: f64, success: bool) {
        let upstream = &mut self.upstreams[index];
        upstream.active = upstream.active.saturating_sub(1);
        upstream.total += 1;
        upstream.total_latency_ms += latency_ms;
        if !success {
            upstream.failures += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    pub fn stats(&self) -> BalancerStats {
        BalancerStats {
            strategy: self.strategy.name().into(),
            upstreams: self.upstreams.iter().map(|u| u.stats()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn upstreams(n: usize) -> Vec<Upstream> {
        (0..n).map(|i| Upstream::new(format!("http://127.0.0.1:{}", 5001 + i), 1)).collect()
    }

    fn picks(balancer: &mut LoadBalancer, n: usize) -> Vec<usize> {
        (0..n)
            .map(|_| {
                let (index, _) = balancer.pick();
                balancer.finish(index, 1.0, true);
                index
            })
            .collect()
    }

    #[test]
    fn round_robin_rotates() {
        let mut balancer = LoadBalancer::new("round-robin", upstreams(3)).unwrap();
        assert_eq!(picks(&mut balancer, 6), vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn adaptive_avoids_busy_upstream() {
        let mut balancer = LoadBalancer::new("adaptive", upstreams(2)).unwrap();
        // Occupy upstream 0 with an in-flight request.
        let (first, _) = balancer.pick();
        let (second, _) = balancer.pick();
        assert_ne!(first, second);
        balancer.finish(first, 1.0, true);
        balancer.finish(second, 1.0, true);
    }

    #[test]
    fn adaptive_avoids_slow_upstream() {
        let mut balancer = LoadBalancer::new("adaptive", upstreams(2)).unwrap();
        // Upstream 0 has a history of 500ms responses, upstream 1 is fast.
        let (index, _) = balancer.pick();
        balancer.finish(index, 500.0, true);
        let (index, _) = balancer.pick();
        balancer.finish(index, 1.0, true);
        // With scores settled, the fast upstream wins consistently.
        let (fast, _) = balancer.pick();
        balancer.finish(fast, 1.0, true);
        let slow_avg = balancer.stats().upstreams[0].avg_latency_ms;
        let fast_avg = balancer.stats().upstreams[1].avg_latency_ms;
        assert!(slow_avg > fast_avg);
        assert_eq!(fast, 1);
    }

    #[test]
    fn adaptive_breaks_ties_round_robin() {
        let mut balancer = LoadBalancer::new("adaptive", upstreams(3)).unwrap();
        // All upstreams idle and historyless: picks rotate.
        assert_eq!(picks(&mut balancer, 3), vec![0, 1, 2]);
    }

    #[test]
    fn weighted_is_proportional() {
        let upstreams = vec![
            Upstream::new("http://127.0.0.1:5001", 3),
            Upstream::new("http://127.0.0.1:5002", 1),
        ];
        let mut balancer = LoadBalancer::new("weighted", upstreams).unwrap();
        let picks = picks(&mut balancer, 8);
        let first = picks.iter().filter(|&&i| i == 0).count();
        let second = picks.iter().filter(|&&i| i == 1).count();
        assert_eq!((first, second), (6, 2));
        // Smooth interleaving, not a run of one upstream.
        assert_ne!(picks[..4], vec![0, 0, 0, 1][..]);
    }

    #[test]
    fn single_upstream_short_circuits() {
        let mut balancer = LoadBalancer::new("round-robin", upstreams(1)).unwrap();
        assert_eq!(picks(&mut balancer, 3), vec![0, 0, 0]);
    }

    #[test]
    fn unknown_strategy_is_invalid_input() {
        assert!(LoadBalancer::new("random", upstreams(1)).is_err());
        assert!(LoadBalancer::new("round-robin", vec![]).is_err());
    }

    #[test]
    fn finish_records_failures_and_latency() {
        let mut balancer = LoadBalancer::new("round-robin", upstreams(1)).unwrap();
        let (index, _) = balancer.pick();
        balancer.finish(index, 10.0, false);
        let stats = balancer.stats();
        assert_eq!(stats.upstreams[0].failures, 1);
        assert_eq!(stats.upstreams[0].total_requests, 1);
        assert_eq!(stats.upstreams[0].avg_latency_ms, 10.0);
        assert_eq!(stats.upstreams[0].active_requests, 0);
    }
}

//! Request rate limiting with pluggable strategies. Only the fixed-window
//! algorithm is implemented; it deliberately keeps the boundary-burst
//! weakness (a client can fit 2x the limit across a window edge), which the
//! sliding-window extension would fix.

use crate::api::LimiterStats;
use crate::errinput;
use crate::error::Result;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Rate limiter configuration, as parsed from CLI flags.
#[derive(Clone, Debug)]
pub struct LimiterConfig {
    pub strategy: String,
    pub max_requests: usize,
    pub window: Duration,
}

/// The outcome of a rate-limit check for one request.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: usize,
    /// Requests left in the current window after this one.
    pub remaining: usize,
    /// Seconds until the current window resets, in (0, window].
    pub retry_after: u64,
}

/// A rate-limiting strategy. Checks are driven with an explicit clock so the
/// window arithmetic is testable without sleeping.
pub trait Strategy: Send {
    fn name(&self) -> &'static str;
    fn check(&mut self, client_id: &str, now: Instant) -> Decision;
}

/// Fixed-window rate limiting: time is divided into windows of fixed length
/// per client, counting requests and resetting the counter when a new window
/// starts.
pub struct FixedWindow {
    max_requests: usize,
    window: Duration,
    buckets: HashMap<String, Bucket>,
}

struct Bucket {
    window_start: Instant,
    count: usize,
}

impl FixedWindow {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self { max_requests, window, buckets: HashMap::new() }
    }
}

impl Strategy for FixedWindow {
    fn name(&self) -> &'static str {
        "fixed-window"
    }

    fn check(&mut self, client_id: &str, now: Instant) -> Decision {
        let bucket = self
            .buckets
            .entry(client_id.to_string())
            .or_insert(Bucket { window_start: now, count: 0 });

        if now.duration_since(bucket.window_start) >= self.window {
            bucket.window_start = now;
            bucket.count = 0;
        }

        let elapsed = now.duration_since(bucket.window_start);
        // Round up so the hint is always in (0, window].
        let retry_after = (self.window - elapsed).as_secs_f64().ceil().max(1.0) as u64;

        if bucket.count < self.max_requests {
            bucket.count += 1;
            Decision {
                allowed: true,
                limit: self.max_requests,
                remaining: self.max_requests - bucket.count,
                retry_after,
            }
        } else {
            Decision { allowed: false, limit: self.max_requests, remaining: 0, retry_after }
        }
    }
}

/// A rate limiter with a pluggable strategy and aggregate counters.
pub struct RateLimiter {
    strategy: Box<dyn Strategy>,
    max_requests: usize,
    window: Duration,
    total_requests: u64,
    allowed_requests: u64,
    rejected_requests: u64,
}

impl RateLimiter {
    /// Creates a rate limiter by strategy name. Only "fixed-window" exists;
    /// unknown names are invalid input.
    pub fn new(config: &LimiterConfig) -> Result<Self> {
        let strategy: Box<dyn Strategy> = match config.strategy.as_str() {
            "fixed-window" | "fixed_window" => {
                Box::new(FixedWindow::new(config.max_requests, config.window))
            }
            name => return errinput!("unknown rate-limit strategy {name}"),
        };
        Ok(Self {
            strategy,
            max_requests: config.max_requests,
            window: config.window,
            total_requests: 0,
            allowed_requests: 0,
            rejected_requests: 0,
        })
    }

    pub fn check(&mut self, client_id: &str) -> Decision {
        self.check_at(client_id, Instant::now())
    }

    pub fn check_at(&mut self, client_id: &str, now: Instant) -> Decision {
        self.total_requests += 1;
        let decision = self.strategy.check(client_id, now);
        if decision.allowed {
            self.allowed_requests += 1;
        } else {
            self.rejected_requests += 1;
        }
        decision
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            strategy: self.strategy.name().into(),
            max_requests: self.max_requests,
            window_seconds: self.window.as_secs(),
            total_requests: self.total_requests,
            allowed_requests: self.allowed_requests,
            rejected_requests: self.rejected_requests,
        }
    }
}

/// A rate limiter shared with request handlers.
pub type SharedLimiter = Arc<Mutex<RateLimiter>>;

pub fn shared(config: &LimiterConfig) -> Result<SharedLimiter> {
    Ok(Arc::new(Mutex::new(RateLimiter::new(config)?)))
}

/// Identifies the client for rate-limiting purposes: an explicit
/// x-client-id header wins, else the source address.
fn client_id(req: &Request, addr: SocketAddr) -> String {
    req.headers()
        .get("x-client-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| addr.ip().to_string())
}

/// Axum middleware enforcing the rate limit before the request reaches any
/// handler. Both allowed and rejected responses carry the x-ratelimit-limit
/// and x-ratelimit-remaining headers; rejections get a Retry-After header
/// via the error response.
pub async fn middleware(
    State(limiter): State<SharedLimiter>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let client = client_id(&req, addr);
    let decision = limiter.lock().expect("limiter lock poisoned").check(&client);

    let mut response = if decision.allowed {
        next.run(req).await
    } else {
        log::info!("rate limited client {client}, retry after {}s", decision.retry_after);
        crate::error::Error::RateLimited { retry_after: decision.retry_after }.into_response()
    };

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert("x-ratelimit-limit", value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", value);
    }
    response
}

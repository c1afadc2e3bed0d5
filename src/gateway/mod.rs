//! The edge gateway: the single ingress for client traffic. Requests pass
//! through the rate limiter, then the load balancer picks an upstream (when
//! more than one is configured), then the request is forwarded and the
//! upstream response is returned verbatim, non-200 statuses included, so
//! quorum errors and rate-limit signals survive the hop.

pub mod balancer;
pub mod limiter;

use crate::api::{Body, ClientWriteRequest, GatewayStats, OkResponse};
use crate::errinput;
use crate::error::{Error, Result};
use balancer::{LoadBalancer, Upstream};
use limiter::LimiterConfig;

use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

/// Deadline for forwarded writes; generous because a quorum write can block
/// on the sync fan-out.
const FORWARD_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for forwarded reads.
const FORWARD_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// An upstream URL with an optional static capacity weight, parsed from
/// --upstream URL or URL*WEIGHT.
#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    pub url: String,
    pub weight: u32,
}

impl std::str::FromStr for UpstreamConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.rsplit_once('*') {
            Some((url, weight)) => {
                let weight: u32 = weight
                    .parse()
                    .map_err(|_| Error::InvalidInput(format!("invalid upstream weight in {s}")))?;
                if weight == 0 {
                    return errinput!("upstream weight must be positive in {s}");
                }
                Ok(Self { url: url.into(), weight })
            }
            None => Ok(Self { url: s.into(), weight: 1 }),
        }
    }
}

#[derive(Clone)]
pub struct GatewayConfig {
    pub upstreams: Vec<UpstreamConfig>,
    pub strategy: String,
    pub rate_limit: Option<LimiterConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            upstreams: vec![UpstreamConfig { url: "http://127.0.0.1:7000".into(), weight: 1 }],
            strategy: "round-robin".into(),
            rate_limit: None,
        }
    }
}

#[derive(Default)]
struct Metrics {
    total_requests: AtomicU64,
    forwarded_requests: AtomicU64,
    errors: AtomicU64,
}

/// A gateway handle. Cheaply cloneable.
#[derive(Clone)]
pub struct Gateway(Arc<Shared>);

struct Shared {
    config: GatewayConfig,
    http: reqwest::Client,
    limiter: Option<limiter::SharedLimiter>,
    balancer: Mutex<LoadBalancer>,
    metrics: Metrics,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let upstreams: Vec<Upstream> =
            config.upstreams.iter().map(|u| Upstream::new(u.url.clone(), u.weight)).collect();
        let balancer = Mutex::new(LoadBalancer::new(&config.strategy, upstreams)?);
        let limiter = config.rate_limit.as_ref().map(limiter::shared).transpose()?;
        Ok(Self(Arc::new(Shared {
            config,
            http: reqwest::Client::new(),
            limiter,
            balancer,
            metrics: Metrics::default(),
        })))
    }

    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/write", post(write))
            .route("/read/:key", get(read))
            .route("/cluster-status", get(cluster_status))
            .route("/health", get(health))
            .route("/stats", get(stats))
            .route("/graduate", get(graduate))
            .with_state(self.clone());
        if let Some(limiter) = &self.0.limiter {
            router =
                router.layer(middleware::from_fn_with_state(limiter.clone(), limiter::middleware));
        }
        // Outermost: counts every request, rate-limited ones included.
        router.layer(middleware::from_fn_with_state(self.clone(), count_requests))
    }

    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        let config = &self.0.config;
        info!(
            "gateway listening on {addr}, forwarding to {} upstream(s) ({}), rate limiting {}",
            config.upstreams.len(),
            config.strategy,
            if config.rate_limit.is_some() { "on" } else { "off" }
        );
        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Forwards a request to the next upstream and mirrors its response,
    /// recording latency and failure observations for the balancer.
    async fn forward(&self, method: reqwest::Method, path: &str, body: Option<serde_json::Value>) -> Response {
        self.0.metrics.forwarded_requests.fetch_add(1, Ordering::Relaxed);
        let (index, base) = self.0.balancer.lock().expect("balancer lock poisoned").pick();
        let url = format!("{base}{path}");
        debug!("forwarding {method} {url}");

        let timeout = if method == reqwest::Method::POST {
            FORWARD_WRITE_TIMEOUT
        } else {
            FORWARD_READ_TIMEOUT
        };
        let mut builder = self.0.http.request(method, &url).timeout(timeout);
        if let Some(body) = &body {
            builder = builder.json(body);
        }

        let started = Instant::now();
        let result = builder.send().await;
        let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                self.0.balancer.lock().expect("balancer lock poisoned").finish(
                    index, latency_ms, false,
                );
                self.0.metrics.errors.fetch_add(1, Ordering::Relaxed);
                warn!("upstream {base} unreachable: {e}");
                return Error::from(e).into_response();
            }
        };

        let status = resp.status();
        self.0
            .balancer
            .lock()
            .expect("balancer lock poisoned")
            .finish(index, latency_ms, !status.is_server_error());
        if !status.is_success() {
            self.0.metrics.errors.fetch_add(1, Ordering::Relaxed);
        }

        let bytes = match resp.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.0.metrics.errors.fetch_add(1, Ordering::Relaxed);
                return Error::from(e).into_response();
            }
        };
        let mut response = Response::new(axum::body::Body::from(bytes));
        *response.status_mut() =
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}

async fn write(State(gateway): State<Gateway>, Body(req): Body<ClientWriteRequest>) -> Response {
    let body = match serde_json::to_value(&req) {
        Ok(body) => body,
        Err(e) => return Error::from(e).into_response(),
    };
    gateway.forward(reqwest::Method::POST, "/write", Some(body)).await
}

async fn read(State(gateway): State<Gateway>, Path(key): Path<String>) -> Response {
    gateway.forward(reqwest::Method::GET, &format!("/read/{key}"), None).await
}

async fn cluster_status(State(gateway): State<Gateway>) -> Response {
    gateway.forward(reqwest::Method::GET, "/status", None).await
}

async fn health(State(_): State<Gateway>) -> Json<OkResponse> {
    Json(OkResponse { ok: true })
}

async fn stats(State(gateway): State<Gateway>) -> Json<GatewayStats> {
    let metrics = &gateway.0.metrics;
    let rate_limiter = gateway
        .0
        .limiter
        .as_ref()
        .map(|limiter| limiter.lock().expect("limiter lock poisoned").stats());
    let rate_limited_requests = rate_limiter.as_ref().map_or(0, |s| s.rejected_requests);
    // The balancer only matters when fronting multiple upstreams.
    let load_balancer = if gateway.0.config.upstreams.len() > 1 {
        Some(gateway.0.balancer.lock().expect("balancer lock poisoned").stats())
    } else {
        None
    };
    Json(GatewayStats {
        total_requests: metrics.total_requests.load(Ordering::Relaxed),
        forwarded_requests: metrics.forwarded_requests.load(Ordering::Relaxed),
        rate_limited_requests,
        errors: metrics.errors.load(Ordering::Relaxed),
        rate_limiter,
        load_balancer,
    })
}

const GRADUATION: &str = r"
  ============================================================
     CONGRATULATIONS! YOU ARE NOW A DISTRIBUTED SYSTEMS
                        ENGINEER!

     You have mastered:
       * Load Balancing (Round-Robin, Adaptive & Weighted)
       * Rate Limiting (Fixed Window Algorithm)
       * Single-Leader Replication
       * Quorum Reads & Writes
       * Service Discovery & Heartbeats
       * Fault Tolerance & Recovery

     'In distributed systems, everything fails all the time.
      The difference is whether you designed for it.'

     Now go build systems that survive chaos!
  ============================================================
";

async fn graduate() -> &'static str {
    GRADUATION
}

async fn count_requests(State(gateway): State<Gateway>, req: Request, next: Next) -> Response {
    gateway.0.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn upstream_config_parses_weights() {
        let upstream: UpstreamConfig = "http://127.0.0.1:7000".parse().unwrap();
        assert_eq!((upstream.url.as_str(), upstream.weight), ("http://127.0.0.1:7000", 1));
        let upstream: UpstreamConfig = "http://127.0.0.1:7000*3".parse().unwrap();
        assert_eq!((upstream.url.as_str(), upstream.weight), ("http://127.0.0.1:7000", 3));
        assert!("http://127.0.0.1:7000*0".parse::<UpstreamConfig>().is_err());
        assert!("http://127.0.0.1:7000*x".parse::<UpstreamConfig>().is_err());
    }

    #[test]
    fn gateway_requires_a_known_strategy() {
        let config = GatewayConfig { strategy: "fastest".into(), ..Default::default() };
        assert!(Gateway::new(config).is_err());
        assert!(Gateway::new(GatewayConfig::default()).is_ok());
    }
}

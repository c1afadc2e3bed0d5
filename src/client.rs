//! Typed HTTP clients for every component, sharing one reqwest client per
//! caller. Error responses are decoded back into crate errors via the wire
//! code in the JSON body, so a 503 from a peer surfaces as the same variant
//! it was raised as.

use crate::api::{
    BulkLoadResponse, CatchupRequest, CatchupResponse, ClientReadResponse, ClientWriteRequest,
    ClientWriteResponse, ClusterStatus, DeregisterRequest, ErrorBody, HealthResponse,
    HeartbeatResponse, MembershipEntry, NodeDescriptor, NodeStats, OkResponse, ReadResponse,
    ReplicateRequest, ReplicateResponse, Snapshot, SpawnRequest, SpawnResponse, WriteRequest,
    WriteResponse,
};
use crate::error::{Error, Result};

use rand::Rng;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;

/// Decodes a response, mapping non-success statuses to crate errors.
async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let body = resp.json::<ErrorBody>().await.unwrap_or_else(|_| ErrorBody {
        error: format!("peer returned status {status}"),
        code: String::new(),
        retry_after: None,
    });
    Err(Error::from_wire(status.as_u16(), &body.code, body.error, body.retry_after))
}

/// A client for a single node.
#[derive(Clone)]
pub struct NodeClient {
    http: reqwest::Client,
    url: String,
}

impl NodeClient {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self { http, url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Submits a client write to the leader. The timeout must cover the full
    /// sync fan-out deadline, which the leader caps at 60 seconds.
    pub async fn write(&self, request: &WriteRequest, timeout: Duration) -> Result<WriteResponse> {
        let resp = self
            .http
            .post(format!("{}/write", self.url))
            .timeout(timeout)
            .json(request)
            .send()
            .await?;
        decode(resp).await
    }

    /// Sends a replicated write to a follower.
    pub async fn replicate(
        &self,
        request: &ReplicateRequest,
        timeout: Duration,
    ) -> Result<ReplicateResponse> {
        let resp = self
            .http
            .post(format!("{}/replicate", self.url))
            .timeout(timeout)
            .json(request)
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn read(&self, key: &str, timeout: Duration) -> Result<ReadResponse> {
        let resp =
            self.http.get(format!("{}/read/{key}", self.url)).timeout(timeout).send().await?;
        decode(resp).await
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        let resp = self
            .http
            .get(format!("{}/snapshot", self.url))
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn bulk_load(&self, snapshot: &Snapshot) -> Result<BulkLoadResponse> {
        let resp = self
            .http
            .post(format!("{}/bulk-load", self.url))
            .timeout(Duration::from_secs(10))
            .json(snapshot)
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        let resp = self
            .http
            .get(format!("{}/health", self.url))
            .timeout(Duration::from_secs(2))
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn stats(&self) -> Result<NodeStats> {
        let resp = self
            .http
            .get(format!("{}/stats", self.url))
            .timeout(Duration::from_secs(2))
            .send()
            .await?;
        decode(resp).await
    }
}

/// A client for the registry.
#[derive(Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    url: String,
}

impl RegistryClient {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self { http, url: url.into() }
    }

    pub async fn heartbeat(&self, descriptor: &NodeDescriptor) -> Result<HeartbeatResponse> {
        let resp = self
            .http
            .post(format!("{}/heartbeat", self.url))
            .timeout(Duration::from_secs(2))
            .json(descriptor)
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn deregister(&self, node_id: &str) -> Result<OkResponse> {
        let resp = self
            .http
            .post(format!("{}/deregister", self.url))
            .timeout(Duration::from_secs(2))
            .json(&DeregisterRequest { node_id: node_id.into() })
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn nodes(&self) -> Result<Vec<MembershipEntry>> {
        let resp = self
            .http
            .get(format!("{}/nodes", self.url))
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn alive(&self) -> Result<Vec<NodeDescriptor>> {
        let resp = self
            .http
            .get(format!("{}/alive", self.url))
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        decode(resp).await
    }
}

/// A client for the coordinator, also usable against the gateway's mirrored
/// write/read surface.
#[derive(Clone)]
pub struct CoordinatorClient {
    http: reqwest::Client,
    url: String,
}

impl CoordinatorClient {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self { http, url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn write(&self, key: &str, value: &str) -> Result<ClientWriteResponse> {
        let resp = self
            .http
            .post(format!("{}/write", self.url))
            .timeout(Duration::from_secs(65))
            .json(&ClientWriteRequest { key: key.into(), value: value.into() })
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn read(&self, key: &str) -> Result<ClientReadResponse> {
        let resp = self
            .http
            .get(format!("{}/read/{key}", self.url))
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn status(&self) -> Result<ClusterStatus> {
        let resp = self
            .http
            .get(format!("{}/status", self.url))
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnResponse> {
        let resp = self
            .http
            .post(format!("{}/spawn", self.url))
            .timeout(Duration::from_secs(30))
            .json(request)
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn kill(&self, node_id: &str) -> Result<OkResponse> {
        let resp = self
            .http
            .post(format!("{}/kill/{node_id}", self.url))
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn catchup(&self, request: &CatchupRequest) -> Result<CatchupResponse> {
        let resp = self
            .http
            .post(format!("{}/catchup", self.url))
            .timeout(Duration::from_secs(15))
            .json(request)
            .send()
            .await?;
        decode(resp).await
    }
}

/// Runs the given closure, automatically retrying transient errors (peer
/// unreachable, quorum momentarily unavailable) with jittered exponential
/// backoff. It is the caller's responsibility to only retry idempotent
/// operations.
pub async fn with_retry<T, F, Fut>(mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    const MAX_RETRIES: u32 = 10;
    const MIN_WAIT_MS: u64 = 10;
    const MAX_WAIT_MS: u64 = 2_000;

    let mut retries: u32 = 0;
    loop {
        match f().await {
            Ok(r) => return Ok(r),
            Err(e) if e.is_transient() && retries < MAX_RETRIES => {
                // Exponential backoff starting at MIN_WAIT doubling up to
                // MAX_WAIT, randomized within the interval to reduce the
                // chance of collisions.
                let mut wait = std::cmp::min(MIN_WAIT_MS * 2_u64.pow(retries), MAX_WAIT_MS);
                wait = rand::thread_rng().gen_range(MIN_WAIT_MS..=wait.max(MIN_WAIT_MS + 1));
                tokio::time::sleep(Duration::from_millis(wait)).await;
                retries += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

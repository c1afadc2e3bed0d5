//! Runs a real cluster out of the built binaries: registry and coordinator
//! as child processes, nodes as the coordinator's own children. Exercises
//! the process-isolation surface — spawn, kill, respawn with catch-up —
//! that the in-process tests cannot.

use quorumkv::api::SpawnRequest;
use quorumkv::client::{CoordinatorClient, NodeClient};
use quorumkv::error::Error;

use pretty_assertions::assert_eq;
use serial_test::serial;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Fixed high ports so the components can find each other; serial tests
/// keep them from clashing.
const REGISTRY_PORT: u16 = 19900;
const COORDINATOR_PORT: u16 = 19700;

/// Timeout for the cluster to come up (includes node spawning).
const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// A child process that is terminated on drop. The coordinator gets SIGTERM
/// so it can stop its node children; everything else can die hard.
struct TestProcess {
    child: Child,
    graceful: bool,
}

impl TestProcess {
    fn spawn(bin: &str, args: &[&str], graceful: bool) -> Self {
        let binary = escargot::CargoBuild::new()
            .bin(bin)
            .run()
            .expect("cargo build failed");
        let child = binary
            .command()
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn failed");
        Self { child, graceful }
    }
}

impl Drop for TestProcess {
    fn drop(&mut self) {
        if self.graceful {
            // SIGTERM lets the coordinator reap its node children.
            let _ = Command::new("kill")
                .args(["-TERM", &self.child.id().to_string()])
                .status();
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                if self.child.try_wait().expect("wait failed").is_some() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

async fn wait_until<F, Fut>(deadline: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = Instant::now();
    loop {
        if check().await {
            return;
        }
        if started.elapsed() > deadline {
            panic!("condition not met within {deadline:?}");
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Boot a real cluster, write and read through the coordinator, kill a
/// follower to break the write quorum, respawn it, and verify it came back
/// under the same identity with the data caught up.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn cluster_survives_follower_kill_and_respawn() {
    // Build the node binary first so the coordinator can spawn it.
    let node_bin = escargot::CargoBuild::new()
        .bin("quorumkv-node")
        .run()
        .expect("cargo build failed")
        .path()
        .to_path_buf();

    let registry_url = format!("http://127.0.0.1:{REGISTRY_PORT}");
    let _registry = TestProcess::spawn(
        "quorumkv-registry",
        &[
            "--port",
            &REGISTRY_PORT.to_string(),
            "--coordinator",
            &format!("http://127.0.0.1:{COORDINATOR_PORT}"),
            "--log-level",
            "error",
        ],
        false,
    );
    let _coordinator = TestProcess::spawn(
        "quorumkv-coordinator",
        &[
            "--port",
            &COORDINATOR_PORT.to_string(),
            "--followers",
            "2",
            "--write-quorum",
            "2",
            "--read-quorum",
            "1",
            "--registry",
            &registry_url,
            "--node-bin",
            &node_bin.to_string_lossy(),
            "--sync-delay",
            "0.05",
            "--async-delay",
            "0.2",
            "--log-level",
            "error",
        ],
        true,
    );

    let http = reqwest::Client::new();
    let coordinator =
        CoordinatorClient::new(http.clone(), format!("http://127.0.0.1:{COORDINATOR_PORT}"));

    wait_until(READY_TIMEOUT, || {
        let coordinator = coordinator.clone();
        async move { coordinator.status().await.is_ok_and(|s| s.quorum.can_write) }
    })
    .await;

    // Happy path: with W=2 both followers are sync, and with R=1 the read
    // set is the largest-port follower, which is in the sync set.
    let write = coordinator.write("a", "1").await.expect("write failed");
    assert_eq!(write.version, 1);
    assert_eq!(write.sync_acks, 2);
    let read = coordinator.read("a").await.expect("read failed");
    assert_eq!((read.value.as_str(), read.version), ("1", 1));

    // Kill follower-2: live followers drop below W and writes must fail
    // honestly instead of weakening durability.
    coordinator.kill("follower-2").await.expect("kill failed");
    wait_until(READY_TIMEOUT, || {
        let coordinator = coordinator.clone();
        async move { coordinator.status().await.is_ok_and(|s| !s.quorum.can_write) }
    })
    .await;
    let err = coordinator.write("b", "2").await.expect_err("write should fail");
    assert!(matches!(err, Error::QuorumUnavailable(_)), "unexpected error {err:?}");

    // Respawn: same id, same port, bumped epoch, caught up before joining.
    let spawned = coordinator.spawn(&SpawnRequest::default()).await.expect("spawn failed");
    assert_eq!(spawned.node_id, "follower-2");
    assert_eq!(spawned.port, COORDINATOR_PORT + 3);
    assert!(spawned.was_respawn);

    let status = coordinator.status().await.expect("status failed");
    let follower = status
        .followers
        .iter()
        .find(|f| f.node_id == "follower-2")
        .expect("follower-2 missing from layout");
    assert_eq!(follower.startup_epoch, 1);

    // The replacement holds the pre-kill write thanks to catch-up.
    let replacement =
        NodeClient::new(http.clone(), format!("http://127.0.0.1:{}", COORDINATOR_PORT + 3));
    let read = replacement.read("a", Duration::from_secs(2)).await.expect("read failed");
    assert_eq!((read.value.as_str(), read.version), ("1", 1));

    // And the write quorum is restored.
    wait_until(READY_TIMEOUT, || {
        let coordinator = coordinator.clone();
        async move { coordinator.status().await.is_ok_and(|s| s.quorum.can_write) }
    })
    .await;
    let write = coordinator.write("c", "3").await.expect("write failed");
    assert_eq!(write.version, 1);
}

//! Node child processes. Each node is a separate OS process on loopback
//! HTTP: spawn is process creation, kill is a signal, and a killed follower
//! is indistinguishable from a crashed one as far as the registry can tell.

use crate::api::NodeDescriptor;
use crate::error::{Error, Result};

use log::{debug, info};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

/// The node binary name, expected next to the coordinator binary unless
/// overridden with --node-bin.
const NODE_BIN: &str = "quorumkv-node";

/// A spawned node process. Killed and reaped on drop.
pub struct NodeProcess {
    pub descriptor: NodeDescriptor,
    child: Child,
}

impl NodeProcess {
    /// Spawns a node process with the given identity, replication delay and
    /// registry. Returns as soon as the process is forked; the caller polls
    /// the node's health endpoint for readiness.
    pub fn spawn(
        bin: &Path,
        descriptor: NodeDescriptor,
        registry: Option<&str>,
        replication_delay: Duration,
    ) -> Result<Self> {
        let mut command = Command::new(bin);
        command
            .arg("--id")
            .arg(&descriptor.node_id)
            .arg("--port")
            .arg(descriptor.port.to_string())
            .arg("--role")
            .arg(descriptor.role.to_string())
            .arg("--host")
            .arg(&descriptor.host)
            .arg("--replication-delay")
            .arg(format!("{}", replication_delay.as_secs_f64()))
            .arg("--startup-epoch")
            .arg(descriptor.startup_epoch.to_string())
            .stdin(Stdio::null());
        if let Some(registry) = registry {
            command.arg("--registry").arg(registry);
        }
        let child = command
            .spawn()
            .map_err(|e| Error::IO(format!("spawning {} from {bin:?}: {e}", descriptor.node_id)))?;
        info!(
            "spawned {} ({}) on port {} with delay {:?} (pid {})",
            descriptor.node_id,
            descriptor.role,
            descriptor.port,
            replication_delay,
            child.id()
        );
        Ok(Self { descriptor, child })
    }

    /// Kills the process with SIGKILL. The registry is deliberately not
    /// informed; it observes the heartbeat gap naturally.
    pub fn kill(&mut self) -> Result<()> {
        debug!("killing {} (pid {})", self.descriptor.node_id, self.child.id());
        self.child.kill()?;
        self.child.wait()?;
        Ok(())
    }
}

impl Drop for NodeProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Locates the node binary next to the running executable.
pub fn default_node_bin() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| Error::IO(format!("executable {exe:?} has no parent directory")))?;
    let bin = dir.join(NODE_BIN);
    if !bin.exists() {
        return Err(Error::IO(format!("node binary not found at {bin:?}")));
    }
    Ok(bin)
}

//! Container engine client abstraction
//!
//! All engine operations go through the [`ContainerEngine`] trait so the
//! pipeline can be exercised against a scripted fake; [`DockerEngine`] is
//! the production implementation over a single library binding (no child
//! process per operation).

use crate::submission::FileEntry;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

mod docker;

pub use docker::DockerEngine;

/// Container creation parameters
#[derive(Debug, Clone, Default)]
pub struct CreateContainerSpec {
    /// Optional container name, for operator-facing listings
    pub name: Option<String>,
    /// Image reference
    pub image: String,
    /// Labels for later filtered listing/removal
    pub labels: HashMap<String, String>,
    /// Bridge network the container attaches to
    pub network: Option<String>,
    /// Memory ceiling in engine notation (`"<n>[k|m|g]"`)
    pub memory: String,
    /// CPU allocation as a decimal fraction of a core
    pub cpus: f64,
    /// Environment entries, `KEY=value`
    pub env: Vec<String>,
    /// Container command; `None` uses an idle sentinel that blocks forever
    /// so later execs attach into a running container
    pub cmd: Option<Vec<String>>,
}

/// Options for an exec inside a container
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Working directory; defaults to the container's `/app`
    pub work_dir: Option<String>,
    /// Collection deadline; on expiry the stream is destroyed and the call
    /// fails with `Timeout`
    pub timeout: Option<Duration>,
}

/// Fully-collected exec result with demultiplexed streams
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

/// Which logical stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Stdout,
    Stderr,
}

/// One demultiplexed chunk of live exec output
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub kind: OutputKind,
    pub data: Bytes,
}

/// Control half of an interactive exec: stdin, identity, termination
#[derive(Debug, Clone)]
pub struct ExecHandle {
    /// Engine-side exec identifier, used for exit-code inspection
    pub exec_id: String,
    /// Writable stdin; sends are best-effort once the stream closes
    pub stdin: mpsc::UnboundedSender<Bytes>,
    aborts: Vec<tokio::task::AbortHandle>,
}

impl ExecHandle {
    /// Destroy the exec stream. The output channel closes, pending stdin
    /// writes are dropped.
    pub fn kill(&self) {
        for handle in &self.aborts {
            handle.abort();
        }
    }
}

/// A live interactive exec: two output streams demultiplexed onto one
/// channel, a writable stdin, and a handle for termination
#[derive(Debug)]
pub struct InteractiveExec {
    /// Demultiplexed stdout/stderr chunks in wire order; the channel ends
    /// on stream end, close, or error
    pub output: mpsc::UnboundedReceiver<OutputChunk>,
    /// Control half
    pub handle: ExecHandle,
}

impl InteractiveExec {
    /// Assemble from channel halves and the pump task handles
    pub fn new(
        exec_id: String,
        output: mpsc::UnboundedReceiver<OutputChunk>,
        stdin: mpsc::UnboundedSender<Bytes>,
        aborts: Vec<tokio::task::AbortHandle>,
    ) -> Self {
        Self {
            output,
            handle: ExecHandle {
                exec_id,
                stdin,
                aborts,
            },
        }
    }

    /// Split into the consumable output stream and the control handle
    pub fn split(self) -> (mpsc::UnboundedReceiver<OutputChunk>, ExecHandle) {
        (self.output, self.handle)
    }
}

/// A container from a filtered listing
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub labels: HashMap<String, String>,
}

/// Network creation parameters
#[derive(Debug, Clone)]
pub struct CreateNetworkSpec {
    pub name: String,
    /// Engine driver; session networks are bridges
    pub driver: String,
    /// CIDR subnet assigned by the allocator
    pub subnet: String,
    pub labels: HashMap<String, String>,
}

/// Inspection result for one network
#[derive(Debug, Clone, Default)]
pub struct NetworkInspect {
    pub name: String,
    pub subnet: Option<String>,
    pub container_count: usize,
    /// Engine-reported creation timestamp, when available
    pub created: Option<String>,
}

/// A network from a prefix listing
#[derive(Debug, Clone)]
pub struct NetworkSummary {
    pub name: String,
    pub id: String,
}

/// Mediates all operations against the local container engine.
///
/// The client is stateless: every method surfaces engine errors faithfully
/// except where the contract says a 404 is tolerated (an entity already
/// gone is not an error during removal).
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Startup preflight: is the daemon reachable
    async fn ping(&self) -> Result<()>;

    /// Whether an image is present locally
    async fn image_exists(&self, name: &str) -> Result<bool>;

    /// Create a detached container with `WorkingDir=/app`; returns its id
    async fn create_container(&self, spec: CreateContainerSpec) -> Result<String>;

    /// Start a created container (kept separate so callers may stage
    /// inspection between the two)
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Run a command and collect its full demultiplexed output
    async fn exec_collect(
        &self,
        id: &str,
        cmd: Vec<String>,
        opts: ExecOptions,
    ) -> Result<ExecOutput>;

    /// Run a command with live output streams and writable stdin
    async fn exec_interactive(
        &self,
        id: &str,
        cmd: Vec<String>,
        opts: ExecOptions,
    ) -> Result<InteractiveExec>;

    /// Exit code of a finished exec; `None` while still running
    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>>;

    /// Stream an in-memory tar of the files into `dest` inside the
    /// container. No host filesystem I/O.
    async fn put_files(&self, id: &str, files: &[FileEntry], dest: &str) -> Result<()>;

    /// Best-effort force-remove with volumes; engine 404s are swallowed.
    /// Returns how many removals the engine acknowledged.
    async fn remove_containers(&self, ids: &[String]) -> Result<usize>;

    /// Containers matching all given label equalities
    async fn list_containers(
        &self,
        label_filters: &[(String, String)],
    ) -> Result<Vec<ContainerSummary>>;

    /// Create a bridge network with an explicit subnet
    async fn create_network(&self, spec: CreateNetworkSpec) -> Result<()>;

    /// Whether a network with this name exists
    async fn network_exists(&self, name: &str) -> Result<bool>;

    /// Subnet, attachment count and creation time of a network
    async fn inspect_network(&self, name: &str) -> Result<NetworkInspect>;

    /// Remove a network; a 404 is not an error
    async fn remove_network(&self, name: &str) -> Result<()>;

    /// Networks whose name starts with `prefix`
    async fn list_networks(&self, prefix: &str) -> Result<Vec<NetworkSummary>>;

    /// Force-disconnect every container from a network; returns how many
    /// were detached
    async fn disconnect_all_from_network(&self, name: &str) -> Result<usize>;

    /// Engine-side prune of unused networks matching the label filters;
    /// returns how many were deleted
    async fn prune_networks(&self, label_filters: &[(String, String)]) -> Result<usize>;

    /// Poll `check` inside the container until it exits zero. Used by
    /// images whose readiness is external (databases).
    async fn wait_for_healthy(
        &self,
        id: &str,
        check: Vec<String>,
        timeout: Duration,
        interval: Duration,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let probe = self
                .exec_collect(
                    id,
                    check.clone(),
                    ExecOptions {
                        timeout: Some(interval.max(Duration::from_secs(1))),
                        ..Default::default()
                    },
                )
                .await;
            if matches!(probe, Ok(ref out) if out.exit_code == 0) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "container {} did not become healthy within {:?}",
                    id, timeout
                )));
            }
            tokio::time::sleep(interval).await;
        }
    }
}

/// Parse an engine memory string (`"<n>"`, `"<n>k"`, `"<n>m"`, `"<n>g"`)
/// into bytes.
pub fn parse_memory_bytes(s: &str) -> Result<i64> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("empty memory string".to_string()));
    }
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k') | Some('K') => (&trimmed[..trimmed.len() - 1], 1024i64),
        Some('m') | Some('M') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('g') | Some('G') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed, 1),
    };
    let value: i64 = digits
        .parse()
        .map_err(|_| Error::Validation(format!("invalid memory string '{}'", s)))?;
    Ok(value * multiplier)
}

/// Convert fractional cores into the engine's nano-CPU unit
pub fn cpus_to_nano(cpus: f64) -> i64 {
    (cpus * 1_000_000_000.0) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_forms() {
        assert_eq!(parse_memory_bytes("1024").unwrap(), 1024);
        assert_eq!(parse_memory_bytes("64k").unwrap(), 64 * 1024);
        assert_eq!(parse_memory_bytes("256m").unwrap(), 256 * 1024 * 1024);
        assert_eq!(parse_memory_bytes("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_bytes("512M").unwrap(), 512 * 1024 * 1024);
    }

    #[test]
    fn test_parse_memory_rejects_garbage() {
        assert!(parse_memory_bytes("").is_err());
        assert!(parse_memory_bytes("lots").is_err());
        assert!(parse_memory_bytes("12q").is_err());
    }

    #[test]
    fn test_cpus_to_nano() {
        assert_eq!(cpus_to_nano(0.5), 500_000_000);
        assert_eq!(cpus_to_nano(2.0), 2_000_000_000);
    }
}

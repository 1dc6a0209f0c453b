//! Per-session bridge network management
//!
//! Every live session gets a distinct bridge network with a non-colliding
//! subnet so user programs can bind listening sockets without clashing
//! across users. Subnets come from explicitly managed pools
//! ([`subnet::SubnetAllocator`]); network creation is single-flight per
//! name; reclamation escalates with the number of live networks.

pub mod subnet;

use crate::config::NetworkConfig;
use crate::engine::{ContainerEngine, CreateNetworkSpec};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use subnet::{SubnetAllocator, SubnetStats};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Escalation thresholds: below the first the caller-supplied age is
/// honored; between the two the age drops to 30s; above the second the age
/// drops to zero. Past `BULK_THRESHOLD` the sweeper takes the bulk path.
const ESCALATION_SOFT: usize = 20;
const ESCALATION_HARD: usize = 50;
/// Orphan count at which the network sweeper switches to the bulk path
pub const BULK_THRESHOLD: usize = 100;

/// Cooldown between engine-wide prune calls, which the engine serializes
/// globally
const EMERGENCY_COOLDOWN: Duration = Duration::from_secs(5);

/// Creation retry backoff schedule
const CREATE_BACKOFF_MS: [u64; 3] = [100, 200, 400];

/// One managed session network
#[derive(Debug, Clone)]
pub struct SessionNetwork {
    pub name: String,
    pub session_key: String,
    pub subnet: String,
    pub created_at: Instant,
}

/// Per-network entry in [`NetworkStats`]
#[derive(Debug, Clone, Serialize)]
pub struct NetworkStatEntry {
    pub name: String,
    pub container_count: usize,
    pub age_seconds: u64,
}

/// Aggregate view over the managed networks
#[derive(Debug, Clone, Serialize)]
pub struct NetworkStats {
    pub total: usize,
    pub with_containers: usize,
    pub empty: usize,
    pub networks: Vec<NetworkStatEntry>,
}

/// Counters kept by the manager
#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    deleted: AtomicU64,
    cleanup_errors: AtomicU64,
    emergency_cleanups: AtomicU64,
}

/// Snapshot of the manager counters
#[derive(Debug, Clone, Serialize)]
pub struct NetworkMetrics {
    pub networks_created: u64,
    pub networks_deleted: u64,
    pub cleanup_errors: u64,
    pub emergency_cleanups: u64,
    pub escalation_level: usize,
}

type PendingResult = std::result::Result<String, Arc<Error>>;

/// Manages session bridge networks and the subnet allocator
pub struct NetworkManager {
    engine: Arc<dyn ContainerEngine>,
    config: NetworkConfig,
    allocator: parking_lot::Mutex<SubnetAllocator>,
    networks: parking_lot::Mutex<HashMap<String, SessionNetwork>>,
    /// Single-flight map: concurrent callers for the same name share one
    /// in-flight creation
    pending: Mutex<HashMap<String, broadcast::Sender<PendingResult>>>,
    counters: Counters,
    escalation_level: AtomicUsize,
    /// Emergency cleanup guard: in-flight flag plus cooldown stamp
    emergency: Mutex<Option<Instant>>,
}

impl NetworkManager {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: NetworkConfig) -> Self {
        let allocator = SubnetAllocator::new(config.pools.clone());
        Self {
            engine,
            config,
            allocator: parking_lot::Mutex::new(allocator),
            networks: parking_lot::Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            escalation_level: AtomicUsize::new(0),
            emergency: Mutex::new(None),
        }
    }

    /// Name of the network a session would use
    pub fn network_name(&self, session_key: &str) -> String {
        format!("{}{}", self.config.prefix, session_key)
    }

    /// Get the session's network, creating it on first use. Idempotent;
    /// concurrent callers for the same session observe exactly one creation
    /// attempt.
    pub async fn get_or_create_session_network(&self, session_key: &str) -> Result<String> {
        let name = self.network_name(session_key);

        loop {
            if self.networks.lock().contains_key(&name) {
                return Ok(name);
            }

            // Join an in-flight creation or register ours
            let rx = {
                let mut pending = self.pending.lock().await;
                if let Some(tx) = pending.get(&name) {
                    Some(tx.subscribe())
                } else {
                    let (tx, _) = broadcast::channel(1);
                    pending.insert(name.clone(), tx);
                    None
                }
            };

            let Some(mut rx) = rx else {
                break; // we own the creation
            };
            match rx.recv().await {
                Ok(Ok(name)) => return Ok(name),
                Ok(Err(shared)) => return Err(clone_error(&shared)),
                // Creator dropped without sending; start over
                Err(_) => continue,
            }
        }

        let outcome = self.create_session_network(session_key, &name).await;

        // Publish to waiters and clear the pending slot
        let shared: PendingResult = match &outcome {
            Ok(name) => Ok(name.clone()),
            Err(e) => Err(Arc::new(clone_error(e))),
        };
        let mut pending = self.pending.lock().await;
        if let Some(tx) = pending.remove(&name) {
            let _ = tx.send(shared);
        }

        outcome
    }

    async fn create_session_network(&self, session_key: &str, name: &str) -> Result<String> {
        let allocation = self.allocate_subnet().await?;
        let mut labels = HashMap::new();
        labels.insert(self.config.network_label.clone(), "1".to_string());
        labels.insert("io.coderunner.session".to_string(), session_key.to_string());

        let spec = CreateNetworkSpec {
            name: name.to_string(),
            driver: "bridge".to_string(),
            subnet: allocation.subnet.clone(),
            labels,
        };

        let mut attempt = 0usize;
        loop {
            match self.engine.create_network(spec.clone()).await {
                Ok(()) => {
                    self.record_network(session_key, name, &allocation.subnet);
                    debug!(
                        network = %name,
                        subnet = %allocation.subnet,
                        pool = %allocation.pool,
                        "session network created"
                    );
                    return Ok(name.to_string());
                }
                Err(Error::ResourceConflict(_)) => {
                    // Someone (possibly a previous process) already owns the
                    // name; verify and adopt it instead of failing.
                    if self.engine.network_exists(name).await.unwrap_or(false) {
                        let inspect = self.engine.inspect_network(name).await.ok();
                        let subnet = inspect.and_then(|i| i.subnet);
                        self.allocator.lock().release(&allocation.subnet);
                        let effective = subnet.unwrap_or_else(|| allocation.subnet.clone());
                        self.record_network(session_key, name, &effective);
                        debug!(network = %name, "adopted existing session network");
                        return Ok(name.to_string());
                    }
                    if attempt >= CREATE_BACKOFF_MS.len() {
                        self.allocator.lock().release(&allocation.subnet);
                        return Err(Error::ResourceConflict(format!(
                            "network {} conflicts but does not exist",
                            name
                        )));
                    }
                }
                Err(e) => {
                    if attempt >= CREATE_BACKOFF_MS.len() {
                        self.allocator.lock().release(&allocation.subnet);
                        return Err(e);
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(CREATE_BACKOFF_MS[attempt])).await;
            attempt += 1;
        }
    }

    fn record_network(&self, session_key: &str, name: &str, subnet: &str) {
        self.networks.lock().insert(
            name.to_string(),
            SessionNetwork {
                name: name.to_string(),
                session_key: session_key.to_string(),
                subnet: subnet.to_string(),
                created_at: Instant::now(),
            },
        );
        self.counters.created.fetch_add(1, Ordering::Relaxed);
    }

    /// Allocate a subnet; on exhaustion run one emergency sweep and retry
    /// before giving up.
    async fn allocate_subnet(&self) -> Result<subnet::AllocatedSubnet> {
        match self.allocator.lock().allocate() {
            Ok(allocation) => return Ok(allocation),
            Err(Error::SubnetExhausted(_)) => {}
            Err(e) => return Err(e),
        }
        warn!("subnet pools exhausted, attempting emergency cleanup");
        self.emergency_network_cleanup().await?;
        self.allocator.lock().allocate()
    }

    /// Delete the session's network and release its subnet. Idempotent: a
    /// second call is a no-op.
    pub async fn delete_session_network(&self, session_key: &str) -> Result<()> {
        let name = self.network_name(session_key);
        let record = self.networks.lock().remove(&name);

        match self.engine.remove_network(&name).await {
            Ok(()) => {
                if let Some(record) = record {
                    self.allocator.lock().release(&record.subnet);
                    self.counters.deleted.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            }
            Err(e) => {
                // Keep the record so a later sweep can retry
                if let Some(record) = record {
                    self.networks.lock().insert(name.clone(), record);
                }
                self.counters.cleanup_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Engine-listed session networks (includes orphans left by previous
    /// processes)
    pub async fn list_session_networks(&self) -> Result<Vec<String>> {
        Ok(self
            .engine
            .list_networks(&self.config.prefix)
            .await?
            .into_iter()
            .map(|n| n.name)
            .collect())
    }

    /// Attachment counts and ages for every listed session network
    pub async fn get_network_stats(&self) -> Result<NetworkStats> {
        let names = self.list_session_networks().await?;
        let mut networks = Vec::with_capacity(names.len());
        let mut with_containers = 0;

        for name in names {
            let container_count = match self.engine.inspect_network(&name).await {
                Ok(inspect) => inspect.container_count,
                Err(_) => 0,
            };
            if container_count > 0 {
                with_containers += 1;
            }
            let age_seconds = self
                .networks
                .lock()
                .get(&name)
                .map(|r| r.created_at.elapsed().as_secs())
                .unwrap_or(0);
            networks.push(NetworkStatEntry {
                name,
                container_count,
                age_seconds,
            });
        }

        Ok(NetworkStats {
            total: networks.len(),
            with_containers,
            empty: networks.len() - with_containers,
            networks,
        })
    }

    /// Sweep empty session networks older than `max_age`. The effective age
    /// threshold tightens as the network count grows (escalation ladder);
    /// individual deletion failures are counted, never aborting the sweep.
    pub async fn cleanup_orphaned_networks(&self, max_age: Duration) -> Result<usize> {
        let names = self.list_session_networks().await?;
        let n = names.len();

        let (effective_age, level) = if n <= ESCALATION_SOFT {
            (max_age, 0)
        } else if n <= ESCALATION_HARD {
            (Duration::from_secs(30), 1)
        } else {
            (Duration::ZERO, 2)
        };
        self.escalation_level.store(level, Ordering::Relaxed);
        if level > 0 {
            info!(
                networks = n,
                escalation_level = level,
                "network sweep escalated"
            );
        }

        let mut deleted = 0;
        for name in names {
            // Never reap a network whose creation is still in flight
            if self.pending.lock().await.contains_key(&name) {
                continue;
            }

            let inspect = match self.engine.inspect_network(&name).await {
                Ok(inspect) => inspect,
                Err(_) => continue, // vanished between list and inspect
            };
            if inspect.container_count > 0 {
                continue;
            }

            // Foreign networks (no local record) are leftovers from a dead
            // process and are always old enough.
            let old_enough = match self.networks.lock().get(&name) {
                Some(record) => record.created_at.elapsed() >= effective_age,
                None => true,
            };
            if !old_enough {
                continue;
            }

            match self.engine.remove_network(&name).await {
                Ok(()) => {
                    if let Some(record) = self.networks.lock().remove(&name) {
                        self.allocator.lock().release(&record.subnet);
                    } else if let Some(subnet) = inspect.subnet {
                        self.allocator.lock().release(&subnet);
                    }
                    self.counters.deleted.fetch_add(1, Ordering::Relaxed);
                    deleted += 1;
                }
                Err(e) => {
                    self.counters.cleanup_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(network = %name, "orphan removal failed: {}", e);
                }
            }
        }

        if deleted > 0 {
            info!(deleted, "orphaned session networks removed");
        }
        Ok(deleted)
    }

    /// Engine-wide prune of unused managed networks. Guarded by a single
    /// in-flight slot and a cooldown; concurrent or too-frequent calls are
    /// no-ops.
    pub async fn emergency_network_cleanup(&self) -> Result<usize> {
        let mut guard = match self.emergency.try_lock() {
            Ok(guard) => guard,
            Err(_) => return Ok(0), // already running
        };
        if let Some(last) = *guard {
            if last.elapsed() < EMERGENCY_COOLDOWN {
                return Ok(0);
            }
        }

        self.counters
            .emergency_cleanups
            .fetch_add(1, Ordering::Relaxed);
        let filters = vec![(self.config.network_label.clone(), "1".to_string())];
        let pruned = self.engine.prune_networks(&filters).await?;

        // Reconcile: drop records (and subnets) for anything the prune took
        let recorded: Vec<SessionNetwork> = self.networks.lock().values().cloned().collect();
        for record in recorded {
            if !self.engine.network_exists(&record.name).await.unwrap_or(true) {
                self.networks.lock().remove(&record.name);
                self.allocator.lock().release(&record.subnet);
                self.counters.deleted.fetch_add(1, Ordering::Relaxed);
            }
        }

        info!(pruned, "emergency network cleanup finished");
        *guard = Some(Instant::now());
        Ok(pruned)
    }

    /// Bulk path for extreme backlogs: force-disconnect every container
    /// from every managed network, pause briefly, then remove all networks
    /// in parallel batches.
    pub async fn aggressive_bulk_network_cleanup(&self) -> Result<usize> {
        let names = self.list_session_networks().await?;
        if names.is_empty() {
            return Ok(0);
        }
        warn!(count = names.len(), "aggressive bulk network cleanup");
        self.escalation_level.store(2, Ordering::Relaxed);

        for name in &names {
            if let Err(e) = self.engine.disconnect_all_from_network(name).await {
                self.counters.cleanup_errors.fetch_add(1, Ordering::Relaxed);
                debug!(network = %name, "bulk disconnect failed: {}", e);
            }
        }

        tokio::time::sleep(Duration::from_millis(500)).await;

        let mut deleted = 0;
        for batch in names.chunks(10) {
            let removals = batch.iter().map(|name| self.engine.remove_network(name));
            for (name, result) in batch.iter().zip(futures::future::join_all(removals).await) {
                match result {
                    Ok(()) => {
                        if let Some(record) = self.networks.lock().remove(name) {
                            self.allocator.lock().release(&record.subnet);
                        }
                        self.counters.deleted.fetch_add(1, Ordering::Relaxed);
                        deleted += 1;
                    }
                    Err(e) => {
                        self.counters.cleanup_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(network = %name, "bulk removal failed: {}", e);
                    }
                }
            }
        }

        info!(deleted, "bulk network cleanup finished");
        Ok(deleted)
    }

    /// Allocator stats for the metrics surface
    pub fn get_subnet_stats(&self) -> SubnetStats {
        self.allocator.lock().stats()
    }

    /// Manager counter snapshot
    pub fn get_network_metrics(&self) -> NetworkMetrics {
        NetworkMetrics {
            networks_created: self.counters.created.load(Ordering::Relaxed),
            networks_deleted: self.counters.deleted.load(Ordering::Relaxed),
            cleanup_errors: self.counters.cleanup_errors.load(Ordering::Relaxed),
            emergency_cleanups: self.counters.emergency_cleanups.load(Ordering::Relaxed),
            escalation_level: self.escalation_level.load(Ordering::Relaxed),
        }
    }

    /// Zero the manager counters
    pub fn reset_network_metrics(&self) {
        self.counters.created.store(0, Ordering::Relaxed);
        self.counters.deleted.store(0, Ordering::Relaxed);
        self.counters.cleanup_errors.store(0, Ordering::Relaxed);
        self.counters.emergency_cleanups.store(0, Ordering::Relaxed);
        self.escalation_level.store(0, Ordering::Relaxed);
    }

    /// Current cleanup error count (cleaner hysteresis input)
    pub fn cleanup_error_count(&self) -> u64 {
        self.counters.cleanup_errors.load(Ordering::Relaxed)
    }
}

/// Rebuild an error of the same kind; broadcast channels require `Clone`
/// payloads and `Error` intentionally is not.
fn clone_error(err: &Error) -> Error {
    match err {
        Error::Validation(m) => Error::Validation(m.clone()),
        Error::RateLimited(m) => Error::RateLimited(m.clone()),
        Error::QueueFull(m) => Error::QueueFull(m.clone()),
        Error::Timeout(m) => Error::Timeout(m.clone()),
        Error::EngineUnavailable(m) => Error::EngineUnavailable(m.clone()),
        Error::SubnetExhausted(m) => Error::SubnetExhausted(m.clone()),
        Error::ResourceConflict(m) => Error::ResourceConflict(m.clone()),
        Error::CleanupFailed(m) => Error::CleanupFailed(m.clone()),
        Error::Internal(m) => Error::Internal(m.clone()),
        other => Error::Internal(other.to_string()),
    }
}

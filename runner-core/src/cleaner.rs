//! Adaptive background reclamation
//!
//! Two independent sweepers: one reclaims expired warm containers, one
//! reclaims orphaned session networks. Each adapts its own interval to the
//! observed load, swallows every failure, and keeps running until shutdown
//! is signalled.

use crate::network::{NetworkManager, BULK_THRESHOLD};
use crate::pool::SessionPool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Age past which an empty session network counts as orphaned (the
/// escalation ladder tightens this under pressure)
const ORPHAN_MAX_AGE: Duration = Duration::from_secs(300);

/// Container sweeper interval bounds and factors
const CONTAINER_MIN: Duration = Duration::from_secs(15);
const CONTAINER_MAX: Duration = Duration::from_secs(60);
const SHRINK_FACTOR: f64 = 0.8;
const GROW_FACTOR: f64 = 1.1;

/// Network sweeper interval bounds and factors
const NETWORK_MIN: Duration = Duration::from_secs(30);
const NETWORK_MAX: Duration = Duration::from_secs(300);
const NETWORK_SHRINK: f64 = 0.7;
const NETWORK_GROW: f64 = 1.2;

/// Load thresholds shared by both sweepers' hysteresis
const BUSY_COUNT: usize = 50;
const QUIET_COUNT: usize = 10;
const ERROR_BURST: u64 = 5;

/// Handle over the two background sweepers
pub struct AdaptiveCleaner {
    shutdown: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    sweep_errors: Arc<AtomicU64>,
}

impl AdaptiveCleaner {
    /// Spawn both sweepers
    pub fn start(
        pool: Arc<SessionPool>,
        networks: Arc<NetworkManager>,
        container_interval: Duration,
        network_interval: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let sweep_errors = Arc::new(AtomicU64::new(0));

        let container_task = tokio::spawn(container_sweeper(
            pool,
            container_interval,
            shutdown.subscribe(),
        ));
        let network_task = tokio::spawn(network_sweeper(
            networks,
            network_interval,
            shutdown.subscribe(),
            sweep_errors.clone(),
        ));

        Self {
            shutdown,
            tasks: parking_lot::Mutex::new(vec![container_task, network_task]),
            sweep_errors,
        }
    }

    /// Total swallowed sweep failures
    pub fn sweep_error_count(&self) -> u64 {
        self.sweep_errors.load(Ordering::Relaxed)
    }

    /// Signal both sweepers and wait for them to finish
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }
}

fn adapt(
    interval: Duration,
    load: usize,
    fresh_errors: u64,
    min: Duration,
    max: Duration,
    shrink: f64,
    grow: f64,
) -> Duration {
    if load > BUSY_COUNT || fresh_errors > ERROR_BURST {
        min.max(interval.mul_f64(shrink))
    } else if load < QUIET_COUNT && fresh_errors == 0 {
        max.min(interval.mul_f64(grow))
    } else {
        interval
    }
}

async fn container_sweeper(
    pool: Arc<SessionPool>,
    base_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = base_interval;
    let mut seen_errors = pool.cleanup_error_count();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
        // Run the sweep body on its own tick, off the timer edge
        tokio::task::yield_now().await;

        pool.cleanup_expired_containers().await;
        let errors_now = pool.cleanup_error_count();
        let fresh_errors = errors_now.saturating_sub(seen_errors);
        seen_errors = errors_now;

        let sessions = pool.session_count().await;
        let next = adapt(
            interval,
            sessions,
            fresh_errors,
            CONTAINER_MIN,
            CONTAINER_MAX,
            SHRINK_FACTOR,
            GROW_FACTOR,
        );
        if next != interval {
            debug!(
                from_ms = interval.as_millis() as u64,
                to_ms = next.as_millis() as u64,
                sessions,
                "container sweep interval adapted"
            );
            interval = next;
        }
    }
    debug!("container sweeper stopped");
}

async fn network_sweeper(
    networks: Arc<NetworkManager>,
    base_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    sweep_errors: Arc<AtomicU64>,
) {
    let mut interval = base_interval;
    let mut seen_errors = networks.cleanup_error_count();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
        tokio::task::yield_now().await;

        let listed = networks
            .list_session_networks()
            .await
            .map(|names| names.len())
            .unwrap_or(0);

        let swept = if listed > BULK_THRESHOLD {
            networks.aggressive_bulk_network_cleanup().await
        } else {
            networks.cleanup_orphaned_networks(ORPHAN_MAX_AGE).await
        };
        if let Err(e) = swept {
            sweep_errors.fetch_add(1, Ordering::Relaxed);
            warn!("network sweep failed: {}", e);
        }

        let errors_now = networks.cleanup_error_count();
        let fresh_errors = errors_now.saturating_sub(seen_errors);
        seen_errors = errors_now;

        interval = adapt(
            interval,
            listed,
            fresh_errors,
            NETWORK_MIN,
            NETWORK_MAX,
            NETWORK_SHRINK,
            NETWORK_GROW,
        );
    }
    debug!("network sweeper stopped");
}

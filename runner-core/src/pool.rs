//! Session container pool
//!
//! Holds warm containers per `(session, language)` under a TTL so a
//! follow-up run skips image start-up entirely. Containers are never shared
//! across sessions: they sit on that session's bridge network next to the
//! user's own programs.

use crate::config::{PoolConfig, ResourceConfig};
use crate::engine::{ContainerEngine, CreateContainerSpec, ExecOptions};
use crate::language::{Language, ResourceClass};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// Command run inside a returned container before it goes back to the warm
/// set. "No such file" from the dot-glob expansions is expected.
const CLEAN_CMD: &str = "rm -rf /app/* /app/.[!.]* /app/..?* /tmp/* 2>/dev/null || true";

/// How long an acquisition may wait for the pair's in-use container to come
/// back before failing
const ACQUIRE_WAIT: Duration = Duration::from_secs(30);

/// One pooled container
#[derive(Debug, Clone)]
pub struct SessionContainer {
    pub container_id: String,
    pub language: Language,
    pub session_key: String,
    pub network_name: String,
    pub last_used_at: Instant,
    pub in_use: bool,
}

/// Result of one acquisition
#[derive(Debug, Clone)]
pub struct AcquiredContainer {
    pub container_id: String,
    /// Whether this was a warm reuse rather than a fresh create
    pub reused: bool,
}

#[derive(Default)]
struct PoolCounters {
    created: AtomicU64,
    reused: AtomicU64,
    deleted: AtomicU64,
    cleanup_errors: AtomicU64,
    last_cleanup_ms: AtomicU64,
    waiting: AtomicUsize,
}

/// Counter snapshot for the metrics surface
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub containers_created: u64,
    pub containers_reused: u64,
    pub containers_deleted: u64,
    pub cleanup_errors: u64,
    pub last_cleanup_duration_ms: u64,
    pub total_active_containers: usize,
    /// Acquisitions currently blocked waiting for a pair's container
    pub queue_depth: usize,
}

/// Structural snapshot of the pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total_containers: usize,
    pub by_session: HashMap<String, usize>,
    pub by_language: HashMap<String, usize>,
}

struct PoolState {
    sessions: HashMap<String, Vec<SessionContainer>>,
    /// Pairs with a container creation in flight
    creating: HashSet<(String, Language)>,
}

/// Warm container pool, exclusive owner of all `SessionContainer` records
pub struct SessionPool {
    engine: Arc<dyn ContainerEngine>,
    config: PoolConfig,
    resources: ResourceConfig,
    state: Mutex<PoolState>,
    /// Signalled on every return, creation completion, and teardown so
    /// blocked acquirers re-check
    released: Notify,
    counters: PoolCounters,
}

impl SessionPool {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        config: PoolConfig,
        resources: ResourceConfig,
    ) -> Self {
        Self {
            engine,
            config,
            resources,
            state: Mutex::new(PoolState {
                sessions: HashMap::new(),
                creating: HashSet::new(),
            }),
            released: Notify::new(),
            counters: PoolCounters::default(),
        }
    }

    /// Acquire the session's container for a language, creating one when no
    /// idle instance exists. The pool hands out one container at a time per
    /// `(session, language)`: while that pair's container is in use or being
    /// created, further acquisitions wait.
    pub async fn get_or_create_container(
        &self,
        language: Language,
        session_key: &str,
        network_name: &str,
    ) -> Result<AcquiredContainer> {
        let deadline = Instant::now() + ACQUIRE_WAIT;
        let pair = (session_key.to_string(), language);

        loop {
            // Register for wakeups before inspecting state, so a return
            // landing between the check and the wait is not lost
            let released = self.released.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(containers) = state.sessions.get_mut(session_key) {
                    if let Some(container) = containers
                        .iter_mut()
                        .find(|c| c.language == language && !c.in_use)
                    {
                        container.in_use = true;
                        container.last_used_at = Instant::now();
                        self.counters.reused.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            session_key = %session_key,
                            language = %language.as_str(),
                            container_id = %container.container_id,
                            "warm container reused"
                        );
                        return Ok(AcquiredContainer {
                            container_id: container.container_id.clone(),
                            reused: true,
                        });
                    }

                    let busy = containers
                        .iter()
                        .any(|c| c.language == language && c.in_use);
                    if !busy && !state.creating.contains(&pair) {
                        state.creating.insert(pair.clone());
                        break;
                    }
                } else if !state.creating.contains(&pair) {
                    state.creating.insert(pair.clone());
                    break;
                }
            }

            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "container acquisition for {}/{} timed out",
                    session_key,
                    language.as_str()
                )));
            }
            self.counters.waiting.fetch_add(1, Ordering::Relaxed);
            let waited = tokio::time::timeout(
                deadline.saturating_duration_since(Instant::now()),
                released,
            )
            .await;
            self.counters.waiting.fetch_sub(1, Ordering::Relaxed);
            if waited.is_err() {
                return Err(Error::Timeout(format!(
                    "container acquisition for {}/{} timed out",
                    session_key,
                    language.as_str()
                )));
            }
        }

        let created = self
            .create_for(language, session_key, network_name)
            .await;

        let mut state = self.state.lock().await;
        state.creating.remove(&pair);
        self.released.notify_waiters();

        match created {
            Ok(container_id) => {
                state
                    .sessions
                    .entry(session_key.to_string())
                    .or_default()
                    .push(SessionContainer {
                        container_id: container_id.clone(),
                        language,
                        session_key: session_key.to_string(),
                        network_name: network_name.to_string(),
                        last_used_at: Instant::now(),
                        in_use: true,
                    });
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                Ok(AcquiredContainer {
                    container_id,
                    reused: false,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn create_for(
        &self,
        language: Language,
        session_key: &str,
        network_name: &str,
    ) -> Result<String> {
        let descriptor = language.descriptor();
        let (memory, cpus) = match descriptor.resource_class {
            ResourceClass::Default => (self.resources.memory.clone(), self.resources.cpus),
            ResourceClass::Database => {
                (self.resources.sql_memory.clone(), self.resources.sql_cpus)
            }
        };

        let mut labels = HashMap::new();
        labels.insert(self.config.pool_label.clone(), "1".to_string());
        labels.insert("io.coderunner.session".to_string(), session_key.to_string());
        labels.insert(
            "io.coderunner.language".to_string(),
            descriptor.language.as_str().to_string(),
        );

        let container_id = self
            .engine
            .create_container(CreateContainerSpec {
                name: None,
                image: descriptor.image.to_string(),
                labels,
                network: Some(network_name.to_string()),
                memory,
                cpus,
                env: descriptor.env.iter().map(|s| s.to_string()).collect(),
                cmd: None,
            })
            .await?;

        if let Err(e) = self.engine.start_container(&container_id).await {
            let _ = self.engine.remove_containers(&[container_id.clone()]).await;
            return Err(e);
        }

        // Images with external readiness (databases) are polled before the
        // container is handed out
        if let Some(check) = descriptor.health_check {
            let check: Vec<String> = check.iter().map(|s| s.to_string()).collect();
            if let Err(e) = self
                .engine
                .wait_for_healthy(
                    &container_id,
                    check,
                    Duration::from_secs(60),
                    Duration::from_secs(1),
                )
                .await
            {
                let _ = self.engine.remove_containers(&[container_id.clone()]).await;
                return Err(e);
            }
        }

        info!(
            session_key = %session_key,
            language = %language.as_str(),
            container_id = %container_id,
            "container created"
        );
        Ok(container_id)
    }

    /// Clean the container's working directories and put it back in the
    /// warm set. Cleaning failures are counted, never surfaced.
    pub async fn return_container(&self, container_id: &str, session_key: &str) {
        let clean = self
            .engine
            .exec_collect(
                container_id,
                vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    CLEAN_CMD.to_string(),
                ],
                ExecOptions {
                    timeout: Some(Duration::from_secs(10)),
                    ..Default::default()
                },
            )
            .await;
        if let Err(e) = clean {
            self.counters.cleanup_errors.fetch_add(1, Ordering::Relaxed);
            warn!(container_id = %container_id, "container clean failed: {}", e);
        }

        let mut state = self.state.lock().await;
        if let Some(containers) = state.sessions.get_mut(session_key) {
            if let Some(container) = containers
                .iter_mut()
                .find(|c| c.container_id == container_id)
            {
                container.in_use = false;
                container.last_used_at = Instant::now();
            }
        }
        drop(state);
        self.released.notify_waiters();
    }

    /// Remove every idle container whose idle time exceeds the TTL; empty
    /// session buckets are dropped. Returns how many containers were
    /// reclaimed.
    pub async fn cleanup_expired_containers(&self) -> usize {
        let started = Instant::now();
        let ttl = Duration::from_millis(self.config.session_ttl_ms);

        let expired: Vec<String> = {
            let mut state = self.state.lock().await;
            let mut expired = Vec::new();
            for containers in state.sessions.values_mut() {
                containers.retain(|c| {
                    let keep = c.in_use || c.last_used_at.elapsed() <= ttl;
                    if !keep {
                        expired.push(c.container_id.clone());
                    }
                    keep
                });
            }
            state.sessions.retain(|_, v| !v.is_empty());
            expired
        };

        let removed = self.remove_batch(&expired).await;
        self.counters
            .last_cleanup_ms
            .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        if removed > 0 {
            info!(removed, "expired containers reclaimed");
        }
        removed
    }

    /// Tear down every container of one session, regardless of state
    pub async fn cleanup_session(&self, session_key: &str) {
        let ids: Vec<String> = {
            let mut state = self.state.lock().await;
            state
                .sessions
                .remove(session_key)
                .map(|v| v.into_iter().map(|c| c.container_id).collect())
                .unwrap_or_default()
        };
        if ids.is_empty() {
            return;
        }
        debug!(session_key = %session_key, count = ids.len(), "session containers removed");
        self.remove_batch(&ids).await;
        self.released.notify_waiters();
    }

    /// Shutdown teardown: remove everything carrying the pool label,
    /// including containers left over by a previous process.
    pub async fn cleanup_all(&self) {
        let listed = self
            .engine
            .list_containers(&[(self.config.pool_label.clone(), "1".to_string())])
            .await;
        let ids = match listed {
            Ok(containers) => containers.into_iter().map(|c| c.id).collect::<Vec<_>>(),
            Err(e) => {
                self.counters.cleanup_errors.fetch_add(1, Ordering::Relaxed);
                warn!("pool shutdown listing failed: {}", e);
                return;
            }
        };

        self.remove_batch(&ids).await;
        let mut state = self.state.lock().await;
        state.sessions.clear();
        state.creating.clear();
    }

    async fn remove_batch(&self, ids: &[String]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        match self.engine.remove_containers(ids).await {
            Ok(removed) => {
                self.counters
                    .deleted
                    .fetch_add(removed as u64, Ordering::Relaxed);
                let failed = ids.len().saturating_sub(removed);
                if failed > 0 {
                    self.counters
                        .cleanup_errors
                        .fetch_add(failed as u64, Ordering::Relaxed);
                }
                removed
            }
            Err(e) => {
                self.counters
                    .cleanup_errors
                    .fetch_add(ids.len() as u64, Ordering::Relaxed);
                warn!("container removal batch failed: {}", e);
                0
            }
        }
    }

    /// Counter snapshot
    pub async fn get_metrics(&self) -> PoolMetrics {
        let state = self.state.lock().await;
        let active = state
            .sessions
            .values()
            .flat_map(|v| v.iter())
            .filter(|c| c.in_use)
            .count();
        PoolMetrics {
            containers_created: self.counters.created.load(Ordering::Relaxed),
            containers_reused: self.counters.reused.load(Ordering::Relaxed),
            containers_deleted: self.counters.deleted.load(Ordering::Relaxed),
            cleanup_errors: self.counters.cleanup_errors.load(Ordering::Relaxed),
            last_cleanup_duration_ms: self.counters.last_cleanup_ms.load(Ordering::Relaxed),
            total_active_containers: active,
            queue_depth: self.counters.waiting.load(Ordering::Relaxed),
        }
    }

    /// Structural snapshot
    pub async fn get_stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        let mut by_session = HashMap::new();
        let mut by_language: HashMap<String, usize> = HashMap::new();
        let mut total = 0;
        for (session, containers) in &state.sessions {
            by_session.insert(session.clone(), containers.len());
            total += containers.len();
            for container in containers {
                *by_language
                    .entry(container.language.as_str().to_string())
                    .or_default() += 1;
            }
        }
        PoolStats {
            total_containers: total,
            by_session,
            by_language,
        }
    }

    /// Number of sessions currently holding containers (cleaner hysteresis
    /// input)
    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    /// Current cleanup error count (cleaner hysteresis input)
    pub fn cleanup_error_count(&self) -> u64 {
        self.counters.cleanup_errors.load(Ordering::Relaxed)
    }
}

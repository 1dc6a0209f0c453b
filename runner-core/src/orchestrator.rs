//! End-to-end choreography of submissions and socket sessions
//!
//! The orchestrator is the only component that composes the others. One
//! submission flows: rate check, validation, command build, queue, network
//! and container acquisition (with one retry), file upload, interactive
//! exec with batched output fan-out, exit frame, container return, timings.

use crate::batch::OutputBatcher;
use crate::config::RunnerConfig;
use crate::engine::{ContainerEngine, ExecHandle, ExecOptions, OutputKind};
use crate::language::{self, Language};
use crate::metrics::{PipelineMetrics, PipelineTimings, Stopwatch};
use crate::network::NetworkManager;
use crate::pool::SessionPool;
use crate::protocol::{OutputType, ServerFrame};
use crate::queue::{ExecutionQueue, PRIORITY_INTERACTIVE};
use crate::submission::{validate_files, FileEntry, RunRequest};
use crate::{Error, Result};
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Network+container acquisition attempts per submission
const ACQUIRE_ATTEMPTS: usize = 2;

/// Pause between acquisition attempts
const ACQUIRE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// System line emitted for a manual stop
const TERMINATED_NOTICE: &str = "[Process terminated]\n";

struct ActiveRun {
    exec: ExecHandle,
    container_id: String,
}

/// Per-socket state owned by the orchestrator
struct SessionHandle {
    session_key: String,
    sink: mpsc::UnboundedSender<ServerFrame>,
    batcher: Arc<OutputBatcher>,
    /// Sliding window of recent run admissions
    rate: parking_lot::Mutex<VecDeque<Instant>>,
    active: parking_lot::Mutex<Option<ActiveRun>>,
    /// Set by a manual stop or disconnect so the natural completion path
    /// does not emit a duplicate exit frame
    stopped: AtomicBool,
}

impl SessionHandle {
    fn take_active(&self) -> Option<ActiveRun> {
        self.active.lock().take()
    }

    /// Admit or reject under the sliding rate window
    fn rate_allow(&self, limit: usize, window: Duration) -> bool {
        let now = Instant::now();
        let mut recent = self.rate.lock();
        while recent
            .front()
            .is_some_and(|t| now.duration_since(*t) > window)
        {
            recent.pop_front();
        }
        if recent.len() >= limit {
            return false;
        }
        recent.push_back(now);
        true
    }

    /// Stream a stderr line and an exit frame; rate and validation
    /// failures look exactly like a program that printed and exited 1
    fn emit_failure(&self, message: &str, code: i64) {
        self.batcher.push(OutputType::Stderr, message);
        self.batcher.flush();
        let _ = self.sink.send(ServerFrame::Exit {
            session_key: self.session_key.clone(),
            code,
            execution_time: None,
        });
    }
}

/// Composes the engine client, network manager, pool, queue and metrics
/// into the per-submission pipeline
pub struct SessionOrchestrator {
    engine: Arc<dyn ContainerEngine>,
    networks: Arc<NetworkManager>,
    pool: Arc<SessionPool>,
    queue: Arc<ExecutionQueue>,
    metrics: Arc<PipelineMetrics>,
    config: Arc<RunnerConfig>,
    sessions: DashMap<String, Arc<SessionHandle>>,
    submission_seq: AtomicU64,
    /// Self-handle for spawning owned submission tasks
    me: Weak<SessionOrchestrator>,
}

impl SessionOrchestrator {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        networks: Arc<NetworkManager>,
        pool: Arc<SessionPool>,
        queue: Arc<ExecutionQueue>,
        metrics: Arc<PipelineMetrics>,
        config: Arc<RunnerConfig>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            engine,
            networks,
            pool,
            queue,
            metrics,
            config,
            sessions: DashMap::new(),
            submission_seq: AtomicU64::new(0),
            me: me.clone(),
        })
    }

    /// Register a connected socket and greet it with its session key
    pub fn register_session(&self, session_key: String, sink: mpsc::UnboundedSender<ServerFrame>) {
        let batcher = OutputBatcher::new(session_key.clone(), sink.clone());
        let handle = Arc::new(SessionHandle {
            session_key: session_key.clone(),
            sink: sink.clone(),
            batcher,
            rate: parking_lot::Mutex::new(VecDeque::new()),
            active: parking_lot::Mutex::new(None),
            stopped: AtomicBool::new(false),
        });
        self.sessions.insert(session_key.clone(), handle);
        let _ = sink.send(ServerFrame::Session {
            session_key: session_key.clone(),
        });
        info!(session_key = %session_key, "session registered");
    }

    /// Number of registered sessions (cleaner hysteresis input)
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Handle one `run` frame. Failures are streamed to the socket; the
    /// call itself only errors for an unregistered session.
    pub fn submit_run(
        &self,
        session_key: &str,
        language: &str,
        files: Vec<FileEntry>,
        submission_id: Option<String>,
    ) -> Result<()> {
        let this = self
            .me
            .upgrade()
            .ok_or_else(|| Error::Internal("orchestrator is shutting down".to_string()))?;
        let handle = self
            .sessions
            .get(session_key)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| Error::Internal(format!("unknown session {}", session_key)))?;

        // 1. Per-socket rate window
        let limits = &self.config.limits;
        if !handle.rate_allow(
            limits.rate_limit_per_window,
            Duration::from_millis(limits.rate_window_ms),
        ) {
            debug!(session_key = %session_key, "run rejected by rate window");
            handle.emit_failure("Rate limit exceeded. Try again shortly.\n", 1);
            return Ok(());
        }

        // 2-5. Validation, descriptor lookup, entry resolution, command
        // build; all failures stream as stderr + exit 1 and touch nothing
        // below this layer.
        let prepared = self.prepare(language, files);
        let (language, files, command) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                handle.emit_failure(&format!("{}\n", e), 1);
                return Ok(());
            }
        };

        let request = RunRequest {
            session_key: session_key.to_string(),
            submission_id: submission_id.unwrap_or_else(|| {
                format!("sub-{}", self.submission_seq.fetch_add(1, Ordering::Relaxed))
            }),
            language,
            files,
            enqueued_at: Instant::now(),
        };

        let watch = self.metrics.create_stopwatch();
        let started = Arc::new(AtomicBool::new(false));

        let work = {
            let handle = handle.clone();
            let started = started.clone();
            async move {
                started.store(true, Ordering::Release);
                this.run_submission(handle, request, command, watch).await
            }
        };

        match self
            .queue
            .submit(PRIORITY_INTERACTIVE, language.as_str(), work)
        {
            Ok(result_rx) => {
                // Surface queue-side expiry: the work never ran, so nobody
                // else will tell the socket.
                let session_key = session_key.to_string();
                tokio::spawn(async move {
                    let result = result_rx.await;
                    if let Ok(Err(e)) = result {
                        if !started.load(Ordering::Acquire) {
                            warn!(session_key = %session_key, "submission expired in queue: {}", e);
                            handle.emit_failure("Timed out waiting in the execution queue\n", 1);
                        }
                    }
                });
            }
            Err(e) => {
                warn!(session_key = %session_key, "queue rejected submission: {}", e);
                handle.emit_failure("Server is at capacity. Try again shortly.\n", 1);
            }
        }

        Ok(())
    }

    /// Steps 2-5 of the per-submission pipeline: validate the file set,
    /// settle the language, pick the entry, filter C-family sources, and
    /// build the run command.
    fn prepare(
        &self,
        language: &str,
        files: Vec<FileEntry>,
    ) -> Result<(Language, Vec<FileEntry>, Vec<String>)> {
        validate_files(&files, &self.config.limits)?;
        let language = Language::parse(language)?;
        let entry = language::resolve_entry(language, &files)?;
        let language = language::effective_language(language, entry);
        let entry = entry.cloned();
        let files = language::filter_sources(language, &files);
        let command = language::build_command(language, entry.as_ref(), &files)?;
        Ok((language, files, command))
    }

    /// Steps 6-10: acquire, upload, exec, stream, exit, return, record.
    async fn run_submission(
        self: Arc<Self>,
        handle: Arc<SessionHandle>,
        request: RunRequest,
        command: Vec<String>,
        mut watch: Stopwatch,
    ) -> Result<()> {
        let queue_ms = watch.lap();
        let session_key = request.session_key.clone();
        let language = request.language;
        handle.stopped.store(false, Ordering::Release);

        // 6. Acquire loop: network then container, deleting the network
        // and backing off once on failure
        let mut network_ms = 0;
        let mut container_ms = 0;
        let mut acquired = None;
        let mut last_error: Option<Error> = None;
        for attempt in 0..ACQUIRE_ATTEMPTS {
            let result: Result<_> = async {
                let network = self
                    .networks
                    .get_or_create_session_network(&session_key)
                    .await?;
                network_ms = watch.lap();
                let container = self
                    .pool
                    .get_or_create_container(language, &session_key, &network)
                    .await?;
                container_ms = watch.lap();
                Ok(container)
            }
            .await;

            match result {
                Ok(container) => {
                    acquired = Some(container);
                    break;
                }
                Err(e) => {
                    warn!(
                        session_key = %session_key,
                        attempt,
                        "environment acquisition failed: {}",
                        e
                    );
                    let _ = self.networks.delete_session_network(&session_key).await;
                    last_error = Some(e);
                    if attempt + 1 < ACQUIRE_ATTEMPTS {
                        tokio::time::sleep(ACQUIRE_RETRY_DELAY).await;
                    }
                }
            }
        }
        let Some(container) = acquired else {
            handle.emit_failure("Failed to prepare the execution environment\n", 1);
            return Err(last_error.unwrap_or_else(|| {
                Error::Internal("acquisition failed without error".to_string())
            }));
        };
        let container_id = container.container_id.clone();

        // 7. Ship the (already filtered) file set into /app
        let upload = self
            .engine
            .put_files(&container_id, &request.files, "/app")
            .await;
        let file_transfer_ms = watch.lap();
        if let Err(e) = upload {
            warn!(session_key = %session_key, "file upload failed: {}", e);
            handle.emit_failure("Failed to deliver files to the execution environment\n", 1);
            self.finish_container(&container_id, &session_key).await;
            return Err(e);
        }

        // 8. Interactive exec wired into the output batcher
        let exec = self
            .engine
            .exec_interactive(
                &container_id,
                command,
                ExecOptions {
                    work_dir: Some("/app".to_string()),
                    timeout: None,
                },
            )
            .await;
        let exec = match exec {
            Ok(exec) => exec,
            Err(e) => {
                warn!(session_key = %session_key, "exec start failed: {}", e);
                handle.emit_failure("Failed to start the program\n", 1);
                self.finish_container(&container_id, &session_key).await;
                return Err(e);
            }
        };
        let (mut output, exec_handle) = exec.split();
        let exec_id = exec_handle.exec_id.clone();
        *handle.active.lock() = Some(ActiveRun {
            exec: exec_handle,
            container_id: container_id.clone(),
        });

        debug!(
            session_key = %session_key,
            submission_id = %request.submission_id,
            language = %language.as_str(),
            reused = container.reused,
            "program started"
        );

        // 9. Stream until the output ends or the language deadline passes
        let exec_timeout = language
            .descriptor()
            .exec_timeout_ms
            .unwrap_or(self.config.exec_timeout_ms);
        let drained = tokio::time::timeout(Duration::from_millis(exec_timeout), async {
            while let Some(chunk) = output.recv().await {
                let output_type = match chunk.kind {
                    OutputKind::Stdout => OutputType::Stdout,
                    OutputKind::Stderr => OutputType::Stderr,
                };
                handle
                    .batcher
                    .push(output_type, String::from_utf8_lossy(&chunk.data));
            }
        })
        .await;
        let execution_ms = watch.lap();

        let timed_out = drained.is_err();
        if let Some(run) = handle.take_active() {
            if timed_out {
                // Destroy the stream, as if the user had stopped it
                run.exec.kill();
            }
        }
        handle.batcher.flush();

        let stopped = handle.stopped.load(Ordering::Acquire);
        if timed_out && !stopped {
            handle.emit_failure("Execution timed out\n", 1);
        } else if !stopped {
            let code = self
                .engine
                .exec_exit_code(&exec_id)
                .await
                .ok()
                .flatten()
                .unwrap_or(-1);
            let _ = handle.sink.send(ServerFrame::Exit {
                session_key: session_key.clone(),
                code,
                execution_time: Some(execution_ms),
            });
        }

        // 10. Return the container and record the stage timings
        self.finish_container(&container_id, &session_key).await;
        let cleanup_ms = watch.lap();

        self.metrics.record(PipelineTimings {
            queue_ms,
            network_ms,
            container_ms,
            file_transfer_ms,
            execution_ms,
            cleanup_ms,
            total_ms: watch.total(),
            container_reused: container.reused,
            language: language.as_str().to_string(),
        });

        Ok(())
    }

    /// Return the container unless the session was torn down mid-run (its
    /// containers are already gone then)
    async fn finish_container(&self, container_id: &str, session_key: &str) {
        if self.sessions.contains_key(session_key) {
            self.pool.return_container(container_id, session_key).await;
        }
    }

    /// Forward input bytes to the running program, best-effort
    pub fn handle_input(&self, session_key: &str, data: &str) {
        if let Some(handle) = self.sessions.get(session_key) {
            let active = handle.active.lock();
            if let Some(run) = active.as_ref() {
                let _ = run.exec.stdin.send(Bytes::from(data.to_string()));
            }
        }
    }

    /// Manual stop: destroy the exec stream, flush pending output, emit the
    /// termination notice and a single exit frame with code -1.
    pub fn stop(&self, session_key: &str) {
        let Some(handle) = self.sessions.get(session_key).map(|h| Arc::clone(h.value())) else {
            return;
        };
        let Some(run) = handle.take_active() else {
            return;
        };

        handle.stopped.store(true, Ordering::Release);
        run.exec.kill();

        handle.batcher.flush();
        handle.batcher.push(OutputType::System, TERMINATED_NOTICE);
        handle.batcher.flush();
        let _ = handle.sink.send(ServerFrame::Exit {
            session_key: session_key.to_string(),
            code: -1,
            execution_time: None,
        });
        info!(
            session_key = %session_key,
            container_id = %run.container_id,
            "submission stopped by client"
        );
    }

    /// Socket teardown: kill any running exec, stop the batch timer, drop
    /// the session's containers and delete its network, all best-effort.
    pub async fn disconnect(&self, session_key: &str) {
        let Some((_, handle)) = self.sessions.remove(session_key) else {
            return;
        };
        handle.stopped.store(true, Ordering::Release);
        if let Some(run) = handle.take_active() {
            run.exec.kill();
        }
        handle.batcher.stop();

        self.pool.cleanup_session(session_key).await;
        if let Err(e) = self.networks.delete_session_network(session_key).await {
            debug!(session_key = %session_key, "network teardown failed: {}", e);
        }
        info!(session_key = %session_key, "session disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle_with_sink() -> (SessionHandle, mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            session_key: "s1".to_string(),
            sink: tx.clone(),
            batcher: OutputBatcher::new("s1".to_string(), tx),
            rate: parking_lot::Mutex::new(VecDeque::new()),
            active: parking_lot::Mutex::new(None),
            stopped: AtomicBool::new(false),
        };
        (handle, rx)
    }

    #[tokio::test]
    async fn test_rate_window_admits_then_rejects() {
        let (handle, _rx) = handle_with_sink();
        let window = Duration::from_secs(10);
        for _ in 0..3 {
            assert!(handle.rate_allow(3, window));
        }
        assert!(!handle.rate_allow(3, window));
    }

    #[tokio::test]
    async fn test_rate_window_slides() {
        let (handle, _rx) = handle_with_sink();
        let window = Duration::from_millis(30);
        assert!(handle.rate_allow(1, window));
        assert!(!handle.rate_allow(1, window));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.rate_allow(1, window));
    }

    #[tokio::test]
    async fn test_emit_failure_shape() {
        let (handle, mut rx) = handle_with_sink();
        handle.emit_failure("boom\n", 1);

        match rx.try_recv().unwrap() {
            ServerFrame::Output {
                output_type, data, ..
            } => {
                assert_eq!(output_type, OutputType::Stderr);
                assert_eq!(data, "boom\n");
            }
            other => panic!("unexpected frame {:?}", other),
        }
        match rx.try_recv().unwrap() {
            ServerFrame::Exit { code, .. } => assert_eq!(code, 1),
            other => panic!("unexpected frame {:?}", other),
        }
    }
}

//! Prioritized execution queue with bounded concurrency
//!
//! Two static priority levels, FIFO within a level. Admission is rejected
//! outright once the waiting list reaches its cap; waiting tasks that
//! outlive the queue timeout are expired before dispatch ever sees them.
//! A task's own failure is caught and counted, never reaching the
//! dispatcher.

use crate::config::QueueConfig;
use crate::{Error, Result};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

/// Priority of request-response API submissions
pub const PRIORITY_API: u8 = 1;
/// Priority of interactive socket-driven submissions
pub const PRIORITY_INTERACTIVE: u8 = 2;

/// How many task durations feed the rolling average
const DURATION_WINDOW: usize = 100;

/// Dispatcher poll interval when idle; expiry is also re-checked on every
/// completion and enqueue
const IDLE_POLL: Duration = Duration::from_millis(250);

type TaskFuture = BoxFuture<'static, Result<()>>;

struct QueuedTask {
    work: TaskFuture,
    result_tx: oneshot::Sender<Result<()>>,
    priority: u8,
    enqueued_at: Instant,
    language: String,
}

struct QueueState {
    waiting: Vec<QueuedTask>,
    active: usize,
    completed: u64,
    failed: u64,
    durations: VecDeque<Duration>,
}

/// Queue stats snapshot
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub active: usize,
    pub max_concurrent: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    /// Mean of the last 100 completed task durations, milliseconds
    pub average_task_time_ms: f64,
    pub max_queue_size: usize,
}

/// Admission, ordering, and dispatch of run tasks
pub struct ExecutionQueue {
    config: QueueConfig,
    state: parking_lot::Mutex<QueueState>,
    kick: Notify,
}

impl ExecutionQueue {
    /// Create the queue and start its dispatcher. The dispatcher exits on
    /// its own once the last reference to the queue is dropped.
    pub fn new(config: QueueConfig) -> Arc<Self> {
        let queue = Arc::new(Self {
            config,
            state: parking_lot::Mutex::new(QueueState {
                waiting: Vec::new(),
                active: 0,
                completed: 0,
                failed: 0,
                durations: VecDeque::with_capacity(DURATION_WINDOW),
            }),
            kick: Notify::new(),
        });
        Self::spawn_dispatcher(Arc::downgrade(&queue));
        queue
    }

    /// Admit a task. Fails immediately with `QueueFull` when the waiting
    /// list is at capacity. The returned receiver resolves with the task's
    /// own result, or with `Timeout` if the task expired before dispatch.
    pub fn submit<F>(
        &self,
        priority: u8,
        language: impl Into<String>,
        work: F,
    ) -> Result<oneshot::Receiver<Result<()>>>
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            if state.waiting.len() >= self.config.max_queue_size {
                return Err(Error::QueueFull(format!(
                    "{} tasks waiting, limit is {}",
                    state.waiting.len(),
                    self.config.max_queue_size
                )));
            }

            let task = QueuedTask {
                work: Box::pin(work),
                result_tx,
                priority,
                enqueued_at: Instant::now(),
                language: language.into(),
            };

            // Keep the list sorted by (priority desc, enqueued_at asc):
            // insert before the first strictly-lower priority entry
            let position = state
                .waiting
                .iter()
                .position(|t| t.priority < priority)
                .unwrap_or(state.waiting.len());
            state.waiting.insert(position, task);
        }
        self.kick.notify_one();
        Ok(result_rx)
    }

    /// Stats snapshot
    pub fn get_stats(&self) -> QueueStats {
        let state = self.state.lock();
        let average_task_time_ms = if state.durations.is_empty() {
            0.0
        } else {
            let total: Duration = state.durations.iter().sum();
            total.as_secs_f64() * 1000.0 / state.durations.len() as f64
        };
        QueueStats {
            queued: state.waiting.len(),
            active: state.active,
            max_concurrent: self.config.max_concurrent,
            completed_tasks: state.completed,
            failed_tasks: state.failed,
            average_task_time_ms,
            max_queue_size: self.config.max_queue_size,
        }
    }

    fn spawn_dispatcher(queue: Weak<Self>) {
        tokio::spawn(async move {
            loop {
                let Some(this) = queue.upgrade() else {
                    break;
                };
                this.dispatch_cycle();

                // A submit or completion between the cycle and this wait
                // leaves a stored permit, so the wakeup is not lost
                tokio::select! {
                    _ = this.kick.notified() => {}
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
            }
        });
    }

    /// One dispatch cycle: expire stale waiters, then fill free slots.
    /// Each dispatched task runs in its own spawned task; nothing here
    /// awaits a task.
    fn dispatch_cycle(self: &Arc<Self>) {
        let timeout = Duration::from_millis(self.config.queue_timeout_ms);
        let now = Instant::now();

        let mut expired = Vec::new();
        let mut runnable = Vec::new();
        {
            let mut state = self.state.lock();
            let waiting = std::mem::take(&mut state.waiting);
            for task in waiting {
                if now.duration_since(task.enqueued_at) > timeout {
                    expired.push(task);
                } else {
                    state.waiting.push(task);
                }
            }
            state.failed += expired.len() as u64;

            while state.active < self.config.max_concurrent && !state.waiting.is_empty() {
                let task = state.waiting.remove(0);
                state.active += 1;
                runnable.push(task);
            }
        }

        for task in expired {
            warn!(
                language = %task.language,
                waited_ms = now.duration_since(task.enqueued_at).as_millis() as u64,
                "queued task expired before dispatch"
            );
            let _ = task.result_tx.send(Err(Error::Timeout(
                "queued too long before dispatch".to_string(),
            )));
        }

        for task in runnable {
            let this = self.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                debug!(
                    language = %task.language,
                    priority = task.priority,
                    queued_ms = started.duration_since(task.enqueued_at).as_millis() as u64,
                    "task dispatched"
                );
                let result = task.work.await;

                {
                    let mut state = this.state.lock();
                    state.active -= 1;
                    if result.is_ok() {
                        state.completed += 1;
                        if state.durations.len() == DURATION_WINDOW {
                            state.durations.pop_front();
                        }
                        state.durations.push_back(started.elapsed());
                    } else {
                        state.failed += 1;
                    }
                }

                let _ = task.result_tx.send(result);
                this.kick.notify_one();
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn queue(max_concurrent: usize, max_queue_size: usize, timeout_ms: u64) -> Arc<ExecutionQueue> {
        ExecutionQueue::new(QueueConfig {
            max_concurrent,
            max_queue_size,
            queue_timeout_ms: timeout_ms,
        })
    }

    #[tokio::test]
    async fn test_tasks_complete() {
        let q = queue(2, 10, 60_000);
        let rx = q.submit(PRIORITY_API, "python", async { Ok(()) }).unwrap();
        assert!(rx.await.unwrap().is_ok());

        let stats = q.get_stats();
        assert_eq!(stats.completed_tasks, 1);
        assert_eq!(stats.failed_tasks, 0);
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let q = queue(1, 10, 60_000);
        let order = Arc::new(Mutex::new(Vec::new()));

        // Hold the single slot so the rest queue up
        let (hold_tx, hold_rx) = oneshot::channel::<()>();
        let blocker = q
            .submit(PRIORITY_INTERACTIVE, "python", async move {
                let _ = hold_rx.await;
                Ok(())
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut receivers = Vec::new();
        for (name, priority) in [
            ("api-1", PRIORITY_API),
            ("socket-1", PRIORITY_INTERACTIVE),
            ("api-2", PRIORITY_API),
            ("socket-2", PRIORITY_INTERACTIVE),
        ] {
            let order = order.clone();
            receivers.push(
                q.submit(priority, "python", async move {
                    order.lock().unwrap().push(name);
                    Ok(())
                })
                .unwrap(),
            );
        }

        hold_tx.send(()).unwrap();
        blocker.await.unwrap().unwrap();
        for rx in receivers {
            rx.await.unwrap().unwrap();
        }

        assert_eq!(
            *order.lock().unwrap(),
            vec!["socket-1", "socket-2", "api-1", "api-2"]
        );
    }

    #[tokio::test]
    async fn test_queue_full_boundary() {
        let q = queue(1, 1, 60_000);

        let (hold_tx, hold_rx) = oneshot::channel::<()>();
        let running = q
            .submit(PRIORITY_INTERACTIVE, "python", async move {
                let _ = hold_rx.await;
                Ok(())
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Exactly at max_queue_size succeeds
        let waiting = q.submit(PRIORITY_INTERACTIVE, "python", async { Ok(()) });
        assert!(waiting.is_ok());

        // One past it is rejected
        let overflow = q.submit(PRIORITY_INTERACTIVE, "python", async { Ok(()) });
        assert!(matches!(overflow, Err(Error::QueueFull(_))));

        hold_tx.send(()).unwrap();
        running.await.unwrap().unwrap();
        waiting.unwrap().await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stale_task_expires() {
        let q = queue(1, 10, 50);

        let (hold_tx, hold_rx) = oneshot::channel::<()>();
        let running = q
            .submit(PRIORITY_INTERACTIVE, "python", async move {
                let _ = hold_rx.await;
                Ok(())
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stale = q
            .submit(PRIORITY_INTERACTIVE, "python", async { Ok(()) })
            .unwrap();

        // Keep the slot busy past the queue timeout
        tokio::time::sleep(Duration::from_millis(120)).await;
        hold_tx.send(()).unwrap();
        running.await.unwrap().unwrap();

        let result = stale.await.unwrap();
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(q.get_stats().failed_tasks, 1);
    }

    #[tokio::test]
    async fn test_task_failure_does_not_stall_dispatch() {
        let q = queue(1, 10, 60_000);

        let failing = q
            .submit(PRIORITY_INTERACTIVE, "python", async {
                Err(Error::Internal("boom".to_string()))
            })
            .unwrap();
        assert!(failing.await.unwrap().is_err());

        let ok = q.submit(PRIORITY_INTERACTIVE, "python", async { Ok(()) }).unwrap();
        assert!(ok.await.unwrap().is_ok());

        let stats = q.get_stats();
        assert_eq!(stats.failed_tasks, 1);
        assert_eq!(stats.completed_tasks, 1);
    }
}

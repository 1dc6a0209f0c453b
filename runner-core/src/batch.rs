//! Batched fan-out of program output
//!
//! Outgoing stdout/stderr chunks are buffered and flushed on a short timer;
//! a flush coalesces adjacent chunks of the same stream by concatenation so
//! chatty programs cost one frame per tick instead of one frame per write.
//! Ordering between stdout and stderr is preserved as observed from the
//! exec stream reader.

use crate::protocol::{OutputType, ServerFrame};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

/// Flush tick
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Single-writer per-socket output buffer with a periodic flush
pub struct OutputBatcher {
    session_key: String,
    sink: mpsc::UnboundedSender<ServerFrame>,
    buffer: parking_lot::Mutex<Vec<(OutputType, String)>>,
    timer: parking_lot::Mutex<Option<tokio::task::AbortHandle>>,
}

impl OutputBatcher {
    /// Create the batcher and start its flush timer
    pub fn new(session_key: String, sink: mpsc::UnboundedSender<ServerFrame>) -> Arc<Self> {
        let batcher = Arc::new(Self {
            session_key,
            sink,
            buffer: parking_lot::Mutex::new(Vec::new()),
            timer: parking_lot::Mutex::new(None),
        });

        let weak: Weak<OutputBatcher> = Arc::downgrade(&batcher);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(batcher) = weak.upgrade() else {
                    break;
                };
                batcher.flush();
            }
        });
        *batcher.timer.lock() = Some(handle.abort_handle());

        batcher
    }

    /// Buffer one chunk
    pub fn push(&self, output_type: OutputType, data: impl Into<String>) {
        self.buffer.lock().push((output_type, data.into()));
    }

    /// Emit the buffered chunks now: adjacent entries of the same stream
    /// are concatenated, each resulting frame is sent once, the buffer is
    /// cleared.
    pub fn flush(&self) {
        let pending = {
            let mut buffer = self.buffer.lock();
            if buffer.is_empty() {
                return;
            }
            std::mem::take(&mut *buffer)
        };

        let mut coalesced: Vec<(OutputType, String)> = Vec::new();
        for (output_type, data) in pending {
            match coalesced.last_mut() {
                Some((last_type, last_data)) if *last_type == output_type => {
                    last_data.push_str(&data);
                }
                _ => coalesced.push((output_type, data)),
            }
        }

        for (output_type, data) in coalesced {
            let _ = self.sink.send(ServerFrame::Output {
                session_key: self.session_key.clone(),
                output_type,
                data,
            });
        }
    }

    /// Stop the flush timer and emit anything still buffered
    pub fn stop(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
        self.flush();
    }
}

impl Drop for OutputBatcher {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }
}

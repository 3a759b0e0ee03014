//! Serialized outbound writes
//!
//! Every write to the device goes through one [`WriteSerializer`] per link.
//! Entries are written strictly in enqueue order, one at a time, by a single
//! drain task; an optional delay after an entry holds back the next one.
//! Each enqueue returns a [`WriteTicket`] that resolves once the entry has
//! been handed to the transport, or was dropped.

use crate::transport::Transport;
use hublink_core::{thread_safe, ThreadSafe};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Completion handle of one queued write
#[derive(Debug)]
pub struct WriteTicket {
    rx: oneshot::Receiver<bool>,
}

impl WriteTicket {
    fn resolved(flushed: bool) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(flushed);
        Self { rx }
    }

    /// Wait for the write. `true` once written, `false` if it failed or was
    /// abandoned.
    pub async fn flushed(self) -> bool {
        self.rx.await.unwrap_or(false)
    }
}

struct Entry {
    data: Vec<u8>,
    delay_after: Duration,
    done: oneshot::Sender<bool>,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<Entry>,
    draining: bool,
    closed: bool,
}

impl QueueState {
    fn abandon_entries(&mut self) -> usize {
        let abandoned = self.entries.len();
        for entry in self.entries.drain(..) {
            let _ = entry.done.send(false);
        }
        abandoned
    }
}

/// FIFO write queue in front of a transport
pub struct WriteSerializer {
    transport: Arc<dyn Transport>,
    state: ThreadSafe<QueueState>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
    runtime: Option<Handle>,
}

impl WriteSerializer {
    /// Create a queue writing to `transport`.
    ///
    /// The drain task runs on the runtime the queue was created in, so
    /// entries may be enqueued from any thread afterwards.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            state: thread_safe(QueueState::default()),
            drain_task: Mutex::new(None),
            runtime: Handle::try_current().ok(),
        }
    }

    /// Queue `data`, holding back the next entry for `delay_after` once written.
    ///
    /// Without a runtime to drain on, the ticket resolves `false` right away.
    pub fn enqueue(&self, data: Vec<u8>, delay_after: Duration) -> WriteTicket {
        let Some(runtime) = self.runtime.clone().or_else(|| Handle::try_current().ok()) else {
            tracing::warn!("No tokio runtime to write {} byte(s) on", data.len());
            return WriteTicket::resolved(false);
        };

        let (done, rx) = oneshot::channel();
        let start_drain = {
            let mut state = self.state.lock();
            if state.closed {
                return WriteTicket::resolved(false);
            }
            state.entries.push_back(Entry {
                data,
                delay_after,
                done,
            });
            !std::mem::replace(&mut state.draining, true)
        };

        if start_drain {
            let task = runtime.spawn(drain(Arc::clone(&self.transport), Arc::clone(&self.state)));
            *self.drain_task.lock() = Some(task);
        }

        WriteTicket { rx }
    }

    /// Number of entries not yet picked up by the drain task
    pub fn pending(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether nothing is queued or being written
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.entries.is_empty() && !state.draining
    }

    /// Drop everything queued and refuse further writes.
    ///
    /// Pending tickets, including the one being written, resolve `false`.
    pub fn abandon(&self) {
        let abandoned = {
            let mut state = self.state.lock();
            state.closed = true;
            state.draining = false;
            state.abandon_entries()
        };
        if let Some(task) = self.drain_task.lock().take() {
            task.abort();
        }
        if abandoned > 0 {
            tracing::debug!("Abandoned {} queued write(s)", abandoned);
        }
    }
}

impl Drop for WriteSerializer {
    fn drop(&mut self) {
        self.abandon();
    }
}

async fn drain(transport: Arc<dyn Transport>, state: ThreadSafe<QueueState>) {
    loop {
        let next = {
            let mut state = state.lock();
            match state.entries.pop_front() {
                Some(entry) => entry,
                None => {
                    state.draining = false;
                    return;
                }
            }
        };

        match transport.write(&next.data).await {
            Ok(()) => {
                let _ = next.done.send(true);
                if !next.delay_after.is_zero() {
                    tokio::time::sleep(next.delay_after).await;
                }
            }
            Err(e) => {
                tracing::warn!("Write of {} byte(s) failed: {}", next.data.len(), e);
                let _ = next.done.send(false);
                let mut state = state.lock();
                let abandoned = state.abandon_entries();
                state.draining = false;
                if abandoned > 0 {
                    tracing::debug!("Dropped {} write(s) queued behind the failure", abandoned);
                }
                return;
            }
        }
    }
}

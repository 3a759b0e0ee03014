//! Inbound read loop
//!
//! One task per link pulls chunks from the transport and hands each to the
//! registered notification sink. The loop ends when the keep-reading flag is
//! cleared, the loop is cancelled, or the stream ends or fails. An end that
//! was not requested is reported as a device-initiated loss.

use crate::transport::{LinkContext, Transport};
use hublink_core::NotifySlot;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handle to a running read loop
pub struct ReadLoop {
    keep_reading: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ReadLoop {
    /// Start reading from `transport`, delivering chunks to the sink in `sink`
    pub fn start(transport: Arc<dyn Transport>, sink: NotifySlot, link: LinkContext) -> Self {
        let keep_reading = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(
            transport,
            sink,
            link,
            Arc::clone(&keep_reading),
            cancel.clone(),
        ));

        Self {
            keep_reading,
            cancel,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    /// Whether the loop task is still running
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Stop the loop and wait for it to release the reader. Idempotent.
    ///
    /// No sink call happens after this returns.
    pub async fn stop(&self) {
        self.keep_reading.store(false, Ordering::Release);
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("Read loop ended abnormally: {}", e);
            }
        }
    }
}

async fn run(
    transport: Arc<dyn Transport>,
    sink: NotifySlot,
    link: LinkContext,
    keep_reading: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    tracing::debug!("Read loop started for {}", link.handle_id());

    while keep_reading.load(Ordering::Acquire) && transport.is_readable() {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            read = transport.read() => read,
        };

        match chunk {
            Ok(Some(bytes)) => {
                if cancel.is_cancelled() {
                    break;
                }
                if bytes.is_empty() {
                    continue;
                }
                deliver(&sink, &bytes);
            }
            Ok(None) => {
                tracing::debug!("Inbound stream of {} ended", link.handle_id());
                break;
            }
            Err(e) => {
                tracing::warn!("Read from {} failed: {}", link.handle_id(), e);
                break;
            }
        }
    }

    transport.release_reader().await;

    if cancel.is_cancelled() || !keep_reading.load(Ordering::Acquire) {
        tracing::debug!("Read loop for {} stopped", link.handle_id());
    } else {
        tracing::info!("{} ended by the device", link.handle_id());
        link.report_lost();
    }
}

fn deliver(sink: &NotifySlot, bytes: &[u8]) {
    let callback = sink.read().clone();
    if let Some(callback) = callback {
        if catch_unwind(AssertUnwindSafe(|| callback(bytes))).is_err() {
            tracing::error!("Notification sink panicked on a {} byte chunk", bytes.len());
        }
    }
}

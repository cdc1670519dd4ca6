//! Reconciliation poller.
//!
//! The authority of last resort: on a fixed interval it fetches the server's
//! document list and overwrites locally derived status with server truth. If
//! the event stream and the poller disagree, the poller's latest read wins,
//! because it reflects durable server state rather than a potentially
//! replayed or lost event. Terminal items stay immutable either way.
//!
//! The poller stops itself the moment a scan finds zero non-terminal items
//! and is restarted whenever new non-terminal items appear (a fresh
//! submission or a restored snapshot).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{DocumentRecord, DocumentStatus};
use crate::storage::DocumentListProvider;
use crate::upload::orchestrator::SharedBatch;

/// Default reconciliation interval.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Generic stage label for items the server reports as still processing.
const SERVER_PROCESSING_MESSAGE: &str = "Processing on the server...";

/// Item error used when the server reports a failure the stream never
/// delivered in detail.
const SERVER_FAILED_MESSAGE: &str = "Processing failed on the server.";

/// Periodically reconciles tracked items against the server document list.
pub struct ReconcilePoller {
    interval: Duration,
    running: Arc<AtomicBool>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl ReconcilePoller {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            running: Arc::new(AtomicBool::new(false)),
            cancel: Mutex::new(None),
        }
    }

    /// True while the background scan loop is alive.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts the scan loop unless it is already running.
    pub(crate) fn ensure_running(
        &self,
        shared: Arc<SharedBatch>,
        provider: Arc<dyn DocumentListProvider>,
    ) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let token = CancellationToken::new();
        *self.cancel.lock().expect("poller cancel lock poisoned") = Some(token.clone());

        let running = self.running.clone();
        let interval = self.interval;

        tokio::spawn(async move {
            info!("[RECONCILE] Poller started (every {:?})", interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                match provider.list_documents().await {
                    Ok(docs) => {
                        let remaining = reconcile(&shared, &docs).await;
                        if remaining == 0 {
                            info!("[RECONCILE] All tracked items settled, poller stopping");
                            break;
                        }
                    }
                    Err(e) => {
                        // Transient poll failures are retried on the next tick
                        warn!("[RECONCILE] Poll failed (will retry): {e}");
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
        });
    }

    /// Stops the scan loop, if any. Used on session teardown.
    pub(crate) fn shutdown(&self) {
        if let Some(token) = self
            .cancel
            .lock()
            .expect("poller cancel lock poisoned")
            .take()
        {
            token.cancel();
        }
    }
}

impl Drop for ReconcilePoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Overwrites local state from one server scan. Returns the number of items
/// still non-terminal afterwards.
async fn reconcile(shared: &SharedBatch, docs: &[DocumentRecord]) -> usize {
    shared
        .mutate(|batch| {
            for doc in docs {
                let Some(item_id) = batch.item_id_by_server_id(&doc.document_id) else {
                    // Not one of ours (or the stream has not reported an id yet)
                    continue;
                };
                match doc.status {
                    DocumentStatus::Processed => {
                        batch.mark_completed(&item_id);
                    }
                    DocumentStatus::Failed => {
                        batch.mark_failed(&item_id, SERVER_FAILED_MESSAGE);
                    }
                    DocumentStatus::Processing => {
                        batch.reconcile_processing(&item_id, SERVER_PROCESSING_MESSAGE);
                    }
                }
            }
            batch.non_terminal_count()
        })
        .await
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

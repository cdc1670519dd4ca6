//! Upload orchestration.
//!
//! One [`UploadOrchestrator`] instance per application session owns the
//! shared batch, the snapshot mirror, and the reconciliation poller; there
//! is no module-level singleton. `submit` partitions accepted items into one
//! group for local files plus one group per distinct drive account, so each
//! account's files flow through that account's own pipeline invocation and
//! one expired credential cannot block another account's uploads.
//!
//! All batch mutation funnels through [`SharedBatch`]: the streaming fold,
//! the poller, and the command surface serialize on one lock, publish the
//! refreshed aggregate view, and mirror the batch into the snapshot slot.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::accounts::AccountHandle;
use crate::backend::{BackendClient, DocumentRecord, EventStream, UploadFile};
use crate::error::{AppError, TRANSPORT_FAILURE_MESSAGE};
use crate::storage::snapshot::{PersistedSnapshot, SnapshotStore};
use crate::storage::DocumentListProvider;
use crate::upload::poller::{ReconcilePoller, POLL_INTERVAL};
use crate::upload::progress;
use crate::upload::quota::{QuotaGuard, RejectedSelection, UsageLimits};
use crate::upload::scheduler::PipelineScheduler;
use crate::upload::source::{self, RawSelection};
use crate::upload::types::{BatchSummary, IngestionItem, ItemSource, UploadBatch};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum pipeline invocations streaming at once.
const MAX_CONCURRENT_PIPELINES: usize = 3;

// ─────────────────────────────────────────────────────────────────────────────
// Traits for Testing
// ─────────────────────────────────────────────────────────────────────────────

/// Trait for pipeline calls, allowing test fakes.
pub trait PipelineOps: Send + Sync + Clone + 'static {
    /// Submits local payloads; resolves to the pipeline's event stream.
    fn upload_local_files(
        &self,
        files: Vec<UploadFile>,
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, AppError>> + Send + '_>>;

    /// Submits drive file references for one account.
    fn ingest_drive_files(
        &self,
        account_id: String,
        handle: AccountHandle,
        file_ids: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, AppError>> + Send + '_>>;

    /// Fetches the server's current document list.
    fn list_documents(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DocumentRecord>, AppError>> + Send + '_>>;
}

/// Implementation of PipelineOps for the real BackendClient.
impl PipelineOps for BackendClient {
    fn upload_local_files(
        &self,
        files: Vec<UploadFile>,
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, AppError>> + Send + '_>> {
        Box::pin(async move { BackendClient::upload_local_files(self, &files).await })
    }

    fn ingest_drive_files(
        &self,
        account_id: String,
        handle: AccountHandle,
        file_ids: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, AppError>> + Send + '_>> {
        Box::pin(async move {
            BackendClient::ingest_drive_files(self, &account_id, &handle, &file_ids).await
        })
    }

    fn list_documents(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DocumentRecord>, AppError>> + Send + '_>> {
        Box::pin(BackendClient::list_documents(self))
    }
}

/// Trait for snapshot persistence, allowing test fakes.
pub trait SnapshotOps: Send + Sync {
    fn save<'a>(
        &'a self,
        snapshot: &'a PersistedSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + 'a>>;

    fn delete(&self) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + '_>>;

    fn restore<'a>(
        &'a self,
        provider: &'a dyn DocumentListProvider,
    ) -> Pin<Box<dyn Future<Output = Result<Option<UploadBatch>, AppError>> + Send + 'a>>;
}

/// Real implementation of SnapshotOps backed by the SQLite slot.
impl SnapshotOps for SnapshotStore {
    fn save<'a>(
        &'a self,
        snapshot: &'a PersistedSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + 'a>> {
        Box::pin(SnapshotStore::save(self, snapshot))
    }

    fn delete(&self) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + '_>> {
        Box::pin(SnapshotStore::delete(self))
    }

    fn restore<'a>(
        &'a self,
        provider: &'a dyn DocumentListProvider,
    ) -> Pin<Box<dyn Future<Output = Result<Option<UploadBatch>, AppError>> + Send + 'a>> {
        Box::pin(SnapshotStore::restore(self, provider))
    }
}

/// Adapter exposing a pipeline client's polling call as a
/// [`DocumentListProvider`] for the poller and the snapshot store.
struct ClientDocs<C: PipelineOps>(C);

impl<C: PipelineOps> DocumentListProvider for ClientDocs<C> {
    fn list_documents<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DocumentRecord>, AppError>> + Send + 'a>> {
        self.0.list_documents()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SharedBatch
// ─────────────────────────────────────────────────────────────────────────────

/// The batch state shared by the orchestrator's tasks.
///
/// A single async lock serializes every mutation path (stream fold, poller,
/// commands), which is what makes the unordered merge of streaming and
/// polling updates safe without any further discipline. Each mutation
/// publishes the refreshed summary on the watch channel and mirrors the
/// batch into the snapshot slot.
pub struct SharedBatch {
    batch: Mutex<UploadBatch>,
    view_tx: watch::Sender<BatchSummary>,
    store: Arc<dyn SnapshotOps>,
}

impl SharedBatch {
    pub(crate) fn new(store: Arc<dyn SnapshotOps>) -> Arc<Self> {
        let (view_tx, _) = watch::channel(BatchSummary::empty());
        Arc::new(Self {
            batch: Mutex::new(UploadBatch::new()),
            view_tx,
            store,
        })
    }

    /// Subscribes to the aggregate view.
    pub(crate) fn subscribe(&self) -> watch::Receiver<BatchSummary> {
        self.view_tx.subscribe()
    }

    /// Runs a mutation under the batch lock, then publishes the new view and
    /// mirrors the batch into the snapshot slot.
    pub(crate) async fn mutate<R>(&self, f: impl FnOnce(&mut UploadBatch) -> R) -> R {
        let (result, snapshot, summary) = {
            let mut batch = self.batch.lock().await;
            let result = f(&mut batch);
            (
                result,
                PersistedSnapshot::from_batch(&batch),
                batch.summary(),
            )
        };
        self.view_tx.send_replace(summary);
        if let Err(e) = self.store.save(&snapshot).await {
            // Tracking continues on the live path even if the mirror lags
            warn!("[UPLOAD-ORCHESTRATOR] Snapshot save failed: {e}");
        }
        result
    }

    /// Runs a read-only closure under the batch lock.
    pub(crate) async fn read<R>(&self, f: impl FnOnce(&UploadBatch) -> R) -> R {
        let batch = self.batch.lock().await;
        f(&batch)
    }

    /// Empties the batch and deletes its persisted mirror.
    async fn clear_and_forget(&self) -> Result<(), AppError> {
        {
            let mut batch = self.batch.lock().await;
            batch.clear();
            self.view_tx.send_replace(batch.summary());
        }
        self.store.delete().await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Partitions
// ─────────────────────────────────────────────────────────────────────────────

/// What a partition submits to its pipeline invocation.
enum PartitionKind {
    Local { files: Vec<UploadFile> },
    Account {
        account_id: String,
        handle: AccountHandle,
        file_ids: Vec<String>,
    },
}

/// One pipeline invocation's worth of items. `item_ids` is ordered exactly
/// like the submitted file list; event `file_index` resolves through it.
struct Partition {
    label: String,
    kind: PartitionKind,
    item_ids: Vec<String>,
}

/// Groups items into one local partition plus one per distinct account.
///
/// Restored placeholders (no payload, no handle) are skipped: they are
/// reconciled by the poller, never re-submitted.
fn partition_items(items: &[IngestionItem]) -> Vec<Partition> {
    let mut local_ids: Vec<String> = Vec::new();
    let mut local_files: Vec<UploadFile> = Vec::new();
    let mut accounts: Vec<Partition> = Vec::new();

    for item in items {
        match item.source {
            ItemSource::Local => {
                let Some(payload) = &item.payload else {
                    continue;
                };
                local_ids.push(item.id.clone());
                local_files.push(UploadFile {
                    filename: item.display_name.clone(),
                    bytes: payload.bytes.clone(),
                    sha256: payload.sha256.clone(),
                });
            }
            ItemSource::Remote => {
                let Some(account) = &item.account else {
                    continue;
                };
                let Some(handle) = &account.handle else {
                    continue;
                };
                let Some(file_id) = &item.remote_file_id else {
                    continue;
                };

                let existing = accounts.iter_mut().find(|p| {
                    matches!(&p.kind, PartitionKind::Account { account_id, .. } if *account_id == account.id)
                });
                match existing {
                    Some(partition) => {
                        partition.item_ids.push(item.id.clone());
                        if let PartitionKind::Account { file_ids, .. } = &mut partition.kind {
                            file_ids.push(file_id.clone());
                        }
                    }
                    None => accounts.push(Partition {
                        label: format!("account:{}", account.id),
                        kind: PartitionKind::Account {
                            account_id: account.id.clone(),
                            handle: handle.clone(),
                            file_ids: vec![file_id.clone()],
                        },
                        item_ids: vec![item.id.clone()],
                    }),
                }
            }
        }
    }

    let mut partitions = Vec::new();
    if !local_ids.is_empty() {
        partitions.push(Partition {
            label: "local".to_string(),
            kind: PartitionKind::Local { files: local_files },
            item_ids: local_ids,
        });
    }
    partitions.extend(accounts);
    partitions
}

/// Runs one partition's pipeline invocation to completion.
///
/// A failure before the stream opens, or a mid-stream transport failure,
/// leaves every affected item failed locally and re-raises the error so a
/// caller awaiting settlement observes the rejection. Other partitions are
/// unaffected.
async fn run_partition<C: PipelineOps>(
    client: C,
    shared: Arc<SharedBatch>,
    scheduler: PipelineScheduler,
    partition: Partition,
) -> Result<(), AppError> {
    let Partition {
        label,
        kind,
        item_ids,
    } = partition;

    let _permit = scheduler.acquire().await;
    info!(
        "[UPLOAD-ORCHESTRATOR] Partition {} streaming {} item(s)",
        label,
        item_ids.len()
    );

    let stream = match kind {
        PartitionKind::Local { files } => client.upload_local_files(files).await,
        PartitionKind::Account {
            account_id,
            handle,
            file_ids,
        } => client.ingest_drive_files(account_id, handle, file_ids).await,
    };

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            warn!("[UPLOAD-ORCHESTRATOR] Partition {label} could not start: {e}");
            progress::fail_pending(&shared, &item_ids, TRANSPORT_FAILURE_MESSAGE).await;
            return Err(e);
        }
    };

    progress::consume_stream(&shared, &item_ids, stream).await
}

// ─────────────────────────────────────────────────────────────────────────────
// UploadOrchestrator
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of a submission, after the quota pre-filter.
#[derive(Debug)]
pub struct SubmitReceipt {
    /// Items that entered the batch.
    pub accepted: usize,
    /// Selections dropped before any network activity, with reasons.
    pub rejected: Vec<RejectedSelection>,
}

/// Owns the batch, dispatches partitions, and exposes the aggregate view.
pub struct UploadOrchestrator<C: PipelineOps, S: SnapshotOps + 'static> {
    client: C,
    shared: Arc<SharedBatch>,
    store: Arc<S>,
    docs: Arc<dyn DocumentListProvider>,
    scheduler: PipelineScheduler,
    poller: ReconcilePoller,
    quota: RwLock<QuotaGuard>,
    tasks: Mutex<JoinSet<Result<(), AppError>>>,
}

impl<C: PipelineOps, S: SnapshotOps + 'static> UploadOrchestrator<C, S> {
    pub fn new(client: C, store: Arc<S>, limits: UsageLimits) -> Self {
        Self::with_poll_interval(client, store, limits, POLL_INTERVAL)
    }

    /// Like [`UploadOrchestrator::new`] with an explicit reconciliation
    /// interval.
    pub fn with_poll_interval(
        client: C,
        store: Arc<S>,
        limits: UsageLimits,
        poll_interval: Duration,
    ) -> Self {
        let shared = SharedBatch::new(store.clone() as Arc<dyn SnapshotOps>);
        let docs: Arc<dyn DocumentListProvider> = Arc::new(ClientDocs(client.clone()));
        Self {
            client,
            shared,
            store,
            docs,
            scheduler: PipelineScheduler::new(MAX_CONCURRENT_PIPELINES),
            poller: ReconcilePoller::new(poll_interval),
            quota: RwLock::new(QuotaGuard::new(limits)),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Replaces the plan limits used by the pre-submission check.
    pub fn set_usage_limits(&self, limits: UsageLimits) {
        *self.quota.write().expect("quota lock poisoned") = QuotaGuard::new(limits);
    }

    /// Submits a selection of files for ingestion.
    ///
    /// Quota-rejected selections are dropped synchronously with a reason and
    /// never reach the network. Accepted items enter the batch immediately;
    /// their partitions stream concurrently in the background.
    pub async fn submit(&self, selections: Vec<RawSelection>) -> Result<SubmitReceipt, AppError> {
        let decision = self
            .quota
            .read()
            .expect("quota lock poisoned")
            .evaluate(selections);
        for rejection in &decision.rejected {
            info!(
                "[UPLOAD-ORCHESTRATOR] Rejected {} before submission: {}",
                rejection.display_name, rejection.reason
            );
        }
        if decision.accepted.is_empty() {
            return Ok(SubmitReceipt {
                accepted: 0,
                rejected: decision.rejected,
            });
        }

        let mut items = source::normalize(decision.accepted);

        // The same remote file queued twice keeps its existing tracking row
        let existing: HashSet<String> = self
            .shared
            .read(|batch| batch.items().iter().map(|i| i.id.clone()).collect())
            .await;
        items.retain(|item| !existing.contains(&item.id));
        if items.is_empty() {
            return Ok(SubmitReceipt {
                accepted: 0,
                rejected: decision.rejected,
            });
        }

        let partitions = partition_items(&items);
        let accepted = items.len();
        info!(
            "[UPLOAD-ORCHESTRATOR] Submitting {} item(s) across {} partition(s)",
            accepted,
            partitions.len()
        );

        self.shared.mutate(|batch| batch.push_items(items)).await;

        {
            let mut tasks = self.tasks.lock().await;
            for partition in partitions {
                let client = self.client.clone();
                let shared = self.shared.clone();
                let scheduler = self.scheduler.clone();
                tasks.spawn(run_partition(client, shared, scheduler, partition));
            }
        }

        // The poller backstops the whole batch, not individual partitions
        self.poller
            .ensure_running(self.shared.clone(), self.docs.clone());

        Ok(SubmitReceipt {
            accepted,
            rejected: decision.rejected,
        })
    }

    /// Removes a queued item. Permitted only while the item is still
    /// pending; anything already in flight must run to a terminal state.
    pub async fn remove(&self, item_id: &str) -> Result<(), AppError> {
        self.shared
            .mutate(|batch| batch.remove_pending(item_id))
            .await
    }

    /// Discards the batch and its persisted mirror. Permitted only once
    /// every item is terminal.
    pub async fn clear(&self) -> Result<(), AppError> {
        let settled = self.shared.read(|batch| batch.is_settled()).await;
        if !settled {
            return Err(AppError::BatchActive);
        }
        self.shared.clear_and_forget().await
    }

    /// Awaits every launched partition. Returns the first partition-level
    /// error, if any; by then the affected items are already marked failed
    /// locally, so the view is consistent before the rejection surfaces.
    pub async fn wait_settled(&self) -> Result<(), AppError> {
        let mut first_err: Option<AppError> = None;
        let mut tasks = self.tasks.lock().await;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(AppError::Internal(format!(
                            "Partition task failed to join: {e}"
                        )));
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Restores tracking from the persisted snapshot, if one is worth
    /// resuming. Starts the poller immediately on success; the caller does
    /// not need a separate start call.
    pub async fn restore_from_snapshot(&self) -> Result<bool, AppError> {
        let Some(batch) = self.store.restore(self.docs.as_ref()).await? else {
            return Ok(false);
        };
        let count = batch.total();
        self.shared.mutate(move |current| *current = batch).await;
        info!("[UPLOAD-ORCHESTRATOR] Resumed tracking {count} item(s) from snapshot");
        self.poller
            .ensure_running(self.shared.clone(), self.docs.clone());
        Ok(true)
    }

    /// Current aggregate view.
    pub async fn summary(&self) -> BatchSummary {
        self.shared.read(|batch| batch.summary()).await
    }

    /// Reactive aggregate view; a new value is published after every
    /// mutation.
    pub fn subscribe(&self) -> watch::Receiver<BatchSummary> {
        self.shared.subscribe()
    }

    /// True while the reconciliation poller is scanning.
    pub fn poller_running(&self) -> bool {
        self.poller.is_running()
    }

    /// Stops background work. Used on session teardown.
    pub fn shutdown(&self) {
        self.poller.shutdown();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

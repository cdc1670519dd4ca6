//! Core data model for upload batches.
//!
//! An [`UploadBatch`] owns the queued items and the derived aggregate
//! counters. All mutation goes through the guarded methods here so the
//! batch-level invariants hold everywhere:
//!
//! - `completed_count`/`failed_count` always equal the number of items whose
//!   status is `Completed`/`Failed` (counters are derived from the per-run
//!   idempotency sets, never incremented independently)
//! - terminal items are never mutated again
//! - `server_item_id` is written at most once

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::accounts::AccountHandle;

// ─────────────────────────────────────────────────────────────────────────────
// Enums
// ─────────────────────────────────────────────────────────────────────────────

/// Where an item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemSource {
    /// Picked from the local filesystem.
    Local,
    /// Referenced from a connected drive account.
    Remote,
}

/// Coarse lifecycle state of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Uploading,
    Processing,
    Completed,
    Failed,
}

impl ItemStatus {
    /// Returns true if no further mutation of the item is permitted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed)
    }
}

/// Fine-grained pipeline stage reported by the processing service.
///
/// Serialized snake_case to match the wire protocol ("building_connections"
/// etc.).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Initializing,
    Reading,
    Understanding,
    BuildingConnections,
    Finalizing,
    Completed,
    Failed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Initializing => "initializing",
            PipelineStage::Reading => "reading",
            PipelineStage::Understanding => "understanding",
            PipelineStage::BuildingConnections => "building_connections",
            PipelineStage::Finalizing => "finalizing",
            PipelineStage::Completed => "completed",
            PipelineStage::Failed => "failed",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Item
// ─────────────────────────────────────────────────────────────────────────────

/// The drive account an item belongs to.
///
/// `label` is for humans (the account email); `handle` is the authorization
/// key used on API calls. The two are never conflated. The handle is attached
/// at normalize time and is absent on snapshot-restored items, which are only
/// reconciled against the server and never re-submitted.
#[derive(Debug, Clone)]
pub struct SourceAccount {
    /// Stable account identifier, used for partitioning.
    pub id: String,
    /// Display label (account email).
    pub label: String,
    /// Authorization key; `None` only for snapshot-restored items.
    pub handle: Option<AccountHandle>,
}

/// Raw bytes of a locally selected file, held only until dispatch.
///
/// Never serialized: local content cannot and must not be durably cached
/// client-side.
#[derive(Clone)]
pub struct LocalPayload {
    pub bytes: Vec<u8>,
    /// Hex sha256 of `bytes`, sent alongside the upload for integrity.
    pub sha256: String,
}

impl std::fmt::Debug for LocalPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Raw file contents are never logged
        f.debug_struct("LocalPayload")
            .field("len", &self.bytes.len())
            .field("sha256", &self.sha256)
            .finish()
    }
}

/// One file the user queued for ingestion.
#[derive(Debug, Clone)]
pub struct IngestionItem {
    /// Client-generated id, stable for the item's UI lifetime. For remote
    /// items this equals the provider file id.
    pub id: String,
    /// Human-readable name, available before any server contact.
    pub display_name: String,
    pub source: ItemSource,
    /// Owning account; present iff `source` is `Remote`.
    pub account: Option<SourceAccount>,
    /// Provider-side file id; present iff `source` is `Remote`.
    pub remote_file_id: Option<String>,
    /// Server-side document id, assigned once the server starts tracking the
    /// item. Set at most once.
    pub server_item_id: Option<String>,
    pub status: ItemStatus,
    /// Populated only once streaming begins.
    pub stage: Option<PipelineStage>,
    /// 0–100; may reset at stage transitions.
    pub progress_percent: u8,
    /// Current-activity text from the server.
    pub stage_message: Option<String>,
    /// Present only when `status` is `Failed`.
    pub error: Option<String>,
    /// Raw bytes for freshly selected local files; dropped after dispatch and
    /// never persisted.
    pub payload: Option<LocalPayload>,
}

impl IngestionItem {
    /// Builds a pending local item with a fresh random id.
    pub fn local(display_name: String, payload: LocalPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            display_name,
            source: ItemSource::Local,
            account: None,
            remote_file_id: None,
            server_item_id: None,
            status: ItemStatus::Pending,
            stage: None,
            progress_percent: 0,
            stage_message: None,
            error: None,
            payload: Some(payload),
        }
    }

    /// Builds a pending remote item. The item id equals the provider file id,
    /// so queuing the same remote file twice de-duplicates naturally.
    pub fn remote(file_id: String, display_name: String, account: SourceAccount) -> Self {
        Self {
            id: file_id.clone(),
            display_name,
            source: ItemSource::Remote,
            account: Some(account),
            remote_file_id: Some(file_id),
            server_item_id: None,
            status: ItemStatus::Pending,
            stage: None,
            progress_percent: 0,
            stage_message: None,
            error: None,
            payload: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Read-only views
// ─────────────────────────────────────────────────────────────────────────────

/// Serializable per-item row for the presentation layer.
///
/// Excludes payload bytes and the account handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemView {
    pub id: String,
    pub display_name: String,
    pub source: ItemSource,
    pub account_label: Option<String>,
    pub server_item_id: Option<String>,
    pub status: ItemStatus,
    pub stage: Option<PipelineStage>,
    pub progress_percent: u8,
    pub stage_message: Option<String>,
    pub error: Option<String>,
}

impl From<&IngestionItem> for ItemView {
    fn from(item: &IngestionItem) -> Self {
        Self {
            id: item.id.clone(),
            display_name: item.display_name.clone(),
            source: item.source,
            account_label: item.account.as_ref().map(|a| a.label.clone()),
            server_item_id: item.server_item_id.clone(),
            status: item.status,
            stage: item.stage,
            progress_percent: item.progress_percent,
            stage_message: item.stage_message.clone(),
            error: item.error.clone(),
        }
    }
}

/// Aggregate view of the batch, published after every mutation.
///
/// Eventually consistent across partitions: `completed + failed` may
/// transiently trail `total` while streams are still being folded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Display name of the most recently updated non-terminal item.
    pub current_item_label: Option<String>,
    /// True while any item is non-terminal.
    pub is_uploading: bool,
    pub items: Vec<ItemView>,
}

impl BatchSummary {
    /// An empty summary, used before any batch exists.
    pub fn empty() -> Self {
        Self {
            total: 0,
            completed: 0,
            failed: 0,
            current_item_label: None,
            is_uploading: false,
            items: Vec::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// UploadBatch
// ─────────────────────────────────────────────────────────────────────────────

/// A set of ingestion items submitted together and tracked as a unit.
#[derive(Debug, Default)]
pub struct UploadBatch {
    items: Vec<IngestionItem>,
    /// Item ids already counted toward `completed`. Membership here is the
    /// idempotency guard: a re-delivered terminal event moves no counter.
    completed_ids: HashSet<String>,
    /// Item ids already counted toward `failed`.
    failed_ids: HashSet<String>,
    current_item_label: Option<String>,
}

impl UploadBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a batch from restored items, seeding the idempotency sets
    /// from statuses that were already terminal at snapshot time.
    pub fn from_restored(items: Vec<IngestionItem>) -> Self {
        let completed_ids = items
            .iter()
            .filter(|i| i.status == ItemStatus::Completed)
            .map(|i| i.id.clone())
            .collect();
        let failed_ids = items
            .iter()
            .filter(|i| i.status == ItemStatus::Failed)
            .map(|i| i.id.clone())
            .collect();
        Self {
            items,
            completed_ids,
            failed_ids,
            current_item_label: None,
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn items(&self) -> &[IngestionItem] {
        &self.items
    }

    pub fn item(&self, id: &str) -> Option<&IngestionItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn total(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn completed_count(&self) -> usize {
        self.completed_ids.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed_ids.len()
    }

    /// True once every item is terminal (vacuously true when empty).
    pub fn is_settled(&self) -> bool {
        self.items.iter().all(|i| i.status.is_terminal())
    }

    pub fn non_terminal_count(&self) -> usize {
        self.items.iter().filter(|i| !i.status.is_terminal()).count()
    }

    /// Finds the local item id tracking the given server document id.
    pub fn item_id_by_server_id(&self, server_item_id: &str) -> Option<String> {
        self.items
            .iter()
            .find(|i| i.server_item_id.as_deref() == Some(server_item_id))
            .map(|i| i.id.clone())
    }

    pub fn current_item_label(&self) -> Option<&str> {
        self.current_item_label.as_deref()
    }

    /// Builds the serializable aggregate view.
    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            total: self.total(),
            completed: self.completed_count(),
            failed: self.failed_count(),
            current_item_label: self.current_item_label.clone(),
            is_uploading: !self.is_settled(),
            items: self.items.iter().map(ItemView::from).collect(),
        }
    }

    // ── Mutators ──────────────────────────────────────────────────────────────

    /// Appends newly normalized items. An id collision (the same remote file
    /// queued twice) keeps the existing item.
    pub fn push_items(&mut self, new_items: Vec<IngestionItem>) {
        for item in new_items {
            if self.item(&item.id).is_none() {
                self.items.push(item);
            }
        }
    }

    /// Removes a pending item. Items already in flight cannot be dropped
    /// without risking an orphaned server-side job.
    pub fn remove_pending(&mut self, id: &str) -> Result<(), crate::error::AppError> {
        let pos = self
            .items
            .iter()
            .position(|i| i.id == id)
            .ok_or_else(|| crate::error::AppError::ItemNotFound(id.to_string()))?;
        if self.items[pos].status != ItemStatus::Pending {
            return Err(crate::error::AppError::RemoveNotAllowed { id: id.to_string() });
        }
        self.items.remove(pos);
        Ok(())
    }

    /// Drops all items. Callers enforce the all-terminal precondition.
    pub fn clear(&mut self) {
        self.items.clear();
        self.completed_ids.clear();
        self.failed_ids.clear();
        self.current_item_label = None;
    }

    /// Applies a non-terminal progress update.
    ///
    /// The very first event moves a pending item to `Uploading`; subsequent
    /// events move it to `Processing`. Stage fields are copied verbatim; the
    /// server item id is adopted only if not already set. Terminal items are
    /// left untouched.
    pub fn apply_progress(
        &mut self,
        id: &str,
        stage: PipelineStage,
        progress_percent: u8,
        stage_message: Option<String>,
        server_item_id: Option<String>,
    ) {
        let Some(item) = self.items.iter_mut().find(|i| i.id == id) else {
            return;
        };
        if item.status.is_terminal() {
            return;
        }
        item.status = match item.status {
            ItemStatus::Pending => ItemStatus::Uploading,
            _ => ItemStatus::Processing,
        };
        item.stage = Some(stage);
        item.progress_percent = progress_percent.min(100);
        item.stage_message = stage_message;
        if item.server_item_id.is_none() {
            item.server_item_id = server_item_id;
        }
        self.current_item_label = Some(item.display_name.clone());
    }

    /// Marks an item completed. Returns true only the first time the item is
    /// counted; replays are no-ops.
    pub fn mark_completed(&mut self, id: &str) -> bool {
        let Some(item) = self.items.iter_mut().find(|i| i.id == id) else {
            return false;
        };
        if item.status.is_terminal() || !self.completed_ids.insert(id.to_string()) {
            return false;
        }
        item.status = ItemStatus::Completed;
        item.stage = Some(PipelineStage::Completed);
        item.progress_percent = 100;
        item.payload = None;
        if self.is_settled() {
            self.current_item_label = None;
        }
        true
    }

    /// Marks an item failed with a display-ready message. Returns true only
    /// the first time the item is counted; replays are no-ops.
    pub fn mark_failed(&mut self, id: &str, message: &str) -> bool {
        let Some(item) = self.items.iter_mut().find(|i| i.id == id) else {
            return false;
        };
        if item.status.is_terminal() || !self.failed_ids.insert(id.to_string()) {
            return false;
        }
        item.status = ItemStatus::Failed;
        item.stage = Some(PipelineStage::Failed);
        item.stage_message = None;
        item.error = Some(message.to_string());
        item.payload = None;
        if self.is_settled() {
            self.current_item_label = None;
        }
        true
    }

    /// Overwrites a non-terminal item with the server's "still processing"
    /// verdict. The poller reflects durable server state, so it does not go
    /// through the first-event `Uploading` transition; the fine-grained stage
    /// is kept if the stream already supplied one.
    pub fn reconcile_processing(&mut self, id: &str, message: &str) {
        let Some(item) = self.items.iter_mut().find(|i| i.id == id) else {
            return;
        };
        if item.status.is_terminal() {
            return;
        }
        item.status = ItemStatus::Processing;
        item.stage_message = Some(message.to_string());
        if item.stage.is_none() {
            item.stage = Some(PipelineStage::Initializing);
        }
        self.current_item_label = Some(item.display_name.clone());
    }

    /// Adopts a server item id reported outside the normal event path (for
    /// example during snapshot corroboration). Write-once.
    pub fn set_server_item_id(&mut self, id: &str, server_item_id: String) {
        if let Some(item) = self.items.iter_mut().find(|i| i.id == id) {
            if item.server_item_id.is_none() {
                item.server_item_id = Some(server_item_id);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(bytes: &[u8]) -> LocalPayload {
        LocalPayload {
            bytes: bytes.to_vec(),
            sha256: "00".repeat(32),
        }
    }

    fn account() -> SourceAccount {
        SourceAccount {
            id: "acct-a".into(),
            label: "ada@example.com".into(),
            handle: Some(AccountHandle::new("tok-a")),
        }
    }

    fn batch_with(names: &[&str]) -> (UploadBatch, Vec<String>) {
        let mut batch = UploadBatch::new();
        let items: Vec<IngestionItem> = names
            .iter()
            .map(|n| IngestionItem::local(n.to_string(), payload(b"x")))
            .collect();
        let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
        batch.push_items(items);
        (batch, ids)
    }

    /// Asserts the derived-counter invariant against the raw item statuses.
    fn assert_counters_consistent(batch: &UploadBatch) {
        let completed = batch
            .items()
            .iter()
            .filter(|i| i.status == ItemStatus::Completed)
            .count();
        let failed = batch
            .items()
            .iter()
            .filter(|i| i.status == ItemStatus::Failed)
            .count();
        assert_eq!(batch.completed_count(), completed);
        assert_eq!(batch.failed_count(), failed);
    }

    #[test]
    fn remote_item_id_equals_provider_file_id() {
        let item = IngestionItem::remote("gdrive-42".into(), "notes.pdf".into(), account());
        assert_eq!(item.id, "gdrive-42");
        assert_eq!(item.remote_file_id.as_deref(), Some("gdrive-42"));
        assert!(item.account.is_some());
    }

    #[test]
    fn queuing_same_remote_file_twice_dedups() {
        let mut batch = UploadBatch::new();
        batch.push_items(vec![IngestionItem::remote(
            "gdrive-42".into(),
            "notes.pdf".into(),
            account(),
        )]);
        batch.push_items(vec![IngestionItem::remote(
            "gdrive-42".into(),
            "notes.pdf".into(),
            account(),
        )]);
        assert_eq!(batch.total(), 1);
    }

    #[test]
    fn first_event_sets_uploading_then_processing() {
        let (mut batch, ids) = batch_with(&["a.pdf"]);
        batch.apply_progress(&ids[0], PipelineStage::Initializing, 0, None, None);
        assert_eq!(batch.item(&ids[0]).unwrap().status, ItemStatus::Uploading);
        batch.apply_progress(&ids[0], PipelineStage::Reading, 10, None, None);
        assert_eq!(batch.item(&ids[0]).unwrap().status, ItemStatus::Processing);
    }

    #[test]
    fn replayed_terminal_event_moves_no_counter() {
        let (mut batch, ids) = batch_with(&["a.pdf", "b.pdf"]);

        assert!(batch.mark_completed(&ids[0]));
        assert!(!batch.mark_completed(&ids[0]), "replay must be a no-op");
        assert_eq!(batch.completed_count(), 1);

        assert!(batch.mark_failed(&ids[1], "boom"));
        assert!(!batch.mark_failed(&ids[1], "boom again"));
        assert_eq!(batch.failed_count(), 1);

        assert_counters_consistent(&batch);
    }

    #[test]
    fn terminal_items_are_immutable() {
        let (mut batch, ids) = batch_with(&["a.pdf"]);
        batch.mark_completed(&ids[0]);

        batch.apply_progress(
            &ids[0],
            PipelineStage::Reading,
            5,
            Some("late event".into()),
            None,
        );
        assert!(!batch.mark_failed(&ids[0], "late failure"));

        let item = batch.item(&ids[0]).unwrap();
        assert_eq!(item.status, ItemStatus::Completed);
        assert_eq!(item.stage, Some(PipelineStage::Completed));
        assert_eq!(item.progress_percent, 100);
        assert!(item.error.is_none());
        assert_counters_consistent(&batch);
    }

    #[test]
    fn completed_then_failed_counts_once_total() {
        let (mut batch, ids) = batch_with(&["a.pdf"]);
        assert!(batch.mark_completed(&ids[0]));
        assert!(!batch.mark_failed(&ids[0], "conflicting report"));
        assert_eq!(batch.completed_count(), 1);
        assert_eq!(batch.failed_count(), 0);
        assert_counters_consistent(&batch);
    }

    #[test]
    fn server_item_id_is_write_once() {
        let (mut batch, ids) = batch_with(&["a.pdf"]);
        batch.apply_progress(
            &ids[0],
            PipelineStage::Reading,
            10,
            None,
            Some("doc-1".into()),
        );
        batch.apply_progress(
            &ids[0],
            PipelineStage::Understanding,
            20,
            None,
            Some("doc-2".into()),
        );
        assert_eq!(
            batch.item(&ids[0]).unwrap().server_item_id.as_deref(),
            Some("doc-1")
        );
        batch.set_server_item_id(&ids[0], "doc-3".into());
        assert_eq!(
            batch.item(&ids[0]).unwrap().server_item_id.as_deref(),
            Some("doc-1")
        );
    }

    #[test]
    fn remove_only_allowed_while_pending() {
        let (mut batch, ids) = batch_with(&["a.pdf", "b.pdf"]);
        batch.apply_progress(&ids[0], PipelineStage::Reading, 10, None, None);

        assert!(matches!(
            batch.remove_pending(&ids[0]),
            Err(crate::error::AppError::RemoveNotAllowed { .. })
        ));
        assert!(batch.remove_pending(&ids[1]).is_ok());
        assert_eq!(batch.total(), 1);

        assert!(matches!(
            batch.remove_pending("missing"),
            Err(crate::error::AppError::ItemNotFound(_))
        ));
    }

    #[test]
    fn terminal_items_drop_payload_bytes() {
        let (mut batch, ids) = batch_with(&["a.pdf"]);
        assert!(batch.item(&ids[0]).unwrap().payload.is_some());
        batch.mark_completed(&ids[0]);
        assert!(batch.item(&ids[0]).unwrap().payload.is_none());
    }

    #[test]
    fn current_label_tracks_latest_non_terminal_update() {
        let (mut batch, ids) = batch_with(&["a.pdf", "b.pdf"]);
        batch.apply_progress(&ids[0], PipelineStage::Reading, 10, None, None);
        assert_eq!(batch.current_item_label(), Some("a.pdf"));
        batch.apply_progress(&ids[1], PipelineStage::Reading, 10, None, None);
        assert_eq!(batch.current_item_label(), Some("b.pdf"));

        batch.mark_completed(&ids[0]);
        batch.mark_completed(&ids[1]);
        assert!(batch.current_item_label().is_none());
        assert!(batch.is_settled());
    }

    #[test]
    fn restored_batch_seeds_idempotency_sets() {
        let mut done = IngestionItem::local("done.pdf".into(), payload(b"x"));
        done.status = ItemStatus::Completed;
        done.payload = None;
        let mut active = IngestionItem::local("active.pdf".into(), payload(b"y"));
        active.status = ItemStatus::Processing;
        active.payload = None;
        let done_id = done.id.clone();

        let mut batch = UploadBatch::from_restored(vec![done, active]);
        assert_eq!(batch.completed_count(), 1);
        assert!(!batch.mark_completed(&done_id), "restored terminal must not re-count");
        assert_counters_consistent(&batch);
    }
}

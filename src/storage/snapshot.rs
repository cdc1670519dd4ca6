//! Durable snapshot of the in-flight upload batch.
//!
//! One named slot holds a reduced JSON projection of the batch so tracking
//! survives an application restart. The projection excludes everything
//! volatile or non-serializable: raw payload bytes, account handles, and
//! per-tick progress fields. Restore validates staleness and corroborates
//! restored items against the server before any tracking resumes.

use std::future::Future;
use std::pin::Pin;

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::{DocumentRecord, DocumentStatus};
use crate::error::AppError;
use crate::storage::database::{configure_connection, Database};
use crate::upload::types::{
    IngestionItem, ItemSource, ItemStatus, PipelineStage, SourceAccount, UploadBatch,
};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// The single snapshot slot. One outstanding batch is supported; a later
/// save overwrites the slot.
const SNAPSHOT_SLOT: &str = "current-batch";

/// Constant version tag embedded in the payload.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Snapshots older than this are discarded on restore regardless of content.
const SNAPSHOT_MAX_AGE_SECS: i64 = 24 * 60 * 60;

/// Activity text shown for items rehydrated from a snapshot.
const RESTORED_MESSAGE: &str = "Restored from a previous session";

// ─────────────────────────────────────────────────────────────────────────────
// Persisted projection
// ─────────────────────────────────────────────────────────────────────────────

/// Reduced projection of one ingestion item.
///
/// Local items are restored as metadata-only placeholders: raw content
/// cannot and must not be durably cached client-side. Account handles are
/// likewise never persisted; restored items are reconciled, not re-submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistedItem {
    pub id: String,
    pub display_name: String,
    pub source: ItemSource,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub account_label: Option<String>,
    #[serde(default)]
    pub remote_file_id: Option<String>,
    #[serde(default)]
    pub server_item_id: Option<String>,
    pub status: ItemStatus,
    #[serde(default)]
    pub stage: Option<PipelineStage>,
    #[serde(default)]
    pub error: Option<String>,
}

/// The durable mirror of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistedSnapshot {
    pub version: u32,
    /// Snapshot write time, unix seconds.
    pub timestamp: i64,
    pub is_uploading: bool,
    pub completed: usize,
    pub failed: usize,
    pub files: Vec<PersistedItem>,
}

impl PersistedSnapshot {
    /// Projects the live batch into its durable form, stamped with the
    /// current time.
    pub fn from_batch(batch: &UploadBatch) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            timestamp: current_timestamp(),
            is_uploading: !batch.is_settled(),
            completed: batch.completed_count(),
            failed: batch.failed_count(),
            files: batch
                .items()
                .iter()
                .map(|item| PersistedItem {
                    id: item.id.clone(),
                    display_name: item.display_name.clone(),
                    source: item.source,
                    account_id: item.account.as_ref().map(|a| a.id.clone()),
                    account_label: item.account.as_ref().map(|a| a.label.clone()),
                    remote_file_id: item.remote_file_id.clone(),
                    server_item_id: item.server_item_id.clone(),
                    status: item.status,
                    stage: item.stage,
                    error: item.error.clone(),
                })
                .collect(),
        }
    }
}

/// Rehydrates a persisted item as a metadata-only placeholder.
fn rehydrate(persisted: PersistedItem) -> IngestionItem {
    let account = match (&persisted.account_id, &persisted.account_label) {
        (Some(id), Some(label)) => Some(SourceAccount {
            id: id.clone(),
            label: label.clone(),
            // Handles are never persisted; restored items are only reconciled.
            handle: None,
        }),
        _ => None,
    };
    let progress = if persisted.status == ItemStatus::Completed {
        100
    } else {
        0
    };
    IngestionItem {
        id: persisted.id,
        display_name: persisted.display_name,
        source: persisted.source,
        account,
        remote_file_id: persisted.remote_file_id,
        server_item_id: persisted.server_item_id,
        status: persisted.status,
        stage: persisted.stage,
        progress_percent: progress,
        stage_message: (!persisted.status.is_terminal()).then(|| RESTORED_MESSAGE.to_string()),
        error: persisted.error,
        payload: None,
    }
}

/// Returns current unix timestamp in seconds.
pub(crate) fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("Time went backwards")
        .as_secs() as i64
}

// ─────────────────────────────────────────────────────────────────────────────
// DocumentListProvider trait
// ─────────────────────────────────────────────────────────────────────────────

/// Fetches the server's current document list.
///
/// Decouples the storage layer from the live backend client: the
/// orchestration layer implements this for the real client, and tests
/// provide a fake.
pub trait DocumentListProvider: Send + Sync {
    fn list_documents<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DocumentRecord>, AppError>> + Send + 'a>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// SnapshotStore
// ─────────────────────────────────────────────────────────────────────────────

/// Reads and writes the snapshot slot.
pub struct SnapshotStore {
    db: std::sync::Arc<Database>,
}

impl SnapshotStore {
    pub fn new(db: std::sync::Arc<Database>) -> Self {
        Self { db }
    }

    /// Writes the snapshot, overwriting any previous one in the slot.
    pub async fn save(&self, snapshot: &PersistedSnapshot) -> Result<(), AppError> {
        let db_path = self.db.db_path().clone();
        let payload = serde_json::to_string(snapshot)
            .map_err(|e| AppError::Internal(format!("Failed to serialize snapshot: {e}")))?;
        let version = snapshot.version as i64;
        let saved_at = snapshot.timestamp;

        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)
                .map_err(|e| AppError::Internal(format!("Failed to open database: {e}")))?;

            configure_connection(&conn)?;

            conn.execute(
                r#"
                INSERT INTO upload_snapshot (slot, version, payload, saved_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(slot) DO UPDATE SET
                    version = excluded.version,
                    payload = excluded.payload,
                    saved_at = excluded.saved_at
                "#,
                rusqlite::params![SNAPSHOT_SLOT, version, payload, saved_at],
            )
            .map_err(|e| AppError::Internal(format!("Failed to write snapshot: {e}")))?;

            Ok::<_, AppError>(())
        })
        .await
        .map_err(|e| AppError::Internal(format!("Snapshot save task failed: {e}")))??;

        Ok(())
    }

    /// Deletes the snapshot slot. Idempotent.
    pub async fn delete(&self) -> Result<(), AppError> {
        let db_path = self.db.db_path().clone();

        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)
                .map_err(|e| AppError::Internal(format!("Failed to open database: {e}")))?;

            configure_connection(&conn)?;

            conn.execute(
                "DELETE FROM upload_snapshot WHERE slot = ?1",
                [SNAPSHOT_SLOT],
            )
            .map_err(|e| AppError::Internal(format!("Failed to delete snapshot: {e}")))?;

            Ok::<_, AppError>(())
        })
        .await
        .map_err(|e| AppError::Internal(format!("Snapshot delete task failed: {e}")))??;

        Ok(())
    }

    /// Reads the raw snapshot payload, if any.
    async fn load_raw(&self) -> Result<Option<String>, AppError> {
        let db_path = self.db.db_path().clone();

        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)
                .map_err(|e| AppError::Internal(format!("Failed to open database: {e}")))?;

            configure_connection(&conn)?;

            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM upload_snapshot WHERE slot = ?1",
                    [SNAPSHOT_SLOT],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| AppError::Internal(format!("Failed to read snapshot: {e}")))?;

            Ok::<_, AppError>(payload)
        })
        .await
        .map_err(|e| AppError::Internal(format!("Snapshot load task failed: {e}")))?
    }

    /// Restores the persisted batch, if it is still worth resuming.
    ///
    /// Returns `None` (and clears the slot where noted) when the snapshot is
    /// absent, corrupt, expired, already resolved, or describes items the
    /// server no longer knows about. The caller is responsible for starting
    /// reconciliation on a returned batch immediately.
    pub async fn restore(
        &self,
        provider: &dyn DocumentListProvider,
    ) -> Result<Option<UploadBatch>, AppError> {
        // 1. Read the slot
        let Some(payload) = self.load_raw().await? else {
            return Ok(None);
        };

        // Strict decode: a payload that no longer matches the expected
        // projection is discarded rather than trusted.
        let snapshot: PersistedSnapshot = match serde_json::from_str(&payload) {
            Ok(s) => s,
            Err(e) => {
                warn!("[SNAPSHOT] Discarding undecodable snapshot: {e}");
                self.delete().await?;
                return Ok(None);
            }
        };
        if snapshot.version != SNAPSHOT_VERSION {
            warn!(
                "[SNAPSHOT] Discarding snapshot with unknown version {}",
                snapshot.version
            );
            self.delete().await?;
            return Ok(None);
        }

        // 2. Hard expiry, independent of item status
        let age = current_timestamp() - snapshot.timestamp;
        if age > SNAPSHOT_MAX_AGE_SECS {
            info!("[SNAPSHOT] Snapshot is {age}s old, past the resume horizon; deleting");
            self.delete().await?;
            return Ok(None);
        }

        // 3. Nothing to resume if every item already settled
        if snapshot.files.iter().all(|f| f.status.is_terminal()) {
            info!("[SNAPSHOT] Snapshot holds only settled items; nothing to resume");
            return Ok(None);
        }

        // 4. Corroborate against the server before resurrecting progress
        let carried_ids: Vec<&str> = snapshot
            .files
            .iter()
            .filter_map(|f| f.server_item_id.as_deref())
            .collect();

        let files = if carried_ids.is_empty() {
            snapshot.files
        } else {
            let server_docs = provider.list_documents().await?;
            let known: std::collections::HashSet<&str> =
                server_docs.iter().map(|d| d.document_id.as_str()).collect();

            if carried_ids.iter().all(|id| !known.contains(id)) {
                // A storage reset happened while the app was closed; these
                // items no longer exist server-side.
                info!(
                    "[SNAPSHOT] None of {} tracked documents exist server-side; discarding snapshot",
                    carried_ids.len()
                );
                self.delete().await?;
                return Ok(None);
            }

            let mut kept: Vec<PersistedItem> = snapshot
                .files
                .into_iter()
                .filter(|f| match f.server_item_id.as_deref() {
                    Some(id) => known.contains(id),
                    None => true,
                })
                .collect();

            // Fold in the server's current status while we have the list,
            // so the restored view starts from server truth.
            for file in kept.iter_mut() {
                if file.status.is_terminal() {
                    continue;
                }
                let Some(id) = file.server_item_id.as_deref() else {
                    continue;
                };
                if let Some(doc) = server_docs.iter().find(|d| d.document_id == id) {
                    match doc.status {
                        DocumentStatus::Processed => file.status = ItemStatus::Completed,
                        DocumentStatus::Failed => {
                            file.status = ItemStatus::Failed;
                            file.error
                                .get_or_insert_with(|| "Processing failed on the server.".into());
                        }
                        DocumentStatus::Processing => file.status = ItemStatus::Processing,
                    }
                }
            }
            kept
        };

        if files.is_empty() {
            info!("[SNAPSHOT] No items survived server corroboration; discarding snapshot");
            self.delete().await?;
            return Ok(None);
        }

        // 5. Rehydrate placeholders and hand the batch back for tracking
        info!("[SNAPSHOT] Restored {} item(s) from snapshot", files.len());
        let items = files.into_iter().map(rehydrate).collect();
        Ok(Some(UploadBatch::from_restored(items)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn test_store() -> (TempDir, SnapshotStore) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = Database::init(temp_dir.path().join("test.db"))
            .await
            .expect("Failed to init DB");
        (temp_dir, SnapshotStore::new(Arc::new(db)))
    }

    /// Fake server document list for restore corroboration.
    struct FakeDocumentList {
        docs: Vec<DocumentRecord>,
    }

    impl FakeDocumentList {
        fn new(entries: &[(&str, DocumentStatus)]) -> Self {
            Self {
                docs: entries
                    .iter()
                    .map(|(id, status)| DocumentRecord {
                        document_id: id.to_string(),
                        filename: None,
                        status: *status,
                    })
                    .collect(),
            }
        }
    }

    impl DocumentListProvider for FakeDocumentList {
        fn list_documents<'a>(
            &'a self,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<DocumentRecord>, AppError>> + Send + 'a>>
        {
            let docs = self.docs.clone();
            Box::pin(async move { Ok(docs) })
        }
    }

    fn persisted_item(id: &str, status: ItemStatus, server_id: Option<&str>) -> PersistedItem {
        PersistedItem {
            id: id.to_string(),
            display_name: format!("{id}.pdf"),
            source: ItemSource::Local,
            account_id: None,
            account_label: None,
            remote_file_id: None,
            server_item_id: server_id.map(|s| s.to_string()),
            status,
            stage: None,
            error: None,
        }
    }

    fn snapshot_with(files: Vec<PersistedItem>, timestamp: i64) -> PersistedSnapshot {
        let completed = files
            .iter()
            .filter(|f| f.status == ItemStatus::Completed)
            .count();
        let failed = files.iter().filter(|f| f.status == ItemStatus::Failed).count();
        PersistedSnapshot {
            version: SNAPSHOT_VERSION,
            timestamp,
            is_uploading: files.iter().any(|f| !f.status.is_terminal()),
            completed,
            failed,
            files,
        }
    }

    #[tokio::test]
    async fn test_restore_returns_none_when_slot_empty() {
        let (_tmp, store) = test_store().await;
        let provider = FakeDocumentList::new(&[]);
        let restored = store.restore(&provider).await.unwrap();
        assert!(restored.is_none());
    }

    #[tokio::test]
    async fn test_restore_discards_expired_snapshot_regardless_of_status() {
        let (_tmp, store) = test_store().await;

        let old = current_timestamp() - (25 * 60 * 60);
        let snapshot = snapshot_with(
            vec![persisted_item("a", ItemStatus::Processing, Some("doc-1"))],
            old,
        );
        store.save(&snapshot).await.unwrap();

        // Server still knows the document, but the snapshot is past the horizon
        let provider = FakeDocumentList::new(&[("doc-1", DocumentStatus::Processing)]);
        let restored = store.restore(&provider).await.unwrap();
        assert!(restored.is_none());

        // Slot must have been cleared
        assert!(store.load_raw().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restore_skips_fully_settled_snapshot() {
        let (_tmp, store) = test_store().await;

        let snapshot = snapshot_with(
            vec![
                persisted_item("a", ItemStatus::Completed, Some("doc-1")),
                persisted_item("b", ItemStatus::Failed, Some("doc-2")),
            ],
            current_timestamp(),
        );
        store.save(&snapshot).await.unwrap();

        let provider = FakeDocumentList::new(&[("doc-1", DocumentStatus::Processed)]);
        let restored = store.restore(&provider).await.unwrap();
        assert!(restored.is_none(), "settled history must not be resumed");
    }

    #[tokio::test]
    async fn test_restore_discards_snapshot_unknown_to_server() {
        let (_tmp, store) = test_store().await;

        let snapshot = snapshot_with(
            vec![
                persisted_item("a", ItemStatus::Processing, Some("doc-1")),
                persisted_item("b", ItemStatus::Processing, Some("doc-2")),
            ],
            current_timestamp(),
        );
        store.save(&snapshot).await.unwrap();

        // Server list has entirely different documents (storage reset)
        let provider = FakeDocumentList::new(&[("doc-99", DocumentStatus::Processing)]);
        let restored = store.restore(&provider).await.unwrap();
        assert!(restored.is_none());
        assert!(store.load_raw().await.unwrap().is_none(), "slot must be cleared");
    }

    #[tokio::test]
    async fn test_restore_keeps_known_and_unsubmitted_items_only() {
        let (_tmp, store) = test_store().await;

        let snapshot = snapshot_with(
            vec![
                persisted_item("a", ItemStatus::Processing, Some("doc-1")), // known
                persisted_item("b", ItemStatus::Processing, Some("doc-2")), // vanished
                persisted_item("c", ItemStatus::Pending, None),             // never submitted
            ],
            current_timestamp(),
        );
        store.save(&snapshot).await.unwrap();

        let provider = FakeDocumentList::new(&[("doc-1", DocumentStatus::Processing)]);
        let batch = store.restore(&provider).await.unwrap().expect("batch");

        assert_eq!(batch.total(), 2);
        assert!(batch.item("a").is_some());
        assert!(batch.item("b").is_none(), "vanished item must be dropped");
        assert!(batch.item("c").is_some());
    }

    #[tokio::test]
    async fn test_restore_folds_in_server_status() {
        let (_tmp, store) = test_store().await;

        let snapshot = snapshot_with(
            vec![
                persisted_item("a", ItemStatus::Processing, Some("doc-1")),
                persisted_item("b", ItemStatus::Processing, Some("doc-2")),
            ],
            current_timestamp(),
        );
        store.save(&snapshot).await.unwrap();

        let provider = FakeDocumentList::new(&[
            ("doc-1", DocumentStatus::Processed),
            ("doc-2", DocumentStatus::Processing),
        ]);
        let batch = store.restore(&provider).await.unwrap().expect("batch");

        assert_eq!(batch.item("a").unwrap().status, ItemStatus::Completed);
        assert_eq!(batch.completed_count(), 1);
        assert_eq!(batch.item("b").unwrap().status, ItemStatus::Processing);
    }

    #[tokio::test]
    async fn test_restore_rehydrates_local_items_as_placeholders() {
        let (_tmp, store) = test_store().await;

        let snapshot = snapshot_with(
            vec![persisted_item("a", ItemStatus::Processing, Some("doc-1"))],
            current_timestamp(),
        );
        store.save(&snapshot).await.unwrap();

        let provider = FakeDocumentList::new(&[("doc-1", DocumentStatus::Processing)]);
        let batch = store.restore(&provider).await.unwrap().expect("batch");
        let item = batch.item("a").unwrap();

        assert!(item.payload.is_none(), "local bytes are never restored");
        assert_eq!(item.display_name, "a.pdf");
        assert_eq!(item.stage_message.as_deref(), Some(RESTORED_MESSAGE));
    }

    #[tokio::test]
    async fn test_restore_rejects_corrupt_payload_and_clears_slot() {
        let (_tmp, store) = test_store().await;

        // Write garbage straight into the slot
        let db_path = store.db.db_path().clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).unwrap();
            conn.execute(
                "INSERT INTO upload_snapshot (slot, version, payload, saved_at) VALUES (?1, 1, ?2, ?3)",
                rusqlite::params![SNAPSHOT_SLOT, "{\"not\": \"a snapshot\"}", current_timestamp()],
            )
            .unwrap();
        })
        .await
        .unwrap();

        let provider = FakeDocumentList::new(&[]);
        let restored = store.restore(&provider).await.unwrap();
        assert!(restored.is_none());
        assert!(store.load_raw().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_later_save_overwrites_slot() {
        let (_tmp, store) = test_store().await;

        let first = snapshot_with(
            vec![persisted_item("a", ItemStatus::Processing, None)],
            current_timestamp(),
        );
        store.save(&first).await.unwrap();

        let second = snapshot_with(
            vec![
                persisted_item("a", ItemStatus::Processing, None),
                persisted_item("b", ItemStatus::Pending, None),
            ],
            current_timestamp(),
        );
        store.save(&second).await.unwrap();

        let provider = FakeDocumentList::new(&[]);
        let batch = store.restore(&provider).await.unwrap().expect("batch");
        assert_eq!(batch.total(), 2);
    }
}

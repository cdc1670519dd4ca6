//! Progress stream consumer.
//!
//! Folds one partition's ordered event stream into the shared batch. Events
//! correlate to items by index into the partition's item array; the server
//! assigns document ids lazily, so the index is the only key guaranteed to
//! exist from the first event on.
//!
//! Terminal events go through the batch's guarded mark paths, so a terminal
//! event re-delivered after a stream reconnection moves no counter twice.

use futures_util::StreamExt;
use tracing::warn;

use crate::backend::{EventStream, ProgressEvent};
use crate::error::{AppError, TRANSPORT_FAILURE_MESSAGE};
use crate::upload::orchestrator::SharedBatch;
use crate::upload::types::PipelineStage;

/// Fallback item error when a failed event carries no text of its own.
const SERVER_FAILURE_FALLBACK: &str = "Processing failed.";

/// Consumes a partition's event stream to completion.
///
/// If the stream breaks mid-flight, every item of the partition still
/// non-terminal is failed with the generic transport message, and the error
/// is re-raised so the caller can decide what to do with the partition as a
/// whole. This layer never retries.
pub(crate) async fn consume_stream(
    shared: &SharedBatch,
    item_ids: &[String],
    mut events: EventStream,
) -> Result<(), AppError> {
    while let Some(next) = events.next().await {
        match next {
            Ok(event) => apply_event(shared, item_ids, event).await,
            Err(e) => {
                warn!("[UPLOAD-PROGRESS] Stream failed, failing remaining items: {e}");
                fail_pending(shared, item_ids, TRANSPORT_FAILURE_MESSAGE).await;
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Applies one event to the item it addresses.
async fn apply_event(shared: &SharedBatch, item_ids: &[String], event: ProgressEvent) {
    let Some(item_id) = item_ids.get(event.file_index) else {
        warn!(
            "[UPLOAD-PROGRESS] Event index {} out of range for partition of {}",
            event.file_index,
            item_ids.len()
        );
        return;
    };

    match event.stage {
        PipelineStage::Completed => {
            shared
                .mutate(|batch| {
                    if let Some(doc_id) = event.document_id.clone() {
                        batch.set_server_item_id(item_id, doc_id);
                    }
                    batch.mark_completed(item_id);
                })
                .await;
        }
        PipelineStage::Failed => {
            let message = event
                .error
                .clone()
                .or_else(|| event.message.clone())
                .unwrap_or_else(|| SERVER_FAILURE_FALLBACK.to_string());
            shared
                .mutate(|batch| {
                    if let Some(doc_id) = event.document_id.clone() {
                        batch.set_server_item_id(item_id, doc_id);
                    }
                    batch.mark_failed(item_id, &message);
                })
                .await;
        }
        stage => {
            shared
                .mutate(|batch| {
                    batch.apply_progress(
                        item_id,
                        stage,
                        event.progress_percent,
                        event.message.clone(),
                        event.document_id.clone(),
                    )
                })
                .await;
        }
    }
}

/// Fails every still non-terminal item of a partition with one message.
/// Already-terminal items are untouched; the counters move through the same
/// guarded paths as stream events.
pub(crate) async fn fail_pending(shared: &SharedBatch, item_ids: &[String], message: &str) {
    shared
        .mutate(|batch| {
            for id in item_ids {
                batch.mark_failed(id, message);
            }
        })
        .await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::sync::Arc;

    use crate::upload::orchestrator::SharedBatch;
    use crate::upload::test_support::{event, null_store, terminal_event};
    use crate::upload::types::{IngestionItem, ItemStatus, LocalPayload, UploadBatch};

    fn local_item(name: &str) -> IngestionItem {
        IngestionItem::local(
            name.to_string(),
            LocalPayload {
                bytes: b"x".to_vec(),
                sha256: "00".repeat(32),
            },
        )
    }

    async fn shared_with(names: &[&str]) -> (Arc<SharedBatch>, Vec<String>) {
        let shared = SharedBatch::new(null_store());
        let items: Vec<IngestionItem> = names.iter().map(|n| local_item(n)).collect();
        let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
        shared
            .mutate(|batch: &mut UploadBatch| batch.push_items(items))
            .await;
        (shared, ids)
    }

    fn stream_of(events: Vec<Result<ProgressEvent, AppError>>) -> EventStream {
        Box::pin(stream::iter(events))
    }

    #[tokio::test]
    async fn test_events_fold_into_item_state() {
        let (shared, ids) = shared_with(&["a.pdf", "b.pdf"]).await;

        let events = stream_of(vec![
            Ok(event(0, PipelineStage::Initializing, 0, Some("doc-a"))),
            Ok(event(1, PipelineStage::Reading, 30, Some("doc-b"))),
            Ok(event(0, PipelineStage::Understanding, 60, None)),
            Ok(terminal_event(0, PipelineStage::Completed, None)),
            Ok(terminal_event(1, PipelineStage::Failed, Some("bad scan"))),
        ]);

        consume_stream(&shared, &ids, events).await.unwrap();

        shared
            .read(|batch| {
                let a = batch.item(&ids[0]).unwrap();
                assert_eq!(a.status, ItemStatus::Completed);
                assert_eq!(a.server_item_id.as_deref(), Some("doc-a"));
                assert_eq!(a.progress_percent, 100);

                let b = batch.item(&ids[1]).unwrap();
                assert_eq!(b.status, ItemStatus::Failed);
                assert_eq!(b.error.as_deref(), Some("bad scan"));

                assert_eq!(batch.completed_count(), 1);
                assert_eq!(batch.failed_count(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn test_replayed_terminal_events_count_once() {
        let (shared, ids) = shared_with(&["a.pdf"]).await;

        // A reconnect can legitimately re-deliver the terminal event
        let events = stream_of(vec![
            Ok(terminal_event(0, PipelineStage::Completed, None)),
            Ok(terminal_event(0, PipelineStage::Completed, None)),
            Ok(terminal_event(0, PipelineStage::Failed, Some("late conflicting report"))),
        ]);

        consume_stream(&shared, &ids, events).await.unwrap();

        shared
            .read(|batch| {
                assert_eq!(batch.completed_count(), 1);
                assert_eq!(batch.failed_count(), 0);
                assert_eq!(batch.item(&ids[0]).unwrap().status, ItemStatus::Completed);
            })
            .await;
    }

    #[tokio::test]
    async fn test_transport_failure_fails_remaining_and_reraises() {
        let (shared, ids) = shared_with(&["a.pdf", "b.pdf", "c.pdf"]).await;

        let events = stream_of(vec![
            Ok(terminal_event(0, PipelineStage::Completed, None)),
            Ok(event(1, PipelineStage::Reading, 20, None)),
            Err(AppError::StreamInterrupted("connection reset".into())),
        ]);

        let result = consume_stream(&shared, &ids, events).await;
        assert!(matches!(result, Err(AppError::StreamInterrupted(_))));

        shared
            .read(|batch| {
                // The completed item keeps its result
                assert_eq!(batch.item(&ids[0]).unwrap().status, ItemStatus::Completed);
                // In-flight and untouched items are failed with the generic text
                for id in &ids[1..] {
                    let item = batch.item(id).unwrap();
                    assert_eq!(item.status, ItemStatus::Failed);
                    assert_eq!(item.error.as_deref(), Some(TRANSPORT_FAILURE_MESSAGE));
                }
                assert_eq!(batch.completed_count(), 1);
                assert_eq!(batch.failed_count(), 2);
            })
            .await;
    }

    #[tokio::test]
    async fn test_out_of_range_index_is_ignored() {
        let (shared, ids) = shared_with(&["a.pdf"]).await;

        let events = stream_of(vec![
            Ok(event(7, PipelineStage::Reading, 10, None)),
            Ok(terminal_event(0, PipelineStage::Completed, None)),
        ]);

        consume_stream(&shared, &ids, events).await.unwrap();

        shared
            .read(|batch| {
                assert_eq!(batch.completed_count(), 1);
                assert_eq!(batch.total(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn test_failed_event_without_text_gets_fallback() {
        let (shared, ids) = shared_with(&["a.pdf"]).await;

        let events = stream_of(vec![Ok(terminal_event(0, PipelineStage::Failed, None))]);
        consume_stream(&shared, &ids, events).await.unwrap();

        shared
            .read(|batch| {
                assert_eq!(
                    batch.item(&ids[0]).unwrap().error.as_deref(),
                    Some(SERVER_FAILURE_FALLBACK)
                );
            })
            .await;
    }
}

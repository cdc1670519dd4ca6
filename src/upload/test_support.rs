//! Shared fakes and event builders for upload tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::backend::{DocumentRecord, DocumentStatus, ProgressEvent};
use crate::error::AppError;
use crate::storage::snapshot::PersistedSnapshot;
use crate::storage::DocumentListProvider;
use crate::upload::orchestrator::SnapshotOps;
use crate::upload::types::{PipelineStage, UploadBatch};

/// Snapshot sink that drops everything. Tests that do not exercise
/// persistence use this.
struct NullSnapshot;

impl SnapshotOps for NullSnapshot {
    fn save<'a>(
        &'a self,
        _snapshot: &'a PersistedSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }

    fn delete(&self) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn restore<'a>(
        &'a self,
        _provider: &'a dyn DocumentListProvider,
    ) -> Pin<Box<dyn Future<Output = Result<Option<UploadBatch>, AppError>> + Send + 'a>> {
        Box::pin(async { Ok(None) })
    }
}

pub(crate) fn null_store() -> Arc<dyn SnapshotOps> {
    Arc::new(NullSnapshot)
}

/// Routes engine logs to the test output. Safe to call from every test;
/// only the first call installs the subscriber.
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// A non-terminal progress event.
pub(crate) fn event(
    file_index: usize,
    stage: PipelineStage,
    progress: u8,
    document_id: Option<&str>,
) -> ProgressEvent {
    ProgressEvent {
        file_index,
        filename: format!("f{file_index}.pdf"),
        document_id: document_id.map(str::to_string),
        stage,
        message: Some("working".into()),
        progress_percent: progress,
        timestamp: 0.0,
        error: None,
    }
}

/// A terminal (completed or failed) progress event.
pub(crate) fn terminal_event(
    file_index: usize,
    stage: PipelineStage,
    error: Option<&str>,
) -> ProgressEvent {
    ProgressEvent {
        file_index,
        filename: format!("f{file_index}.pdf"),
        document_id: None,
        stage,
        message: None,
        progress_percent: if stage == PipelineStage::Completed {
            100
        } else {
            0
        },
        timestamp: 0.0,
        error: error.map(str::to_string),
    }
}

/// Scripted document-list provider for poller tests.
pub(crate) struct FakeDocumentProvider {
    docs: Vec<DocumentRecord>,
    failures_remaining: AtomicUsize,
    calls: AtomicUsize,
}

impl FakeDocumentProvider {
    fn build(ids: &[&str], status: DocumentStatus, failures: usize) -> Self {
        Self {
            docs: ids
                .iter()
                .map(|id| DocumentRecord {
                    document_id: id.to_string(),
                    filename: None,
                    status,
                })
                .collect(),
            failures_remaining: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }

    /// Every listed document reports `processed`.
    pub(crate) fn processed(ids: &[&str]) -> Self {
        Self::build(ids, DocumentStatus::Processed, 0)
    }

    /// Every listed document reports `processing`, forever.
    pub(crate) fn processing(ids: &[&str]) -> Self {
        Self::build(ids, DocumentStatus::Processing, 0)
    }

    /// The first `failures` calls error out, then documents report
    /// `processed`.
    pub(crate) fn flaky_then_processed(failures: usize, ids: &[&str]) -> Self {
        Self::build(ids, DocumentStatus::Processed, failures)
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DocumentListProvider for FakeDocumentProvider {
    fn list_documents<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DocumentRecord>, AppError>> + Send + 'a>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let failures = self.failures_remaining.load(Ordering::SeqCst);
            if failures > 0 {
                self.failures_remaining.store(failures - 1, Ordering::SeqCst);
                return Err(AppError::ConnectionFailed("poll failed".into()));
            }
            Ok(self.docs.clone())
        })
    }
}

//! Upload orchestration engine.
//!
//! Drives a heterogeneous batch of ingestion items (local files plus files
//! referenced from connected drive accounts) through the server-side
//! processing pipeline, tracking per-item and aggregate progress and keeping
//! the client view consistent with server truth across interruptions and
//! restarts.

pub mod orchestrator;
pub mod poller;
pub(crate) mod progress;
pub mod quota;
pub mod scheduler;
pub mod source;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use orchestrator::{PipelineOps, SnapshotOps, SubmitReceipt, UploadOrchestrator};
pub use poller::ReconcilePoller;
pub use quota::{QuotaGuard, RejectedSelection, UsageLimits};
pub use scheduler::PipelineScheduler;
pub use source::RawSelection;
pub use types::{BatchSummary, IngestionItem, ItemSource, ItemStatus, ItemView, PipelineStage};

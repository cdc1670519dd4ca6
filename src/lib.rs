//! Paperstack upload engine.
//!
//! The upload orchestration and progress-reconciliation subsystem of the
//! Paperstack document workspace. It accepts a mixed batch of local files and
//! drive-account file references, drives each through the processing
//! pipeline's stage stream, mirrors every state change into a durable
//! snapshot, and reconciles the client view against the server's document
//! list until everything settles.
//!
//! The host process wires this up roughly as:
//!
//! ```ignore
//! let db = Arc::new(Database::init(data_dir.join("paperstack.db")).await?);
//! let store = Arc::new(SnapshotStore::new(db));
//! let client = BackendClient::new(Arc::new(reqwest::Client::new()), base_url);
//! let engine = UploadOrchestrator::new(client, store, limits);
//! engine.restore_from_snapshot().await?; // resume a previous session, if any
//! ```

pub mod accounts;
pub mod backend;
pub mod error;
pub mod storage;
pub mod upload;

pub use accounts::{AccountHandle, AccountProvider, DriveAccount};
pub use backend::BackendClient;
pub use error::{AppError, ErrorPresentation};
pub use storage::{Database, SnapshotStore};
pub use upload::{
    BatchSummary, RawSelection, SubmitReceipt, UploadOrchestrator, UsageLimits,
};

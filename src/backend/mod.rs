//! HTTP client for the document processing service.
//!
//! The service runs the multi-stage extraction pipeline (reading,
//! understanding, connection building) as a black box. This module covers the
//! wire protocol only: streaming ingestion calls that yield one NDJSON event
//! per (file-index, stage-transition), and the document-list polling call
//! used for reconciliation.
//!
//! # Security
//!
//! - Drive account tokens are sent in request bodies, never logged
//! - Raw file contents are never logged
//! - Only HTTP method, path, and status codes are logged

pub mod client;
pub mod ingest;

pub use client::{BackendClient, DocumentRecord, DocumentStatus};
pub use ingest::{EventStream, ProgressEvent, UploadFile};

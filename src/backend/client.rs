//! Base HTTP plumbing and the document polling call.

use std::sync::Arc;

use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::error::AppError;

// ─────────────────────────────────────────────────────────────────────────────
// Public Types
// ─────────────────────────────────────────────────────────────────────────────

/// Server-side processing status of a tracked document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    /// The pipeline is still working on the document.
    Processing,
    /// The document is fully persisted.
    Processed,
    /// The pipeline gave up on the document.
    Failed,
}

/// One entry of the server's authoritative document list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: String,
    #[serde(default)]
    pub filename: Option<String>,
    pub status: DocumentStatus,
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal Wire Types
// ─────────────────────────────────────────────────────────────────────────────

/// Error body shape returned by the processing service.
#[derive(Debug, Deserialize)]
struct BackendErrorBody {
    detail: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// BackendClient
// ─────────────────────────────────────────────────────────────────────────────

/// Client for the processing service's HTTP API.
#[derive(Clone)]
pub struct BackendClient {
    /// Shared HTTP client.
    client: Arc<Client>,
    /// Service base URL (e.g., "http://127.0.0.1:8801").
    base_url: Url,
}

impl BackendClient {
    pub fn new(client: Arc<Client>, base_url: Url) -> Self {
        Self { client, base_url }
    }

    pub(crate) fn http(&self) -> &Client {
        &self.client
    }

    /// Resolves an API path against the base URL.
    pub(crate) fn endpoint(&self, path: &str) -> Result<Url, AppError> {
        self.base_url
            .join(path)
            .map_err(|e| AppError::Internal(format!("Invalid endpoint {path}: {e}")))
    }

    /// Fetches the full current list of server-tracked documents.
    ///
    /// This is the reconciliation backstop: unlike the event stream it
    /// reflects durable server state, not in-flight progress.
    pub async fn list_documents(&self) -> Result<Vec<DocumentRecord>, AppError> {
        let url = self.endpoint("api/documents")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::ConnectionFailed(format!("Document list fetch failed: {e}")))?;

        let status = response.status();
        info!("[PIPELINE] GET /api/documents -> {}", status.as_u16());

        if !status.is_success() {
            return Err(Self::parse_error_response(response, status).await);
        }

        response
            .json()
            .await
            .map_err(|e| AppError::BackendError(format!("Failed to parse document list: {e}")))
    }

    /// Turns a non-success response into an `AppError`, preferring the
    /// service's own error detail when the body parses.
    pub(crate) async fn parse_error_response(response: Response, status: StatusCode) -> AppError {
        match response.json::<BackendErrorBody>().await {
            Ok(body) => {
                AppError::BackendError(format!("{} ({})", body.detail, status.as_u16()))
            }
            Err(_) => {
                AppError::BackendError(format!("Request failed with status {}", status.as_u16()))
            }
        }
    }
}

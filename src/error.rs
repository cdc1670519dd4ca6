use serde::Serialize;
use thiserror::Error;

/// Patterns (lowercase) that indicate sensitive data not safe for UI display.
/// Used by `contains_sensitive()` for case-insensitive matching.
pub(crate) const SENSITIVE_PATTERNS: &[&str] = &[
    "bearer ",
    "access_token",
    "refresh_token",
    "authorization:",
    "client_secret",
];

/// Generic message shown for items failed by a broken progress stream.
/// Raw transport errors are logged, never displayed.
pub const TRANSPORT_FAILURE_MESSAGE: &str =
    "The connection to the processing service was interrupted before this file finished.";

/// Returns true if the message contains any sensitive pattern (case-insensitive).
fn contains_sensitive(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Sanitizes a message for UI display.
/// If sensitive content is detected, returns the fallback instead.
fn sanitize_message(msg: &str, fallback: &str) -> String {
    if contains_sensitive(msg) {
        fallback.into()
    } else {
        msg.to_string()
    }
}

/// User-friendly error presentation for the frontend.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPresentation {
    pub title: String,
    pub message: String,
    pub action: Option<String>,
}

/// Application-wide error type.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Quota ─────────────────────────────────────────────────────────────────
    #[error("Quota exceeded: {reason}")]
    QuotaExceeded { reason: String },

    // ── Backend API ───────────────────────────────────────────────────────────
    #[error("Processing service error: {0}")]
    BackendError(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Progress stream interrupted: {0}")]
    StreamInterrupted(String),

    // ── Batch operations ──────────────────────────────────────────────────────
    #[error("Item not found: {0}")]
    ItemNotFound(String),

    #[error("Item {id} is already in flight and cannot be removed")]
    RemoveNotAllowed { id: String },

    #[error("Batch still has items in progress")]
    BatchActive,

    // ── Generic fallback ──────────────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Converts the error into a user-friendly presentation suitable for UI display.
    /// Never leaks tokens or raw transport error text.
    pub fn to_presentation(&self) -> ErrorPresentation {
        match self {
            // ── Quota ─────────────────────────────────────────────────────────
            AppError::QuotaExceeded { reason } => ErrorPresentation {
                title: "Upload Limit Reached".into(),
                message: sanitize_message(reason, "Your plan's upload limit has been reached."),
                action: Some("Remove some files or upgrade your plan".into()),
            },

            // ── Backend API ───────────────────────────────────────────────────
            AppError::BackendError(msg) => ErrorPresentation {
                title: "Processing Error".into(),
                message: sanitize_message(msg, "The processing service reported an error."),
                action: None,
            },

            AppError::ConnectionFailed(_) => ErrorPresentation {
                title: "Connection Failed".into(),
                message: "Could not reach the processing service. Please check your connection."
                    .into(),
                action: Some("Check network and retry".into()),
            },

            AppError::StreamInterrupted(_) => ErrorPresentation {
                title: "Upload Interrupted".into(),
                message: TRANSPORT_FAILURE_MESSAGE.into(),
                action: Some("Retry the affected files".into()),
            },

            // ── Batch operations ──────────────────────────────────────────────
            AppError::ItemNotFound(id) => ErrorPresentation {
                title: "File Not Found".into(),
                message: format!("No queued file matches \"{}\".", id),
                action: None,
            },

            AppError::RemoveNotAllowed { .. } => ErrorPresentation {
                title: "Upload In Progress".into(),
                message: "This file is already being processed and can no longer be removed."
                    .into(),
                action: Some("Wait for it to finish".into()),
            },

            AppError::BatchActive => ErrorPresentation {
                title: "Uploads Still Running".into(),
                message: "The current batch has files that are still processing.".into(),
                action: Some("Wait for all files to finish".into()),
            },

            // ── Generic ───────────────────────────────────────────────────────
            AppError::Internal(_) => ErrorPresentation {
                title: "Unexpected Error".into(),
                message: "Something went wrong. Please try again.".into(),
                action: Some("Try again".into()),
            },
        }
    }
}

// Allow AppError to cross the IPC boundary as its presentation
impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_presentation().serialize(serializer)
    }
}

//! Source adapter: normalizes raw user selections into ingestion items.

use sha2::{Digest, Sha256};

use crate::accounts::DriveAccount;
use crate::upload::types::{IngestionItem, LocalPayload, SourceAccount};

// ─────────────────────────────────────────────────────────────────────────────
// RawSelection
// ─────────────────────────────────────────────────────────────────────────────

/// A file the user picked, before normalization.
#[derive(Debug, Clone)]
pub enum RawSelection {
    /// A file read from local storage.
    Local {
        display_name: String,
        bytes: Vec<u8>,
    },
    /// A file referenced from a connected drive account. The owning account
    /// is part of the selection itself: resolving it later by side lookup
    /// would race against account-list changes during a long-running batch.
    Remote {
        file_id: String,
        display_name: String,
        /// Provider-reported size, when the listing included one.
        size_bytes: Option<u64>,
        account: DriveAccount,
    },
}

impl RawSelection {
    pub fn display_name(&self) -> &str {
        match self {
            RawSelection::Local { display_name, .. } => display_name,
            RawSelection::Remote { display_name, .. } => display_name,
        }
    }

    /// Byte size, where known. Remote listings do not always report one.
    pub fn size_bytes(&self) -> Option<u64> {
        match self {
            RawSelection::Local { bytes, .. } => Some(bytes.len() as u64),
            RawSelection::Remote { size_bytes, .. } => *size_bytes,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Normalization
// ─────────────────────────────────────────────────────────────────────────────

/// Normalizes accepted selections into pending ingestion items.
///
/// Local files get a fresh random id and carry their payload until dispatch;
/// remote files reuse the provider file id (queuing the same remote file
/// twice de-duplicates) and carry the account label and handle from the
/// selection.
pub fn normalize(selections: Vec<RawSelection>) -> Vec<IngestionItem> {
    selections
        .into_iter()
        .map(|selection| match selection {
            RawSelection::Local {
                display_name,
                bytes,
            } => {
                let sha256 = hex_digest(&bytes);
                IngestionItem::local(display_name, LocalPayload { bytes, sha256 })
            }
            RawSelection::Remote {
                file_id,
                display_name,
                account,
                ..
            } => IngestionItem::remote(
                file_id,
                display_name,
                SourceAccount {
                    id: account.id,
                    label: account.label,
                    handle: Some(account.handle),
                },
            ),
        })
        .collect()
}

/// Hex sha256 of a payload.
fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

//! Remote drive-account handles.
//!
//! The authorization subsystem (OAuth consent, token refresh) lives outside
//! this crate; it hands us ready-to-use account handles. This module defines
//! the handle types and the read-only provider interface.
//!
//! # Security
//! The account label (an email address) is for humans; the handle is the
//! authorization key used on API calls. The two are separate fields and must
//! never be conflated. Handles are wrapped in `SecretString` and redact
//! themselves in `Debug` output.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use secrecy::{ExposeSecret, SecretString};

use crate::error::AppError;

// ─────────────────────────────────────────────────────────────────────────────
// AccountHandle
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque authorization key for one connected drive account.
///
/// # Security
/// `Debug` redacts the token. The raw value is only exposed at the HTTP
/// boundary via [`AccountHandle::expose`].
#[derive(Clone)]
pub struct AccountHandle {
    token: SecretString,
}

impl AccountHandle {
    /// Wraps an access token handed over by the authorization subsystem.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::new(token.into()),
        }
    }

    /// Exposes the raw token for use in an API request body or header.
    pub fn expose(&self) -> &str {
        self.token.expose_secret()
    }
}

impl fmt::Debug for AccountHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountHandle").field("token", &"***").finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DriveAccount
// ─────────────────────────────────────────────────────────────────────────────

/// One connected cloud-drive account.
#[derive(Debug, Clone)]
pub struct DriveAccount {
    /// Stable account identifier, unique across providers.
    pub id: String,
    /// Human-readable label shown in the UI (typically the account email).
    pub label: String,
    /// Authorization key used for API calls on behalf of this account.
    pub handle: AccountHandle,
}

/// Read-only view of the currently usable drive accounts.
///
/// The orchestration layer never refreshes tokens or manages consent; it only
/// reads the handles the authorization subsystem currently considers usable.
pub trait AccountProvider: Send + Sync {
    /// Returns the current list of usable drive accounts.
    fn list_accounts(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DriveAccount>, AppError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_debug_redacts_token() {
        let handle = AccountHandle::new("ya29.super-secret-token");
        let debug = format!("{:?}", handle);
        assert!(!debug.contains("super-secret"), "Debug leaked the token: {debug}");
        assert!(debug.contains("***"));
    }

    #[test]
    fn account_debug_redacts_token_but_keeps_label() {
        let account = DriveAccount {
            id: "acct-1".into(),
            label: "ada@example.com".into(),
            handle: AccountHandle::new("tok-123"),
        };
        let debug = format!("{:?}", account);
        assert!(debug.contains("ada@example.com"));
        assert!(!debug.contains("tok-123"));
    }

    #[test]
    fn expose_returns_raw_token() {
        let handle = AccountHandle::new("tok-abc");
        assert_eq!(handle.expose(), "tok-abc");
    }
}

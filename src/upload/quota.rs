//! Quota guard: pre-submission plan-limit checks.
//!
//! Advisory for UX only: the server enforces the same limits
//! authoritatively and wins on conflict. Rejected selections are dropped
//! before any network activity starts.

use crate::upload::source::RawSelection;

// ─────────────────────────────────────────────────────────────────────────────
// Limits
// ─────────────────────────────────────────────────────────────────────────────

/// Subscription limits for the current user.
///
/// `None` is the unlimited sentinel in both fields, so callers never have to
/// special-case a magic number.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageLimits {
    /// Upload slots left on the plan. `None` means unlimited.
    pub remaining_items: Option<u64>,
    /// Per-file byte ceiling for the tier. `None` means unlimited.
    pub max_item_bytes: Option<u64>,
}

impl UsageLimits {
    /// No limits at all (the default).
    pub fn unlimited() -> Self {
        Self::default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Decision
// ─────────────────────────────────────────────────────────────────────────────

/// A selection dropped by the guard, with a user-facing reason.
#[derive(Debug, Clone)]
pub struct RejectedSelection {
    pub display_name: String,
    pub reason: String,
}

/// Outcome of the pre-submission check.
#[derive(Debug)]
pub struct QuotaDecision {
    pub accepted: Vec<RawSelection>,
    pub rejected: Vec<RejectedSelection>,
}

// ─────────────────────────────────────────────────────────────────────────────
// QuotaGuard
// ─────────────────────────────────────────────────────────────────────────────

/// Evaluates proposed selections against the plan limits.
#[derive(Debug, Clone, Copy)]
pub struct QuotaGuard {
    limits: UsageLimits,
}

impl QuotaGuard {
    pub fn new(limits: UsageLimits) -> Self {
        Self { limits }
    }

    /// Splits the proposed selections into accepted and rejected, in order:
    /// the item-count quota is consumed first, then each surviving selection
    /// is checked against the per-file size ceiling.
    pub fn evaluate(&self, selections: Vec<RawSelection>) -> QuotaDecision {
        let mut accepted = Vec::with_capacity(selections.len());
        let mut rejected = Vec::new();
        let mut slots = self.limits.remaining_items;

        for selection in selections {
            if slots == Some(0) {
                rejected.push(RejectedSelection {
                    display_name: selection.display_name().to_string(),
                    reason: "No upload slots remaining on your plan.".to_string(),
                });
                continue;
            }

            if let (Some(ceiling), Some(size)) = (self.limits.max_item_bytes, selection.size_bytes())
            {
                if size > ceiling {
                    rejected.push(RejectedSelection {
                        display_name: selection.display_name().to_string(),
                        reason: format!(
                            "File is larger than your plan's {} MB per-file limit.",
                            ceiling / (1024 * 1024)
                        ),
                    });
                    continue;
                }
            }

            slots = slots.map(|s| s - 1);
            accepted.push(selection);
        }

        QuotaDecision { accepted, rejected }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

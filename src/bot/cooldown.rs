//! Cooldown for full recomputes, keyed on a timestamp stored in the
//! ledger's config area so every instance sees the same gate.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::ledger::{LAST_REFRESH_KEY, Ledger, LedgerError, Spreadsheet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateStatus {
    pub allowed: bool,
    /// Seconds until the gate opens; 0 when allowed.
    pub remaining_secs: i64,
    /// Seconds since the last recorded recompute, when one is known.
    pub elapsed_secs: Option<i64>,
}

impl GateStatus {
    fn open(elapsed_secs: Option<i64>) -> Self {
        Self { allowed: true, remaining_secs: 0, elapsed_secs }
    }
}

pub struct RefreshGate {
    cooldown: Duration,
}

impl RefreshGate {
    pub fn new(cooldown_secs: u64) -> Self {
        Self { cooldown: Duration::seconds(cooldown_secs as i64) }
    }

    /// Fails open: a missing, blank, unreadable or future timestamp allows
    /// the recompute.
    pub async fn check<S: Spreadsheet>(&self, ledger: &Ledger<S>, now: DateTime<Utc>) -> GateStatus {
        let raw = match ledger.get_config(LAST_REFRESH_KEY).await {
            Ok(raw) => raw,
            Err(LedgerError::MissingConfigKey(_)) => return GateStatus::open(None),
            Err(e) => {
                warn!("Refresh gate unreadable, allowing: {}", e);
                return GateStatus::open(None);
            }
        };
        if raw.is_empty() {
            return GateStatus::open(None);
        }

        let last = match DateTime::parse_from_rfc3339(&raw) {
            Ok(t) => t.with_timezone(&Utc),
            Err(e) => {
                warn!("Refresh timestamp {:?} unparsable, allowing: {}", raw, e);
                return GateStatus::open(None);
            }
        };

        let elapsed = now - last;
        if elapsed < Duration::zero() {
            warn!("Refresh timestamp {} is in the future, allowing", raw);
            return GateStatus::open(None);
        }
        if elapsed >= self.cooldown {
            return GateStatus::open(Some(elapsed.num_seconds()));
        }

        let remaining = self.cooldown - elapsed;
        let remaining_secs = (remaining.num_milliseconds() + 999) / 1000;
        debug!("Refresh gated: {}s elapsed, {}s remaining", elapsed.num_seconds(), remaining_secs);
        GateStatus { allowed: false, remaining_secs, elapsed_secs: Some(elapsed.num_seconds()) }
    }

    /// Record a recompute starting at `now`. Call before recomputing so
    /// overlapping triggers are gated.
    pub async fn mark<S: Spreadsheet>(&self, ledger: &Ledger<S>, now: DateTime<Utc>) -> Result<(), LedgerError> {
        ledger.set_config(LAST_REFRESH_KEY, &now.to_rfc3339()).await
    }

    /// Reopen the gate immediately.
    pub async fn clear<S: Spreadsheet>(&self, ledger: &Ledger<S>) -> Result<(), LedgerError> {
        ledger.set_config(LAST_REFRESH_KEY, "").await
    }
}

//! Per-key usage record — daily request accounting and health state.
//!
//! Each configured credential owns one `KeyRecord` for the lifetime of
//! the process. Counters roll over lazily: every read goes through
//! `reset_if_needed` first, so no background timer is involved.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use zeroize::Zeroizing;

/// Consecutive failures at which a key drops out of normal selection.
pub const SOFT_ERROR_THRESHOLD: u32 = 10;

/// Error count reported for hard-quarantined keys.
pub const QUARANTINE_ERROR_COUNT: u32 = 999;

/// Length of the request accounting window.
pub const DAILY_WINDOW_HOURS: i64 = 24;

/// Minimum quarantine for provider-reported long-term (monthly) caps.
pub const LONG_TERM_QUARANTINE_DAYS: i64 = 30;

// ── Key State ───────────────────────────────────────────────────────

/// Health of a single key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum KeyState {
    /// Eligible for normal selection while under its daily limit.
    Healthy { errors: u32 },
    /// Hit the soft error threshold; only picked as a fallback until the
    /// daily window rolls over.
    SoftSaturated { errors: u32 },
    /// Explicitly reported as exhausted. A monthly stamp holds the key
    /// out for at least 30 days regardless of the daily window.
    HardQuarantined {
        monthly_started_at: Option<DateTime<Utc>>,
    },
}

impl KeyState {
    pub fn error_count(&self) -> u32 {
        match self {
            KeyState::Healthy { errors } | KeyState::SoftSaturated { errors } => *errors,
            KeyState::HardQuarantined { .. } => QUARANTINE_ERROR_COUNT,
        }
    }

    pub fn is_hard_quarantined(&self) -> bool {
        matches!(self, KeyState::HardQuarantined { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            KeyState::Healthy { .. } => "healthy",
            KeyState::SoftSaturated { .. } => "soft_saturated",
            KeyState::HardQuarantined { monthly_started_at: Some(_) } => "monthly_quarantine",
            KeyState::HardQuarantined { monthly_started_at: None } => "quarantined",
        }
    }
}

// ── Key Record ──────────────────────────────────────────────────────

pub struct KeyRecord {
    identifier: Zeroizing<String>,
    provider_class: String,
    request_count: u32,
    daily_limit: u32,
    state: KeyState,
    window_started_at: DateTime<Utc>,
    last_used_at: Option<DateTime<Utc>>,
}

impl KeyRecord {
    pub fn new(identifier: String, provider_class: &str, daily_limit: u32, now: DateTime<Utc>) -> Self {
        Self {
            identifier: Zeroizing::new(identifier),
            provider_class: provider_class.to_string(),
            request_count: 0,
            daily_limit,
            state: KeyState::Healthy { errors: 0 },
            window_started_at: now,
            last_used_at: None,
        }
    }

    pub fn identifier(&self) -> &str {
        self.identifier.as_str()
    }

    pub fn masked(&self) -> String {
        mask_key(&self.identifier)
    }

    pub fn provider_class(&self) -> &str {
        &self.provider_class
    }

    pub fn state(&self) -> KeyState {
        self.state
    }

    pub fn error_count(&self) -> u32 {
        self.state.error_count()
    }

    pub fn request_count(&self) -> u32 {
        self.request_count
    }

    pub fn daily_limit(&self) -> u32 {
        self.daily_limit
    }

    pub fn window_started_at(&self) -> DateTime<Utc> {
        self.window_started_at
    }

    pub fn last_used_at(&self) -> Option<DateTime<Utc>> {
        self.last_used_at
    }

    pub fn monthly_quarantine_started_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            KeyState::HardQuarantined { monthly_started_at } => monthly_started_at,
            _ => None,
        }
    }

    pub fn is_hard_quarantined(&self) -> bool {
        self.state.is_hard_quarantined()
    }

    /// Under its daily limit and below the soft error threshold.
    pub fn is_acceptable(&self) -> bool {
        self.request_count < self.daily_limit
            && matches!(self.state, KeyState::Healthy { errors } if errors < SOFT_ERROR_THRESHOLD)
    }

    /// Roll the daily window over if it has elapsed.
    ///
    /// The request counter always resets with the window. Errors are
    /// forgiven too, except for a monthly quarantine younger than 30 days,
    /// which survives any number of daily rollovers.
    ///
    /// Returns true when the window was rolled over.
    pub fn reset_if_needed(&mut self, now: DateTime<Utc>) -> bool {
        if now - self.window_started_at < Duration::hours(DAILY_WINDOW_HOURS) {
            return false;
        }

        self.request_count = 0;
        self.window_started_at = now;

        match self.state {
            KeyState::HardQuarantined { monthly_started_at: Some(started) }
                if now - started < Duration::days(LONG_TERM_QUARANTINE_DAYS) =>
            {
                tracing::debug!(
                    provider = %self.provider_class,
                    key = %self.masked(),
                    "Daily window rolled over, long-term quarantine still in effect"
                );
            }
            previous => {
                self.state = KeyState::Healthy { errors: 0 };
                if previous.is_hard_quarantined() {
                    tracing::info!(
                        provider = %self.provider_class,
                        key = %self.masked(),
                        "Key released from quarantine"
                    );
                }
            }
        }

        true
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_used_at = Some(now);
    }

    /// Count a successful call. Errors decay by one per success.
    ///
    /// A quarantined key stays quarantined; only the window can release it.
    pub fn record_success(&mut self) {
        self.request_count = self.request_count.saturating_add(1);
        self.state = match self.state {
            KeyState::Healthy { errors } => KeyState::Healthy {
                errors: errors.saturating_sub(1),
            },
            KeyState::SoftSaturated { errors } => KeyState::SoftSaturated {
                errors: errors.saturating_sub(1),
            },
            hard => hard,
        };
    }

    /// Count a failed call. Returns true if this failure pushed the key
    /// into soft saturation.
    pub fn record_failure(&mut self) -> bool {
        match self.state {
            KeyState::Healthy { errors } => {
                let errors = errors + 1;
                if errors >= SOFT_ERROR_THRESHOLD {
                    self.state = KeyState::SoftSaturated { errors };
                    self.request_count = self.daily_limit;
                    true
                } else {
                    self.state = KeyState::Healthy { errors };
                    false
                }
            }
            KeyState::SoftSaturated { errors } => {
                self.state = KeyState::SoftSaturated {
                    errors: (errors + 1).min(QUARANTINE_ERROR_COUNT - 1),
                };
                false
            }
            KeyState::HardQuarantined { .. } => false,
        }
    }

    /// Put the key into hard quarantine.
    ///
    /// `long_term` stamps the monthly quarantine start. A short-term report
    /// never clears a stamp that is already there.
    pub fn mark_exhausted(&mut self, long_term: bool, now: DateTime<Utc>) {
        let existing = self.monthly_quarantine_started_at();
        self.request_count = self.daily_limit;
        self.state = KeyState::HardQuarantined {
            monthly_started_at: if long_term { Some(now) } else { existing },
        };
    }

    pub fn snapshot(&self) -> KeySnapshot {
        KeySnapshot {
            key: self.masked(),
            provider_class: self.provider_class.clone(),
            state: self.state.label(),
            error_count: self.error_count(),
            request_count: self.request_count,
            daily_limit: self.daily_limit,
            window_started_at: self.window_started_at,
            last_used_at: self.last_used_at,
            monthly_quarantine_started_at: self.monthly_quarantine_started_at(),
        }
    }
}

impl std::fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRecord")
            .field("key", &self.masked())
            .field("provider_class", &self.provider_class)
            .field("request_count", &self.request_count)
            .field("daily_limit", &self.daily_limit)
            .field("state", &self.state)
            .field("window_started_at", &self.window_started_at)
            .field("last_used_at", &self.last_used_at)
            .finish()
    }
}

/// Point-in-time view of one key, safe to log or serve.
#[derive(Debug, Clone, Serialize)]
pub struct KeySnapshot {
    pub key: String,
    pub provider_class: String,
    pub state: &'static str,
    pub error_count: u32,
    pub request_count: u32,
    pub daily_limit: u32,
    pub window_started_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub monthly_quarantine_started_at: Option<DateTime<Utc>>,
}

/// Short, non-reversible display form of a credential.
pub fn mask_key(key: &str) -> String {
    let visible = (key.chars().count() / 2).min(6);
    let prefix: String = key.chars().take(visible).collect();
    format!("{}…", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(limit: u32) -> (KeyRecord, DateTime<Utc>) {
        let now = Utc::now();
        (KeyRecord::new("sk-test-0123456789".into(), "text", limit, now), now)
    }

    #[test]
    fn test_mask_key_never_shows_whole_key() {
        assert_eq!(mask_key("sk-test-0123456789"), "sk-tes…");
        assert_eq!(mask_key("abcd"), "ab…");
        assert_eq!(mask_key(""), "…");
    }

    #[test]
    fn test_soft_saturation_at_threshold() {
        let (mut rec, _) = record(100);
        for _ in 0..SOFT_ERROR_THRESHOLD - 1 {
            assert!(!rec.record_failure());
        }
        assert!(rec.is_acceptable());

        assert!(rec.record_failure());
        assert_eq!(rec.state(), KeyState::SoftSaturated { errors: SOFT_ERROR_THRESHOLD });
        assert_eq!(rec.request_count(), 100);
        assert!(!rec.is_acceptable());
    }

    #[test]
    fn test_success_keeps_hard_quarantine() {
        let (mut rec, now) = record(10);
        rec.mark_exhausted(false, now);
        rec.record_success();
        assert!(rec.is_hard_quarantined());
        assert_eq!(rec.error_count(), QUARANTINE_ERROR_COUNT);
    }

    #[test]
    fn test_window_not_elapsed_is_noop() {
        let (mut rec, now) = record(10);
        rec.record_success();
        assert!(!rec.reset_if_needed(now + Duration::hours(23)));
        assert_eq!(rec.request_count(), 1);
    }

    #[test]
    fn test_daily_reset_releases_short_term_quarantine() {
        let (mut rec, now) = record(10);
        rec.mark_exhausted(false, now);

        assert!(rec.reset_if_needed(now + Duration::hours(24)));
        assert_eq!(rec.state(), KeyState::Healthy { errors: 0 });
        assert_eq!(rec.request_count(), 0);
    }

    #[test]
    fn test_monthly_quarantine_rolls_counters_but_holds_key() {
        let (mut rec, now) = record(10);
        rec.mark_exhausted(true, now);

        let day_later = now + Duration::hours(25);
        assert!(rec.reset_if_needed(day_later));
        assert_eq!(rec.request_count(), 0);
        assert_eq!(rec.window_started_at(), day_later);
        assert!(rec.is_hard_quarantined());
        assert_eq!(rec.monthly_quarantine_started_at(), Some(now));

        let month_later = now + Duration::days(LONG_TERM_QUARANTINE_DAYS);
        assert!(rec.reset_if_needed(month_later));
        assert_eq!(rec.state(), KeyState::Healthy { errors: 0 });
        assert_eq!(rec.monthly_quarantine_started_at(), None);
    }

    #[test]
    fn test_short_term_report_keeps_monthly_stamp() {
        let (mut rec, now) = record(10);
        rec.mark_exhausted(true, now);
        rec.mark_exhausted(false, now + Duration::hours(1));
        assert_eq!(rec.monthly_quarantine_started_at(), Some(now));
    }

    #[test]
    fn test_debug_masks_identifier() {
        let (rec, _) = record(10);
        let dbg = format!("{:?}", rec);
        assert!(!dbg.contains("0123456789"));
    }
}

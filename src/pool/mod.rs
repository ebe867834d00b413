//! Key rotation scheduler — picks the next usable key for a provider class.
//!
//! Implements round-robin with health awareness: skips quarantined
//! keys, prefers keys under their daily limit and soft error threshold,
//! and falls back to the least-failing key when nothing is healthy.
//! Callers do the network call themselves and report back.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};

pub mod classifier;
pub mod dispatch;
pub mod record;
pub mod registry;

pub use classifier::CallOutcome;
pub use record::{mask_key, KeyRecord, KeySnapshot, KeyState};

/// Aggregate usage for one pool (or for all pools, see `registry`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub provider_class: String,
    pub key_count: usize,
    pub total_requests_today: u64,
    pub total_daily_capacity: u64,
}

struct PoolState {
    records: Vec<KeyRecord>,
    /// Index the next round-robin scan starts from.
    cursor: usize,
}

impl PoolState {
    fn position(&self, credential: &str) -> Option<usize> {
        self.records.iter().position(|r| r.identifier() == credential)
    }

    fn advance_past(&mut self, idx: usize) {
        if self.records.len() > 1 {
            self.cursor = (idx + 1) % self.records.len();
        }
    }

    fn take(&mut self, idx: usize, now: DateTime<Utc>) -> String {
        self.records[idx].touch(now);
        self.advance_past(idx);
        self.records[idx].identifier().to_string()
    }
}

/// Round-robin key scheduler for one provider class.
///
/// All state sits behind a single mutex. Every operation is in-memory
/// and O(pool size); nothing awaits while the lock is held.
pub struct KeyRotationScheduler {
    provider_class: String,
    daily_limit: u32,
    clock: Arc<dyn Clock>,
    state: Mutex<PoolState>,
}

impl KeyRotationScheduler {
    pub fn new(provider_class: &str, credentials: Vec<String>, daily_limit: u32) -> Self {
        Self::with_clock(provider_class, credentials, daily_limit, Arc::new(SystemClock))
    }

    pub fn with_clock(
        provider_class: &str,
        credentials: Vec<String>,
        daily_limit: u32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        let mut records: Vec<KeyRecord> = Vec::with_capacity(credentials.len());
        for credential in credentials {
            if records.iter().any(|r| r.identifier() == credential) {
                warn!(
                    provider = provider_class,
                    key = %mask_key(&credential),
                    "Duplicate credential ignored"
                );
                continue;
            }
            records.push(KeyRecord::new(credential, provider_class, daily_limit, now));
        }

        info!(
            provider = provider_class,
            keys = records.len(),
            daily_limit = daily_limit,
            "Key pool ready"
        );

        Self {
            provider_class: provider_class.to_string(),
            daily_limit,
            clock,
            state: Mutex::new(PoolState { records, cursor: 0 }),
        }
    }

    pub fn provider_class(&self) -> &str {
        &self.provider_class
    }

    pub fn daily_limit(&self) -> u32 {
        self.daily_limit
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Every mutation leaves the records consistent, so a panic elsewhere
    // while holding the lock does not invalidate them.
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Select the next key to use, or `None` if the pool is empty.
    ///
    /// Never fails on a non-empty pool: when no key is healthy the least
    /// damaged one is handed out, and as a last resort even a quarantined
    /// key is returned.
    pub fn select_key(&self) -> Option<String> {
        let now = self.clock.now();
        let mut state = self.lock();
        let total = state.records.len();

        match total {
            0 => None,
            1 => {
                let record = &mut state.records[0];
                record.reset_if_needed(now);
                if record.is_hard_quarantined() {
                    warn!(
                        provider = %self.provider_class,
                        key = %record.masked(),
                        "Only key is quarantined, using it anyway"
                    );
                }
                Some(state.take(0, now))
            }
            _ => {
                for offset in 0..total {
                    let idx = (state.cursor + offset) % total;
                    let record = &mut state.records[idx];
                    record.reset_if_needed(now);
                    if record.is_hard_quarantined() {
                        continue;
                    }
                    if record.is_acceptable() {
                        debug!(
                            provider = %self.provider_class,
                            key = %record.masked(),
                            index = idx,
                            "Round-robin selected key"
                        );
                        return Some(state.take(idx, now));
                    }
                }

                let fallback = state
                    .records
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| !r.is_hard_quarantined())
                    .min_by_key(|(_, r)| (r.error_count(), r.request_count(), r.last_used_at()))
                    .map(|(i, _)| i);

                if let Some(idx) = fallback {
                    warn!(
                        provider = %self.provider_class,
                        key = %state.records[idx].masked(),
                        errors = state.records[idx].error_count(),
                        "No healthy key, falling back to least-failing key"
                    );
                    return Some(state.take(idx, now));
                }

                let idx = state
                    .records
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, r)| (r.error_count(), r.last_used_at()))
                    .map(|(i, _)| i)?;
                warn!(
                    provider = %self.provider_class,
                    key = %state.records[idx].masked(),
                    "All keys exhausted, using quarantined key as last resort"
                );
                Some(state.take(idx, now))
            }
        }
    }

    /// Record the result of a call made with `credential`.
    pub fn record_outcome(&self, credential: &str, success: bool) {
        let now = self.clock.now();
        let mut state = self.lock();
        let Some(idx) = state.position(credential) else {
            warn!(
                provider = %self.provider_class,
                key = %mask_key(credential),
                "Outcome reported for unknown key"
            );
            return;
        };

        let record = &mut state.records[idx];
        record.reset_if_needed(now);
        if success {
            record.record_success();
        } else if record.record_failure() {
            warn!(
                provider = %self.provider_class,
                key = %record.masked(),
                errors = record.error_count(),
                "Key hit error threshold, saturated for the rest of the window"
            );
        }

        state.advance_past(idx);
    }

    /// Quarantine `credential` after the provider reported it exhausted.
    ///
    /// `is_long_term_limit` holds the key out for 30 days instead of
    /// releasing it at the next daily rollover.
    pub fn mark_exhausted(&self, credential: &str, is_long_term_limit: bool) {
        let now = self.clock.now();
        let mut state = self.lock();
        let Some(idx) = state.position(credential) else {
            warn!(
                provider = %self.provider_class,
                key = %mask_key(credential),
                "Exhaustion reported for unknown key"
            );
            return;
        };

        let record = &mut state.records[idx];
        record.reset_if_needed(now);
        record.mark_exhausted(is_long_term_limit, now);
        warn!(
            provider = %self.provider_class,
            key = %record.masked(),
            long_term = is_long_term_limit,
            "Key quarantined"
        );

        state.advance_past(idx);
    }

    /// Apply a classified call outcome.
    pub fn report(&self, credential: &str, outcome: CallOutcome) {
        match outcome {
            CallOutcome::Success | CallOutcome::Rejected => self.record_outcome(credential, true),
            CallOutcome::Transient | CallOutcome::RateLimited => {
                self.record_outcome(credential, false)
            }
            CallOutcome::QuotaExhausted { long_term } => self.mark_exhausted(credential, long_term),
            CallOutcome::AuthFailure => self.mark_exhausted(credential, false),
        }
    }

    /// Aggregate usage across the pool.
    pub fn stats(&self) -> PoolStats {
        let now = self.clock.now();
        let mut state = self.lock();
        let mut stats = PoolStats {
            provider_class: self.provider_class.clone(),
            key_count: state.records.len(),
            ..PoolStats::default()
        };
        for record in state.records.iter_mut() {
            record.reset_if_needed(now);
            stats.total_requests_today += u64::from(record.request_count());
            stats.total_daily_capacity += u64::from(record.daily_limit());
        }
        stats
    }

    /// Per-key view with masked credentials.
    pub fn snapshot(&self) -> Vec<KeySnapshot> {
        let now = self.clock.now();
        let mut state = self.lock();
        state
            .records
            .iter_mut()
            .map(|record| {
                record.reset_if_needed(now);
                record.snapshot()
            })
            .collect()
    }
}

impl std::fmt::Debug for KeyRotationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRotationScheduler")
            .field("provider_class", &self.provider_class)
            .field("daily_limit", &self.daily_limit)
            .field("keys", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;
    use std::collections::HashSet;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn pool(names: &[&str], limit: u32) -> (KeyRotationScheduler, ManualClock) {
        let clock = ManualClock::default();
        let pool = KeyRotationScheduler::with_clock("text", keys(names), limit, Arc::new(clock.clone()));
        (pool, clock)
    }

    fn error_count(pool: &KeyRotationScheduler, idx: usize) -> u32 {
        pool.snapshot()[idx].error_count
    }

    #[test]
    fn test_empty_pool_never_yields_a_key() {
        let (pool, _) = pool(&[], 10);
        for _ in 0..5 {
            assert_eq!(pool.select_key(), None);
        }
        assert!(pool.is_empty());
    }

    #[test]
    fn test_single_key_always_returned() {
        let (pool, _) = pool(&["only-key-aaaa"], 10);
        assert_eq!(pool.select_key().as_deref(), Some("only-key-aaaa"));

        pool.mark_exhausted("only-key-aaaa", true);
        for _ in 0..3 {
            assert_eq!(pool.select_key().as_deref(), Some("only-key-aaaa"));
        }
    }

    #[test]
    fn test_round_robin_visits_each_key_once() {
        let names = ["key-a-000", "key-b-000", "key-c-000", "key-d-000"];
        let (pool, _) = pool(&names, 100);

        let mut seen = HashSet::new();
        for _ in 0..names.len() {
            let key = pool.select_key().unwrap();
            pool.record_outcome(&key, true);
            assert!(seen.insert(key), "key repeated before full circuit");
        }
        assert_eq!(seen.len(), names.len());
    }

    #[test]
    fn test_quarantined_key_is_skipped() {
        let (pool, _) = pool(&["key-a-000", "key-b-000"], 100);
        pool.mark_exhausted("key-a-000", false);

        for _ in 0..20 {
            let key = pool.select_key().unwrap();
            assert_eq!(key, "key-b-000");
            pool.record_outcome(&key, true);
        }
    }

    #[test]
    fn test_daily_reset_revives_saturated_key() {
        let (pool, clock) = pool(&["key-a-000", "key-b-000"], 2);
        pool.record_outcome("key-a-000", true);
        pool.record_outcome("key-a-000", true);

        for _ in 0..4 {
            assert_eq!(pool.select_key().as_deref(), Some("key-b-000"));
        }

        clock.advance(Duration::hours(24));
        let picks: Vec<_> = (0..2).map(|_| pool.select_key().unwrap()).collect();
        assert!(picks.contains(&"key-a-000".to_string()));
        assert_eq!(pool.snapshot()[0].request_count, 0);
    }

    #[test]
    fn test_monthly_quarantine_survives_daily_reset() {
        let (pool, clock) = pool(&["key-a-000", "key-b-000"], 100);
        pool.mark_exhausted("key-a-000", true);

        clock.advance(Duration::hours(24));
        for _ in 0..6 {
            assert_eq!(pool.select_key().as_deref(), Some("key-b-000"));
        }
        assert!(error_count(&pool, 0) >= record::QUARANTINE_ERROR_COUNT);
        assert_eq!(pool.snapshot()[0].request_count, 0);

        clock.advance(Duration::days(30));
        assert_eq!(error_count(&pool, 0), 0);
        assert!(pool.snapshot()[0].monthly_quarantine_started_at.is_none());
        let picks: Vec<_> = (0..2).map(|_| pool.select_key().unwrap()).collect();
        assert!(picks.contains(&"key-a-000".to_string()));
    }

    #[test]
    fn test_errors_decay_with_success() {
        let (pool, _) = pool(&["key-a-000", "key-b-000"], 10);
        for _ in 0..5 {
            pool.record_outcome("key-a-000", false);
        }
        assert_eq!(error_count(&pool, 0), 5);

        for _ in 0..5 {
            pool.record_outcome("key-a-000", true);
        }
        assert_eq!(error_count(&pool, 0), 0);
        assert_eq!(pool.snapshot()[0].state, "healthy");
    }

    #[test]
    fn test_all_saturated_falls_back_to_fewest_errors() {
        let (pool, _) = pool(&["key-a-000", "key-b-000"], 3);
        for _ in 0..3 {
            pool.record_outcome("key-a-000", true);
            pool.record_outcome("key-b-000", true);
        }
        pool.record_outcome("key-a-000", false);
        pool.record_outcome("key-a-000", false);
        pool.record_outcome("key-b-000", false);

        assert_eq!(pool.select_key().as_deref(), Some("key-b-000"));
    }

    #[test]
    fn test_error_threshold_soft_saturates() {
        let (pool, _) = pool(&["key-a-000", "key-b-000"], 100);
        for _ in 0..record::SOFT_ERROR_THRESHOLD {
            pool.record_outcome("key-a-000", false);
        }
        let snap = &pool.snapshot()[0];
        assert_eq!(snap.state, "soft_saturated");
        assert_eq!(snap.request_count, 100);

        for _ in 0..5 {
            assert_eq!(pool.select_key().as_deref(), Some("key-b-000"));
        }
    }

    #[test]
    fn test_error_saturation_clears_after_a_day() {
        let (pool, clock) = pool(&["key-a-000", "key-b-000"], 100);
        for _ in 0..record::SOFT_ERROR_THRESHOLD {
            pool.record_outcome("key-a-000", false);
        }
        assert_eq!(pool.snapshot()[0].state, "soft_saturated");
        assert_eq!(pool.select_key().as_deref(), Some("key-b-000"));

        clock.advance(Duration::hours(24));
        let snap = &pool.snapshot()[0];
        assert_eq!(snap.state, "healthy");
        assert_eq!(snap.error_count, 0);
        assert_eq!(snap.request_count, 0);

        let picks: Vec<_> = (0..2).map(|_| pool.select_key().unwrap()).collect();
        assert!(picks.contains(&"key-a-000".to_string()));
    }

    #[test]
    fn test_all_quarantined_still_returns_a_key() {
        let (pool, clock) = pool(&["key-a-000", "key-b-000"], 100);
        // a has been used, b never has
        assert_eq!(pool.select_key().as_deref(), Some("key-a-000"));
        clock.advance(Duration::minutes(1));
        pool.mark_exhausted("key-a-000", true);
        pool.mark_exhausted("key-b-000", false);

        assert_eq!(pool.select_key().as_deref(), Some("key-b-000"));
        clock.advance(Duration::minutes(1));
        // b now carries the most recent use, so a is next
        assert_eq!(pool.select_key().as_deref(), Some("key-a-000"));
    }

    #[test]
    fn test_failure_moves_cursor_to_next_key() {
        let (pool, _) = pool(&["key-a-000", "key-b-000", "key-c-000"], 100);
        pool.record_outcome("key-b-000", false);
        assert_eq!(pool.select_key().as_deref(), Some("key-c-000"));
    }

    #[test]
    fn test_report_maps_outcomes() {
        let (pool, _) = pool(&["key-a-000", "key-b-000"], 100);
        pool.report("key-a-000", CallOutcome::RateLimited);
        assert_eq!(error_count(&pool, 0), 1);

        pool.report("key-b-000", CallOutcome::QuotaExhausted { long_term: true });
        assert_eq!(pool.snapshot()[1].state, "monthly_quarantine");

        pool.report("key-a-000", CallOutcome::AuthFailure);
        assert_eq!(pool.snapshot()[0].state, "quarantined");
    }

    #[test]
    fn test_unknown_credential_is_ignored() {
        let (pool, _) = pool(&["key-a-000"], 10);
        pool.record_outcome("nope", false);
        pool.mark_exhausted("nope", true);
        assert_eq!(error_count(&pool, 0), 0);
    }

    #[test]
    fn test_duplicate_credentials_collapse() {
        let (pool, _) = pool(&["key-a-000", "key-a-000", "key-b-000"], 10);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_stats_sum_requests_and_capacity() {
        let (pool, clock) = pool(&["key-a-000", "key-b-000", "key-c-000"], 50);
        pool.record_outcome("key-a-000", true);
        pool.record_outcome("key-b-000", true);
        pool.record_outcome("key-b-000", true);

        let stats = pool.stats();
        assert_eq!(stats.key_count, 3);
        assert_eq!(stats.total_requests_today, 3);
        assert_eq!(stats.total_daily_capacity, 150);

        clock.advance(Duration::hours(24));
        assert_eq!(pool.stats().total_requests_today, 0);
    }

    #[test]
    fn test_concurrent_use_keeps_counts() {
        let (pool, _) = pool(&["key-a-000", "key-b-000", "key-c-000"], 10_000);
        let pool = Arc::new(pool);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let key = pool.select_key().unwrap();
                        pool.record_outcome(&key, true);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(pool.stats().total_requests_today, 800);
    }
}

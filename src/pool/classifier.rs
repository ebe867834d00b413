//! Call outcome classifier — turns a provider response into something
//! the scheduler can account for.
//!
//! Providers do not agree on how they report limits. The status code
//! gets us most of the way; the error body decides between a per-minute
//! throttle, a daily cap and a long-horizon (monthly / billing) cap.

use http::StatusCode;
use serde::Serialize;

use crate::adapters::ProviderError;

/// What happened to a call, from the key pool's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    /// Network error, timeout or 5xx.
    Transient,
    /// 429 or an equivalent short-term throttle.
    RateLimited,
    /// The provider says this key is out of quota. `long_term` marks
    /// caps that do not reset daily.
    QuotaExhausted { long_term: bool },
    /// The provider rejected the credential itself.
    AuthFailure,
    /// The request was invalid; the key is not at fault.
    Rejected,
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Success)
    }

    /// Whether another key in the same pool might succeed where this one failed.
    pub fn worth_retrying_on_other_key(&self) -> bool {
        !matches!(self, CallOutcome::Success | CallOutcome::Rejected)
    }
}

const PER_MINUTE_PATTERNS: &[&str] = &[
    "per minute",
    "per_minute",
    "perminute",
    "requests per min",
    "tokens per min",
];

const DAILY_PATTERNS: &[&str] = &["per day", "per_day", "perday", "daily limit", "daily quota"];

const LONG_TERM_PATTERNS: &[&str] = &[
    "monthly",
    "usage limit",
    "quota exceeded",
    "exceeded your current quota",
    "insufficient_quota",
    "billing",
    "out of credits",
    "insufficient credits",
    "credit balance",
];

const THROTTLE_PATTERNS: &[&str] = &["resource_exhausted", "rate limit", "rate_limit", "too many requests"];

/// Classify an HTTP response from a provider.
pub fn classify_response(status: StatusCode, body: &str) -> CallOutcome {
    if status.is_success() {
        return CallOutcome::Success;
    }
    if status == StatusCode::UNAUTHORIZED {
        return CallOutcome::AuthFailure;
    }

    // Server side trouble says nothing about the key, whatever the body says.
    if status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
        return CallOutcome::Transient;
    }

    let lower = body.to_lowercase();
    let mentions = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    let quota_signal = status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::PAYMENT_REQUIRED
        || status == StatusCode::FORBIDDEN
        || (status.is_client_error() && (mentions(LONG_TERM_PATTERNS) || mentions(THROTTLE_PATTERNS)));

    if quota_signal {
        // Narrowest window wins: "quota exceeded for requests per minute"
        // is a throttle, not an exhausted key.
        if mentions(PER_MINUTE_PATTERNS) {
            return CallOutcome::RateLimited;
        }
        if mentions(DAILY_PATTERNS) {
            return CallOutcome::QuotaExhausted { long_term: false };
        }
        if status == StatusCode::PAYMENT_REQUIRED || mentions(LONG_TERM_PATTERNS) {
            return CallOutcome::QuotaExhausted { long_term: true };
        }
    }

    if status == StatusCode::FORBIDDEN {
        return CallOutcome::AuthFailure;
    }
    if status == StatusCode::TOO_MANY_REQUESTS || mentions(THROTTLE_PATTERNS) {
        return CallOutcome::RateLimited;
    }
    if status.is_client_error() {
        return CallOutcome::Rejected;
    }
    CallOutcome::Transient
}

/// Classify a failed adapter call.
pub fn classify_error(err: &ProviderError) -> CallOutcome {
    match err {
        ProviderError::Http { status, body } => match StatusCode::from_u16(*status) {
            Ok(status) => classify_response(status, body),
            Err(_) => CallOutcome::Transient,
        },
        ProviderError::Transport(_) | ProviderError::Decode(_) => CallOutcome::Transient,
    }
}

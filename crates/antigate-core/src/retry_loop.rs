//! Retry Loop decisions (spec §4 C1): bounded-attempt backoff and the
//! branch between "retry same account", "switch account", "switch base
//! URL", and "give up". Kept pure and I/O-free, like [`crate::rate_limit`];
//! [`crate::orchestrator`] is what actually drives the loop against the
//! account pool, URL tracker, and upstream client.
//!
//! Grounded on `gproxy-core::proxy_engine::mod.rs`'s attempt loop and its
//! `retry_backoff_delay`/`backoff_sleep`/`is_retryable_failure` helpers.

use std::time::Duration;

use rand::Rng;

/// Matches gproxy's `retry_backoff_delay`: `200ms * 2^min(attempt-1,6)`
/// plus uniform jitter in `[0, base_ms]`, capped at 2s.
pub fn retry_backoff_delay(attempt_no: u32) -> Duration {
    let exponent = attempt_no.saturating_sub(1).min(6);
    let base_ms = 200u64 * (1u64 << exponent);
    let jitter = rand::rng().random_range(0..=base_ms);
    Duration::from_millis((base_ms + jitter).min(2000))
}

pub async fn backoff_sleep(attempt_no: u32) {
    tokio::time::sleep(retry_backoff_delay(attempt_no)).await;
}

/// HTTP statuses gproxy treats as retryable: `{429, 401, 403, 5xx}`.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 401 | 403 | 429) || (500..=599).contains(&status)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailureKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

/// Transport failure kinds gproxy retries: everything except an
/// unclassified `Other`.
pub fn is_retryable_transport(kind: TransportFailureKind) -> bool {
    !matches!(kind, TransportFailureKind::Other)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Status(u16),
    Transport(TransportFailureKind),
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        match self {
            FailureKind::Status(status) => is_retryable_status(status),
            FailureKind::Transport(kind) => is_retryable_transport(kind),
        }
    }

    /// Whether this failure should switch to a different account rather
    /// than retry the same one: auth failures and 5xx/429 mark the account,
    /// a bare transport hiccup is worth one same-account retry first.
    pub fn should_switch_account(self) -> bool {
        match self {
            FailureKind::Status(status) => matches!(status, 401 | 403 | 429) || (500..=599).contains(&status),
            FailureKind::Transport(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the same account after the given backoff.
    RetrySameAccount { wait: Duration },
    /// Mark this account unavailable and pick a different one.
    SwitchAccount,
    /// Every account has now failed this URL within budget; move to the
    /// next base URL in [`crate::url_tracker::UrlAvailabilityTracker`].
    SwitchUrl,
    /// No base URL has a viable account left; surface the failure.
    GiveUp,
}

/// Per spec §4.C1: an attempt failure either isn't retryable at all (give
/// up), is retryable but should switch accounts, or is worth one more try
/// on the same account, until `attempt_no` exhausts `max_attempts_per_url`,
/// at which point the outer URL loop takes over.
pub fn decide(failure: FailureKind, attempt_no: u32, max_attempts_per_url: u32, urls_remaining: u32) -> RetryDecision {
    if !failure.is_retryable() {
        return RetryDecision::GiveUp;
    }

    if attempt_no >= max_attempts_per_url {
        return if urls_remaining > 0 {
            RetryDecision::SwitchUrl
        } else {
            RetryDecision::GiveUp
        };
    }

    if failure.should_switch_account() {
        RetryDecision::SwitchAccount
    } else {
        RetryDecision::RetrySameAccount {
            wait: retry_backoff_delay(attempt_no),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_grows_and_caps_at_two_seconds() {
        assert!(retry_backoff_delay(1) <= Duration::from_millis(400));
        assert!(retry_backoff_delay(10) <= Duration::from_millis(2000));
    }

    #[test]
    fn client_error_is_not_retryable() {
        assert!(!FailureKind::Status(400).is_retryable());
        assert!(!FailureKind::Status(404).is_retryable());
    }

    #[test]
    fn rate_limit_and_auth_statuses_are_retryable() {
        for status in [401, 403, 429, 500, 503] {
            assert!(FailureKind::Status(status).is_retryable());
        }
    }

    #[test]
    fn non_retryable_failure_gives_up_immediately() {
        let decision = decide(FailureKind::Status(400), 1, 3, 2);
        assert_eq!(decision, RetryDecision::GiveUp);
    }

    #[test]
    fn rate_limit_status_switches_account_before_exhausting_attempts() {
        let decision = decide(FailureKind::Status(429), 1, 3, 2);
        assert_eq!(decision, RetryDecision::SwitchAccount);
    }

    #[test]
    fn bare_transport_hiccup_retries_same_account_first() {
        let decision = decide(FailureKind::Transport(TransportFailureKind::Timeout), 1, 3, 2);
        assert!(matches!(decision, RetryDecision::RetrySameAccount { .. }));
    }

    #[test]
    fn exhausting_attempts_on_this_url_moves_to_the_next_one() {
        let decision = decide(FailureKind::Status(500), 3, 3, 1);
        assert_eq!(decision, RetryDecision::SwitchUrl);
    }

    #[test]
    fn exhausting_attempts_with_no_urls_left_gives_up() {
        let decision = decide(FailureKind::Status(500), 3, 3, 0);
        assert_eq!(decision, RetryDecision::GiveUp);
    }
}

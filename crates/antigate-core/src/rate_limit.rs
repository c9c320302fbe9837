//! Rate-Limit Classifier (spec §2 L4) and Smart-Retry Decider (spec §2 C2).
//!
//! Both read the same upstream JSON error shape
//! (`{"error":{"status":..., "details":[...]}}`) the Antigravity upstream
//! returns on 429/503; L4 is the generic fallback for bodies the decider
//! does not recognize as a model-capacity signal.
//!
//! Grounded on `gproxy-core::proxy_engine`'s `apply_unavailable_decision` /
//! `is_retryable_failure` status handling, generalized from that module's
//! binary "retryable or not" split into the decider's four-way branch.

use std::time::Duration;

use serde::Deserialize;

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverClass {
    /// Status the retry loop should treat as "switch account/URL and retry".
    UpstreamFailover,
    /// Status the retry loop should surface to the caller as-is.
    ClientError,
}

/// Failover status taxonomy from spec §4.L4: {401,403,429,529,5xx} fail
/// over, everything else maps straight through to the client.
pub fn classify_status(status: u16) -> FailoverClass {
    match status {
        401 | 403 | 429 | 529 => FailoverClass::UpstreamFailover,
        500..=599 => FailoverClass::UpstreamFailover,
        _ => FailoverClass::ClientError,
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(rename = "@type", default)]
    type_url: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(rename = "retryDelay", default)]
    retry_delay: Option<String>,
    #[serde(default)]
    metadata: Option<std::collections::HashMap<String, String>>,
}

fn parse_envelope(body: &str) -> Option<ErrorEnvelope> {
    serde_json::from_str(body).ok()
}

fn parse_retry_delay(detail: &ErrorDetail) -> Option<Duration> {
    let type_matches = detail
        .type_url
        .as_deref()
        .map(|t| t.contains("RetryInfo"))
        .unwrap_or(false);
    if !type_matches {
        return None;
    }
    let raw = detail.retry_delay.as_deref()?;
    parse_seconds_suffix(raw)
}

fn parse_seconds_suffix(raw: &str) -> Option<Duration> {
    let trimmed = raw.strip_suffix('s')?;
    let secs: f64 = trimmed.parse().ok()?;
    Some(Duration::from_secs_f64(secs.max(0.0)))
}

fn extract_model(detail: &ErrorDetail) -> Option<String> {
    detail.metadata.as_ref()?.get("model").cloned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmartRetryCandidate {
    pub model: Option<String>,
    pub retry_delay: Duration,
}

/// Parses a 429/503 body and returns `Some` only if it matches one of the
/// two model-capacity signals the decider recognizes:
/// `RESOURCE_EXHAUSTED` + a `RATE_LIMIT_EXCEEDED` detail, or `UNAVAILABLE` +
/// a `MODEL_CAPACITY_EXHAUSTED` detail.
pub fn parse_smart_retry_candidate(status: u16, body: &str) -> Option<SmartRetryCandidate> {
    if status != 429 && status != 503 {
        return None;
    }
    let envelope = parse_envelope(body)?;
    let top_status = envelope.error.status.as_deref()?;

    let matches = envelope.error.details.iter().any(|detail| match top_status {
        "RESOURCE_EXHAUSTED" => detail.reason.as_deref() == Some("RATE_LIMIT_EXCEEDED"),
        "UNAVAILABLE" => detail.reason.as_deref() == Some("MODEL_CAPACITY_EXHAUSTED"),
        _ => false,
    });
    if !matches {
        return None;
    }

    let model = envelope.error.details.iter().find_map(extract_model);
    let retry_delay = envelope
        .error
        .details
        .iter()
        .find_map(parse_retry_delay)
        .unwrap_or(DEFAULT_RETRY_DELAY);

    Some(SmartRetryCandidate { model, retry_delay })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmartRetryDecision {
    /// Not a model-capacity signal; defer to the generic rate-limit
    /// classifier.
    NotCandidate,
    /// Signal carries no model, so it applies to the base URL as a whole;
    /// the retry loop should continue its outer URL loop without marking
    /// any account.
    UrlLevel,
    /// `retryDelay` at or above the smart-retry threshold: mark the
    /// account (and model, if known) rate-limited immediately and signal
    /// the caller to switch accounts.
    LongDelay { model: Option<String>, retry_delay: Duration },
    /// `retryDelay` below the threshold: worth one short wait-and-retry
    /// before falling back to `LongDelay`-style marking.
    ShortDelay { model: Option<String>, retry_delay: Duration, wait: Duration },
}

/// Per spec §4.C2: branches on whether the body is a smart-retry
/// candidate, then on whether it names a model, then on `threshold`.
pub fn decide_smart_retry(status: u16, body: &str, threshold: Duration, min_wait: Duration) -> SmartRetryDecision {
    let Some(candidate) = parse_smart_retry_candidate(status, body) else {
        return SmartRetryDecision::NotCandidate;
    };

    if candidate.model.is_none() {
        return SmartRetryDecision::UrlLevel;
    }

    if candidate.retry_delay >= threshold {
        SmartRetryDecision::LongDelay {
            model: candidate.model,
            retry_delay: candidate.retry_delay,
        }
    } else {
        SmartRetryDecision::ShortDelay {
            model: candidate.model,
            retry_delay: candidate.retry_delay,
            wait: candidate.retry_delay.max(min_wait),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericRateLimitMark {
    pub model: Option<String>,
    pub reset_after: Duration,
}

/// Generic L4 fallback for a 429 the smart-retry decider didn't recognize:
/// marks the named model if the body resolves one, otherwise the whole
/// account, with `reset_after` taken from any `RetryInfo` detail or the
/// configured default window.
pub fn generic_rate_limit_mark(body: &str, default_window: Duration) -> GenericRateLimitMark {
    let Some(envelope) = parse_envelope(body) else {
        return GenericRateLimitMark {
            model: None,
            reset_after: default_window,
        };
    };
    let model = envelope.error.details.iter().find_map(extract_model);
    let reset_after = envelope
        .error
        .details
        .iter()
        .find_map(parse_retry_delay)
        .unwrap_or(default_window);
    GenericRateLimitMark { model, reset_after }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_with(status: &str, reason: &str, model: Option<&str>, retry_delay: Option<&str>) -> String {
        let metadata = model
            .map(|m| format!(r#","metadata":{{"model":"{m}"}}"#))
            .unwrap_or_default();
        let retry_info = retry_delay
            .map(|d| {
                format!(
                    r#",{{"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"{d}"}}"#
                )
            })
            .unwrap_or_default();
        format!(
            r#"{{"error":{{"status":"{status}","details":[{{"reason":"{reason}"{metadata}}}{retry_info}]}}}}"#
        )
    }

    #[test]
    fn classifies_failover_statuses() {
        for status in [401, 403, 429, 529, 500, 503] {
            assert_eq!(classify_status(status), FailoverClass::UpstreamFailover);
        }
        assert_eq!(classify_status(400), FailoverClass::ClientError);
        assert_eq!(classify_status(404), FailoverClass::ClientError);
    }

    #[test]
    fn resource_exhausted_with_rate_limit_detail_is_a_candidate() {
        let body = body_with("RESOURCE_EXHAUSTED", "RATE_LIMIT_EXCEEDED", Some("gemini-3-pro"), Some("12s"));
        let candidate = parse_smart_retry_candidate(429, &body).unwrap();
        assert_eq!(candidate.model.as_deref(), Some("gemini-3-pro"));
        assert_eq!(candidate.retry_delay, Duration::from_secs(12));
    }

    #[test]
    fn unavailable_with_capacity_detail_is_a_candidate() {
        let body = body_with("UNAVAILABLE", "MODEL_CAPACITY_EXHAUSTED", Some("gemini-3-flash"), None);
        let candidate = parse_smart_retry_candidate(503, &body).unwrap();
        assert_eq!(candidate.model.as_deref(), Some("gemini-3-flash"));
        assert_eq!(candidate.retry_delay, DEFAULT_RETRY_DELAY);
    }

    #[test]
    fn unrelated_reason_is_not_a_candidate() {
        let body = body_with("RESOURCE_EXHAUSTED", "QUOTA_EXCEEDED", Some("gemini-3-pro"), None);
        assert!(parse_smart_retry_candidate(429, &body).is_none());
    }

    #[test]
    fn missing_model_yields_url_level_decision() {
        let body = body_with("RESOURCE_EXHAUSTED", "RATE_LIMIT_EXCEEDED", None, Some("20s"));
        let decision = decide_smart_retry(429, &body, Duration::from_secs(7), Duration::from_secs(1));
        assert_eq!(decision, SmartRetryDecision::UrlLevel);
    }

    #[test]
    fn long_delay_at_threshold_marks_immediately() {
        let body = body_with("RESOURCE_EXHAUSTED", "RATE_LIMIT_EXCEEDED", Some("gemini-3-pro"), Some("30s"));
        let decision = decide_smart_retry(429, &body, Duration::from_secs(7), Duration::from_secs(1));
        assert_eq!(
            decision,
            SmartRetryDecision::LongDelay {
                model: Some("gemini-3-pro".into()),
                retry_delay: Duration::from_secs(30),
            }
        );
    }

    #[test]
    fn short_delay_below_threshold_waits_at_least_min_wait() {
        let body = body_with("RESOURCE_EXHAUSTED", "RATE_LIMIT_EXCEEDED", Some("gemini-3-pro"), Some("0s"));
        let decision = decide_smart_retry(429, &body, Duration::from_secs(7), Duration::from_secs(1));
        assert_eq!(
            decision,
            SmartRetryDecision::ShortDelay {
                model: Some("gemini-3-pro".into()),
                retry_delay: Duration::from_secs(0),
                wait: Duration::from_secs(1),
            }
        );
    }

    #[test]
    fn generic_mark_falls_back_to_default_window_on_unparseable_body() {
        let mark = generic_rate_limit_mark("not json", Duration::from_secs(30));
        assert_eq!(mark.model, None);
        assert_eq!(mark.reset_after, Duration::from_secs(30));
    }
}

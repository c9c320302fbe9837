//! URL Availability Tracker (spec §2 L2): the retry loop's outer dimension.
//! Tracks a last-success timestamp per configured base URL and yields them
//! healthy-first; a URL that just failed is cycled to the tail so the next
//! attempt prefers whichever other URL last worked.
//!
//! Grounded on `gproxy-provider-core::pool`'s ordering style, adapted from
//! per-account weighting to per-URL last-success recency since there is no
//! existing module for multi-base-URL failover to reuse directly.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::time::Instant;

pub struct UrlAvailabilityTracker {
    urls: Vec<String>,
    last_success: RwLock<HashMap<String, Instant>>,
    last_failure: RwLock<HashMap<String, Instant>>,
}

impl UrlAvailabilityTracker {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            last_success: RwLock::new(HashMap::new()),
            last_failure: RwLock::new(HashMap::new()),
        }
    }

    /// Returns configured base URLs ordered healthy-first: URLs with no
    /// recent failure first (most recent success first among those), then
    /// URLs that failed more recently sorted to the tail.
    pub fn ordered(&self) -> Vec<String> {
        let successes = self.last_success.read().unwrap();
        let failures = self.last_failure.read().unwrap();

        let mut urls = self.urls.clone();
        urls.sort_by(|a, b| {
            let a_failed = failures.get(a);
            let b_failed = failures.get(b);
            match (a_failed, b_failed) {
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
                (Some(fa), Some(fb)) => fa.cmp(fb),
                (None, None) => {
                    let sa = successes.get(a);
                    let sb = successes.get(b);
                    sb.cmp(&sa)
                }
            }
        });
        urls
    }

    pub fn record_success(&self, url: &str) {
        self.last_success
            .write()
            .unwrap()
            .insert(url.to_string(), Instant::now());
        self.last_failure.write().unwrap().remove(url);
    }

    pub fn record_failure(&self, url: &str) {
        self.last_failure
            .write()
            .unwrap()
            .insert(url.to_string(), Instant::now());
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn failed_url_sorts_behind_untouched_urls() {
        let tracker = UrlAvailabilityTracker::new(vec!["a".into(), "b".into()]);
        tracker.record_failure("a");
        let order = tracker.ordered();
        assert_eq!(order, vec!["b".to_string(), "a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn most_recent_success_is_preferred_among_healthy_urls() {
        let tracker = UrlAvailabilityTracker::new(vec!["a".into(), "b".into()]);
        tracker.record_success("a");
        tokio::time::advance(std::time::Duration::from_secs(1)).await;
        tracker.record_success("b");
        assert_eq!(tracker.ordered(), vec!["b".to_string(), "a".to_string()]);
    }

    #[tokio::test]
    async fn recovered_url_returns_to_healthy_front() {
        let tracker = UrlAvailabilityTracker::new(vec!["a".into(), "b".into()]);
        tracker.record_failure("a");
        tracker.record_success("a");
        assert_eq!(tracker.ordered()[0], "a");
    }
}

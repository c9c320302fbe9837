//! Upstream Error Event journal (spec §3 "Upstream Error Event", §2 D2): a
//! bounded, in-memory append-only record of what happened on each dispatch
//! attempt, truncated before it is handed to storage for persistence so a
//! pathological retry storm can't grow one request's journal unbounded.
//!
//! Grounded on `gproxy-core::proxy_engine`'s `emit_upstream_event` call
//! sites, which record one event per attempt; this module is the struct
//! those call sites would be constructing before handing it to storage.

use std::collections::VecDeque;

use time::OffsetDateTime;

#[derive(Debug, Clone)]
pub struct JournalEntry {
    #[allow(dead_code)]
    pub at: OffsetDateTime,
    pub kind: &'static str,
    pub base_url: Option<String>,
    pub account_id: Option<i64>,
    pub attempt_no: u32,
    pub status: Option<u16>,
    pub message: String,
}

/// Append-only per-request journal, capped at `capacity` entries (oldest
/// dropped first). Matches `GatewayConfig::upstream_error_journal_capacity`.
pub struct RequestJournal {
    capacity: usize,
    entries: VecDeque<JournalEntry>,
}

impl RequestJournal {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, entry: JournalEntry) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn entries(&self) -> impl Iterator<Item = &JournalEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: &'static str, attempt_no: u32) -> JournalEntry {
        JournalEntry {
            at: OffsetDateTime::now_utc(),
            kind,
            base_url: Some("https://upstream.example".into()),
            account_id: Some(1),
            attempt_no,
            status: Some(429),
            message: "rate limited".into(),
        }
    }

    #[test]
    fn drops_oldest_entry_once_capacity_is_reached() {
        let mut journal = RequestJournal::new(2);
        journal.push(entry("request_error", 1));
        journal.push(entry("retry", 2));
        journal.push(entry("retry", 3));

        assert_eq!(journal.len(), 2);
        let attempts: Vec<u32> = journal.entries().map(|e| e.attempt_no).collect();
        assert_eq!(attempts, vec![2, 3]);
    }
}

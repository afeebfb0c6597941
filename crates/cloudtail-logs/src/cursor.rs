use std::collections::HashSet;

use chrono::{DateTime, Utc};

use cloudtail_types::LogEntry;

/// Position of the tail within the entry stream
///
/// Queries are re-issued with an inclusive lower bound at the newest
/// timestamp seen, so entries sharing that timestamp come back on the next
/// poll. The tie set holds their IDs so they are not written twice.
#[derive(Clone, Debug, Default)]
pub(crate) struct Cursor {
    /// Newest emitted timestamp, or the starting bound (None = unbounded)
    last_seen: Option<DateTime<Utc>>,

    /// IDs emitted at exactly `last_seen`
    tie_ids: HashSet<String>,

    emitted: u64,
}

impl Cursor {
    pub(crate) fn new(start: Option<DateTime<Utc>>) -> Self {
        Self {
            last_seen: start,
            ..Self::default()
        }
    }

    pub(crate) fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    pub(crate) fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Entries an inclusive re-query will return again
    pub(crate) fn tie_count(&self) -> usize {
        self.tie_ids.len()
    }

    /// Whether `entry` has not been emitted and is not behind the cursor
    pub(crate) fn is_new(&self, entry: &LogEntry) -> bool {
        match self.last_seen {
            None => true,
            Some(last) if entry.timestamp > last => true,
            Some(last) if entry.timestamp == last => !self.tie_ids.contains(&entry.insert_id),
            Some(_) => false,
        }
    }

    /// Record `entry` as emitted
    pub(crate) fn advance(&mut self, entry: &LogEntry) {
        if self.last_seen.is_none_or(|last| entry.timestamp > last) {
            self.last_seen = Some(entry.timestamp);
            self.tie_ids.clear();
        }
        self.tie_ids.insert(entry.insert_id.clone());
        self.emitted += 1;
    }
}

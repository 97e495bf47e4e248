//! Bounded audit history of command executions.

use std::collections::VecDeque;

use tracing::info;

use crate::types::HistoryEntry;

/// Maximum number of retained history entries; the oldest is evicted first.
pub const HISTORY_CAPACITY: usize = 1000;

/// Maximum page size for history queries.
pub const MAX_HISTORY_PAGE: usize = 100;

/// Append-only command audit log with FIFO eviction.
///
/// Entries are immutable once appended; queries hand out clones so callers
/// can never mutate the log through a returned page.
#[derive(Debug, Default)]
pub struct HistoryLog {
    entries: VecDeque<HistoryEntry>,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, evicting the oldest once at capacity, and emit the
    /// audit record.
    pub fn append(&mut self, entry: HistoryEntry) {
        if self.entries.len() >= HISTORY_CAPACITY {
            self.entries.pop_front();
        }
        info!(
            id = %entry.id,
            command = %entry.command,
            args = ?entry.args,
            work_dir = %entry.work_dir,
            user = %entry.user,
            permission_level = %entry.permission_level,
            duration_ms = entry.duration_ms,
            exit_code = entry.exit_code,
            success = entry.success,
            "command executed"
        );
        self.entries.push_back(entry);
    }

    /// Filter by user, then paginate. `total` reflects the post-filter
    /// count, not the page size.
    pub fn query(&self, limit: usize, offset: usize, user: &str) -> (Vec<HistoryEntry>, usize) {
        let limit = if limit == 0 || limit > MAX_HISTORY_PAGE {
            MAX_HISTORY_PAGE
        } else {
            limit
        };

        let filtered: Vec<&HistoryEntry> = self
            .entries
            .iter()
            .filter(|e| user.is_empty() || e.user == user)
            .collect();
        let total = filtered.len();

        let start = offset.min(total);
        let end = (start + limit).min(total);
        let page = filtered[start..end].iter().map(|e| (*e).clone()).collect();
        (page, total)
    }

    /// Drop all entries, returning how many were removed.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        info!(cleared = count, "command history cleared");
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

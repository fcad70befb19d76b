//! Post reconciler: the ordered timeline of kind-1 posts, with
//! optimistic-echo matching and retry marking.

use serde::{Deserialize, Serialize};

use crate::event::{Event, Tag};

/// Seconds a locally submitted post may stay `loading` before the sweep
/// flags it for manual retry.
pub const PENDING_TIMEOUT_SECS: u64 = 3;

/// Materialized view of one post in the timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineEntry {
    /// Event id; known up front because hashing happens before transmission.
    pub id: String,
    /// Post text.
    pub message: String,
    /// Author public key.
    pub author: String,
    /// Unix timestamp of creation (also the submission time for local posts).
    pub created_at: u64,
    /// Tags carried by the underlying event.
    pub tags: Vec<Tag>,
    /// Awaiting the relay echo that confirms publication.
    pub loading: bool,
    /// The echo never came; the user may republish. Mutually exclusive with
    /// `loading`, and both are false once confirmed.
    pub retry: bool,
}

impl TimelineEntry {
    fn pending(ev: &Event) -> TimelineEntry {
        TimelineEntry {
            loading: true,
            retry: false,
            ..TimelineEntry::confirmed(ev)
        }
    }

    fn confirmed(ev: &Event) -> TimelineEntry {
        TimelineEntry {
            id: ev.id.clone(),
            message: ev.content.clone(),
            author: ev.pubkey.clone(),
            created_at: ev.created_at,
            tags: ev.tags.clone(),
            loading: false,
            retry: false,
        }
    }
}

/// Insertion-ordered timeline with newest-first semantics. At most one entry
/// per event id; no global re-sort ever happens after insertion.
#[derive(Debug, Default)]
pub struct Timeline {
    entries: Vec<TimelineEntry>,
}

impl Timeline {
    /// Empty timeline.
    pub fn new() -> Timeline {
        Timeline::default()
    }

    /// Rehydrate from persisted entries.
    pub fn from_entries(entries: Vec<TimelineEntry>) -> Timeline {
        Timeline { entries }
    }

    /// Entries, newest first.
    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    /// Index of the entry with this id, if present.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    /// Insert a locally submitted post at the head, awaiting its echo.
    pub fn insert_pending(&mut self, ev: &Event) {
        self.entries.insert(0, TimelineEntry::pending(ev));
    }

    /// Ingest a relay-delivered post. Returns true if the timeline changed.
    ///
    /// A `loading` or `retry` entry with the same id is the optimistic echo
    /// case: it is replaced in place, preserving its position, with both
    /// flags cleared. A confirmed entry with the same id is a duplicate and
    /// is ignored. Anything else is inserted at the position implied by
    /// `created_at` descending, which puts live arrivals at the head.
    pub fn ingest(&mut self, ev: &Event) -> bool {
        if let Some(i) = self.position(&ev.id) {
            if self.entries[i].loading || self.entries[i].retry {
                self.entries[i] = TimelineEntry::confirmed(ev);
                return true;
            }
            return false;
        }
        let at = self
            .entries
            .iter()
            .position(|e| e.created_at < ev.created_at)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, TimelineEntry::confirmed(ev));
        true
    }

    /// Flag entries stuck in `loading` past the timeout as retryable.
    /// Advisory only: a late echo still confirms them via [`ingest`].
    /// Returns true if any entry changed.
    ///
    /// [`ingest`]: Timeline::ingest
    pub fn sweep(&mut self, now: u64, timeout: u64) -> bool {
        let mut changed = false;
        for entry in &mut self.entries {
            if entry.loading && now.saturating_sub(entry.created_at) > timeout {
                entry.loading = false;
                entry.retry = true;
                changed = true;
            }
        }
        changed
    }

    /// Flip an entry back to `loading` ahead of a republish. Returns a copy
    /// of the entry so the caller can rebuild the event to resend.
    pub fn mark_republish(&mut self, id: &str) -> Option<TimelineEntry> {
        let i = self.position(id)?;
        self.entries[i].retry = false;
        self.entries[i].loading = true;
        Some(self.entries[i].clone())
    }

    /// Local-only removal; the event is not retracted from relays.
    pub fn remove(&mut self, id: &str) -> bool {
        match self.position(id) {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        }
    }
}

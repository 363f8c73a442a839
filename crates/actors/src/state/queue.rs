//! FIFO of pending persist requests with a single scheduled flush.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

/// A request to persist the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistRequest {
    pub requested_at: DateTime<Utc>,
}

/// Collapses bursts of persist requests into one durable write.
///
/// The first request after a flush asks the caller to schedule the next
/// flush; later requests only join the queue.
#[derive(Debug, Default)]
pub struct WriteBehindQueue {
    pending: VecDeque<PersistRequest>,
    flush_scheduled: bool,
}

impl WriteBehindQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request. Returns `true` if the caller must schedule a flush.
    pub fn enqueue(&mut self) -> bool {
        self.pending.push_back(PersistRequest {
            requested_at: Utc::now(),
        });
        if self.flush_scheduled {
            false
        } else {
            self.flush_scheduled = true;
            true
        }
    }

    /// Take every pending request and allow the next flush to be scheduled.
    pub fn drain(&mut self) -> Vec<PersistRequest> {
        self.flush_scheduled = false;
        self.pending.drain(..).collect()
    }

    /// Put requests back after a failed flush without scheduling a new one.
    pub fn restore(&mut self, requests: Vec<PersistRequest>) {
        for request in requests.into_iter().rev() {
            self.pending.push_front(request);
        }
    }

    /// Claim the next flush for requests that are already pending. Returns
    /// `true` if the caller must schedule it.
    pub fn claim_flush(&mut self) -> bool {
        if self.flush_scheduled || self.pending.is_empty() {
            false
        } else {
            self.flush_scheduled = true;
            true
        }
    }

    /// Record that state needs persisting without scheduling a flush.
    pub fn mark_dirty(&mut self) {
        self.pending.push_back(PersistRequest {
            requested_at: Utc::now(),
        });
    }

    /// Drop everything, including the scheduled flush marker.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.flush_scheduled = false;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Age of the oldest pending request.
    #[must_use]
    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        self.pending.front().map(|r| r.requested_at)
    }
}

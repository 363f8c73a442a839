//! In-memory [`DurableStore`] with fault injection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tracing::trace;

use super::{DurableStore, StoreError, VersionedRecord};

/// Process-local store backed by a concurrent map.
///
/// Failures queued with [`MemoryStore::push_read_failure`] and
/// [`MemoryStore::push_write_failure`] are returned by the next matching
/// calls before the map is touched, which lets tests script outages and
/// conflicts deterministically.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, VersionedRecord>,
    read_failures: Mutex<VecDeque<StoreError>>,
    write_failures: Mutex<VecDeque<StoreError>>,
    pending_conflicts: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next read with `error`.
    pub fn push_read_failure(&self, error: StoreError) {
        self.read_failures.lock().push_back(error);
    }

    /// Fail the next write with `error`.
    pub fn push_write_failure(&self, error: StoreError) {
        self.write_failures.lock().push_back(error);
    }

    /// Reject the next `count` writes with a conflict against the current
    /// stored version.
    pub fn inject_conflicts(&self, count: u64) {
        self.pending_conflicts.fetch_add(count, Ordering::SeqCst);
    }

    /// Store raw bytes under `key`, bypassing version checks.
    pub fn insert_raw(&self, key: impl Into<String>, payload: Vec<u8>, version: u64) {
        self.records
            .insert(key.into(), VersionedRecord { payload, version });
    }

    /// Current stored version for `key` (0 when absent).
    #[must_use]
    pub fn version(&self, key: &str) -> u64 {
        self.records.get(key).map_or(0, |r| r.version)
    }

    /// Whether a record exists for `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    /// Number of read calls, including failed ones.
    #[must_use]
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of successful writes.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn take_conflict(&self) -> bool {
        self.pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<VersionedRecord>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let scripted = self.read_failures.lock().pop_front();
        if let Some(error) = scripted {
            return Err(error);
        }
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn write(
        &self,
        key: &str,
        payload: Vec<u8>,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let scripted = self.write_failures.lock().pop_front();
        if let Some(error) = scripted {
            return Err(error);
        }
        if self.take_conflict() {
            return Err(StoreError::Conflict {
                expected: expected_version,
                actual: self.version(key),
            });
        }

        let version = match self.records.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.version != expected_version {
                    return Err(StoreError::Conflict {
                        expected: expected_version,
                        actual: record.version,
                    });
                }
                record.payload = payload;
                record.version = record.version.saturating_add(1);
                record.version
            }
            Entry::Vacant(vacant) => {
                if expected_version != 0 {
                    return Err(StoreError::Conflict {
                        expected: expected_version,
                        actual: 0,
                    });
                }
                vacant.insert(VersionedRecord {
                    payload,
                    version: 1,
                });
                1
            }
        };

        self.writes.fetch_add(1, Ordering::SeqCst);
        trace!(key, version, "Record written");
        Ok(version)
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.records.remove(key);
        trace!(key, "Record cleared");
        Ok(())
    }
}

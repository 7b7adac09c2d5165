//! src/store.rs
//!
//! The in-memory, TTL-indexed key-value store. Entries live in a sorted map
//! so enumeration is lexicographic; a background sweeper task splices out
//! entries whose TTL has elapsed.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// A single stored version of a key. Replacing a key replaces the whole
/// entry, including its creation time.
#[derive(Clone, Debug)]
struct Entry {
    value: Vec<u8>,
    created_at: Instant,
    ttl: Duration,
}

impl Entry {
    fn expires_at(&self) -> Instant {
        self.created_at + self.ttl
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at()
    }
}

/// A live entry as returned to readers.
#[derive(Clone, Debug)]
pub struct Found {
    pub value: Vec<u8>,
    pub created_at: Instant,
    pub ttl: Duration,
}

impl Found {
    /// Time left before this entry expires, as of now.
    pub fn remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.created_at.elapsed())
    }
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    /// Sum of key + value lengths across all entries, maintained
    /// incrementally for admission checks.
    bytes: u64,
}

impl Inner {
    fn entry_bytes(key: &str, value: &[u8]) -> u64 {
        (key.len() + value.len()) as u64
    }

    fn remove_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            if let Some(entry) = self.entries.remove(key) {
                self.bytes -= Self::entry_bytes(key, &entry.value);
            }
        }
        expired.len()
    }
}

/// Thread-safe mapping from key to (bytes, creation time, original TTL).
/// Readers proceed in parallel; mutations serialize on the write half of the
/// lock, which is never held across an await point.
pub struct Store {
    inner: RwLock<Inner>,
    max_bytes: u64,
}

impl Store {
    /// `max_bytes == 0` means unlimited.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_bytes,
        }
    }

    /// Inserts or atomically replaces the entry for `key`, resetting its
    /// creation time. Fails with `StoreFull` when the configured capacity
    /// would be exceeded, in which case nothing changes.
    pub fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidKey);
        }
        let now = Instant::now();
        let incoming = Inner::entry_bytes(key, &value);
        let mut inner = self.inner.write();

        if self.max_bytes > 0 {
            let over_capacity = |inner: &Inner| {
                let released = inner
                    .entries
                    .get(key)
                    .map(|existing| Inner::entry_bytes(key, &existing.value))
                    .unwrap_or(0);
                inner.bytes - released + incoming > self.max_bytes
            };
            if over_capacity(&inner) {
                // A store full of dead entries must not refuse fresh writes.
                inner.remove_expired(now);
                if over_capacity(&inner) {
                    return Err(Error::StoreFull);
                }
            }
        }

        let released = inner
            .entries
            .get(key)
            .map(|existing| Inner::entry_bytes(key, &existing.value))
            .unwrap_or(0);
        inner.bytes = inner.bytes - released + incoming;
        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                created_at: now,
                ttl,
            },
        );
        Ok(())
    }

    /// Returns the live entry for `key`, or `None`. An entry found past its
    /// expiry is removed eagerly and reported absent.
    pub fn get(&self, key: &str) -> Option<Found> {
        let now = Instant::now();
        {
            let inner = self.inner.read();
            match inner.entries.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => {
                    return Some(Found {
                        value: entry.value.clone(),
                        created_at: entry.created_at,
                        ttl: entry.ttl,
                    })
                }
                Some(_) => {}
            }
        }
        // The entry was expired: take the write lock and splice it out,
        // re-checking since it may have been replaced in between.
        let mut inner = self.inner.write();
        if let Some(entry) = inner.entries.get(key) {
            if !entry.is_expired(now) {
                return Some(Found {
                    value: entry.value.clone(),
                    created_at: entry.created_at,
                    ttl: entry.ttl,
                });
            }
            let released = Inner::entry_bytes(key, &entry.value);
            inner.entries.remove(key);
            inner.bytes -= released;
        }
        None
    }

    /// All live keys in lexicographic order.
    pub fn scan(&self) -> Vec<String> {
        let now = Instant::now();
        let inner = self.inner.read();
        inner
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Live entry count and accounted bytes, for admission and observability.
    pub fn size(&self) -> (usize, u64) {
        let now = Instant::now();
        let inner = self.inner.read();
        let live = inner
            .entries
            .values()
            .filter(|entry| !entry.is_expired(now))
            .count();
        (live, inner.bytes)
    }

    /// Removes every expired entry, returning how many were swept.
    pub fn remove_expired(&self) -> usize {
        self.inner.write().remove_expired(Instant::now())
    }

    /// Background sweeper: wakes at a fixed cadence and splices out expired
    /// entries, holding the write lock only for the splice itself.
    pub async fn run_sweeper(self: Arc<Self>, every: Duration, shutdown_token: CancellationToken) {
        let mut timer = time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    tracing::debug!("Store sweeper received shutdown signal.");
                    break;
                },
                _ = timer.tick() => {
                    let swept = self.remove_expired();
                    if swept > 0 {
                        tracing::debug!(count = swept, "Swept expired entries");
                    }
                }
            }
        }
    }
}

// --- Unit Tests ---

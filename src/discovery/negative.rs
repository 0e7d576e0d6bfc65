//! Short-lived record of usernames the directory confirmed absent.
//!
//! Only confirmed not-found results land here. Transport failures never do,
//! so a flaky directory cannot hide a user for a whole cooldown window.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::Instant;

use crate::types::normalize_username;

#[derive(Debug, Clone, Copy)]
struct Miss {
    at: Instant,
    checked_at: DateTime<Utc>,
}

pub struct NegativeCache {
    entries: DashMap<String, Miss>,
    ttl: Duration,
}

impl NegativeCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn mark_not_found(&self, username: &str) {
        let key = normalize_username(username);
        if key.is_empty() || self.ttl.is_zero() {
            return;
        }
        self.prune_expired();
        self.entries.insert(
            key,
            Miss {
                at: Instant::now(),
                checked_at: Utc::now(),
            },
        );
    }

    /// Wall-clock time of the last confirmed miss, while still inside the TTL.
    /// Expired entries are evicted on read.
    pub fn checked_at(&self, username: &str) -> Option<DateTime<Utc>> {
        let key = normalize_username(username);
        let ttl = self.ttl;
        self.entries.remove_if(&key, |_, miss| miss.at.elapsed() >= ttl);
        self.entries.get(&key).map(|miss| miss.checked_at)
    }

    /// Drop every entry past its TTL. Returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, miss| miss.at.elapsed() < ttl);
        let pruned = before.saturating_sub(self.entries.len());
        if pruned > 0 {
            log::debug!("NegativeCache: pruned {} expired entries", pruned);
        }
        pruned
    }

    pub fn is_suppressed(&self, username: &str) -> bool {
        self.checked_at(username).is_some()
    }

    /// Forget a username, e.g. after it was mapped through another path.
    pub fn forget(&self, username: &str) {
        self.entries.remove(&normalize_username(username));
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

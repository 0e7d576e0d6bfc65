//! In-memory identity mapping table with a multicast change feed.
//!
//! The table is the cache of record for the session. Readers (render paths)
//! and writers (discovery tasks) share it through a non-poisoning `RwLock`;
//! no lock is ever held across directory I/O. Every successful write is
//! published on a `broadcast` channel after it becomes visible to `get`.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{normalize_username, IdentityMapping};

/// Mapping store configuration stored in ~/.idbridge/config.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// Events buffered per subscriber before the oldest are dropped.
    #[serde(default = "default_change_feed_capacity")]
    pub change_feed_capacity: usize,
}

fn default_change_feed_capacity() -> usize {
    256
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            change_feed_capacity: default_change_feed_capacity(),
        }
    }
}

struct Entry {
    /// Position of first insertion; overwrites keep it.
    seq: u64,
    mapping: IdentityMapping,
}

#[derive(Default)]
struct Table {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

/// Authoritative identity mapping table.
pub struct MappingStore {
    table: RwLock<Table>,
    updates: broadcast::Sender<IdentityMapping>,
}

impl MappingStore {
    pub fn new(config: &StoreConfig) -> Self {
        let (updates, _) = broadcast::channel(config.change_feed_capacity.max(1));
        Self {
            table: RwLock::new(Table::default()),
            updates,
        }
    }

    /// Point lookup by directory username. Never blocks on I/O, no side effects.
    pub fn get(&self, directory_username: &str) -> Option<IdentityMapping> {
        let key = normalize_username(directory_username);
        self.table
            .read()
            .entries
            .get(&key)
            .map(|e| e.mapping.clone())
    }

    /// Insert or fully replace by username, then publish on the change feed.
    pub fn upsert(&self, mapping: IdentityMapping) {
        let key = normalize_username(&mapping.directory_username);
        if key.is_empty() {
            log::warn!(
                "Mapping store: refusing mapping with empty username for {}",
                mapping.protocol_id
            );
            return;
        }

        // Publishing under the write guard keeps feed order equal to write order.
        let mut table = self.table.write();
        let seq = match table.entries.get(&key) {
            Some(existing) => existing.seq,
            None => {
                let seq = table.next_seq;
                table.next_seq += 1;
                seq
            }
        };
        table.entries.insert(
            key.clone(),
            Entry {
                seq,
                mapping: mapping.clone(),
            },
        );
        log::debug!(
            "Mapping store: upserted {} -> '{}'",
            key,
            mapping.display_name
        );
        self.publish(mapping);
    }

    /// Insert only when no mapping exists for the username.
    ///
    /// Check and write happen under one lock, so a directory upsert racing
    /// with this call is never overwritten. Returns whether it inserted.
    pub fn insert_if_absent(&self, mapping: IdentityMapping) -> bool {
        let key = normalize_username(&mapping.directory_username);
        if key.is_empty() {
            return false;
        }

        let mut table = self.table.write();
        if table.entries.contains_key(&key) {
            return false;
        }
        let seq = table.next_seq;
        table.next_seq += 1;
        table.entries.insert(
            key,
            Entry {
                seq,
                mapping: mapping.clone(),
            },
        );
        self.publish(mapping);
        true
    }

    /// Case-insensitive substring search over username, first name, last
    /// name, and email. Insertion order, truncated to `limit`.
    pub fn search(&self, query: &str, limit: usize) -> Vec<IdentityMapping> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() || limit == 0 {
            return Vec::new();
        }

        let table = self.table.read();
        let mut hits: Vec<&Entry> = table
            .entries
            .values()
            .filter(|e| matches_query(&e.mapping, &needle))
            .collect();
        hits.sort_by_key(|e| e.seq);

        let results: Vec<IdentityMapping> = hits
            .into_iter()
            .take(limit)
            .map(|e| e.mapping.clone())
            .collect();

        log::debug!(
            "Mapping store: search '{}' returned {} results",
            query,
            results.len()
        );
        results
    }

    pub fn remove(&self, directory_username: &str) -> Option<IdentityMapping> {
        let key = normalize_username(directory_username);
        let removed = self.table.write().entries.remove(&key).map(|e| e.mapping);
        if removed.is_some() {
            log::debug!("Mapping store: removed {}", key);
        }
        removed
    }

    /// Drop every mapping. Used on sign-out.
    pub fn clear_all(&self) {
        let cleared = {
            let mut table = self.table.write();
            let n = table.entries.len();
            table.entries.clear();
            n
        };
        log::info!("Mapping store: cleared {} mappings", cleared);
    }

    pub fn count(&self) -> usize {
        self.table.read().entries.len()
    }

    /// Subscribe to upserts. Each subscriber sees every later event; a
    /// subscriber that falls behind by more than the feed capacity gets
    /// `RecvError::Lagged` instead of stalling writers.
    pub fn user_mapping_updates(&self) -> broadcast::Receiver<IdentityMapping> {
        self.updates.subscribe()
    }

    fn publish(&self, mapping: IdentityMapping) {
        // Err only means nobody is subscribed.
        let _ = self.updates.send(mapping);
    }
}

impl Default for MappingStore {
    fn default() -> Self {
        Self::new(&StoreConfig::default())
    }
}

fn matches_query(mapping: &IdentityMapping, needle: &str) -> bool {
    [
        &mapping.directory_username,
        &mapping.first_name,
        &mapping.last_name,
        &mapping.email,
    ]
    .iter()
    .any(|field| field.to_lowercase().contains(needle))
}

//! People search for the user picker.
//!
//! Local mappings answer first. Only when the store has nothing does the
//! directory get asked, and whatever it returns is written back to the
//! store so the next render resolves without a lookup.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::directory::DirectoryLookup;
use crate::store::MappingStore;
use crate::types::IdentityMapping;

/// Shortest query worth searching for.
pub const MIN_QUERY_LEN: usize = 2;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    pub results: Vec<IdentityMapping>,
    /// More matches may exist beyond `results`.
    pub limited: bool,
}

pub struct UserSearch {
    store: Arc<MappingStore>,
    directory: Arc<dyn DirectoryLookup>,
    limit: usize,
}

impl UserSearch {
    pub fn new(store: Arc<MappingStore>, directory: Arc<dyn DirectoryLookup>, limit: usize) -> Self {
        Self {
            store,
            directory,
            limit: limit.max(1),
        }
    }

    pub async fn search(&self, query: &str) -> SearchResults {
        let Some(term) = search_term(query) else {
            return SearchResults::default();
        };

        let local = self.store.search(term, self.limit);
        if !local.is_empty() {
            log::debug!(
                "User search: '{}' answered locally with {} results",
                term,
                local.len()
            );
            return self.finish(local);
        }

        match self.directory.search(term, self.limit).await {
            Ok(remote) => {
                log::debug!(
                    "User search: '{}' fell back to directory, {} results",
                    term,
                    remote.len()
                );
                for mapping in &remote {
                    self.store.upsert(mapping.clone());
                }
                self.finish(remote)
            }
            Err(e) => {
                log::warn!("User search: directory search '{}' failed: {}", term, e);
                SearchResults::default()
            }
        }
    }

    fn finish(&self, mappings: Vec<IdentityMapping>) -> SearchResults {
        let mut seen = HashSet::new();
        let mut results: Vec<IdentityMapping> = mappings
            .into_iter()
            .filter(|m| seen.insert(m.protocol_id.clone()))
            .collect();
        results.truncate(self.limit);
        SearchResults {
            limited: results.len() >= self.limit,
            results,
        }
    }
}

/// "@jdoe:signout.io" -> "jdoe". `None` when too short to search.
pub fn search_term(query: &str) -> Option<&str> {
    let trimmed = query.trim();
    let without_sigil = trimmed.strip_prefix('@').unwrap_or(trimmed);
    let term = without_sigil.split(':').next().unwrap_or_default().trim();
    (term.chars().count() >= MIN_QUERY_LEN).then_some(term)
}

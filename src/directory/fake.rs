//! In-memory `DirectoryLookup` for coordinator, facade, and search tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{DirectoryLookup, LookupOutcome};
use crate::error::DirectoryError;
use crate::types::{normalize_username, IdentityMapping, MappingSource};

#[derive(Default)]
pub(crate) struct FakeDirectory {
    users: Mutex<HashMap<String, IdentityMapping>>,
    unavailable: AtomicBool,
    delay: Mutex<Duration>,
    pub lookups: AtomicUsize,
    pub searches: AtomicUsize,
    active: AtomicUsize,
    pub peak_active: AtomicUsize,
}

impl FakeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, username: &str, first: &str, last: &str) -> Self {
        self.add_user(username, first, last);
        self
    }

    pub fn add_user(&self, username: &str, first: &str, last: &str) {
        let mapping = IdentityMapping::new(
            format!("@{}:signout.io", username),
            username,
            MappingSource::Directory,
        )
        .with_names(first, last);
        self.users.lock().insert(normalize_username(username), mapping);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn search_count(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl DirectoryLookup for FakeDirectory {
    async fn lookup_username(&self, username: &str) -> LookupOutcome {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);

        self.simulate_latency().await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.unavailable.load(Ordering::SeqCst) {
            return LookupOutcome::Unavailable(DirectoryError::Network("fake outage".into()));
        }
        match self.users.lock().get(&normalize_username(username)) {
            Some(m) => LookupOutcome::Found(m.clone()),
            None => LookupOutcome::NotFound,
        }
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<IdentityMapping>, DirectoryError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DirectoryError::Status {
                status: 503,
                body: String::new(),
            });
        }
        let needle = query.to_lowercase();
        let mut hits: Vec<IdentityMapping> = self
            .users
            .lock()
            .values()
            .filter(|m| {
                m.directory_username.to_lowercase().contains(&needle)
                    || m.display_name.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| a.directory_username.cmp(&b.directory_username));
        hits.truncate(limit);
        Ok(hits)
    }
}

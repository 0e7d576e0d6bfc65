//! Identity discovery: deciding when to ask the directory and turning its
//! answers into store writes.
//!
//! Three entry points fill the store:
//! - the current user's own record, populated at session start and then
//!   refreshed on a fixed two-tier schedule (`session.rs`)
//! - on-demand discovery of an unknown participant, fed by render paths
//!   through the bounded `DiscoveryQueue`
//! - a network-free heuristic that parses a protocol display name seeded
//!   from the directory's given/family name at registration
//!
//! Every directory failure degrades to "mapping still absent". Nothing here
//! returns an error to a render path.

pub mod negative;
pub mod queue;
pub mod session;

mod inflight;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::directory::{DirectoryLookup, LookupOutcome};
use crate::error::DirectoryError;
use crate::store::MappingStore;
use crate::types::{
    normalize_username, protocol_username, split_display_name, IdentityMapping, MappingSource,
};

use inflight::{Flight, InFlight};
use negative::NegativeCache;
use queue::{DiscoveryQueue, DiscoveryRequest};
use session::SessionHandle;

/// Seed queries used to warm an empty cache at session start.
const WARM_SEED_QUERIES: [&str; 7] = ["r", "n", "a", "e", "i", "o", "u"];

/// Results requested per seed query.
const WARM_SEARCH_LIMIT: usize = 50;

/// Current-user refresh schedule stored in ~/.idbridge/config.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshConfig {
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    #[serde(default = "default_error_retry_secs")]
    pub error_retry_secs: u64,
    /// Upper bound of the per-client offset added to the initial delay.
    #[serde(default = "default_jitter_secs")]
    pub jitter_secs: u64,
}

fn default_initial_delay_secs() -> u64 {
    30
}

fn default_period_secs() -> u64 {
    300
}

fn default_error_retry_secs() -> u64 {
    60
}

fn default_jitter_secs() -> u64 {
    15
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay_secs(),
            period_secs: default_period_secs(),
            error_retry_secs: default_error_retry_secs(),
            jitter_secs: default_jitter_secs(),
        }
    }
}

/// On-demand discovery settings stored in ~/.idbridge/config.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_concurrent_lookups")]
    pub max_concurrent_lookups: usize,
    /// How long a confirmed not-found suppresses further lookups.
    #[serde(default = "default_negative_ttl_secs")]
    pub negative_ttl_secs: u64,
    /// Age after which a directory record is looked up again. 0 disables.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl DiscoveryConfig {
    pub fn stale_after(&self) -> Option<chrono::Duration> {
        match self.stale_after_secs {
            0 => None,
            secs => i64::try_from(secs).ok().map(chrono::Duration::seconds),
        }
    }
}

fn default_queue_capacity() -> usize {
    64
}

fn default_max_concurrent_lookups() -> usize {
    4
}

fn default_negative_ttl_secs() -> u64 {
    120
}

fn default_stale_after_secs() -> u64 {
    86_400
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_concurrent_lookups: default_max_concurrent_lookups(),
            negative_ttl_secs: default_negative_ttl_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

/// The authenticated user a session belongs to.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub protocol_id: String,
    /// The user's own protocol display name, used when the directory has
    /// no record for them.
    pub display_name: Option<String>,
}

impl SessionIdentity {
    pub fn new(protocol_id: impl Into<String>, display_name: Option<&str>) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            display_name: display_name.map(str::to_string),
        }
    }

    pub fn username(&self) -> Option<&str> {
        protocol_username(&self.protocol_id)
    }
}

/// What one `discover_user_mapping` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// No username could be derived from the protocol id.
    Invalid,
    /// A directory-sourced mapping already exists.
    AlreadyMapped,
    /// Confirmed absent recently; no call made.
    Suppressed,
    /// Another caller's lookup for the same username finished first.
    Joined,
    Discovered,
    /// Directory had no record; the display-name heuristic filled the gap.
    Heuristic,
    NotFound,
    Unavailable,
}

pub struct DiscoveryCoordinator {
    directory: Arc<dyn DirectoryLookup>,
    store: Arc<MappingStore>,
    negative: Arc<NegativeCache>,
    in_flight: InFlight,
    queue: DiscoveryQueue,
    requests: Mutex<Option<mpsc::Receiver<DiscoveryRequest>>>,
    session: SessionIdentity,
    config: DiscoveryConfig,
    refresh: RefreshConfig,
}

impl DiscoveryCoordinator {
    pub fn new(
        directory: Arc<dyn DirectoryLookup>,
        store: Arc<MappingStore>,
        session: SessionIdentity,
        config: DiscoveryConfig,
        refresh: RefreshConfig,
    ) -> Self {
        let (queue, requests) = DiscoveryQueue::channel(config.queue_capacity);
        let negative = Arc::new(NegativeCache::new(Duration::from_secs(
            config.negative_ttl_secs,
        )));
        Self {
            directory,
            store,
            negative,
            in_flight: InFlight::new(),
            queue,
            requests: Mutex::new(Some(requests)),
            session,
            config,
            refresh,
        }
    }

    /// Spawn the refresh loop and the discovery worker for this session.
    ///
    /// A coordinator runs one session. Calling `start` again returns an
    /// already-cancelled handle.
    pub fn start(self: &Arc<Self>) -> SessionHandle {
        let requests = self.requests.lock().take();
        match requests {
            Some(requests) => {
                log::info!("Discovery: starting session for {}", self.session.protocol_id);
                SessionHandle::spawn(self.clone(), requests)
            }
            None => {
                log::warn!(
                    "Discovery: session for {} already started",
                    self.session.protocol_id
                );
                SessionHandle::cancelled()
            }
        }
    }

    pub fn queue(&self) -> DiscoveryQueue {
        self.queue.clone()
    }

    pub fn negative_cache(&self) -> Arc<NegativeCache> {
        self.negative.clone()
    }

    pub fn store(&self) -> &Arc<MappingStore> {
        &self.store
    }

    pub fn session(&self) -> &SessionIdentity {
        &self.session
    }

    pub fn refresh_config(&self) -> &RefreshConfig {
        &self.refresh
    }

    pub fn discovery_config(&self) -> &DiscoveryConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Current user
    // -----------------------------------------------------------------------

    /// Fetch and store the session user's own record. Never fails.
    pub async fn populate_current_user_mapping(&self) {
        if let Err(e) = self.refresh_current_user().await {
            log::warn!(
                "Discovery: could not populate current user {}: {}",
                self.session.protocol_id,
                e
            );
        }
    }

    /// Fallible form of `populate_current_user_mapping`, used by the refresh
    /// loop to pick its retry tier. A confirmed not-found is not an error.
    pub async fn refresh_current_user(&self) -> Result<(), DirectoryError> {
        let username = self.session.username().ok_or_else(|| {
            DirectoryError::InvalidConfig(format!(
                "session id '{}' has no username",
                self.session.protocol_id
            ))
        })?;

        match self.directory.lookup_username(username).await {
            LookupOutcome::Found(mapping) => {
                log::debug!("Discovery: refreshed current user {}", username);
                self.record(mapping);
                Ok(())
            }
            LookupOutcome::NotFound => {
                log::info!(
                    "Discovery: directory has no record for current user {}",
                    username
                );
                self.extract_mapping_from_matrix_data(
                    &self.session.protocol_id,
                    self.session.display_name.as_deref(),
                    username,
                );
                Ok(())
            }
            LookupOutcome::Unavailable(e) => Err(e),
        }
    }

    /// Seed an empty cache from broad directory searches. Skipped when the
    /// store already holds anything. Returns the store size afterwards.
    pub async fn warm_directory_cache(&self) -> usize {
        let existing = self.store.count();
        if existing > 0 {
            log::debug!(
                "Discovery: {} cached mappings, skipping cache warming",
                existing
            );
            return 0;
        }

        for seed in WARM_SEED_QUERIES {
            match self.directory.search(seed, WARM_SEARCH_LIMIT).await {
                Ok(results) => {
                    log::debug!("Discovery: seed '{}' returned {} users", seed, results.len());
                    for mapping in results {
                        self.record(mapping);
                    }
                }
                Err(e) => log::warn!("Discovery: seed search '{}' failed: {}", seed, e),
            }
        }
        self.store.count()
    }

    // -----------------------------------------------------------------------
    // Participants
    // -----------------------------------------------------------------------

    /// Whether a lookup for this id would do anything right now.
    pub fn needs_discovery(&self, protocol_id: &str) -> bool {
        let Some(username) = protocol_username(protocol_id) else {
            return false;
        };
        let key = normalize_username(username);
        let mapped = self
            .store
            .get(&key)
            .is_some_and(|m| self.is_current(&m));
        !mapped && !self.in_flight.contains(&key) && !self.negative.is_suppressed(&key)
    }

    /// A directory record younger than `stale_after_secs`.
    fn is_current(&self, mapping: &IdentityMapping) -> bool {
        mapping.from_directory()
            && self
                .config
                .stale_after()
                .map_or(true, |max_age| mapping.is_fresh(max_age))
    }

    /// Look an unknown participant up in the directory and store the result.
    ///
    /// Concurrent calls for the same username share one lookup. A
    /// heuristic-sourced or stale mapping does not stop the lookup; a fresh
    /// directory record replaces it.
    pub async fn discover_user_mapping(
        &self,
        protocol_id: &str,
        display_name_hint: Option<&str>,
    ) -> DiscoveryOutcome {
        let Some(username) = protocol_username(protocol_id) else {
            log::debug!("Discovery: no username in '{}'", protocol_id);
            return DiscoveryOutcome::Invalid;
        };
        let key = normalize_username(username);

        if self.store.get(&key).is_some_and(|m| self.is_current(&m)) {
            return DiscoveryOutcome::AlreadyMapped;
        }
        if self.negative.is_suppressed(&key) {
            log::debug!("Discovery: {} recently not found, skipping", key);
            return DiscoveryOutcome::Suppressed;
        }

        let _guard = match self.claim(&key) {
            Some(Flight::Leader(guard)) => guard,
            Some(Flight::Follower(done)) => {
                log::debug!("Discovery: joining in-flight lookup for {}", key);
                inflight::join(done).await;
                return DiscoveryOutcome::Joined;
            }
            None => return DiscoveryOutcome::AlreadyMapped,
        };

        match self.directory.lookup_username(username).await {
            LookupOutcome::Found(mapping) => {
                log::debug!(
                    "Discovery: discovered {} -> '{}'",
                    key,
                    mapping.display_name
                );
                self.record(mapping);
                DiscoveryOutcome::Discovered
            }
            LookupOutcome::NotFound => {
                self.negative.mark_not_found(&key);
                if self.extract_mapping_from_matrix_data(protocol_id, display_name_hint, username)
                {
                    DiscoveryOutcome::Heuristic
                } else {
                    DiscoveryOutcome::NotFound
                }
            }
            LookupOutcome::Unavailable(e) => {
                log::warn!("Discovery: lookup for {} failed: {}", protocol_id, e);
                DiscoveryOutcome::Unavailable
            }
        }
    }

    /// Join or lead the lookup for `key`. A new leader re-reads the store,
    /// since another leader may have finished after the caller's first
    /// check; `None` means that write already landed.
    fn claim(&self, key: &str) -> Option<Flight<'_>> {
        let flight = self.in_flight.begin(key);
        if matches!(flight, Flight::Leader(_))
            && self.store.get(key).is_some_and(|m| self.is_current(&m))
        {
            log::debug!("Discovery: {} mapped while waiting to lead", key);
            return None;
        }
        Some(flight)
    }

    /// Build a mapping from a protocol display name without a network call.
    ///
    /// "Jane Doe" becomes given name "Jane", family name "Doe". Blank hints,
    /// and hints that are just the username or protocol id, are ignored.
    /// Inserts only when nothing is mapped yet; returns whether it did.
    pub fn extract_mapping_from_matrix_data(
        &self,
        protocol_id: &str,
        display_name_hint: Option<&str>,
        username: &str,
    ) -> bool {
        let Some(hint) = display_name_hint.map(str::trim).filter(|h| !h.is_empty()) else {
            return false;
        };
        let username = username.trim();
        if username.is_empty()
            || hint.eq_ignore_ascii_case(username)
            || hint.eq_ignore_ascii_case(protocol_id.trim())
            || hint.starts_with('@')
        {
            return false;
        }

        let (first, last) = split_display_name(hint);
        let mapping = IdentityMapping::new(protocol_id.trim(), username, MappingSource::DisplayName)
            .with_names(&first, &last);
        let inserted = self.store.insert_if_absent(mapping);
        if inserted {
            log::debug!("Discovery: extracted {} from display name '{}'", username, hint);
        }
        inserted
    }

    fn record(&self, mapping: IdentityMapping) {
        self.negative.forget(&mapping.directory_username);
        self.store.upsert(mapping);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::fake::FakeDirectory;
    use queue::DiscoveryContext;
    use session::SessionPhase;
    use std::sync::atomic::Ordering;
    use tokio::task::JoinSet;

    fn coordinator_with(
        directory: Arc<FakeDirectory>,
        session: SessionIdentity,
        config: DiscoveryConfig,
    ) -> Arc<DiscoveryCoordinator> {
        Arc::new(DiscoveryCoordinator::new(
            directory,
            Arc::new(MappingStore::default()),
            session,
            config,
            RefreshConfig {
                jitter_secs: 0,
                ..Default::default()
            },
        ))
    }

    /// A non-empty store makes session start skip cache warming.
    fn skip_warming(coord: &DiscoveryCoordinator) {
        coord.store().upsert(IdentityMapping::new(
            "@seed:signout.io",
            "seed",
            MappingSource::Directory,
        ));
    }

    fn coordinator(directory: Arc<FakeDirectory>) -> Arc<DiscoveryCoordinator> {
        coordinator_with(
            directory,
            SessionIdentity::new("@me:signout.io", Some("Mia Eng")),
            DiscoveryConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_discover_fills_store() {
        let directory = Arc::new(FakeDirectory::new().with_user("jdoe", "Jane", "Doe"));
        let coord = coordinator(directory.clone());

        let outcome = coord.discover_user_mapping("@jdoe:signout.io", None).await;
        assert_eq!(outcome, DiscoveryOutcome::Discovered);
        assert_eq!(coord.store().get("jdoe").unwrap().display_name, "Jane Doe");

        // Already mapped: no second call.
        let outcome = coord.discover_user_mapping("@jdoe:signout.io", None).await;
        assert_eq!(outcome, DiscoveryOutcome::AlreadyMapped);
        assert_eq!(directory.lookup_count(), 1);
    }

    #[test]
    fn test_new_leader_rechecks_store() {
        let coord = coordinator(Arc::new(FakeDirectory::new()));
        let flight = coord.claim("jdoe");
        assert!(matches!(flight, Some(Flight::Leader(_))));
        drop(flight);

        // Another leader stored the record after this caller's first check.
        coord.store().upsert(
            IdentityMapping::new("@jdoe:signout.io", "jdoe", MappingSource::Directory)
                .with_names("Jane", "Doe"),
        );
        assert!(coord.claim("jdoe").is_none());
        assert!(!coord.in_flight.contains("jdoe"));
    }

    #[tokio::test]
    async fn test_stale_directory_record_is_looked_up_again() {
        let directory = Arc::new(FakeDirectory::new().with_user("jdoe", "Jane", "Doe-Smith"));
        let coord = coordinator(directory.clone());
        let mut stale = IdentityMapping::new("@jdoe:signout.io", "jdoe", MappingSource::Directory)
            .with_names("Jane", "Doe");
        stale.last_refreshed_at = chrono::Utc::now() - chrono::Duration::days(2);
        coord.store().upsert(stale);

        assert!(coord.needs_discovery("@jdoe:signout.io"));
        assert_eq!(
            coord.discover_user_mapping("@jdoe:signout.io", None).await,
            DiscoveryOutcome::Discovered
        );
        assert_eq!(coord.store().get("jdoe").unwrap().last_name, "Doe-Smith");
        assert!(!coord.needs_discovery("@jdoe:signout.io"));
        assert_eq!(directory.lookup_count(), 1);
    }

    #[tokio::test]
    async fn test_zero_stale_after_keeps_records_forever() {
        let directory = Arc::new(FakeDirectory::new().with_user("jdoe", "Jane", "Doe"));
        let coord = coordinator_with(
            directory.clone(),
            SessionIdentity::new("@me:signout.io", None),
            DiscoveryConfig {
                stale_after_secs: 0,
                ..Default::default()
            },
        );
        let mut old = IdentityMapping::new("@jdoe:signout.io", "jdoe", MappingSource::Directory);
        old.last_refreshed_at = chrono::Utc::now() - chrono::Duration::days(365);
        coord.store().upsert(old);

        assert_eq!(
            coord.discover_user_mapping("@jdoe:signout.io", None).await,
            DiscoveryOutcome::AlreadyMapped
        );
        assert_eq!(directory.lookup_count(), 0);
    }

    #[tokio::test]
    async fn test_discover_invalid_id() {
        let coord = coordinator(Arc::new(FakeDirectory::new()));
        assert_eq!(
            coord.discover_user_mapping("@:signout.io", None).await,
            DiscoveryOutcome::Invalid
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_discovery_is_single_flight() {
        let directory = Arc::new(FakeDirectory::new().with_user("jdoe", "Jane", "Doe"));
        directory.set_delay(Duration::from_millis(200));
        let coord = coordinator(directory.clone());

        let mut tasks = JoinSet::new();
        for _ in 0..5 {
            let coord = coord.clone();
            tasks.spawn(async move { coord.discover_user_mapping("@jdoe:signout.io", None).await });
        }
        let mut outcomes = Vec::new();
        while let Some(res) = tasks.join_next().await {
            outcomes.push(res.unwrap());
        }

        assert_eq!(directory.lookup_count(), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| **o == DiscoveryOutcome::Discovered)
                .count(),
            1
        );
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, DiscoveryOutcome::Discovered | DiscoveryOutcome::Joined)));
        assert!(coord.store().get("jdoe").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_negatively_cached_until_ttl() {
        let directory = Arc::new(FakeDirectory::new());
        let coord = coordinator(directory.clone());

        assert_eq!(
            coord.discover_user_mapping("@ghost:signout.io", None).await,
            DiscoveryOutcome::NotFound
        );
        assert_eq!(
            coord.discover_user_mapping("@ghost:signout.io", None).await,
            DiscoveryOutcome::Suppressed
        );
        assert!(!coord.needs_discovery("@ghost:signout.io"));
        assert_eq!(directory.lookup_count(), 1);

        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(coord.needs_discovery("@ghost:signout.io"));
        coord.discover_user_mapping("@ghost:signout.io", None).await;
        assert_eq!(directory.lookup_count(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_is_not_negatively_cached() {
        let directory = Arc::new(FakeDirectory::new().with_user("jdoe", "Jane", "Doe"));
        directory.set_unavailable(true);
        let coord = coordinator(directory.clone());

        assert_eq!(
            coord.discover_user_mapping("@jdoe:signout.io", None).await,
            DiscoveryOutcome::Unavailable
        );
        assert!(coord.store().get("jdoe").is_none());
        assert!(coord.needs_discovery("@jdoe:signout.io"));

        directory.set_unavailable(false);
        assert_eq!(
            coord.discover_user_mapping("@jdoe:signout.io", None).await,
            DiscoveryOutcome::Discovered
        );
        assert_eq!(directory.lookup_count(), 2);
    }

    #[tokio::test]
    async fn test_not_found_falls_back_to_display_name() {
        let coord = coordinator(Arc::new(FakeDirectory::new()));
        let outcome = coord
            .discover_user_mapping("@racexcars:signout.io", Some("Race X Cars"))
            .await;
        assert_eq!(outcome, DiscoveryOutcome::Heuristic);

        let m = coord.store().get("racexcars").unwrap();
        assert_eq!(m.first_name, "Race");
        assert_eq!(m.last_name, "X Cars");
        assert_eq!(m.source, MappingSource::DisplayName);
    }

    #[tokio::test]
    async fn test_directory_record_replaces_heuristic_mapping() {
        let directory = Arc::new(FakeDirectory::new());
        let coord = coordinator(directory.clone());

        assert!(coord.extract_mapping_from_matrix_data(
            "@nbaig:signout.io",
            Some("Nadia B"),
            "nbaig"
        ));
        assert!(coord.needs_discovery("@nbaig:signout.io"));

        directory.add_user("nbaig", "Nadia", "Baig");
        assert_eq!(
            coord.discover_user_mapping("@nbaig:signout.io", None).await,
            DiscoveryOutcome::Discovered
        );
        let m = coord.store().get("nbaig").unwrap();
        assert_eq!(m.display_name, "Nadia Baig");
        assert_eq!(m.source, MappingSource::Directory);
    }

    #[tokio::test]
    async fn test_heuristic_never_overwrites_directory_record() {
        let directory = Arc::new(FakeDirectory::new().with_user("jdoe", "Jane", "Doe"));
        let coord = coordinator(directory);
        coord.discover_user_mapping("@jdoe:signout.io", None).await;

        assert!(!coord.extract_mapping_from_matrix_data("@jdoe:signout.io", Some("JD"), "jdoe"));
        assert_eq!(coord.store().get("jdoe").unwrap().display_name, "Jane Doe");
    }

    #[test]
    fn test_extract_ignores_uninformative_hints() {
        let coord = coordinator(Arc::new(FakeDirectory::new()));
        let id = "@jdoe:signout.io";
        assert!(!coord.extract_mapping_from_matrix_data(id, None, "jdoe"));
        assert!(!coord.extract_mapping_from_matrix_data(id, Some("   "), "jdoe"));
        assert!(!coord.extract_mapping_from_matrix_data(id, Some("JDoe"), "jdoe"));
        assert!(!coord.extract_mapping_from_matrix_data(id, Some(id), "jdoe"));
        assert!(!coord.extract_mapping_from_matrix_data(id, Some("Jane"), ""));
        assert_eq!(coord.store().count(), 0);

        assert!(coord.extract_mapping_from_matrix_data(id, Some("Madonna"), "jdoe"));
        let m = coord.store().get("jdoe").unwrap();
        assert_eq!(m.first_name, "Madonna");
        assert_eq!(m.last_name, "");
        assert_eq!(m.display_name, "Madonna");
    }

    #[tokio::test]
    async fn test_populate_current_user() {
        let directory = Arc::new(FakeDirectory::new().with_user("me", "Mia", "Engel"));
        let coord = coordinator(directory);
        coord.populate_current_user_mapping().await;
        assert_eq!(coord.store().get("me").unwrap().last_name, "Engel");

        // Idempotent.
        coord.populate_current_user_mapping().await;
        assert_eq!(coord.store().count(), 1);
    }

    #[tokio::test]
    async fn test_populate_swallows_outage() {
        let directory = Arc::new(FakeDirectory::new().with_user("me", "Mia", "Engel"));
        directory.set_unavailable(true);
        let coord = coordinator(directory);

        coord.populate_current_user_mapping().await;
        assert_eq!(coord.store().count(), 0);
        assert!(coord.refresh_current_user().await.is_err());
    }

    #[tokio::test]
    async fn test_populate_not_found_uses_own_display_name() {
        let coord = coordinator(Arc::new(FakeDirectory::new()));
        assert!(coord.refresh_current_user().await.is_ok());
        let m = coord.store().get("me").unwrap();
        assert_eq!(m.display_name, "Mia Eng");
        assert_eq!(m.source, MappingSource::DisplayName);
    }

    #[tokio::test]
    async fn test_warm_cache_only_when_empty() {
        let directory = Arc::new(
            FakeDirectory::new()
                .with_user("ann", "Ann", "Lee")
                .with_user("rob", "Rob", "Ng"),
        );
        let coord = coordinator(directory.clone());

        assert_eq!(coord.warm_directory_cache().await, 2);
        assert_eq!(directory.search_count(), WARM_SEED_QUERIES.len());

        assert_eq!(coord.warm_directory_cache().await, 0);
        assert_eq!(directory.search_count(), WARM_SEED_QUERIES.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_uses_two_tier_schedule() {
        let directory = Arc::new(FakeDirectory::new().with_user("me", "Mia", "Engel"));
        directory.set_unavailable(true);
        let coord = coordinator(directory.clone());
        let handle = coord.start();

        // Session start: populate once.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.phase(), SessionPhase::Steady);
        assert_eq!(directory.lookup_count(), 1);

        // Initial delay, then a failing refresh.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(directory.lookup_count(), 2);

        // Error-retry tier: 60s.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(directory.lookup_count(), 3);

        // Recovery, then the normal 300s period.
        directory.set_unavailable(false);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(directory.lookup_count(), 4);
        assert!(coord.store().get("me").is_some());

        tokio::time::sleep(Duration::from_secs(298)).await;
        assert_eq!(directory.lookup_count(), 4);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(directory.lookup_count(), 5);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_now_wakes_loop() {
        let directory = Arc::new(FakeDirectory::new().with_user("me", "Mia", "Engel"));
        let coord = coordinator(directory.clone());
        let handle = coord.start();

        // Past the initial delay, into the 300s period.
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(directory.lookup_count(), 2);

        handle.refresh_now();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(directory.lookup_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_session() {
        let directory = Arc::new(FakeDirectory::new().with_user("me", "Mia", "Engel"));
        let coord = coordinator(directory.clone());
        let handle = coord.start();
        let mut phases = handle.subscribe_phase();

        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.shutdown().await;
        assert_eq!(*phases.borrow_and_update(), SessionPhase::Cancelled);

        let before = directory.lookup_count();
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(directory.lookup_count(), before);

        // The queue's receiver went with the worker.
        assert!(!coord.queue().enqueue(DiscoveryRequest::new(
            "@jdoe:signout.io",
            DiscoveryContext::Other
        )));

        // No second session on the same coordinator.
        assert_eq!(coord.start().phase(), SessionPhase::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_drains_queue() {
        let directory = Arc::new(FakeDirectory::new().with_user("jdoe", "Jane", "Doe"));
        directory.set_delay(Duration::from_millis(100));
        let coord = coordinator(directory.clone());
        skip_warming(&coord);
        let _handle = coord.start();

        let queue = coord.queue();
        for _ in 0..5 {
            assert!(queue.enqueue(DiscoveryRequest::new(
                "@jdoe:signout.io",
                DiscoveryContext::RoomHero
            )));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(coord.store().get("jdoe").unwrap().display_name, "Jane Doe");
        // One lookup for the session user, one shared by the five requests.
        assert_eq!(directory.lookup_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_bounds_concurrency() {
        let directory = Arc::new(FakeDirectory::new());
        for i in 0..10 {
            directory.add_user(&format!("user{}", i), "U", &i.to_string());
        }
        directory.set_delay(Duration::from_millis(500));
        let coord = coordinator_with(
            directory.clone(),
            SessionIdentity::new("@me:signout.io", None),
            DiscoveryConfig {
                max_concurrent_lookups: 2,
                ..Default::default()
            },
        );
        skip_warming(&coord);
        let _handle = coord.start();
        // Let session start finish its own lookup first.
        tokio::time::sleep(Duration::from_secs(5)).await;
        directory.peak_active.store(0, Ordering::SeqCst);

        let queue = coord.queue();
        for i in 0..10 {
            assert!(queue.enqueue(DiscoveryRequest::new(
                format!("@user{}:signout.io", i),
                DiscoveryContext::MessageSender
            )));
        }
        tokio::time::sleep(Duration::from_secs(10)).await;

        for i in 0..10 {
            assert!(coord.store().get(&format!("user{}", i)).is_some());
        }
        assert!(directory.peak_active.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_inflight_lookups() {
        let directory = Arc::new(FakeDirectory::new().with_user("jdoe", "Jane", "Doe"));
        let coord = coordinator(directory.clone());
        skip_warming(&coord);
        let handle = coord.start();
        tokio::time::sleep(Duration::from_secs(1)).await;

        directory.set_delay(Duration::from_secs(3600));
        coord
            .queue()
            .enqueue(DiscoveryRequest::new("@jdoe:signout.io", DiscoveryContext::Other));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(coord.in_flight.len(), 1);

        handle.shutdown().await;
        assert_eq!(coord.in_flight.len(), 0);
        assert!(coord.store().get("jdoe").is_none());
    }
}

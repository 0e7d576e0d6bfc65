//! Identity-mapping cache between chat protocol ids and directory profiles.
//!
//! Render paths read through [`facade::MappingFacade`] and never wait on the
//! network. Unknown ids are discovered in the background by
//! [`discovery::DiscoveryCoordinator`], which also keeps the signed-in
//! user's own record fresh. [`store::MappingStore`] holds the mappings and
//! announces every write on its change feed.

pub mod config;
pub mod directory;
pub mod discovery;
mod error;
pub mod facade;
pub mod search;
pub mod store;
pub mod types;

use std::sync::Arc;

pub use error::DirectoryError;

use config::BridgeConfig;
use directory::client::DirectoryClient;
use directory::DirectoryLookup;
use discovery::session::{SessionHandle, SessionPhase};
use discovery::{DiscoveryCoordinator, SessionIdentity};
use facade::MappingFacade;
use search::UserSearch;
use store::MappingStore;

/// Install the process logger. Default filter `info`, `RUST_LOG` overrides.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

/// Everything one signed-in session needs, wired together.
pub struct IdentityBridge {
    directory: Arc<DirectoryClient>,
    store: Arc<MappingStore>,
    coordinator: Arc<DiscoveryCoordinator>,
    session: SessionHandle,
    facade: MappingFacade,
    search: UserSearch,
}

impl IdentityBridge {
    /// Build the bridge and spawn its session tasks. Must be called inside a
    /// tokio runtime.
    pub fn start(config: &BridgeConfig, session: SessionIdentity) -> Result<Self, DirectoryError> {
        let directory = Arc::new(DirectoryClient::new(&config.directory)?);
        let store = Arc::new(MappingStore::new(&config.store));
        let lookup: Arc<dyn DirectoryLookup> = directory.clone();

        let coordinator = Arc::new(DiscoveryCoordinator::new(
            lookup.clone(),
            store.clone(),
            session,
            config.discovery.clone(),
            config.refresh.clone(),
        ));
        let facade = MappingFacade::for_coordinator(&coordinator);
        let search = UserSearch::new(store.clone(), lookup, config.directory.search_limit);
        let session = coordinator.start();

        Ok(Self {
            directory,
            store,
            coordinator,
            session,
            facade,
            search,
        })
    }

    pub fn facade(&self) -> &MappingFacade {
        &self.facade
    }

    pub fn search(&self) -> &UserSearch {
        &self.search
    }

    pub fn store(&self) -> &Arc<MappingStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<DiscoveryCoordinator> {
        &self.coordinator
    }

    pub fn directory(&self) -> &DirectoryClient {
        &self.directory
    }

    pub fn phase(&self) -> SessionPhase {
        self.session.phase()
    }

    pub fn refresh_now(&self) {
        self.session.refresh_now();
    }

    /// Stop background work, then forget every mapping and negative entry.
    pub async fn sign_out(self) {
        self.session.shutdown().await;
        self.store.clear_all();
        self.coordinator.negative_cache().clear();
        log::info!("Identity bridge: signed out");
    }
}

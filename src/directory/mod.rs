//! External user directory integration.
//!
//! The directory is an identity-provider-backed search service holding legal
//! names, specialty, office city, and avatars. It knows nothing about chat
//! rooms. This module speaks its HTTP search/lookup contract and converts
//! its payloads into `IdentityMapping`s; it never caches.

pub mod client;
pub mod wire;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DirectoryError;
use crate::types::IdentityMapping;

/// Directory configuration stored in ~/.idbridge/config.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryConfig {
    /// Base URL the `/users/search` and `/users/lookup` paths hang off.
    #[serde(default)]
    pub base_url: String,
    /// Federation domain used to form `@username:domain` ids.
    #[serde(default = "default_homeserver_domain")]
    pub homeserver_domain: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,
}

fn default_homeserver_domain() -> String {
    "signout.io".to_string()
}

fn default_request_timeout_secs() -> u64 {
    8
}

fn default_search_limit() -> usize {
    10
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            homeserver_domain: default_homeserver_domain(),
            request_timeout_secs: default_request_timeout_secs(),
            search_limit: default_search_limit(),
        }
    }
}

/// Result of looking one user up.
///
/// `NotFound` is a confirmed absence (404 or no exact match) and may be
/// negatively cached; `Unavailable` is a transport or server failure and
/// must not be.
#[derive(Debug)]
pub enum LookupOutcome {
    Found(IdentityMapping),
    NotFound,
    Unavailable(DirectoryError),
}

/// The directory operations discovery depends on.
#[async_trait]
pub trait DirectoryLookup: Send + Sync {
    /// Resolve one short username to a directory record.
    async fn lookup_username(&self, username: &str) -> LookupOutcome;

    /// Free-text search across name, email, and username.
    async fn search(&self, query: &str, limit: usize)
        -> Result<Vec<IdentityMapping>, DirectoryError>;
}

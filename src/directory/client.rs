//! HTTP client for the directory search service.
//!
//! Uses reqwest with a client-level timeout. Two endpoints:
//! - `GET {base}/users/search?query=<q>&limit=<n>`
//! - `GET {base}/users/lookup?matrix_user_id=<id>` (404 when absent)
//!
//! `search_by_*` and `lookup_by_protocol_id` never fail: transport errors, non-2xx
//! statuses, and unparsable bodies all come back as "no result". The
//! `try_*` variants keep the error for callers that must tell a failure
//! from an absence.

use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use super::wire::{parse_search_response, parse_user};
use super::{DirectoryConfig, DirectoryLookup, LookupOutcome};
use crate::error::DirectoryError;
use crate::types::{protocol_id_for, IdentityMapping};

const SEARCH_PATH: &str = "users/search";
const LOOKUP_PATH: &str = "users/lookup";

/// Longest response body kept in an error message.
const MAX_ERROR_BODY: usize = 200;

pub struct DirectoryClient {
    client: reqwest::Client,
    base_url: String,
    config: DirectoryConfig,
}

impl DirectoryClient {
    pub fn new(config: &DirectoryConfig) -> Result<Self, DirectoryError> {
        let base = config.base_url.trim().trim_end_matches('/');
        if base.is_empty() {
            return Err(DirectoryError::InvalidConfig("directory baseUrl is empty".into()));
        }
        let parsed = Url::parse(base)
            .map_err(|e| DirectoryError::InvalidConfig(format!("baseUrl '{}': {}", base, e)))?;
        if parsed.scheme() != "https" && parsed.scheme() != "http" {
            return Err(DirectoryError::InvalidConfig(format!(
                "baseUrl '{}' must be http(s)",
                base
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| DirectoryError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base.to_string(),
            config: config.clone(),
        })
    }

    // -----------------------------------------------------------------------
    // Infallible operations
    // -----------------------------------------------------------------------

    /// Free-text search across name, email, and username.
    pub async fn search_by_query(&self, query: &str, limit: usize) -> Vec<IdentityMapping> {
        match self.try_search(query, limit).await {
            Ok(results) => results,
            Err(e) => {
                log::warn!("Directory: search '{}' failed: {}", query, e);
                Vec::new()
            }
        }
    }

    /// Exact or best-effort match for one short username.
    pub async fn search_by_username(&self, username: &str) -> Option<IdentityMapping> {
        match self.lookup(username).await {
            LookupOutcome::Found(m) => Some(m),
            LookupOutcome::NotFound => None,
            LookupOutcome::Unavailable(e) => {
                log::warn!("Directory: lookup for '{}' failed: {}", username, e);
                None
            }
        }
    }

    /// Look a user up by full protocol id.
    pub async fn lookup_by_protocol_id(&self, protocol_id: &str) -> Option<IdentityMapping> {
        match self.try_lookup(protocol_id).await {
            Ok(found) => found,
            Err(e) => {
                log::warn!("Directory: lookup for {} failed: {}", protocol_id, e);
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Fallible operations
    // -----------------------------------------------------------------------

    /// Tri-state username lookup: the lookup endpoint first, then an exact
    /// username match within search results.
    pub async fn lookup(&self, username: &str) -> LookupOutcome {
        let username = username.trim();
        if username.is_empty() {
            return LookupOutcome::NotFound;
        }

        let protocol_id = protocol_id_for(username, &self.config.homeserver_domain);
        match self.try_lookup(&protocol_id).await {
            Ok(Some(mapping)) => return LookupOutcome::Found(mapping),
            Ok(None) => {
                log::debug!(
                    "Directory: no record for {}, falling back to search",
                    protocol_id
                );
            }
            Err(e) => return LookupOutcome::Unavailable(e),
        }

        match self.try_search(username, self.config.search_limit).await {
            Ok(results) => results
                .into_iter()
                .find(|m| m.directory_username.eq_ignore_ascii_case(username))
                .map(LookupOutcome::Found)
                .unwrap_or(LookupOutcome::NotFound),
            Err(e) => LookupOutcome::Unavailable(e),
        }
    }

    pub async fn try_search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<IdentityMapping>, DirectoryError> {
        let query = query.trim();
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let limit_param = limit.to_string();
        let url = self.endpoint(SEARCH_PATH, &[("query", query), ("limit", &limit_param)])?;
        let (status, body) = self.fetch(url).await?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        let users = parse_search_response(&body)?;
        let fetched = users.len();
        let mappings: Vec<IdentityMapping> = users
            .into_iter()
            .filter_map(|u| u.into_mapping(&self.config.homeserver_domain))
            .take(limit)
            .collect();

        log::debug!(
            "Directory: search '{}' returned {} users ({} usable)",
            query,
            fetched,
            mappings.len()
        );
        Ok(mappings)
    }

    /// `Ok(None)` when the directory confirms the user is absent.
    pub async fn try_lookup(
        &self,
        protocol_id: &str,
    ) -> Result<Option<IdentityMapping>, DirectoryError> {
        let url = self.endpoint(LOOKUP_PATH, &[("matrix_user_id", protocol_id.trim())])?;
        let (status, body) = self.fetch(url).await?;
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        let user = parse_user(&body)?;
        Ok(user.into_mapping(&self.config.homeserver_domain))
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Result<Url, DirectoryError> {
        Url::parse_with_params(&format!("{}/{}", self.base_url, path), params)
            .map_err(|e| DirectoryError::InvalidConfig(format!("{}: {}", path, e)))
    }

    async fn fetch(&self, url: Url) -> Result<(reqwest::StatusCode, String), DirectoryError> {
        let timeout = self.config.request_timeout_secs;
        let resp = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| DirectoryError::from_reqwest(e, timeout))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| DirectoryError::from_reqwest(e, timeout))?;
        Ok((status, body))
    }
}

fn status_error(status: reqwest::StatusCode, body: &str) -> DirectoryError {
    DirectoryError::Status {
        status: status.as_u16(),
        body: body.chars().take(MAX_ERROR_BODY).collect(),
    }
}

#[async_trait]
impl DirectoryLookup for DirectoryClient {
    async fn lookup_username(&self, username: &str) -> LookupOutcome {
        self.lookup(username).await
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<IdentityMapping>, DirectoryError> {
        self.try_search(query, limit).await
    }
}

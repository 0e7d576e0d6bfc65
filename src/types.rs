//! Core identity types shared by the store, directory client, and discovery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a mapping's profile data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MappingSource {
    /// A record returned by the external directory.
    Directory,
    /// Parsed from a protocol-side display name seeded at registration.
    DisplayName,
}

/// Resolved association between a protocol id and directory profile data.
///
/// Keyed by `directory_username`. Replaced wholesale on upsert, never merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityMapping {
    pub protocol_id: String,
    pub directory_username: String,
    pub display_name: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialty: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub office_city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub source: MappingSource,
    pub last_refreshed_at: DateTime<Utc>,
}

impl IdentityMapping {
    /// Mapping with only identifiers set; all descriptive attributes empty.
    pub fn new(
        protocol_id: impl Into<String>,
        directory_username: impl Into<String>,
        source: MappingSource,
    ) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            directory_username: directory_username.into(),
            display_name: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            email: String::new(),
            specialty: None,
            office_city: None,
            avatar_url: None,
            source,
            last_refreshed_at: Utc::now(),
        }
    }

    /// Set given/family name and derive the display name from them.
    pub fn with_names(mut self, first_name: &str, last_name: &str) -> Self {
        self.first_name = first_name.trim().to_string();
        self.last_name = last_name.trim().to_string();
        self.display_name = join_names(&self.first_name, &self.last_name);
        self
    }

    pub fn from_directory(&self) -> bool {
        self.source == MappingSource::Directory
    }

    /// Whether the mapping has been refreshed within `max_age`.
    pub fn is_fresh(&self, max_age: chrono::Duration) -> bool {
        Utc::now() - self.last_refreshed_at < max_age
    }
}

/// "Jane" + "Doe" -> "Jane Doe", tolerating either side being empty.
pub fn join_names(first: &str, last: &str) -> String {
    format!("{} {}", first.trim(), last.trim()).trim().to_string()
}

/// Short username of a protocol id: `@jdoe:example.org` -> `jdoe`.
///
/// Also accepts ids without the leading sigil or without a domain.
pub fn protocol_username(protocol_id: &str) -> Option<&str> {
    let trimmed = protocol_id.trim();
    let without_sigil = trimmed.strip_prefix('@').unwrap_or(trimmed);
    let localpart = without_sigil.split(':').next().unwrap_or_default();
    if localpart.is_empty() {
        None
    } else {
        Some(localpart)
    }
}

/// Build `@username:domain`.
pub fn protocol_id_for(username: &str, domain: &str) -> String {
    format!("@{}:{}", username.trim(), domain.trim())
}

/// Canonical table key for a directory username.
pub fn normalize_username(username: &str) -> String {
    username.trim().to_ascii_lowercase()
}

/// Split a display name at the first whitespace into given and family name.
pub fn split_display_name(display_name: &str) -> (String, String) {
    let trimmed = display_name.trim();
    match trimmed.split_once(char::is_whitespace) {
        Some((first, rest)) => (first.to_string(), rest.trim().to_string()),
        None => (trimmed.to_string(), String::new()),
    }
}

//! Directory wire schema, decoded once at the HTTP boundary.
//!
//! The search service fills fields from identity-provider attributes that
//! may be missing, null, or the wrong JSON type. Every field is optional and
//! leniently typed; a malformed entry is skipped without failing its siblings.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::DirectoryError;
use crate::types::{
    join_names, protocol_id_for, protocol_username, IdentityMapping, MappingSource,
};

/// One user object from `/users/search` or `/users/lookup`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryUser {
    #[serde(default, deserialize_with = "lenient_string")]
    pub matrix_user_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub matrix_username: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub cognito_username: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub given_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub family_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub display_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub specialty: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub office_city: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub npi_number: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub phone_number: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub avatar_url: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub user_status: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub is_enabled: Option<bool>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub is_active: Option<bool>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub approval_status: Option<String>,
}

impl DirectoryUser {
    /// Short username: `matrix_username`, else the protocol id's localpart,
    /// else the identity-provider username.
    pub fn username(&self) -> Option<String> {
        if let Some(name) = self.matrix_username.as_deref() {
            return Some(name.to_string());
        }
        if let Some(name) = self.matrix_user_id.as_deref().and_then(protocol_username) {
            return Some(name.to_string());
        }
        self.cognito_username.clone()
    }

    /// Convert to a mapping. `None` when no username can be derived.
    pub fn into_mapping(self, homeserver_domain: &str) -> Option<IdentityMapping> {
        let username = self.username()?;
        let protocol_id = self
            .matrix_user_id
            .clone()
            .unwrap_or_else(|| protocol_id_for(&username, homeserver_domain));

        let first_name = self.given_name.unwrap_or_default();
        let last_name = self.family_name.unwrap_or_default();
        let joined = join_names(&first_name, &last_name);
        let display_name = if joined.is_empty() {
            self.display_name.unwrap_or_default()
        } else {
            joined
        };

        let mut mapping = IdentityMapping::new(protocol_id, username, MappingSource::Directory);
        mapping.display_name = display_name;
        mapping.first_name = first_name;
        mapping.last_name = last_name;
        mapping.email = self.email.unwrap_or_default();
        mapping.specialty = self.specialty;
        mapping.office_city = self.office_city;
        mapping.avatar_url = self.avatar_url;
        Some(mapping)
    }
}

/// Parse a search response body into its user entries.
///
/// A missing or non-array `users` key yields no entries. Only a body that
/// is not a JSON object at all is an error.
pub fn parse_search_response(body: &str) -> Result<Vec<DirectoryUser>, DirectoryError> {
    let json: Value = serde_json::from_str(body)?;
    let object = json
        .as_object()
        .ok_or_else(|| DirectoryError::Parse("search response is not an object".into()))?;

    let entries = match object.get("users").and_then(Value::as_array) {
        Some(entries) => entries,
        None => return Ok(Vec::new()),
    };

    let mut users = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        match serde_json::from_value::<DirectoryUser>(entry.clone()) {
            Ok(user) => users.push(user),
            Err(e) => log::debug!("Directory: skipping malformed user entry {}: {}", i, e),
        }
    }
    Ok(users)
}

/// Parse a single-user lookup body.
pub fn parse_user(body: &str) -> Result<DirectoryUser, DirectoryError> {
    let json: Value = serde_json::from_str(body)?;
    if !json.is_object() {
        return Err(DirectoryError::Parse("lookup response is not an object".into()));
    }
    Ok(serde_json::from_value(json)?)
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Bool(b)) => Some(b),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        Some(Value::Number(n)) => n.as_i64().map(|v| v != 0),
        _ => None,
    })
}

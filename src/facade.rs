//! Read path for formatters and room-list rendering.
//!
//! Every call answers from the current store contents and returns at once.
//! A miss hands a `DiscoveryRequest` to the discovery worker with
//! `try_send` and falls back; the caller re-renders when the store's change
//! feed reports the new mapping.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::discovery::negative::NegativeCache;
use crate::discovery::queue::{DiscoveryContext, DiscoveryQueue, DiscoveryRequest};
use crate::discovery::DiscoveryCoordinator;
use crate::store::MappingStore;
use crate::types::{protocol_username, IdentityMapping};

/// Cache state of one protocol id.
#[derive(Debug, Clone, PartialEq)]
pub enum MappingState {
    Found(IdentityMapping),
    /// The directory confirmed the user absent at `checked_at`.
    NotFound { checked_at: DateTime<Utc> },
    Unknown,
}

/// A room hero as reported by the protocol engine.
#[derive(Debug, Clone)]
pub struct RoomHero {
    pub user_id: String,
    pub display_name: Option<String>,
}

#[derive(Clone)]
pub struct MappingFacade {
    store: Arc<MappingStore>,
    queue: DiscoveryQueue,
    negative: Arc<NegativeCache>,
    stale_after: Option<chrono::Duration>,
}

impl MappingFacade {
    pub fn new(
        store: Arc<MappingStore>,
        queue: DiscoveryQueue,
        negative: Arc<NegativeCache>,
    ) -> Self {
        Self {
            store,
            queue,
            negative,
            stale_after: None,
        }
    }

    /// Directory records older than `max_age` are still shown, and a
    /// background refresh is queued for them.
    pub fn with_stale_after(mut self, max_age: Option<chrono::Duration>) -> Self {
        self.stale_after = max_age;
        self
    }

    pub fn for_coordinator(coordinator: &DiscoveryCoordinator) -> Self {
        Self::new(
            coordinator.store().clone(),
            coordinator.queue(),
            coordinator.negative_cache(),
        )
        .with_stale_after(coordinator.discovery_config().stale_after())
    }

    /// Display name for `protocol_id`, or `fallback` when none is cached.
    pub fn resolve_display(&self, protocol_id: &str, fallback: &str) -> String {
        self.display_or_discover(protocol_id, None, fallback, DiscoveryContext::Other)
    }

    /// Full cached mapping, scheduling discovery on a miss.
    pub fn resolve_mapping(&self, protocol_id: &str) -> Option<IdentityMapping> {
        self.lookup_or_discover(protocol_id, None, DiscoveryContext::Other)
    }

    /// Cache state without side effects.
    pub fn mapping_state(&self, protocol_id: &str) -> MappingState {
        let Some(username) = protocol_username(protocol_id) else {
            return MappingState::Unknown;
        };
        if let Some(mapping) = self.store.get(username) {
            return MappingState::Found(mapping);
        }
        match self.negative.checked_at(username) {
            Some(checked_at) => MappingState::NotFound { checked_at },
            None => MappingState::Unknown,
        }
    }

    /// Name shown above a message. Falls back to the protocol engine's
    /// disambiguated name, then to the raw sender id.
    pub fn sender_display_name(&self, sender_id: &str, disambiguated_name: Option<&str>) -> String {
        let hint = disambiguated_name.map(str::trim).filter(|n| !n.is_empty());
        let fallback = hint.unwrap_or(sender_id);
        self.display_or_discover(sender_id, hint, fallback, DiscoveryContext::MessageSender)
    }

    /// Name for a membership-change or moderation line about `user_id`.
    pub fn member_display_name(
        &self,
        user_id: &str,
        member_display_name: Option<&str>,
        context: DiscoveryContext,
    ) -> String {
        let hint = member_display_name.map(str::trim).filter(|n| !n.is_empty());
        let fallback = hint.unwrap_or(user_id);
        self.display_or_discover(user_id, hint, fallback, context)
    }

    /// Room-list title. A direct room with exactly two active members shows
    /// the first hero's mapped name; every other room keeps its own name.
    pub fn direct_room_name(
        &self,
        room_name: &str,
        is_direct: bool,
        active_members: usize,
        heroes: &[RoomHero],
    ) -> String {
        if !is_direct || active_members != 2 {
            return room_name.to_string();
        }
        let Some(hero) = heroes.first() else {
            log::debug!("Mapping facade: direct room '{}' has no heroes", room_name);
            return room_name.to_string();
        };
        self.display_or_discover(
            &hero.user_id,
            hero.display_name.as_deref(),
            room_name,
            DiscoveryContext::RoomHero,
        )
    }

    fn display_or_discover(
        &self,
        protocol_id: &str,
        hint: Option<&str>,
        fallback: &str,
        context: DiscoveryContext,
    ) -> String {
        self.lookup_or_discover(protocol_id, hint, context)
            .map(|m| m.display_name)
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| fallback.to_string())
    }

    fn lookup_or_discover(
        &self,
        protocol_id: &str,
        hint: Option<&str>,
        context: DiscoveryContext,
    ) -> Option<IdentityMapping> {
        let username = protocol_username(protocol_id)?;
        let cached = self.store.get(username);
        if cached.as_ref().is_some_and(|m| !self.is_stale(m)) {
            return cached;
        }

        if self.negative.is_suppressed(username) {
            log::debug!("Mapping facade: {} recently not found", username);
        } else {
            let request = DiscoveryRequest::new(protocol_id, context).with_hint(hint);
            if self.queue.enqueue(request) {
                let reason = if cached.is_some() { "stale" } else { "miss" };
                log::debug!("Mapping facade: {} for {}, discovery queued", reason, username);
            }
        }
        cached
    }

    fn is_stale(&self, mapping: &IdentityMapping) -> bool {
        mapping.from_directory()
            && self
                .stale_after
                .is_some_and(|max_age| !mapping.is_fresh(max_age))
    }
}

//! Bounded hand-off from render paths to the discovery worker.
//!
//! Render code must never wait, so `enqueue` uses `try_send`: when the
//! channel is full the request is dropped and the caller keeps its fallback.
//! A later render of the same id will ask again.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Where in the UI an unknown id was encountered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryContext {
    RoomHero,
    MessageSender,
    MembershipChange,
    Moderation,
    Search,
    Other,
}

/// A request to fill the mapping for one protocol id.
#[derive(Debug, Clone)]
pub struct DiscoveryRequest {
    pub protocol_id: String,
    pub display_name_hint: Option<String>,
    pub context: DiscoveryContext,
}

impl DiscoveryRequest {
    pub fn new(protocol_id: impl Into<String>, context: DiscoveryContext) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            display_name_hint: None,
            context,
        }
    }

    pub fn with_hint(mut self, hint: Option<&str>) -> Self {
        self.display_name_hint = hint
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string);
        self
    }
}

/// Sending half of the discovery channel. Cheap to clone.
#[derive(Clone)]
pub struct DiscoveryQueue {
    tx: mpsc::Sender<DiscoveryRequest>,
}

impl DiscoveryQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DiscoveryRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a request without waiting. Returns `false` when it was dropped.
    pub fn enqueue(&self, request: DiscoveryRequest) -> bool {
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Full(request)) => {
                log::debug!(
                    "Discovery queue: full, dropped {} ({:?})",
                    request.protocol_id,
                    request.context
                );
                false
            }
            Err(TrySendError::Closed(request)) => {
                log::debug!(
                    "Discovery queue: closed, dropped {}",
                    request.protocol_id
                );
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

//! Single-flight registry for directory lookups.
//!
//! The first caller for a username becomes the leader and performs the
//! lookup; later callers get a `watch` receiver that flips once the leader's
//! guard is dropped. Dropping covers completion, early return, panic, and
//! task abort alike, so followers are never stranded.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;

pub(crate) struct InFlight {
    entries: DashMap<String, watch::Receiver<bool>>,
}

pub(crate) enum Flight<'a> {
    Leader(FlightGuard<'a>),
    Follower(watch::Receiver<bool>),
}

pub(crate) struct FlightGuard<'a> {
    owner: &'a InFlight,
    key: String,
    done: watch::Sender<bool>,
}

impl InFlight {
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Claim `key`, or join the lookup already running for it.
    pub(crate) fn begin(&self, key: &str) -> Flight<'_> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(existing) => Flight::Follower(existing.get().clone()),
            Entry::Vacant(slot) => {
                let (done, rx) = watch::channel(false);
                slot.insert(rx);
                Flight::Leader(FlightGuard {
                    owner: self,
                    key: key.to_string(),
                    done,
                })
            }
        }
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.owner.entries.remove(&self.key);
        self.done.send_replace(true);
    }
}

/// Wait for the leader to finish. Returns immediately if it already has.
pub(crate) async fn join(mut rx: watch::Receiver<bool>) {
    // Err means the sender is gone, which also means the leader is done.
    let _ = rx.wait_for(|done| *done).await;
}

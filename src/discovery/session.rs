//! Session-scoped background tasks: the current-user refresh loop and the
//! discovery worker.
//!
//! Both tasks are owned by a `SessionHandle`. Shutting the handle down (or
//! dropping it) aborts them; aborting the worker drops its `JoinSet`, which
//! aborts every lookup it spawned.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::{JoinHandle, JoinSet};

use super::queue::DiscoveryRequest;
use super::DiscoveryCoordinator;

/// Lifecycle of one authenticated session's discovery machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Populating,
    /// Refresh loop running.
    Steady,
    Cancelled,
}

pub struct SessionHandle {
    phase: Arc<watch::Sender<SessionPhase>>,
    wake: Arc<Notify>,
    refresh: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub(crate) fn spawn(
        coordinator: Arc<DiscoveryCoordinator>,
        requests: mpsc::Receiver<DiscoveryRequest>,
    ) -> Self {
        let (phase, _) = watch::channel(SessionPhase::Idle);
        let phase = Arc::new(phase);
        let wake = Arc::new(Notify::new());

        let refresh = tokio::spawn(run_refresh_loop(
            coordinator.clone(),
            phase.clone(),
            wake.clone(),
        ));
        let worker = tokio::spawn(run_discovery_worker(coordinator, requests));

        Self {
            phase,
            wake,
            refresh: Some(refresh),
            worker: Some(worker),
        }
    }

    /// A handle with no tasks, for a coordinator whose session already ran.
    pub(crate) fn cancelled() -> Self {
        let (phase, _) = watch::channel(SessionPhase::Cancelled);
        Self {
            phase: Arc::new(phase),
            wake: Arc::new(Notify::new()),
            refresh: None,
            worker: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    /// Watch phase transitions.
    pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase.subscribe()
    }

    /// Cut the current refresh sleep short.
    pub fn refresh_now(&self) {
        self.wake.notify_one();
    }

    /// Abort both tasks and wait until they are gone.
    pub async fn shutdown(mut self) {
        for task in [self.refresh.take(), self.worker.take()].into_iter().flatten() {
            task.abort();
            if let Err(e) = task.await {
                if e.is_panic() {
                    log::warn!("Discovery session: task panicked before shutdown: {}", e);
                }
            }
        }
        self.phase.send_replace(SessionPhase::Cancelled);
        log::info!("Discovery session: cancelled");
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        for task in [self.refresh.take(), self.worker.take()].into_iter().flatten() {
            task.abort();
        }
        self.phase.send_replace(SessionPhase::Cancelled);
    }
}

/// Populate once, then refresh the current user forever.
///
/// - populate (plus cache warming) immediately
/// - initial delay plus a per-client jitter
/// - normal period after success, shorter retry period after a failure
async fn run_refresh_loop(
    coordinator: Arc<DiscoveryCoordinator>,
    phase: Arc<watch::Sender<SessionPhase>>,
    wake: Arc<Notify>,
) {
    phase.send_replace(SessionPhase::Populating);
    let warmed = coordinator.warm_directory_cache().await;
    if warmed > 0 {
        log::info!("Refresh loop: warmed cache with {} mappings", warmed);
    }
    coordinator.populate_current_user_mapping().await;
    phase.send_replace(SessionPhase::Steady);

    let config = coordinator.refresh_config().clone();
    let jitter = session_jitter(&coordinator.session().protocol_id, config.jitter_secs);
    log::debug!(
        "Refresh loop: first refresh in {}s (+{}ms jitter)",
        config.initial_delay_secs,
        jitter.as_millis()
    );
    tokio::time::sleep(Duration::from_secs(config.initial_delay_secs) + jitter).await;

    loop {
        let pause = match coordinator.refresh_current_user().await {
            Ok(()) => Duration::from_secs(config.period_secs),
            Err(e) => {
                log::warn!(
                    "Refresh loop: refresh failed, retrying in {}s: {}",
                    config.error_retry_secs,
                    e
                );
                Duration::from_secs(config.error_retry_secs)
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(pause) => {},
            _ = wake.notified() => {
                log::info!("Refresh loop: woken for immediate refresh");
            },
        }
    }
}

/// Drain discovery requests with bounded concurrency.
async fn run_discovery_worker(
    coordinator: Arc<DiscoveryCoordinator>,
    mut requests: mpsc::Receiver<DiscoveryRequest>,
) {
    let max_concurrent = coordinator.discovery_config().max_concurrent_lookups.max(1);
    let mut lookups: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            finished = lookups.join_next(), if !lookups.is_empty() => {
                if let Some(Err(e)) = finished {
                    if e.is_panic() {
                        log::warn!("Discovery worker: lookup task panicked: {}", e);
                    }
                }
            }
            next = requests.recv(), if lookups.len() < max_concurrent => {
                let Some(request) = next else { break };
                if !coordinator.needs_discovery(&request.protocol_id) {
                    log::debug!("Discovery worker: skipping {}", request.protocol_id);
                    continue;
                }
                let coordinator = coordinator.clone();
                lookups.spawn(async move {
                    let outcome = coordinator
                        .discover_user_mapping(
                            &request.protocol_id,
                            request.display_name_hint.as_deref(),
                        )
                        .await;
                    log::debug!(
                        "Discovery worker: {} ({:?}) -> {:?}",
                        request.protocol_id,
                        request.context,
                        outcome
                    );
                });
            }
        }
    }

    while lookups.join_next().await.is_some() {}
    log::debug!("Discovery worker: request channel closed");
}

/// Deterministic per-client offset in `[0, max_secs)`, so a fleet of clients
/// started together does not refresh in lockstep.
pub(crate) fn session_jitter(seed: &str, max_secs: u64) -> Duration {
    if max_secs == 0 {
        return Duration::ZERO;
    }
    let digest = Sha256::digest(seed.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    Duration::from_millis(u64::from_be_bytes(prefix) % (max_secs * 1000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_is_deterministic_and_bounded() {
        let a = session_jitter("@jdoe:signout.io", 15);
        assert_eq!(a, session_jitter("@jdoe:signout.io", 15));
        assert!(a < Duration::from_secs(15));
        assert_eq!(session_jitter("@jdoe:signout.io", 0), Duration::ZERO);
    }

    #[test]
    fn test_jitter_varies_by_client() {
        let distinct: std::collections::HashSet<Duration> = (0..20)
            .map(|i| session_jitter(&format!("@user{}:signout.io", i), 15))
            .collect();
        assert!(distinct.len() > 1);
    }
}

//! Loading a CoValue from peers.
//!
//! One load request goes to every eligible peer at once. Each request waits
//! until the peer answers, the value becomes available from anywhere, or the
//! peer's timeout passes. Peers that allow it are asked again with
//! exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::availability::{lock, HighLevelState, PeerStatus, SharedCoValueState, StateSnapshot};
use crate::error::Result;
use crate::messages::SyncMessage;
use crate::peer::Peer;
use crate::transport::Transport;

/// Timeouts and retry policy for loads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadConfig {
    /// How long a server or client peer may take to answer.
    pub peer_timeout: Duration,
    /// How long storage may take to answer.
    pub storage_timeout: Duration,
    /// Extra rounds for peers with `retry_unavailable`.
    pub max_retries: u32,
    /// Delay before retry `n` is `retry_base_delay * 3^n`.
    pub retry_base_delay: Duration,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            peer_timeout: Duration::from_secs(10),
            storage_timeout: Duration::from_secs(30),
            max_retries: 1,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

impl LoadConfig {
    /// Backoff before the given retry (0-based).
    pub fn retry_delay(&self, retry: u32) -> Duration {
        self.retry_base_delay.saturating_mul(3u32.saturating_pow(retry))
    }
}

/// Whether `peer` should get a request in this round.
fn should_ask(status: &PeerStatus, peer: &Peer, retrying: bool) -> bool {
    match status {
        PeerStatus::Unknown => !retrying || peer.config.retry_unavailable,
        PeerStatus::Pending | PeerStatus::Unavailable => peer.config.retry_unavailable,
        PeerStatus::Available | PeerStatus::Errored(_) => false,
    }
}

/// Load a CoValue from `peers`, returning the state it settles in.
///
/// Returns as soon as any peer makes the value available. Replies are
/// applied to `state` by whoever reads the transport; this only sends
/// requests and waits.
pub async fn load_from_peers(
    state: &SharedCoValueState,
    peers: &[Peer],
    config: &LoadConfig,
    transport: Arc<dyn Transport>,
) -> Result<HighLevelState> {
    let mut rx = lock(state)?.subscribe();

    for attempt in 0..=config.max_retries {
        let retrying = attempt > 0;
        if retrying {
            if !peers.iter().any(|p| p.config.retry_unavailable) {
                break;
            }
            let delay = config.retry_delay(attempt - 1);
            debug!(attempt, ?delay, "backing off before retry");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                Ok(_) = rx.wait_for(|s| s.state == HighLevelState::Available) => {
                    return Ok(HighLevelState::Available);
                }
            }
        }

        let round = start_round(state, peers, config, &transport, retrying)?;
        if round.is_empty() {
            break;
        }
        round_complete(round).await;

        let current = lock(state)?.high_level_state();
        if current == HighLevelState::Available {
            return Ok(current);
        }
    }

    let guard = lock(state)?;
    let settled = guard.high_level_state();
    info!(id = %guard.id(), state = settled.as_str(), "load finished");
    Ok(settled)
}

/// Mark every eligible peer pending and spawn one request task each.
fn start_round(
    state: &SharedCoValueState,
    peers: &[Peer],
    config: &LoadConfig,
    transport: &Arc<dyn Transport>,
    retrying: bool,
) -> Result<JoinSet<()>> {
    let mut tasks = JoinSet::new();
    let mut guard = lock(state)?;
    if guard.core().is_some() {
        return Ok(tasks);
    }
    let known = guard.known_state();
    let id = guard.id();

    for peer in peers {
        if !should_ask(&guard.peer_status(&peer.id), peer, retrying) {
            continue;
        }
        let token = guard.mark_pending(&peer.id);
        let mut rx = guard.subscribe();
        let timeout = peer.config.timeout(config);
        let state = Arc::clone(state);
        let transport = Arc::clone(transport);
        let peer = peer.clone();
        let known = known.clone();

        tasks.spawn(async move {
            if let Err(err) = transport.send(&peer.id, SyncMessage::Load { known }).await {
                warn!(id = %id, peer = %peer.id, error = %err, "load request failed");
                if let Ok(mut guard) = lock(&state) {
                    guard.mark_errored(&peer.id, err.to_string());
                }
                return;
            }

            let answered = |s: &StateSnapshot| {
                s.state == HighLevelState::Available
                    || s.peers.get(&peer.id).map_or(false, PeerStatus::is_settled)
            };
            tokio::select! {
                _ = token.cancelled() => {}
                Ok(_) = rx.wait_for(answered) => {}
                _ = tokio::time::sleep(timeout) => {
                    warn!(id = %id, peer = %peer.id, ?timeout, "load timed out");
                    if let Ok(mut guard) = lock(&state) {
                        if guard.peer_status(&peer.id) == PeerStatus::Pending {
                            guard.mark_not_found_in_peer(&peer.id);
                        }
                    }
                }
            }
        });
    }
    Ok(tasks)
}

async fn round_complete(mut tasks: JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            warn!(error = %err, "load task failed");
        }
    }
}

//! Convergence verification.
//!
//! After syncing, replicas can check they hold the same history by comparing
//! known states and a content hash over every session's chain hash.

use std::cmp::Ordering;

use coweave_core::{CoValueCore, Hash, KnownState};

/// How one known state relates to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownComparison {
    Equal,
    /// Local lacks something the remote has, and has nothing extra.
    Behind,
    /// Local has everything the remote has, and more.
    Ahead,
    /// Each side has something the other lacks.
    Diverged,
}

/// Compare `local` against `remote`, session by session.
pub fn compare_known_states(local: &KnownState, remote: &KnownState) -> KnownComparison {
    let mut behind = local.header < remote.header;
    let mut ahead = local.header > remote.header;

    let sessions = local.sessions.keys().chain(remote.sessions.keys());
    for session in sessions {
        match local.count(session).cmp(&remote.count(session)) {
            Ordering::Less => behind = true,
            Ordering::Greater => ahead = true,
            Ordering::Equal => {}
        }
    }

    match (behind, ahead) {
        (false, false) => KnownComparison::Equal,
        (true, false) => KnownComparison::Behind,
        (false, true) => KnownComparison::Ahead,
        (true, true) => KnownComparison::Diverged,
    }
}

/// Deterministic hash of a CoValue's full content.
///
/// Algorithm:
/// 1. Start from the domain prefix and the value's id
/// 2. For each session in id order: session id, transaction count, chain hash
/// 3. Return the Blake3 digest
pub fn content_hash(core: &CoValueCore) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"coweave-state-v0:");
    hasher.update(core.id().as_bytes());

    for log in core.sessions() {
        hasher.update(log.session_id().as_str().as_bytes());
        hasher.update(&log.len().to_be_bytes());
        hasher.update(&log.hash().0);
    }

    Hash(*hasher.finalize().as_bytes())
}

/// Result of convergence verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceResult {
    /// Both replicas have identical history.
    Converged,
    /// Counts differ; more sync rounds may fix it.
    NotConverged { comparison: KnownComparison },
    /// Same counts, different content. A session was forked or corrupted.
    Forked,
}

impl ConvergenceResult {
    /// Check if replicas have converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, ConvergenceResult::Converged)
    }

    /// Check if a fork was detected.
    pub fn is_forked(&self) -> bool {
        matches!(self, ConvergenceResult::Forked)
    }
}

/// Verify a local replica against a remote one's known state and, when
/// available, its content hash.
pub fn verify_convergence(
    local: &CoValueCore,
    remote_known: &KnownState,
    remote_hash: Option<&Hash>,
) -> ConvergenceResult {
    let comparison = compare_known_states(local.known_state(), remote_known);
    if comparison != KnownComparison::Equal {
        return ConvergenceResult::NotConverged { comparison };
    }
    match remote_hash {
        Some(hash) if *hash != content_hash(local) => ConvergenceResult::Forked,
        _ => ConvergenceResult::Converged,
    }
}

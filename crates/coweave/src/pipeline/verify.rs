//! The verify stage: replaying a session's hash chain from its last verified
//! point and checking each signature met on the way.

use std::mem;

use tracing::{debug, warn};

use coweave_core::{
    session_agent, CoValueCore, RawCoID, ResolveAccountAgentError, SessionID, SignerResolver,
    Transaction, Verification,
};

use super::entry::{DecryptionState, SessionEntry, TxState, Validity};

/// What verifying one session achieved in this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionVerify {
    /// Nothing new to check.
    Idle,
    /// This many more transactions are verified.
    Advanced(u32),
    /// The signer is an account that is not loaded yet.
    WaitingFor(RawCoID),
    /// The unverified tail was discarded.
    Failed,
}

/// Verify `session` as far as its signatures reach, appending each verified
/// run to `core`.
///
/// A bad signature marks every transaction from the last verified one to the
/// end of the available prefix as failed; the offending one carries the hash
/// that was computed for it.
pub(crate) fn verify_session(
    id: &RawCoID,
    session_id: &SessionID,
    session: &mut SessionEntry,
    core: &mut CoValueCore,
    resolver: &dyn SignerResolver,
) -> SessionVerify {
    let available = session.last_available();
    if available <= session.verified {
        return SessionVerify::Idle;
    }

    let agent = match session_agent(session_id, resolver) {
        Ok(agent) => agent,
        Err(ResolveAccountAgentError::AccountNotLoaded(account)) => {
            debug!(id = %id, session = %session_id, account = %account, "signer account not loaded");
            return SessionVerify::WaitingFor(account);
        }
        Err(e) => {
            fail_tail(id, session, available, format!("cannot resolve signer: {}", e), None);
            return SessionVerify::Failed;
        }
    };

    let start = session.verified;
    let mut hash = session.hash.clone();
    let mut run: Vec<Transaction> = Vec::new();

    for index in start..available {
        let slot = &session.transactions[index as usize];
        let Some(tx) = slot.transaction.as_ref() else {
            break;
        };
        hash.update(tx);
        run.push(tx.clone());

        let Some(signature) = slot.signature else {
            continue;
        };
        let digest = hash.digest();
        if agent.signer.verify(&digest, &signature).is_err() {
            let offending = (index, digest);
            fail_tail(
                id,
                session,
                available,
                format!("invalid signature at index {}", index),
                Some(offending),
            );
            return SessionVerify::Failed;
        }

        if let Err(e) = core.append(session_id, mem::take(&mut run), None, signature, Verification::Skip) {
            fail_tail(id, session, available, format!("chain rejected: {}", e), None);
            return SessionVerify::Failed;
        }
        for slot in &mut session.transactions[session.verified as usize..=index as usize] {
            slot.state = TxState::Verified {
                validity: Validity::Unknown,
                decryption: DecryptionState::NotDecrypted,
            };
        }
        session.verified = index + 1;
        session.hash = hash.clone();
    }

    match session.verified - start {
        0 => SessionVerify::Idle,
        n => SessionVerify::Advanced(n),
    }
}

fn fail_tail(
    id: &RawCoID,
    session: &mut SessionEntry,
    available: u32,
    reason: String,
    offending: Option<(u32, coweave_core::Hash)>,
) {
    warn!(
        id = %id,
        from = session.verified,
        to = available,
        reason = %reason,
        "verification failed"
    );
    for index in session.verified..available {
        let hash = offending.filter(|(at, _)| *at == index).map(|(_, hash)| hash);
        session.transactions[index as usize].state = TxState::VerificationFailed {
            reason: reason.clone(),
            hash,
        };
    }
}

//! Accounts and local writer identities.
//!
//! An account is a group-ruleset CoMap (meta `{"type": "account"}`) whose
//! initial admin is its agent. Sessions opened in an account's name are
//! signed by that agent, so verifying them means reading the account's
//! content to find the agent.

use serde_json::json;

use coweave_core::{
    ActorID, AgentID, AgentSecret, CoValueCore, CoValueHeader, CoValueType, Privacy, RawCoID,
    ResolveAccountAgentError, Ruleset, SessionID,
};

use crate::error::Result;
use crate::group::{GroupSource, MapOp, Role};
use crate::make::make_transaction;

/// Who is writing locally: the actor named in session ids, the agent that
/// signs, and the session used for this process.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub actor: ActorID,
    pub agent: AgentSecret,
    pub session: SessionID,
}

impl LocalIdentity {
    /// Write as a bare agent.
    pub fn for_agent(agent: AgentSecret) -> Self {
        let actor = ActorID::Agent(agent.agent_id());
        Self {
            session: SessionID::random(&actor),
            actor,
            agent,
        }
    }

    /// Write in an account's name, signing with its agent.
    pub fn for_account(account: RawCoID, agent: AgentSecret) -> Self {
        let actor = ActorID::Account(account);
        Self {
            session: SessionID::random(&actor),
            actor,
            agent,
        }
    }

    /// The same actor in a fresh session.
    pub fn new_session(&self) -> Self {
        Self {
            actor: self.actor,
            agent: self.agent.clone(),
            session: SessionID::random(&self.actor),
        }
    }

    /// Actors this identity reads as: the actor itself and, for accounts,
    /// the agent behind it.
    pub fn reader_actors(&self) -> Vec<ActorID> {
        let agent = ActorID::Agent(self.agent.agent_id());
        if self.actor == agent {
            vec![agent]
        } else {
            vec![self.actor, agent]
        }
    }
}

/// Create an account for `agent`. Returns the account core and an identity
/// writing in the account's name.
pub fn create_account(agent: AgentSecret, made_at: u64) -> Result<(CoValueCore, LocalIdentity)> {
    let agent_actor = ActorID::Agent(agent.agent_id());
    let header = CoValueHeader::new(
        CoValueType::Comap,
        Ruleset::Group {
            initial_admin: agent_actor,
        },
    )
    .with_meta(json!({"type": "account"}))
    .with_created_at(made_at);
    let mut core = CoValueCore::new(header);

    let bootstrap = LocalIdentity::for_agent(agent.clone());
    let changes = vec![MapOp::set(agent_actor.to_string(), Role::Admin.as_str()).to_json()?];
    make_transaction(&mut core, &bootstrap, &changes, Privacy::Trusting, None, made_at)?;

    let identity = LocalIdentity::for_account(core.id(), agent);
    Ok((core, identity))
}

/// Resolve the single agent that signs for an account.
///
/// Zero admin agents and several admin agents are both errors; the choice
/// between them is never guessed.
pub fn resolve_account_agent(
    groups: &dyn GroupSource,
    account: &RawCoID,
) -> std::result::Result<AgentID, ResolveAccountAgentError> {
    let content = groups
        .group(account)
        .filter(|c| c.is_account())
        .ok_or(ResolveAccountAgentError::AccountNotLoaded(*account))?;

    let agents = content.admin_agents();
    match agents.as_slice() {
        [] => Err(ResolveAccountAgentError::NoAgent(*account)),
        [agent] => Ok(*agent),
        several => Err(ResolveAccountAgentError::Ambiguous(*account, several.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{add_member, Directory};
    use coweave_core::{SignerResolver, Transaction, Verification};

    #[test]
    fn test_account_resolves_to_its_agent() {
        let agent = AgentSecret::from_seed(&[1; 32]);
        let (core, identity) = create_account(agent.clone(), 1).unwrap();
        assert!(core.header().is_account());
        assert_eq!(identity.actor, ActorID::Account(core.id()));

        let mut directory = Directory::new();
        directory.refresh(&core).unwrap();
        assert_eq!(directory.resolve_account_agent(&core.id()).unwrap(), agent.agent_id());
    }

    #[test]
    fn test_unknown_account_is_not_loaded() {
        let directory = Directory::new();
        assert_eq!(
            directory.resolve_account_agent(&RawCoID([1; 20])),
            Err(ResolveAccountAgentError::AccountNotLoaded(RawCoID([1; 20])))
        );
    }

    #[test]
    fn test_two_admin_agents_are_ambiguous() {
        let agent = AgentSecret::from_seed(&[1; 32]);
        let second = AgentSecret::from_seed(&[2; 32]);
        let (mut core, _) = create_account(agent.clone(), 1).unwrap();
        let admin = LocalIdentity::for_agent(agent);
        let second_actor = ActorID::Agent(second.agent_id());
        let read_key = (coweave_core::KeyID([0; 16]), crate::crypto::KeySecret::generate());
        add_member(
            &mut core,
            &admin,
            &second_actor,
            &second.agent_id(),
            Role::Admin,
            (&read_key.0, &read_key.1),
            2,
        )
        .unwrap();

        let mut directory = Directory::new();
        directory.refresh(&core).unwrap();
        assert_eq!(
            directory.resolve_account_agent(&core.id()),
            Err(ResolveAccountAgentError::Ambiguous(core.id(), 2))
        );
    }

    #[test]
    fn test_account_session_verifies_through_directory() {
        let agent = AgentSecret::from_seed(&[1; 32]);
        let (account, identity) = create_account(agent.clone(), 1).unwrap();
        let mut directory = Directory::new();
        directory.refresh(&account).unwrap();

        let mut source = CoValueCore::new(CoValueHeader::new(CoValueType::Comap, Ruleset::UnsafeAllowAll));
        let txs = vec![Transaction::trusting(1, "[]")];
        let hash = source.expected_hash_after(&identity.session, &txs);
        source
            .append(
                &identity.session,
                txs,
                Some(&hash),
                agent.signer.sign(&hash),
                Verification::Verify(&directory),
            )
            .unwrap();
    }
}

//! Group content: roles, key revelations and parent groups.
//!
//! A group is a CoMap whose ops are applied in canonical transaction order.
//! An op only takes effect when its author may make it, so a group's
//! materialized content is already permission-filtered.
//!
//! Keys used in group content:
//! - `<actorID>` -> role
//! - `everyone` -> role for all actors
//! - `readKey` -> current [`KeyID`]
//! - `<keyID>_for_<actorID>` -> key sealed for that actor
//! - `<keyID>_for_everyone` -> plaintext key secret
//! - `<keyID>_for_<keyID>` -> key wrapped under another key
//! - `parent_<groupID>` -> `"extend"`

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use coweave_core::{
    ActorID, AgentID, CoValueCore, CoValueHeader, CoValueType, Hash, KeyID, Privacy, RawCoID,
    Ruleset, SignerResolver, Transaction, TransactionID,
};

use crate::account::LocalIdentity;
use crate::crypto::{wrap_key_secret, KeySecret};
use crate::error::{KeysError, Result};
use crate::keyshare::{seal_key, SealContext};
use crate::make::make_transaction;
use crate::view::compare_transactions;

/// Key holding the current read key id.
pub const READ_KEY: &str = "readKey";
/// Key holding the role granted to everyone.
pub const EVERYONE: &str = "everyone";
const PARENT_PREFIX: &str = "parent_";
const FOR: &str = "_for_";

/// A member's role in a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Admin,
    Writer,
    Reader,
    WriteOnly,
    Revoked,
}

impl Role {
    /// Precedence used when combining own and inherited roles.
    fn rank(self) -> u8 {
        match self {
            Role::Admin => 4,
            Role::Writer => 3,
            Role::WriteOnly => 2,
            Role::Reader => 1,
            Role::Revoked => 0,
        }
    }

    /// Check if the role may author transactions in owned values.
    pub fn can_write(self) -> bool {
        matches!(self, Role::Admin | Role::Writer | Role::WriteOnly)
    }

    /// Check if the role may read owned values.
    pub fn can_read(self) -> bool {
        matches!(self, Role::Admin | Role::Writer | Role::Reader)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Writer => "writer",
            Role::Reader => "reader",
            Role::WriteOnly => "writeOnly",
            Role::Revoked => "revoked",
        }
    }

    fn from_json(value: &JsonValue) -> Option<Self> {
        value.as_str().and_then(|s| s.parse().ok())
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = KeysError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "admin" => Ok(Role::Admin),
            "writer" => Ok(Role::Writer),
            "reader" => Ok(Role::Reader),
            "writeOnly" => Ok(Role::WriteOnly),
            "revoked" => Ok(Role::Revoked),
            other => Err(KeysError::InvalidChanges(format!("unknown role {}", other))),
        }
    }
}

/// One CoMap change operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum MapOp {
    Set { key: String, value: JsonValue },
    Del { key: String },
}

impl MapOp {
    pub fn set(key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        MapOp::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        MapOp::Del { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            MapOp::Set { key, .. } | MapOp::Del { key } => key,
        }
    }

    /// As a JSON change, ready for [`make_transaction`].
    pub fn to_json(&self) -> Result<JsonValue> {
        Ok(serde_json::to_value(self)?)
    }
}

/// The latest value of a group key and who set it.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupEntry {
    pub value: JsonValue,
    pub author: ActorID,
    pub by: TransactionID,
}

/// Materialized content of a group (or account).
#[derive(Debug, Clone)]
pub struct GroupContent {
    id: RawCoID,
    initial_admin: ActorID,
    is_account: bool,
    entries: BTreeMap<String, GroupEntry>,
}

impl GroupContent {
    /// Replay a group's transactions in canonical order.
    ///
    /// Private transactions and malformed changes are skipped. Ops whose
    /// author lacks permission are ignored.
    pub fn materialize(core: &CoValueCore) -> Result<Self> {
        let initial_admin = match &core.header().ruleset {
            Ruleset::Group { initial_admin } => *initial_admin,
            other => {
                return Err(KeysError::PermissionDenied(format!(
                    "{} is not a group: {:?}",
                    core.id(),
                    other
                )))
            }
        };

        let mut content = Self {
            id: core.id(),
            initial_admin,
            is_account: core.header().is_account(),
            entries: BTreeMap::new(),
        };

        let mut txs: Vec<(TransactionID, &Transaction)> = core.transactions().collect();
        txs.sort_by(|a, b| compare_transactions((a.1.made_at(), &a.0), (b.1.made_at(), &b.0)));

        for (tx_id, tx) in txs {
            let Transaction::Trusting { changes, .. } = tx else {
                debug!(group = %content.id, tx = %tx_id, "skipping private group transaction");
                continue;
            };
            let Ok(author) = tx_id.session_id.actor() else {
                continue;
            };
            let Ok(ops) = serde_json::from_str::<Vec<MapOp>>(changes) else {
                debug!(group = %content.id, tx = %tx_id, "skipping malformed group changes");
                continue;
            };
            for op in ops {
                content.apply(&author, &tx_id, op);
            }
        }

        Ok(content)
    }

    fn apply(&mut self, author: &ActorID, tx_id: &TransactionID, op: MapOp) {
        let value = match &op {
            MapOp::Set { value, .. } => Some(value),
            MapOp::Del { .. } => None,
        };
        if !self.can_apply(author, op.key(), value) {
            debug!(group = %self.id, author = %author, key = op.key(), "ignoring unauthorized op");
            return;
        }
        match op {
            MapOp::Set { key, value } => {
                self.entries.insert(
                    key,
                    GroupEntry {
                        value,
                        author: *author,
                        by: tx_id.clone(),
                    },
                );
            }
            MapOp::Del { key } => {
                self.entries.remove(&key);
            }
        }
    }

    fn can_apply(&self, author: &ActorID, key: &str, value: Option<&JsonValue>) -> bool {
        let role = self.role_of(author);
        if role == Some(Role::Admin) {
            return true;
        }

        let author_text = author.to_string();
        if *author == self.initial_admin
            && key == author_text
            && value.and_then(|v| v.as_str()) == Some("admin")
        {
            return true;
        }

        if let Some((_, target)) = key.split_once(FOR) {
            if target == author_text && role.map_or(false, Role::can_read) {
                return true;
            }
        }

        false
    }

    pub fn id(&self) -> RawCoID {
        self.id
    }

    pub fn initial_admin(&self) -> &ActorID {
        &self.initial_admin
    }

    pub fn is_account(&self) -> bool {
        self.is_account
    }

    pub fn get(&self, key: &str) -> Option<&GroupEntry> {
        self.entries.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(|e| e.value.as_str())
    }

    /// All entries in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &GroupEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Entries whose key starts with `prefix`.
    pub fn entries_with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a GroupEntry)> + 'a {
        self.entries
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_str(), v))
    }

    /// Own role of an actor: direct entry, else the everyone role.
    pub fn role_of(&self, actor: &ActorID) -> Option<Role> {
        self.get(&actor.to_string())
            .and_then(|e| Role::from_json(&e.value))
            .or_else(|| self.everyone_role())
    }

    /// Role granted to everyone, if any.
    pub fn everyone_role(&self) -> Option<Role> {
        self.get(EVERYONE)
            .and_then(|e| Role::from_json(&e.value))
            .filter(|r| *r != Role::Admin)
    }

    /// The current read key id.
    pub fn read_key_id(&self) -> Option<KeyID> {
        self.get_str(READ_KEY).and_then(|s| s.parse().ok())
    }

    /// Groups this group extends.
    pub fn parent_groups(&self) -> Vec<RawCoID> {
        self.entries_with_prefix(PARENT_PREFIX)
            .filter(|(_, e)| e.value.as_str() == Some("extend"))
            .filter_map(|(k, _)| k[PARENT_PREFIX.len()..].parse().ok())
            .collect()
    }

    /// Members with an explicit role, in key order.
    pub fn members(&self) -> Vec<(ActorID, Role)> {
        self.entries
            .iter()
            .filter_map(|(k, e)| {
                let actor = k.parse::<ActorID>().ok()?;
                Some((actor, Role::from_json(&e.value)?))
            })
            .collect()
    }

    /// Agents holding the admin role, used to resolve an account's signer.
    pub fn admin_agents(&self) -> Vec<AgentID> {
        self.members()
            .into_iter()
            .filter(|(_, role)| *role == Role::Admin)
            .filter_map(|(actor, _)| actor.as_agent().copied())
            .collect()
    }

    /// Role including roles inherited through parent groups.
    ///
    /// Own roles win over inherited ones only when higher; `revoked` set
    /// directly on this group blocks inheritance.
    pub fn role_including_parents(&self, actor: &ActorID, groups: &dyn GroupSource) -> Option<Role> {
        self.role_with_depth(actor, groups, 0)
    }

    fn role_with_depth(&self, actor: &ActorID, groups: &dyn GroupSource, depth: usize) -> Option<Role> {
        let own = self.role_of(actor);
        if own == Some(Role::Revoked) || depth >= MAX_GROUP_DEPTH {
            return own;
        }
        self.parent_groups()
            .iter()
            .filter_map(|parent| groups.group(parent))
            .filter_map(|parent| parent.role_with_depth(actor, groups, depth + 1))
            .chain(own)
            .max_by_key(|r| r.rank())
    }
}

/// Bound on group nesting and key-resolution recursion.
pub const MAX_GROUP_DEPTH: usize = 16;

/// Lookup of materialized groups by id.
pub trait GroupSource {
    fn group(&self, id: &RawCoID) -> Option<&GroupContent>;
}

/// A set of materialized groups and accounts.
#[derive(Debug, Default, Clone)]
pub struct Directory {
    groups: BTreeMap<RawCoID, GroupContent>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a group's content.
    pub fn insert(&mut self, content: GroupContent) {
        self.groups.insert(content.id(), content);
    }

    /// Materialize a group from its core and insert it.
    pub fn refresh(&mut self, core: &CoValueCore) -> Result<()> {
        self.insert(GroupContent::materialize(core)?);
        Ok(())
    }

    pub fn contains(&self, id: &RawCoID) -> bool {
        self.groups.contains_key(id)
    }
}

impl GroupSource for Directory {
    fn group(&self, id: &RawCoID) -> Option<&GroupContent> {
        self.groups.get(id)
    }
}

impl SignerResolver for Directory {
    fn resolve_account_agent(
        &self,
        account: &RawCoID,
    ) -> std::result::Result<AgentID, coweave_core::ResolveAccountAgentError> {
        crate::account::resolve_account_agent(self, account)
    }
}

/// Sealer-carrying identity of an actor: agents directly, accounts resolved.
fn agent_of(actor: &ActorID, accounts: &dyn SignerResolver) -> Result<AgentID> {
    match actor {
        ActorID::Agent(agent) => Ok(*agent),
        ActorID::Account(account) => accounts
            .resolve_account_agent(account)
            .map_err(|e| KeysError::PermissionDenied(e.to_string())),
    }
}

fn reveal_to(
    group: &RawCoID,
    identity: &LocalIdentity,
    key_id: &KeyID,
    secret: &KeySecret,
    recipient: &ActorID,
    recipient_agent: &AgentID,
) -> Result<MapOp> {
    let recipient_text = recipient.to_string();
    let sealed = seal_key(
        secret,
        &identity.agent.sealer,
        &recipient_agent.sealer,
        SealContext {
            group,
            key_id,
            recipient: &recipient_text,
        },
    )?;
    Ok(MapOp::set(format!("{}{}{}", key_id, FOR, recipient_text), sealed))
}

fn write_ops(core: &mut CoValueCore, identity: &LocalIdentity, ops: &[MapOp], made_at: u64) -> Result<Hash> {
    let changes = ops.iter().map(MapOp::to_json).collect::<Result<Vec<_>>>()?;
    make_transaction(core, identity, &changes, Privacy::Trusting, None, made_at)
}

/// Create a group administered by `identity`, with a fresh read key.
pub fn create_group(identity: &LocalIdentity, made_at: u64) -> Result<(CoValueCore, KeyID, KeySecret)> {
    let header = CoValueHeader::new(
        CoValueType::Comap,
        Ruleset::Group {
            initial_admin: identity.actor,
        },
    )
    .with_created_at(made_at);
    let mut core = CoValueCore::new(header);

    let key_id = KeyID::random();
    let secret = KeySecret::generate();
    let own_agent = identity.agent.agent_id();
    let ops = vec![
        MapOp::set(identity.actor.to_string(), Role::Admin.as_str()),
        reveal_to(&core.id(), identity, &key_id, &secret, &identity.actor, &own_agent)?,
        MapOp::set(READ_KEY, key_id.to_string()),
    ];
    write_ops(&mut core, identity, &ops, made_at)?;
    Ok((core, key_id, secret))
}

/// Give `member` a role and reveal the current read key to it.
///
/// `revoked` and `writeOnly` members get no key.
pub fn add_member(
    core: &mut CoValueCore,
    identity: &LocalIdentity,
    member: &ActorID,
    member_agent: &AgentID,
    role: Role,
    read_key: (&KeyID, &KeySecret),
    made_at: u64,
) -> Result<Hash> {
    let mut ops = vec![MapOp::set(member.to_string(), role.as_str())];
    if role.can_read() {
        let (key_id, secret) = read_key;
        ops.push(reveal_to(&core.id(), identity, key_id, secret, member, member_agent)?);
    }
    write_ops(core, identity, &ops, made_at)
}

/// Grant a role to everyone. Readable roles publish the read key in plaintext.
pub fn add_everyone(
    core: &mut CoValueCore,
    identity: &LocalIdentity,
    role: Role,
    read_key: (&KeyID, &KeySecret),
    made_at: u64,
) -> Result<Hash> {
    if role == Role::Admin {
        return Err(KeysError::PermissionDenied("everyone cannot be admin".into()));
    }
    let mut ops = vec![MapOp::set(EVERYONE, role.as_str())];
    if role.can_read() {
        let (key_id, secret) = read_key;
        ops.push(MapOp::set(format!("{}{}{}", key_id, FOR, EVERYONE), secret.to_string()));
    }
    write_ops(core, identity, &ops, made_at)
}

/// Make `child` extend `parent`: parent members inherit roles and can reach
/// the child's read key through the parent's key.
pub fn extend_parent(
    child: &mut CoValueCore,
    identity: &LocalIdentity,
    parent: &RawCoID,
    child_key: (&KeyID, &KeySecret),
    parent_key: (&KeyID, &KeySecret),
    made_at: u64,
) -> Result<Hash> {
    let (child_id, child_secret) = child_key;
    let (parent_id, parent_secret) = parent_key;
    let wrapped = wrap_key_secret(child_secret, child_id, parent_secret, parent_id)?;
    let ops = vec![
        MapOp::set(format!("{}{}", PARENT_PREFIX, parent), "extend"),
        MapOp::set(format!("{}{}{}", child_id, FOR, parent_id), wrapped),
    ];
    write_ops(child, identity, &ops, made_at)
}

/// Replace the group's read key.
///
/// The new key is revealed to every member that can read (and to everyone,
/// if the everyone role can read), the previous key is wrapped under the new
/// one so history stays readable, and `readKey` moves to the new key.
pub fn rotate_read_key(
    core: &mut CoValueCore,
    identity: &LocalIdentity,
    accounts: &dyn SignerResolver,
    previous: (&KeyID, &KeySecret),
    made_at: u64,
) -> Result<(KeyID, KeySecret)> {
    let content = GroupContent::materialize(core)?;
    let new_id = KeyID::random();
    let new_secret = KeySecret::generate();
    let group = core.id();

    let mut ops = Vec::new();
    for (member, role) in content.members() {
        if !role.can_read() {
            continue;
        }
        let agent = match agent_of(&member, accounts) {
            Ok(agent) => agent,
            Err(e) => {
                debug!(group = %group, member = %member, error = %e, "member skipped in rotation");
                continue;
            }
        };
        ops.push(reveal_to(&group, identity, &new_id, &new_secret, &member, &agent)?);
    }
    if content.everyone_role().map_or(false, Role::can_read) {
        ops.push(MapOp::set(format!("{}{}{}", new_id, FOR, EVERYONE), new_secret.to_string()));
    }

    let (previous_id, previous_secret) = previous;
    ops.push(MapOp::set(
        format!("{}{}{}", previous_id, FOR, new_id),
        wrap_key_secret(previous_secret, previous_id, &new_secret, &new_id)?,
    ));
    ops.push(MapOp::set(READ_KEY, new_id.to_string()));

    write_ops(core, identity, &ops, made_at)?;
    Ok((new_id, new_secret))
}

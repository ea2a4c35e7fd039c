//! Transaction-level permission checks.

use std::collections::BTreeSet;

use coweave_core::{ActorID, CoValueHeader, RawCoID, Ruleset, SessionID};

use crate::group::GroupSource;

/// Whether a transaction by `author` counts in a value with this header.
///
/// - `unsafeAllowAll`: always.
/// - `group`: always at this level; ops are filtered when the group is
///   materialized.
/// - `ownedByGroup`: the author's role in the owning group, including the
///   everyone role and parent groups, must allow writing. An owning group
///   that is not loaded yet admits nothing.
pub fn is_author_permitted(header: &CoValueHeader, author: &ActorID, groups: &dyn GroupSource) -> bool {
    match &header.ruleset {
        Ruleset::UnsafeAllowAll | Ruleset::Group { .. } => true,
        Ruleset::OwnedByGroup { group } => groups
            .group(group)
            .and_then(|content| content.role_including_parents(author, groups))
            .map_or(false, |role| role.can_write()),
    }
}

/// CoValues that must be loaded before the content of `id` can be verified
/// and validated: the owning group, the accounts signing its sessions and,
/// once `id` is a materialized group, its parents and member accounts.
pub fn dependencies<'a>(
    id: &RawCoID,
    header: &CoValueHeader,
    sessions: impl IntoIterator<Item = &'a SessionID>,
    groups: &dyn GroupSource,
) -> BTreeSet<RawCoID> {
    let mut deps = BTreeSet::new();
    if let Some(group) = header.ruleset.owning_group() {
        deps.insert(*group);
    }
    for session in sessions {
        if let Ok(ActorID::Account(account)) = session.actor() {
            deps.insert(account);
        }
    }
    if let Some(group) = groups.group(id) {
        deps.extend(group.parent_groups());
        deps.extend(group.members().into_iter().filter_map(|(member, _)| match member {
            ActorID::Account(account) => Some(account),
            ActorID::Agent(_) => None,
        }));
    }
    deps.remove(id);
    deps
}

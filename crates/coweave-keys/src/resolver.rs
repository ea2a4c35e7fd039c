//! Read-key resolution through the group graph.
//!
//! A key is found, in order, by:
//! 1. a `<keyID>_for_everyone` revelation,
//! 2. a revelation sealed to the reader (its account or its agent),
//! 3. a `<keyID>_for_<otherKeyID>` wrapping, resolving the other key first,
//! 4. the same wrapping resolved against a parent group's keys.
//!
//! Resolved secrets are cached per owning group in [`KeyCaches`], which the
//! caller owns and passes in. Misses are only remembered for the lifetime of
//! one [`KeyResolver`], since a revelation may arrive later, and only for
//! searches that ran to completion. A search cut off by a cycle or by
//! [`MAX_GROUP_DEPTH`] may succeed from another starting point.

use std::collections::{HashMap, HashSet};
use tracing::debug;

use coweave_core::{ActorID, AgentID, KeyID, RawCoID, SignerResolver};

use crate::account::LocalIdentity;
use crate::crypto::{unwrap_key_secret, KeySecret};
use crate::group::{GroupContent, GroupSource, EVERYONE, MAX_GROUP_DEPTH};
use crate::keyshare::{unseal_key, SealContext};

/// Resolved secrets of one group.
#[derive(Debug, Default, Clone)]
pub struct KeyCache {
    secrets: HashMap<KeyID, KeySecret>,
    decryptions: u64,
}

impl KeyCache {
    pub fn get(&self, key_id: &KeyID) -> Option<&KeySecret> {
        self.secrets.get(key_id)
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Unseal and unwrap operations performed to fill this cache.
    pub fn decryptions(&self) -> u64 {
        self.decryptions
    }
}

/// Key caches for every group a node has resolved keys in.
#[derive(Debug, Default, Clone)]
pub struct KeyCaches {
    by_group: HashMap<RawCoID, KeyCache>,
}

impl KeyCaches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group(&self, group: &RawCoID) -> Option<&KeyCache> {
        self.by_group.get(group)
    }

    /// Seed a secret known out of band, e.g. one the local writer created.
    pub fn insert(&mut self, group: RawCoID, key_id: KeyID, secret: KeySecret) {
        self.by_group
            .entry(group)
            .or_default()
            .secrets
            .insert(key_id, secret);
    }

    fn count_decryption(&mut self, group: &RawCoID) {
        self.by_group.entry(*group).or_default().decryptions += 1;
    }
}

/// One resolution session over a fixed view of the group graph.
pub struct KeyResolver<'a> {
    groups: &'a dyn GroupSource,
    accounts: &'a dyn SignerResolver,
    reader: Option<&'a LocalIdentity>,
    caches: &'a mut KeyCaches,
    misses: HashSet<(RawCoID, KeyID)>,
    in_progress: HashSet<(RawCoID, KeyID)>,
    /// The current search hit a cycle or the depth limit.
    cut_short: bool,
}

impl<'a> KeyResolver<'a> {
    pub fn new(
        groups: &'a dyn GroupSource,
        accounts: &'a dyn SignerResolver,
        reader: Option<&'a LocalIdentity>,
        caches: &'a mut KeyCaches,
    ) -> Self {
        Self {
            groups,
            accounts,
            reader,
            caches,
            misses: HashSet::new(),
            in_progress: HashSet::new(),
            cut_short: false,
        }
    }

    /// Resolve `key_id` in `group`. `None` means not (yet) authorized.
    pub fn read_key(&mut self, group: &RawCoID, key_id: &KeyID) -> Option<KeySecret> {
        self.resolve(group, key_id, 0)
    }

    /// Resolve the group's current read key.
    pub fn current_read_key(&mut self, group: &RawCoID) -> Option<(KeyID, KeySecret)> {
        let key_id = self.groups.group(group)?.read_key_id()?;
        let secret = self.read_key(group, &key_id)?;
        Some((key_id, secret))
    }

    fn resolve(&mut self, group_id: &RawCoID, key_id: &KeyID, depth: usize) -> Option<KeySecret> {
        if let Some(secret) = self.caches.group(group_id).and_then(|c| c.get(key_id)) {
            return Some(secret.clone());
        }
        let slot = (*group_id, *key_id);
        if self.misses.contains(&slot) {
            return None;
        }
        if depth > MAX_GROUP_DEPTH || !self.in_progress.insert(slot) {
            self.cut_short = true;
            return None;
        }

        let outer_cut_short = std::mem::take(&mut self.cut_short);
        let groups = self.groups;
        let found = groups.group(group_id).and_then(|group| {
            self.for_everyone(group, key_id)
                .or_else(|| self.for_reader(group, key_id))
                .or_else(|| self.via_wrapping(group, key_id, depth))
        });
        self.in_progress.remove(&slot);

        match &found {
            Some(secret) => {
                self.caches.insert(*group_id, *key_id, secret.clone());
                self.cut_short = false;
            }
            None if self.cut_short => {
                debug!(group = %group_id, key = %key_id, "read key search cut short")
            }
            None => {
                debug!(group = %group_id, key = %key_id, "read key not resolvable");
                self.misses.insert(slot);
            }
        }
        self.cut_short |= outer_cut_short;
        found
    }

    fn for_everyone(&mut self, group: &GroupContent, key_id: &KeyID) -> Option<KeySecret> {
        group
            .get_str(&format!("{}_for_{}", key_id, EVERYONE))
            .and_then(|s| s.parse().ok())
    }

    fn revealer_agent(&self, author: &ActorID) -> Option<AgentID> {
        match author {
            ActorID::Agent(agent) => Some(*agent),
            ActorID::Account(account) => self.accounts.resolve_account_agent(account).ok(),
        }
    }

    fn for_reader(&mut self, group: &GroupContent, key_id: &KeyID) -> Option<KeySecret> {
        let reader = self.reader?;
        for actor in reader.reader_actors() {
            let recipient = actor.to_string();
            let Some(entry) = group.get(&format!("{}_for_{}", key_id, recipient)) else {
                continue;
            };
            let (Some(sealed), Some(revealer)) = (entry.value.as_str(), self.revealer_agent(&entry.author))
            else {
                continue;
            };
            let group_id = group.id();
            let context = SealContext {
                group: &group_id,
                key_id,
                recipient: &recipient,
            };
            self.caches.count_decryption(&group_id);
            match unseal_key(sealed, &reader.agent.sealer, &revealer.sealer, context) {
                Ok(secret) => return Some(secret),
                Err(e) => debug!(group = %group_id, key = %key_id, error = %e, "unseal failed"),
            }
        }
        None
    }

    /// Follow `<keyID>_for_<otherKeyID>` entries, resolving the other key in
    /// this group first and then in each parent group.
    fn via_wrapping(&mut self, group: &GroupContent, key_id: &KeyID, depth: usize) -> Option<KeySecret> {
        let prefix = format!("{}_for_key_z", key_id);
        let wrappings: Vec<(KeyID, String)> = group
            .entries_with_prefix(&prefix)
            .filter_map(|(k, e)| {
                let wrapping_id = k.split_once("_for_")?.1.parse().ok()?;
                Some((wrapping_id, e.value.as_str()?.to_string()))
            })
            .collect();
        if wrappings.is_empty() {
            return None;
        }

        let mut holders = vec![group.id()];
        holders.extend(group.parent_groups());

        for holder in holders {
            for (wrapping_id, wrapped) in &wrappings {
                let Some(wrapping) = self.resolve(&holder, wrapping_id, depth + 1) else {
                    continue;
                };
                self.caches.count_decryption(&group.id());
                match unwrap_key_secret(wrapped, key_id, &wrapping, wrapping_id) {
                    Ok(secret) => return Some(secret),
                    Err(e) => debug!(group = %group.id(), key = %key_id, error = %e, "unwrap failed"),
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{add_everyone, add_member, create_group, extend_parent, rotate_read_key, Directory, Role};
    use coweave_core::{AgentSecret, NoAccounts};

    fn identity(seed: u8) -> LocalIdentity {
        LocalIdentity::for_agent(AgentSecret::from_seed(&[seed; 32]))
    }

    #[test]
    fn test_everyone_revelation() {
        let alice = identity(1);
        let (mut core, key_id, secret) = create_group(&alice, 1).unwrap();
        add_everyone(&mut core, &alice, Role::Reader, (&key_id, &secret), 2).unwrap();
        let mut directory = Directory::new();
        directory.refresh(&core).unwrap();

        let mut caches = KeyCaches::new();
        let mut resolver = KeyResolver::new(&directory, &NoAccounts, None, &mut caches);
        assert_eq!(resolver.read_key(&core.id(), &key_id), Some(secret));
    }

    #[test]
    fn test_sealed_revelation_to_member() {
        let alice = identity(1);
        let bob = identity(2);
        let carol = identity(3);
        let (mut core, key_id, secret) = create_group(&alice, 1).unwrap();
        add_member(&mut core, &alice, &bob.actor, &bob.agent.agent_id(), Role::Reader, (&key_id, &secret), 2)
            .unwrap();
        let mut directory = Directory::new();
        directory.refresh(&core).unwrap();

        let mut caches = KeyCaches::new();
        let mut resolver = KeyResolver::new(&directory, &NoAccounts, Some(&bob), &mut caches);
        assert_eq!(resolver.read_key(&core.id(), &key_id), Some(secret));

        let mut caches = KeyCaches::new();
        let mut resolver = KeyResolver::new(&directory, &NoAccounts, Some(&carol), &mut caches);
        assert_eq!(resolver.read_key(&core.id(), &key_id), None);
    }

    #[test]
    fn test_second_resolution_is_a_cache_hit() {
        let alice = identity(1);
        let (core, key_id, secret) = create_group(&alice, 1).unwrap();
        let mut directory = Directory::new();
        directory.refresh(&core).unwrap();

        let mut caches = KeyCaches::new();
        let first = KeyResolver::new(&directory, &NoAccounts, Some(&alice), &mut caches)
            .read_key(&core.id(), &key_id);
        let work = caches.group(&core.id()).map(KeyCache::decryptions);

        let second = KeyResolver::new(&directory, &NoAccounts, Some(&alice), &mut caches)
            .read_key(&core.id(), &key_id);
        assert_eq!(first, Some(secret.clone()));
        assert_eq!(second, Some(secret));
        assert_eq!(caches.group(&core.id()).map(KeyCache::decryptions), work);
    }

    #[test]
    fn test_rotated_history_stays_readable() {
        let alice = identity(1);
        let bob = identity(2);
        let (mut core, first_id, first_secret) = create_group(&alice, 1).unwrap();
        add_member(&mut core, &alice, &bob.actor, &bob.agent.agent_id(), Role::Reader, (&first_id, &first_secret), 2)
            .unwrap();
        let (second_id, second_secret) =
            rotate_read_key(&mut core, &alice, &NoAccounts, (&first_id, &first_secret), 3).unwrap();
        let (third_id, _) =
            rotate_read_key(&mut core, &alice, &NoAccounts, (&second_id, &second_secret), 4).unwrap();

        let mut directory = Directory::new();
        directory.refresh(&core).unwrap();
        let mut caches = KeyCaches::new();
        let mut resolver = KeyResolver::new(&directory, &NoAccounts, Some(&bob), &mut caches);
        assert!(resolver.read_key(&core.id(), &third_id).is_some());
        assert_eq!(resolver.read_key(&core.id(), &first_id), Some(first_secret));
    }

    #[test]
    fn test_parent_group_members_reach_child_key() {
        let alice = identity(1);
        let bob = identity(2);
        let (mut parent, parent_key, parent_secret) = create_group(&alice, 1).unwrap();
        add_member(&mut parent, &alice, &bob.actor, &bob.agent.agent_id(), Role::Reader, (&parent_key, &parent_secret), 2)
            .unwrap();
        let (mut child, child_key, child_secret) = create_group(&alice, 3).unwrap();
        extend_parent(&mut child, &alice, &parent.id(), (&child_key, &child_secret), (&parent_key, &parent_secret), 4)
            .unwrap();

        let mut directory = Directory::new();
        directory.refresh(&parent).unwrap();
        directory.refresh(&child).unwrap();
        let mut caches = KeyCaches::new();
        let mut resolver = KeyResolver::new(&directory, &NoAccounts, Some(&bob), &mut caches);
        assert_eq!(resolver.read_key(&child.id(), &child_key), Some(child_secret));
    }

    #[test]
    fn test_self_referential_wrapping_terminates() {
        use crate::crypto::wrap_key_secret;
        use crate::group::MapOp;
        use crate::make::make_transaction;
        use coweave_core::Privacy;

        let alice = identity(1);
        let (mut core, _, _) = create_group(&alice, 1).unwrap();
        let (a, b) = (KeyID::random(), KeyID::random());
        let junk = wrap_key_secret(&KeySecret::generate(), &a, &KeySecret::generate(), &b).unwrap();
        let ops = vec![
            MapOp::set(format!("{}_for_{}", a, b), junk.clone()).to_json().unwrap(),
            MapOp::set(format!("{}_for_{}", b, a), junk).to_json().unwrap(),
        ];
        make_transaction(&mut core, &alice, &ops, Privacy::Trusting, None, 2).unwrap();

        let mut directory = Directory::new();
        directory.refresh(&core).unwrap();
        let mut caches = KeyCaches::new();
        let mut resolver = KeyResolver::new(&directory, &NoAccounts, None, &mut caches);
        assert_eq!(resolver.read_key(&core.id(), &a), None);
    }

    #[test]
    fn test_cycle_does_not_memoize_a_miss() {
        use crate::crypto::wrap_key_secret;
        use crate::group::MapOp;
        use crate::make::make_transaction;
        use coweave_core::Privacy;

        // `a` is tried through `b` first, and `b` only through `a`.
        let alice = identity(1);
        let (mut core, _, _) = create_group(&alice, 1).unwrap();
        let (a, b, c) = (KeyID([9; 16]), KeyID([1; 16]), KeyID([2; 16]));
        let (a_secret, b_secret, c_secret) = (KeySecret::generate(), KeySecret::generate(), KeySecret::generate());
        let ops = vec![
            MapOp::set(format!("{}_for_{}", a, b), wrap_key_secret(&a_secret, &a, &b_secret, &b).unwrap()),
            MapOp::set(format!("{}_for_{}", a, c), wrap_key_secret(&a_secret, &a, &c_secret, &c).unwrap()),
            MapOp::set(format!("{}_for_{}", b, a), wrap_key_secret(&b_secret, &b, &a_secret, &a).unwrap()),
            MapOp::set(format!("{}_for_{}", c, EVERYONE), c_secret.to_string()),
        ];
        let ops: Vec<_> = ops.iter().map(|op| op.to_json().unwrap()).collect();
        make_transaction(&mut core, &alice, &ops, Privacy::Trusting, None, 2).unwrap();

        let mut directory = Directory::new();
        directory.refresh(&core).unwrap();
        let mut caches = KeyCaches::new();
        let mut resolver = KeyResolver::new(&directory, &NoAccounts, None, &mut caches);
        assert_eq!(resolver.read_key(&core.id(), &a), Some(a_secret));
        assert_eq!(resolver.read_key(&core.id(), &b), Some(b_secret));
    }
}

//! LocalNode replication over the in-memory network.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use coweave::core::{AgentSecret, CoValueCore, CoValueHeader, CoValueType, Privacy, RawCoID, Ruleset};
use coweave::keys::{create_account, create_group, make_transaction, LocalIdentity, Role};
use coweave::store::SqliteStore;
use coweave::sync::{
    compare_known_states, content_hash, verify_convergence, HighLevelState, KnownComparison, MemoryNetwork,
    Peer, PeerConfig, PeerID, PeerStatus, SyncMessage, Transport,
};
use coweave::{LocalNode, NodeConfig};
use tracing_subscriber::{prelude::*, EnvFilter};

fn setup_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

fn identity(seed: u8) -> LocalIdentity {
    LocalIdentity::for_agent(AgentSecret::from_seed(&[seed; 32]))
}

fn comap(uniqueness: &str) -> CoValueHeader {
    CoValueHeader::new(CoValueType::Comap, Ruleset::UnsafeAllowAll).with_uniqueness(json!(uniqueness))
}

async fn spawn_node(
    network: &Arc<MemoryNetwork>,
    name: &str,
    seed: u8,
    shutdown: &CancellationToken,
) -> Arc<LocalNode> {
    let transport = Arc::new(network.create_transport(name).await);
    let node = Arc::new(LocalNode::new(identity(seed), transport, NodeConfig::default()));
    tokio::spawn(Arc::clone(&node).run(shutdown.clone()));
    node
}

/// Whether `replica` holds exactly what `source` holds.
fn converged(replica: &LocalNode, source: &LocalNode, id: &RawCoID) -> Result<bool> {
    let Some((known, hash)) = source.with_core(id, |core| (core.known_state().clone(), content_hash(core)))? else {
        return Ok(false);
    };
    Ok(replica
        .with_core(id, |core| verify_convergence(core, &known, Some(&hash)).is_converged())?
        .unwrap_or(false))
}

/// Poll until `node` holds at least `count` transactions of `id`.
async fn wait_for(node: &LocalNode, id: &RawCoID, count: u64) {
    let poll = async {
        loop {
            let total = node.known_state(id).ok().flatten().map_or(0, |k| k.total());
            if total >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .expect("replica caught up");
}

#[tokio::test]
async fn test_write_reaches_server_and_second_client() -> Result<()> {
    setup_logging();
    let network = MemoryNetwork::new();
    let shutdown = CancellationToken::new();
    let server = spawn_node(&network, "server", 1, &shutdown).await;
    let alice = spawn_node(&network, "alice", 2, &shutdown).await;
    let bob = spawn_node(&network, "bob", 3, &shutdown).await;
    alice.add_peer(Peer::new(PeerID::new("server"), PeerConfig::server()))?;
    bob.add_peer(Peer::new(PeerID::new("server"), PeerConfig::server()))?;

    let id = alice.create_covalue(comap("shared")).await?;
    for made_at in 1..=3 {
        alice
            .make_transaction(id, &[json!({"op": "set", "key": "n", "value": made_at})], Privacy::Trusting, made_at)
            .await?;
    }
    wait_for(&server, &id, 3).await;

    assert_eq!(bob.load(id).await?, HighLevelState::Available);
    wait_for(&bob, &id, 3).await;
    assert!(converged(&bob, &alice, &id)?);
    assert!(converged(&server, &alice, &id)?);
    assert_eq!(bob.valid_transactions(&id)?.len(), 3);

    shutdown.cancel();
    Ok(())
}

#[tokio::test]
async fn test_everyone_reader_decrypts_private_content() -> Result<()> {
    let network = MemoryNetwork::new();
    let shutdown = CancellationToken::new();
    let server = spawn_node(&network, "server", 1, &shutdown).await;
    let alice = spawn_node(&network, "alice", 2, &shutdown).await;
    let bob = spawn_node(&network, "bob", 3, &shutdown).await;
    alice.add_peer(Peer::new(PeerID::new("server"), PeerConfig::server()))?;
    bob.add_peer(Peer::new(PeerID::new("server"), PeerConfig::server()))?;

    let group = alice.create_group(1).await?;
    alice.add_everyone(group, Role::Reader, 2).await?;
    let header = CoValueHeader::new(CoValueType::Comap, Ruleset::OwnedByGroup { group })
        .with_uniqueness(json!("secret-notes"));
    let id = alice.create_covalue(header).await?;
    alice
        .make_transaction(id, &[json!({"op": "set", "key": "note", "value": "hi"})], Privacy::Private, 3)
        .await?;

    let group_total = alice.known_state(&group)?.map_or(0, |k| k.total());
    wait_for(&server, &group, group_total).await;
    wait_for(&server, &id, 1).await;

    assert_eq!(bob.load(group).await?, HighLevelState::Available);
    wait_for(&bob, &group, group_total).await;
    assert_eq!(bob.load(id).await?, HighLevelState::Available);
    wait_for(&bob, &id, 1).await;

    let visible = bob.valid_transactions(&id)?;
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].changes, vec![json!({"op": "set", "key": "note", "value": "hi"})]);
    assert_eq!(visible[0].author, alice.identity().actor);

    shutdown.cancel();
    Ok(())
}

#[tokio::test]
async fn test_fresh_reader_loads_account_written_value() -> Result<()> {
    setup_logging();
    let network = MemoryNetwork::new();
    let shutdown = CancellationToken::new();
    let server = spawn_node(&network, "server", 1, &shutdown).await;
    let bob = spawn_node(&network, "bob", 3, &shutdown).await;
    bob.add_peer(Peer::new(PeerID::new("server"), PeerConfig::server()))?;

    let (account, writer) = create_account(AgentSecret::from_seed(&[2; 32]), 1)?;
    let transport = Arc::new(network.create_transport("alice").await);
    let alice = Arc::new(LocalNode::new(writer, transport, NodeConfig::default()));
    tokio::spawn(Arc::clone(&alice).run(shutdown.clone()));
    alice.add_peer(Peer::new(PeerID::new("server"), PeerConfig::server()))?;
    alice.insert_core(account).await?;

    let group = alice.create_group(2).await?;
    let header = CoValueHeader::new(CoValueType::Comap, Ruleset::OwnedByGroup { group })
        .with_uniqueness(json!("account-notes"));
    let id = alice.create_covalue(header).await?;
    alice
        .make_transaction(id, &[json!({"op": "set", "key": "by", "value": "account"})], Privacy::Trusting, 3)
        .await?;
    wait_for(&server, &id, 1).await;

    // Bob has never seen the account or the group.
    assert_eq!(bob.load(id).await?, HighLevelState::Available);
    wait_for(&bob, &id, 1).await;
    assert!(converged(&bob, &alice, &id)?);
    assert!(!matches!(bob.peer_status(&id, &PeerID::new("server"))?, PeerStatus::Errored(_)));

    let visible = bob.valid_transactions(&id)?;
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].author, alice.identity().actor);

    shutdown.cancel();
    Ok(())
}

/// Account-signed content that arrives before its account waits for it.
#[tokio::test]
async fn test_content_waits_for_its_signer() -> Result<()> {
    setup_logging();
    let network = MemoryNetwork::new();
    let server = network.create_transport("server").await;
    let transport = Arc::new(network.create_transport("bob").await);
    let bob = LocalNode::new(identity(3), transport, NodeConfig::default());
    let from = PeerID::new("server");

    let (account, writer) = create_account(AgentSecret::from_seed(&[2; 32]), 1)?;
    let (group, _, _) = create_group(&writer, 2)?;
    let header = CoValueHeader::new(CoValueType::Comap, Ruleset::OwnedByGroup { group: group.id() });
    let mut value = CoValueCore::new(header);
    make_transaction(&mut value, &writer, &[json!({"op": "set", "key": "k", "value": 1})], Privacy::Trusting, None, 3)?;
    let id = value.id();

    for chunk in value.new_content_since(None).unwrap_or_default() {
        bob.handle_message(&from, SyncMessage::Content { chunk }).await?;
    }
    assert_eq!(bob.high_level_state(&id)?, HighLevelState::Unknown);
    let (_, asked) = server.recv().await?;
    assert!(matches!(asked, SyncMessage::Load { known } if known.id == account.id()));

    for chunk in account.new_content_since(None).unwrap_or_default() {
        bob.handle_message(&from, SyncMessage::Content { chunk }).await?;
    }
    assert_eq!(bob.high_level_state(&id)?, HighLevelState::Available);
    let held = bob.known_state(&id)?.expect("released");
    assert_eq!(compare_known_states(&held, value.known_state()), KnownComparison::Equal);

    // With the value in hand, bob asks for the group that owns it.
    let mut asked_for_group = false;
    while let Some((_, message)) = server.recv_timeout(Duration::from_millis(50)).await? {
        if matches!(message, SyncMessage::Load { known } if known.id == group.id()) {
            asked_for_group = true;
        }
    }
    assert!(asked_for_group);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_after_every_peer_misses() -> Result<()> {
    let network = MemoryNetwork::new();
    let shutdown = CancellationToken::new();
    let _s1 = spawn_node(&network, "s1", 1, &shutdown).await;
    let _s2 = spawn_node(&network, "s2", 2, &shutdown).await;
    // Never answers.
    let s3 = network.create_transport("s3").await;
    let bob = spawn_node(&network, "bob", 3, &shutdown).await;
    for name in ["s1", "s2", "s3"] {
        bob.add_peer(Peer::new(PeerID::new(name), PeerConfig::server()))?;
    }

    let missing = comap("nobody-has-this").id();
    assert_eq!(bob.load(missing).await?, HighLevelState::Unavailable);
    assert_eq!(bob.high_level_state(&missing)?, HighLevelState::Unavailable);

    // The initial request plus one retry.
    let mut loads = 0;
    while let Some((from, message)) = s3.recv_timeout(Duration::from_millis(10)).await? {
        assert_eq!(from, PeerID::new("bob"));
        assert!(matches!(message, SyncMessage::Load { known } if known.id == missing));
        loads += 1;
    }
    assert_eq!(loads, 2);

    shutdown.cancel();
    Ok(())
}

/// A write made while a peer's link is down reaches it in full once the
/// link is back.
#[tokio::test]
async fn test_push_skips_disconnected_peer() -> Result<()> {
    setup_logging();
    let network = MemoryNetwork::new();
    let server = network.create_transport("server").await;
    let transport = Arc::new(network.create_transport("alice").await);
    let alice = LocalNode::new(identity(2), Arc::clone(&transport) as Arc<dyn Transport>, NodeConfig::default());
    let (alice_id, server_id) = (PeerID::new("alice"), PeerID::new("server"));
    alice.add_peer(Peer::new(server_id.clone(), PeerConfig::server()))?;

    let id = alice.create_covalue(comap("offline-edits")).await?;
    transport.disconnect(&server_id).await?;
    for made_at in 1..=2 {
        alice
            .make_transaction(id, &[json!({"op": "set", "key": "k", "value": made_at})], Privacy::Trusting, made_at)
            .await?;
    }
    while server.recv_timeout(Duration::from_millis(20)).await?.is_some() {}

    network.heal(&alice_id, &server_id).await;
    alice
        .make_transaction(id, &[json!({"op": "set", "key": "k", "value": 3})], Privacy::Trusting, 3)
        .await?;

    let (from, message) = server.recv().await?;
    assert_eq!(from, alice_id);
    let SyncMessage::Content { chunk } = message else {
        panic!("expected content, got {message:?}");
    };
    let segment = chunk.new.values().next().expect("one session");
    assert_eq!((segment.after, segment.end()), (0, 3));
    Ok(())
}

#[tokio::test]
async fn test_sqlite_store_survives_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("coweave.db");
    let network = MemoryNetwork::new();

    let id = {
        let transport = Arc::new(network.create_transport("first").await);
        let store = Arc::new(SqliteStore::open(&path)?);
        let node = LocalNode::new(identity(4), transport, NodeConfig::default()).with_store(store);
        let id = node.create_covalue(comap("durable")).await?;
        for made_at in 1..=4 {
            node.make_transaction(id, &[json!({"op": "set", "key": "k", "value": made_at})], Privacy::Trusting, made_at)
                .await?;
        }
        id
    };

    let transport = Arc::new(network.create_transport("second").await);
    let store = Arc::new(SqliteStore::open(&path)?);
    let node = LocalNode::new(identity(4), transport, NodeConfig::default()).with_store(store);
    assert_eq!(node.load(id).await?, HighLevelState::Available);
    let known = node.known_state(&id)?.expect("loaded");
    assert_eq!(known.total(), 4);
    assert_eq!(node.valid_transactions(&id)?.len(), 4);
    Ok(())
}

//! Reconciliation pipeline: storage loads, verification, dependencies and
//! pipeline-to-pipeline sync.

use proptest::prelude::*;
use serde_json::json;

use coweave::core::{
    AgentSecret, CoValueCore, NoAccounts, Privacy, RawCoID, SessionID, SignerSecret, Transaction,
};
use coweave::keys::{create_account, make_transaction};
use coweave::pipeline::{Effect, Pipeline, StorageState, TxState, Validity};
use coweave::store::{store_core, MemoryStore, SessionWrite, Store};
use coweave::sync::{content_hash, verify_convergence, HighLevelState, Peer, PeerConfig, PeerID, SyncMessage};
use coweave::PipelineConfig;
use coweave_testkit::generators::{covalue_from_plan, SessionPlan};
use coweave_testkit::{padded_transaction, TestFixture};
use tracing_subscriber::{prelude::*, EnvFilter};

fn setup_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

/// One transaction per append, each about 60 KB: checkpoints land after
/// indices 1, 3 and 5.
fn checkpointed(fixture: &TestFixture) -> CoValueCore {
    let mut core = fixture.covalue("checkpointed");
    let signer = &fixture.identity.agent.signer;
    for made_at in 0..6 {
        core.append_signed(fixture.session(), vec![padded_transaction(made_at, 60_000)], signer)
            .unwrap();
    }
    core
}

fn sends(effects: &[Effect], to: &PeerID) -> Vec<SyncMessage> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            Effect::Send { peer, message } if peer == to => Some(message.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_subscription_loads_and_verifies_from_store() {
    setup_logging();
    let fixture = TestFixture::with_seed([1; 32]);
    let core = fixture.populated("stored", 5);
    store_core(&fixture.store, &core).await.unwrap();

    let mut pipeline = Pipeline::new(PipelineConfig::default(), None, true);
    pipeline.subscribe(core.id());
    let updates = pipeline.settle(Some(&fixture.store), None).await;

    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].transactions.len(), 5);
    assert_eq!(&updates[0].known, core.known_state());
    let entry = pipeline.entry(&core.id()).unwrap();
    assert_eq!(entry.session(fixture.session()).unwrap().verified(), 5);
    assert!(matches!(entry.storage(), StorageState::Known(_)));
}

#[tokio::test]
async fn test_range_loads_respect_limit() {
    let fixture = TestFixture::with_seed([2; 32]);
    let core = fixture.populated("ranged", 7);
    store_core(&fixture.store, &core).await.unwrap();

    let config = PipelineConfig {
        max_transactions_per_load: 3,
    };
    let mut pipeline = Pipeline::new(config, None, true);
    pipeline.subscribe(core.id());

    // Metadata first, then ranges of at most three.
    let effects = pipeline.tick();
    assert!(matches!(effects.as_slice(), [Effect::LoadMetadata { .. }]));
    let metadata = fixture.store.load_metadata(&core.id()).await.unwrap();
    pipeline.on_metadata(&core.id(), metadata);

    let effects = pipeline.tick();
    let ranges: Vec<(u32, u32)> = effects
        .iter()
        .filter_map(|effect| match effect {
            Effect::LoadTransactions { from, to, .. } => Some((*from, *to)),
            _ => None,
        })
        .collect();
    assert_eq!(ranges, vec![(0, 3)]);
    let session = pipeline.entry(&core.id()).unwrap().session(fixture.session()).unwrap();
    assert_eq!(session.state(0), Some(&TxState::LoadingFromStorage));
    assert_eq!(session.state(3), Some(&TxState::AvailableInStorage));

    let first = fixture
        .store
        .load_transactions(&core.id(), fixture.session(), 0, 3)
        .await
        .unwrap();
    pipeline.on_transactions(&core.id(), fixture.session(), 0, first);
    let updates = pipeline.settle(Some(&fixture.store), None).await;
    assert_eq!(updates.last().unwrap().transactions.len(), 7);
}

#[tokio::test]
async fn test_cold_value_only_loads_metadata() {
    let fixture = TestFixture::with_seed([3; 32]);
    let core = fixture.populated("cold", 3);
    store_core(&fixture.store, &core).await.unwrap();

    let mut pipeline = Pipeline::new(PipelineConfig::default(), None, true);
    pipeline.track(core.id());
    let updates = pipeline.settle(Some(&fixture.store), None).await;

    assert!(updates.is_empty());
    let session = pipeline.entry(&core.id()).unwrap().session(fixture.session()).unwrap();
    assert_eq!(session.len(), 3);
    assert_eq!(session.verified(), 0);
    assert_eq!(session.state(0), Some(&TxState::AvailableInStorage));
}

#[tokio::test]
async fn test_tampered_storage_fails_from_last_checkpoint() {
    setup_logging();
    let fixture = TestFixture::with_seed([4; 32]);
    let core = checkpointed(&fixture);
    let log = core.session(fixture.session()).unwrap();
    assert_eq!(log.signature_after().keys().copied().collect::<Vec<_>>(), vec![1, 3, 5]);

    let mut write = SessionWrite::since(log, 0);
    write.transactions[4] = padded_transaction(99, 60_000);
    fixture
        .store
        .write(&core.id(), core.header(), &[write])
        .await
        .unwrap();

    let mut pipeline = Pipeline::new(PipelineConfig::default(), None, true);
    pipeline.subscribe(core.id());
    let updates = pipeline.settle(Some(&fixture.store), None).await;

    let session = pipeline.entry(&core.id()).unwrap().session(fixture.session()).unwrap();
    assert_eq!(session.verified(), 4);
    for index in 0..4 {
        assert!(matches!(session.state(index), Some(TxState::Verified { .. })));
    }
    for index in 4..6 {
        assert!(matches!(session.state(index), Some(TxState::VerificationFailed { .. })));
    }
    let Some(TxState::VerificationFailed { hash, .. }) = session.state(5) else {
        panic!("expected failure at the signed index");
    };
    assert!(hash.is_some());

    assert_eq!(updates.last().unwrap().transactions.len(), 4);
}

#[tokio::test]
async fn test_account_session_waits_for_account() {
    setup_logging();
    let agent = AgentSecret::from_seed(&[5; 32]);
    let (account, identity) = create_account(agent, 1).unwrap();
    let fixture = TestFixture::with_seed([6; 32]);
    let mut core = fixture.covalue("by-account");
    for made_at in 2..5 {
        make_transaction(&mut core, &identity, &[json!({"n": made_at})], Privacy::Trusting, None, made_at)
            .unwrap();
    }

    let mut pipeline = Pipeline::new(PipelineConfig::default(), None, false);
    pipeline.insert_local(&core).unwrap();
    pipeline.subscribe(core.id());
    let updates = pipeline.settle(None, None).await;
    assert!(updates.iter().all(|u| u.transactions.is_empty()));
    assert!(pipeline.entry(&account.id()).unwrap().dependents().contains(&core.id()));
    assert_eq!(pipeline.availability(&account.id()), HighLevelState::Unavailable);

    pipeline.insert_local(&account).unwrap();
    let updates = pipeline.settle(None, None).await;
    let update = updates.last().unwrap();
    assert_eq!(update.transactions.len(), 3);
    assert!(update.transactions.iter().all(|tx| tx.author == identity.actor));
}

#[tokio::test]
async fn test_two_pipelines_converge() {
    setup_logging();
    let fixture = TestFixture::with_seed([7; 32]);
    let core = fixture.populated("shared", 4);
    let (a, b) = (PeerID::new("a"), PeerID::new("b"));

    let mut server = Pipeline::new(PipelineConfig::default(), None, false);
    server.insert_local(&core).unwrap();
    server.add_peer(Peer::new(b.clone(), PeerConfig::client()));

    let mut client = Pipeline::new(PipelineConfig::default(), None, false);
    client.add_peer(Peer::new(a.clone(), PeerConfig::server()));
    let listener = client.subscribe(core.id());

    let mut notified = Vec::new();
    for _ in 0..8 {
        let to_server = client.tick();
        notified.extend(to_server.iter().filter_map(|effect| match effect {
            Effect::Notify { listener: l, update } if *l == listener => Some(update.clone()),
            _ => None,
        }));
        for message in sends(&to_server, &a) {
            server.on_message(&b, message).unwrap();
        }
        let to_client = server.tick();
        for message in sends(&to_client, &b) {
            client.on_message(&a, message).unwrap();
        }
    }

    let replica = client.entry(&core.id()).unwrap().verified_core().unwrap();
    let converged = verify_convergence(replica, core.known_state(), Some(&content_hash(&core)));
    assert!(converged.is_converged(), "{:?}", converged);
    assert_eq!(notified.len(), 1);
    assert_eq!(notified[0].transactions.len(), 4);
    assert_eq!(client.availability(&core.id()), HighLevelState::Available);
}

#[test]
fn test_checkpointed_scenario_chunks() {
    let fixture = TestFixture::with_seed([8; 32]);
    let mut core = fixture.covalue("scenario");
    let signer = &fixture.identity.agent.signer;
    let session = fixture.session().clone();

    // tx2 crosses the checkpoint threshold on its own.
    core.append_signed(
        &session,
        vec![Transaction::trusting(1, "[]"), padded_transaction(2, 110_000)],
        signer,
    )
    .unwrap();
    core.append_signed(
        &session,
        (3..=5).map(|t| Transaction::trusting(t, "[]")).collect(),
        signer,
    )
    .unwrap();

    assert_eq!(core.known_state().count(&session), 5);
    assert!(core.known_state().header);

    let log = core.session(&session).unwrap();
    let chunks = core.new_content_since(None).unwrap();
    let segments: Vec<_> = chunks.iter().filter_map(|c| c.new.get(&session)).collect();
    let all: Vec<Transaction> = segments.iter().flat_map(|s| s.transactions.clone()).collect();
    assert_eq!(all, log.transactions().to_vec());
    assert_eq!(segments[0].end(), 2);
    assert_eq!(segments[0].last_signature.as_ref(), log.signature_after().get(&1));
    assert_eq!(segments.last().unwrap().last_signature.as_ref(), log.last_signature());

    let mut peer_known = core.known_state().clone();
    peer_known.sessions.insert(session.clone(), 2);
    let diff = core.new_content_since(Some(&peer_known)).unwrap();
    assert_eq!(diff.len(), 1);
    assert!(diff[0].header.is_none());
    let segment = &diff[0].new[&session];
    assert_eq!(segment.after, 2);
    assert_eq!(segment.transactions, log.transactions()[2..].to_vec());
}

fn tampered_chunks(plan: &SessionPlan, index: usize, forge_signature: bool) -> (CoValueCore, Vec<coweave::core::ContentChunk>) {
    let core = covalue_from_plan(plan);
    let session = plan.session();
    let mut chunks = core.new_content_since(None).unwrap();
    let mut seen = 0usize;
    for chunk in &mut chunks {
        let Some(segment) = chunk.new.get_mut(&session) else {
            continue;
        };
        let len = segment.transactions.len();
        if index >= seen && index < seen + len {
            if forge_signature {
                segment.last_signature = Some(SignerSecret::from_seed(&[0xee; 32]).sign(&core.session_hash(&session)));
            } else {
                let tx = &mut segment.transactions[index - seen];
                *tx = Transaction::trusting(tx.made_at().wrapping_add(1), "[\"tampered\"]");
            }
        }
        seen += len;
    }
    (core, chunks)
}

fn feed(chunks: &[coweave::core::ContentChunk], id: RawCoID) -> Pipeline {
    let mut pipeline = Pipeline::new(PipelineConfig::default(), None, false);
    let peer = PeerID::new("source");
    for chunk in chunks {
        pipeline
            .on_message(&peer, SyncMessage::Content { chunk: chunk.clone() })
            .unwrap();
    }
    pipeline.subscribe(id);
    for _ in 0..4 {
        pipeline.tick();
    }
    pipeline
}

fn assert_nothing_trusted_after(pipeline: &Pipeline, id: &RawCoID, session: &SessionID, index: usize) -> Result<(), TestCaseError> {
    let entry = pipeline.entry(id).unwrap();
    let slots = entry.session(session).unwrap();
    prop_assert!(slots.verified() as usize <= index);
    for i in index..slots.len() as usize {
        let failed = matches!(slots.state(i as u32), Some(TxState::VerificationFailed { .. }));
        let unsigned = matches!(slots.state(i as u32), Some(TxState::Available));
        prop_assert!(failed || unsigned, "slot {} was trusted", i);
    }
    Ok(())
}

proptest! {
    #[test]
    fn prop_untampered_content_verifies(plan: SessionPlan) {
        let core = covalue_from_plan(&plan);
        let chunks = core.new_content_since(None).unwrap();
        let mut pipeline = feed(&chunks, core.id());
        let verified = pipeline.entry(&core.id()).unwrap().verified_core().unwrap();
        prop_assert!(verify_convergence(verified, core.known_state(), Some(&content_hash(&core))).is_converged());
        prop_assert_eq!(pipeline.valid_transactions(&core.id()).len(), plan.transaction_count());

        let entry = pipeline.entry(&core.id()).unwrap();
        let slots = entry.session(&plan.session()).unwrap();
        for i in 0..slots.len() {
            let valid = matches!(
                slots.state(i),
                Some(TxState::Verified { validity: Validity::Valid, .. })
            );
            prop_assert!(valid);
        }
    }

    #[test]
    fn prop_flipped_transaction_is_never_trusted(plan in any::<SessionPlan>(), pick in any::<prop::sample::Index>()) {
        let index = pick.index(plan.transaction_count());
        let (core, chunks) = tampered_chunks(&plan, index, false);
        let pipeline = feed(&chunks, core.id());
        assert_nothing_trusted_after(&pipeline, &core.id(), &plan.session(), index)?;
    }

    #[test]
    fn prop_substituted_signature_is_never_trusted(plan in any::<SessionPlan>(), pick in any::<prop::sample::Index>()) {
        let index = pick.index(plan.transaction_count());
        let (core, chunks) = tampered_chunks(&plan, index, true);
        let pipeline = feed(&chunks, core.id());
        assert_nothing_trusted_after(&pipeline, &core.id(), &plan.session(), index)?;
    }

    #[test]
    fn prop_chunk_reassembly_matches_source(plan: SessionPlan) {
        let core = covalue_from_plan(&plan);
        let mut replica = CoValueCore::new(core.header().clone());
        for chunk in core.new_content_since(None).unwrap_or_default() {
            replica.ingest(&chunk, &NoAccounts).unwrap();
        }
        prop_assert!(verify_convergence(&replica, core.known_state(), Some(&content_hash(&core))).is_converged());
    }
}

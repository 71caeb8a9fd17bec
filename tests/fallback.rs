//! Off-chain corruption driving the engine onto the chain and back.

use std::collections::{HashMap, VecDeque};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use beacon_dkg::channel::ChannelMixedRx;
use beacon_dkg::config::DkgConfig;
use beacon_dkg::crypto::threshold::{
    ComplaintCommits, Deal, DistKeyShare, Justification, KeyGenerator, KeyGeneratorFactory, Point,
    PolyKeyGenerator, ReconstructCommits, Response, Scalar, SecretCommits,
};
use beacon_dkg::dealer::DkgDealer;
use beacon_dkg::dealer::{DealerFaults, SendMsgCb};
use beacon_dkg::error::Result;
use beacon_dkg::events::{DkgEvent, EventHub};
use beacon_dkg::messages::{Codec, DkgMessage, MsgSendDkgData};
use beacon_dkg::orchestrator::Orchestrator;
use beacon_dkg::ordering::{Height, RoundId};
use beacon_dkg::round::RoundManager;
use beacon_dkg::transport::{ChainClient, OffChainTransport};
use beacon_dkg::validators::{LocalPrivValidator, PrivValidator, Validator, ValidatorSet};

const NODES: usize = 4;

/// Behaves like the production generator until the very end, where
/// producing the key share fails — the signature of a round whose
/// off-chain message set was corrupted.
struct CorruptedKeyGen {
    inner: PolyKeyGenerator,
}

impl KeyGenerator for CorruptedKeyGen {
    fn own_index(&self) -> usize {
        self.inner.own_index()
    }

    fn deals(&mut self) -> Result<BTreeMap<usize, Deal>> {
        self.inner.deals()
    }

    fn process_deal(&mut self, deal: &Deal) -> Result<Response> {
        self.inner.process_deal(deal)
    }

    fn process_response(&mut self, resp: &Response) -> Result<Option<Justification>> {
        self.inner.process_response(resp)
    }

    fn process_justification(&mut self, justification: &Justification) -> Result<()> {
        self.inner.process_justification(justification)
    }

    fn commits(&self) -> SecretCommits {
        self.inner.commits()
    }

    fn certified(&self) -> bool {
        self.inner.certified()
    }

    fn qual(&self) -> Vec<usize> {
        self.inner.qual()
    }

    fn secret_commits(&self) -> Result<SecretCommits> {
        self.inner.secret_commits()
    }

    fn process_secret_commits(
        &mut self,
        commits: &SecretCommits,
    ) -> Result<Option<ComplaintCommits>> {
        self.inner.process_secret_commits(commits)
    }

    fn process_complaint_commits(
        &mut self,
        complaint: &ComplaintCommits,
    ) -> Result<Option<ReconstructCommits>> {
        self.inner.process_complaint_commits(complaint)
    }

    fn process_reconstruct_commits(&mut self, reconstruct: &ReconstructCommits) -> Result<()> {
        self.inner.process_reconstruct_commits(reconstruct)
    }

    fn finished(&self) -> bool {
        true
    }

    fn dist_key_share(&self) -> Result<DistKeyShare> {
        Err(anyhow!("share reconstruction failed: corrupted message set"))
    }
}

struct CorruptedFactory;

impl KeyGeneratorFactory for CorruptedFactory {
    fn create(
        &self,
        sec_key: Scalar,
        participants: &[Point],
        threshold: usize,
    ) -> Result<Box<dyn KeyGenerator>> {
        PolyKeyGenerator::new(sec_key, participants, threshold)
            .map(|inner| Box::new(CorruptedKeyGen { inner }) as Box<dyn KeyGenerator>)
    }
}

/// An in-memory chain: broadcast transactions land in per-(kind, round)
/// buckets and queries return the whole bucket, repeatedly.
struct MockChain {
    codec: Codec,
    store: Mutex<HashMap<(u8, u64), Vec<MsgSendDkgData>>>,
}

impl MockChain {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            codec: Codec::new(),
            store: Mutex::new(HashMap::new()),
        })
    }
}

impl ChainClient for MockChain {
    fn query_with_data(&self, path: &str) -> Result<Vec<u8>> {
        let parts: Vec<&str> = path.split('/').collect();
        let kind: u8 = parts[3].parse()?;
        let round: u64 = parts[4].parse()?;

        let store = self.store.lock().unwrap();
        let messages = store.get(&(kind, round)).cloned().unwrap_or_default();

        self.codec.encode(&messages)
    }

    fn broadcast_txs(&self, msgs: &[MsgSendDkgData], _sequence: u64) -> Result<()> {
        let mut store = self.store.lock().unwrap();

        for tx in msgs {
            tx.validate_basic()?;

            let key = (tx.data.kind.code(), u64::from(tx.data.round_id));
            store.entry(key).or_default().push(tx.clone());
        }

        Ok(())
    }
}

struct Node {
    orchestrator: Arc<Orchestrator>,
    bus: ChannelMixedRx<DkgEvent>,
    queue: ChannelMixedRx<DkgMessage>,
    stash: VecDeque<DkgMessage>,
}

fn corrupted_constructor() -> beacon_dkg::round::DealerConstructor {
    Arc::new(|validators, addr, send_msg: SendMsgCb, events, codec, round_id| {
        Box::new(DkgDealer::new(
            validators,
            addr,
            send_msg,
            events,
            codec,
            Arc::new(CorruptedFactory),
            round_id,
            DealerFaults::default(),
        ))
    })
}

fn fallback_cluster() -> (Vec<Node>, ValidatorSet) {
    let hub = EventHub::new();
    let codec = Codec::new();
    let chain = MockChain::new();

    let mut priv_validators: Vec<Arc<LocalPrivValidator>> = (0..NODES)
        .map(|_| Arc::new(LocalPrivValidator::generate().unwrap()))
        .collect();
    priv_validators.sort_by_key(|pv| pv.address());

    let valset = ValidatorSet::new(
        priv_validators
            .iter()
            .map(|pv| Validator::new(pv.public_key()))
            .collect(),
    );

    let nodes = priv_validators
        .into_iter()
        .map(|pv| {
            let bus = hub.subscribe(1024);

            let manager = RoundManager::new(hub.clone(), DkgConfig::default(), pv.clone(), codec)
                .with_dealer_constructor(corrupted_constructor());

            let off_chain = OffChainTransport::new(manager);
            let queue = off_chain.msg_queue();

            let orchestrator =
                Orchestrator::new(off_chain, chain.clone(), pv, hub.clone(), codec);

            Node {
                orchestrator,
                bus,
                queue,
                stash: VecDeque::new(),
            }
        })
        .collect();

    (nodes, valset)
}

fn pump_off_chain(nodes: &mut [Node], valset: &ValidatorSet, height: Height) {
    for _ in 0..200 {
        let mut progressed = false;

        for node in nodes.iter_mut() {
            while let Ok(event) = node.bus.try_recv() {
                if let DkgEvent::Data(msg) = event {
                    node.stash.push_back(msg);
                }
            }
            while let Ok(msg) = node.queue.try_recv() {
                node.stash.push_back(msg);
            }

            while let Some(msg) = node.stash.pop_front() {
                node.orchestrator.handle_share(&msg, height, valset);
                progressed = true;
            }
        }

        if !progressed {
            break;
        }
    }
}

#[test]
fn corrupt_off_chain_round_recovers_on_chain() {
    let (mut nodes, valset) = fallback_cluster();

    for node in &nodes {
        node.orchestrator
            .off_chain()
            .start_round(&valset)
            .unwrap();
    }

    pump_off_chain(&mut nodes, &valset, Height::from(50));

    // Every node detected the corrupt round and engaged the fallback.
    for node in &nodes {
        assert!(node.orchestrator.is_on_chain());
    }

    // Drive block notifications until every node's on-chain round
    // produced a verifier and fallback mode ended.
    for block in 1..=20i64 {
        for node in &nodes {
            let _ = node.orchestrator.on_chain_tick(Height::from(50 + block));
        }

        if nodes.iter().all(|node| !node.orchestrator.is_on_chain()) {
            break;
        }
    }

    for node in &nodes {
        assert!(!node.orchestrator.is_on_chain());

        let manager = node.orchestrator.off_chain().manager();
        let verifier = manager
            .next_verifier()
            .expect("on-chain fallback should install a verifier");

        // The on-chain variant runs with the lower threshold.
        assert_eq!(verifier.params().t(), (NODES * 2) / 3);
        assert_eq!(verifier.params().n(), NODES);

        let change_height = i64::from(manager.change_height());
        assert!(change_height > 0);
        assert_eq!(change_height % 5, 0);
    }

    // The recovered shares still combine.
    let verifiers: Vec<_> = nodes
        .iter()
        .map(|node| {
            node.orchestrator
                .off_chain()
                .manager()
                .next_verifier()
                .unwrap()
        })
        .collect();

    let beacon = b"post-fallback beacon";
    let partials: Vec<_> = verifiers
        .iter()
        .map(|verifier| (verifier.own_id(), verifier.sign(beacon)))
        .collect();

    let combined = verifiers[0].recover(beacon, &partials).unwrap();
    verifiers[1].verify_combined(beacon, &combined).unwrap();
}

#[test]
fn shares_are_ignored_while_fallback_is_active() {
    let (mut nodes, valset) = fallback_cluster();

    for node in &nodes {
        node.orchestrator
            .off_chain()
            .start_round(&valset)
            .unwrap();
    }

    pump_off_chain(&mut nodes, &valset, Height::from(50));
    assert!(nodes[0].orchestrator.is_on_chain());

    // A late off-chain share is dropped without touching any round.
    let stale = DkgMessage::new(
        beacon_dkg::messages::MessageKind::PubKey,
        RoundId::ONE,
        valset.validators()[0].address(),
    );

    nodes[0]
        .orchestrator
        .handle_share(&stale, Height::from(51), &valset);

    assert!(nodes[0].orchestrator.is_on_chain());
}

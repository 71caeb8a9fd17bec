//! Multi-node runs of the off-chain engine over an in-process bus.

use std::collections::VecDeque;
use std::sync::Arc;

use beacon_dkg::channel::ChannelMixedRx;
use beacon_dkg::config::DkgConfig;
use beacon_dkg::crypto::signature::ValidatorAddress;
use beacon_dkg::crypto::threshold::PolyKeyGeneratorFactory;
use beacon_dkg::dealer::{DealerFaults, DkgDealer, LoserKind};
use beacon_dkg::events::{DkgEvent, EventHub};
use beacon_dkg::messages::{Codec, DkgMessage};
use beacon_dkg::ordering::{Height, RoundId};
use beacon_dkg::round::{DealerConstructor, RoundManager};
use beacon_dkg::validators::{LocalPrivValidator, PrivValidator, Validator, ValidatorSet};

const NODES: usize = 4;
const HEIGHT: Height = Height::ZERO;

struct Node {
    addr: ValidatorAddress,
    manager: RoundManager,
    bus: ChannelMixedRx<DkgEvent>,
    queue: ChannelMixedRx<DkgMessage>,
    stash: VecDeque<DkgMessage>,
}

struct Cluster {
    valset: ValidatorSet,
    nodes: Vec<Node>,
}

fn dealer_constructor(faults: DealerFaults) -> DealerConstructor {
    Arc::new(move |validators, addr, send_msg, events, codec, round_id| {
        Box::new(DkgDealer::new(
            validators,
            addr,
            send_msg,
            events,
            codec,
            PolyKeyGeneratorFactory::arced(),
            round_id,
            faults,
        ))
    })
}

/// Builds a committee of four nodes sharing one event bus, applying the
/// given faults to the node at the matching roster position.
fn cluster(faults: Vec<DealerFaults>) -> Cluster {
    let hub = EventHub::new();
    let codec = Codec::new();

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
        .zip(faults)
        .map(|(pv, faults)| {
            let bus = hub.subscribe(1024);

            let manager = RoundManager::new(
                hub.clone(),
                DkgConfig::default(),
                pv.clone(),
                codec,
            )
            .with_dealer_constructor(dealer_constructor(faults));

            Node {
                addr: pv.address(),
                queue: manager.msg_queue(),
                manager,
                bus,
                stash: VecDeque::new(),
            }
        })
        .collect();

    Cluster { valset, nodes }
}

fn honest_cluster() -> Cluster {
    cluster(vec![DealerFaults::default(); NODES])
}

impl Cluster {
    fn start_round(&self) {
        for node in &self.nodes {
            node.manager.start_round(&self.valset).unwrap();
        }
    }

    /// Delivers stashed and newly arrived messages matching `allow`
    /// until the whole cluster stops making progress.
    fn pump(&mut self, height: Height, allow: impl Fn(&DkgMessage) -> bool) {
        for _ in 0..500 {
            let mut progressed = false;

            for node in &mut self.nodes {
                while let Ok(event) = node.bus.try_recv() {
                    if let DkgEvent::Data(msg) = event {
                        node.stash.push_back(msg);
                    }
                }
                while let Ok(msg) = node.queue.try_recv() {
                    node.stash.push_back(msg);
                }

                let mut kept = VecDeque::new();
                while let Some(msg) = node.stash.pop_front() {
                    if allow(&msg) {
                        node.manager.handle_share(&msg, height, &self.valset);
                        progressed = true;
                    } else {
                        kept.push_back(msg);
                    }
                }
                node.stash = kept;
            }

            if !progressed {
                return;
            }
        }

        panic!("cluster did not settle");
    }
}

#[test]
fn four_honest_nodes_complete_a_round() {
    let mut cluster = honest_cluster();

    cluster.start_round();
    cluster.pump(Height::from(100), |_| true);

    for node in &cluster.nodes {
        let verifier = node
            .manager
            .next_verifier()
            .expect("every node should compute a verifier");

        assert_eq!(verifier.params().n(), NODES);
        assert!(node.manager.pop_losers().is_empty());

        let change_height = i64::from(node.manager.change_height());
        assert!(change_height > 0);
        assert_eq!(change_height % 5, 0);
        // Quantized down from 100 + 20 blocks ahead.
        assert_eq!(change_height, 120);
    }
}

#[test]
fn computed_shares_sign_and_combine_across_nodes() {
    let mut cluster = honest_cluster();

    cluster.start_round();
    cluster.pump(Height::from(100), |_| true);

    let verifiers: Vec<_> = cluster
        .nodes
        .iter()
        .map(|node| node.manager.next_verifier().unwrap())
        .collect();

    let beacon = b"height 120 randomness";

    let partials: Vec<_> = verifiers
        .iter()
        .map(|verifier| (verifier.own_id(), verifier.sign(beacon)))
        .collect();

    // Any node can verify any other node's partial and recover the
    // full signature from a threshold of them.
    for verifier in &verifiers {
        for (id, partial) in &partials {
            verifier.verify_share(*id, beacon, partial).unwrap();
        }

        let combined = verifier.recover(beacon, &partials).unwrap();
        verifiers[0].verify_combined(beacon, &combined).unwrap();
    }
}

#[test]
fn promotion_happens_exactly_at_the_change_height() {
    let mut cluster = honest_cluster();

    cluster.start_round();
    cluster.pump(Height::from(100), |_| true);

    let change_height = cluster.nodes[0].manager.change_height();

    for node in &cluster.nodes {
        assert!(node.manager.verifier().is_none());

        // A block before the change height does nothing.
        node.manager.check_dkg_time(change_height + (-1i64), &cluster.valset);
        assert!(node.manager.verifier().is_none());

        node.manager.check_dkg_time(change_height, &cluster.valset);

        assert!(node.manager.verifier().is_some());
        assert!(node.manager.next_verifier().is_none());
        assert_eq!(node.manager.change_height(), Height::ZERO);
    }
}

#[test]
fn corrupt_deal_payloads_stall_the_round_and_flag_the_sender() {
    let byzantine = NODES - 1;

    let mut faults = vec![DealerFaults::default(); NODES];
    faults[byzantine] = DealerFaults {
        corrupt_deals: true,
        ..Default::default()
    };

    let mut cluster = cluster(faults);
    let byzantine_addr = cluster.nodes[byzantine].addr;

    cluster.start_round();
    cluster.pump(HEIGHT, |_| true);

    for (index, node) in cluster.nodes.iter().enumerate() {
        if index == byzantine {
            continue;
        }

        assert!(node.manager.next_verifier().is_none());

        let losers = node.manager.pop_losers();
        assert_eq!(losers.len(), 1);
        assert_eq!(losers[0].addr, byzantine_addr);
        assert_eq!(losers[0].kind, LoserKind::CorruptData);
    }
}

#[test]
fn a_finishing_round_tombstones_its_predecessors() {
    let mut cluster = honest_cluster();

    // Round 1 starts but none of its messages are delivered before
    // round 2 begins.
    cluster.start_round();
    cluster.start_round();

    let round_two = RoundId::from(2);
    cluster.pump(Height::from(100), |msg| msg.round_id == round_two);

    for node in &cluster.nodes {
        assert!(node.manager.next_verifier().is_some());
        assert!(node.manager.is_tombstone(RoundId::ONE));
    }

    let survivors: Vec<_> = cluster
        .nodes
        .iter()
        .map(|node| node.manager.next_verifier().unwrap())
        .collect();

    // Delivering the stale round-1 traffic afterwards changes nothing.
    cluster.pump(Height::from(100), |msg| msg.round_id == RoundId::ONE);

    for (node, survivor) in cluster.nodes.iter().zip(survivors) {
        assert!(node.manager.is_tombstone(RoundId::ONE));
        assert!(Arc::ptr_eq(
            &node.manager.next_verifier().unwrap(),
            &survivor
        ));
    }
}

#[test]
fn replayed_signed_messages_do_not_drift_the_round() {
    let mut cluster = honest_cluster();

    cluster.start_round();

    // Capture the first node's pub key announcement and deliver it to
    // node 1 twice before anything else.
    let replayed = {
        let node = &mut cluster.nodes[0];
        let msg = node.queue.try_recv().expect("own announcement queued");
        node.stash.push_back(msg.clone());
        msg
    };

    let target = &cluster.nodes[1];
    target.manager.handle_share(&replayed, HEIGHT, &cluster.valset);
    target.manager.handle_share(&replayed, HEIGHT, &cluster.valset);

    // The round still completes normally for everyone.
    cluster.pump(Height::from(100), |_| true);

    for node in &cluster.nodes {
        assert!(node.manager.next_verifier().is_some());
        assert!(node.manager.pop_losers().is_empty());
    }
}

#[test]
fn cadence_starts_rounds_automatically() {
    let mut cluster = honest_cluster();

    // Height 100 is the default cadence boundary: every node starts
    // round 1 on its own.
    for node in &cluster.nodes {
        node.manager.check_dkg_time(Height::from(100), &cluster.valset);
        assert_eq!(node.manager.current_round_id(), RoundId::ONE);
    }

    cluster.pump(Height::from(100), |_| true);

    for node in &cluster.nodes {
        assert!(node.manager.next_verifier().is_some());
    }
}

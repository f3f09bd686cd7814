//! Integration tests for subtree partitioning and the per-subtree protocol

use std::sync::Arc;
use std::time::Duration;

use std::collections::BTreeMap;

use cosi_network::{
    local_key_pair, Announcement, Conode, Envelope, LocalNetwork, MessagePayload, Response,
    Roster, Tree,
};
use cosi_protocol::{
    create_on_conode, gen_subtree, regen_subtree, register_protocols, ProtocolTree, SubEvent,
    SubParams, SubProtocol, VerificationFn, DEFAULT_PROTOCOL_NAME, DEFAULT_SUBPROTOCOL_NAME,
};
use cosi_signer::{refusal_message, BlsPublicKey, BlsSignature, BlsSuite, Mask};

const PROPOSAL: &[u8] = b"subtree proposal";

async fn network(n: usize, vf: VerificationFn) -> (LocalNetwork, Vec<Arc<Conode>>, Arc<Roster>) {
    let network = LocalNetwork::new();
    let (conodes, roster) = network.gen_conodes(n, BlsSuite::default()).await.unwrap();
    for conode in &conodes {
        register_protocols(
            conode,
            DEFAULT_PROTOCOL_NAME,
            DEFAULT_SUBPROTOCOL_NAME,
            vf.clone(),
            vf.clone(),
        )
        .await;
    }
    (network, conodes, roster)
}

fn params(timeout: Duration, threshold: usize) -> SubParams {
    SubParams {
        msg: PROPOSAL.to_vec(),
        data: Vec::new(),
        timeout,
        threshold,
    }
}

/// Drain the events of a started sub-protocol
async fn events(sub: &Arc<dyn SubProtocol>) -> Vec<SubEvent> {
    let mut rx = sub.take_events().unwrap();
    let mut out = Vec::new();
    while let Some(event) = rx.recv().await {
        out.push(event);
    }
    out
}

fn responses(events: Vec<SubEvent>) -> Vec<Response> {
    events
        .into_iter()
        .filter_map(|e| match e {
            SubEvent::Response(r) => Some(r),
            SubEvent::SubleaderNotResponding => None,
        })
        .collect()
}

fn bits(publics: &[BlsPublicKey], indices: &[usize]) -> Vec<u8> {
    let mut mask = Mask::new(publics, None).unwrap();
    for &i in indices {
        mask.set_index(i, true).unwrap();
    }
    mask.mask().to_vec()
}

fn enabled(publics: &[BlsPublicKey], response: &Response) -> Vec<usize> {
    let mut mask = Mask::new(publics, None).unwrap();
    mask.set_mask(&response.mask).unwrap();
    mask.enabled_indices()
}

/// Signature of the `index`-th local conode over `msg`
fn signed_by(index: usize, msg: &[u8]) -> Vec<u8> {
    let key_pair = local_key_pair(index).unwrap();
    BlsSuite::default()
        .sign(&key_pair.secret, msg)
        .to_bytes()
        .to_vec()
}

/// Hand `payload` to conode `to` as if `from` had sent it within `sub`
async fn inject(
    conodes: &[Arc<Conode>],
    sub: &Arc<dyn SubProtocol>,
    from: usize,
    to: usize,
    payload: MessagePayload,
) {
    let envelope = Envelope::new(
        sub.instance_id().to_string(),
        DEFAULT_SUBPROTOCOL_NAME.to_string(),
        sub.tree().clone(),
        from,
        to,
        payload,
    );
    conodes[to].receive(envelope).await.unwrap();
}

fn forged_announcement(msg: &[u8]) -> MessagePayload {
    MessagePayload::Announcement(Announcement {
        msg: msg.to_vec(),
        data: Vec::new(),
        timeout: Duration::from_secs(1),
        threshold: 3,
    })
}

/// Subtree 0 -> 1 -> {2, 3} rooted on conode 0, created but not started
async fn four_node_sub() -> (LocalNetwork, Vec<Arc<Conode>>, Arc<Roster>, Arc<dyn SubProtocol>) {
    let (network, conodes, roster) = network(4, Arc::new(|_: &[u8], _: &[u8]| true)).await;
    let tree = Arc::new(gen_subtree(&roster, &[0, 1, 2, 3]).unwrap());

    let create = create_on_conode(&conodes[0]);
    let sub = create(DEFAULT_SUBPROTOCOL_NAME.to_string(), tree).await.unwrap();
    sub.configure(params(Duration::from_secs(1), 3));
    (network, conodes, roster, sub)
}

/// Instantiate the subleader ahead of the round; a stop for an unknown
/// instance would be dropped by the conode
async fn wake_subleader(conodes: &[Arc<Conode>], sub: &Arc<dyn SubProtocol>) {
    inject(conodes, sub, 3, 1, forged_announcement(b"from a leaf")).await;
}

// ============ Partitioning ============

#[tokio::test]
async fn test_partition_covers_every_node_once() {
    let (network, _, roster) = network(17, Arc::new(|_: &[u8], _: &[u8]| true)).await;
    let tree = Tree::star(roster, 0).unwrap();

    for k in 1..=16 {
        let subtrees = ProtocolTree::partition(&tree, k).unwrap();
        assert_eq!(subtrees.len(), k);

        let mut covered: Vec<usize> = subtrees.subleaders();
        covered.extend(subtrees.leaves());
        covered.sort_unstable();
        assert_eq!(covered, (1..17).collect::<Vec<_>>());

        let sizes: Vec<usize> = subtrees.trees().iter().map(|t| t.size()).collect();
        let (min, max) = (sizes.iter().min().unwrap(), sizes.iter().max().unwrap());
        assert!(max - min <= 1);
        assert!(subtrees.trees().iter().all(|t| t.root() == 0 && t.depth() <= 2));
    }

    network.close().await;
}

#[tokio::test]
async fn test_regeneration_never_reuses_a_subleader() {
    let (network, _, roster) = network(6, Arc::new(|_: &[u8], _: &[u8]| true)).await;
    let mut tree = gen_subtree(&roster, &[0, 1, 2, 3, 4, 5]).unwrap();
    let mut tried = vec![tree.children_of(0)[0]];

    while let Ok(next) = regen_subtree(&tree) {
        let subleader = next.children_of(0)[0];
        assert!(!tried.contains(&subleader));
        assert_eq!(next.size(), 6);
        tried.push(subleader);
        tree = next;
    }
    assert_eq!(tried, vec![1, 2, 3, 4, 5]);

    network.close().await;
}

// ============ Sub-Protocol ============

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_subprotocol_aggregates_subtree() {
    let (network, conodes, roster) = network(5, Arc::new(|_: &[u8], _: &[u8]| true)).await;
    let tree = Arc::new(gen_subtree(&roster, &[0, 1, 2, 3, 4]).unwrap());

    let create = create_on_conode(&conodes[0]);
    let sub = create(DEFAULT_SUBPROTOCOL_NAME.to_string(), tree).await.unwrap();
    sub.configure(params(Duration::from_secs(2), 4));
    sub.start().unwrap();
    let events = events(&sub).await;

    let responses: Vec<_> = events
        .into_iter()
        .filter_map(|e| match e {
            SubEvent::Response(r) => Some(r),
            SubEvent::SubleaderNotResponding => None,
        })
        .collect();
    let last = responses.last().unwrap();
    let publics = roster.publics();
    let mut mask = Mask::new(&publics, None).unwrap();
    mask.set_mask(&last.mask).unwrap();
    assert_eq!(mask.enabled_indices(), vec![1, 2, 3, 4]);

    let signature = BlsSignature::from_bytes(last.signature.as_ref().unwrap()).unwrap();
    BlsSuite::default()
        .verify(mask.aggregate_public().unwrap(), PROPOSAL, &signature)
        .unwrap();

    network.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_subprotocol_reports_refusals() {
    let (network, conodes, roster) = network(4, Arc::new(|_: &[u8], _: &[u8]| false)).await;
    let tree = Arc::new(gen_subtree(&roster, &[0, 1, 2, 3]).unwrap());

    let create = create_on_conode(&conodes[0]);
    let sub = create(DEFAULT_SUBPROTOCOL_NAME.to_string(), tree).await.unwrap();
    sub.configure(params(Duration::from_secs(2), 3));
    sub.start().unwrap();
    let events = events(&sub).await;

    let last = events
        .into_iter()
        .filter_map(|e| match e {
            SubEvent::Response(r) => Some(r),
            SubEvent::SubleaderNotResponding => None,
        })
        .last()
        .unwrap();
    assert!(last.signature.is_none());
    assert_eq!(last.refusals.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);

    let suite = BlsSuite::default();
    for (index, proof) in &last.refusals {
        let proof = BlsSignature::from_bytes(proof).unwrap();
        suite
            .verify(&roster.publics()[*index], &refusal_message(PROPOSAL, *index), &proof)
            .unwrap();
    }

    network.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_silent_subleader_is_reported() {
    let (network, conodes, roster) = network(4, Arc::new(|_: &[u8], _: &[u8]| true)).await;
    network.pause(&roster.list()[1].address).await;
    let tree = Arc::new(gen_subtree(&roster, &[0, 1, 2, 3]).unwrap());

    let create = create_on_conode(&conodes[0]);
    let sub = create(DEFAULT_SUBPROTOCOL_NAME.to_string(), tree).await.unwrap();
    sub.configure(params(Duration::from_millis(200), 3));
    sub.start().unwrap();
    let events = events(&sub).await;

    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], SubEvent::SubleaderNotResponding));

    network.close().await;
}

#[tokio::test]
async fn test_subprotocol_rejects_oversized_threshold() {
    let (network, conodes, roster) = network(3, Arc::new(|_: &[u8], _: &[u8]| true)).await;
    let tree = Arc::new(gen_subtree(&roster, &[0, 1, 2]).unwrap());

    let create = create_on_conode(&conodes[0]);
    let sub = create(DEFAULT_SUBPROTOCOL_NAME.to_string(), tree).await.unwrap();
    sub.configure(params(Duration::from_secs(1), 3));
    assert!(sub.start().is_err());

    sub.stop().await;
    network.close().await;
}

// ============ Misbehaving Members ============

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_announcement_from_sibling_is_ignored() {
    let (network, conodes, roster, sub) = four_node_sub().await;
    inject(&conodes, &sub, 3, 2, forged_announcement(b"forged proposal")).await;

    sub.start().unwrap();
    let last = responses(events(&sub).await).pop().unwrap();

    let publics = roster.publics();
    assert_eq!(enabled(&publics, &last), vec![1, 2, 3]);
    let mut mask = Mask::new(&publics, None).unwrap();
    mask.set_mask(&last.mask).unwrap();
    let signature = BlsSignature::from_bytes(last.signature.as_ref().unwrap()).unwrap();
    BlsSuite::default()
        .verify(mask.aggregate_public().unwrap(), PROPOSAL, &signature)
        .unwrap();

    network.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_from_leaf_is_ignored() {
    let (network, conodes, roster, sub) = four_node_sub().await;
    wake_subleader(&conodes, &sub).await;
    inject(&conodes, &sub, 2, 1, MessagePayload::Stop).await;

    sub.start().unwrap();
    let events = events(&sub).await;
    assert!(!events
        .iter()
        .any(|e| matches!(e, SubEvent::SubleaderNotResponding)));

    let last = responses(events).pop().unwrap();
    assert_eq!(enabled(&roster.publics(), &last), vec![1, 2, 3]);

    network.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_response_is_counted_once() {
    let (network, conodes, roster, sub) = four_node_sub().await;
    let publics = roster.publics();
    wake_subleader(&conodes, &sub).await;
    // leaf 2 answers ahead of the announcement, then again during the round
    let early = Response::accepted(signed_by(2, PROPOSAL), bits(&publics, &[2]));
    inject(&conodes, &sub, 2, 1, MessagePayload::Response(early)).await;

    sub.start().unwrap();
    let last = responses(events(&sub).await).pop().unwrap();

    assert_eq!(enabled(&publics, &last), vec![1, 2, 3]);
    let mut mask = Mask::new(&publics, None).unwrap();
    mask.set_mask(&last.mask).unwrap();
    let signature = BlsSignature::from_bytes(last.signature.as_ref().unwrap()).unwrap();
    BlsSuite::default()
        .verify(mask.aggregate_public().unwrap(), PROPOSAL, &signature)
        .unwrap();

    network.close().await;
}

/// Run the subtree with a bogus answer of leaf 3 reaching the subleader
/// first; its genuine answer then arrives as a duplicate
async fn run_with_bogus_leaf_answer(
    answer: impl FnOnce(&[BlsPublicKey]) -> Response,
) -> (Vec<BlsPublicKey>, Response) {
    let (network, conodes, roster, sub) = four_node_sub().await;
    let publics = roster.publics();
    wake_subleader(&conodes, &sub).await;
    inject(&conodes, &sub, 3, 1, MessagePayload::Response(answer(&publics))).await;

    sub.start().unwrap();
    let last = responses(events(&sub).await).pop().unwrap();

    network.close().await;
    (publics, last)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_refusal_with_bad_proof_is_dropped() {
    // signed over the proposal instead of the refusal message
    let (publics, last) = run_with_bogus_leaf_answer(|publics| {
        Response::refused(bits(publics, &[]), 3, signed_by(3, PROPOSAL))
    })
    .await;

    assert_eq!(enabled(&publics, &last), vec![1, 2]);
    assert!(last.refusals.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_answer_with_two_bits_is_rejected() {
    let (publics, last) = run_with_bogus_leaf_answer(|publics| {
        Response::accepted(signed_by(3, PROPOSAL), bits(publics, &[2, 3]))
    })
    .await;

    assert_eq!(enabled(&publics, &last), vec![1, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_root_filters_forged_refusals() {
    let (network, conodes, roster, sub) = four_node_sub().await;
    let publics = roster.publics();
    // subleader 1 signs and claims leaf 2 refused with a proof it cannot forge
    let forged = Response {
        signature: Some(signed_by(1, PROPOSAL)),
        mask: bits(&publics, &[1]),
        refusals: BTreeMap::from([(2, signed_by(1, &refusal_message(PROPOSAL, 2)))]),
    };
    inject(&conodes, &sub, 1, 0, MessagePayload::Response(forged)).await;

    sub.start().unwrap();
    let answers = responses(events(&sub).await);

    assert_eq!(answers.len(), 2);
    assert_eq!(enabled(&publics, &answers[0]), vec![1]);
    assert!(answers[0].refusals.is_empty());
    assert_eq!(enabled(&publics, &answers[1]), vec![1, 2, 3]);

    network.close().await;
}

//! Per-subtree collective signing
//!
//! One [`SubCosi`] instance runs on every member of a two-level subtree.
//! The subtree root announces, the subleader forwards the announcement to its
//! leaves, and every non-root member verifies the proposal and answers with a
//! signature or a signed refusal. The subleader aggregates the answers and
//! sends them up, possibly twice: a quick answer as soon as the outcome is
//! known, then a final one once everybody answered or the timeout expired.

use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cosi_network::{
    Announcement, Envelope, MessagePayload, NetworkError, NetworkResult, ProtocolInstance,
    Response, Tree, TreeNodeInstance,
};
use cosi_signer::{aggregate_signatures, refusal_message, BlsPublicKey, BlsSignature, Mask};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_TIMEOUT, START_FALLBACK};
use crate::error::{ProtocolError, ProtocolResult};
use crate::{lock, wait_closed};

/// Verification predicate over `(msg, data)`
pub type VerificationFn = Arc<dyn Fn(&[u8], &[u8]) -> bool + Send + Sync>;

/// Parameters handed down by the root protocol
#[derive(Debug, Clone, Default)]
pub struct SubParams {
    pub msg: Vec<u8>,
    pub data: Vec<u8>,
    pub timeout: Duration,
    pub threshold: usize,
}

/// What the subtree root reports to the root protocol
#[derive(Debug)]
pub enum SubEvent {
    /// Aggregated answer of the subleader, verified
    Response(Response),
    /// Nothing arrived from the subleader before the timeout
    SubleaderNotResponding,
}

/// Root-side handle on a sub-protocol, as seen by the root protocol
#[async_trait]
pub trait SubProtocol: Send + Sync {
    fn instance_id(&self) -> &str;

    fn tree(&self) -> &Arc<Tree>;

    fn configure(&self, params: SubParams);

    fn start(&self) -> ProtocolResult<()>;

    /// Ordered stream of events; closes when the sub-protocol ends
    fn take_events(&self) -> Option<mpsc::Receiver<SubEvent>>;

    async fn stop(&self);
}

enum NodeAnswer {
    Accepted(BlsSignature, Vec<u8>),
    Refused(Vec<u8>),
}

/// Sub-protocol instance on one member of a subtree
pub struct SubCosi {
    node: TreeNodeInstance,
    verification: VerificationFn,
    params: Mutex<SubParams>,
    start_tx: Mutex<Option<oneshot::Sender<()>>>,
    start_rx: Mutex<Option<oneshot::Receiver<()>>>,
    announcement_tx: Mutex<Option<mpsc::Sender<(usize, Announcement)>>>,
    announcement_rx: Mutex<Option<mpsc::Receiver<(usize, Announcement)>>>,
    response_tx: mpsc::Sender<(usize, Response)>,
    response_rx: Mutex<Option<mpsc::Receiver<(usize, Response)>>>,
    events_tx: Mutex<Option<mpsc::Sender<SubEvent>>>,
    events_rx: Mutex<Option<mpsc::Receiver<SubEvent>>>,
    closing: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl SubCosi {
    pub fn new(node: TreeNodeInstance, verification: VerificationFn) -> Arc<Self> {
        let capacity = (node.tree().size() * 2).max(4);
        let (start_tx, start_rx) = oneshot::channel();
        let (announcement_tx, announcement_rx) = mpsc::channel(capacity);
        let (response_tx, response_rx) = mpsc::channel(capacity);
        // quick and final answer
        let (events_tx, events_rx) = mpsc::channel(2);
        let (closing, _) = watch::channel(false);

        Arc::new(Self {
            node,
            verification,
            params: Mutex::new(SubParams::default()),
            start_tx: Mutex::new(Some(start_tx)),
            start_rx: Mutex::new(Some(start_rx)),
            announcement_tx: Mutex::new(Some(announcement_tx)),
            announcement_rx: Mutex::new(Some(announcement_rx)),
            response_tx,
            response_rx: Mutex::new(Some(response_rx)),
            events_tx: Mutex::new(Some(events_tx)),
            events_rx: Mutex::new(Some(events_rx)),
            closing,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn node(&self) -> &TreeNodeInstance {
        &self.node
    }

    pub fn params(&self) -> SubParams {
        lock(&self.params).clone()
    }

    /// Root of the subtree: announce, then relay at most two answers of the
    /// subleader within one deadline
    async fn dispatch_root(&self) -> ProtocolResult<()> {
        let events = lock(&self.events_tx).take().ok_or(ProtocolError::Finished)?;
        let start_rx = lock(&self.start_rx).take().ok_or(ProtocolError::Finished)?;
        let mut closing = self.closing.subscribe();

        tokio::select! {
            res = start_rx => res.map_err(|_| ProtocolError::Finished)?,
            _ = sleep(START_FALLBACK) => {
                return Err(ProtocolError::Timeout("sub-protocol was never started".to_string()));
            }
            _ = wait_closed(&mut closing) => return Ok(()),
        }

        let params = self.params();
        let announcement = Announcement {
            msg: params.msg.clone(),
            data: params.data.clone(),
            timeout: params.timeout,
            threshold: params.threshold,
        };
        for (child, e) in self
            .node
            .send_to_children(MessagePayload::Announcement(announcement))
            .await
        {
            warn!(node = self.node.index(), child, error = %e, "failed to announce to subleader");
        }

        let mut responses = lock(&self.response_rx)
            .take()
            .ok_or(ProtocolError::Finished)?;
        let publics = self.node.publics();
        let subleader = self.node.children().first().copied();
        let expected_answers = self.node.tree().size() - 1;
        let deadline = Instant::now() + params.timeout;
        let mut received = 0;

        while received < 2 {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    if received == 0 {
                        info!(
                            node = self.node.index(),
                            instance = %self.node.instance_id(),
                            subleader = ?subleader,
                            "subleader not responding"
                        );
                        let _ = events.send(SubEvent::SubleaderNotResponding).await;
                    }
                    break;
                }
                _ = wait_closed(&mut closing) => break,
                msg = responses.recv() => {
                    let Some((from, response)) = msg else { break };
                    if Some(from) != subleader {
                        warn!(node = self.node.index(), from, "response from a node other than the subleader");
                        continue;
                    }

                    let response = match self.check_aggregate(&publics, &params.msg, response) {
                        Ok(response) => response,
                        Err(e) => {
                            warn!(node = self.node.index(), from, error = %e, "invalid aggregated response");
                            continue;
                        }
                    };

                    received += 1;
                    let accounted = count_bits(&response.mask) + response.refusals.len();
                    debug!(
                        instance = %self.node.instance_id(),
                        accounted,
                        expected = expected_answers,
                        "subtree answered"
                    );
                    if events.send(SubEvent::Response(response)).await.is_err() {
                        break;
                    }
                    if accounted >= expected_answers {
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Subleader or leaf
    async fn dispatch_node(self: Arc<Self>) -> ProtocolResult<()> {
        let mut closing = self.closing.subscribe();
        let mut announcements = lock(&self.announcement_rx)
            .take()
            .ok_or(ProtocolError::Finished)?;
        let parent = self.node.parent();
        let me = self.node.index();

        let announcement = loop {
            tokio::select! {
                _ = wait_closed(&mut closing) => return Ok(()),
                _ = sleep(DEFAULT_TIMEOUT) => {
                    return Err(ProtocolError::Timeout("no announcement received".to_string()));
                }
                msg = announcements.recv() => match msg {
                    None => return Ok(()),
                    Some((from, announcement)) if Some(from) == parent || from == me => {
                        break announcement;
                    }
                    Some((from, _)) => {
                        warn!(node = me, from, "ignoring announcement from a node that is not our parent");
                    }
                },
            }
        };

        let size = self.node.tree().size();
        if announcement.threshold > size - 1 {
            return Err(ProtocolError::Config(format!(
                "threshold {} bigger than the {} non-root nodes of the subtree",
                announcement.threshold,
                size - 1
            )));
        }

        let timeout = announcement.timeout / 2;
        *lock(&self.params) = SubParams {
            msg: announcement.msg.clone(),
            data: announcement.data.clone(),
            timeout,
            threshold: announcement.threshold,
        };

        let me_task = self.clone();
        let (msg, data) = (announcement.msg.clone(), announcement.data.clone());
        tokio::spawn(async move { me_task.answer_self(msg, data).await });

        // leaves halve the same announced timeout as their subleader
        if !self.node.is_leaf() {
            for (child, e) in self
                .node
                .send_to_children(MessagePayload::Announcement(announcement.clone()))
                .await
            {
                warn!(node = me, child, error = %e, "failed to forward announcement");
            }
        }

        self.collect_responses(&announcement.msg, announcement.threshold, timeout, &mut closing)
            .await
    }

    /// Run the verification predicate and queue our own answer
    async fn answer_self(&self, msg: Vec<u8>, data: Vec<u8>) {
        let verification = self.verification.clone();
        let verify_msg = msg.clone();
        let accepted = tokio::task::spawn_blocking(move || verification(&verify_msg, &data))
            .await
            .unwrap_or(false);

        let me = self.node.index();
        let response = if accepted {
            self.make_response(&msg)
        } else {
            debug!(node = me, "verification refused the proposal");
            self.make_refusal(&msg)
        };

        match response {
            Ok(response) => {
                if self.response_tx.try_send((me, response)).is_err() {
                    debug!(node = me, "own answer arrived after collection ended");
                }
            }
            Err(e) => warn!(node = me, error = %e, "failed to build own answer"),
        }
    }

    fn make_response(&self, msg: &[u8]) -> ProtocolResult<Response> {
        let mask = Mask::new(&self.node.publics(), Some(self.node.index()))?;
        let signature = self.node.suite().sign(&self.node.key_pair().secret, msg);
        Ok(Response::accepted(
            signature.to_bytes().to_vec(),
            mask.mask().to_vec(),
        ))
    }

    fn make_refusal(&self, msg: &[u8]) -> ProtocolResult<Response> {
        let me = self.node.index();
        let mask = Mask::new(&self.node.publics(), None)?;
        let proof = self
            .node
            .suite()
            .sign(&self.node.key_pair().secret, &refusal_message(msg, me));
        Ok(Response::refused(
            mask.mask().to_vec(),
            me,
            proof.to_bytes().to_vec(),
        ))
    }

    async fn collect_responses(
        &self,
        msg: &[u8],
        threshold: usize,
        timeout: Duration,
        closing: &mut watch::Receiver<bool>,
    ) -> ProtocolResult<()> {
        let mut responses = lock(&self.response_rx)
            .take()
            .ok_or(ProtocolError::Finished)?;
        let publics = self.node.publics();
        let me = self.node.index();
        let children = self.node.children().to_vec();

        let mut expected: HashSet<usize> = children.iter().copied().collect();
        expected.insert(me);

        let mut mask = Mask::new(&publics, None)?;
        let mut signatures: Vec<BlsSignature> = Vec::new();
        let mut refusals: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
        let mut quick_sent_at: Option<usize> = None;
        let deadline = Instant::now() + timeout;

        while !expected.is_empty() {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    debug!(node = me, missing = expected.len(), "timeout while collecting responses");
                    break;
                }
                _ = wait_closed(closing) => return Ok(()),
                msg_in = responses.recv() => {
                    let Some((from, response)) = msg_in else { break };
                    if !expected.remove(&from) {
                        warn!(node = me, from, "unexpected or duplicate response");
                        continue;
                    }

                    match self.check_node_response(&publics, msg, from, &response) {
                        Ok(NodeAnswer::Accepted(signature, bits)) => {
                            mask.merge(&bits)?;
                            signatures.push(signature);
                        }
                        Ok(NodeAnswer::Refused(proof)) => {
                            refusals.insert(from, proof);
                        }
                        Err(e) => {
                            warn!(node = me, from, error = %e, "dropping invalid response");
                            continue;
                        }
                    }

                    // Quick answer once the threshold is reached or can no
                    // longer be reached by the children and ourselves
                    if quick_sent_at.is_none() && !children.is_empty() {
                        let reached = signatures.len() >= threshold;
                        let unreachable = refusals.len() + threshold > children.len() + 1;
                        if reached || unreachable {
                            debug!(node = me, accepted = signatures.len(), refused = refusals.len(), "sending quick answer");
                            self.send_aggregate(&mask, &signatures, &refusals).await;
                            quick_sent_at = Some(signatures.len() + refusals.len());
                        }
                    }
                }
            }
        }

        if quick_sent_at != Some(signatures.len() + refusals.len()) {
            self.send_aggregate(&mask, &signatures, &refusals).await;
        }
        Ok(())
    }

    /// Check a response relayed for a single node
    fn check_node_response(
        &self,
        publics: &[BlsPublicKey],
        msg: &[u8],
        from: usize,
        response: &Response,
    ) -> ProtocolResult<NodeAnswer> {
        let mut mask = Mask::new(publics, None)?;
        mask.set_mask(&response.mask)?;

        if mask.count_enabled() > 1 {
            return Err(ProtocolError::InvalidResponse(
                "more than one participant in a single node response".to_string(),
            ));
        }
        if response.refusals.keys().any(|&i| i != from) {
            return Err(ProtocolError::InvalidResponse(
                "refusal on behalf of another node".to_string(),
            ));
        }

        match &response.signature {
            Some(bytes) => {
                if !mask.is_index_enabled(from) {
                    return Err(ProtocolError::InvalidResponse(
                        "signature without the sender's mask bit".to_string(),
                    ));
                }
                let signature = BlsSignature::from_bytes(bytes)?;
                self.node
                    .suite()
                    .verify(&publics[from], msg, &signature)?;
                Ok(NodeAnswer::Accepted(signature, response.mask.clone()))
            }
            None => {
                if mask.count_enabled() != 0 {
                    return Err(ProtocolError::InvalidResponse(
                        "refusal with a non-empty mask".to_string(),
                    ));
                }
                let proof = response.refusals.get(&from).ok_or_else(|| {
                    ProtocolError::InvalidResponse("refusal without proof".to_string())
                })?;
                if !self.refusal_is_valid(publics, msg, from, proof) {
                    return Err(ProtocolError::InvalidResponse(
                        "invalid refusal signature".to_string(),
                    ));
                }
                Ok(NodeAnswer::Refused(proof.clone()))
            }
        }
    }

    /// Check an aggregated response from the subleader, dropping invalid refusals
    fn check_aggregate(
        &self,
        publics: &[BlsPublicKey],
        msg: &[u8],
        response: Response,
    ) -> ProtocolResult<Response> {
        let mut mask = Mask::new(publics, None)?;
        mask.set_mask(&response.mask)?;

        match &response.signature {
            Some(bytes) => {
                let signature = BlsSignature::from_bytes(bytes)?;
                let aggregate = mask.aggregate_public().ok_or_else(|| {
                    ProtocolError::InvalidResponse("signature with an empty mask".to_string())
                })?;
                self.node.suite().verify(aggregate, msg, &signature)?;
            }
            None if mask.count_enabled() != 0 => {
                return Err(ProtocolError::InvalidResponse(
                    "mask without signature".to_string(),
                ));
            }
            None => {}
        }

        let tree = self.node.tree();
        let refusals = response
            .refusals
            .into_iter()
            .filter(|(index, proof)| {
                let valid = tree.contains(*index)
                    && !tree.is_root(*index)
                    && !mask.is_index_enabled(*index)
                    && self.refusal_is_valid(publics, msg, *index, proof);
                if !valid {
                    warn!(node = self.node.index(), refuser = *index, "dropping invalid refusal");
                }
                valid
            })
            .collect();

        Ok(Response {
            signature: response.signature,
            mask: response.mask,
            refusals,
        })
    }

    fn refusal_is_valid(
        &self,
        publics: &[BlsPublicKey],
        msg: &[u8],
        index: usize,
        proof: &[u8],
    ) -> bool {
        let Some(public) = publics.get(index) else {
            return false;
        };
        BlsSignature::from_bytes(proof)
            .and_then(|sig| {
                self.node
                    .suite()
                    .verify(public, &refusal_message(msg, index), &sig)
            })
            .is_ok()
    }

    async fn send_aggregate(
        &self,
        mask: &Mask,
        signatures: &[BlsSignature],
        refusals: &BTreeMap<usize, Vec<u8>>,
    ) {
        let signature = if signatures.is_empty() {
            None
        } else {
            match aggregate_signatures(signatures) {
                Ok(sig) => Some(sig.to_bytes().to_vec()),
                Err(e) => {
                    warn!(node = self.node.index(), error = %e, "failed to aggregate signatures");
                    return;
                }
            }
        };

        let response = Response {
            signature,
            mask: mask.mask().to_vec(),
            refusals: refusals.clone(),
        };
        if let Err(e) = self
            .node
            .send_to_parent(MessagePayload::Response(response))
            .await
        {
            warn!(node = self.node.index(), error = %e, "failed to send response to parent");
        }
    }

    /// Stop from the subtree root: wake every waiter, keep the response
    /// channel open for in-flight verifications
    fn handle_stop(&self) {
        lock(&self.announcement_tx).take();
        let _ = self.closing.send(true);
    }
}

fn count_bits(bits: &[u8]) -> usize {
    bits.iter().map(|b| b.count_ones() as usize).sum()
}

#[async_trait]
impl SubProtocol for SubCosi {
    fn instance_id(&self) -> &str {
        self.node.instance_id()
    }

    fn tree(&self) -> &Arc<Tree> {
        self.node.tree()
    }

    fn configure(&self, params: SubParams) {
        *lock(&self.params) = params;
    }

    fn start(&self) -> ProtocolResult<()> {
        let params = self.params();
        if params.threshold > self.node.tree().size().saturating_sub(1) {
            return Err(ProtocolError::Config(format!(
                "sub-protocol threshold {} bigger than subtree",
                params.threshold
            )));
        }
        if params.timeout.is_zero() {
            return Err(ProtocolError::Config("sub-protocol timeout not set".to_string()));
        }

        let start_tx = lock(&self.start_tx)
            .take()
            .ok_or(ProtocolError::AlreadyStarted)?;
        start_tx.send(()).map_err(|_| ProtocolError::Finished)
    }

    fn take_events(&self) -> Option<mpsc::Receiver<SubEvent>> {
        lock(&self.events_rx).take()
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.handle_stop();
        lock(&self.start_tx).take();

        if self.node.is_root() {
            for (to, e) in self.node.broadcast(MessagePayload::Stop).await {
                debug!(node = self.node.index(), to, error = %e, "failed to send stop");
            }
        }
        self.node.done().await;
    }
}

#[async_trait]
impl ProtocolInstance for SubCosi {
    async fn dispatch(self: Arc<Self>) -> NetworkResult<()> {
        let result = if self.node.tree().depth() > 2 {
            Err(ProtocolError::InvalidSubtree(
                "tree too deep for a sub-protocol".to_string(),
            ))
        } else if self.node.is_root() {
            self.dispatch_root().await
        } else {
            self.clone().dispatch_node().await
        };

        SubProtocol::stop(self.as_ref()).await;
        result.map_err(NetworkError::from)
    }

    fn deliver(&self, envelope: Envelope) -> NetworkResult<()> {
        let from = envelope.from;
        match envelope.payload {
            MessagePayload::Announcement(announcement) => {
                match lock(&self.announcement_tx).as_ref() {
                    Some(tx) => tx.try_send((from, announcement)).map_err(|e| {
                        NetworkError::SendFailed(format!("announcement queue: {}", e))
                    }),
                    None => {
                        debug!(node = self.node.index(), from, "announcement after stop");
                        Ok(())
                    }
                }
            }
            MessagePayload::Response(response) => self
                .response_tx
                .try_send((from, response))
                .map_err(|e| NetworkError::SendFailed(format!("response queue: {}", e))),
            MessagePayload::Stop => {
                if from != self.node.tree().root() {
                    warn!(node = self.node.index(), from, "ignoring stop from a node that is not the root");
                    return Ok(());
                }
                self.handle_stop();
                Ok(())
            }
            other => Err(NetworkError::InvalidMessage(format!(
                "sub-protocol cannot handle {}",
                other.message_type()
            ))),
        }
    }

    async fn shutdown(&self) {
        SubProtocol::stop(self).await;
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

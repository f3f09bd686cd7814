//! Root protocol
//!
//! Runs on the root of the overall tree. After `start` it verifies the
//! proposal locally, starts one sub-protocol per subtree and gathers their
//! answers until the threshold is reached, becomes unreachable or the
//! global timeout expires. Subtrees whose subleader stays silent are
//! regenerated with the next candidate.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use cosi_network::{
    Conode, Envelope, NetworkError, NetworkResult, ProtocolFactory, ProtocolInstance, Response,
    Tree, TreeNodeInstance,
};
use cosi_signer::{
    aggregate_signatures, append_signature_and_mask, BlsPublicKey, BlsSignature, Mask,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{
    default_subtrees, default_threshold, DEFAULT_PROTOCOL_NAME, DEFAULT_SUBPROTOCOL_NAME,
    DEFAULT_TIMEOUT, MIN_TIMEOUT, START_FALLBACK, SUBPROTOCOL_TIMEOUT_DIVISOR,
};
use crate::error::{ProtocolError, ProtocolResult};
use crate::sub_protocol::{SubCosi, SubEvent, SubParams, SubProtocol, VerificationFn};
use crate::subtree::ProtocolTree;
use crate::{lock, wait_closed};

/// Future returned by a [`CreateProtocolFn`]
pub type SubProtocolFuture =
    Pin<Box<dyn Future<Output = ProtocolResult<Arc<dyn SubProtocol>>> + Send>>;

/// Creates a started-but-unconfigured sub-protocol `name` on a subtree
pub type CreateProtocolFn = Arc<dyn Fn(String, Arc<Tree>) -> SubProtocolFuture + Send + Sync>;

/// Sub-protocol creation backed by the protocol registry of `conode`
pub fn create_on_conode(conode: &Arc<Conode>) -> CreateProtocolFn {
    let conode = Arc::downgrade(conode);
    Arc::new(move |name: String, tree: Arc<Tree>| -> SubProtocolFuture {
        Box::pin(create_sub_cosi(conode.clone(), name, tree))
    })
}

async fn create_sub_cosi(
    conode: Weak<Conode>,
    name: String,
    tree: Arc<Tree>,
) -> ProtocolResult<Arc<dyn SubProtocol>> {
    let conode = conode.upgrade().ok_or(NetworkError::Closed)?;
    let instance = conode.create_protocol(&name, tree).await?;
    match instance.clone().into_any().downcast::<SubCosi>() {
        Ok(sub) => Ok(sub),
        Err(_) => {
            instance.shutdown().await;
            Err(ProtocolError::Config(format!(
                "protocol {} is not a sub-protocol",
                name
            )))
        }
    }
}

struct RoundConfig {
    msg: Option<Vec<u8>>,
    data: Vec<u8>,
    timeout: Duration,
    threshold: usize,
    subtrees: Option<ProtocolTree>,
    verification: Option<VerificationFn>,
    create_protocol: Option<CreateProtocolFn>,
    subprotocol_name: String,
}

struct RoundParams {
    msg: Vec<u8>,
    data: Vec<u8>,
    timeout: Duration,
    threshold: usize,
    subtrees: Option<ProtocolTree>,
    verification: VerificationFn,
    create_protocol: CreateProtocolFn,
    subprotocol_name: String,
}

enum CollectEvent {
    Response { instance: String, response: Response },
    Failed { position: usize, error: ProtocolError },
}

/// Root protocol instance
pub struct CosiProtocol {
    node: TreeNodeInstance,
    config: Mutex<RoundConfig>,
    start_tx: Mutex<Option<oneshot::Sender<RoundParams>>>,
    start_rx: Mutex<Option<oneshot::Receiver<RoundParams>>>,
    final_tx: Mutex<Option<oneshot::Sender<ProtocolResult<Vec<u8>>>>>,
    final_rx: Mutex<Option<oneshot::Receiver<ProtocolResult<Vec<u8>>>>>,
    subs: Mutex<HashMap<String, Arc<dyn SubProtocol>>>,
    closing: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl CosiProtocol {
    pub fn new(node: TreeNodeInstance, verification: Option<VerificationFn>) -> Arc<Self> {
        let n = node.tree().size();
        let (start_tx, start_rx) = oneshot::channel();
        let (final_tx, final_rx) = oneshot::channel();
        let (closing, _) = watch::channel(false);

        Arc::new(Self {
            node,
            config: Mutex::new(RoundConfig {
                msg: None,
                data: Vec::new(),
                timeout: DEFAULT_TIMEOUT,
                threshold: default_threshold(n),
                subtrees: None,
                verification,
                create_protocol: None,
                subprotocol_name: DEFAULT_SUBPROTOCOL_NAME.to_string(),
            }),
            start_tx: Mutex::new(Some(start_tx)),
            start_rx: Mutex::new(Some(start_rx)),
            final_tx: Mutex::new(Some(final_tx)),
            final_rx: Mutex::new(Some(final_rx)),
            subs: Mutex::new(HashMap::new()),
            closing,
            stopped: AtomicBool::new(false),
        })
    }

    /// Instantiate the root protocol `name` on `conode` for `tree`
    pub async fn create(
        conode: &Arc<Conode>,
        name: &str,
        tree: Arc<Tree>,
    ) -> ProtocolResult<Arc<Self>> {
        let instance = conode.create_protocol(name, tree).await?;
        match instance.clone().into_any().downcast::<CosiProtocol>() {
            Ok(protocol) => Ok(protocol),
            Err(_) => {
                instance.shutdown().await;
                Err(ProtocolError::Config(format!(
                    "protocol {} is not a root protocol",
                    name
                )))
            }
        }
    }

    pub fn node(&self) -> &TreeNodeInstance {
        &self.node
    }

    pub fn set_message(&self, msg: impl Into<Vec<u8>>) {
        lock(&self.config).msg = Some(msg.into());
    }

    pub fn set_data(&self, data: impl Into<Vec<u8>>) {
        lock(&self.config).data = data.into();
    }

    pub fn set_timeout(&self, timeout: Duration) {
        lock(&self.config).timeout = timeout;
    }

    pub fn set_threshold(&self, threshold: usize) {
        lock(&self.config).threshold = threshold;
    }

    pub fn set_verification(&self, verification: VerificationFn) {
        lock(&self.config).verification = Some(verification);
    }

    pub fn set_create_protocol(&self, create_protocol: CreateProtocolFn) {
        lock(&self.config).create_protocol = Some(create_protocol);
    }

    pub fn set_subprotocol_name(&self, name: impl Into<String>) {
        lock(&self.config).subprotocol_name = name.into();
    }

    pub fn timeout(&self) -> Duration {
        lock(&self.config).timeout
    }

    pub fn threshold(&self) -> usize {
        lock(&self.config).threshold
    }

    /// Partition the tree into `k` subtrees
    pub fn set_nbr_subtree(&self, k: usize) -> ProtocolResult<()> {
        let size = self.node.tree().size();
        if k < 1 {
            return Err(ProtocolError::Config(
                "need at least one subtree".to_string(),
            ));
        }
        if k > size - 1 {
            return Err(ProtocolError::Config(format!(
                "cannot have {} subtrees with only {} non-root nodes",
                k,
                size - 1
            )));
        }

        let subtrees = ProtocolTree::partition(self.node.tree(), k)?;
        lock(&self.config).subtrees = Some(subtrees);
        Ok(())
    }

    /// Subleaders of the configured partition
    pub fn subleaders(&self) -> Vec<usize> {
        lock(&self.config)
            .subtrees
            .as_ref()
            .map(ProtocolTree::subleaders)
            .unwrap_or_default()
    }

    /// Leaves of the configured partition
    pub fn leaves(&self) -> Vec<usize> {
        lock(&self.config)
            .subtrees
            .as_ref()
            .map(ProtocolTree::leaves)
            .unwrap_or_default()
    }

    /// Roster-ordered public keys a final signature is checked against
    pub fn public_keys(&self) -> Vec<BlsPublicKey> {
        self.node.publics()
    }

    /// Receiver of the final `signature || mask`; available once
    pub fn final_signature(&self) -> Option<oneshot::Receiver<ProtocolResult<Vec<u8>>>> {
        lock(&self.final_rx).take()
    }

    /// Check the configuration and let the protocol run
    pub async fn start(&self) -> ProtocolResult<()> {
        // a repeated start leaves the running round alone
        let start_tx = lock(&self.start_tx)
            .take()
            .ok_or(ProtocolError::AlreadyStarted)?;

        let params = match self.check_integrity() {
            Ok(params) => params,
            Err(e) => {
                self.shutdown_protocol().await;
                return Err(e);
            }
        };

        if start_tx.send(params).is_err() {
            self.shutdown_protocol().await;
            return Err(ProtocolError::Finished);
        }

        info!(
            instance = %self.node.instance_id(),
            nodes = self.node.tree().size(),
            "collective signing started"
        );
        Ok(())
    }

    fn check_integrity(&self) -> ProtocolResult<RoundParams> {
        let config = lock(&self.config);
        let size = self.node.tree().size();

        let msg = config
            .msg
            .clone()
            .ok_or_else(|| ProtocolError::Config("no proposal msg specified".to_string()))?;
        let verification = config.verification.clone().ok_or_else(|| {
            ProtocolError::Config("no verification function specified".to_string())
        })?;
        let create_protocol = config.create_protocol.clone().ok_or_else(|| {
            ProtocolError::Config("no create protocol function specified".to_string())
        })?;
        if config.subprotocol_name.is_empty() {
            return Err(ProtocolError::Config(
                "sub-protocol name cannot be empty".to_string(),
            ));
        }
        if config.timeout < MIN_TIMEOUT {
            return Err(ProtocolError::Config("unrealistic timeout".to_string()));
        }
        if config.threshold < 1 || config.threshold > size {
            return Err(ProtocolError::Config(format!(
                "threshold {} outside [1, {}]",
                config.threshold, size
            )));
        }

        Ok(RoundParams {
            msg,
            data: config.data.clone(),
            timeout: config.timeout,
            threshold: config.threshold,
            subtrees: config.subtrees.clone(),
            verification,
            create_protocol,
            subprotocol_name: config.subprotocol_name.clone(),
        })
    }

    async fn run(self: &Arc<Self>) -> ProtocolResult<Vec<u8>> {
        let start_rx = lock(&self.start_rx)
            .take()
            .ok_or(ProtocolError::Finished)?;
        let mut closing = self.closing.subscribe();

        let params = tokio::select! {
            res = start_rx => res.map_err(|_| ProtocolError::Finished)?,
            _ = sleep(START_FALLBACK) => {
                return Err(ProtocolError::Timeout(
                    "timeout, did you forget to call start?".to_string(),
                ));
            }
            _ = wait_closed(&mut closing) => return Err(ProtocolError::Finished),
        };

        let verification = params.verification.clone();
        let (msg, data) = (params.msg.clone(), params.data.clone());
        let accepted = tokio::task::spawn_blocking(move || verification(&msg, &data))
            .await
            .map_err(|e| ProtocolError::VerificationFailed(e.to_string()))?;
        if !accepted {
            return Err(ProtocolError::VerificationFailed(
                "root refused to sign the proposal".to_string(),
            ));
        }

        let n = self.node.tree().size();
        let trees = if params.threshold <= 1 || n == 1 {
            Vec::new()
        } else {
            let subtrees = match params.subtrees.clone() {
                Some(subtrees) => subtrees,
                None => ProtocolTree::partition(self.node.tree(), default_subtrees(n))?,
            };
            // regenerations of this round are recorded here
            lock(&self.config).subtrees = Some(subtrees.clone());
            subtrees.into_trees()
        };

        let responses = self.collect_signatures(&params, trees).await?;
        self.generate_signature(&params.msg, &responses)
    }

    /// Gather subtree answers until the threshold is met
    async fn collect_signatures(
        self: &Arc<Self>,
        params: &RoundParams,
        trees: Vec<Arc<Tree>>,
    ) -> ProtocolResult<Vec<Response>> {
        let n = self.node.tree().size();
        let threshold = params.threshold;
        let deadline = Instant::now() + params.timeout;
        let sub_params = SubParams {
            msg: params.msg.clone(),
            data: params.data.clone(),
            timeout: params.timeout / SUBPROTOCOL_TIMEOUT_DIVISOR,
            threshold: 0,
        };

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        for (position, tree) in trees.into_iter().enumerate() {
            let (sub, events) = self
                .start_sub(&params.create_protocol, &params.subprotocol_name, tree.clone(), &sub_params)
                .await?;
            let task = SubtreeTask {
                protocol: self.clone(),
                position,
                tree,
                sub,
                events,
                params: sub_params.clone(),
                create_protocol: params.create_protocol.clone(),
                name: params.subprotocol_name.clone(),
                deadline,
                out: events_tx.clone(),
                stop: stop_rx.clone(),
            };
            tasks.spawn(task.run());
        }
        drop(events_tx);

        let publics = self.node.publics();
        let mut responses: HashMap<String, Response> = HashMap::new();

        let outcome = loop {
            let mut mask = Mask::new(&publics, None)?;
            let mut refused = BTreeSet::new();
            for response in responses.values() {
                mask.merge(&response.mask)?;
                refused.extend(response.refusals.keys().copied());
            }

            // +1 for the root's own signature
            let signed = mask.count_enabled() + 1;
            if signed >= threshold {
                debug!(signed, threshold, "threshold reached");
                break Ok(());
            }
            if refused.len() > n - threshold {
                break Err(ProtocolError::ThresholdUnreachable {
                    refusals: refused.len(),
                    threshold,
                    total: n,
                });
            }

            tokio::select! {
                _ = sleep_until(deadline) => {
                    break Err(ProtocolError::Timeout(format!(
                        "collected {} of {} signatures",
                        signed, threshold
                    )));
                }
                event = events_rx.recv() => match event {
                    Some(CollectEvent::Response { instance, response }) => {
                        // a final answer supersedes the quick one
                        responses.insert(instance, response);
                    }
                    Some(CollectEvent::Failed { position, error }) => {
                        error!(position, error = %error, "subtree failed");
                        break Err(error);
                    }
                    None => {
                        break Err(ProtocolError::InsufficientSignatures {
                            got: signed,
                            need: threshold,
                        });
                    }
                },
            }
        };

        let _ = stop_tx.send(true);
        while tasks.join_next().await.is_some() {}
        outcome?;

        Ok(responses
            .into_values()
            .filter(|response| response.signature.is_some())
            .collect())
    }

    /// Create, configure and start one sub-protocol
    async fn start_sub(
        &self,
        create_protocol: &CreateProtocolFn,
        name: &str,
        tree: Arc<Tree>,
        params: &SubParams,
    ) -> ProtocolResult<(Arc<dyn SubProtocol>, mpsc::Receiver<SubEvent>)> {
        let sub = create_protocol(name.to_string(), tree.clone()).await?;
        lock(&self.subs).insert(sub.instance_id().to_string(), sub.clone());
        let closed = *self.closing.borrow();
        if closed {
            sub.stop().await;
            return Err(ProtocolError::Finished);
        }

        sub.configure(SubParams {
            threshold: tree.size() - 1,
            ..params.clone()
        });
        let events = sub.take_events().ok_or_else(|| {
            ProtocolError::Config("sub-protocol events already taken".to_string())
        })?;
        sub.start()?;

        debug!(
            instance = %sub.instance_id(),
            subleader = ?tree.children_of(tree.root()).first(),
            size = tree.size(),
            "sub-protocol started"
        );
        Ok((sub, events))
    }

    fn generate_signature(&self, msg: &[u8], responses: &[Response]) -> ProtocolResult<Vec<u8>> {
        let publics = self.node.publics();
        let mut mask = Mask::new(&publics, Some(self.node.index()))?;
        let mut signatures = vec![self.node.suite().sign(&self.node.key_pair().secret, msg)];

        for response in responses {
            if let Some(bytes) = &response.signature {
                signatures.push(BlsSignature::from_bytes(bytes)?);
                mask.merge(&response.mask)?;
            }
        }

        let aggregate = aggregate_signatures(&signatures)?;
        info!(
            instance = %self.node.instance_id(),
            signers = mask.count_enabled(),
            total = mask.count_total(),
            "collective signature generated"
        );
        Ok(append_signature_and_mask(&aggregate, &mask))
    }

    /// Rotate the subleader of the subtree at `position` in the round's partition
    fn regenerate_subtree(&self, position: usize) -> ProtocolResult<Arc<Tree>> {
        let mut config = lock(&self.config);
        let subtrees = config.subtrees.as_mut().ok_or_else(|| {
            ProtocolError::InvalidSubtree("no partition for this round".to_string())
        })?;
        subtrees.regenerate(position)
    }

    async fn shutdown_protocol(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.closing.send(true);
        lock(&self.start_tx).take();
        lock(&self.final_tx).take();

        let subs: Vec<Arc<dyn SubProtocol>> = lock(&self.subs).drain().map(|(_, s)| s).collect();
        for sub in subs {
            sub.stop().await;
        }
        self.node.done().await;
    }
}

/// Drives one subtree on the root, replacing its subleader when it stays silent
struct SubtreeTask {
    protocol: Arc<CosiProtocol>,
    position: usize,
    tree: Arc<Tree>,
    sub: Arc<dyn SubProtocol>,
    events: mpsc::Receiver<SubEvent>,
    params: SubParams,
    create_protocol: CreateProtocolFn,
    name: String,
    deadline: Instant,
    out: mpsc::UnboundedSender<CollectEvent>,
    stop: watch::Receiver<bool>,
}

impl SubtreeTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = wait_closed(&mut self.stop) => return,
                _ = sleep_until(self.deadline) => {
                    self.fail(ProtocolError::Timeout(format!(
                        "subtree {} did not finish in time",
                        self.position
                    )));
                    return;
                }
                event = self.events.recv() => match event {
                    Some(SubEvent::Response(response)) => {
                        let instance = self.sub.instance_id().to_string();
                        if self.out.send(CollectEvent::Response { instance, response }).is_err() {
                            return;
                        }
                    }
                    Some(SubEvent::SubleaderNotResponding) => {
                        if let Err(e) = self.replace_subleader().await {
                            self.fail(e);
                            return;
                        }
                    }
                    None => return,
                },
            }
        }
    }

    async fn replace_subleader(&mut self) -> ProtocolResult<()> {
        let old = self.tree.children_of(self.tree.root()).first().copied();
        self.sub.stop().await;

        let tree = self.protocol.regenerate_subtree(self.position)?;
        let new = tree.children_of(tree.root()).first().copied();
        info!(
            position = self.position,
            old_subleader = ?old,
            new_subleader = ?new,
            "subleader not responding, regenerating subtree"
        );

        let (sub, events) = self
            .protocol
            .start_sub(&self.create_protocol, &self.name, tree.clone(), &self.params)
            .await?;
        self.tree = tree;
        self.sub = sub;
        self.events = events;
        Ok(())
    }

    fn fail(&self, error: ProtocolError) {
        let _ = self.out.send(CollectEvent::Failed {
            position: self.position,
            error,
        });
    }
}

#[async_trait]
impl ProtocolInstance for CosiProtocol {
    async fn dispatch(self: Arc<Self>) -> NetworkResult<()> {
        if !self.node.is_root() {
            self.node.done().await;
            return Ok(());
        }

        let result = self.run().await;
        if let Err(e) = &result {
            warn!(instance = %self.node.instance_id(), error = %e, "collective signing failed");
        }
        if let Some(final_tx) = lock(&self.final_tx).take() {
            let _ = final_tx.send(result);
        }

        self.shutdown_protocol().await;
        Ok(())
    }

    fn deliver(&self, envelope: Envelope) -> NetworkResult<()> {
        Err(NetworkError::InvalidMessage(format!(
            "root protocol does not accept {}",
            envelope.payload.message_type()
        )))
    }

    async fn shutdown(&self) {
        self.shutdown_protocol().await;
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Register the root protocol `root_name` and its sub-protocol `sub_name`
/// on `conode`
pub async fn register_protocols(
    conode: &Arc<Conode>,
    root_name: &str,
    sub_name: &str,
    root_verification: VerificationFn,
    sub_verification: VerificationFn,
) {
    let root_factory: ProtocolFactory = Arc::new(
        move |node: TreeNodeInstance| -> NetworkResult<Arc<dyn ProtocolInstance>> {
            Ok(CosiProtocol::new(node, Some(root_verification.clone())))
        },
    );
    let sub_factory: ProtocolFactory = Arc::new(
        move |node: TreeNodeInstance| -> NetworkResult<Arc<dyn ProtocolInstance>> {
            Ok(SubCosi::new(node, sub_verification.clone()))
        },
    );

    conode.register_protocol(root_name, root_factory).await;
    conode.register_protocol(sub_name, sub_factory).await;
}

/// Register the default protocol pair with one verification predicate
pub async fn register_default_protocols(conode: &Arc<Conode>, verification: VerificationFn) {
    register_protocols(
        conode,
        DEFAULT_PROTOCOL_NAME,
        DEFAULT_SUBPROTOCOL_NAME,
        verification.clone(),
        verification,
    )
    .await;
}

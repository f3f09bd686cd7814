//! Public key distribution
//!
//! The root asks every other tree member for its public key and sends the
//! collected, roster-ordered list back to all of them. Each member checks
//! that its own key sits at its roster index.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cosi_network::{
    Conode, Envelope, KeyDistribute, KeyReply, MessagePayload, NetworkError, NetworkResult,
    ProtocolFactory, ProtocolInstance, Tree, TreeNodeInstance,
};
use cosi_signer::BlsPublicKey;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_TIMEOUT, KEY_DISTRIBUTION_PROTOCOL_NAME, START_FALLBACK};
use crate::error::{ProtocolError, ProtocolResult};
use crate::{lock, wait_closed};

type KeysResult = ProtocolResult<Vec<BlsPublicKey>>;

pub struct KeyDistribution {
    node: TreeNodeInstance,
    timeout: Mutex<Duration>,
    start_tx: Mutex<Option<oneshot::Sender<()>>>,
    start_rx: Mutex<Option<oneshot::Receiver<()>>>,
    messages_tx: mpsc::UnboundedSender<(usize, MessagePayload)>,
    messages_rx: Mutex<Option<mpsc::UnboundedReceiver<(usize, MessagePayload)>>>,
    result_tx: Mutex<Option<oneshot::Sender<KeysResult>>>,
    result_rx: Mutex<Option<oneshot::Receiver<KeysResult>>>,
    closing: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl KeyDistribution {
    pub fn new(node: TreeNodeInstance) -> Arc<Self> {
        let (start_tx, start_rx) = oneshot::channel();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        let (closing, _) = watch::channel(false);

        Arc::new(Self {
            node,
            timeout: Mutex::new(DEFAULT_TIMEOUT),
            start_tx: Mutex::new(Some(start_tx)),
            start_rx: Mutex::new(Some(start_rx)),
            messages_tx,
            messages_rx: Mutex::new(Some(messages_rx)),
            result_tx: Mutex::new(Some(result_tx)),
            result_rx: Mutex::new(Some(result_rx)),
            closing,
            stopped: AtomicBool::new(false),
        })
    }

    /// Instantiate the key distribution on `conode` for `tree`
    pub async fn create(conode: &Arc<Conode>, tree: Arc<Tree>) -> ProtocolResult<Arc<Self>> {
        let instance = conode
            .create_protocol(KEY_DISTRIBUTION_PROTOCOL_NAME, tree)
            .await?;
        instance.into_any().downcast::<KeyDistribution>().map_err(|_| {
            ProtocolError::Config("registered key distribution has the wrong type".to_string())
        })
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *lock(&self.timeout) = timeout;
    }

    pub fn start(&self) -> ProtocolResult<()> {
        if !self.node.is_root() {
            return Err(ProtocolError::Config(
                "only the root starts a key distribution".to_string(),
            ));
        }
        let start_tx = lock(&self.start_tx)
            .take()
            .ok_or(ProtocolError::AlreadyStarted)?;
        start_tx.send(()).map_err(|_| ProtocolError::Finished)
    }

    /// Receiver of the roster-ordered keys; available once
    pub fn keys(&self) -> Option<oneshot::Receiver<KeysResult>> {
        lock(&self.result_rx).take()
    }

    async fn run_root(&self) -> KeysResult {
        let start_rx = lock(&self.start_rx).take().ok_or(ProtocolError::Finished)?;
        let mut messages = lock(&self.messages_rx).take().ok_or(ProtocolError::Finished)?;
        let mut closing = self.closing.subscribe();

        tokio::select! {
            res = start_rx => res.map_err(|_| ProtocolError::Finished)?,
            _ = sleep(START_FALLBACK) => {
                return Err(ProtocolError::Timeout(
                    "timeout, did you forget to call start?".to_string(),
                ));
            }
            _ = wait_closed(&mut closing) => return Err(ProtocolError::Finished),
        }

        for (to, e) in self.node.broadcast(MessagePayload::KeyRequest).await {
            warn!(to, error = %e, "failed to request key");
        }

        let tree = self.node.tree();
        let roster = self.node.roster();
        let expected = tree.size() - 1;
        let deadline = Instant::now() + *lock(&self.timeout);
        let mut replies: BTreeMap<usize, BlsPublicKey> = BTreeMap::new();

        while replies.len() < expected {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    return Err(ProtocolError::Timeout(format!(
                        "received {} of {} keys",
                        replies.len(),
                        expected
                    )));
                }
                _ = wait_closed(&mut closing) => return Err(ProtocolError::Finished),
                msg = messages.recv() => {
                    let Some((from, payload)) = msg else {
                        return Err(ProtocolError::Finished);
                    };
                    let public = match payload {
                        MessagePayload::KeyReply(KeyReply { public }) => public,
                        other => {
                            warn!(from, kind = other.message_type(), "unexpected message during key collection");
                            continue;
                        }
                    };
                    if !tree.contains(from) || tree.is_root(from) {
                        warn!(from, "key reply from outside the tree");
                        continue;
                    }

                    let public = BlsPublicKey::from_bytes(&public)?;
                    let listed = roster.get(from).map(|s| &s.public);
                    if listed != Some(&public) {
                        return Err(ProtocolError::InvalidResponse(format!(
                            "key of node {} does not match the roster",
                            from
                        )));
                    }
                    replies.insert(from, public);
                }
            }
        }

        replies.insert(self.node.index(), self.node.public().clone());
        let publics: Vec<BlsPublicKey> = replies.into_values().collect();
        let distribute = KeyDistribute {
            publics: publics.iter().map(|p| p.to_bytes().to_vec()).collect(),
        };
        for (to, e) in self
            .node
            .broadcast(MessagePayload::KeyDistribute(distribute))
            .await
        {
            warn!(to, error = %e, "failed to distribute keys");
        }

        info!(keys = publics.len(), "keys distributed");
        Ok(publics)
    }

    async fn run_node(&self) -> KeysResult {
        let mut messages = lock(&self.messages_rx).take().ok_or(ProtocolError::Finished)?;
        let mut closing = self.closing.subscribe();
        let root = self.node.tree().root();
        let deadline = Instant::now() + *lock(&self.timeout);

        loop {
            let (from, payload) = tokio::select! {
                _ = sleep_until(deadline) => {
                    return Err(ProtocolError::Timeout("no key distribution received".to_string()));
                }
                _ = wait_closed(&mut closing) => return Err(ProtocolError::Finished),
                msg = messages.recv() => msg.ok_or(ProtocolError::Finished)?,
            };
            if from != root {
                warn!(from, "key distribution message from a node other than the root");
                continue;
            }

            match payload {
                MessagePayload::KeyRequest => {
                    let reply = KeyReply {
                        public: self.node.public().to_bytes().to_vec(),
                    };
                    self.node
                        .send_to(root, MessagePayload::KeyReply(reply))
                        .await?;
                }
                MessagePayload::KeyDistribute(KeyDistribute { publics }) => {
                    let publics = publics
                        .iter()
                        .map(|bytes| BlsPublicKey::from_bytes(bytes))
                        .collect::<Result<Vec<_>, _>>()?;
                    if publics.get(self.node.index()) != Some(self.node.public()) {
                        return Err(ProtocolError::InvalidResponse(
                            "own key missing from the distributed list".to_string(),
                        ));
                    }
                    debug!(node = self.node.index(), keys = publics.len(), "received distributed keys");
                    return Ok(publics);
                }
                other => {
                    warn!(kind = other.message_type(), "unexpected message during key distribution");
                }
            }
        }
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.closing.send(true);
        self.node.done().await;
    }
}

#[async_trait]
impl ProtocolInstance for KeyDistribution {
    async fn dispatch(self: Arc<Self>) -> NetworkResult<()> {
        let result = if self.node.is_root() {
            self.run_root().await
        } else {
            self.run_node().await
        };

        if let Err(e) = &result {
            warn!(node = self.node.index(), error = %e, "key distribution failed");
        }
        if let Some(result_tx) = lock(&self.result_tx).take() {
            let _ = result_tx.send(result);
        }
        self.stop().await;
        Ok(())
    }

    fn deliver(&self, envelope: Envelope) -> NetworkResult<()> {
        self.messages_tx
            .send((envelope.from, envelope.payload))
            .map_err(|_| NetworkError::Closed)
    }

    async fn shutdown(&self) {
        self.stop().await;
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Register the key distribution protocol on `conode`
pub async fn register_key_distribution(conode: &Arc<Conode>) {
    let factory: ProtocolFactory = Arc::new(
        |node: TreeNodeInstance| -> NetworkResult<Arc<dyn ProtocolInstance>> {
            Ok(KeyDistribution::new(node))
        },
    );
    conode
        .register_protocol(KEY_DISTRIBUTION_PROTOCOL_NAME, factory)
        .await;
}

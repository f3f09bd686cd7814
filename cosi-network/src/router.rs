//! In-memory overlay
//!
//! Routes envelopes between conodes living in the same process. Delivery is
//! reliable and ordered per sender. A paused conode buffers everything sent
//! to it until it is resumed, which is how tests simulate unresponsive nodes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use cosi_signer::{BlsKeyPair, BlsSuite};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{NetworkError, NetworkResult};
use crate::message::Envelope;
use crate::node::{Conode, Transport};
use crate::roster::{Roster, ServerIdentity};

#[derive(Default)]
struct NetworkInner {
    conodes: RwLock<HashMap<String, Arc<Conode>>>,
    paused: RwLock<HashMap<String, Vec<Envelope>>>,
    delivered: AtomicU64,
}

impl NetworkInner {
    async fn route(&self, envelope: Envelope) -> NetworkResult<()> {
        let address = envelope
            .tree
            .roster()
            .get(envelope.to)
            .map(|si| si.address.clone())
            .ok_or_else(|| NetworkError::NodeNotFound(format!("roster index {}", envelope.to)))?;

        // Held across delivery so a concurrent resume cannot reorder messages
        let paused = self.paused.read().await;
        if paused.contains_key(&address) {
            drop(paused);
            let mut paused = self.paused.write().await;
            if let Some(queue) = paused.get_mut(&address) {
                debug!(to = %address, msg_type = envelope.payload.message_type(), "buffering message for paused conode");
                queue.push(envelope);
                return Ok(());
            }
            drop(paused);
            return self.deliver(&address, envelope).await;
        }

        let result = self.deliver(&address, envelope).await;
        drop(paused);
        result
    }

    async fn deliver(&self, address: &str, envelope: Envelope) -> NetworkResult<()> {
        let conode = self
            .conodes
            .read()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| NetworkError::NodeNotFound(address.to_string()))?;

        self.delivered.fetch_add(1, Ordering::Relaxed);
        conode.receive(envelope).await
    }
}

struct LocalTransport {
    inner: Weak<NetworkInner>,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, envelope: Envelope) -> NetworkResult<()> {
        let inner = self.inner.upgrade().ok_or(NetworkError::Closed)?;
        inner.route(envelope).await
    }
}

/// Overlay connecting conodes of the same process
#[derive(Default)]
pub struct LocalNetwork {
    inner: Arc<NetworkInner>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport handle for conodes joining this network
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(LocalTransport {
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Add a conode listening on `address`
    pub async fn add_conode(
        &self,
        address: impl Into<String>,
        key_pair: BlsKeyPair,
        suite: BlsSuite,
    ) -> NetworkResult<Arc<Conode>> {
        let address = address.into();
        let mut conodes = self.inner.conodes.write().await;
        if conodes.contains_key(&address) {
            return Err(NetworkError::InvalidRoster(format!(
                "address {} already in use",
                address
            )));
        }

        let conode = Conode::new(address.clone(), key_pair, suite, self.transport());
        conodes.insert(address, conode.clone());
        Ok(conode)
    }

    /// Spin up `n` conodes with deterministic keys and return them with their roster
    pub async fn gen_conodes(
        &self,
        n: usize,
        suite: BlsSuite,
    ) -> NetworkResult<(Vec<Arc<Conode>>, Arc<Roster>)> {
        let mut conodes = Vec::with_capacity(n);
        let mut members = Vec::with_capacity(n);

        for i in 0..n {
            let key_pair = local_key_pair(i)?;
            let address = format!("local://conode-{}", i);
            members.push(ServerIdentity::new(address.clone(), key_pair.public.clone()));
            conodes.push(self.add_conode(address, key_pair, suite.clone()).await?);
        }

        info!(count = n, "local conodes started");
        Ok((conodes, Arc::new(Roster::new(members)?)))
    }

    pub async fn conode(&self, address: &str) -> Option<Arc<Conode>> {
        self.inner.conodes.read().await.get(address).cloned()
    }

    /// Stop delivering to `address`; messages are buffered
    pub async fn pause(&self, address: &str) {
        debug!(address, "pausing conode");
        self.inner
            .paused
            .write()
            .await
            .entry(address.to_string())
            .or_default();
    }

    /// Deliver buffered messages to `address` in order and resume delivery
    pub async fn resume(&self, address: &str) -> NetworkResult<()> {
        let mut paused = self.inner.paused.write().await;
        let buffered = paused.remove(address).unwrap_or_default();
        debug!(address, buffered = buffered.len(), "resuming conode");

        for envelope in buffered {
            self.inner.deliver(address, envelope).await?;
        }
        Ok(())
    }

    pub async fn is_paused(&self, address: &str) -> bool {
        self.inner.paused.read().await.contains_key(address)
    }

    /// Number of envelopes handed to conodes so far
    pub fn delivered_count(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    /// Shut down every instance on every conode and disconnect them
    pub async fn close(&self) {
        let conodes: Vec<Arc<Conode>> = self.inner.conodes.write().await.drain().map(|(_, c)| c).collect();
        for conode in conodes {
            conode.close().await;
        }
        self.inner.paused.write().await.clear();
    }
}

/// Deterministic key pair for the `i`-th local conode
pub fn local_key_pair(i: usize) -> NetworkResult<BlsKeyPair> {
    let mut seed = [0x5au8; 32];
    seed[..8].copy_from_slice(&(i as u64).to_le_bytes());
    BlsKeyPair::from_seed(&seed).map_err(|e| NetworkError::InvalidRoster(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{KeyReply, MessagePayload};
    use crate::node::{ProtocolInstance, TreeNodeInstance};
    use crate::tree::Tree;
    use std::any::Any;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Forwards every received payload to a test channel
    struct Recorder {
        node: TreeNodeInstance,
        seen: mpsc::UnboundedSender<(usize, usize, String)>,
    }

    #[async_trait]
    impl ProtocolInstance for Recorder {
        async fn dispatch(self: Arc<Self>) -> NetworkResult<()> {
            Ok(())
        }

        fn deliver(&self, envelope: Envelope) -> NetworkResult<()> {
            let _ = self.seen.send((
                self.node.index(),
                envelope.from,
                envelope.payload.message_type().to_string(),
            ));
            Ok(())
        }

        async fn shutdown(&self) {
            self.node.done().await;
        }

        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    async fn setup(
        n: usize,
    ) -> (
        LocalNetwork,
        Vec<Arc<Conode>>,
        Arc<Tree>,
        mpsc::UnboundedReceiver<(usize, usize, String)>,
    ) {
        let network = LocalNetwork::new();
        let (conodes, roster) = network.gen_conodes(n, BlsSuite::default()).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        for conode in &conodes {
            let tx = tx.clone();
            conode
                .register_protocol(
                    "recorder",
                    Arc::new(
                        move |node: TreeNodeInstance| -> NetworkResult<Arc<dyn ProtocolInstance>> {
                            Ok(Arc::new(Recorder {
                                node,
                                seen: tx.clone(),
                            }))
                        },
                    ),
                )
                .await;
        }

        let tree = Arc::new(Tree::star(roster, 0).unwrap());
        (network, conodes, tree, rx)
    }

    async fn root_node(conode: &Arc<Conode>, tree: Arc<Tree>) -> Arc<Recorder> {
        conode
            .create_protocol("recorder", tree)
            .await
            .unwrap()
            .into_any()
            .downcast::<Recorder>()
            .unwrap()
    }

    #[tokio::test]
    async fn test_lazy_instantiation_and_broadcast() {
        let (_network, conodes, tree, mut rx) = setup(4).await;
        let root = root_node(&conodes[0], tree).await;

        let failed = root.node.broadcast(MessagePayload::KeyRequest).await;
        assert!(failed.is_empty());

        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (to, from, kind) = rx.recv().await.unwrap();
            assert_eq!(from, 0);
            assert_eq!(kind, "KeyRequest");
            receivers.push(to);
        }
        receivers.sort();
        assert_eq!(receivers, vec![1, 2, 3]);

        for conode in &conodes[1..] {
            assert_eq!(conode.active_instances().await, 1);
        }
    }

    #[tokio::test]
    async fn test_pause_buffers_until_resume() {
        let (network, conodes, tree, mut rx) = setup(3).await;
        let root = root_node(&conodes[0], tree).await;

        network.pause("local://conode-2").await;
        assert!(network.is_paused("local://conode-2").await);

        root.node
            .send_to(2, MessagePayload::KeyReply(KeyReply { public: vec![1] }))
            .await
            .unwrap();
        root.node.send_to(2, MessagePayload::KeyRequest).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .is_err());

        network.resume("local://conode-2").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().2, "KeyReply");
        assert_eq!(rx.recv().await.unwrap().2, "KeyRequest");
        assert_eq!(network.delivered_count(), 2);
    }

    #[tokio::test]
    async fn test_finished_instance_drops_messages() {
        let (_network, conodes, tree, mut rx) = setup(2).await;
        let root = root_node(&conodes[0], tree).await;

        root.node.send_to(0, MessagePayload::KeyRequest).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), (0, 0, "KeyRequest".to_string()));

        root.shutdown().await;
        assert_eq!(conodes[0].active_instances().await, 0);

        root.node.send_to(0, MessagePayload::KeyRequest).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_does_not_instantiate() {
        let (_network, conodes, tree, mut rx) = setup(2).await;
        let root = root_node(&conodes[0], tree).await;

        root.node.send_to(1, MessagePayload::Stop).await.unwrap();
        assert_eq!(conodes[1].active_instances().await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_protocol_and_node() {
        let (network, conodes, tree, _rx) = setup(2).await;
        assert!(matches!(
            conodes[0].create_protocol("missing", tree.clone()).await,
            Err(NetworkError::ProtocolNotRegistered(_))
        ));

        let root = root_node(&conodes[0], tree).await;
        assert!(root.node.send_to(5, MessagePayload::Stop).await.is_err());
        assert!(root.node.send_to_parent(MessagePayload::Stop).await.is_err());

        network.close().await;
        assert!(network.conode("local://conode-1").await.is_none());
        assert!(root.node.send_to(1, MessagePayload::KeyRequest).await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_address_rejected() {
        let network = LocalNetwork::new();
        let kp = local_key_pair(0).unwrap();
        network
            .add_conode("local://a", kp.clone(), BlsSuite::default())
            .await
            .unwrap();
        assert!(network
            .add_conode("local://a", kp, BlsSuite::default())
            .await
            .is_err());
    }
}

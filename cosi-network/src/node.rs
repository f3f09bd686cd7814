//! Conodes and protocol instances
//!
//! A [`Conode`] is one roster member on the overlay. It keeps a registry of
//! protocol factories by name and instantiates a protocol lazily when the
//! first message for an unknown instance arrives. Each instance gets a
//! [`TreeNodeInstance`] handle to talk to its tree neighbours.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use cosi_signer::{BlsKeyPair, BlsPublicKey, BlsSuite};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::message::{generate_instance_id, Envelope, InstanceId, MessagePayload};
use crate::roster::Roster;
use crate::tree::Tree;

/// Transport trait for sending messages
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver an envelope to `envelope.to`
    async fn send(&self, envelope: Envelope) -> NetworkResult<()>;
}

/// A running protocol on one node
#[async_trait]
pub trait ProtocolInstance: Send + Sync + 'static {
    /// Main loop, spawned once when the instance is created
    async fn dispatch(self: Arc<Self>) -> NetworkResult<()>;

    /// Hand an incoming message to the instance. Must not block.
    fn deliver(&self, envelope: Envelope) -> NetworkResult<()>;

    /// Release the instance's resources
    async fn shutdown(&self);

    /// Downcast support for callers that know the concrete protocol
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Builds a protocol instance for a tree node
pub type ProtocolFactory =
    Arc<dyn Fn(TreeNodeInstance) -> NetworkResult<Arc<dyn ProtocolInstance>> + Send + Sync>;

#[derive(Default)]
struct InstanceTable {
    active: HashMap<InstanceId, Arc<dyn ProtocolInstance>>,
    finished: HashSet<InstanceId>,
}

/// One participant on the overlay
pub struct Conode {
    address: String,
    key_pair: Arc<BlsKeyPair>,
    suite: BlsSuite,
    transport: Arc<dyn Transport>,
    factories: RwLock<HashMap<String, ProtocolFactory>>,
    instances: RwLock<InstanceTable>,
    me: Weak<Conode>,
}

impl Conode {
    /// Create a new conode
    pub fn new(
        address: impl Into<String>,
        key_pair: BlsKeyPair,
        suite: BlsSuite,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let address = address.into();
        Arc::new_cyclic(|me| Self {
            address,
            key_pair: Arc::new(key_pair),
            suite,
            transport,
            factories: RwLock::new(HashMap::new()),
            instances: RwLock::new(InstanceTable::default()),
            me: me.clone(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn public(&self) -> &BlsPublicKey {
        &self.key_pair.public
    }

    pub fn suite(&self) -> &BlsSuite {
        &self.suite
    }

    /// Roster index of this conode in `roster`
    pub fn index_in(&self, roster: &Roster) -> Option<usize> {
        roster.index_of_address(&self.address)
    }

    /// Register a protocol factory under `name`
    pub async fn register_protocol(&self, name: impl Into<String>, factory: ProtocolFactory) {
        self.factories.write().await.insert(name.into(), factory);
    }

    /// Create a fresh instance of `name` on `tree`, with this conode's node
    pub async fn create_protocol(
        &self,
        name: &str,
        tree: Arc<Tree>,
    ) -> NetworkResult<Arc<dyn ProtocolInstance>> {
        let instance_id = generate_instance_id();
        let instance = self.instantiate(name, instance_id.clone(), tree).await?;
        self.instances
            .write()
            .await
            .active
            .insert(instance_id, instance.clone());

        spawn_dispatch(instance.clone());
        Ok(instance)
    }

    /// Entry point for messages from the transport
    pub async fn receive(&self, envelope: Envelope) -> NetworkResult<()> {
        let instance = {
            let mut table = self.instances.write().await;
            if table.finished.contains(&envelope.instance_id) {
                debug!(
                    conode = %self.address,
                    instance = %envelope.instance_id,
                    msg_type = envelope.payload.message_type(),
                    "dropping message for finished instance"
                );
                return Ok(());
            }

            match table.active.get(&envelope.instance_id) {
                Some(instance) => instance.clone(),
                None => {
                    if matches!(envelope.payload, MessagePayload::Stop) {
                        debug!(conode = %self.address, instance = %envelope.instance_id, "stop for unknown instance");
                        return Ok(());
                    }
                    let instance = self
                        .instantiate(
                            &envelope.protocol,
                            envelope.instance_id.clone(),
                            envelope.tree.clone(),
                        )
                        .await?;
                    table
                        .active
                        .insert(envelope.instance_id.clone(), instance.clone());
                    spawn_dispatch(instance.clone());
                    instance
                }
            }
        };

        instance.deliver(envelope)
    }

    async fn instantiate(
        &self,
        name: &str,
        instance_id: InstanceId,
        tree: Arc<Tree>,
    ) -> NetworkResult<Arc<dyn ProtocolInstance>> {
        let factory = self
            .factories
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| NetworkError::ProtocolNotRegistered(name.to_string()))?;

        let index = self.index_in(tree.roster()).ok_or_else(|| {
            NetworkError::NodeNotFound(format!("{} not in roster", self.address))
        })?;
        if !tree.contains(index) {
            return Err(NetworkError::NodeNotFound(format!(
                "{} not in tree {}",
                self.address,
                tree.id()
            )));
        }

        debug!(conode = %self.address, protocol = name, instance = %instance_id, "instantiating protocol");
        factory(TreeNodeInstance {
            instance_id,
            protocol: name.to_string(),
            tree,
            index,
            key_pair: self.key_pair.clone(),
            suite: self.suite.clone(),
            transport: self.transport.clone(),
            conode: self.me.clone(),
        })
    }

    async fn finish_instance(&self, instance_id: &str) {
        let mut table = self.instances.write().await;
        table.active.remove(instance_id);
        table.finished.insert(instance_id.to_string());
    }

    /// Number of instances that have not called `done`
    pub async fn active_instances(&self) -> usize {
        self.instances.read().await.active.len()
    }

    /// Shut down every active instance
    pub async fn close(&self) {
        let active: Vec<Arc<dyn ProtocolInstance>> =
            self.instances.read().await.active.values().cloned().collect();
        for instance in active {
            instance.shutdown().await;
        }
    }
}

fn spawn_dispatch(instance: Arc<dyn ProtocolInstance>) {
    tokio::spawn(async move {
        if let Err(e) = instance.dispatch().await {
            warn!(error = %e, "protocol dispatch failed");
        }
    });
}

/// Handle given to a protocol instance running on one tree node
#[derive(Clone)]
pub struct TreeNodeInstance {
    instance_id: InstanceId,
    protocol: String,
    tree: Arc<Tree>,
    index: usize,
    key_pair: Arc<BlsKeyPair>,
    suite: BlsSuite,
    transport: Arc<dyn Transport>,
    conode: Weak<Conode>,
}

impl TreeNodeInstance {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn protocol_name(&self) -> &str {
        &self.protocol
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn roster(&self) -> &Arc<Roster> {
        self.tree.roster()
    }

    /// Roster index of this node
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn key_pair(&self) -> &BlsKeyPair {
        &self.key_pair
    }

    pub fn public(&self) -> &BlsPublicKey {
        &self.key_pair.public
    }

    pub fn suite(&self) -> &BlsSuite {
        &self.suite
    }

    /// Public keys of the roster, in roster order
    pub fn publics(&self) -> Vec<BlsPublicKey> {
        self.tree.publics()
    }

    pub fn is_root(&self) -> bool {
        self.tree.is_root(self.index)
    }

    pub fn is_leaf(&self) -> bool {
        self.tree.is_leaf(self.index)
    }

    pub fn parent(&self) -> Option<usize> {
        self.tree.parent_of(self.index)
    }

    pub fn children(&self) -> &[usize] {
        self.tree.children_of(self.index)
    }

    /// Send a payload to another node of the tree (or to ourselves)
    pub async fn send_to(&self, to: usize, payload: MessagePayload) -> NetworkResult<()> {
        if !self.tree.contains(to) {
            return Err(NetworkError::NodeNotFound(format!(
                "{} not in tree {}",
                to,
                self.tree.id()
            )));
        }

        let envelope = Envelope::new(
            self.instance_id.clone(),
            self.protocol.clone(),
            self.tree.clone(),
            self.index,
            to,
            payload,
        );
        self.transport.send(envelope).await
    }

    pub async fn send_to_parent(&self, payload: MessagePayload) -> NetworkResult<()> {
        let parent = self
            .parent()
            .ok_or_else(|| NetworkError::NodeNotFound("root has no parent".to_string()))?;
        self.send_to(parent, payload).await
    }

    /// Send to every child, returning the children that could not be reached
    pub async fn send_to_children(
        &self,
        payload: MessagePayload,
    ) -> Vec<(usize, NetworkError)> {
        let children = self.children().to_vec();
        self.send_to_all(children, payload).await
    }

    /// Send to every other node of the tree
    pub async fn broadcast(&self, payload: MessagePayload) -> Vec<(usize, NetworkError)> {
        let others: Vec<usize> = self
            .tree
            .node_indices()
            .into_iter()
            .filter(|&i| i != self.index)
            .collect();
        self.send_to_all(others, payload).await
    }

    async fn send_to_all(
        &self,
        targets: Vec<usize>,
        payload: MessagePayload,
    ) -> Vec<(usize, NetworkError)> {
        let mut failed = Vec::new();
        for to in targets {
            if let Err(e) = self.send_to(to, payload.clone()).await {
                failed.push((to, e));
            }
        }
        failed
    }

    /// Create another protocol instance on this node's conode
    pub async fn create_protocol(
        &self,
        name: &str,
        tree: Arc<Tree>,
    ) -> NetworkResult<Arc<dyn ProtocolInstance>> {
        let conode = self.conode.upgrade().ok_or(NetworkError::Closed)?;
        conode.create_protocol(name, tree).await
    }

    /// Mark the instance finished; later messages for it are dropped
    pub async fn done(&self) {
        if let Some(conode) = self.conode.upgrade() {
            conode.finish_instance(&self.instance_id).await;
        }
    }
}

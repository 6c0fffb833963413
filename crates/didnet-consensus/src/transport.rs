// TRANSPORT CONTRACT
// The only way consensus traffic leaves or enters the node
//
// The engine never opens sockets. Raft and PoA register one handler per
// topic and exchange opaque payloads through this contract. `LocalNetwork`
// is an in-process implementation used by tests and single-host clusters.

use crate::engine::NodeId;
use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Callback invoked for every inbound payload on a registered topic.
/// Arguments are the sender id and the raw payload.
pub type MessageHandler = Arc<dyn Fn(NodeId, Vec<u8>) + Send + Sync>;

/// Transport-level view of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: NodeId,
    pub address: String,
    pub connected: bool,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("unknown peer {0}")]
    UnknownPeer(NodeId),

    #[error("peer {0} is unreachable")]
    Unreachable(NodeId),

    #[error("transport closed")]
    Closed,
}

/// Narrow peer-to-peer contract consumed by the consensus engine.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Id this transport sends as.
    fn local_id(&self) -> &str;

    /// Route inbound payloads for `topic` to `handler`, replacing any
    /// previous handler for the topic.
    fn register_message_handler(&self, topic: &str, handler: MessageHandler);

    async fn send_message(
        &self,
        peer_id: &str,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;

    /// Best-effort delivery to every connected peer.
    async fn broadcast_message(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    fn peers(&self) -> HashMap<NodeId, PeerInfo>;
}

struct Envelope {
    from: NodeId,
    topic: String,
    payload: Vec<u8>,
}

struct Mailbox {
    address: String,
    tx: mpsc::UnboundedSender<Envelope>,
}

#[derive(Default)]
struct NetworkInner {
    mailboxes: HashMap<NodeId, Mailbox>,
    disconnected: HashSet<NodeId>,
}

/// In-process network hub.
///
/// Each joined node gets its own ordered mailbox drained by a dispatcher
/// task, so messages between a pair of nodes arrive in send order.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node to the network. Must be called inside a tokio runtime.
    pub fn join(&self, node_id: impl Into<NodeId>) -> Arc<LocalTransport> {
        let node_id = node_id.into();
        let address = format!("local://{}", node_id);
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let handlers: Arc<RwLock<HashMap<String, MessageHandler>>> = Arc::default();

        let dispatch_handlers = handlers.clone();
        let dispatch_id = node_id.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let handler = dispatch_handlers.read().get(&envelope.topic).cloned();
                match handler {
                    Some(handler) => handler(envelope.from, envelope.payload),
                    None => debug!(
                        "{}: no handler for topic {}, dropping message from {}",
                        dispatch_id, envelope.topic, envelope.from
                    ),
                }
            }
        });

        self.inner.lock().mailboxes.insert(
            node_id.clone(),
            Mailbox {
                address: address.clone(),
                tx,
            },
        );

        Arc::new(LocalTransport {
            id: node_id,
            network: self.clone(),
            handlers,
        })
    }

    /// Remove a node entirely; its dispatcher exits once drained.
    pub fn leave(&self, node_id: &str) {
        let mut inner = self.inner.lock();
        inner.mailboxes.remove(node_id);
        inner.disconnected.remove(node_id);
    }

    /// Cut a node off: nothing is delivered to or from it until reconnected.
    pub fn disconnect(&self, node_id: &str) {
        self.inner.lock().disconnected.insert(node_id.to_string());
    }

    pub fn reconnect(&self, node_id: &str) {
        self.inner.lock().disconnected.remove(node_id);
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        let inner = self.inner.lock();
        inner.mailboxes.contains_key(node_id) && !inner.disconnected.contains(node_id)
    }

    fn deliver(
        &self,
        from: &str,
        to: &str,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let inner = self.inner.lock();
        let mailbox = inner
            .mailboxes
            .get(to)
            .ok_or_else(|| TransportError::UnknownPeer(to.to_string()))?;
        if inner.disconnected.contains(from) || inner.disconnected.contains(to) {
            return Err(TransportError::Unreachable(to.to_string()));
        }
        mailbox
            .tx
            .send(Envelope {
                from: from.to_string(),
                topic: topic.to_string(),
                payload,
            })
            .map_err(|_| TransportError::Closed)
    }
}

/// One node's endpoint on a `LocalNetwork`.
pub struct LocalTransport {
    id: NodeId,
    network: LocalNetwork,
    handlers: Arc<RwLock<HashMap<String, MessageHandler>>>,
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_id(&self) -> &str {
        &self.id
    }

    fn register_message_handler(&self, topic: &str, handler: MessageHandler) {
        self.handlers.write().insert(topic.to_string(), handler);
    }

    async fn send_message(
        &self,
        peer_id: &str,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.network.deliver(&self.id, peer_id, topic, payload)
    }

    async fn broadcast_message(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let targets: Vec<NodeId> = self
            .peers()
            .into_values()
            .filter(|peer| peer.connected)
            .map(|peer| peer.id)
            .collect();
        for target in targets {
            if let Err(e) = self.network.deliver(&self.id, &target, topic, payload.clone()) {
                warn!("{}: broadcast to {} failed: {}", self.id, target, e);
            }
        }
        Ok(())
    }

    fn peers(&self) -> HashMap<NodeId, PeerInfo> {
        let inner = self.network.inner.lock();
        inner
            .mailboxes
            .iter()
            .filter(|(id, _)| **id != self.id)
            .map(|(id, mailbox)| {
                (
                    id.clone(),
                    PeerInfo {
                        id: id.clone(),
                        address: mailbox.address.clone(),
                        connected: !inner.disconnected.contains(id)
                            && !inner.disconnected.contains(&self.id),
                    },
                )
            })
            .collect()
    }
}

//! Async embedding of the coordinator: wire decoding, self-delivery of own
//! votes, publication to peers and periodic garbage collection.

use crate::blockchain::Block;
use crate::consensus::{
    CodecError, ConsensusCoordinator, ConsensusError, ConsensusMessage, RouteOutcome, SenderId,
};
use crate::topic::Topic;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct TransportError(pub String);

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transport error: {}", self.0)
    }
}

impl std::error::Error for TransportError {}

#[derive(Debug)]
pub enum NodeError {
    Consensus(ConsensusError),
    Codec(CodecError),
    Transport(TransportError),
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeError::Consensus(e) => write!(f, "{}", e),
            NodeError::Codec(e) => write!(f, "{}", e),
            NodeError::Transport(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<ConsensusError> for NodeError {
    fn from(err: ConsensusError) -> Self {
        NodeError::Consensus(err)
    }
}

impl From<CodecError> for NodeError {
    fn from(err: CodecError) -> Self {
        NodeError::Codec(err)
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Codec(CodecError::from(err))
    }
}

impl From<TransportError> for NodeError {
    fn from(err: TransportError) -> Self {
        NodeError::Transport(err)
    }
}

/// Outbound side of the network collaborator.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: Topic, payload: Vec<u8>) -> Result<(), TransportError>;
}

pub struct ConsensusNode<T: Transport> {
    coordinator: Arc<ConsensusCoordinator>,
    transport: T,
}

impl<T: Transport> ConsensusNode<T> {
    pub fn new(coordinator: Arc<ConsensusCoordinator>, transport: T) -> Self {
        ConsensusNode {
            coordinator,
            transport,
        }
    }

    pub fn coordinator(&self) -> &Arc<ConsensusCoordinator> {
        &self.coordinator
    }

    /// Proposes `block` with this node as proposer and publishes the
    /// resulting PrePrepare and own Prepare.
    pub async fn propose(&self, block: Block) -> Result<RouteOutcome, NodeError> {
        info!(height = block.height(), hash = %block.hash(), "Node: proposing block");
        let local_id = self.coordinator.local_id().clone();
        let result = self.coordinator.route_proposal(block, local_id);
        self.settle(result).await
    }

    /// Handles one payload from the transport. Undecodable payloads are
    /// dropped without error.
    pub async fn handle_inbound(&self, payload: &[u8]) -> Result<RouteOutcome, NodeError> {
        let message = match ConsensusMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Node: undecodable payload dropped");
                return Ok(RouteOutcome::dropped());
            }
        };
        let result = self.coordinator.route_vote(message);
        self.settle(result).await
    }

    /// Applies and publishes everything a routing call produced. Own votes
    /// reach this node's round before the transport sees them, so a failing
    /// transport never keeps the node from counting its own vote. Publish
    /// failures are logged and the queue is drained regardless; the first
    /// one is returned at the end.
    async fn settle(
        &self,
        result: Result<RouteOutcome, ConsensusError>,
    ) -> Result<RouteOutcome, NodeError> {
        let mut queue = VecDeque::new();
        let mut confirmed = Vec::new();
        let mut failure = None;
        let first = match result {
            Ok(outcome) => {
                queue.extend(outcome.outbound.iter().cloned());
                confirmed.extend(outcome.finalized.clone());
                Some(outcome)
            }
            Err(mut err) => {
                queue.extend(err.take_outbound());
                failure = Some(err);
                None
            }
        };

        let mut to_publish = Vec::new();
        while let Some(message) = queue.pop_front() {
            // The coordinator already applied the PrePrepare of a local proposal.
            if !matches!(message, ConsensusMessage::PrePrepare(_)) {
                match self.coordinator.route_vote(message.clone()) {
                    Ok(outcome) => {
                        queue.extend(outcome.outbound);
                        confirmed.extend(outcome.finalized);
                    }
                    Err(mut err) => {
                        warn!(error = %err, "Node: own vote could not finalize round");
                        queue.extend(err.take_outbound());
                        failure.get_or_insert(err);
                    }
                }
            }
            to_publish.push(message);
        }

        let mut publish_failure = None;
        for message in to_publish {
            let sent = match message.encode() {
                Ok(payload) => self
                    .transport
                    .publish(Topic::ConsensusMessagePublish, payload)
                    .await
                    .map_err(NodeError::from),
                Err(e) => Err(NodeError::from(e)),
            };
            if let Err(e) = sent {
                warn!(
                    error = %e,
                    consensus_id = %message.consensus_id(),
                    kind = ?message.msg_type(),
                    "Node: failed to publish message"
                );
                publish_failure.get_or_insert(e);
            }
        }
        for block in &confirmed {
            if let Err(e) = self.confirm(block).await {
                warn!(error = %e, height = block.height(), "Node: failed to publish confirmation");
                publish_failure.get_or_insert(e);
            }
        }

        match (first, failure, publish_failure) {
            (_, Some(err), _) => Err(NodeError::Consensus(err)),
            (_, None, Some(err)) => Err(err),
            (Some(outcome), None, None) => Ok(outcome),
            (None, None, None) => Ok(RouteOutcome::dropped()),
        }
    }

    async fn confirm(&self, block: &Block) -> Result<(), NodeError> {
        info!(
            node = %self.coordinator.local_id(),
            height = block.height(),
            "Node: block confirmed"
        );
        let payload = serde_json::to_vec(block)?;
        self.transport.publish(Topic::BlockConfirm, payload).await?;
        Ok(())
    }
}

/// Periodic housekeeping: every tick discards rounds that have not
/// finished within `round_timeout`, then removes finished rounds whose
/// grace period has passed.
pub fn spawn_gc(
    coordinator: Arc<ConsensusCoordinator>,
    every: Duration,
    round_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let stale = coordinator.discard_stale(round_timeout);
            if !stale.is_empty() {
                info!(discarded = stale.len(), "Node: timed out unfinished rounds");
            }
            coordinator.collect_garbage(Instant::now());
        }
    })
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: SenderId,
    pub topic: Topic,
    pub payload: Vec<u8>,
}

/// In-process network: consensus traffic goes to every other member,
/// confirmations go to a broadcast channel observers subscribe to.
pub struct LocalNetwork {
    inboxes: RwLock<HashMap<SenderId, mpsc::UnboundedSender<Envelope>>>,
    confirmations: broadcast::Sender<Envelope>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        let (confirmations, _) = broadcast::channel(1024);
        Arc::new(LocalNetwork {
            inboxes: RwLock::new(HashMap::new()),
            confirmations,
        })
    }

    /// Registers `id` and returns its transport and inbox.
    pub fn join(
        self: &Arc<Self>,
        id: SenderId,
    ) -> (LocalTransport, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.write().insert(id.clone(), tx);
        let transport = LocalTransport {
            id,
            network: self.clone(),
        };
        (transport, rx)
    }

    pub fn subscribe_confirmations(&self) -> broadcast::Receiver<Envelope> {
        self.confirmations.subscribe()
    }
}

pub struct LocalTransport {
    id: SenderId,
    network: Arc<LocalNetwork>,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn publish(&self, topic: Topic, payload: Vec<u8>) -> Result<(), TransportError> {
        let envelope = Envelope {
            from: self.id.clone(),
            topic,
            payload,
        };

        match topic {
            Topic::ConsensusMessagePublish => {
                let inboxes = self.network.inboxes.read();
                for (peer, inbox) in inboxes.iter().filter(|(peer, _)| **peer != self.id) {
                    if inbox.send(envelope.clone()).is_err() {
                        warn!(peer = %peer, "Network: peer inbox closed");
                    }
                }
            }
            Topic::BlockConfirm => {
                // No subscribers is fine.
                let _ = self.network.confirmations.send(envelope);
            }
        }
        Ok(())
    }
}

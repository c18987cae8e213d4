// Project modules
use crate::ln_types::{ChannelPoint, NodePubkey, PaymentHash, Preimage};

// External modules
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

// Standard modules
use std::time::Duration;

/// Errors reported by a node, either synchronously or on a subscription's error stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

/*
 * A subscription handed out by a node: an update receiver and an error receiver. The producer closes both when
 * the subscription is finished or the node is torn down, consumers treat a closed stream as terminal.
 */
#[derive(Debug)]
pub struct UpdateStream<T> {
    pub updates: mpsc::UnboundedReceiver<T>,
    pub errors: mpsc::UnboundedReceiver<NodeError>,
}

/*
 * Producer half of an UpdateStream. Dropping it closes the stream.
 */
#[derive(Debug, Clone)]
pub struct UpdateSink<T> {
    updates: mpsc::UnboundedSender<T>,
    errors: mpsc::UnboundedSender<NodeError>,
}

impl<T> UpdateSink<T> {
    // Returns false once the consumer has gone away
    pub fn send(&self, update: T) -> bool {
        self.updates.send(update).is_ok()
    }

    pub fn fail(&self, err: NodeError) -> bool {
        self.errors.send(err).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.updates.is_closed()
    }
}

pub fn update_stream<T>() -> (UpdateSink<T>, UpdateStream<T>) {
    let (updates_tx, updates_rx) = mpsc::unbounded_channel();
    let (errors_tx, errors_rx) = mpsc::unbounded_channel();
    let sink = UpdateSink {
        updates: updates_tx,
        errors: errors_tx,
    };
    let stream = UpdateStream {
        updates: updates_rx,
        errors: errors_rx,
    };

    (sink, stream)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub pubkey: NodePubkey,
    pub alias: String,
}

/*
 * A node as seen in another node's graph, optionally with its channels.
 */
#[derive(Clone, Debug)]
pub struct GraphNode {
    pub pubkey: NodePubkey,
    pub alias: String,
    pub addresses: Vec<String>,
    pub channels: Vec<ChannelEdge>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelEdge {
    pub chan_id: u64,
    pub capacity_sat: u64,
    pub node1: NodePubkey,
    pub node2: NodePubkey,
}

impl ChannelEdge {
    // The other end of the channel as seen from `node`
    pub fn counterparty(&self, node: &NodePubkey) -> NodePubkey {
        if &self.node1 == node {
            self.node2
        } else {
            self.node1
        }
    }
}

/*
 * A channel that a node currently has open.
 */
#[derive(Clone, Debug)]
pub struct ChannelSummary {
    pub chan_id: u64,
    pub channel_point: ChannelPoint,
    pub remote_pubkey: NodePubkey,
    pub capacity_sat: u64,
    pub local_balance_msat: u64,
    pub pending_htlcs: usize,
    pub active: bool,
}

#[derive(Clone, Debug)]
pub struct OpenChannelParams {
    pub peer: NodePubkey,
    pub capacity_sat: u64,
    pub push_sat: u64,
    pub private: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpenChannelUpdate {
    Pending { txid: String },
    Open(ChannelPoint),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseChannelUpdate {
    Pending { closing_txid: String },
    Closed,
}

/// An HTLC as recorded by the receiving node when the receivable was accepted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcRecord {
    pub chan_id: u64,
    pub amount_msat: u64,
    /// Endorsement signal set by the upstream peer on the incoming HTLC.
    pub incoming_endorsed: bool,
    pub accept_height: u32,
    pub expiry_height: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceivableState {
    Open,
    Accepted,
    Settled,
    Canceled,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivableUpdate {
    pub hash: PaymentHash,
    pub state: ReceivableState,
    pub amount_paid_msat: u64,
    pub htlcs: Vec<HtlcRecord>,
}

/*
 * A hold receivable that was created on a node, the handle that payers dispatch against.
 */
#[derive(Clone, Debug)]
pub struct Receivable {
    pub hash: PaymentHash,
    pub destination: NodePubkey,
    pub amount_msat: u64,
    pub final_cltv: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentState {
    InFlight,
    Succeeded,
    Failed,
}

impl PaymentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentState::Succeeded | PaymentState::Failed)
    }
}

/*
 * Why a payment failed, None means the payment succeeded.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FailureReason {
    #[default]
    None,
    Timeout,
    NoRoute,
    Error,
    IncorrectPaymentDetails,
    InsufficientBalance,
    Canceled,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentUpdate {
    pub hash: PaymentHash,
    pub state: PaymentState,
    pub failure_reason: FailureReason,
}

#[derive(Clone, Debug)]
pub struct DispatchRequest {
    pub receivable: Receivable,
    pub max_fee_msat: u64,
    pub timeout: Duration,
    pub endorse: bool,
}

/// NodeHandle is the set of capabilities the experiment needs from each participating node. Every call goes to the
/// node it was obtained for, subscriptions are closed by the node when finished.
#[async_trait]
pub trait NodeHandle: Send + Sync {
    /// Identity of the node behind this handle.
    async fn get_info(&self) -> Result<NodeInfo, NodeError>;

    /// Create a hold receivable keyed by `hash`. It is accepted once paid but only resolves on settle or cancel.
    async fn create_hold_receivable(
        &self,
        hash: PaymentHash,
        amount_msat: u64,
        final_cltv: u64,
    ) -> Result<Receivable, NodeError>;

    /// Stream state changes of a receivable, starting with its current state.
    async fn subscribe_receivable(&self, hash: PaymentHash) -> Result<UpdateStream<ReceivableUpdate>, NodeError>;

    /// Settle the receivable locked to `preimage`'s hash.
    async fn settle_receivable(&self, preimage: Preimage) -> Result<(), NodeError>;

    /// Reject the receivable, failing any HTLCs held for it back to the sender.
    async fn cancel_receivable(&self, hash: PaymentHash) -> Result<(), NodeError>;

    /// Pay a receivable created on another node, streaming the payment's status.
    async fn dispatch_payment(&self, request: DispatchRequest) -> Result<UpdateStream<PaymentUpdate>, NodeError>;

    async fn list_peers(&self) -> Result<Vec<NodePubkey>, NodeError>;

    async fn connect_peer(&self, peer: NodePubkey, address: &str) -> Result<(), NodeError>;

    async fn open_channel(&self, params: OpenChannelParams) -> Result<UpdateStream<OpenChannelUpdate>, NodeError>;

    async fn close_channel(
        &self,
        point: ChannelPoint,
        force: bool,
    ) -> Result<UpdateStream<CloseChannelUpdate>, NodeError>;

    async fn list_channels(&self) -> Result<Vec<ChannelSummary>, NodeError>;

    /// Look up a node in this node's view of the graph.
    async fn get_node_info(&self, node: NodePubkey, include_channels: bool) -> Result<GraphNode, NodeError>;

    async fn get_best_block_height(&self) -> Result<u32, NodeError>;
}

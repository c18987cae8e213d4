// Project modules
use crate::chain_controller::ChainError;
use crate::ln_node::NodeError;
use crate::ln_types::NodePubkey;
use crate::node_roster::RosterError;

// External modules
use thiserror::Error;

/// Why a single payment attempt did not produce a normal outcome. Setup variants are returned by
/// `execute_payment` directly, the rest travel inside the payment's outcome.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PaymentError {
    #[error("payment setup failed: {0}")]
    Setup(String),
    #[error("could not create receivable: {0}")]
    ReceivableCreation(NodeError),
    #[error("could not dispatch payment: {0}")]
    Dispatch(NodeError),
    #[error("subscription failed: {0}")]
    Stream(String),
    #[error("could not resolve receivable: {0}")]
    Resolution(NodeError),
    #[error("protocol invariant violated: {0}")]
    ProtocolInvariant(String),
    #[error("payment cancelled")]
    Cancelled,
    #[error("payment task failed: {0}")]
    TaskFailed(String),
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error("peer {peer} not connected after {attempts} attempts")]
    PeerTimeout { peer: NodePubkey, attempts: u32 },
    #[error("no address known for node {0}")]
    NoAddress(NodePubkey),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("{0}")]
    Stream(String),
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum AttackError {
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Harness(#[from] HarnessError),
    #[error(transparent)]
    Roster(#[from] RosterError),
    #[error("target {0} has no channels")]
    NoTargetChannel(NodePubkey),
}

// Project modules
use crate::ln_node::NodeHandle;

// External modules
use thiserror::Error;

// Standard modules
use std::fmt;
use std::sync::Arc;

// Number of participants the experiment runs with
pub const ROSTER_SIZE: usize = 3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RosterError {
    #[error("roster needs exactly {expected} nodes, got {actual}")]
    WrongSize { expected: usize, actual: usize },
    #[error("no such participant: {0}")]
    NoSuchParticipant(usize),
}

/*
 * Index of a participant in the roster. Only constructible for indices that exist, so roster lookups with a
 * NodeIndex can not fail.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(usize);

impl NodeIndex {
    pub fn new(index: usize) -> Result<Self, RosterError> {
        if index < ROSTER_SIZE {
            Ok(NodeIndex(index))
        } else {
            Err(RosterError::NoSuchParticipant(index))
        }
    }

    pub fn get(&self) -> usize {
        self.0
    }

    pub fn all() -> impl Iterator<Item = NodeIndex> {
        (0..ROSTER_SIZE).map(NodeIndex)
    }
}

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "A{}", self.0)
    }
}

/*
 * The fixed set of nodes the experiment controls. Read-only once built and shared by every task.
 */
#[derive(Clone)]
pub struct NodeRoster {
    nodes: [Arc<dyn NodeHandle>; ROSTER_SIZE],
}

impl NodeRoster {
    pub fn new(nodes: Vec<Arc<dyn NodeHandle>>) -> Result<Self, RosterError> {
        let actual = nodes.len();
        let nodes: [Arc<dyn NodeHandle>; ROSTER_SIZE] = nodes.try_into().map_err(|_| RosterError::WrongSize {
            expected: ROSTER_SIZE,
            actual,
        })?;

        Ok(NodeRoster { nodes })
    }

    pub fn node(&self, index: NodeIndex) -> &Arc<dyn NodeHandle> {
        &self.nodes[index.0]
    }
}

impl fmt::Debug for NodeRoster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRoster").field("size", &ROSTER_SIZE).finish()
    }
}

// Project modules
use crate::chain_controller::{mine_blocks, BlockMiner};
use crate::jam_error::HarnessError;
use crate::ln_node::{ChannelEdge, CloseChannelUpdate, GraphNode, NodeHandle, OpenChannelParams, OpenChannelUpdate};
use crate::ln_types::{ChannelPoint, NodePubkey};

// External modules
use tokio::select;
use tokio_util::sync::CancellationToken;

// Standard modules
use std::sync::Arc;
use std::time::Duration;

pub const CONNECT_ATTEMPTS: u32 = 5;
pub const CONFIRMATION_BLOCKS: u32 = 6;

/// Channel to open from one node to a peer. The peer's address is looked up in the opener's graph view when not
/// given.
#[derive(Clone, Debug)]
pub struct OpenChannelReq {
    pub peer: NodePubkey,
    pub address: Option<String>,
    pub capacity_sat: u64,
    pub push_sat: u64,
    pub private: bool,
}

/*
 * Channel and peer management on top of the node handles. Every wait races the harness scope.
 */
#[derive(Clone)]
pub struct GraphHarness {
    miner: Arc<dyn BlockMiner>,
    poll_interval: Duration,
    scope: CancellationToken,
}

impl GraphHarness {
    pub fn new(miner: Arc<dyn BlockMiner>, scope: CancellationToken) -> Self {
        let harness = GraphHarness {
            miner,
            poll_interval: Duration::from_secs(1),
            scope,
        };
        harness
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub async fn lookup_node(&self, viewer: &dyn NodeHandle, node: NodePubkey) -> Result<GraphNode, HarnessError> {
        Ok(viewer.get_node_info(node, true).await?)
    }

    pub async fn peer_connected(&self, node: &dyn NodeHandle, peer: NodePubkey) -> Result<bool, HarnessError> {
        Ok(node.list_peers().await?.contains(&peer))
    }

    /*
     * Ask the node to connect and wait for the peer to show up in its peer list.
     */
    pub async fn connect_peer(&self, node: &dyn NodeHandle, peer: NodePubkey, address: &str) -> Result<(), HarnessError> {
        node.connect_peer(peer, address).await?;

        for _ in 0..CONNECT_ATTEMPTS {
            if self.peer_connected(node, peer).await? {
                log::info!("connected to peer {} at {}", peer.short(), address);
                return Ok(());
            }
            select! {
                biased;
                _ = self.scope.cancelled() => return Err(HarnessError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        Err(HarnessError::PeerTimeout {
            peer,
            attempts: CONNECT_ATTEMPTS,
        })
    }

    /*
     * Open a channel, connecting first if needed. Blocks are mined once the funding transaction is pending, returns
     * the channel point when the channel is open.
     */
    pub async fn open_channel(&self, node: &dyn NodeHandle, req: OpenChannelReq) -> Result<ChannelPoint, HarnessError> {
        if !self.peer_connected(node, req.peer).await? {
            let address = match req.address {
                Some(a) => a,
                None => self
                    .lookup_node(node, req.peer)
                    .await?
                    .addresses
                    .into_iter()
                    .next()
                    .ok_or(HarnessError::NoAddress(req.peer))?,
            };
            self.connect_peer(node, req.peer, &address).await?;
        }

        let mut stream = node
            .open_channel(OpenChannelParams {
                peer: req.peer,
                capacity_sat: req.capacity_sat,
                push_sat: req.push_sat,
                private: req.private,
            })
            .await?;

        loop {
            let update = select! {
                biased;
                _ = self.scope.cancelled() => return Err(HarnessError::Cancelled),
                Some(e) = stream.errors.recv() => return Err(e.into()),
                u = stream.updates.recv() => u,
            };
            match update {
                Some(OpenChannelUpdate::Pending { txid }) => {
                    log::info!("channel to {} pending in {}", req.peer.short(), txid);
                    mine_blocks(self.miner.as_ref(), CONFIRMATION_BLOCKS).await?;
                }
                Some(OpenChannelUpdate::Open(point)) => {
                    log::info!("channel to {} open at {}", req.peer.short(), point);
                    return Ok(point);
                }
                None => {
                    return Err(HarnessError::Stream(format!(
                        "open channel stream to {} closed",
                        req.peer.short()
                    )))
                }
            }
        }
    }

    /*
     * Cooperatively close every channel of the node, then mine so the closes confirm. Returns the number of
     * channels closed.
     */
    pub async fn close_all_channels(&self, node: &dyn NodeHandle) -> Result<usize, HarnessError> {
        let channels = node.list_channels().await?;

        for channel in &channels {
            let mut stream = node.close_channel(channel.channel_point.clone(), false).await?;
            let update = select! {
                biased;
                _ = self.scope.cancelled() => return Err(HarnessError::Cancelled),
                Some(e) = stream.errors.recv() => return Err(e.into()),
                u = stream.updates.recv() => u,
            };
            match update {
                Some(CloseChannelUpdate::Pending { closing_txid }) => {
                    log::debug!("closing channel {} in {}", channel.chan_id, closing_txid);
                }
                Some(CloseChannelUpdate::Closed) => {}
                None => {
                    return Err(HarnessError::Stream(format!(
                        "close stream for channel {} closed",
                        channel.chan_id
                    )))
                }
            }
        }

        if !channels.is_empty() {
            mine_blocks(self.miner.as_ref(), CONFIRMATION_BLOCKS).await?;
        }

        Ok(channels.len())
    }
}

/// The node's channel with the least capacity.
pub fn smallest_channel(node: &GraphNode) -> Option<&ChannelEdge> {
    node.channels.iter().min_by_key(|c| c.capacity_sat)
}

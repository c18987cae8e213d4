// Project modules
use crate::chain_controller::{BlockMiner, ChainError};
use crate::ln_node::{
    update_stream, ChannelEdge, ChannelSummary, CloseChannelUpdate, DispatchRequest, FailureReason, GraphNode,
    HtlcRecord, NodeError, NodeHandle, NodeInfo, OpenChannelParams, OpenChannelUpdate, PaymentState, PaymentUpdate,
    Receivable, ReceivableState, ReceivableUpdate, UpdateSink, UpdateStream,
};
use crate::ln_types::{ChannelPoint, NodePubkey, PaymentHash, Preimage};
use crate::sim_channel::{ChannelState, ChannelStatus, ForwardingError, SimChannel, SlotUsage, MAX_ACCEPTED_HTLCS};
use crate::sim_node::SimNode;

// External modules
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;

// Standard modules
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

// Expiry delta used when a receivable is created without an explicit final cltv
pub const DEFAULT_FINAL_CLTV_DELTA: u32 = 80;

const START_HEIGHT: u32 = 200;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("duplicate node alias: {0}")]
    DuplicateAlias(String),
    #[error("unknown node alias: {0}")]
    UnknownAlias(String),
    #[error("could not read network definition {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid network definition: {0}")]
    Parse(#[from] serde_json::Error),
}

/*
 * Knobs for the simulated forwarding behaviour.
 */
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SimConfig {
    pub reputation_threshold: i64, // score a forwarder needs for an incoming channel before it endorses outgoing
    pub slow_resolution_ms: u64,   // htlcs held at least this long cost the incoming channel reputation
    pub slow_penalty: i64,
    pub confirmations: u32, // blocks before an opened channel becomes usable
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            reputation_threshold: 10,
            slow_resolution_ms: 90_000,
            slow_penalty: 5,
            confirmations: 3,
        }
    }
}

/*
 * A simulated network as written in a network definition file.
 */
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SimNetworkDef {
    pub nodes: Vec<SimNode>,
    #[serde(default)]
    pub channels: Vec<SimChannel>,
    #[serde(default)]
    pub roster: Vec<String>, // aliases of the nodes the experiment controls, in roster order
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub config: SimConfig,
}

impl SimNetworkDef {
    pub fn from_json(json: &str) -> Result<Self, SimError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, SimError> {
        let json = std::fs::read_to_string(path).map_err(|source| SimError::Read {
            path: path.display().to_string(),
            source,
        })?;
        SimNetworkDef::from_json(&json)
    }
}

// Node keys are derived from aliases so definitions and logs stay stable between runs
pub fn pubkey_for_alias(alias: &str) -> NodePubkey {
    let digest: [u8; 32] = Sha256::digest(alias.as_bytes()).into();
    let mut bytes = [0u8; 33];
    bytes[0] = 0x02;
    bytes[1..].copy_from_slice(&digest);
    NodePubkey::from_bytes(bytes)
}

fn fake_txid(tag: &str, scid: u64) -> String {
    hex::encode(Sha256::digest(format!("{}:{}", tag, scid).as_bytes()))
}

#[derive(Clone, Copy, Debug)]
struct Hop {
    scid: u64,
    side: usize,
    endorsed: bool,
}

struct HeldReceivable {
    amount_msat: u64,
    expiry_height: u32,
    state: ReceivableState,
    amount_paid_msat: u64,
    htlcs: Vec<HtlcRecord>,
    subscribers: Vec<UpdateSink<ReceivableUpdate>>,
}

impl HeldReceivable {
    fn update(&self, hash: PaymentHash) -> ReceivableUpdate {
        ReceivableUpdate {
            hash,
            state: self.state,
            amount_paid_msat: self.amount_paid_msat,
            htlcs: self.htlcs.clone(),
        }
    }

    fn is_resolved(&self) -> bool {
        matches!(self.state, ReceivableState::Settled | ReceivableState::Canceled)
    }

    // Push the current state to every live subscriber, closing the subscriptions once resolved
    fn publish(&mut self, hash: PaymentHash) {
        let update = self.update(hash);
        self.subscribers.retain(|s| s.send(update.clone()));
        if self.is_resolved() {
            self.subscribers.clear();
        }
    }
}

struct NodeState {
    alias: String,
    address: String,
    peers: HashSet<NodePubkey>,
    receivables: HashMap<PaymentHash, HeldReceivable>,
    reputation: HashMap<u64, i64>, // keyed by incoming channel
}

struct InFlightPayment {
    source: NodePubkey,
    amount_msat: u64,
    hops: Vec<Hop>,
    added_at: Instant,
    status: UpdateSink<PaymentUpdate>,
}

struct PendingOpen {
    scid: u64,
    confirmations_left: u32,
    sink: UpdateSink<OpenChannelUpdate>,
}

struct PendingClose {
    scid: u64,
    sink: UpdateSink<CloseChannelUpdate>,
}

struct SimState {
    height: u32,
    next_scid: u64,
    nodes: HashMap<NodePubkey, NodeState>,
    channels: BTreeMap<u64, ChannelState>,
    payments: HashMap<PaymentHash, InFlightPayment>,
    in_flight_by_source: HashMap<NodePubkey, (usize, usize)>, // (current, peak)
    pending_opens: Vec<PendingOpen>,
    pending_closes: Vec<PendingClose>,
}

impl SimState {
    fn node(&self, pubkey: &NodePubkey) -> Result<&NodeState, NodeError> {
        self.nodes
            .get(pubkey)
            .ok_or_else(|| NodeError::NotFound(format!("node {}", pubkey.short())))
    }

    fn node_mut(&mut self, pubkey: &NodePubkey) -> Result<&mut NodeState, NodeError> {
        self.nodes
            .get_mut(pubkey)
            .ok_or_else(|| NodeError::NotFound(format!("node {}", pubkey.short())))
    }

    fn add_channel(
        &mut self,
        nodes: [NodePubkey; 2],
        balance_msat: [u64; 2],
        max_accepted_htlcs: u16,
        status: ChannelStatus,
    ) -> u64 {
        let scid = self.next_scid;
        self.next_scid += 1;

        let channel = ChannelState {
            scid,
            point: ChannelPoint {
                txid: fake_txid("funding", scid),
                output_index: 0,
            },
            nodes,
            capacity_sat: (balance_msat[0] + balance_msat[1]) / 1000,
            balance_msat,
            in_flight: [SlotUsage::default(); 2],
            max_accepted_htlcs,
            status,
        };
        self.channels.insert(scid, channel);

        scid
    }

    fn connect(&mut self, a: NodePubkey, b: NodePubkey) {
        if let Some(node) = self.nodes.get_mut(&a) {
            node.peers.insert(b);
        }
        if let Some(node) = self.nodes.get_mut(&b) {
            node.peers.insert(a);
        }
    }

    /*
     * Breadth first search for the shortest route with enough balance and free slots on every hop. Returns the
     * channel and offering side of each hop.
     */
    fn find_route(&self, source: NodePubkey, dest: NodePubkey, amount_msat: u64) -> Option<Vec<(u64, usize)>> {
        let mut visited = HashSet::from([source]);
        let mut previous: HashMap<NodePubkey, (NodePubkey, u64, usize)> = HashMap::new();
        let mut queue = VecDeque::from([source]);

        while let Some(current) = queue.pop_front() {
            if current == dest {
                break;
            }
            for channel in self.channels.values() {
                let Some(side) = channel.side_of(&current) else {
                    continue;
                };
                if !channel.can_route(side, amount_msat) {
                    continue;
                }
                let next = channel.nodes[1 - side];
                if visited.insert(next) {
                    previous.insert(next, (current, channel.scid, side));
                    queue.push_back(next);
                }
            }
        }

        let mut route = Vec::new();
        let mut current = dest;
        while current != source {
            let (prev, scid, side) = previous.get(&current)?;
            route.push((*scid, *side));
            current = *prev;
        }
        route.reverse();

        if route.is_empty() {
            None
        } else {
            Some(route)
        }
    }

    fn reputation_of(&self, node: &NodePubkey, incoming_scid: u64) -> i64 {
        self.nodes
            .get(node)
            .and_then(|n| n.reputation.get(&incoming_scid))
            .copied()
            .unwrap_or(0)
    }

    /*
     * Lock the htlcs along the route. The sender sets the endorsement on the first hop, every forwarder passes it
     * on only when it trusts the incoming channel. Nothing stays locked if a hop fails.
     */
    fn add_htlcs(
        &mut self,
        route: &[(u64, usize)],
        amount_msat: u64,
        endorse: bool,
        threshold: i64,
    ) -> Result<Vec<Hop>, ForwardingError> {
        let mut hops: Vec<Hop> = Vec::with_capacity(route.len());
        let mut endorsed = endorse;

        for &(scid, side) in route {
            if let Some(incoming) = hops.last() {
                let forwarder = match self.channels.get(&scid) {
                    Some(c) => c.nodes[side],
                    None => {
                        self.release_hops(&hops, amount_msat, false);
                        return Err(ForwardingError::Inactive(scid));
                    }
                };
                endorsed = endorsed && self.reputation_of(&forwarder, incoming.scid) >= threshold;
            }

            let added = match self.channels.get_mut(&scid) {
                Some(channel) => channel.add_htlc(side, amount_msat, endorsed),
                None => Err(ForwardingError::Inactive(scid)),
            };
            if let Err(e) = added {
                self.release_hops(&hops, amount_msat, false);
                return Err(e);
            }

            hops.push(Hop { scid, side, endorsed });
        }

        Ok(hops)
    }

    fn release_hops(&mut self, hops: &[Hop], amount_msat: u64, success: bool) {
        for hop in hops {
            if let Some(channel) = self.channels.get_mut(&hop.scid) {
                channel.resolve_htlc(hop.side, amount_msat, hop.endorsed, success);
            }
        }
    }

    fn update_reputation(&mut self, hops: &[Hop], held: Duration, success: bool, config: &SimConfig) {
        let delta = if held >= Duration::from_millis(config.slow_resolution_ms) {
            -config.slow_penalty
        } else if success {
            1
        } else {
            return;
        };

        for pair in hops.windows(2) {
            let (incoming, outgoing) = (&pair[0], &pair[1]);
            let Some(forwarder) = self.channels.get(&outgoing.scid).map(|c| c.nodes[outgoing.side]) else {
                continue;
            };
            if let Some(node) = self.nodes.get_mut(&forwarder) {
                *node.reputation.entry(incoming.scid).or_insert(0) += delta;
            }
        }
    }

    fn track_payment(&mut self, hash: PaymentHash, payment: InFlightPayment) {
        let counts = self.in_flight_by_source.entry(payment.source).or_insert((0, 0));
        counts.0 += 1;
        counts.1 = counts.1.max(counts.0);
        self.payments.insert(hash, payment);
    }

    fn finish_payment(&mut self, hash: PaymentHash, success: bool, reason: FailureReason, config: &SimConfig) {
        let Some(payment) = self.payments.remove(&hash) else {
            return;
        };

        self.release_hops(&payment.hops, payment.amount_msat, success);
        self.update_reputation(&payment.hops, payment.added_at.elapsed(), success, config);
        if let Some(counts) = self.in_flight_by_source.get_mut(&payment.source) {
            counts.0 = counts.0.saturating_sub(1);
        }

        payment.status.send(PaymentUpdate {
            hash,
            state: if success { PaymentState::Succeeded } else { PaymentState::Failed },
            failure_reason: reason,
        });
    }
}

/*
 * An in-process payment network. Every node in the definition gets a SimNodeHandle, and the network itself acts
 * as the block miner that confirms channel opens and closes.
 */
pub struct SimNetwork {
    aliases: HashMap<String, NodePubkey>,
    config: SimConfig,
    state: Mutex<SimState>,
}

impl SimNetwork {
    pub fn new(def: &SimNetworkDef) -> Result<Arc<Self>, SimError> {
        let mut aliases = HashMap::new();
        let mut nodes = HashMap::new();
        for n in &def.nodes {
            let pubkey = pubkey_for_alias(&n.alias);
            if aliases.insert(n.alias.clone(), pubkey).is_some() {
                return Err(SimError::DuplicateAlias(n.alias.clone()));
            }
            nodes.insert(
                pubkey,
                NodeState {
                    alias: n.alias.clone(),
                    address: n.p2p_address(),
                    peers: HashSet::new(),
                    receivables: HashMap::new(),
                    reputation: HashMap::new(),
                },
            );
        }

        let mut state = SimState {
            height: START_HEIGHT,
            next_scid: 1,
            nodes,
            channels: BTreeMap::new(),
            payments: HashMap::new(),
            in_flight_by_source: HashMap::new(),
            pending_opens: Vec::new(),
            pending_closes: Vec::new(),
        };

        for c in &def.channels {
            let lookup = |alias: &String| {
                aliases
                    .get(alias)
                    .copied()
                    .ok_or_else(|| SimError::UnknownAlias(alias.clone()))
            };
            let (node1, node2) = (lookup(&c.node1)?, lookup(&c.node2)?);
            state.add_channel(
                [node1, node2],
                [c.node1_balance_sat * 1000, c.node2_balance_sat * 1000],
                c.max_accepted_htlcs.unwrap_or(MAX_ACCEPTED_HTLCS),
                ChannelStatus::Active,
            );
            state.connect(node1, node2);
        }

        log::debug!(
            "simulated network with {} nodes and {} channels",
            def.nodes.len(),
            def.channels.len()
        );

        Ok(Arc::new(SimNetwork {
            aliases,
            config: def.config.clone(),
            state: Mutex::new(state),
        }))
    }

    pub fn pubkey(&self, alias: &str) -> Option<NodePubkey> {
        self.aliases.get(alias).copied()
    }

    pub fn node_handle(self: &Arc<Self>, alias: &str) -> Option<Arc<SimNodeHandle>> {
        self.pubkey(alias).map(|pubkey| {
            Arc::new(SimNodeHandle {
                pubkey,
                network: self.clone(),
            })
        })
    }

    pub async fn height(&self) -> u32 {
        self.state.lock().await.height
    }

    pub async fn in_flight_payments(&self) -> usize {
        self.state.lock().await.payments.len()
    }

    // Highest number of payments a node has had in flight at once
    pub async fn peak_in_flight(&self, alias: &str) -> usize {
        let Some(pubkey) = self.pubkey(alias) else {
            return 0;
        };
        self.state
            .lock()
            .await
            .in_flight_by_source
            .get(&pubkey)
            .map(|counts| counts.1)
            .unwrap_or(0)
    }

    pub async fn reputation(&self, alias: &str, incoming_scid: u64) -> i64 {
        match self.pubkey(alias) {
            Some(pubkey) => self.state.lock().await.reputation_of(&pubkey, incoming_scid),
            None => 0,
        }
    }
}

#[async_trait]
impl BlockMiner for SimNetwork {
    async fn generate(&self, blocks: u32) -> Result<(), ChainError> {
        let mut state = self.state.lock().await;
        state.height += blocks;
        if blocks == 0 {
            return Ok(());
        }

        for mut pending in std::mem::take(&mut state.pending_opens) {
            pending.confirmations_left = pending.confirmations_left.saturating_sub(blocks);
            if pending.confirmations_left > 0 {
                state.pending_opens.push(pending);
                continue;
            }
            if let Some(channel) = state.channels.get_mut(&pending.scid) {
                channel.status = ChannelStatus::Active;
                pending.sink.send(OpenChannelUpdate::Open(channel.point.clone()));
            }
        }

        for pending in std::mem::take(&mut state.pending_closes) {
            state.channels.remove(&pending.scid);
            pending.sink.send(CloseChannelUpdate::Closed);
        }

        Ok(())
    }
}

/*
 * NodeHandle for one node of a SimNetwork.
 */
pub struct SimNodeHandle {
    pubkey: NodePubkey,
    network: Arc<SimNetwork>,
}

impl SimNodeHandle {
    pub fn pubkey(&self) -> NodePubkey {
        self.pubkey
    }
}

#[async_trait]
impl NodeHandle for SimNodeHandle {
    async fn get_info(&self) -> Result<NodeInfo, NodeError> {
        let state = self.network.state.lock().await;
        let node = state.node(&self.pubkey)?;
        Ok(NodeInfo {
            pubkey: self.pubkey,
            alias: node.alias.clone(),
        })
    }

    async fn create_hold_receivable(
        &self,
        hash: PaymentHash,
        amount_msat: u64,
        final_cltv: u64,
    ) -> Result<Receivable, NodeError> {
        let mut state = self.network.state.lock().await;
        let height = state.height;

        if amount_msat == 0 {
            return Err(NodeError::Rejected(String::from("zero amount receivable")));
        }
        let expiry_height = match final_cltv {
            0 => height + DEFAULT_FINAL_CLTV_DELTA,
            cltv => u32::try_from(cltv)
                .map_err(|_| NodeError::Rejected(format!("final cltv {} out of range", cltv)))?,
        };
        if expiry_height <= height {
            return Err(NodeError::Rejected(format!(
                "final cltv {} is not above height {}",
                expiry_height, height
            )));
        }

        let node = state.node_mut(&self.pubkey)?;
        if node.receivables.contains_key(&hash) {
            return Err(NodeError::Rejected(format!("receivable {} already exists", hash)));
        }
        node.receivables.insert(
            hash,
            HeldReceivable {
                amount_msat,
                expiry_height,
                state: ReceivableState::Open,
                amount_paid_msat: 0,
                htlcs: Vec::new(),
                subscribers: Vec::new(),
            },
        );

        Ok(Receivable {
            hash,
            destination: self.pubkey,
            amount_msat,
            final_cltv,
        })
    }

    async fn subscribe_receivable(&self, hash: PaymentHash) -> Result<UpdateStream<ReceivableUpdate>, NodeError> {
        let mut state = self.network.state.lock().await;
        let node = state.node_mut(&self.pubkey)?;
        let receivable = node
            .receivables
            .get_mut(&hash)
            .ok_or_else(|| NodeError::NotFound(format!("receivable {}", hash)))?;

        let (sink, stream) = update_stream();
        sink.send(receivable.update(hash));
        if !receivable.is_resolved() {
            receivable.subscribers.push(sink);
        }

        Ok(stream)
    }

    async fn settle_receivable(&self, preimage: Preimage) -> Result<(), NodeError> {
        let hash = preimage.hash();
        let mut state = self.network.state.lock().await;

        let receivable = state
            .node_mut(&self.pubkey)?
            .receivables
            .get_mut(&hash)
            .ok_or_else(|| NodeError::NotFound(format!("no receivable for preimage of {}", hash)))?;
        match receivable.state {
            ReceivableState::Accepted => {}
            ReceivableState::Open => {
                return Err(NodeError::Rejected(format!("receivable {} has not been accepted", hash)));
            }
            ReceivableState::Settled | ReceivableState::Canceled => {
                return Err(NodeError::Rejected(format!("receivable {} is already resolved", hash)));
            }
        }
        receivable.state = ReceivableState::Settled;
        receivable.publish(hash);

        state.finish_payment(hash, true, FailureReason::None, &self.network.config);
        Ok(())
    }

    async fn cancel_receivable(&self, hash: PaymentHash) -> Result<(), NodeError> {
        let mut state = self.network.state.lock().await;

        let receivable = state
            .node_mut(&self.pubkey)?
            .receivables
            .get_mut(&hash)
            .ok_or_else(|| NodeError::NotFound(format!("receivable {}", hash)))?;
        if receivable.is_resolved() {
            return Err(NodeError::Rejected(format!("receivable {} is already resolved", hash)));
        }
        receivable.state = ReceivableState::Canceled;
        receivable.publish(hash);

        state.finish_payment(
            hash,
            false,
            FailureReason::IncorrectPaymentDetails,
            &self.network.config,
        );
        Ok(())
    }

    async fn dispatch_payment(&self, request: DispatchRequest) -> Result<UpdateStream<PaymentUpdate>, NodeError> {
        let mut state = self.network.state.lock().await;
        let hash = request.receivable.hash;
        let dest = request.receivable.destination;
        let amount_msat = request.receivable.amount_msat;

        state.node(&self.pubkey)?;
        state.node(&dest)?;
        if dest == self.pubkey {
            return Err(NodeError::Rejected(String::from("self payments are not supported")));
        }
        if state.payments.contains_key(&hash) {
            return Err(NodeError::Rejected(format!("payment {} already in flight", hash)));
        }

        let (sink, stream) = update_stream();
        sink.send(PaymentUpdate {
            hash,
            state: PaymentState::InFlight,
            failure_reason: FailureReason::None,
        });
        let fail = |sink: UpdateSink<PaymentUpdate>, reason: FailureReason| {
            sink.send(PaymentUpdate {
                hash,
                state: PaymentState::Failed,
                failure_reason: reason,
            });
        };

        let Some(route) = state.find_route(self.pubkey, dest, amount_msat) else {
            fail(sink, FailureReason::NoRoute);
            return Ok(stream);
        };
        let hops = match state.add_htlcs(&route, amount_msat, request.endorse, self.network.config.reputation_threshold)
        {
            Ok(hops) => hops,
            Err(e) => {
                log::debug!("payment {} could not be forwarded: {}", hash, e);
                fail(sink, FailureReason::NoRoute);
                return Ok(stream);
            }
        };

        // Hand the htlc to the receiver, which accepts it only for a matching open receivable
        let (last_scid, last_endorsed) = match hops.last() {
            Some(hop) => (hop.scid, hop.endorsed),
            None => {
                fail(sink, FailureReason::NoRoute);
                return Ok(stream);
            }
        };
        let height = state.height;
        let accepted = match state.nodes.get_mut(&dest).and_then(|n| n.receivables.get_mut(&hash)) {
            Some(receivable) if receivable.state == ReceivableState::Open && amount_msat >= receivable.amount_msat => {
                receivable.state = ReceivableState::Accepted;
                receivable.amount_paid_msat = amount_msat;
                receivable.htlcs = vec![HtlcRecord {
                    chan_id: last_scid,
                    amount_msat,
                    incoming_endorsed: last_endorsed,
                    accept_height: height,
                    expiry_height: receivable.expiry_height,
                }];
                receivable.publish(hash);
                true
            }
            _ => false,
        };

        if !accepted {
            state.release_hops(&hops, amount_msat, false);
            fail(sink, FailureReason::IncorrectPaymentDetails);
            return Ok(stream);
        }

        state.track_payment(
            hash,
            InFlightPayment {
                source: self.pubkey,
                amount_msat,
                hops,
                added_at: Instant::now(),
                status: sink,
            },
        );

        Ok(stream)
    }

    async fn list_peers(&self) -> Result<Vec<NodePubkey>, NodeError> {
        let state = self.network.state.lock().await;
        Ok(state.node(&self.pubkey)?.peers.iter().copied().collect())
    }

    async fn connect_peer(&self, peer: NodePubkey, address: &str) -> Result<(), NodeError> {
        let mut state = self.network.state.lock().await;
        if peer == self.pubkey {
            return Err(NodeError::Rejected(String::from("cannot connect to self")));
        }
        if state.node(&peer)?.address != address {
            return Err(NodeError::Rpc(format!("could not connect to {} at {}", peer.short(), address)));
        }

        state.connect(self.pubkey, peer);
        Ok(())
    }

    async fn open_channel(&self, params: OpenChannelParams) -> Result<UpdateStream<OpenChannelUpdate>, NodeError> {
        let mut state = self.network.state.lock().await;
        if !state.node(&self.pubkey)?.peers.contains(&params.peer) {
            return Err(NodeError::Rejected(format!("peer {} is not connected", params.peer.short())));
        }
        if params.capacity_sat == 0 || params.push_sat > params.capacity_sat {
            return Err(NodeError::Rejected(format!(
                "invalid channel amounts: capacity {} push {}",
                params.capacity_sat, params.push_sat
            )));
        }

        let scid = state.add_channel(
            [self.pubkey, params.peer],
            [(params.capacity_sat - params.push_sat) * 1000, params.push_sat * 1000],
            MAX_ACCEPTED_HTLCS,
            ChannelStatus::PendingOpen,
        );
        let txid = fake_txid("funding", scid);

        let (sink, stream) = update_stream();
        sink.send(OpenChannelUpdate::Pending { txid });
        state.pending_opens.push(PendingOpen {
            scid,
            confirmations_left: self.network.config.confirmations.max(1),
            sink,
        });

        Ok(stream)
    }

    async fn close_channel(
        &self,
        point: ChannelPoint,
        force: bool,
    ) -> Result<UpdateStream<CloseChannelUpdate>, NodeError> {
        let mut state = self.network.state.lock().await;
        let pubkey = self.pubkey;
        let channel = state
            .channels
            .values_mut()
            .find(|c| c.point == point && c.status == ChannelStatus::Active && c.side_of(&pubkey).is_some())
            .ok_or_else(|| NodeError::NotFound(format!("channel {}", point)))?;

        // Neither close flavour is simulated with htlcs still on the channel
        let pending = channel.pending_htlcs();
        if pending > 0 {
            return Err(NodeError::Rejected(format!(
                "channel {} has {} htlcs in flight (force: {})",
                channel.scid, pending, force
            )));
        }
        channel.status = ChannelStatus::Closing;
        let scid = channel.scid;

        let (sink, stream) = update_stream();
        sink.send(CloseChannelUpdate::Pending {
            closing_txid: fake_txid("closing", scid),
        });
        state.pending_closes.push(PendingClose { scid, sink });

        Ok(stream)
    }

    async fn list_channels(&self) -> Result<Vec<ChannelSummary>, NodeError> {
        let state = self.network.state.lock().await;
        state.node(&self.pubkey)?;

        Ok(state
            .channels
            .values()
            .filter(|c| c.status == ChannelStatus::Active)
            .filter_map(|c| {
                c.side_of(&self.pubkey).map(|side| ChannelSummary {
                    chan_id: c.scid,
                    channel_point: c.point.clone(),
                    remote_pubkey: c.nodes[1 - side],
                    capacity_sat: c.capacity_sat,
                    local_balance_msat: c.balance_msat[side],
                    pending_htlcs: c.pending_htlcs(),
                    active: true,
                })
            })
            .collect())
    }

    async fn get_node_info(&self, node: NodePubkey, include_channels: bool) -> Result<GraphNode, NodeError> {
        let state = self.network.state.lock().await;
        let info = state.node(&node)?;

        let channels = if include_channels {
            state
                .channels
                .values()
                .filter(|c| c.status == ChannelStatus::Active && c.side_of(&node).is_some())
                .map(|c| ChannelEdge {
                    chan_id: c.scid,
                    capacity_sat: c.capacity_sat,
                    node1: c.nodes[0],
                    node2: c.nodes[1],
                })
                .collect()
        } else {
            Vec::new()
        };

        Ok(GraphNode {
            pubkey: node,
            alias: info.alias.clone(),
            addresses: vec![info.address.clone()],
            channels,
        })
    }

    async fn get_best_block_height(&self) -> Result<u32, NodeError> {
        Ok(self.network.height().await)
    }
}

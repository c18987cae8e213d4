// Project modules
use crate::jam_error::PaymentError;
use crate::ln_node::{
    DispatchRequest, FailureReason, HtlcRecord, NodeHandle, PaymentState, PaymentUpdate, ReceivableState,
    UpdateStream,
};
use crate::ln_types::{PaymentHash, Preimage};
use crate::node_roster::{NodeIndex, NodeRoster};

// External modules
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use triggered::Listener;

// Standard modules
use std::sync::Arc;
use std::time::Duration;

/// A payment to run between two roster nodes through a hold receivable.
#[derive(Clone, Debug)]
pub struct PaymentRequest {
    pub amount_msat: u64,
    pub source: NodeIndex,
    pub dest: NodeIndex,
    /// Absolute expiry height for the final hop, zero leaves it to the receiving node.
    pub final_cltv: u64,
    pub endorse: bool,
    /// Reveal the preimage once the hold is over, otherwise fail the payment back.
    pub settle: bool,
    /// How long after dispatch the receiver keeps the accepted htlcs.
    pub hold_wait: Duration,
    /// Ends the hold early when triggered.
    pub early_cancel: Option<Listener>,
}

/// The single result of a payment attempt. `failure_reason` is None for a successful payment, `error` is set when
/// the attempt ended abnormally (stream failure, cancellation, ...).
#[derive(Clone, Debug)]
pub struct PaymentOutcome {
    pub hash: PaymentHash,
    pub failure_reason: FailureReason,
    pub htlcs: Vec<HtlcRecord>,
    pub error: Option<PaymentError>,
}

impl PaymentOutcome {
    fn errored(hash: PaymentHash, htlcs: Vec<HtlcRecord>, error: PaymentError) -> Self {
        PaymentOutcome {
            hash,
            failure_reason: FailureReason::Error,
            htlcs,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.failure_reason == FailureReason::None
    }

    /// Endorsement signal the receiver saw on the first htlc, None if nothing arrived.
    pub fn endorsed(&self) -> Option<bool> {
        self.htlcs.first().map(|h| h.incoming_endorsed)
    }
}

/// Handle to a dispatched payment.
#[derive(Debug)]
pub struct PendingPayment {
    hash: PaymentHash,
    outcome: oneshot::Receiver<PaymentOutcome>,
}

impl PendingPayment {
    pub fn hash(&self) -> PaymentHash {
        self.hash
    }

    pub async fn outcome(self) -> PaymentOutcome {
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(_) => PaymentOutcome::errored(self.hash, Vec::new(), PaymentError::Cancelled),
        }
    }
}

/// Fee and timeout limits applied to every dispatched payment.
#[derive(Clone, Copy, Debug)]
pub struct DispatchSettings {
    pub max_fee_msat: u64,
    pub timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        DispatchSettings {
            max_fee_msat: u64::MAX,
            timeout: Duration::from_secs(3600),
        }
    }
}

enum WatcherEvent {
    Accepted(Vec<HtlcRecord>),
    PaymentResolved(FailureReason),
    Failed(PaymentError),
}

/*
 * Runs hold payments between roster nodes. Every payment gets a receivable watcher, a payment status watcher and
 * an aggregator that turns their events into the payment's outcome. All of them run on the coordinator's tracker.
 */
#[derive(Clone)]
pub struct PaymentCoordinator {
    roster: Arc<NodeRoster>,
    tracker: TaskTracker,
    settings: DispatchSettings,
}

impl PaymentCoordinator {
    pub fn new(roster: Arc<NodeRoster>, settings: DispatchSettings) -> Self {
        let coordinator = PaymentCoordinator {
            roster,
            tracker: TaskTracker::new(),
            settings,
        };
        coordinator
    }

    pub fn roster(&self) -> &Arc<NodeRoster> {
        &self.roster
    }

    // Number of payment tasks still running
    pub fn running_tasks(&self) -> usize {
        self.tracker.len()
    }

    /*
     * Create a hold receivable on the destination and pay it from the source. Returns once both calls succeeded,
     * the outcome is delivered through the returned PendingPayment. Cancelling `scope` ends the payment's tasks.
     */
    pub async fn execute_payment(
        &self,
        scope: &CancellationToken,
        request: PaymentRequest,
    ) -> Result<PendingPayment, PaymentError> {
        let preimage = Preimage::random().map_err(|e| PaymentError::Setup(e.to_string()))?;
        let hash = preimage.hash();
        let source = self.roster.node(request.source).clone();
        let dest = self.roster.node(request.dest).clone();

        let receivable = dest
            .create_hold_receivable(hash, request.amount_msat, request.final_cltv)
            .await
            .map_err(PaymentError::ReceivableCreation)?;

        let dispatch_time = Instant::now();
        let dispatched = source
            .dispatch_payment(DispatchRequest {
                receivable,
                max_fee_msat: self.settings.max_fee_msat,
                timeout: self.settings.timeout,
                endorse: request.endorse,
            })
            .await;
        let payment_updates = match dispatched {
            Ok(stream) => stream,
            Err(e) => {
                if let Err(cancel_err) = dest.cancel_receivable(hash).await {
                    log::debug!("could not cancel orphaned receivable {}: {}", hash, cancel_err);
                }
                return Err(PaymentError::Dispatch(e));
            }
        };
        log::debug!(
            "payment {} dispatched {} -> {} for {} msat",
            hash,
            request.source,
            request.dest,
            request.amount_msat
        );

        let token = scope.child_token();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let receivable_watcher = self.tracker.spawn(watch_receivable(ReceivableWatch {
            node: dest,
            preimage,
            amount_msat: request.amount_msat,
            settle: request.settle,
            deadline: dispatch_time + request.hold_wait,
            early_cancel: request.early_cancel,
            token: token.clone(),
            events: events_tx.clone(),
        }));
        let payment_watcher = self.tracker.spawn(watch_payment(payment_updates, token.clone(), events_tx));
        self.tracker.spawn(aggregate(
            hash,
            events_rx,
            token,
            vec![receivable_watcher, payment_watcher],
            outcome_tx,
        ));

        Ok(PendingPayment {
            hash,
            outcome: outcome_rx,
        })
    }

    // Wait for every payment task spawned so far
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

struct ReceivableWatch {
    node: Arc<dyn NodeHandle>,
    preimage: Preimage,
    amount_msat: u64,
    settle: bool,
    deadline: Instant,
    early_cancel: Option<Listener>,
    token: CancellationToken,
    events: mpsc::UnboundedSender<WatcherEvent>,
}

async fn watch_receivable(watch: ReceivableWatch) {
    let hash = watch.preimage.hash();
    let held = select! {
        biased;
        _ = watch.token.cancelled() => Err(PaymentError::Cancelled),
        r = hold(&watch, hash) => r,
    };

    // The resolution runs to completion even when the payment reports resolved first
    let result = match held {
        Ok(()) => resolve(&watch, hash).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => {}
        Err(PaymentError::Cancelled) => {
            // Do not leave the sender's htlcs locked in behind us
            if let Err(e) = watch.node.cancel_receivable(hash).await {
                log::debug!("receivable {} not cancelled on shutdown: {}", hash, e);
            }
        }
        Err(e) => {
            let _ = watch.events.send(WatcherEvent::Failed(e));
        }
    }
}

/*
 * Wait until the receivable is paid in full, then keep it until the deadline or the early cancel signal.
 */
async fn hold(watch: &ReceivableWatch, hash: PaymentHash) -> Result<(), PaymentError> {
    let mut stream = watch
        .node
        .subscribe_receivable(hash)
        .await
        .map_err(|e| PaymentError::Stream(e.to_string()))?;

    loop {
        let update = select! {
            biased;
            u = stream.updates.recv() => u,
            Some(e) = stream.errors.recv() => return Err(PaymentError::Stream(e.to_string())),
        };
        let Some(update) = update else {
            return Err(PaymentError::Stream(format!("receivable {} stream closed", hash)));
        };

        match update.state {
            ReceivableState::Accepted if update.amount_paid_msat >= watch.amount_msat => {
                let _ = watch.events.send(WatcherEvent::Accepted(update.htlcs));
                break;
            }
            ReceivableState::Accepted => {
                log::debug!(
                    "receivable {} partially paid: {} of {} msat",
                    hash,
                    update.amount_paid_msat,
                    watch.amount_msat
                );
            }
            ReceivableState::Settled | ReceivableState::Canceled => {
                return Err(PaymentError::Stream(format!(
                    "receivable {} resolved before it was accepted",
                    hash
                )));
            }
            ReceivableState::Open => {}
        }
    }

    let early_cancel = async {
        match &watch.early_cancel {
            Some(listener) => listener.clone().await,
            None => std::future::pending().await,
        }
    };
    select! {
        _ = tokio::time::sleep_until(watch.deadline) => {}
        _ = early_cancel => log::debug!("hold on {} released early", hash),
    }

    Ok(())
}

async fn resolve(watch: &ReceivableWatch, hash: PaymentHash) -> Result<(), PaymentError> {
    if watch.settle {
        watch
            .node
            .settle_receivable(watch.preimage)
            .await
            .map_err(PaymentError::Resolution)
    } else {
        watch
            .node
            .cancel_receivable(hash)
            .await
            .map_err(PaymentError::Resolution)
    }
}

async fn watch_payment(
    mut stream: UpdateStream<PaymentUpdate>,
    token: CancellationToken,
    events: mpsc::UnboundedSender<WatcherEvent>,
) {
    let event = select! {
        biased;
        _ = token.cancelled() => return,
        e = next_terminal(&mut stream) => e,
    };
    let _ = events.send(event);
}

async fn next_terminal(stream: &mut UpdateStream<PaymentUpdate>) -> WatcherEvent {
    loop {
        select! {
            biased;
            u = stream.updates.recv() => match u {
                Some(update) if update.state.is_terminal() => {
                    let reason = match (update.state, update.failure_reason) {
                        (PaymentState::Failed, FailureReason::None) => FailureReason::Error,
                        (_, reason) => reason,
                    };
                    return WatcherEvent::PaymentResolved(reason);
                }
                Some(_) => continue,
                None => return WatcherEvent::Failed(PaymentError::Stream(String::from("payment status stream closed"))),
            },
            Some(e) = stream.errors.recv() => return WatcherEvent::Failed(PaymentError::Stream(e.to_string())),
        }
    }
}

/*
 * Single consumer of both watchers' events. Once the payment is resolved it stops the watchers and joins them,
 * only then is the outcome delivered.
 */
async fn aggregate(
    hash: PaymentHash,
    mut events: mpsc::UnboundedReceiver<WatcherEvent>,
    token: CancellationToken,
    watchers: Vec<JoinHandle<()>>,
    outcome_tx: oneshot::Sender<PaymentOutcome>,
) {
    let mut htlcs = Vec::new();
    let mut result = Err(PaymentError::Cancelled);

    loop {
        let event = select! {
            biased;
            e = events.recv() => e,
            _ = token.cancelled() => None,
        };
        match event {
            Some(WatcherEvent::Accepted(records)) => htlcs = records,
            Some(WatcherEvent::PaymentResolved(reason)) => {
                result = Ok(reason);
                break;
            }
            Some(WatcherEvent::Failed(e)) => {
                result = Err(e);
                break;
            }
            None => break,
        }
    }

    token.cancel();
    for watcher in watchers {
        if let Err(e) = watcher.await {
            log::warn!("watcher for payment {} did not finish cleanly: {}", hash, e);
        }
    }

    let outcome = match result {
        Ok(FailureReason::None) if htlcs.is_empty() => {
            log::error!("payment {} succeeded without any accepted htlcs", hash);
            PaymentOutcome::errored(
                hash,
                htlcs,
                PaymentError::ProtocolInvariant(String::from("payment succeeded without htlcs")),
            )
        }
        Ok(failure_reason) => PaymentOutcome {
            hash,
            failure_reason,
            htlcs,
            error: None,
        },
        Err(e) => PaymentOutcome::errored(hash, htlcs, e),
    };

    if outcome_tx.send(outcome).is_err() {
        log::debug!("nobody waiting for the outcome of {}", hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ln_node::tests::{unsupported, StubNode};
    use crate::ln_node::{
        update_stream, ChannelSummary, CloseChannelUpdate, GraphNode, NodeError, NodeInfo, OpenChannelParams,
        OpenChannelUpdate, Receivable, ReceivableUpdate, UpdateSink,
    };
    use crate::ln_types::{ChannelPoint, NodePubkey};
    use crate::sim_network::tests::payment_network;
    use crate::sim_network::SimNetwork;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /*
     * Plays both ends of a payment. The test decides when and how much of the receivable gets paid. Settling reports
     * the payment as succeeded before the settle call returns, like a remote node would.
     */
    #[derive(Default)]
    struct ScriptedNode {
        settle_delay: Duration,
        receivable: Mutex<Option<UpdateSink<ReceivableUpdate>>>,
        payment: Mutex<Option<UpdateSink<PaymentUpdate>>>,
        settled: AtomicUsize,
        cancelled: AtomicUsize,
    }

    impl ScriptedNode {
        fn with_settle_delay(settle_delay: Duration) -> Self {
            ScriptedNode {
                settle_delay,
                ..ScriptedNode::default()
            }
        }

        async fn wait_for_subscriber(&self) {
            loop {
                if self.receivable.lock().unwrap().is_some() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        fn pay(&self, hash: PaymentHash, amount_paid_msat: u64, htlcs: Vec<HtlcRecord>) {
            let sink = self.receivable.lock().unwrap().clone().unwrap();
            sink.send(ReceivableUpdate {
                hash,
                state: ReceivableState::Accepted,
                amount_paid_msat,
                htlcs,
            });
        }

        fn report_payment(&self, hash: PaymentHash, state: PaymentState, failure_reason: FailureReason) {
            if let Some(sink) = self.payment.lock().unwrap().as_ref() {
                sink.send(PaymentUpdate {
                    hash,
                    state,
                    failure_reason,
                });
            }
        }
    }

    #[async_trait]
    impl NodeHandle for ScriptedNode {
        async fn get_info(&self) -> Result<NodeInfo, NodeError> {
            unsupported()
        }
        async fn create_hold_receivable(
            &self,
            hash: PaymentHash,
            amount_msat: u64,
            final_cltv: u64,
        ) -> Result<Receivable, NodeError> {
            Ok(Receivable {
                hash,
                destination: NodePubkey::from_bytes([2u8; 33]),
                amount_msat,
                final_cltv,
            })
        }
        async fn subscribe_receivable(&self, _: PaymentHash) -> Result<UpdateStream<ReceivableUpdate>, NodeError> {
            let (sink, stream) = update_stream();
            *self.receivable.lock().unwrap() = Some(sink);
            Ok(stream)
        }
        async fn settle_receivable(&self, preimage: Preimage) -> Result<(), NodeError> {
            self.report_payment(preimage.hash(), PaymentState::Succeeded, FailureReason::None);
            tokio::time::sleep(self.settle_delay).await;
            self.settled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn cancel_receivable(&self, hash: PaymentHash) -> Result<(), NodeError> {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            self.report_payment(hash, PaymentState::Failed, FailureReason::IncorrectPaymentDetails);
            Ok(())
        }
        async fn dispatch_payment(&self, request: DispatchRequest) -> Result<UpdateStream<PaymentUpdate>, NodeError> {
            let (sink, stream) = update_stream();
            sink.send(PaymentUpdate {
                hash: request.receivable.hash,
                state: PaymentState::InFlight,
                failure_reason: FailureReason::None,
            });
            *self.payment.lock().unwrap() = Some(sink);
            Ok(stream)
        }
        async fn list_peers(&self) -> Result<Vec<NodePubkey>, NodeError> {
            unsupported()
        }
        async fn connect_peer(&self, _: NodePubkey, _: &str) -> Result<(), NodeError> {
            unsupported()
        }
        async fn open_channel(&self, _: OpenChannelParams) -> Result<UpdateStream<OpenChannelUpdate>, NodeError> {
            unsupported()
        }
        async fn close_channel(&self, _: ChannelPoint, _: bool) -> Result<UpdateStream<CloseChannelUpdate>, NodeError> {
            unsupported()
        }
        async fn list_channels(&self) -> Result<Vec<ChannelSummary>, NodeError> {
            unsupported()
        }
        async fn get_node_info(&self, _: NodePubkey, _: bool) -> Result<GraphNode, NodeError> {
            unsupported()
        }
        async fn get_best_block_height(&self) -> Result<u32, NodeError> {
            Ok(200)
        }
    }

    fn scripted_coordinator(node: &Arc<ScriptedNode>) -> PaymentCoordinator {
        let handle: Arc<dyn NodeHandle> = node.clone();
        let roster = NodeRoster::new(vec![handle.clone(), handle.clone(), handle]).unwrap();
        PaymentCoordinator::new(Arc::new(roster), DispatchSettings::default())
    }

    fn htlc(chan_id: u64, amount_msat: u64) -> HtlcRecord {
        HtlcRecord {
            chan_id,
            amount_msat,
            incoming_endorsed: true,
            accept_height: 200,
            expiry_height: 280,
        }
    }

    fn roster_for(network: &Arc<SimNetwork>) -> Arc<NodeRoster> {
        let handles: Vec<Arc<dyn NodeHandle>> = ["a0", "a1", "a2"]
            .iter()
            .map(|alias| network.node_handle(alias).unwrap() as Arc<dyn NodeHandle>)
            .collect();
        Arc::new(NodeRoster::new(handles).unwrap())
    }

    fn idx(i: usize) -> NodeIndex {
        NodeIndex::new(i).unwrap()
    }

    fn request(source: usize, dest: usize, amount_msat: u64) -> PaymentRequest {
        PaymentRequest {
            amount_msat,
            source: idx(source),
            dest: idx(dest),
            final_cltv: 0,
            endorse: true,
            settle: true,
            hold_wait: Duration::ZERO,
            early_cancel: None,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn settled_endorsed_payment_reports_its_htlc() {
        let network = payment_network();
        let coordinator = PaymentCoordinator::new(roster_for(&network), DispatchSettings::default());
        let scope = CancellationToken::new();

        let pending = coordinator.execute_payment(&scope, request(0, 1, 80_000)).await.unwrap();
        let outcome = pending.outcome().await;

        assert!(outcome.is_success(), "{:?}", outcome);
        assert_eq!(outcome.htlcs.len(), 1);
        assert_eq!(outcome.htlcs[0].amount_msat, 80_000);
        assert_eq!(outcome.endorsed(), Some(true));

        coordinator.shutdown().await;
        assert_eq!(coordinator.running_tasks(), 0);
        assert_eq!(network.in_flight_payments().await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unforwarded_endorsement_is_reported() {
        let network = payment_network();
        let coordinator = PaymentCoordinator::new(roster_for(&network), DispatchSettings::default());
        let scope = CancellationToken::new();

        // a1 has no reputation for the a0 channel yet, so it forwards unendorsed.
        let outcome = coordinator
            .execute_payment(&scope, request(0, 2, 80_000))
            .await
            .unwrap()
            .outcome()
            .await;
        assert!(outcome.is_success());
        assert_eq!(outcome.endorsed(), Some(false));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn hold_is_kept_for_the_hold_wait() {
        let network = payment_network();
        let coordinator = PaymentCoordinator::new(roster_for(&network), DispatchSettings::default());
        let scope = CancellationToken::new();

        let mut req = request(0, 1, 10_000);
        req.hold_wait = Duration::from_millis(300);
        let started = std::time::Instant::now();
        let outcome = coordinator.execute_payment(&scope, req).await.unwrap().outcome().await;
        let held = started.elapsed();

        assert!(outcome.is_success());
        assert!(held >= Duration::from_millis(300), "held for {:?}", held);
        assert!(held < Duration::from_secs(2), "held for {:?}", held);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn early_cancel_releases_the_hold() {
        let network = payment_network();
        let coordinator = PaymentCoordinator::new(roster_for(&network), DispatchSettings::default());
        let scope = CancellationToken::new();
        let (trigger, listener) = triggered::trigger();

        let mut req = request(0, 1, 1_000);
        req.settle = false;
        req.hold_wait = Duration::from_secs(3600);
        req.early_cancel = Some(listener);
        let pending = coordinator.execute_payment(&scope, req).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(network.in_flight_payments().await, 1);
        let cancelled_at = std::time::Instant::now();
        trigger.trigger();

        let outcome = pending.outcome().await;
        assert!(cancelled_at.elapsed() < Duration::from_secs(2));
        assert_eq!(outcome.failure_reason, FailureReason::IncorrectPaymentDetails);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.htlcs.len(), 1);
        assert_eq!(network.in_flight_payments().await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unroutable_payment_has_no_htlcs() {
        let network = payment_network();
        let coordinator = PaymentCoordinator::new(roster_for(&network), DispatchSettings::default());
        let scope = CancellationToken::new();

        let outcome = coordinator
            .execute_payment(&scope, request(0, 2, 50_000_000_000))
            .await
            .unwrap()
            .outcome()
            .await;
        assert_eq!(outcome.failure_reason, FailureReason::NoRoute);
        assert!(outcome.error.is_none());
        assert!(outcome.htlcs.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_scope_still_yields_one_outcome() {
        let network = payment_network();
        let coordinator = PaymentCoordinator::new(roster_for(&network), DispatchSettings::default());
        let scope = CancellationToken::new();
        scope.cancel();

        let mut req = request(0, 1, 1_000);
        req.settle = false;
        req.hold_wait = Duration::from_secs(3600);
        let outcome = coordinator.execute_payment(&scope, req).await.unwrap().outcome().await;

        assert_eq!(outcome.error, Some(PaymentError::Cancelled));
        coordinator.shutdown().await;
        assert_eq!(network.in_flight_payments().await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelling_a_held_payment_releases_it() {
        let network = payment_network();
        let coordinator = PaymentCoordinator::new(roster_for(&network), DispatchSettings::default());
        let scope = CancellationToken::new();

        let mut req = request(0, 1, 1_000);
        req.hold_wait = Duration::from_secs(3600);
        let pending = coordinator.execute_payment(&scope, req).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        scope.cancel();

        let outcome = pending.outcome().await;
        assert_eq!(outcome.error, Some(PaymentError::Cancelled));
        coordinator.shutdown().await;
        assert_eq!(network.in_flight_payments().await, 0);
    }

    #[tokio::test]
    async fn dispatch_rejection_is_returned_directly() {
        let network = payment_network();
        let coordinator = PaymentCoordinator::new(roster_for(&network), DispatchSettings::default());
        let scope = CancellationToken::new();

        let err = coordinator.execute_payment(&scope, request(1, 1, 1_000)).await.unwrap_err();
        assert!(matches!(err, PaymentError::Dispatch(NodeError::Rejected(_))));

        let err = coordinator.execute_payment(&scope, request(0, 1, 0)).await.unwrap_err();
        assert!(matches!(err, PaymentError::ReceivableCreation(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn success_without_htlcs_is_an_invariant_failure() {
        let network = payment_network();
        let roster = NodeRoster::new(vec![
            Arc::new(StubNode) as Arc<dyn NodeHandle>,
            network.node_handle("a1").unwrap() as Arc<dyn NodeHandle>,
            network.node_handle("a2").unwrap() as Arc<dyn NodeHandle>,
        ])
        .unwrap();
        let coordinator = PaymentCoordinator::new(Arc::new(roster), DispatchSettings::default());
        let scope = CancellationToken::new();

        let mut req = request(0, 1, 1_000);
        req.hold_wait = Duration::from_secs(3600);
        let outcome = coordinator.execute_payment(&scope, req).await.unwrap().outcome().await;

        assert!(matches!(outcome.error, Some(PaymentError::ProtocolInvariant(_))));
        assert!(!outcome.is_success());
        coordinator.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_settle_is_never_followed_by_a_cancel() {
        let node = Arc::new(ScriptedNode::with_settle_delay(Duration::from_millis(200)));
        let coordinator = scripted_coordinator(&node);
        let scope = CancellationToken::new();

        let pending = coordinator.execute_payment(&scope, request(0, 1, 1_000)).await.unwrap();
        let hash = pending.hash();
        node.wait_for_subscriber().await;
        node.pay(hash, 1_000, vec![htlc(1, 1_000)]);

        let outcome = pending.outcome().await;
        assert!(outcome.is_success(), "{:?}", outcome);
        coordinator.shutdown().await;
        assert_eq!(node.settled.load(Ordering::SeqCst), 1);
        assert_eq!(node.cancelled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn partial_payment_is_not_held_until_fully_paid() {
        let node = Arc::new(ScriptedNode::default());
        let coordinator = scripted_coordinator(&node);
        let scope = CancellationToken::new();

        let mut req = request(0, 1, 1_000);
        req.hold_wait = Duration::from_millis(100);
        let pending = coordinator.execute_payment(&scope, req).await.unwrap();
        let hash = pending.hash();
        node.wait_for_subscriber().await;

        // The hold deadline passes while only the first part has arrived
        node.pay(hash, 400, vec![htlc(1, 400)]);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(node.settled.load(Ordering::SeqCst), 0);
        assert_eq!(node.cancelled.load(Ordering::SeqCst), 0);

        let paid_at = std::time::Instant::now();
        node.pay(hash, 1_000, vec![htlc(1, 400), htlc(2, 600)]);
        let outcome = pending.outcome().await;

        assert!(outcome.is_success(), "{:?}", outcome);
        assert_eq!(outcome.htlcs, vec![htlc(1, 400), htlc(2, 600)]);
        assert!(paid_at.elapsed() < Duration::from_secs(1));
        assert_eq!(node.settled.load(Ordering::SeqCst), 1);
        coordinator.shutdown().await;
    }
}

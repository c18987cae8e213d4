// Project modules
use crate::attack_results::{
    AttackReport, BurstSummary, DirectionReport, HodlReport, JamReport, ProbeResult, ProbeSummary, ReputationReport,
};
use crate::chain_controller::BlockMiner;
use crate::experiment_config::{AttackConfig, AttackSequence, RoleIndices};
use crate::graph_harness::{smallest_channel, GraphHarness, OpenChannelReq};
use crate::jam_error::{AttackError, HarnessError, PaymentError};
use crate::jam_payment::{DispatchSettings, PaymentCoordinator, PaymentOutcome, PaymentRequest};
use crate::ln_node::ChannelEdge;
use crate::ln_types::NodePubkey;
use crate::node_roster::{NodeIndex, NodeRoster};

// External modules
use serde::Serialize;
use tokio::select;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use triggered::{Listener, Trigger};

// Standard modules
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AttackPhase {
    Setup,
    BuildReputation,
    Jam,
    SlowProbe,
    HodlAndAssess,
    Stopping,
    Stopped,
}

/*
 * What setup found out about the target
 */
#[derive(Clone, Debug)]
pub struct AttackSession {
    pub target: NodePubkey,
    pub target_peer: NodePubkey,
    pub target_channel: ChannelEdge, // the target's smallest channel, shared with target_peer
}

enum BurstEvent {
    Dispatched,
    SetupFailed(String),
    Resolved(PaymentOutcome),
}

#[derive(Default)]
struct DirectionCounters {
    attempts: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    setup_errors: AtomicU64,
}

/*
 * Drives a jamming experiment against one target node with the three roster nodes. Phases run one after the other
 * from `run`, `stop` tears the session down and may be called from another task at any time.
 */
pub struct AttackOrchestrator {
    roster: Arc<NodeRoster>,
    roles: RoleIndices,
    config: AttackConfig,
    coordinator: PaymentCoordinator,
    harness: GraphHarness,
    session: AttackSession,
    quit_trigger: Trigger,
    quit: Listener,
    scope: CancellationToken, // parent of every payment's scope, cancelled last
    tasks: TaskTracker,
    phase: watch::Sender<AttackPhase>,
    stopping: AtomicBool,
}

impl AttackOrchestrator {
    /*
     * Set up a session: find the target through the attacker's view of the graph and pick its smallest channel.
     * Triggering `shutdown` ends the session like a call to stop would, but the teardown itself is left to stop.
     */
    pub async fn new(
        roster: Arc<NodeRoster>,
        miner: Arc<dyn BlockMiner>,
        config: AttackConfig,
        target: NodePubkey,
        shutdown: Listener,
    ) -> Result<Self, AttackError> {
        let roles = config.roles.resolve()?;
        let scope = CancellationToken::new();
        let harness = GraphHarness::new(miner, scope.clone());
        let coordinator = PaymentCoordinator::new(
            roster.clone(),
            DispatchSettings {
                max_fee_msat: config.max_fee_msat,
                timeout: config.payment_timeout(),
            },
        );
        let (phase, _) = watch::channel(AttackPhase::Setup);
        log::info!("attack phase {:?}", AttackPhase::Setup);

        let viewer = roster.node(roles.attacker_source);
        let target_info = harness.lookup_node(viewer.as_ref(), target).await?;
        let target_channel = smallest_channel(&target_info)
            .cloned()
            .ok_or(AttackError::NoTargetChannel(target))?;
        let target_peer = target_channel.counterparty(&target);
        log::info!(
            "target {} ({}): smallest channel {} of {} sat with {}",
            target_info.alias,
            target.short(),
            target_channel.chan_id,
            target_channel.capacity_sat,
            target_peer.short()
        );

        let (quit_trigger, quit) = triggered::trigger();
        let tasks = TaskTracker::new();
        let (link_trigger, link_quit) = (quit_trigger.clone(), quit.clone());
        tasks.spawn(async move {
            select! {
                _ = shutdown => link_trigger.trigger(),
                _ = link_quit => {}
            }
        });

        let orchestrator = AttackOrchestrator {
            roster,
            roles,
            config,
            coordinator,
            harness,
            session: AttackSession {
                target,
                target_peer,
                target_channel,
            },
            quit_trigger,
            quit,
            scope,
            tasks,
            phase,
            stopping: AtomicBool::new(false),
        };

        Ok(orchestrator)
    }

    pub fn session(&self) -> &AttackSession {
        &self.session
    }

    pub fn phase(&self) -> AttackPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<AttackPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, next: AttackPhase) {
        self.phase.send_if_modified(|current| {
            // Once stopping, only the teardown moves the phase
            if *current == next || (*current >= AttackPhase::Stopping && next < *current) {
                return false;
            }
            log::info!("attack phase {:?} -> {:?}", current, next);
            *current = next;
            true
        });
    }

    fn quitting(&self) -> bool {
        self.quit.is_triggered()
    }

    /*
     * Run the configured sequence. Returns early with whatever was gathered once the session is stopped.
     */
    pub async fn run(&self) -> Result<AttackReport, AttackError> {
        let mut report = AttackReport {
            target: Some(self.session.target),
            target_peer: Some(self.session.target_peer),
            target_channel: Some(self.session.target_channel.chan_id),
            ..AttackReport::default()
        };

        match self.run_phases(&mut report).await {
            Ok(()) => Ok(report),
            Err(AttackError::Harness(HarnessError::Cancelled)) if self.quitting() => {
                log::info!("run interrupted by shutdown");
                Ok(report)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_phases(&self, report: &mut AttackReport) -> Result<(), AttackError> {
        if self.quitting() {
            return Ok(());
        }
        self.open_channels().await?;

        if self.quitting() {
            return Ok(());
        }
        report.reputation = Some(self.build_reputation().await?);

        if self.quitting() {
            return Ok(());
        }
        match self.config.sequence {
            AttackSequence::Full => {
                report.jam = Some(self.jam().await?);
                if self.quitting() {
                    return Ok(());
                }
                report.slow_probe = Some(self.send_payments_slowly().await?);
            }
            AttackSequence::HodlAndAssess => {
                report.hodl = Some(self.hodl_and_assess().await?);
            }
        }

        Ok(())
    }

    /*
     * Attacker source and good node open to the target, the third party opens to the target's peer. Each channel
     * has the configured capacity with half of it pushed to the remote side.
     */
    pub async fn open_channels(&self) -> Result<(), AttackError> {
        let capacity_sat = self.config.channel_capacity_sat;
        let opens = [
            (self.roles.attacker_source, self.session.target),
            (self.roles.third_party, self.session.target_peer),
            (self.roles.good_node, self.session.target),
        ];

        for (index, peer) in opens {
            if self.quitting() {
                break;
            }
            let node = self.roster.node(index);
            let point = self
                .harness
                .open_channel(
                    node.as_ref(),
                    OpenChannelReq {
                        peer,
                        address: None,
                        capacity_sat,
                        push_sat: capacity_sat / 2,
                        private: false,
                    },
                )
                .await?;
            log::info!("{} opened channel {} to {}", index, point, peer.short());
        }

        Ok(())
    }

    /*
     * Send settled, endorsed payments both ways between the attacker source and the good node until each direction
     * has seen an endorsed htlc arrive.
     */
    pub async fn build_reputation(&self) -> Result<ReputationReport, AttackError> {
        self.set_phase(AttackPhase::BuildReputation);
        let started = Instant::now();
        let (source, sink) = (self.roles.attacker_source, self.roles.good_node);

        let (forward, backward) = tokio::join!(
            self.reputation_direction(source, sink),
            self.reputation_direction(sink, source)
        );

        let report = ReputationReport {
            directions: vec![forward?, backward?],
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        Ok(report)
    }

    async fn reputation_direction(&self, source: NodeIndex, dest: NodeIndex) -> Result<DirectionReport, AttackError> {
        let semaphore = Arc::new(Semaphore::new(self.config.reputation_concurrency));
        let endorsed = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(DirectionCounters::default());
        let attempts = TaskTracker::new();
        let mut result = Ok(());

        while !endorsed.load(Ordering::SeqCst) && !self.quitting() {
            let permit = select! {
                biased;
                _ = self.quit.clone() => break,
                p = semaphore.clone().acquire_owned() => match p {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            // Another attempt may have seen the endorsement while we waited for a slot
            if endorsed.load(Ordering::SeqCst) {
                break;
            }

            let height = match self.roster.node(source).get_best_block_height().await {
                Ok(h) => h,
                Err(e) => {
                    result = Err(AttackError::Node(e));
                    break;
                }
            };
            let request = PaymentRequest {
                amount_msat: self.config.reputation_amount_msat,
                source,
                dest,
                final_cltv: height as u64 + self.config.final_cltv_delta,
                endorse: true,
                settle: true,
                hold_wait: Duration::ZERO,
                early_cancel: Some(self.quit.clone()),
            };

            let coordinator = self.coordinator.clone();
            let scope = self.scope.clone();
            let endorsed = endorsed.clone();
            let counters = counters.clone();
            let quit = self.quit.clone();
            let backoff = self.config.reputation_backoff();
            counters.attempts.fetch_add(1, Ordering::SeqCst);

            self.tasks.spawn(attempts.track_future(async move {
                match coordinator.execute_payment(&scope, request).await {
                    Ok(pending) => {
                        let outcome = pending.outcome().await;
                        if outcome.is_success() {
                            counters.succeeded.fetch_add(1, Ordering::SeqCst);
                        } else {
                            counters.failed.fetch_add(1, Ordering::SeqCst);
                            log::debug!("reputation payment {} failed: {:?}", outcome.hash, outcome.failure_reason);
                        }
                        if outcome.endorsed() == Some(true) && !endorsed.swap(true, Ordering::SeqCst) {
                            log::info!(
                                "{} -> {} endorsed after {} attempts",
                                source,
                                dest,
                                counters.attempts.load(Ordering::SeqCst)
                            );
                        }
                    }
                    Err(e) => {
                        counters.setup_errors.fetch_add(1, Ordering::SeqCst);
                        log::warn!("reputation payment {} -> {} abandoned: {}", source, dest, e);
                    }
                }

                select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = quit => {}
                }
                drop(permit);
            }));
        }

        attempts.close();
        attempts.wait().await;
        result?;

        let report = DirectionReport {
            source: source.to_string(),
            dest: dest.to_string(),
            attempts: counters.attempts.load(Ordering::SeqCst),
            succeeded: counters.succeeded.load(Ordering::SeqCst),
            failed: counters.failed.load(Ordering::SeqCst),
            setup_errors: counters.setup_errors.load(Ordering::SeqCst),
            endorsed: endorsed.load(Ordering::SeqCst),
        };
        log::info!(
            "reputation {} -> {}: {} attempts, endorsed {}",
            source,
            dest,
            report.attempts,
            report.endorsed
        );

        Ok(report)
    }

    /*
     * Fill the attacker's path to the good node with held payments, then check whether the good node can still get
     * a payment through to the third party.
     */
    pub async fn jam(&self) -> Result<JamReport, AttackError> {
        self.set_phase(AttackPhase::Jam);
        let burst_size = self.config.jam_burst_size;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (summary_tx, mut summary_rx) = watch::channel(BurstSummary {
            launched: burst_size,
            ..BurstSummary::default()
        });
        self.tasks.spawn(collect_burst(events_rx, summary_tx));

        for _ in 0..burst_size {
            let request = PaymentRequest {
                amount_msat: self.config.jam_amount_msat,
                source: self.roles.attacker_source,
                dest: self.roles.good_node,
                final_cltv: 0,
                endorse: true,
                settle: false,
                hold_wait: self.config.jam_hold(),
                early_cancel: Some(self.quit.clone()),
            };
            let coordinator = self.coordinator.clone();
            let scope = self.scope.clone();
            let events = events_tx.clone();

            self.tasks.spawn(async move {
                match coordinator.execute_payment(&scope, request).await {
                    Ok(pending) => {
                        let _ = events.send(BurstEvent::Dispatched);
                        let _ = events.send(BurstEvent::Resolved(pending.outcome().await));
                    }
                    Err(e) => {
                        let _ = events.send(BurstEvent::SetupFailed(e.to_string()));
                    }
                }
            });
        }
        drop(events_tx);

        let ready = select! {
            biased;
            _ = self.quit.clone() => false,
            r = summary_rx.wait_for(|s| s.reported() >= burst_size) => r.is_ok(),
        };
        let dispatched = summary_rx.borrow().clone();
        log::info!(
            "burst of {}: {} dispatched, {} failed setup, {} failed to land",
            dispatched.launched,
            dispatched.dispatched,
            dispatched.setup_failed,
            dispatched.failed
        );

        let (source, dest) = (self.roles.good_node, self.roles.third_party);
        let probe = if ready {
            self.send_probe(source, dest, self.config.probe_amount_msat).await?
        } else {
            ProbeResult::setup_failed(source, dest, &PaymentError::Cancelled)
        };
        log::info!(
            "probe while jammed {} -> {}: success {}, endorsed {:?}",
            source,
            dest,
            probe.success,
            probe.endorsed
        );

        let burst = summary_rx.borrow().clone();
        Ok(JamReport { burst, probe })
    }

    /*
     * Alternate the sender between the attacker source and the good node, one probe to the third party per
     * interval, until stopped.
     */
    pub async fn send_payments_slowly(&self) -> Result<ProbeSummary, AttackError> {
        self.set_phase(AttackPhase::SlowProbe);
        let sources = [self.roles.attacker_source, self.roles.good_node];
        let dest = self.roles.third_party;
        let mut summary = ProbeSummary::default();

        for source in sources.iter().cycle() {
            if self.quitting() {
                break;
            }
            let probe = self.send_probe(*source, dest, self.config.slow_probe_amount_msat).await?;
            log::info!(
                "slow probe {} -> {}: success {}, endorsed {:?}",
                source,
                dest,
                probe.success,
                probe.endorsed
            );
            summary.record(&probe);

            select! {
                biased;
                _ = self.quit.clone() => break,
                _ = tokio::time::sleep(self.config.slow_probe_interval()) => {}
            }
        }

        Ok(summary)
    }

    /*
     * Hold one endorsed payment from the attacker to the third party, probe from the good node while it is held,
     * then wait for the hold to end.
     */
    pub async fn hodl_and_assess(&self) -> Result<HodlReport, AttackError> {
        self.set_phase(AttackPhase::HodlAndAssess);
        let (source, dest) = (self.roles.attacker_source, self.roles.third_party);
        let height = self.roster.node(dest).get_best_block_height().await?;
        let request = PaymentRequest {
            amount_msat: self.config.hodl_amount_msat,
            source,
            dest,
            final_cltv: height as u64 + self.config.final_cltv_delta,
            endorse: true,
            settle: false,
            hold_wait: self.config.jam_hold(),
            early_cancel: Some(self.quit.clone()),
        };

        let hold = match self.coordinator.execute_payment(&self.scope, request).await {
            Ok(pending) => Ok(self.tasks.spawn(pending.outcome())),
            Err(e) => {
                log::warn!("hold payment {} -> {} not dispatched: {}", source, dest, e);
                Err(e)
            }
        };

        let probe = self
            .send_probe(self.roles.good_node, dest, self.config.probe_amount_msat)
            .await?;
        log::info!(
            "probe during hold {} -> {}: success {}, endorsed {:?}",
            self.roles.good_node,
            dest,
            probe.success,
            probe.endorsed
        );

        let hold = match hold {
            Ok(handle) => match handle.await {
                Ok(outcome) => ProbeResult::from_outcome(source, dest, &outcome),
                Err(e) => ProbeResult::setup_failed(source, dest, &task_failed(e)),
            },
            Err(e) => ProbeResult::setup_failed(source, dest, &e),
        };
        log::info!("hold {} -> {} ended: {:?}", source, dest, hold.failure_reason);

        Ok(HodlReport { probe, hold })
    }

    /*
     * One settled, endorsed payment. Runs as a session task so teardown waits for it.
     */
    async fn send_probe(&self, source: NodeIndex, dest: NodeIndex, amount_msat: u64) -> Result<ProbeResult, AttackError> {
        let height = self.roster.node(dest).get_best_block_height().await?;
        let request = PaymentRequest {
            amount_msat,
            source,
            dest,
            final_cltv: height as u64 + self.config.final_cltv_delta,
            endorse: true,
            settle: true,
            hold_wait: Duration::ZERO,
            early_cancel: None,
        };
        let coordinator = self.coordinator.clone();
        let scope = self.scope.clone();

        let probe = self.tasks.spawn(async move {
            match coordinator.execute_payment(&scope, request).await {
                Ok(pending) => Ok(pending.outcome().await),
                Err(e) => Err(e),
            }
        });

        let result = match probe.await {
            Ok(Ok(outcome)) => probe_result(source, dest, &outcome),
            Ok(Err(e)) => ProbeResult::setup_failed(source, dest, &e),
            Err(e) => ProbeResult::setup_failed(source, dest, &task_failed(e)),
        };
        Ok(result)
    }

    /*
     * Tear the session down: stop issuing work and release holds, wait for session tasks, close every channel of
     * the roster nodes, then cancel whatever payments remain and join them. Safe to call more than once.
     */
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            let mut phase = self.phase.subscribe();
            let _ = phase.wait_for(|p| *p == AttackPhase::Stopped).await;
            return;
        }
        self.set_phase(AttackPhase::Stopping);
        self.quit_trigger.trigger();

        self.tasks.close();
        let drain_timeout = self.config.drain_timeout();
        if tokio::time::timeout(drain_timeout, self.tasks.wait()).await.is_err() {
            log::warn!("session tasks still running after {:?}, tearing down anyway", drain_timeout);
        }

        for index in NodeIndex::all() {
            let node = self.roster.node(index);
            match self.harness.close_all_channels(node.as_ref()).await {
                Ok(closed) => log::info!("{} closed {} channels", index, closed),
                Err(e) => log::error!("could not close channels of {}: {}", index, e),
            }
        }

        self.scope.cancel();
        self.coordinator.shutdown().await;
        self.set_phase(AttackPhase::Stopped);
    }
}

fn probe_result(source: NodeIndex, dest: NodeIndex, outcome: &PaymentOutcome) -> ProbeResult {
    if let Some(e) = &outcome.error {
        log::warn!("probe {} -> {} errored: {}", source, dest, e);
    }
    ProbeResult::from_outcome(source, dest, outcome)
}

// A payment task that panicked or was aborted never produced an outcome
fn task_failed(e: JoinError) -> PaymentError {
    log::error!("payment task failed: {}", e);
    PaymentError::TaskFailed(e.to_string())
}

/*
 * Burst holds that reached the good node and were later released count as resolved. A hold that never got there
 * failed, with its failure reason kept as a sample.
 */
async fn collect_burst(mut events: mpsc::UnboundedReceiver<BurstEvent>, summary: watch::Sender<BurstSummary>) {
    while let Some(event) = events.recv().await {
        summary.send_modify(|s| match event {
            BurstEvent::Dispatched => s.dispatched += 1,
            BurstEvent::SetupFailed(e) => {
                s.setup_failed += 1;
                s.record_error(e);
            }
            BurstEvent::Resolved(outcome) => match outcome.error {
                Some(e) => {
                    s.errored += 1;
                    s.record_error(e.to_string());
                }
                None if outcome.htlcs.is_empty() => {
                    s.failed += 1;
                    s.record_error(format!("payment {} failed: {:?}", outcome.hash, outcome.failure_reason));
                }
                None => s.resolved += 1,
            },
        });
    }
}

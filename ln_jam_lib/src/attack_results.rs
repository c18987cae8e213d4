// Project modules
use crate::jam_error::PaymentError;
use crate::jam_payment::PaymentOutcome;
use crate::ln_node::FailureReason;
use crate::ln_types::{NodePubkey, PaymentHash};
use crate::node_roster::NodeIndex;

// External modules
use serde::Serialize;

// Number of error messages a burst summary keeps
pub const MAX_ERROR_SAMPLES: usize = 5;

/*
 * The result of one payment the experiment looks at individually
 */
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ProbeResult {
    pub source: String,
    pub dest: String,
    pub hash: Option<PaymentHash>,
    pub success: bool,
    pub endorsed: Option<bool>,
    pub failure_reason: FailureReason,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn from_outcome(source: NodeIndex, dest: NodeIndex, outcome: &PaymentOutcome) -> Self {
        let r = ProbeResult {
            source: source.to_string(),
            dest: dest.to_string(),
            hash: Some(outcome.hash),
            success: outcome.is_success(),
            endorsed: outcome.endorsed(),
            failure_reason: outcome.failure_reason,
            error: outcome.error.as_ref().map(|e| e.to_string()),
        };

        r
    }

    // The payment never got dispatched
    pub fn setup_failed(source: NodeIndex, dest: NodeIndex, err: &PaymentError) -> Self {
        let r = ProbeResult {
            source: source.to_string(),
            dest: dest.to_string(),
            hash: None,
            success: false,
            endorsed: None,
            failure_reason: FailureReason::Error,
            error: Some(err.to_string()),
        };

        r
    }
}

/*
 * Reputation building in one direction
 */
#[derive(Serialize, Clone, Debug, Default)]
pub struct DirectionReport {
    pub source: String,
    pub dest: String,
    pub attempts: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub setup_errors: u64,
    pub endorsed: bool,
}

#[derive(Serialize, Clone, Debug, Default)]
pub struct ReputationReport {
    pub directions: Vec<DirectionReport>,
    pub elapsed_ms: u64,
}

impl ReputationReport {
    pub fn endorsed(&self) -> bool {
        !self.directions.is_empty() && self.directions.iter().all(|d| d.endorsed)
    }
}

/*
 * Tally of the jamming burst. Every burst payment reports its dispatch result and later its resolution. `resolved`
 * holds landed at the receiver and were released, `failed` ones never got there. Errors are kept as a few samples.
 */
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct BurstSummary {
    pub launched: usize,
    pub dispatched: usize,
    pub setup_failed: usize,
    pub resolved: usize,
    pub failed: usize,
    pub errored: usize,
    pub error_samples: Vec<String>,
}

impl BurstSummary {
    // Burst payments that have reported whether they were dispatched
    pub fn reported(&self) -> usize {
        self.dispatched + self.setup_failed
    }

    pub fn record_error(&mut self, error: String) {
        if self.error_samples.len() < MAX_ERROR_SAMPLES {
            self.error_samples.push(error);
        }
    }
}

#[derive(Serialize, Clone, Debug)]
pub struct JamReport {
    pub burst: BurstSummary,
    pub probe: ProbeResult,
}

#[derive(Serialize, Clone, Debug)]
pub struct HodlReport {
    pub probe: ProbeResult,
    pub hold: ProbeResult,
}

/*
 * Running tally of the slow probe loop
 */
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct ProbeSummary {
    pub sent: u64,
    pub succeeded: u64,
    pub endorsed: u64,
    pub failed: u64,
    pub setup_errors: u64,
}

impl ProbeSummary {
    pub fn record(&mut self, probe: &ProbeResult) {
        self.sent += 1;
        if probe.hash.is_none() {
            self.setup_errors += 1;
        } else if probe.success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        if probe.endorsed == Some(true) {
            self.endorsed += 1;
        }
    }
}

/*
 * Everything a run produced, printed as JSON by the runner
 */
#[derive(Serialize, Clone, Debug, Default)]
pub struct AttackReport {
    pub target: Option<NodePubkey>,
    pub target_peer: Option<NodePubkey>,
    pub target_channel: Option<u64>,
    pub reputation: Option<ReputationReport>,
    pub jam: Option<JamReport>,
    pub slow_probe: Option<ProbeSummary>,
    pub hodl: Option<HodlReport>,
}

impl AttackReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx(i: usize) -> NodeIndex {
        NodeIndex::new(i).unwrap()
    }

    #[test]
    fn burst_keeps_a_few_error_samples() {
        let mut summary = BurstSummary::default();
        for i in 0..8 {
            summary.errored += 1;
            summary.record_error(format!("error {}", i));
        }
        summary.dispatched = 470;
        summary.setup_failed = 13;

        assert_eq!(summary.error_samples.len(), MAX_ERROR_SAMPLES);
        assert_eq!(summary.error_samples[0], "error 0");
        assert_eq!(summary.errored, 8);
        assert_eq!(summary.reported(), 483);
    }

    #[test]
    fn probe_summary_counts_each_kind() {
        let mut summary = ProbeSummary::default();
        let failed_setup = ProbeResult::setup_failed(idx(0), idx(1), &PaymentError::Cancelled);
        let mut endorsed = failed_setup.clone();
        endorsed.hash = Some(PaymentHash::from_bytes([1u8; 32]));
        endorsed.success = true;
        endorsed.endorsed = Some(true);
        endorsed.failure_reason = FailureReason::None;

        summary.record(&failed_setup);
        summary.record(&endorsed);
        assert_eq!(
            summary,
            ProbeSummary {
                sent: 2,
                succeeded: 1,
                endorsed: 1,
                failed: 0,
                setup_errors: 1
            }
        );
        assert_eq!(failed_setup.source, "A0");
    }

    #[test]
    fn report_serializes_keys_as_hex() {
        let report = AttackReport {
            target: Some(NodePubkey::from_bytes([2u8; 33])),
            target_channel: Some(4),
            ..AttackReport::default()
        };
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["target"], "02".repeat(33));
        assert_eq!(json["target_channel"], 4);
        assert!(json["jam"].is_null());
    }
}

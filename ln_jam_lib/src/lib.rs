pub mod attack_orchestrator;
pub mod attack_results;
pub mod chain_controller;
pub mod experiment_config;
pub mod graph_harness;
pub mod jam_error;
pub mod jam_payment;
pub mod ln_node;
pub mod ln_types;
pub mod node_roster;
pub mod sim_channel;
pub mod sim_network;
pub mod sim_node;

pub use attack_orchestrator::{AttackOrchestrator, AttackPhase, AttackSession};
pub use attack_results::AttackReport;
pub use chain_controller::BlockMiner;
pub use experiment_config::{AttackConfig, AttackSequence, ExperimentConfig};
pub use jam_error::{AttackError, HarnessError, PaymentError};
pub use jam_payment::{PaymentCoordinator, PaymentOutcome, PaymentRequest, PendingPayment};
pub use ln_node::NodeHandle;
pub use node_roster::{NodeIndex, NodeRoster};
pub use sim_network::{SimNetwork, SimNetworkDef};

// External modules
use chrono::Local;

// Standard modules
use std::sync::Arc;

pub fn get_current_time() -> String {
    let date = Local::now();
    format!("{}", date.format("[%Y-%m-%d][%H:%M:%S]"))
}

/*
 * Build the roster from simulated node aliases, in roster order
 */
pub fn sim_roster(network: &Arc<SimNetwork>, aliases: &[String]) -> anyhow::Result<NodeRoster> {
    let mut nodes: Vec<Arc<dyn NodeHandle>> = Vec::with_capacity(aliases.len());
    for (i, alias) in aliases.iter().enumerate() {
        if aliases[..i].contains(alias) {
            anyhow::bail!("{} is in the roster more than once", alias);
        }
        match network.node_handle(alias) {
            Some(handle) => nodes.push(handle),
            None => anyhow::bail!("no simulated node named {}", alias),
        }
    }

    Ok(NodeRoster::new(nodes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NETWORK: &str = r#"{
        "nodes": [
            {"alias": "mallory"}, {"alias": "carol"}, {"alias": "alice"},
            {"alias": "target"}, {"alias": "bob"}
        ],
        "channels": [
            {"node1": "target", "node2": "bob", "node1_balance_sat": 400000, "node2_balance_sat": 400000},
            {"node1": "target", "node2": "bob", "node1_balance_sat": 2000000, "node2_balance_sat": 2000000}
        ],
        "roster": ["mallory", "carol", "alice"],
        "target": "target",
        "config": {"reputation_threshold": 2, "confirmations": 1}
    }"#;

    #[test]
    fn timestamp_format() {
        let time = get_current_time();
        assert_eq!(time.len(), "[2024-01-01][00:00:00]".len());
        assert!(time.starts_with('[') && time.ends_with(']'));
    }

    #[tokio::test]
    async fn roster_from_aliases() {
        let def = SimNetworkDef::from_json(NETWORK).unwrap();
        let network = SimNetwork::new(&def).unwrap();

        let roster = sim_roster(&network, &def.roster).unwrap();
        let info = roster.node(NodeIndex::new(2).unwrap()).get_info().await.unwrap();
        assert_eq!(info.alias, "alice");

        let missing = vec![String::from("mallory"), String::from("nobody"), String::from("alice")];
        assert!(sim_roster(&network, &missing).is_err());
        assert!(sim_roster(&network, &def.roster[..2]).is_err());

        let twice = vec![String::from("mallory"), String::from("alice"), String::from("alice")];
        let err = sim_roster(&network, &twice).unwrap_err();
        assert!(err.to_string().contains("alice"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn hodl_run_from_a_network_file() {
        let def = SimNetworkDef::from_json(NETWORK).unwrap();
        let network = SimNetwork::new(&def).unwrap();
        let roster = Arc::new(sim_roster(&network, &def.roster).unwrap());
        let config = AttackConfig {
            sequence: AttackSequence::HodlAndAssess,
            reputation_concurrency: 2,
            reputation_backoff_ms: 1,
            jam_hold_ms: 300,
            channel_capacity_sat: 1_000_000,
            ..AttackConfig::default()
        };
        let (_shutdown_trigger, shutdown) = triggered::trigger();

        let orchestrator = AttackOrchestrator::new(roster, network.clone(), config, network.pubkey("target").unwrap(), shutdown)
            .await
            .unwrap();
        let report = orchestrator.run().await.unwrap();
        orchestrator.stop().await;

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["target_channel"], 1);
        assert_eq!(json["hodl"]["probe"]["success"], true);
        assert_eq!(json["hodl"]["hold"]["failure_reason"], "IncorrectPaymentDetails");
        assert_eq!(network.in_flight_payments().await, 0);
    }
}

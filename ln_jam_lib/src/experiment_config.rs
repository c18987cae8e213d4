// Project modules
use crate::ln_types::NodePubkey;
use crate::node_roster::{NodeIndex, RosterError, ROSTER_SIZE};
use crate::sim_network::{pubkey_for_alias, SimNetworkDef};

// External modules
use anyhow::{bail, ensure, Context};
use serde::{Deserialize, Serialize};

// Standard modules
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Which phases a run goes through after setup and reputation building.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AttackSequence {
    /// Jam the target channel, then keep probing it slowly until stopped.
    #[default]
    Full,
    /// Hold one large payment through the target and probe while it is held.
    #[serde(alias = "hodl")]
    HodlAndAssess,
}

impl FromStr for AttackSequence {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(AttackSequence::Full),
            "hodl" | "hodl_and_assess" => Ok(AttackSequence::HodlAndAssess),
            other => bail!("unknown attack sequence {:?}, expected \"full\" or \"hodl\"", other),
        }
    }
}

/*
 * Roster positions of the three participants
 */
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct Roles {
    pub attacker_source: usize, // sends reputation payments, the burst and the hodl payment
    pub third_party: usize,     // peer of the target's peer, receives the probes
    pub good_node: usize,       // reputation counterpart, burst receiver and probe sender
}

impl Default for Roles {
    fn default() -> Self {
        Roles {
            attacker_source: 0,
            third_party: 1,
            good_node: 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoleIndices {
    pub attacker_source: NodeIndex,
    pub third_party: NodeIndex,
    pub good_node: NodeIndex,
}

impl Roles {
    pub fn resolve(&self) -> Result<RoleIndices, RosterError> {
        Ok(RoleIndices {
            attacker_source: NodeIndex::new(self.attacker_source)?,
            third_party: NodeIndex::new(self.third_party)?,
            good_node: NodeIndex::new(self.good_node)?,
        })
    }
}

/*
 * Tunables of an attack run. Durations are in milliseconds so the JSON stays flat.
 */
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AttackConfig {
    pub sequence: AttackSequence,
    pub reputation_amount_msat: u64,
    pub reputation_concurrency: usize,
    pub reputation_backoff_ms: u64,
    pub jam_burst_size: usize,
    pub jam_amount_msat: u64,
    pub jam_hold_ms: u64,
    pub probe_amount_msat: u64,
    pub slow_probe_amount_msat: u64,
    pub slow_probe_interval_ms: u64,
    pub hodl_amount_msat: u64,
    pub final_cltv_delta: u64,
    pub channel_capacity_sat: u64,
    pub drain_timeout_ms: u64,
    pub max_fee_msat: u64,
    pub payment_timeout_ms: u64,
    pub roles: Roles,
}

impl Default for AttackConfig {
    fn default() -> Self {
        AttackConfig {
            sequence: AttackSequence::Full,
            reputation_amount_msat: 80_000,
            reputation_concurrency: 200,
            reputation_backoff_ms: 10,
            jam_burst_size: 483,
            jam_amount_msat: 1_000,
            jam_hold_ms: 3_600_000,
            probe_amount_msat: 1_000,
            slow_probe_amount_msat: 80_000,
            slow_probe_interval_ms: 500,
            hodl_amount_msat: 800_000,
            final_cltv_delta: 80,
            channel_capacity_sat: 16_777_215,
            drain_timeout_ms: 30_000,
            max_fee_msat: u64::MAX,
            payment_timeout_ms: 3_600_000,
            roles: Roles::default(),
        }
    }
}

impl AttackConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: AttackConfig = serde_json::from_str(json).context("invalid attack configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path).with_context(|| format!("could not read {}", path.display()))?;
        AttackConfig::from_json(&json).with_context(|| format!("in {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.reputation_concurrency > 0, "reputation_concurrency must be positive");
        ensure!(self.jam_burst_size > 0, "jam_burst_size must be positive");
        ensure!(self.channel_capacity_sat > 0, "channel_capacity_sat must be positive");

        let roles = [self.roles.attacker_source, self.roles.third_party, self.roles.good_node];
        for (i, role) in roles.iter().enumerate() {
            ensure!(*role < ROSTER_SIZE, "role index {} is outside the roster", role);
            ensure!(!roles[..i].contains(role), "role index {} is assigned twice", role);
        }

        Ok(())
    }

    pub fn reputation_backoff(&self) -> Duration {
        Duration::from_millis(self.reputation_backoff_ms)
    }

    pub fn jam_hold(&self) -> Duration {
        Duration::from_millis(self.jam_hold_ms)
    }

    pub fn slow_probe_interval(&self) -> Duration {
        Duration::from_millis(self.slow_probe_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn payment_timeout(&self) -> Duration {
        Duration::from_millis(self.payment_timeout_ms)
    }
}

/*
 * Everything the runner needs, assembled from the environment
 */
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub network_path: PathBuf,
    pub network: SimNetworkDef,
    pub roster: Vec<String>,
    pub target: NodePubkey,
    pub attack: AttackConfig,
}

impl ExperimentConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        ExperimentConfig::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars<F>(var: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let network_path = PathBuf::from(var("JAM_NETWORK").context("JAM_NETWORK is not set")?);
        let network = SimNetworkDef::from_file(&network_path)?;

        let mut roster = Vec::with_capacity(ROSTER_SIZE);
        for i in 0..ROSTER_SIZE {
            let alias = match var(&format!("JAM_NODE_{}", i)) {
                Some(alias) => alias,
                None => network
                    .roster
                    .get(i)
                    .cloned()
                    .with_context(|| format!("JAM_NODE_{} is not set and the network has no roster entry {}", i, i))?,
            };
            if roster.contains(&alias) {
                bail!("{} is in the roster more than once, each participant needs its own node", alias);
            }
            roster.push(alias);
        }

        // TARGET may be a hex key or the alias of a simulated node
        let target = match var("TARGET") {
            Some(value) => match value.parse::<NodePubkey>() {
                Ok(pubkey) => pubkey,
                Err(e) if network.nodes.iter().any(|n| n.alias == value) => {
                    log::debug!("TARGET is not a key ({}), using it as an alias", e);
                    pubkey_for_alias(&value)
                }
                Err(e) => bail!("invalid TARGET {:?}: {}", value, e),
            },
            None => {
                let alias = network
                    .target
                    .as_ref()
                    .context("TARGET is not set and the network names no target")?;
                pubkey_for_alias(alias)
            }
        };

        let mut attack = match var("JAM_CONFIG") {
            Some(path) => AttackConfig::from_file(Path::new(&path))?,
            None => AttackConfig::default(),
        };
        if let Some(sequence) = var("JAM_SEQUENCE") {
            attack.sequence = sequence.parse()?;
        }
        attack.validate()?;

        let config = ExperimentConfig {
            network_path,
            network,
            roster,
            target,
            attack,
        };

        Ok(config)
    }
}

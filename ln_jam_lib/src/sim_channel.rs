// Project Modules
use crate::ln_types::{ChannelPoint, NodePubkey};

// External Modules
use serde::{Serialize, Deserialize};
use thiserror::Error;

// Commonly deployed cap on concurrent htlcs per channel direction
pub const MAX_ACCEPTED_HTLCS: u16 = 483;

// This struct represents a channel defined in a simulated network
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SimChannel {
    pub node1: String,
    pub node2: String,
    pub node1_balance_sat: u64,
    pub node2_balance_sat: u64,
    #[serde(default)]
    pub max_accepted_htlcs: Option<u16>
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ForwardingError {
    #[error("channel {0} is not active")]
    Inactive(u64),
    #[error("insufficient balance: amount {0} > balance {1}")]
    InsufficientBalance(u64, u64),
    #[error("all {0} htlc slots in use")]
    SlotsExhausted(u16),
    #[error("all {0} general htlc slots in use")]
    GeneralSlotsExhausted(u16),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelStatus {
    PendingOpen,
    Active,
    Closing,
}

/*
 * In-flight htlc counts for one direction of a channel. Unendorsed htlcs may only use the general half of the
 * slots, endorsed htlcs may use all of them.
 */
#[derive(Clone, Copy, Debug, Default)]
pub struct SlotUsage {
    pub endorsed: u16,
    pub general: u16,
}

impl SlotUsage {
    pub fn total(&self) -> u16 {
        self.endorsed + self.general
    }
}

/*
 * Runtime state of a channel in the simulated network. Index 0 is node1's side and index 1 is node2's side, each
 * side tracks its own balance and the htlcs it has offered outgoing.
 */
#[derive(Clone, Debug)]
pub struct ChannelState {
    pub scid: u64,
    pub point: ChannelPoint,
    pub nodes: [NodePubkey; 2],
    pub capacity_sat: u64,
    pub balance_msat: [u64; 2],
    pub in_flight: [SlotUsage; 2],
    pub max_accepted_htlcs: u16,
    pub status: ChannelStatus,
}

impl ChannelState {
    pub fn side_of(&self, node: &NodePubkey) -> Option<usize> {
        self.nodes.iter().position(|n| n == node)
    }

    pub fn pending_htlcs(&self) -> usize {
        (self.in_flight[0].total() + self.in_flight[1].total()) as usize
    }

    // Whether an htlc could leave from `side` at all, ignoring the endorsement bucket
    pub fn can_route(&self, side: usize, amount_msat: u64) -> bool {
        self.status == ChannelStatus::Active
            && self.balance_msat[side] >= amount_msat
            && self.in_flight[side].total() < self.max_accepted_htlcs
    }

    pub fn add_htlc(&mut self, side: usize, amount_msat: u64, endorsed: bool) -> Result<(), ForwardingError> {
        if self.status != ChannelStatus::Active {
            return Err(ForwardingError::Inactive(self.scid));
        }
        if amount_msat > self.balance_msat[side] {
            return Err(ForwardingError::InsufficientBalance(amount_msat, self.balance_msat[side]));
        }

        let usage = &mut self.in_flight[side];
        if usage.total() >= self.max_accepted_htlcs {
            return Err(ForwardingError::SlotsExhausted(self.max_accepted_htlcs));
        }

        if endorsed {
            usage.endorsed += 1;
        } else {
            let general_slots = self.max_accepted_htlcs / 2;
            if usage.general >= general_slots {
                return Err(ForwardingError::GeneralSlotsExhausted(general_slots));
            }
            usage.general += 1;
        }

        self.balance_msat[side] -= amount_msat;
        Ok(())
    }

    /*
     * Remove an htlc previously added from `side`. On success the amount moves to the other side, otherwise it
     * returns to the offering side.
     */
    pub fn resolve_htlc(&mut self, side: usize, amount_msat: u64, endorsed: bool, success: bool) {
        let usage = &mut self.in_flight[side];
        if endorsed {
            usage.endorsed = usage.endorsed.saturating_sub(1);
        } else {
            usage.general = usage.general.saturating_sub(1);
        }

        if success {
            self.balance_msat[1 - side] += amount_msat;
        } else {
            self.balance_msat[side] += amount_msat;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_channel(max_htlcs: u16) -> ChannelState {
        ChannelState {
            scid: 1,
            point: ChannelPoint { txid: "00".repeat(32), output_index: 0 },
            nodes: [NodePubkey::from_bytes([2u8; 33]), NodePubkey::from_bytes([3u8; 33])],
            capacity_sat: 1_000,
            balance_msat: [600_000, 400_000],
            in_flight: [SlotUsage::default(); 2],
            max_accepted_htlcs: max_htlcs,
            status: ChannelStatus::Active,
        }
    }

    #[test]
    fn settle_moves_balance_and_fail_restores_it() {
        let mut channel = test_channel(10);
        channel.add_htlc(0, 100_000, true).unwrap();
        assert_eq!(channel.balance_msat, [500_000, 400_000]);
        assert_eq!(channel.pending_htlcs(), 1);

        channel.resolve_htlc(0, 100_000, true, true);
        assert_eq!(channel.balance_msat, [500_000, 500_000]);
        assert_eq!(channel.pending_htlcs(), 0);

        channel.add_htlc(1, 50_000, false).unwrap();
        channel.resolve_htlc(1, 50_000, false, false);
        assert_eq!(channel.balance_msat, [500_000, 500_000]);
    }

    #[test]
    fn unendorsed_htlcs_only_use_general_slots() {
        let mut channel = test_channel(4);
        channel.add_htlc(0, 1, false).unwrap();
        channel.add_htlc(0, 1, false).unwrap();
        assert_eq!(channel.add_htlc(0, 1, false), Err(ForwardingError::GeneralSlotsExhausted(2)));

        channel.add_htlc(0, 1, true).unwrap();
        channel.add_htlc(0, 1, true).unwrap();
        assert_eq!(channel.add_htlc(0, 1, true), Err(ForwardingError::SlotsExhausted(4)));
        assert!(!channel.can_route(0, 1));

        // The other direction has its own slots.
        assert!(channel.can_route(1, 1));
    }

    #[test]
    fn balance_and_status_are_checked() {
        let mut channel = test_channel(10);
        assert_eq!(
            channel.add_htlc(1, 400_001, true),
            Err(ForwardingError::InsufficientBalance(400_001, 400_000))
        );

        channel.status = ChannelStatus::Closing;
        assert_eq!(channel.add_htlc(0, 1, true), Err(ForwardingError::Inactive(1)));
    }
}

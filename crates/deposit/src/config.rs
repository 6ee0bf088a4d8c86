//! Simulated chain parameters.

use serde::{Deserialize, Serialize};

/// Parameters of a [`SimChain`](crate::SimChain). Every field has a default,
/// so a partial `[chain]` table is enough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Lot sizes in satoshis accepted by the factory. The first one is used
    /// by the lifecycle graph.
    pub lot_sizes: Vec<u64>,
    /// Wei that must accompany `createDeposit`.
    pub new_deposit_fee: u64,
    pub initial_collateralized_percent: u64,
    pub undercollateralized_percent: u64,
    pub severely_undercollateralized_percent: u64,
    /// Seconds a deposit may wait for its signers before setup can fail.
    pub signing_group_formation_timeout_secs: u64,
    /// Wei per satoshi reported by the price feed at genesis.
    pub initial_price: u64,
    /// Relay difficulty at genesis.
    pub initial_difficulty: u64,
    /// Chain time added by every mined block.
    pub block_time_secs: u64,
    /// Wall-clock delay between submission and confirmation.
    pub confirmation_delay_ms: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            lot_sizes: vec![100_000, 1_000_000, 10_000_000],
            new_deposit_fee: 1_000_000_000_000_000,
            initial_collateralized_percent: 150,
            undercollateralized_percent: 135,
            severely_undercollateralized_percent: 110,
            signing_group_formation_timeout_secs: 10_800,
            initial_price: 10_000_000_000,
            initial_difficulty: 1,
            block_time_secs: 15,
            confirmation_delay_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_remaining_defaults() {
        let config: ChainConfig =
            serde_json::from_str(r#"{"lot_sizes": [200000], "confirmation_delay_ms": 5}"#).unwrap();
        assert_eq!(config.lot_sizes, vec![200_000]);
        assert_eq!(config.confirmation_delay_ms, 5);
        assert_eq!(config.undercollateralized_percent, 135);
    }
}

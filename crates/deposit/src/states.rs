use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a deposit, with the ordinal reported by
/// `current_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum DepositState {
    Start = 0,
    AwaitingSignerSetup = 1,
    AwaitingBtcFundingProof = 2,
    FailedSetup = 3,
    Active = 4,
    AwaitingWithdrawalSignature = 5,
    AwaitingWithdrawalProof = 6,
    Redeemed = 7,
    CourtesyCall = 8,
    FraudLiquidationInProgress = 9,
    LiquidationInProgress = 10,
    Liquidated = 11,
}

impl DepositState {
    pub const ALL: [DepositState; 12] = [
        DepositState::Start,
        DepositState::AwaitingSignerSetup,
        DepositState::AwaitingBtcFundingProof,
        DepositState::FailedSetup,
        DepositState::Active,
        DepositState::AwaitingWithdrawalSignature,
        DepositState::AwaitingWithdrawalProof,
        DepositState::Redeemed,
        DepositState::CourtesyCall,
        DepositState::FraudLiquidationInProgress,
        DepositState::LiquidationInProgress,
        DepositState::Liquidated,
    ];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.get(usize::from(ordinal)).copied()
    }

    /// Redemption can be requested from these states.
    pub fn accepts_redemption(self) -> bool {
        matches!(self, DepositState::Active | DepositState::CourtesyCall)
    }
}

impl fmt::Display for DepositState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DepositState::Start => "START",
            DepositState::AwaitingSignerSetup => "AWAITING_SIGNER_SETUP",
            DepositState::AwaitingBtcFundingProof => "AWAITING_BTC_FUNDING_PROOF",
            DepositState::FailedSetup => "FAILED_SETUP",
            DepositState::Active => "ACTIVE",
            DepositState::AwaitingWithdrawalSignature => "AWAITING_WITHDRAWAL_SIGNATURE",
            DepositState::AwaitingWithdrawalProof => "AWAITING_WITHDRAWAL_PROOF",
            DepositState::Redeemed => "REDEEMED",
            DepositState::CourtesyCall => "COURTESY_CALL",
            DepositState::FraudLiquidationInProgress => "FRAUD_LIQUIDATION_IN_PROGRESS",
            DepositState::LiquidationInProgress => "LIQUIDATION_IN_PROGRESS",
            DepositState::Liquidated => "LIQUIDATED",
        };
        write!(f, "{}({})", name, self.ordinal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_round_trip_through_the_table() {
        for state in DepositState::ALL {
            assert_eq!(DepositState::from_ordinal(state.ordinal()), Some(state));
        }
        assert_eq!(DepositState::from_ordinal(12), None);
        assert_eq!(DepositState::Liquidated.ordinal(), 11);
    }

    #[test]
    fn display_shows_name_and_ordinal() {
        assert_eq!(DepositState::CourtesyCall.to_string(), "COURTESY_CALL(8)");
    }
}

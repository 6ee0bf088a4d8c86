//! Context keys and chain setup helpers shared by the lifecycle graph.
//!
//! Setup helpers run as preconditions: they prime the simulated chain the
//! way an operator or an oracle would (signers publish a key, the bond is
//! posted, the price moves) before the transition under test is submitted.

use anyhow::Context as _;
use statewalk_engine::Context;

use crate::chain::{SimChain, SimError};
use crate::roundtrip::{OPENER, SIGNER_PUBKEY_X, SIGNER_PUBKEY_Y};

pub const DEPOSIT: &str = "deposit";
pub const LOT_SIZE: &str = "lotSize";
pub const FEE_ESTIMATE: &str = "feeEstimate";
pub const BOND_AMOUNT: &str = "bondAmount";
pub const DIFFICULTY: &str = "difficulty";

/// Collateralization a precondition drives a deposit to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collateral {
    /// Exactly the initial collateralization.
    Well,
    /// One percent below the courtesy call threshold.
    Under,
    /// One percent below the liquidation threshold.
    Severe,
}

impl Collateral {
    fn target_percent(self, chain: &SimChain, deposit: &str) -> Result<u64, SimError> {
        match self {
            Collateral::Well => chain.initial_collateralized_percent(deposit),
            Collateral::Under => Ok(chain
                .undercollateralized_threshold_percent(deposit)?
                .saturating_sub(1)),
            Collateral::Severe => Ok(chain
                .severely_undercollateralized_threshold_percent(deposit)?
                .saturating_sub(1)),
        }
    }
}

/// The deposit address bound by `createDeposit`.
pub fn deposit_of(ctx: &Context) -> anyhow::Result<String> {
    Ok(ctx.get_as(DEPOSIT)?)
}

/// Bond that collateralizes `deposit` at its initial percentage at the
/// current price.
pub fn required_bond(chain: &SimChain, deposit: &str) -> anyhow::Result<u64> {
    let lot = u128::from(chain.lot_size_satoshis(deposit)?);
    let price = u128::from(chain.bitcoin_price());
    let percent = u128::from(chain.initial_collateralized_percent(deposit)?);
    let bond = lot * price * percent / 100;
    u64::try_from(bond).with_context(|| format!("bond for {deposit} does not fit in u64"))
}

/// Wei per satoshi at which `bond` backs `lot_size` satoshis at `percent`.
pub fn price_for_collateral(bond: u64, lot_size: u64, percent: u64) -> anyhow::Result<u64> {
    let denominator = u128::from(lot_size) * u128::from(percent);
    anyhow::ensure!(denominator > 0, "lot size and percent must be positive");
    let price = u128::from(bond) * 100 / denominator;
    Ok(u64::try_from(price)?)
}

/// Publish the signing group key on the deposit's keep.
pub fn set_signer_key(chain: &SimChain, ctx: &Context) -> anyhow::Result<()> {
    let keep = chain.keep_of(&deposit_of(ctx)?)?;
    chain.set_signer_pubkey(&keep, SIGNER_PUBKEY_X, SIGNER_PUBKEY_Y)?;
    Ok(())
}

/// Post the bond bound in the context and move the price so the deposit
/// sits at `level`.
pub fn collateralize(chain: &SimChain, ctx: &Context, level: Collateral) -> anyhow::Result<()> {
    let deposit = deposit_of(ctx)?;
    let bond: u64 = ctx.get_as(BOND_AMOUNT)?;
    let keep = chain.keep_of(&deposit)?;
    chain.fund_bond(&keep, bond)?;

    let percent = level.target_percent(chain, &deposit)?;
    let price = price_for_collateral(bond, chain.lot_size_satoshis(&deposit)?, percent)?;
    chain.set_price(price);
    tracing::debug!(%deposit, bond, price, ?level, "collateralized");
    Ok(())
}

/// Move chain time past the signing group formation timeout.
pub fn elapse_signer_setup_timeout(chain: &SimChain) {
    chain.advance_time(chain.signer_setup_timeout() + 1);
}

/// Mint and approve exactly what redeeming the deposit costs.
pub fn fund_redemption(chain: &SimChain, ctx: &Context) -> anyhow::Result<u64> {
    let deposit = deposit_of(ctx)?;
    let requirement = chain.redemption_requirement(&deposit, OPENER)?;
    chain.force_mint(OPENER, requirement)?;
    chain.approve(OPENER, &deposit, requirement);
    Ok(requirement)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn price_for_collateral_matches_thresholds() {
        let bond = 1_500_000_000_000_000;
        assert_eq!(price_for_collateral(bond, 100_000, 150).unwrap(), 10_000_000_000);
        assert_eq!(price_for_collateral(bond, 100_000, 134).unwrap(), 11_194_029_850);
        assert_eq!(price_for_collateral(bond, 100_000, 109).unwrap(), 13_761_467_889);
        assert!(price_for_collateral(bond, 0, 150).is_err());
    }

    #[test]
    fn deposit_of_requires_a_string_binding() {
        let ctx = Context::new().bind(DEPOSIT, json!("0xd1"));
        assert_eq!(deposit_of(&ctx).unwrap(), "0xd1");
        assert!(deposit_of(&Context::new()).is_err());
        assert!(deposit_of(&Context::new().bind(DEPOSIT, json!(7))).is_err());
    }
}

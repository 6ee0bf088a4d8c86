//! In-memory deposit chain.
//!
//! [`SimChain`] models the contracts a deposit lifecycle touches: the deposit
//! factory, per-deposit signer keeps holding a bond, a price feed, a
//! difficulty relay, the TBTC token and the deposit ownership token. Calls
//! are submitted as [`DepositCall`]s through the [`Ledger`] trait and
//! executed when confirmed; admin helpers mutate the same state directly,
//! the way a test environment primes its stubs.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use statewalk_engine::{EffectError, EventRecord, Ledger, Receipt};

use crate::config::ChainConfig;
use crate::roundtrip::OPENER;
use crate::states::DepositState;

/// TBTC base units per satoshi.
pub const SATOSHI_MULTIPLIER: u64 = 10_000_000_000;

// ──────────────────────────────────────────────
// Errors
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SimError {
    /// A contract guard refused the call.
    #[error("{0}")]
    Revert(String),

    #[error("no deposit at {0}")]
    UnknownDeposit(String),

    #[error("no keep at {0}")]
    UnknownKeep(String),

    #[error("arithmetic overflow computing {0}")]
    Overflow(&'static str),
}

impl From<SimError> for EffectError {
    fn from(e: SimError) -> Self {
        EffectError::Reverted {
            reason: e.to_string(),
        }
    }
}

fn ensure(condition: bool, reason: &str) -> Result<(), SimError> {
    if condition {
        Ok(())
    } else {
        Err(SimError::Revert(reason.to_string()))
    }
}

// ──────────────────────────────────────────────
// Calls
// ──────────────────────────────────────────────

/// A contract call understood by [`SimChain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepositCall {
    CreateDeposit {
        from: String,
        lot_size: u64,
        value: u64,
    },
    RetrieveSignerPubkey {
        deposit: String,
    },
    NotifySignerSetupFailure {
        deposit: String,
    },
    ProvideFundingProof {
        deposit: String,
        txid: String,
        difficulty: u64,
    },
    RequestRedemption {
        deposit: String,
        from: String,
        output_value: u64,
        output_script: String,
    },
    ProvideRedemptionSignature {
        deposit: String,
    },
    ProvideRedemptionProof {
        deposit: String,
        txid: String,
    },
    NotifyCourtesyCall {
        deposit: String,
    },
    ExitCourtesyCall {
        deposit: String,
    },
    NotifyUndercollateralizedLiquidation {
        deposit: String,
    },
}

impl DepositCall {
    /// Account whose nonce the call consumes.
    pub fn sender(&self) -> &str {
        match self {
            DepositCall::CreateDeposit { from, .. }
            | DepositCall::RequestRedemption { from, .. } => from,
            _ => OPENER,
        }
    }
}

/// A submitted call awaiting confirmation.
#[derive(Debug, Clone)]
pub struct PendingTx {
    pub hash: String,
    pub from: String,
    pub nonce: u64,
    pub call: DepositCall,
}

// ──────────────────────────────────────────────
// State
// ──────────────────────────────────────────────

#[derive(Debug, Clone)]
struct DepositRecord {
    state: DepositState,
    lot_size: u64,
    keep: String,
    created_at: u64,
    initial_percent: u64,
    under_percent: u64,
    severe_percent: u64,
    redeemer: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct KeepRecord {
    bond: u64,
    pubkey: Option<(String, String)>,
}

#[derive(Debug, Clone, Default)]
struct ChainState {
    block: u64,
    timestamp: u64,
    tx_count: u64,
    nonces: BTreeMap<String, u64>,
    deposits: BTreeMap<String, DepositRecord>,
    keeps: BTreeMap<String, KeepRecord>,
    price: u64,
    difficulty: u64,
    previous_difficulty: u64,
    tbtc_balances: BTreeMap<String, u64>,
    tbtc_allowances: BTreeMap<(String, String), u64>,
    deposit_owners: BTreeMap<String, String>,
}

impl ChainState {
    fn genesis(config: &ChainConfig) -> Self {
        Self {
            price: config.initial_price,
            difficulty: config.initial_difficulty,
            previous_difficulty: config.initial_difficulty,
            ..Self::default()
        }
    }

    fn mine(&mut self, block_time: u64) {
        self.block += 1;
        self.timestamp += block_time;
    }

    fn deposit(&self, address: &str) -> Result<&DepositRecord, SimError> {
        self.deposits
            .get(address)
            .ok_or_else(|| SimError::UnknownDeposit(address.to_string()))
    }

    fn keep(&self, address: &str) -> Result<&KeepRecord, SimError> {
        self.keeps
            .get(address)
            .ok_or_else(|| SimError::UnknownKeep(address.to_string()))
    }

    fn set_state(&mut self, address: &str, state: DepositState) -> Result<(), SimError> {
        let record = self
            .deposits
            .get_mut(address)
            .ok_or_else(|| SimError::UnknownDeposit(address.to_string()))?;
        record.state = state;
        Ok(())
    }

    /// `bond * 100 / (lot_size * price)`, saturating when the price is zero.
    fn collateralization(&self, address: &str) -> Result<u64, SimError> {
        let deposit = self.deposit(address)?;
        let bond = u128::from(self.keep(&deposit.keep)?.bond);
        let value = u128::from(deposit.lot_size) * u128::from(self.price);
        if value == 0 {
            return Ok(u64::MAX);
        }
        Ok(u64::try_from(bond * 100 / value).unwrap_or(u64::MAX))
    }

    fn redemption_requirement(&self, address: &str) -> Result<u64, SimError> {
        self.deposit(address)?
            .lot_size
            .checked_mul(SATOSHI_MULTIPLIER)
            .ok_or(SimError::Overflow("redemption requirement"))
    }

    fn execute(
        &mut self,
        config: &ChainConfig,
        call: &DepositCall,
    ) -> Result<Vec<EventRecord>, SimError> {
        let now = self.timestamp;
        match call {
            DepositCall::CreateDeposit {
                from,
                lot_size,
                value,
            } => {
                ensure(
                    config.lot_sizes.contains(lot_size),
                    "provided lot size not supported",
                )?;
                ensure(
                    *value >= config.new_deposit_fee,
                    "Insufficient value for new keep",
                )?;
                let n = self.deposits.len() as u64 + 1;
                let deposit = format!("0xd{:039x}", n);
                let keep = format!("0xe{:039x}", n);
                self.keeps.insert(keep.clone(), KeepRecord::default());
                self.deposits.insert(
                    deposit.clone(),
                    DepositRecord {
                        state: DepositState::AwaitingSignerSetup,
                        lot_size: *lot_size,
                        keep: keep.clone(),
                        created_at: now,
                        initial_percent: config.initial_collateralized_percent,
                        under_percent: config.undercollateralized_percent,
                        severe_percent: config.severely_undercollateralized_percent,
                        redeemer: None,
                    },
                );
                self.deposit_owners.insert(deposit.clone(), from.clone());
                Ok(vec![
                    EventRecord::new("DepositCloneCreated")
                        .with("depositCloneAddress", deposit.clone()),
                    EventRecord::new("Created")
                        .with("_depositContractAddress", deposit)
                        .with("_keepAddress", keep)
                        .with("_timestamp", now),
                ])
            }

            DepositCall::RetrieveSignerPubkey { deposit } => {
                let record = self.deposit(deposit)?;
                ensure(
                    record.state == DepositState::AwaitingSignerSetup,
                    "Not currently awaiting signer setup",
                )?;
                let (x, y) = self
                    .keep(&record.keep)?
                    .pubkey
                    .clone()
                    .ok_or_else(|| {
                        SimError::Revert("public key not set or not 64-bytes long".to_string())
                    })?;
                self.set_state(deposit, DepositState::AwaitingBtcFundingProof)?;
                Ok(vec![EventRecord::new("RegisteredPubkey")
                    .with("_depositContractAddress", deposit.clone())
                    .with("_signingGroupPubkeyX", x)
                    .with("_signingGroupPubkeyY", y)
                    .with("_timestamp", now)])
            }

            DepositCall::NotifySignerSetupFailure { deposit } => {
                let record = self.deposit(deposit)?;
                ensure(
                    record.state == DepositState::AwaitingSignerSetup,
                    "Not awaiting setup",
                )?;
                ensure(
                    now > record.created_at + config.signing_group_formation_timeout_secs,
                    "Signing group formation timeout not yet elapsed",
                )?;
                self.set_state(deposit, DepositState::FailedSetup)?;
                Ok(vec![EventRecord::new("SetupFailed")
                    .with("_depositContractAddress", deposit.clone())
                    .with("_timestamp", now)])
            }

            DepositCall::ProvideFundingProof {
                deposit,
                txid,
                difficulty,
            } => {
                ensure(
                    self.deposit(deposit)?.state == DepositState::AwaitingBtcFundingProof,
                    "Not awaiting funding",
                )?;
                ensure(
                    *difficulty == self.difficulty || *difficulty == self.previous_difficulty,
                    "not at current or previous difficulty",
                )?;
                self.set_state(deposit, DepositState::Active)?;
                Ok(vec![EventRecord::new("Funded")
                    .with("_depositContractAddress", deposit.clone())
                    .with("_txid", txid.clone())
                    .with("_timestamp", now)])
            }

            DepositCall::RequestRedemption {
                deposit,
                from,
                output_value,
                output_script,
            } => {
                let record = self.deposit(deposit)?;
                ensure(
                    record.state.accepts_redemption(),
                    "Redemption only available from Active or Courtesy state",
                )?;
                ensure(!output_script.is_empty(), "cannot send value to zero pkh")?;
                ensure(
                    *output_value <= record.lot_size,
                    "Output value exceeds deposit value",
                )?;
                let lot_size = record.lot_size;
                let fee = lot_size - output_value;
                let requirement = self.redemption_requirement(deposit)?;
                let allowance_key = (from.clone(), deposit.clone());
                let allowance = self.tbtc_allowances.get(&allowance_key).copied().unwrap_or(0);
                let balance = self.tbtc_balances.get(from).copied().unwrap_or(0);
                ensure(allowance >= requirement, "ERC20: transfer amount exceeds allowance")?;
                ensure(balance >= requirement, "ERC20: transfer amount exceeds balance")?;

                self.tbtc_allowances.insert(allowance_key, allowance - requirement);
                self.tbtc_balances.insert(from.clone(), balance - requirement);
                if let Some(record) = self.deposits.get_mut(deposit) {
                    record.redeemer = Some(from.clone());
                    record.state = DepositState::AwaitingWithdrawalSignature;
                }
                Ok(vec![EventRecord::new("RedemptionRequested")
                    .with("_depositContractAddress", deposit.clone())
                    .with("_requester", from.clone())
                    .with("_utxoValue", lot_size)
                    .with("_redeemerOutputScript", output_script.clone())
                    .with("_requestedFee", fee)
                    .with("_timestamp", now)])
            }

            DepositCall::ProvideRedemptionSignature { deposit } => {
                let record = self.deposit(deposit)?;
                ensure(
                    record.state == DepositState::AwaitingWithdrawalSignature,
                    "Not currently awaiting a signature",
                )?;
                ensure(
                    self.keep(&record.keep)?.pubkey.is_some(),
                    "Invalid signature",
                )?;
                self.set_state(deposit, DepositState::AwaitingWithdrawalProof)?;
                Ok(vec![EventRecord::new("GotRedemptionSignature")
                    .with("_depositContractAddress", deposit.clone())
                    .with("_timestamp", now)])
            }

            DepositCall::ProvideRedemptionProof { deposit, txid } => {
                ensure(
                    self.deposit(deposit)?.state == DepositState::AwaitingWithdrawalProof,
                    "Redemption proof requires a redemption signature",
                )?;
                self.set_state(deposit, DepositState::Redeemed)?;
                Ok(vec![EventRecord::new("Redeemed")
                    .with("_depositContractAddress", deposit.clone())
                    .with("_txid", txid.clone())
                    .with("_timestamp", now)])
            }

            DepositCall::NotifyCourtesyCall { deposit } => {
                let record = self.deposit(deposit)?;
                ensure(
                    record.state == DepositState::Active,
                    "Can only courtesy call from active state",
                )?;
                ensure(
                    self.collateralization(deposit)? < record.under_percent,
                    "Signers have sufficient collateral",
                )?;
                self.set_state(deposit, DepositState::CourtesyCall)?;
                Ok(vec![EventRecord::new("CourtesyCalled")
                    .with("_depositContractAddress", deposit.clone())
                    .with("_timestamp", now)])
            }

            DepositCall::ExitCourtesyCall { deposit } => {
                let record = self.deposit(deposit)?;
                ensure(
                    record.state == DepositState::CourtesyCall,
                    "Not currently in courtesy call",
                )?;
                ensure(
                    self.collateralization(deposit)? >= record.under_percent,
                    "Deposit is still undercollateralized",
                )?;
                self.set_state(deposit, DepositState::Active)?;
                Ok(vec![EventRecord::new("ExitedCourtesyCall")
                    .with("_depositContractAddress", deposit.clone())
                    .with("_timestamp", now)])
            }

            DepositCall::NotifyUndercollateralizedLiquidation { deposit } => {
                let record = self.deposit(deposit)?;
                ensure(
                    matches!(record.state, DepositState::Active | DepositState::CourtesyCall),
                    "Deposit not in active or courtesy call",
                )?;
                ensure(
                    self.collateralization(deposit)? < record.severe_percent,
                    "Deposit has sufficient collateral",
                )?;
                self.set_state(deposit, DepositState::LiquidationInProgress)?;
                Ok(vec![EventRecord::new("StartedLiquidation")
                    .with("_depositContractAddress", deposit.clone())
                    .with("_wasFraud", false)
                    .with("_timestamp", now)])
            }
        }
    }
}

// ──────────────────────────────────────────────
// SimChain
// ──────────────────────────────────────────────

/// A simulated deposit chain. Cheap to fork.
#[derive(Debug)]
pub struct SimChain {
    config: ChainConfig,
    state: Mutex<ChainState>,
}

impl SimChain {
    pub fn new(config: ChainConfig) -> Self {
        let state = ChainState::genesis(&config);
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    // -- views --

    pub fn lot_sizes(&self) -> Vec<u64> {
        self.config.lot_sizes.clone()
    }

    pub fn new_deposit_fee_estimate(&self) -> u64 {
        self.config.new_deposit_fee
    }

    pub fn signer_setup_timeout(&self) -> u64 {
        self.config.signing_group_formation_timeout_secs
    }

    pub fn block_number(&self) -> u64 {
        self.state.lock().block
    }

    pub fn timestamp(&self) -> u64 {
        self.state.lock().timestamp
    }

    /// Wei per satoshi.
    pub fn bitcoin_price(&self) -> u64 {
        self.state.lock().price
    }

    pub fn current_state(&self, deposit: &str) -> Result<DepositState, SimError> {
        Ok(self.state.lock().deposit(deposit)?.state)
    }

    pub fn lot_size_satoshis(&self, deposit: &str) -> Result<u64, SimError> {
        Ok(self.state.lock().deposit(deposit)?.lot_size)
    }

    pub fn initial_collateralized_percent(&self, deposit: &str) -> Result<u64, SimError> {
        Ok(self.state.lock().deposit(deposit)?.initial_percent)
    }

    pub fn undercollateralized_threshold_percent(&self, deposit: &str) -> Result<u64, SimError> {
        Ok(self.state.lock().deposit(deposit)?.under_percent)
    }

    pub fn severely_undercollateralized_threshold_percent(
        &self,
        deposit: &str,
    ) -> Result<u64, SimError> {
        Ok(self.state.lock().deposit(deposit)?.severe_percent)
    }

    pub fn collateralization_percent(&self, deposit: &str) -> Result<u64, SimError> {
        self.state.lock().collateralization(deposit)
    }

    pub fn keep_of(&self, deposit: &str) -> Result<String, SimError> {
        Ok(self.state.lock().deposit(deposit)?.keep.clone())
    }

    pub fn bond_amount(&self, keep: &str) -> Result<u64, SimError> {
        Ok(self.state.lock().keep(keep)?.bond)
    }

    /// TBTC `redeemer` must hold and approve to redeem `deposit`.
    pub fn redemption_requirement(&self, deposit: &str, _redeemer: &str) -> Result<u64, SimError> {
        self.state.lock().redemption_requirement(deposit)
    }

    pub fn redeemer_of(&self, deposit: &str) -> Result<Option<String>, SimError> {
        Ok(self.state.lock().deposit(deposit)?.redeemer.clone())
    }

    pub fn owner_of(&self, deposit: &str) -> Result<String, SimError> {
        let state = self.state.lock();
        state.deposit(deposit)?;
        state
            .deposit_owners
            .get(deposit)
            .cloned()
            .ok_or_else(|| {
                SimError::Revert("ERC721: owner query for nonexistent token".to_string())
            })
    }

    pub fn tbtc_balance(&self, account: &str) -> u64 {
        self.state.lock().tbtc_balances.get(account).copied().unwrap_or(0)
    }

    pub fn nonce_of(&self, account: &str) -> u64 {
        self.state.lock().nonces.get(account).copied().unwrap_or(0)
    }

    // -- admin --

    pub fn set_signer_pubkey(&self, keep: &str, x: &str, y: &str) -> Result<(), SimError> {
        let mut state = self.state.lock();
        let record = state
            .keeps
            .get_mut(keep)
            .ok_or_else(|| SimError::UnknownKeep(keep.to_string()))?;
        record.pubkey = Some((x.to_string(), y.to_string()));
        Ok(())
    }

    /// Set the bond held by `keep` to `amount`.
    pub fn fund_bond(&self, keep: &str, amount: u64) -> Result<(), SimError> {
        let mut state = self.state.lock();
        let record = state
            .keeps
            .get_mut(keep)
            .ok_or_else(|| SimError::UnknownKeep(keep.to_string()))?;
        record.bond = amount;
        Ok(())
    }

    pub fn set_price(&self, wei_per_satoshi: u64) {
        self.state.lock().price = wei_per_satoshi;
    }

    pub fn set_difficulty(&self, difficulty: u64) {
        let mut state = self.state.lock();
        state.previous_difficulty = state.difficulty;
        state.difficulty = difficulty;
    }

    pub fn force_mint(&self, account: &str, amount: u64) -> Result<(), SimError> {
        let mut state = self.state.lock();
        let balance = state.tbtc_balances.entry(account.to_string()).or_default();
        *balance = balance
            .checked_add(amount)
            .ok_or(SimError::Overflow("TBTC balance"))?;
        Ok(())
    }

    pub fn approve(&self, owner: &str, spender: &str, amount: u64) {
        self.state
            .lock()
            .tbtc_allowances
            .insert((owner.to_string(), spender.to_string()), amount);
    }

    pub fn advance_time(&self, secs: u64) {
        self.state.lock().timestamp += secs;
    }
}

#[async_trait]
impl Ledger for SimChain {
    type Operation = DepositCall;
    type Pending = PendingTx;

    async fn submit(&self, call: DepositCall) -> Result<PendingTx, EffectError> {
        let mut state = self.state.lock();
        let from = call.sender().to_string();
        if from.is_empty() {
            return Err(EffectError::Rejected("call has no sender".to_string()));
        }
        let nonce = state.nonces.entry(from.clone()).or_default();
        let assigned = *nonce;
        *nonce += 1;
        state.tx_count += 1;
        let hash = format!("0x{:064x}", state.tx_count);
        tracing::debug!(%hash, %from, nonce = assigned, ?call, "accepted");
        Ok(PendingTx {
            hash,
            from,
            nonce: assigned,
            call,
        })
    }

    async fn confirm(&self, tx: PendingTx) -> Result<Receipt, EffectError> {
        if self.config.confirmation_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.confirmation_delay_ms)).await;
        }
        let mut state = self.state.lock();
        state.mine(self.config.block_time_secs);
        match state.execute(&self.config, &tx.call) {
            Ok(events) => Ok(Receipt {
                tx_hash: tx.hash,
                block: state.block,
                events,
            }),
            Err(e) => {
                tracing::debug!(hash = %tx.hash, reason = %e, "reverted");
                Err(e.into())
            }
        }
    }

    async fn fork(&self) -> Result<Option<Self>, EffectError> {
        let state = self.state.lock().clone();
        Ok(Some(Self {
            config: self.config.clone(),
            state: Mutex::new(state),
        }))
    }
}

//! The deposit lifecycle as a state graph.
//!
//! ```text
//! start
//!   └─ awaitingSignerSetup
//!        ├─ awaitingFundingProof
//!        │    └─ active
//!        │         ├─ awaitingWithdrawalSignature
//!        │         │    └─ awaitingWithdrawalProof
//!        │         │         └─ redeemed
//!        │         ├─ courtesyCall
//!        │         │    └─ active (revisit)
//!        │         └─ liquidationInProgress
//!        └─ signerSetupFailure
//! ```
//!
//! Every node also lists calls the deposit must refuse in that state.

use std::sync::Arc;

use serde_json::{json, Value};
use statewalk_engine::{
    Assertion, Context, ExpectationInput, StateGraph, StateNode, Submission, TransitionSpec,
};

use crate::chain::{DepositCall, SimChain};
use crate::roundtrip::{
    FUNDING_DIFFICULTY, FUNDING_TXID, OPENER, REDEMPTION_FEE_SATOSHIS, REDEMPTION_OUTPUT_SCRIPT,
    REDEMPTION_TXID, SIGNER_PUBKEY_X, SIGNER_PUBKEY_Y,
};
use crate::states::DepositState;
use crate::system::{self, Collateral, BOND_AMOUNT, DEPOSIT, DIFFICULTY, FEE_ESTIMATE, LOT_SIZE};

/// State every lifecycle run starts from.
pub const ROOT: &str = "start";

type Spec = TransitionSpec<SimChain>;
type Call = anyhow::Result<Submission<DepositCall>>;
type Checks = anyhow::Result<Vec<Assertion>>;

// ──────────────────────────────────────────────
// Dependencies
// ──────────────────────────────────────────────

async fn lot_size(chain: Arc<SimChain>, _ctx: Context) -> anyhow::Result<Value> {
    let lot = chain
        .lot_sizes()
        .first()
        .copied()
        .ok_or_else(|| anyhow::anyhow!("factory accepts no lot sizes"))?;
    Ok(json!(lot))
}

async fn fee_estimate(chain: Arc<SimChain>, _ctx: Context) -> anyhow::Result<Value> {
    Ok(json!(chain.new_deposit_fee_estimate()))
}

async fn bond_amount(chain: Arc<SimChain>, ctx: Context) -> anyhow::Result<Value> {
    let deposit = system::deposit_of(&ctx)?;
    Ok(json!(system::required_bond(&chain, &deposit)?))
}

async fn funding_difficulty(_chain: Arc<SimChain>, _ctx: Context) -> anyhow::Result<Value> {
    Ok(json!(FUNDING_DIFFICULTY))
}

// ──────────────────────────────────────────────
// Preconditions
// ──────────────────────────────────────────────

async fn publish_signer_key(chain: Arc<SimChain>, ctx: Context) -> anyhow::Result<()> {
    system::set_signer_key(&chain, &ctx)
}

async fn time_out_signer_setup(chain: Arc<SimChain>, ctx: Context) -> anyhow::Result<()> {
    system::elapse_signer_setup_timeout(&chain);
    system::collateralize(&chain, &ctx, Collateral::Well)
}

async fn relay_funding_difficulty(chain: Arc<SimChain>, ctx: Context) -> anyhow::Result<()> {
    chain.set_difficulty(ctx.get_as(DIFFICULTY)?);
    Ok(())
}

async fn fund_redemption(chain: Arc<SimChain>, ctx: Context) -> anyhow::Result<()> {
    system::fund_redemption(&chain, &ctx).map(|_| ())
}

async fn well_collateralized(chain: Arc<SimChain>, ctx: Context) -> anyhow::Result<()> {
    system::collateralize(&chain, &ctx, Collateral::Well)
}

async fn undercollateralized(chain: Arc<SimChain>, ctx: Context) -> anyhow::Result<()> {
    system::collateralize(&chain, &ctx, Collateral::Under)
}

async fn severely_undercollateralized(chain: Arc<SimChain>, ctx: Context) -> anyhow::Result<()> {
    system::collateralize(&chain, &ctx, Collateral::Severe)
}

// ──────────────────────────────────────────────
// Calls
// ──────────────────────────────────────────────

async fn create_deposit(_chain: Arc<SimChain>, ctx: Context) -> Call {
    let call = DepositCall::CreateDeposit {
        from: OPENER.to_string(),
        lot_size: ctx.get_as(LOT_SIZE)?,
        value: ctx.get_as(FEE_ESTIMATE)?,
    };
    Ok(Submission::new(call).resolve_subject(DEPOSIT, |receipt| {
        receipt
            .field("DepositCloneCreated", "depositCloneAddress")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("receipt carries no DepositCloneCreated event"))
    }))
}

async fn create_deposit_without_fee(_chain: Arc<SimChain>, ctx: Context) -> Call {
    Ok(Submission::new(DepositCall::CreateDeposit {
        from: OPENER.to_string(),
        lot_size: ctx.get_as(LOT_SIZE)?,
        value: 0,
    }))
}

async fn retrieve_signer_pubkey(_chain: Arc<SimChain>, ctx: Context) -> Call {
    let deposit = system::deposit_of(&ctx)?;
    Ok(Submission::new(DepositCall::RetrieveSignerPubkey { deposit }))
}

async fn notify_signer_setup_failure(_chain: Arc<SimChain>, ctx: Context) -> Call {
    let deposit = system::deposit_of(&ctx)?;
    Ok(Submission::new(DepositCall::NotifySignerSetupFailure { deposit }))
}

async fn provide_funding_proof(_chain: Arc<SimChain>, ctx: Context) -> Call {
    Ok(Submission::new(DepositCall::ProvideFundingProof {
        deposit: system::deposit_of(&ctx)?,
        txid: FUNDING_TXID.to_string(),
        difficulty: FUNDING_DIFFICULTY,
    }))
}

async fn request_redemption(chain: Arc<SimChain>, ctx: Context) -> Call {
    let deposit = system::deposit_of(&ctx)?;
    let lot = chain.lot_size_satoshis(&deposit)?;
    Ok(Submission::new(DepositCall::RequestRedemption {
        deposit,
        from: OPENER.to_string(),
        output_value: lot.saturating_sub(REDEMPTION_FEE_SATOSHIS),
        output_script: REDEMPTION_OUTPUT_SCRIPT.to_string(),
    }))
}

async fn provide_redemption_signature(_chain: Arc<SimChain>, ctx: Context) -> Call {
    let deposit = system::deposit_of(&ctx)?;
    Ok(Submission::new(DepositCall::ProvideRedemptionSignature { deposit }))
}

async fn provide_redemption_proof(_chain: Arc<SimChain>, ctx: Context) -> Call {
    Ok(Submission::new(DepositCall::ProvideRedemptionProof {
        deposit: system::deposit_of(&ctx)?,
        txid: REDEMPTION_TXID.to_string(),
    }))
}

async fn notify_courtesy_call(_chain: Arc<SimChain>, ctx: Context) -> Call {
    let deposit = system::deposit_of(&ctx)?;
    Ok(Submission::new(DepositCall::NotifyCourtesyCall { deposit }))
}

async fn exit_courtesy_call(_chain: Arc<SimChain>, ctx: Context) -> Call {
    let deposit = system::deposit_of(&ctx)?;
    Ok(Submission::new(DepositCall::ExitCourtesyCall { deposit }))
}

async fn notify_liquidation(_chain: Arc<SimChain>, ctx: Context) -> Call {
    let deposit = system::deposit_of(&ctx)?;
    Ok(Submission::new(DepositCall::NotifyUndercollateralizedLiquidation { deposit }))
}

// ──────────────────────────────────────────────
// Expectations
// ──────────────────────────────────────────────

fn in_state(chain: &SimChain, ctx: &Context, expected: DepositState) -> anyhow::Result<Assertion> {
    let actual = chain.current_state(&system::deposit_of(ctx)?)?;
    Ok(Assertion::equals(
        "currentState",
        expected.to_string(),
        actual.to_string(),
    ))
}

async fn deposit_created(chain: Arc<SimChain>, input: ExpectationInput) -> Checks {
    let deposit = system::deposit_of(&input.next)?;
    let keep = chain.keep_of(&deposit)?;
    Ok(vec![
        Assertion::emitted_with("DepositCloneCreated", [("depositCloneAddress", deposit.clone())]),
        Assertion::emitted_with(
            "Created",
            [("_depositContractAddress", deposit.clone()), ("_keepAddress", keep)],
        ),
        in_state(&chain, &input.next, DepositState::AwaitingSignerSetup)?,
        Assertion::equals("ownerOf", OPENER, chain.owner_of(&deposit)?),
        Assertion::equals(
            "lotSizeSatoshis",
            input.previous.require(LOT_SIZE)?.clone(),
            chain.lot_size_satoshis(&deposit)?,
        ),
    ])
}

async fn pubkey_registered(chain: Arc<SimChain>, input: ExpectationInput) -> Checks {
    Ok(vec![
        Assertion::emitted_with(
            "RegisteredPubkey",
            [
                ("_signingGroupPubkeyX", SIGNER_PUBKEY_X),
                ("_signingGroupPubkeyY", SIGNER_PUBKEY_Y),
            ],
        ),
        in_state(&chain, &input.next, DepositState::AwaitingBtcFundingProof)?,
    ])
}

async fn setup_failed(chain: Arc<SimChain>, input: ExpectationInput) -> Checks {
    Ok(vec![
        Assertion::emitted("SetupFailed"),
        in_state(&chain, &input.next, DepositState::FailedSetup)?,
    ])
}

async fn funded(chain: Arc<SimChain>, input: ExpectationInput) -> Checks {
    Ok(vec![
        Assertion::emitted_with("Funded", [("_txid", FUNDING_TXID)]),
        in_state(&chain, &input.next, DepositState::Active)?,
    ])
}

async fn redemption_requested(chain: Arc<SimChain>, input: ExpectationInput) -> Checks {
    let deposit = system::deposit_of(&input.next)?;
    Ok(vec![
        Assertion::emitted_with(
            "RedemptionRequested",
            [
                ("_requester", json!(OPENER)),
                ("_requestedFee", json!(REDEMPTION_FEE_SATOSHIS)),
                ("_redeemerOutputScript", json!(REDEMPTION_OUTPUT_SCRIPT)),
            ],
        ),
        in_state(&chain, &input.next, DepositState::AwaitingWithdrawalSignature)?,
        Assertion::equals("redeemer", OPENER, chain.redeemer_of(&deposit)?),
        Assertion::equals("redeemer TBTC balance", 0, chain.tbtc_balance(OPENER)),
    ])
}

async fn got_redemption_signature(chain: Arc<SimChain>, input: ExpectationInput) -> Checks {
    Ok(vec![
        Assertion::emitted("GotRedemptionSignature"),
        in_state(&chain, &input.next, DepositState::AwaitingWithdrawalProof)?,
    ])
}

async fn redeemed(chain: Arc<SimChain>, input: ExpectationInput) -> Checks {
    Ok(vec![
        Assertion::emitted_with("Redeemed", [("_txid", REDEMPTION_TXID)]),
        in_state(&chain, &input.next, DepositState::Redeemed)?,
    ])
}

async fn courtesy_called(chain: Arc<SimChain>, input: ExpectationInput) -> Checks {
    Ok(vec![
        Assertion::emitted("CourtesyCalled"),
        in_state(&chain, &input.next, DepositState::CourtesyCall)?,
    ])
}

async fn exited_courtesy_call(chain: Arc<SimChain>, input: ExpectationInput) -> Checks {
    Ok(vec![
        Assertion::emitted("ExitedCourtesyCall"),
        in_state(&chain, &input.next, DepositState::Active)?,
    ])
}

async fn liquidation_started(chain: Arc<SimChain>, input: ExpectationInput) -> Checks {
    Ok(vec![
        Assertion::emitted_with("StartedLiquidation", [("_wasFraud", false)]),
        in_state(&chain, &input.next, DepositState::LiquidationInProgress)?,
    ])
}

// ──────────────────────────────────────────────
// Graph
// ──────────────────────────────────────────────

/// The full deposit lifecycle graph, rooted at [`ROOT`].
pub fn deposit_graph() -> StateGraph<SimChain> {
    StateGraph::new()
        .with(
            StateNode::new(ROOT)
                .depends_on(LOT_SIZE, lot_size)
                .depends_on(FEE_ESTIMATE, fee_estimate)
                .to(
                    "awaitingSignerSetup",
                    Spec::new(create_deposit).expect(deposit_created),
                )
                .reject("createDeposit without fee", Spec::new(create_deposit_without_fee)),
        )
        .with(
            StateNode::new("awaitingSignerSetup")
                .depends_on(BOND_AMOUNT, bond_amount)
                .to(
                    "awaitingFundingProof",
                    Spec::new(retrieve_signer_pubkey)
                        .precondition(publish_signer_key)
                        .expect(pubkey_registered),
                )
                .to(
                    "signerSetupFailure",
                    Spec::new(notify_signer_setup_failure)
                        .precondition(time_out_signer_setup)
                        .expect(setup_failed),
                )
                .reject(
                    "signerSetupFailure too early",
                    Spec::new(notify_signer_setup_failure),
                )
                .reject("fundingProof before pubkey", Spec::new(provide_funding_proof)),
        )
        .with(
            StateNode::new("awaitingFundingProof")
                .depends_on(BOND_AMOUNT, bond_amount)
                .depends_on(DIFFICULTY, funding_difficulty)
                .to(
                    "active",
                    Spec::new(provide_funding_proof)
                        .precondition(relay_funding_difficulty)
                        .expect(funded),
                )
                .reject(
                    "requestRedemption before funding",
                    Spec::new(request_redemption).precondition(fund_redemption),
                ),
        )
        .with(
            StateNode::new("active")
                .depends_on(BOND_AMOUNT, bond_amount)
                .to(
                    "awaitingWithdrawalSignature",
                    Spec::new(request_redemption)
                        .precondition(fund_redemption)
                        .expect(redemption_requested),
                )
                .to(
                    "courtesyCall",
                    Spec::new(notify_courtesy_call)
                        .precondition(undercollateralized)
                        .expect(courtesy_called),
                )
                .to(
                    "liquidationInProgress",
                    Spec::new(notify_liquidation)
                        .precondition(severely_undercollateralized)
                        .expect(liquidation_started),
                )
                .reject("exitCourtesyCall while active", Spec::new(exit_courtesy_call))
                .reject(
                    "courtesyCall while well collateralized",
                    Spec::new(notify_courtesy_call).precondition(well_collateralized),
                )
                .reject(
                    "liquidation while undercollateralized",
                    Spec::new(notify_liquidation).precondition(undercollateralized),
                ),
        )
        .with(
            StateNode::new("awaitingWithdrawalSignature")
                .to(
                    "awaitingWithdrawalProof",
                    Spec::new(provide_redemption_signature).expect(got_redemption_signature),
                )
                .reject(
                    "redemptionProof before signature",
                    Spec::new(provide_redemption_proof),
                ),
        )
        .with(
            StateNode::new("awaitingWithdrawalProof")
                .to("redeemed", Spec::new(provide_redemption_proof).expect(redeemed))
                .reject(
                    "redemptionSignature twice",
                    Spec::new(provide_redemption_signature),
                ),
        )
        .with(
            StateNode::new("courtesyCall")
                .depends_on(BOND_AMOUNT, bond_amount)
                .to(
                    "active",
                    Spec::new(exit_courtesy_call)
                        .precondition(well_collateralized)
                        .expect(exited_courtesy_call),
                )
                .reject(
                    "exitCourtesyCall while undercollateralized",
                    Spec::new(exit_courtesy_call),
                )
                .reject("courtesyCall again", Spec::new(notify_courtesy_call)),
        )
        .with(StateNode::new("redeemed").reject(
            "requestRedemption after redeemed",
            Spec::new(request_redemption).precondition(fund_redemption),
        ))
        .with(StateNode::new("liquidationInProgress").reject(
            "exitCourtesyCall during liquidation",
            Spec::new(exit_courtesy_call),
        ))
        .with(StateNode::new("signerSetupFailure").reject(
            "retrieveSignerPubkey after failure",
            Spec::new(retrieve_signer_pubkey).precondition(publish_signer_key),
        ))
}

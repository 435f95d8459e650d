//! Call handlers for the clearing engine.
//!
//! These functions implement the business logic for each call type. Handlers
//! compute on ciphertexts first and write state last, so a failing
//! coprocessor, ledger or oracle call leaves the engine untouched. Ranking is
//! the one exception: steps already completed in a batch stay committed along
//! with the cursor.

use clearing_fhe::{FheError, FheOps};
use clearing_types::{
    Address, DecryptionTarget, EncryptedInput, EncryptedU64, Handle, InputProof, Phase, RequestId,
};
use decryption_gateway::DecryptionOracle;
use tracing::{debug, info};

use crate::call::{CallOutcome, ClearingCall};
use crate::callback::handle_decryption_result;
use crate::error::ClearingError;
use crate::settlement::{settle_bid, sum, BidSettlement};
use crate::state::{Bid, ClearingState};
use crate::strategy::strategy_for;
use crate::token::{ConfidentialLedger, Transfer};

/// Context provided by the runtime for each call.
#[derive(Clone, Copy, Debug)]
pub struct CallContext {
    /// Sender of the transaction
    pub sender: Address,
    /// Current timestamp
    pub timestamp: u64,
}

/// Result type for handlers.
pub type HandlerResult<T> = Result<T, ClearingError>;

/// Collaborators a handler may call out to.
pub struct Env<'a> {
    pub fhe: &'a mut dyn FheOps,
    pub ledger: &'a mut dyn ConfidentialLedger,
    pub oracle: &'a mut dyn DecryptionOracle,
}

fn ensure_owner(state: &ClearingState, ctx: &CallContext) -> HandlerResult<()> {
    if ctx.sender != state.config.owner {
        return Err(ClearingError::OwnableUnauthorizedAccount(hex::encode(
            ctx.sender,
        )));
    }
    Ok(())
}

fn ensure_batch(batch_size: u32) -> HandlerResult<u64> {
    if batch_size == 0 {
        return Err(ClearingError::InvalidBatchSize);
    }
    Ok(u64::from(batch_size))
}

/// Release `value` to the oracle and register the request.
fn request_decryption(
    state: &ClearingState,
    env: &mut Env<'_>,
    value: Handle,
) -> HandlerResult<RequestId> {
    env.fhe.allow_for_decryption(value)?;
    Ok(env
        .oracle
        .request_decryption(&state.config.engine_address, value)?)
}

/// Route a call to its handler.
pub fn dispatch(
    state: &mut ClearingState,
    env: &mut Env<'_>,
    ctx: &CallContext,
    call: ClearingCall,
) -> HandlerResult<CallOutcome> {
    match call {
        ClearingCall::SubmitBid {
            price,
            quantity,
            proof,
        } => {
            let index = handle_submit_bid(state, env, ctx, price, quantity, &proof)?;
            Ok(CallOutcome::BidAccepted { index })
        }
        ClearingCall::CloseBidding => {
            let request_id = handle_close_bidding(state, env, ctx)?;
            Ok(CallOutcome::DemandRequested { request_id })
        }
        ClearingCall::AdvanceRanking { batch_size } => {
            handle_advance_ranking(state, env, ctx, batch_size)
        }
        ClearingCall::Allocate { batch_size } => {
            let finalized = handle_allocate(state, env, ctx, batch_size)?;
            Ok(CallOutcome::Allocated {
                cursor: state.allocation_cursor,
                finalized,
            })
        }
        ClearingCall::Claim => {
            let bids = handle_claim(state, env, ctx)?;
            Ok(CallOutcome::Claimed { bids })
        }
        ClearingCall::Withdraw => {
            let bids = handle_withdraw(state, env, ctx)?;
            Ok(CallOutcome::Withdrawn { bids })
        }
        ClearingCall::OwnerWithdraw => {
            handle_owner_withdraw(state, env, ctx)?;
            Ok(CallOutcome::OwnerWithdrawn)
        }
        ClearingCall::OnDecryptionResult { request_id, value } => {
            let applied =
                handle_decryption_result(state, &mut *env.fhe, &ctx.sender, request_id, value)?;
            Ok(CallOutcome::DecryptionApplied { applied })
        }
    }
}

/// Handle SubmitBid call.
///
/// A bid under the minimum price or quantity is accepted and escrowed like
/// any other; it is marked invalid under encryption and later forfeits its
/// escrow. So is a bid whose `price × quantity + penalty_fee` overflows 64
/// bits, which escrows the penalty fee alone.
///
/// # Returns
/// The index of the new bid
pub fn handle_submit_bid(
    state: &mut ClearingState,
    env: &mut Env<'_>,
    ctx: &CallContext,
    price: EncryptedInput,
    quantity: EncryptedInput,
    proof: &InputProof,
) -> HandlerResult<u32> {
    state.refresh_phase(ctx.timestamp);

    // Check bidding period
    if ctx.timestamp < state.config.start_time {
        return Err(ClearingError::BiddingNotStarted);
    }
    if state.phase != Phase::Bidding {
        return Err(ClearingError::TooLate);
    }

    // Check per-address cap
    let placed = state.bids_of(&ctx.sender).len();
    if placed >= state.config.max_bids_per_address as usize {
        return Err(ClearingError::MaxBidsExceeded);
    }

    let fhe = &mut *env.fhe;
    let engine = state.config.engine_address;
    let c = state.constants;

    let verified = fhe.verify_inputs(&[price, quantity], proof, &engine, &ctx.sender)?;
    let (e_price, e_quantity) = match verified.as_slice() {
        [p, q] => (*p, *q),
        _ => return Err(FheError::InvalidInputProof.into()),
    };

    // A bid whose escrow does not fit in 64 bits escrows only the penalty fee
    let (notional, notional_overflow) = fhe.overflowing_mul(e_price, e_quantity)?;
    let (gross, gross_overflow) = fhe.overflowing_add(notional, c.penalty_fee)?;
    let overflow = fhe.or(notional_overflow, gross_overflow)?;
    let e_escrow = fhe.select(overflow, c.penalty_fee, gross)?;

    // Validity, computed without branching
    let low_price = fhe.lt(e_price, c.min_price)?;
    let low_quantity = fhe.lt(e_quantity, c.min_quantity)?;
    let below_minimum = fhe.or(low_price, low_quantity)?;
    let invalid = fhe.or(below_minimum, overflow)?;
    let e_valid = fhe.not(invalid)?;
    let e_effective_price = fhe.select(e_valid, e_price, c.zero)?;
    let e_effective_quantity = fhe.select(e_valid, e_quantity, c.zero)?;

    let e_total_valid_demand = fhe.saturating_add(state.e_total_valid_demand, e_effective_quantity)?;
    fhe.allow(e_escrow.handle(), &ctx.sender)?;

    // Escrow before anything is recorded
    env.ledger.transfer_from(
        &state.config.payment_token,
        &engine,
        &ctx.sender,
        &engine,
        e_escrow,
    )?;

    let index = state.bids.len() as u32;
    state.bids.push(Bid {
        bidder: ctx.sender,
        e_price,
        e_quantity,
        e_valid,
        e_effective_price,
        e_effective_quantity,
        e_escrow,
        submitted_at: ctx.timestamp,
        e_index: None,
        e_cumulative_demand_before: None,
        e_allocated_quantity: None,
        e_deposit: None,
        e_refund: None,
        claimed: false,
        withdrawn: false,
    });
    state.bidders.entry(ctx.sender).or_default().push(index);
    state.e_total_valid_demand = e_total_valid_demand;

    info!(
        bidder = hex::encode(ctx.sender),
        index,
        timestamp = ctx.timestamp,
        "Bid accepted"
    );

    Ok(index)
}

/// Handle CloseBidding call.
///
/// Compares total valid demand to supply and sends the comparison to the
/// oracle. Ranking waits for the result.
pub fn handle_close_bidding(
    state: &mut ClearingState,
    env: &mut Env<'_>,
    ctx: &CallContext,
) -> HandlerResult<RequestId> {
    ensure_owner(state, ctx)?;
    state.refresh_phase(ctx.timestamp);

    match state.phase {
        Phase::Bidding => return Err(ClearingError::TooEarly),
        Phase::Closed => {}
        _ => return Err(ClearingError::DemandAlreadyRequested),
    }

    let exceeds = env
        .fhe
        .gt(state.e_total_valid_demand, state.constants.total_supply)?;
    let request_id = request_decryption(state, env, exceeds.handle())?;

    state.e_demand_exceeds_supply = Some(exceeds);
    state
        .pending_decryptions
        .insert(request_id, DecryptionTarget::DemandExceedsSupply);
    state.phase = Phase::AwaitingDemandDecryption;

    info!(
        request_id = hex::encode(request_id),
        bids = state.bids.len(),
        "Demand decryption requested"
    );

    Ok(request_id)
}

/// Handle AdvanceRanking call.
///
/// Runs up to `batch_size` steps of the selected strategy. The batch that
/// runs the last step also computes the encrypted settlement price and sends
/// it to the oracle.
pub fn handle_advance_ranking(
    state: &mut ClearingState,
    env: &mut Env<'_>,
    ctx: &CallContext,
    batch_size: u32,
) -> HandlerResult<CallOutcome> {
    ensure_owner(state, ctx)?;
    let batch = ensure_batch(batch_size)?;

    if state.phase < Phase::Ranking {
        return Err(ClearingError::DemandNotDecided);
    }
    if state.phase > Phase::Ranking {
        return Err(ClearingError::RankingCompleted);
    }

    let path = state.clearing_path.ok_or(ClearingError::DemandNotDecided)?;
    let strategy = strategy_for(path);
    let total = state.total_ranking_steps;
    let stop = total.min(state.ranking_cursor.saturating_add(batch));

    while state.ranking_cursor < stop {
        let step = state.ranking_cursor;
        strategy.step(state, &mut *env.fhe, step)?;
        state.ranking_cursor = step + 1;
    }

    debug!(
        path = ?path,
        cursor = state.ranking_cursor,
        total,
        "Ranking batch applied"
    );

    let mut settlement_request = None;
    if state.ranking_cursor == total {
        let price = strategy.finish(state, &mut *env.fhe)?;
        let request_id = request_decryption(state, env, price.handle())?;

        state.e_settlement_price = Some(price);
        state
            .pending_decryptions
            .insert(request_id, DecryptionTarget::SettlementPrice);
        state.phase = Phase::AwaitingSettlementDecryption;
        settlement_request = Some(request_id);

        info!(
            request_id = hex::encode(request_id),
            path = ?path,
            "Ranking complete, settlement price decryption requested"
        );
    }

    Ok(CallOutcome::RankingAdvanced {
        cursor: state.ranking_cursor,
        total_steps: total,
        settlement_request,
    })
}

/// Handle Allocate call.
///
/// Settles up to `batch_size` bids from the allocation cursor. The whole
/// batch is computed before any of it is written.
///
/// # Returns
/// Whether the auction is now finalized
pub fn handle_allocate(
    state: &mut ClearingState,
    env: &mut Env<'_>,
    ctx: &CallContext,
    batch_size: u32,
) -> HandlerResult<bool> {
    ensure_owner(state, ctx)?;

    if state.phase < Phase::Allocating {
        return Err(ClearingError::SettlementPriceNotDecrypted);
    }
    if state.phase == Phase::Finalized {
        return Err(ClearingError::AllocationCompleted);
    }
    let batch = ensure_batch(batch_size)?;

    let path = state.clearing_path.ok_or(ClearingError::DemandNotDecided)?;
    let price = state
        .settlement_price
        .ok_or(ClearingError::SettlementPriceNotDecrypted)?;
    let c = state.constants;
    let fhe = &mut *env.fhe;

    let start = state.allocation_cursor;
    let end = state.bid_count().min(start.saturating_add(batch));

    let mut proceeds = state.e_proceeds;
    let mut penalties = state.e_penalties;
    let mut allocated_total = state.e_allocated_total;
    let mut settled: Vec<BidSettlement> = Vec::with_capacity((end - start) as usize);

    for index in start..end {
        let bid = &state.bids[index as usize];
        let outcome = settle_bid(fhe, bid, index as u32, path, price, &c)?;
        proceeds = fhe.add(proceeds, outcome.cost)?;
        penalties = fhe.add(penalties, outcome.penalty)?;
        allocated_total = fhe.add(allocated_total, outcome.allocated)?;
        fhe.allow(outcome.allocated.handle(), &bid.bidder)?;
        fhe.allow(outcome.cost.handle(), &bid.bidder)?;
        fhe.allow(outcome.refund.handle(), &bid.bidder)?;
        settled.push(outcome);
    }

    for (index, outcome) in (start..end).zip(settled) {
        let bid = &mut state.bids[index as usize];
        bid.e_allocated_quantity = Some(outcome.allocated);
        bid.e_deposit = Some(outcome.cost);
        bid.e_refund = Some(outcome.refund);
    }
    state.e_proceeds = proceeds;
    state.e_penalties = penalties;
    state.e_allocated_total = allocated_total;
    state.allocation_cursor = end;

    debug!(from = start, to = end, "Allocation batch applied");

    let finalized = state.allocation_cursor == state.bid_count();
    if finalized {
        state.phase = Phase::Finalized;
        info!(bids = state.bids.len(), price, "Auction finalized");
    }

    Ok(finalized)
}

/// Handle Claim call.
///
/// Transfers the asset allocated across all of the sender's bids.
///
/// # Returns
/// The number of bids claimed
pub fn handle_claim(
    state: &mut ClearingState,
    env: &mut Env<'_>,
    ctx: &CallContext,
) -> HandlerResult<u32> {
    if state.settlement_price.is_none() {
        return Err(ClearingError::SettlementPriceNotDecrypted);
    }

    let indices = state.bids_of(&ctx.sender).to_vec();
    if indices.is_empty() {
        return Err(ClearingError::NoBids);
    }
    if indices.iter().any(|&i| state.bids[i as usize].claimed) {
        return Err(ClearingError::AlreadyClaimed);
    }
    if !state.is_allocated(&ctx.sender) {
        return Err(ClearingError::AllocationPending);
    }

    let allocations = indices
        .iter()
        .map(|&i| {
            state.bids[i as usize]
                .e_allocated_quantity
                .ok_or(ClearingError::AllocationPending)
        })
        .collect::<HandlerResult<Vec<EncryptedU64>>>()?;
    let total = sum(&mut *env.fhe, state.constants.zero, allocations)?;
    env.fhe.allow(total.handle(), &ctx.sender)?;

    env.ledger.transfer(
        &state.config.asset_token,
        &state.config.engine_address,
        &ctx.sender,
        total,
    )?;

    for &i in &indices {
        state.bids[i as usize].claimed = true;
    }

    info!(
        bidder = hex::encode(ctx.sender),
        bids = indices.len(),
        "Allocation claimed"
    );

    Ok(indices.len() as u32)
}

/// Handle Withdraw call.
///
/// Returns the refund of all of the sender's bids. Cost was netted at
/// allocation; the claim must come first.
///
/// # Returns
/// The number of bids withdrawn
pub fn handle_withdraw(
    state: &mut ClearingState,
    env: &mut Env<'_>,
    ctx: &CallContext,
) -> HandlerResult<u32> {
    let indices = state.bids_of(&ctx.sender).to_vec();
    if indices.is_empty() {
        return Err(ClearingError::NoBids);
    }
    if indices.iter().any(|&i| !state.bids[i as usize].claimed) {
        return Err(ClearingError::NotClaimed);
    }
    if indices.iter().any(|&i| state.bids[i as usize].withdrawn) {
        return Err(ClearingError::AlreadyWithdrawn);
    }

    let refunds = indices
        .iter()
        .map(|&i| {
            state.bids[i as usize]
                .e_refund
                .ok_or(ClearingError::AllocationPending)
        })
        .collect::<HandlerResult<Vec<EncryptedU64>>>()?;
    let total = sum(&mut *env.fhe, state.constants.zero, refunds)?;
    env.fhe.allow(total.handle(), &ctx.sender)?;

    env.ledger.transfer(
        &state.config.payment_token,
        &state.config.engine_address,
        &ctx.sender,
        total,
    )?;

    for &i in &indices {
        state.bids[i as usize].withdrawn = true;
    }

    info!(
        bidder = hex::encode(ctx.sender),
        bids = indices.len(),
        "Refund withdrawn"
    );

    Ok(indices.len() as u32)
}

/// Handle OwnerWithdraw call.
///
/// Pays the owner the sale proceeds plus forfeited escrow in the payment
/// token and returns unsold supply in the asset token, in one ledger batch.
pub fn handle_owner_withdraw(
    state: &mut ClearingState,
    env: &mut Env<'_>,
    ctx: &CallContext,
) -> HandlerResult<()> {
    ensure_owner(state, ctx)?;

    if state.phase != Phase::Finalized {
        return Err(ClearingError::NotFinalized);
    }
    if state.owner_withdrawn {
        return Err(ClearingError::OwnerAlreadyWithdrawn);
    }

    let fhe = &mut *env.fhe;
    let payout = fhe.add(state.e_proceeds, state.e_penalties)?;
    let unsold = fhe.sub(state.constants.total_supply, state.e_allocated_total)?;
    fhe.allow(payout.handle(), &ctx.sender)?;
    fhe.allow(unsold.handle(), &ctx.sender)?;

    let owner = state.config.owner;
    env.ledger.transfer_batch(
        &state.config.engine_address,
        &[
            Transfer {
                token: state.config.payment_token,
                to: owner,
                amount: payout,
            },
            Transfer {
                token: state.config.asset_token,
                to: owner,
                amount: unsold,
            },
        ],
    )?;

    state.owner_withdrawn = true;
    info!(owner = hex::encode(owner), "Owner proceeds withdrawn");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClearingConfig;
    use crate::token::{InMemoryLedger, LedgerError};
    use clearing_fhe::{encrypt_bid, MockCoprocessor};
    use clearing_types::{ClearingPath, PlaintextValue};
    use decryption_gateway::DecryptionGateway;

    const OWNER: Address = [1; 32];
    const ENGINE: Address = [2; 32];
    const ORACLE: Address = [3; 32];
    const ASSET: Address = [4; 32];
    const PAYMENT: Address = [5; 32];
    const ALICE: Address = [0xa1; 32];
    const BOB: Address = [0xb0; 32];

    struct Harness {
        state: ClearingState,
        fhe: MockCoprocessor,
        ledger: InMemoryLedger,
        gateway: DecryptionGateway,
    }

    impl Harness {
        fn new(supply: u64) -> Self {
            let mut fhe = MockCoprocessor::new();
            let mut config = ClearingConfig::new(OWNER, ENGINE, ORACLE, ASSET, PAYMENT, supply, 100);
            config.min_price = 2;
            config.min_quantity = 1;
            let state = ClearingState::new(config, &mut fhe);

            let mut ledger = InMemoryLedger::new(fhe.key_holder());
            ledger.mint(&ASSET, &ENGINE, supply);
            for bidder in [ALICE, BOB] {
                ledger.mint(&PAYMENT, &bidder, 1_000);
                ledger.approve(&PAYMENT, &bidder, &ENGINE, 1_000);
            }
            let gateway = DecryptionGateway::new(ORACLE, fhe.key_holder());
            Self {
                state,
                fhe,
                ledger,
                gateway,
            }
        }

        fn call(&mut self, sender: Address, timestamp: u64, call: ClearingCall) -> HandlerResult<CallOutcome> {
            let mut env = Env {
                fhe: &mut self.fhe,
                ledger: &mut self.ledger,
                oracle: &mut self.gateway,
            };
            dispatch(
                &mut self.state,
                &mut env,
                &CallContext { sender, timestamp },
                call,
            )
        }

        fn bid(&mut self, bidder: Address, price: u64, quantity: u64) -> HandlerResult<CallOutcome> {
            let inputs = encrypt_bid(&self.fhe, &ENGINE, &bidder, price, quantity);
            self.call(
                bidder,
                200,
                ClearingCall::SubmitBid {
                    price: inputs.price,
                    quantity: inputs.quantity,
                    proof: inputs.proof,
                },
            )
        }

        fn deliver(&mut self, request_id: RequestId) -> HandlerResult<CallOutcome> {
            let value = self.gateway.fulfill(request_id).unwrap();
            self.call(ORACLE, 0, ClearingCall::OnDecryptionResult { request_id, value })
        }

        fn end(&self) -> u64 {
            self.state.end_time()
        }
    }

    #[test]
    fn test_submit_bid_escrows_deposit() {
        let mut h = Harness::new(10);
        assert_eq!(h.bid(ALICE, 5, 3).unwrap(), CallOutcome::BidAccepted { index: 0 });

        assert_eq!(h.ledger.balance_of(&PAYMENT, &ALICE), 1_000 - 15 - 50);
        assert_eq!(h.ledger.balance_of(&PAYMENT, &ENGINE), 65);
        assert_eq!(h.state.bids_of(&ALICE), &[0]);

        let escrow = h.state.bids[0].e_escrow;
        assert_eq!(h.fhe.key_holder().user_decrypt(escrow.handle(), &ALICE), Ok(65));
    }

    #[test]
    fn test_overflowing_bid_escrows_penalty_only() {
        let mut h = Harness::new(10);
        h.bid(ALICE, 1 << 32, 1 << 32).unwrap();
        // Product fits, product plus penalty fee does not
        h.bid(BOB, 1, u64::MAX).unwrap();

        assert_eq!(h.ledger.balance_of(&PAYMENT, &ALICE), 1_000 - 50);
        assert_eq!(h.ledger.balance_of(&PAYMENT, &BOB), 1_000 - 50);

        let keys = h.fhe.key_holder();
        for bid in &h.state.bids {
            assert_eq!(keys.reveal_bool(bid.e_valid), Ok(false));
            assert_eq!(keys.reveal_u64(bid.e_effective_quantity), Ok(0));
        }
        assert_eq!(keys.reveal_u64(h.state.e_total_valid_demand), Ok(0));
    }

    #[test]
    fn test_total_valid_demand_saturates() {
        let mut h = Harness::new(10);
        h.state.config.min_price = 0;
        h.state.constants.min_price = h.fhe.trivial_encrypt(0);
        h.bid(ALICE, 0, u64::MAX).unwrap();
        h.bid(BOB, 2, 2).unwrap();

        let keys = h.fhe.key_holder();
        assert_eq!(keys.reveal_u64(h.state.e_total_valid_demand), Ok(u64::MAX));
    }

    #[test]
    fn test_submit_bid_timing() {
        let mut h = Harness::new(10);
        let inputs = encrypt_bid(&h.fhe, &ENGINE, &ALICE, 5, 3);
        let submit = ClearingCall::SubmitBid {
            price: inputs.price,
            quantity: inputs.quantity,
            proof: inputs.proof,
        };

        assert_eq!(
            h.call(ALICE, 99, submit.clone()),
            Err(ClearingError::BiddingNotStarted)
        );
        let end = h.end();
        assert_eq!(h.call(ALICE, end, submit), Err(ClearingError::TooLate));
        assert_eq!(h.state.phase, Phase::Closed);
    }

    #[test]
    fn test_bid_cap() {
        let mut h = Harness::new(10);
        h.bid(ALICE, 5, 1).unwrap();
        h.bid(ALICE, 6, 1).unwrap();
        assert_eq!(h.bid(ALICE, 7, 1), Err(ClearingError::MaxBidsExceeded));
        assert_eq!(h.state.bid_count(), 2);
    }

    #[test]
    fn test_proof_for_other_sender_rejected() {
        let mut h = Harness::new(10);
        let inputs = encrypt_bid(&h.fhe, &ENGINE, &ALICE, 5, 3);
        let result = h.call(
            BOB,
            200,
            ClearingCall::SubmitBid {
                price: inputs.price,
                quantity: inputs.quantity,
                proof: inputs.proof,
            },
        );
        assert_eq!(result, Err(ClearingError::Fhe(FheError::InvalidInputProof)));
        assert!(h.state.bids.is_empty());
    }

    #[test]
    fn test_failed_escrow_leaves_no_bid() {
        let mut h = Harness::new(10);
        h.ledger.approve(&PAYMENT, &ALICE, &ENGINE, 10);

        assert_eq!(
            h.bid(ALICE, 5, 3),
            Err(ClearingError::Ledger(LedgerError::InsufficientAllowance))
        );
        assert!(h.state.bids.is_empty());
        assert!(h.state.bids_of(&ALICE).is_empty());
        assert_eq!(
            h.fhe.key_holder().reveal_u64(h.state.e_total_valid_demand),
            Ok(0)
        );
    }

    #[test]
    fn test_owner_only_entry_points() {
        let mut h = Harness::new(10);
        let end = h.end();
        for call in [
            ClearingCall::CloseBidding,
            ClearingCall::AdvanceRanking { batch_size: 1 },
            ClearingCall::Allocate { batch_size: 1 },
            ClearingCall::OwnerWithdraw,
        ] {
            assert!(matches!(
                h.call(ALICE, end, call),
                Err(ClearingError::OwnableUnauthorizedAccount(_))
            ));
        }
    }

    #[test]
    fn test_close_bidding_gates() {
        let mut h = Harness::new(10);
        assert_eq!(
            h.call(OWNER, 200, ClearingCall::CloseBidding),
            Err(ClearingError::TooEarly)
        );

        let end = h.end();
        let outcome = h.call(OWNER, end, ClearingCall::CloseBidding).unwrap();
        assert!(matches!(outcome, CallOutcome::DemandRequested { .. }));
        assert_eq!(h.state.phase, Phase::AwaitingDemandDecryption);

        assert_eq!(
            h.call(OWNER, end, ClearingCall::CloseBidding),
            Err(ClearingError::DemandAlreadyRequested)
        );
        assert_eq!(
            h.call(OWNER, end, ClearingCall::AdvanceRanking { batch_size: 1 }),
            Err(ClearingError::DemandNotDecided)
        );
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    #[test]
    fn test_full_flow_with_invalid_bid() {
        init_tracing();
        let mut h = Harness::new(10);
        h.bid(ALICE, 20, 7).unwrap();
        h.bid(BOB, 15, 7).unwrap();
        // Below the minimum price
        h.bid(BOB, 1, 4).unwrap();
        let end = h.end();

        let CallOutcome::DemandRequested { request_id } =
            h.call(OWNER, end, ClearingCall::CloseBidding).unwrap()
        else {
            panic!("expected demand request");
        };
        h.deliver(request_id).unwrap();
        assert_eq!(h.state.clearing_path, Some(ClearingPath::SortingNetwork));

        let settlement_request = loop {
            match h
                .call(OWNER, end, ClearingCall::AdvanceRanking { batch_size: 2 })
                .unwrap()
            {
                CallOutcome::RankingAdvanced {
                    settlement_request: Some(id),
                    ..
                } => break id,
                CallOutcome::RankingAdvanced { .. } => {}
                other => panic!("unexpected outcome {:?}", other),
            }
        };
        assert_eq!(
            h.call(OWNER, end, ClearingCall::AdvanceRanking { batch_size: 1 }),
            Err(ClearingError::RankingCompleted)
        );
        assert_eq!(
            h.call(OWNER, end, ClearingCall::Allocate { batch_size: 1 }),
            Err(ClearingError::SettlementPriceNotDecrypted)
        );

        h.deliver(settlement_request).unwrap();
        assert_eq!(h.state.settlement_price, Some(15));

        assert_eq!(
            h.call(OWNER, end, ClearingCall::Allocate { batch_size: 2 }).unwrap(),
            CallOutcome::Allocated { cursor: 2, finalized: false }
        );
        // Bob's second bid is not allocated yet
        assert_eq!(h.call(BOB, end, ClearingCall::Claim), Err(ClearingError::AllocationPending));
        assert_eq!(
            h.call(OWNER, end, ClearingCall::Allocate { batch_size: 5 }).unwrap(),
            CallOutcome::Allocated { cursor: 3, finalized: true }
        );

        h.call(ALICE, end, ClearingCall::Claim).unwrap();
        h.call(ALICE, end, ClearingCall::Withdraw).unwrap();
        h.call(BOB, end, ClearingCall::Claim).unwrap();
        h.call(BOB, end, ClearingCall::Withdraw).unwrap();
        h.call(OWNER, end, ClearingCall::OwnerWithdraw).unwrap();

        assert_eq!(h.ledger.balance_of(&ASSET, &ALICE), 7);
        assert_eq!(h.ledger.balance_of(&ASSET, &BOB), 3);
        // Alice: 190 escrowed, 105 cost
        assert_eq!(h.ledger.balance_of(&PAYMENT, &ALICE), 1_000 - 105);
        // Bob: 155 + 54 escrowed, 45 cost, 54 forfeited
        assert_eq!(h.ledger.balance_of(&PAYMENT, &BOB), 1_000 - 45 - 54);
        assert_eq!(h.ledger.balance_of(&PAYMENT, &OWNER), 105 + 45 + 54);
        assert_eq!(h.ledger.balance_of(&ASSET, &OWNER), 0);
        assert_eq!(h.ledger.balance_of(&PAYMENT, &ENGINE), 0);
        assert_eq!(h.ledger.balance_of(&ASSET, &ENGINE), 0);

        assert_eq!(
            h.call(OWNER, end, ClearingCall::OwnerWithdraw),
            Err(ClearingError::OwnerAlreadyWithdrawn)
        );
    }

    #[test]
    fn test_zero_batch_rejected() {
        let mut h = Harness::new(10);
        let end = h.end();
        let CallOutcome::DemandRequested { request_id } =
            h.call(OWNER, end, ClearingCall::CloseBidding).unwrap()
        else {
            panic!("expected demand request");
        };
        h.deliver(request_id).unwrap();
        assert_eq!(
            h.call(OWNER, end, ClearingCall::AdvanceRanking { batch_size: 0 }),
            Err(ClearingError::InvalidBatchSize)
        );
    }

    #[test]
    fn test_oracle_only_callback() {
        let mut h = Harness::new(10);
        let result = h.call(
            ALICE,
            0,
            ClearingCall::OnDecryptionResult {
                request_id: [0; 32],
                value: PlaintextValue::Bool(true),
            },
        );
        assert!(matches!(result, Err(ClearingError::UnauthorizedOracle(_))));
    }
}

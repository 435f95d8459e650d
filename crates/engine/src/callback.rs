//! Decryption callback adapter.
//!
//! The oracle resolves requests in any order. Each result is matched to the
//! field it resolves through its request id, applied once, and then
//! remembered so a replay is ignored.

use clearing_fhe::FheOps;
use clearing_types::{Address, ClearingPath, DecryptionTarget, Phase, PlaintextValue, RequestId};
use tracing::{info, warn};

use crate::error::ClearingError;
use crate::handlers::HandlerResult;
use crate::state::ClearingState;
use crate::strategy::strategy_for;

/// Handle a decryption result delivered by `caller`.
///
/// # Returns
/// `true` if the result was applied, `false` if it was a replay
pub fn handle_decryption_result(
    state: &mut ClearingState,
    fhe: &mut dyn FheOps,
    caller: &Address,
    request_id: RequestId,
    value: PlaintextValue,
) -> HandlerResult<bool> {
    // Check caller is the oracle
    if *caller != state.config.oracle {
        warn!(
            caller = hex::encode(caller),
            request_id = hex::encode(request_id),
            "Rejected decryption result from unauthorized caller"
        );
        return Err(ClearingError::UnauthorizedOracle(hex::encode(caller)));
    }

    if state.resolved_decryptions.contains(&request_id) {
        warn!(
            request_id = hex::encode(request_id),
            "Ignoring replayed decryption result"
        );
        return Ok(false);
    }

    let target = *state
        .pending_decryptions
        .get(&request_id)
        .ok_or_else(|| ClearingError::UnknownDecryptionRequest(hex::encode(request_id)))?;

    match (target, value) {
        (DecryptionTarget::DemandExceedsSupply, PlaintextValue::Bool(exceeds)) => {
            apply_demand(state, fhe, exceeds)?
        }
        (DecryptionTarget::SettlementPrice, PlaintextValue::Uint64(price)) => {
            apply_settlement_price(state, price)?
        }
        (target, value) => {
            return Err(ClearingError::PlaintextTypeMismatch {
                expected: target.expected_type(),
                got: value.fhe_type(),
            })
        }
    }

    state.pending_decryptions.remove(&request_id);
    state.resolved_decryptions.insert(request_id);
    Ok(true)
}

fn expect_phase(state: &ClearingState, expected: Phase) -> HandlerResult<()> {
    if state.phase != expected {
        return Err(ClearingError::InvalidPhase {
            expected,
            got: state.phase,
        });
    }
    Ok(())
}

/// Select the rank-and-clear strategy and open ranking.
fn apply_demand(state: &mut ClearingState, fhe: &mut dyn FheOps, exceeds: bool) -> HandlerResult<()> {
    expect_phase(state, Phase::AwaitingDemandDecryption)?;

    let path = if exceeds {
        state.config.over_demand_path
    } else {
        ClearingPath::MinPrice
    };
    let strategy = strategy_for(path);
    let work = strategy.begin(state, fhe)?;

    state.demand_exceeds_supply = Some(exceeds);
    state.clearing_path = Some(path);
    state.total_ranking_steps = strategy.total_steps(state.bids.len());
    state.ranking_cursor = 0;
    state.work = Some(work);
    state.phase = Phase::Ranking;

    info!(
        exceeds_supply = exceeds,
        path = ?path,
        total_steps = state.total_ranking_steps,
        "Demand decided, ranking opened"
    );
    Ok(())
}

fn apply_settlement_price(state: &mut ClearingState, price: u64) -> HandlerResult<()> {
    expect_phase(state, Phase::AwaitingSettlementDecryption)?;

    state.settlement_price = Some(price);
    state.work = None;
    state.phase = if state.bids.is_empty() {
        Phase::Finalized
    } else {
        Phase::Allocating
    };

    info!(price, phase = ?state.phase, "Settlement price decrypted");
    Ok(())
}

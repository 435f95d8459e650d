//! Clearing engine instance: state plus the collaborators it calls out to.

use clearing_fhe::FheOps;
use clearing_types::{Address, PlaintextValue, RequestId};
use decryption_gateway::{DecryptionCallback, DecryptionOracle};
use tracing::{info, warn};

use crate::call::{CallOutcome, ClearingCall};
use crate::callback::handle_decryption_result;
use crate::config::ClearingConfig;
use crate::error::ClearingError;
use crate::handlers::{dispatch, CallContext, Env, HandlerResult};
use crate::queries::{handle_query, ClearingQuery, ClearingQueryResponse, QueryContext};
use crate::state::ClearingState;
use crate::token::ConfidentialLedger;

/// One auction, bound to a coprocessor, a ledger and an oracle.
pub struct ClearingEngine<F, L, O> {
    state: ClearingState,
    fhe: F,
    ledger: L,
    oracle: O,
}

impl<F, L, O> ClearingEngine<F, L, O>
where
    F: FheOps,
    L: ConfidentialLedger,
    O: DecryptionOracle,
{
    /// Deploy an engine for `config`.
    pub fn new(config: ClearingConfig, mut fhe: F, ledger: L, oracle: O) -> HandlerResult<Self> {
        config.validate()?;
        let state = ClearingState::new(config, &mut fhe);

        info!(
            engine = hex::encode(state.config.engine_address),
            owner = hex::encode(state.config.owner),
            total_supply = state.config.total_supply,
            end_time = state.end_time(),
            "Clearing engine deployed"
        );

        Ok(Self {
            state,
            fhe,
            ledger,
            oracle,
        })
    }

    /// Execute a call. A failed call leaves state as it was, apart from the
    /// time-driven close of bidding.
    pub fn execute(&mut self, ctx: &CallContext, call: ClearingCall) -> HandlerResult<CallOutcome> {
        let mut env = Env {
            fhe: &mut self.fhe,
            ledger: &mut self.ledger,
            oracle: &mut self.oracle,
        };
        dispatch(&mut self.state, &mut env, ctx, call).map_err(|e| {
            warn!(
                sender = hex::encode(ctx.sender),
                error = %e,
                kind = ?e.kind(),
                "Call rejected"
            );
            e
        })
    }

    pub fn query(&self, ctx: &QueryContext, query: ClearingQuery) -> ClearingQueryResponse {
        handle_query(&self.state, ctx, query)
    }

    pub fn state(&self) -> &ClearingState {
        &self.state
    }

    pub fn address(&self) -> Address {
        self.state.config.engine_address
    }

    pub fn fhe(&self) -> &F {
        &self.fhe
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut L {
        &mut self.ledger
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }
}

impl<F, L, O> DecryptionCallback for ClearingEngine<F, L, O>
where
    F: FheOps,
{
    type Error = ClearingError;

    fn on_decryption_result(
        &mut self,
        oracle: &Address,
        request_id: RequestId,
        value: PlaintextValue,
    ) -> Result<(), ClearingError> {
        handle_decryption_result(&mut self.state, &mut self.fhe, oracle, request_id, value)
            .map(|_| ())
    }
}

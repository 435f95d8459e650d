//! End-to-end integration tests for the confidential clearing engine.
//!
//! These tests exercise the full auction lifecycle:
//! 1. Bid encryption and submission with escrow
//! 2. Demand comparison, revealed by the decryption gateway
//! 3. Ranking batches and settlement price decryption
//! 4. Allocation batches
//! 5. Claims, refunds and owner payout

use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};
use clearing_engine::{
    CallContext, CallOutcome, ClearingCall, ClearingConfig, ClearingEngine, ClearingError,
    ClearingQuery, ClearingQueryResponse, InMemoryLedger, QueryContext,
};
use clearing_fhe::{encrypt_bid, MockCoprocessor};
use clearing_types::{Address, Phase, PlaintextValue, RequestId};
use decryption_gateway::{DecryptionCallback, DecryptionGateway, DeliveryOrder, SharedGateway};

// ========================================
// Harness
// ========================================

pub const OWNER: Address = [0x01; 32];
pub const ENGINE: Address = [0x02; 32];
pub const ORACLE: Address = [0x03; 32];
pub const ASSET: Address = [0x04; 32];
pub const PAYMENT: Address = [0x05; 32];
pub const START: u64 = 1_000;

/// Payment tokens minted to, and approved by, every bidder
pub const BIDDER_FUNDS: u64 = 1_000_000;

pub type Engine = ClearingEngine<MockCoprocessor, InMemoryLedger, SharedGateway>;

/// Address of the `n`th test bidder.
pub fn bidder(n: u8) -> Address {
    let mut address = [0xbb; 32];
    address[0] = n;
    address
}

/// Auction config with test addresses and default parameters.
pub fn config(total_supply: u64) -> ClearingConfig {
    ClearingConfig::new(OWNER, ENGINE, ORACLE, ASSET, PAYMENT, total_supply, START)
}

/// An engine wired to an in-memory coprocessor, ledger and gateway.
pub struct Auction {
    pub engine: Engine,
    /// Client-side view of the coprocessor, for encrypting bids and reading
    /// granted handles
    pub coprocessor: MockCoprocessor,
    pub gateway: SharedGateway,
    pub order: DeliveryOrder,
}

impl Auction {
    /// Deploy with the full supply minted to the engine.
    pub fn deploy(config: ClearingConfig, bidders: &[Address]) -> Result<Self> {
        let supply = config.total_supply;
        Self::deploy_with_asset(config, bidders, supply)
    }

    /// Deploy with `asset` units minted to the engine.
    pub fn deploy_with_asset(config: ClearingConfig, bidders: &[Address], asset: u64) -> Result<Self> {
        let coprocessor = MockCoprocessor::new();
        let gateway = DecryptionGateway::new(config.oracle, coprocessor.key_holder()).into_shared();
        Self::deploy_on(coprocessor, gateway, config, bidders, asset)
    }

    /// Deploy on an existing coprocessor and gateway.
    pub fn deploy_on(
        coprocessor: MockCoprocessor,
        gateway: SharedGateway,
        config: ClearingConfig,
        bidders: &[Address],
        asset: u64,
    ) -> Result<Self> {
        let mut ledger = InMemoryLedger::new(coprocessor.key_holder());
        ledger.mint(&config.asset_token, &config.engine_address, asset);
        for b in bidders {
            ledger.mint(&config.payment_token, b, BIDDER_FUNDS);
            ledger.approve(&config.payment_token, b, &config.engine_address, BIDDER_FUNDS);
        }

        let engine = ClearingEngine::new(config, coprocessor.clone(), ledger, gateway.clone())?;
        Ok(Self {
            engine,
            coprocessor,
            gateway,
            order: DeliveryOrder::Fifo,
        })
    }

    pub fn end_time(&self) -> u64 {
        self.engine.state().end_time()
    }

    pub fn call(&mut self, sender: Address, timestamp: u64, call: ClearingCall) -> Result<CallOutcome, ClearingError> {
        self.engine.execute(&CallContext { sender, timestamp }, call)
    }

    /// Encrypt and submit a bid during the bidding window.
    pub fn bid(&mut self, bidder: Address, price: u64, quantity: u64) -> Result<u32, ClearingError> {
        let inputs = encrypt_bid(&self.coprocessor, &self.engine.address(), &bidder, price, quantity);
        let outcome = self.call(
            bidder,
            START,
            ClearingCall::SubmitBid {
                price: inputs.price,
                quantity: inputs.quantity,
                proof: inputs.proof,
            },
        )?;
        match outcome {
            CallOutcome::BidAccepted { index } => Ok(index),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    /// Deliver every result the gateway can produce.
    pub fn relay(&mut self) -> Result<usize> {
        let order = self.order;
        let delivered = self.gateway.lock().relay_all(&mut self.engine, order)?;
        Ok(delivered)
    }

    /// Close bidding and return the demand request.
    pub fn close(&mut self) -> Result<RequestId> {
        let end = self.end_time();
        match self.call(OWNER, end, ClearingCall::CloseBidding)? {
            CallOutcome::DemandRequested { request_id } => Ok(request_id),
            other => bail!("unexpected outcome {:?}", other),
        }
    }

    /// Run ranking batches until the settlement price is requested.
    ///
    /// # Returns
    /// The number of batches run
    pub fn rank(&mut self, batch_size: u32) -> Result<u32> {
        let end = self.end_time();
        let mut batches = 0;
        loop {
            batches += 1;
            match self.call(OWNER, end, ClearingCall::AdvanceRanking { batch_size })? {
                CallOutcome::RankingAdvanced {
                    settlement_request: Some(_),
                    ..
                } => return Ok(batches),
                CallOutcome::RankingAdvanced { .. } => {}
                other => bail!("unexpected outcome {:?}", other),
            }
        }
    }

    /// Run allocation batches until the auction is finalized.
    pub fn allocate(&mut self, batch_size: u32) -> Result<u32> {
        let end = self.end_time();
        let mut batches = 0;
        loop {
            batches += 1;
            match self.call(OWNER, end, ClearingCall::Allocate { batch_size })? {
                CallOutcome::Allocated {
                    finalized: true, ..
                } => return Ok(batches),
                CallOutcome::Allocated { .. } => {}
                other => bail!("unexpected outcome {:?}", other),
            }
        }
    }

    /// Drive the auction from the end of bidding to finalization.
    pub fn clear(&mut self, batch_size: u32) -> Result<()> {
        self.close()?;
        self.relay()?;
        self.rank(batch_size)?;
        self.relay()?;
        if self.engine.state().phase == Phase::Allocating {
            self.allocate(batch_size)?;
        }
        Ok(())
    }

    pub fn claim(&mut self, bidder: Address) -> Result<CallOutcome, ClearingError> {
        let end = self.end_time();
        self.call(bidder, end, ClearingCall::Claim)
    }

    pub fn withdraw(&mut self, bidder: Address) -> Result<CallOutcome, ClearingError> {
        let end = self.end_time();
        self.call(bidder, end, ClearingCall::Withdraw)
    }

    pub fn owner_withdraw(&mut self) -> Result<CallOutcome, ClearingError> {
        let end = self.end_time();
        self.call(OWNER, end, ClearingCall::OwnerWithdraw)
    }

    /// Mint `amount` more payment tokens to `bidder` and raise the engine's
    /// allowance to match.
    pub fn fund(&mut self, bidder: &Address, amount: u64) {
        let token = self.engine.state().config.payment_token;
        let spender = self.engine.address();
        let ledger = self.engine.ledger_mut();
        let allowance = ledger.allowance(&token, bidder, &spender);
        ledger.mint(&token, bidder, amount);
        ledger.approve(&token, bidder, &spender, allowance.saturating_add(amount));
    }

    /// Query the engine at the end of bidding.
    pub fn query(&self, query: ClearingQuery) -> ClearingQueryResponse {
        let ctx = QueryContext {
            timestamp: self.end_time(),
        };
        self.engine.query(&ctx, query)
    }

    pub fn settlement_price(&self) -> Option<u64> {
        match self.query(ClearingQuery::GetSettlementPrice) {
            ClearingQueryResponse::SettlementPrice(price) => price,
            _ => None,
        }
    }

    /// Allocations of `bidder`'s bids, decrypted with the bidder's own grant.
    pub fn allocations_of(&self, bidder: &Address) -> Result<Vec<u64>> {
        let keys = self.coprocessor.key_holder();
        let state = self.engine.state();
        state
            .bids_of(bidder)
            .iter()
            .map(|&index| {
                let allocated = state.bids[index as usize]
                    .e_allocated_quantity
                    .ok_or_else(|| anyhow!("bid {} not allocated", index))?;
                Ok(keys.user_decrypt(allocated.handle(), bidder)?)
            })
            .collect()
    }

    pub fn total_allocated(&self) -> Result<u64> {
        let keys = self.coprocessor.key_holder();
        Ok(keys.reveal_u64(self.engine.state().e_allocated_total)?)
    }

    pub fn balance(&self, token: &Address, owner: &Address) -> u64 {
        self.engine.ledger().balance_of(token, owner)
    }
}

/// Escrow the engine takes for a bid: `price × quantity + penalty_fee`, or
/// the penalty fee alone when that overflows.
pub fn escrow_of(penalty_fee: u64, price: u64, quantity: u64) -> u64 {
    price
        .checked_mul(quantity)
        .and_then(|notional| notional.checked_add(penalty_fee))
        .unwrap_or(penalty_fee)
}

/// Plaintext clearing of `bids` under `config`, for comparison with the
/// engine. Sums are exact.
///
/// # Returns
/// The settlement price and each bid's allocation
pub fn reference_clearing(config: &ClearingConfig, bids: &[(u64, u64)]) -> (u64, Vec<u64>) {
    let effective: Vec<Option<(u64, u64)>> = bids
        .iter()
        .map(|&(p, q)| {
            let fits = p
                .checked_mul(q)
                .and_then(|notional| notional.checked_add(config.penalty_fee))
                .is_some();
            (fits && p >= config.min_price && q >= config.min_quantity).then_some((p, q))
        })
        .collect();

    let supply = u128::from(config.total_supply);
    let demand: u128 = effective.iter().flatten().map(|&(_, q)| u128::from(q)).sum();
    if demand <= supply {
        let price = effective.iter().flatten().map(|&(p, _)| p).min().unwrap_or(0);
        return (price, effective.iter().map(|e| e.map_or(0, |(_, q)| q)).collect());
    }

    let price_of = |i: usize| effective[i].map_or(0, |(p, _)| p);
    let mut order: Vec<usize> = (0..bids.len()).collect();
    order.sort_by(|&a, &b| price_of(b).cmp(&price_of(a)).then(a.cmp(&b)));

    let mut allocations = vec![0; bids.len()];
    let mut before: u128 = 0;
    let mut price = 0;
    for i in order {
        let (p, q) = effective[i].unwrap_or((0, 0));
        let q = u128::from(q);
        if before < supply && before + q >= supply {
            price = p;
        }
        if before < supply {
            // Bounded by q, which came from a u64
            allocations[i] = q.min(supply - before) as u64;
        }
        before += q;
    }
    (price, allocations)
}

/// Routes gateway results to whichever engine made the request.
pub struct Router {
    pub engines: Vec<Engine>,
    pub routes: HashMap<RequestId, usize>,
}

impl DecryptionCallback for Router {
    type Error = ClearingError;

    fn on_decryption_result(
        &mut self,
        oracle: &Address,
        request_id: RequestId,
        value: PlaintextValue,
    ) -> Result<(), ClearingError> {
        let target = *self
            .routes
            .get(&request_id)
            .ok_or_else(|| ClearingError::UnknownDecryptionRequest(hex::encode(request_id)))?;
        self.engines[target].on_decryption_result(oracle, request_id, value)
    }
}

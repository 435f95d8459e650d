//! Query handlers for the clearing engine.
//!
//! These functions provide read-only access to engine state. Encrypted fields
//! are returned as handles; reading them requires an ACL grant. Queries carry
//! the caller's clock so the reported phase follows the end of bidding even
//! before a call has persisted it.

use clearing_types::{Address, ClearingPath, EncryptedU64, Phase, RequestId};
use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};

use crate::config::ClearingConfig;
use crate::state::{Bid, ClearingState};

/// Context provided by the runtime for each query.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryContext {
    /// Current block timestamp
    pub timestamp: u64,
}

/// Query request types.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClearingQuery {
    /// Get the current phase.
    GetPhase,

    /// Get ranking and allocation cursors.
    GetProgress,

    /// Get the number of bids.
    GetBidCount,

    /// Get the decrypted demand comparison.
    GetDemandExceedsSupply,

    /// Get the selected rank-and-clear strategy.
    GetClearingPath,

    /// Get the decrypted settlement price.
    GetSettlementPrice,

    /// Get a bid by index.
    GetBid { index: u32 },

    /// Get the bid indices of a bidder.
    GetBidsOf {
        #[serde_as(as = "Hex")]
        bidder: Address,
    },

    /// Get outstanding decryption requests.
    GetPendingDecryptions,

    /// Get the auction configuration.
    GetConfig,
}

/// Cursor positions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub phase: Phase,
    pub bid_count: u64,
    pub ranking_cursor: u64,
    pub total_ranking_steps: u64,
    pub allocation_cursor: u64,
}

/// Public view of a bid.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidView {
    pub index: u32,
    #[serde_as(as = "Hex")]
    pub bidder: Address,
    pub submitted_at: u64,
    pub e_price: EncryptedU64,
    pub e_quantity: EncryptedU64,
    pub e_escrow: EncryptedU64,
    pub e_index: Option<EncryptedU64>,
    pub e_cumulative_demand_before: Option<EncryptedU64>,
    pub e_allocated_quantity: Option<EncryptedU64>,
    pub e_deposit: Option<EncryptedU64>,
    pub e_refund: Option<EncryptedU64>,
    pub claimed: bool,
    pub withdrawn: bool,
}

impl BidView {
    pub fn from_bid(index: u32, bid: &Bid) -> Self {
        Self {
            index,
            bidder: bid.bidder,
            submitted_at: bid.submitted_at,
            e_price: bid.e_price,
            e_quantity: bid.e_quantity,
            e_escrow: bid.e_escrow,
            e_index: bid.e_index,
            e_cumulative_demand_before: bid.e_cumulative_demand_before,
            e_allocated_quantity: bid.e_allocated_quantity,
            e_deposit: bid.e_deposit,
            e_refund: bid.e_refund,
            claimed: bid.claimed,
            withdrawn: bid.withdrawn,
        }
    }
}

/// Query response types.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClearingQueryResponse {
    Phase(Phase),

    Progress(Progress),

    BidCount(u64),

    DemandExceedsSupply(Option<bool>),

    ClearingPath(Option<ClearingPath>),

    SettlementPrice(Option<u64>),

    Bid(Option<BidView>),

    BidsOf(Vec<u32>),

    PendingDecryptions(#[serde_as(as = "Vec<Hex>")] Vec<RequestId>),

    Config(ClearingConfig),
}

/// Handle a query.
pub fn handle_query(
    state: &ClearingState,
    ctx: &QueryContext,
    query: ClearingQuery,
) -> ClearingQueryResponse {
    match query {
        ClearingQuery::GetPhase => ClearingQueryResponse::Phase(state.phase_at(ctx.timestamp)),

        ClearingQuery::GetProgress => {
            ClearingQueryResponse::Progress(progress(state, ctx.timestamp))
        }

        ClearingQuery::GetBidCount => ClearingQueryResponse::BidCount(state.bid_count()),

        ClearingQuery::GetDemandExceedsSupply => {
            ClearingQueryResponse::DemandExceedsSupply(state.demand_exceeds_supply)
        }

        ClearingQuery::GetClearingPath => ClearingQueryResponse::ClearingPath(state.clearing_path),

        ClearingQuery::GetSettlementPrice => {
            ClearingQueryResponse::SettlementPrice(state.settlement_price)
        }

        ClearingQuery::GetBid { index } => ClearingQueryResponse::Bid(
            state.get_bid(index).map(|bid| BidView::from_bid(index, bid)),
        ),

        ClearingQuery::GetBidsOf { bidder } => {
            ClearingQueryResponse::BidsOf(state.bids_of(&bidder).to_vec())
        }

        ClearingQuery::GetPendingDecryptions => {
            let mut pending: Vec<RequestId> = state.pending_decryptions.keys().copied().collect();
            pending.sort();
            ClearingQueryResponse::PendingDecryptions(pending)
        }

        ClearingQuery::GetConfig => ClearingQueryResponse::Config(state.config.clone()),
    }
}

/// Cursor positions of `state` as of `now`.
pub fn progress(state: &ClearingState, now: u64) -> Progress {
    Progress {
        phase: state.phase_at(now),
        bid_count: state.bid_count(),
        ranking_cursor: state.ranking_cursor,
        total_ranking_steps: state.total_ranking_steps,
        allocation_cursor: state.allocation_cursor,
    }
}

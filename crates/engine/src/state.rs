//! Engine state: the bid ledger, phase machine, cursors and aggregates.

use std::collections::{HashMap, HashSet};

use borsh::{BorshDeserialize, BorshSerialize};
use clearing_fhe::FheOps;
use clearing_types::{
    Address, ClearingPath, DecryptionTarget, EncryptedBool, EncryptedU64, Phase, RequestId,
};
use tracing::info;

use crate::config::ClearingConfig;

/// A submitted bid.
///
/// Fields from `e_index` on are outputs written once by the engine during
/// ranking and allocation. `claimed` and `withdrawn` only move false to true.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct Bid {
    pub bidder: Address,
    pub e_price: EncryptedU64,
    pub e_quantity: EncryptedU64,
    /// Price and quantity meet the minimums
    pub e_valid: EncryptedBool,
    /// `e_price` if valid, else 0
    pub e_effective_price: EncryptedU64,
    /// `e_quantity` if valid, else 0
    pub e_effective_quantity: EncryptedU64,
    /// Amount escrowed at submission: price × quantity + penalty fee, or the
    /// penalty fee alone when that overflows
    pub e_escrow: EncryptedU64,
    pub submitted_at: u64,

    /// Position in price-descending order
    pub e_index: Option<EncryptedU64>,
    /// Quantity of all bids ranked ahead of this one
    pub e_cumulative_demand_before: Option<EncryptedU64>,
    pub e_allocated_quantity: Option<EncryptedU64>,
    /// Cost owed: allocated quantity × settlement price
    pub e_deposit: Option<EncryptedU64>,
    /// Escrow returned to the bidder: escrow − cost, or 0 for an invalid bid
    pub e_refund: Option<EncryptedU64>,

    pub claimed: bool,
    pub withdrawn: bool,
}

/// Ciphertexts of public constants, encrypted once at construction.
#[derive(Clone, Copy, Debug, BorshSerialize, BorshDeserialize)]
pub struct EncryptedConstants {
    pub zero: EncryptedU64,
    pub one: EncryptedU64,
    pub max: EncryptedU64,
    pub min_price: EncryptedU64,
    pub min_quantity: EncryptedU64,
    pub penalty_fee: EncryptedU64,
    pub total_supply: EncryptedU64,
}

impl EncryptedConstants {
    fn new(config: &ClearingConfig, fhe: &mut dyn FheOps) -> Self {
        Self {
            zero: fhe.trivial_encrypt(0),
            one: fhe.trivial_encrypt(1),
            max: fhe.trivial_encrypt(u64::MAX),
            min_price: fhe.trivial_encrypt(config.min_price),
            min_quantity: fhe.trivial_encrypt(config.min_quantity),
            penalty_fee: fhe.trivial_encrypt(config.penalty_fee),
            total_supply: fhe.trivial_encrypt(config.total_supply),
        }
    }
}

/// One position of the sorting network.
#[derive(Clone, Copy, Debug, BorshSerialize, BorshDeserialize)]
pub struct Slot {
    pub price: EncryptedU64,
    pub quantity: EncryptedU64,
    /// Submission index of the bid occupying this slot
    pub origin: EncryptedU64,
    pub cumulative_before: EncryptedU64,
    pub rank: EncryptedU64,
}

/// Scratch state of the active rank-and-clear strategy.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct RankingWork {
    /// Sorting-network positions; empty on other paths
    pub slots: Vec<Slot>,
    /// Running minimum price, or the marginal price found so far
    pub accumulator: EncryptedU64,
    /// Min-price path: a valid bid has been seen
    pub seen_valid: EncryptedBool,
}

/// Clearing engine state.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct ClearingState {
    pub config: ClearingConfig,
    pub phase: Phase,

    /// Bid ledger in submission order
    pub bids: Vec<Bid>,
    /// bidder -> indices of their bids
    pub bidders: HashMap<Address, Vec<u32>>,

    pub constants: EncryptedConstants,
    /// Sum of effective quantities, maintained at submission and clamped to
    /// `u64::MAX`
    pub e_total_valid_demand: EncryptedU64,

    pub e_demand_exceeds_supply: Option<EncryptedBool>,
    pub demand_exceeds_supply: Option<bool>,
    pub clearing_path: Option<ClearingPath>,

    pub ranking_cursor: u64,
    pub total_ranking_steps: u64,
    pub work: Option<RankingWork>,

    pub e_settlement_price: Option<EncryptedU64>,
    /// Written only by the settlement decryption callback
    pub settlement_price: Option<u64>,

    pub allocation_cursor: u64,
    pub e_proceeds: EncryptedU64,
    pub e_penalties: EncryptedU64,
    pub e_allocated_total: EncryptedU64,

    pub pending_decryptions: HashMap<RequestId, DecryptionTarget>,
    pub resolved_decryptions: HashSet<RequestId>,

    pub owner_withdrawn: bool,
}

impl ClearingState {
    /// Create the state for a validated config.
    pub fn new(config: ClearingConfig, fhe: &mut dyn FheOps) -> Self {
        let constants = EncryptedConstants::new(&config, fhe);
        Self {
            config,
            phase: Phase::Bidding,
            bids: Vec::new(),
            bidders: HashMap::new(),
            constants,
            e_total_valid_demand: constants.zero,
            e_demand_exceeds_supply: None,
            demand_exceeds_supply: None,
            clearing_path: None,
            ranking_cursor: 0,
            total_ranking_steps: 0,
            work: None,
            e_settlement_price: None,
            settlement_price: None,
            allocation_cursor: 0,
            e_proceeds: constants.zero,
            e_penalties: constants.zero,
            e_allocated_total: constants.zero,
            pending_decryptions: HashMap::new(),
            resolved_decryptions: HashSet::new(),
            owner_withdrawn: false,
        }
    }

    pub fn bid_count(&self) -> u64 {
        self.bids.len() as u64
    }

    pub fn end_time(&self) -> u64 {
        self.config.end_time()
    }

    /// Phase as of `now`: the stored phase, except that bidding reads as
    /// closed once the window has elapsed.
    pub fn phase_at(&self, now: u64) -> Phase {
        if self.phase == Phase::Bidding && now >= self.end_time() {
            Phase::Closed
        } else {
            self.phase
        }
    }

    /// Close bidding once the window has elapsed.
    pub fn refresh_phase(&mut self, now: u64) {
        if self.phase != self.phase_at(now) {
            self.phase = self.phase_at(now);
            info!(bids = self.bids.len(), now, "Bidding window closed");
        }
    }

    /// Indices of all bids placed by `bidder`.
    pub fn bids_of(&self, bidder: &Address) -> &[u32] {
        self.bidders.get(bidder).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn get_bid(&self, index: u32) -> Option<&Bid> {
        self.bids.get(index as usize)
    }

    /// Whether every bid of `bidder` has been through allocation.
    pub fn is_allocated(&self, bidder: &Address) -> bool {
        self.bids_of(bidder)
            .iter()
            .all(|&index| u64::from(index) < self.allocation_cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clearing_fhe::MockCoprocessor;

    fn test_state() -> ClearingState {
        let config = ClearingConfig::new([1; 32], [2; 32], [3; 32], [4; 32], [5; 32], 100, 1_000);
        let mut fhe = MockCoprocessor::new();
        ClearingState::new(config, &mut fhe)
    }

    #[test]
    fn test_refresh_phase() {
        let mut state = test_state();
        state.refresh_phase(1_000);
        assert_eq!(state.phase, Phase::Bidding);

        state.refresh_phase(state.end_time() - 1);
        assert_eq!(state.phase, Phase::Bidding);

        state.refresh_phase(state.end_time());
        assert_eq!(state.phase, Phase::Closed);
    }

    #[test]
    fn test_phase_at_is_read_only() {
        let state = test_state();
        let end = state.end_time();
        assert_eq!(state.phase_at(end - 1), Phase::Bidding);
        assert_eq!(state.phase_at(end), Phase::Closed);
        assert_eq!(state.phase, Phase::Bidding);
    }

    #[test]
    fn test_refresh_never_rewinds() {
        let mut state = test_state();
        state.phase = Phase::Allocating;
        state.refresh_phase(0);
        assert_eq!(state.phase, Phase::Allocating);
    }

    #[test]
    fn test_bids_of_unknown_bidder() {
        let state = test_state();
        assert!(state.bids_of(&[9; 32]).is_empty());
        assert!(state.is_allocated(&[9; 32]));
    }

    #[test]
    fn test_state_borsh_roundtrip() {
        let state = test_state();
        let bytes = borsh::to_vec(&state).unwrap();
        let decoded: ClearingState = borsh::from_slice(&bytes).unwrap();
        assert_eq!(decoded.phase, Phase::Bidding);
        assert_eq!(decoded.config, state.config);
    }
}

//! Allocation and charge arithmetic, applied once per bid.
//!
//! With `before` units ranked ahead of a bid and `supply` on offer, the bid
//! receives `min(quantity, supply − before)` when `before < supply`, else 0.
//! On the min-price path every valid bid is filled in full. The cost is the
//! allocated quantity times the public settlement price; a valid bid gets its
//! escrow back minus the cost, an invalid bid forfeits the whole escrow. A
//! refund never exceeds the escrow.

use clearing_fhe::FheOps;
use clearing_types::{ClearingPath, EncryptedU64};

use crate::error::ClearingError;
use crate::handlers::HandlerResult;
use crate::state::{Bid, EncryptedConstants};

/// Encrypted outcome of one bid.
#[derive(Clone, Copy, Debug)]
pub struct BidSettlement {
    pub allocated: EncryptedU64,
    /// Owed to the seller
    pub cost: EncryptedU64,
    /// Returned to the bidder
    pub refund: EncryptedU64,
    /// Forfeited to the seller
    pub penalty: EncryptedU64,
}

/// Quantity a bid receives.
pub fn allocated_quantity(
    fhe: &mut dyn FheOps,
    bid: &Bid,
    index: u32,
    path: ClearingPath,
    c: &EncryptedConstants,
) -> HandlerResult<EncryptedU64> {
    if path == ClearingPath::MinPrice {
        return Ok(bid.e_effective_quantity);
    }

    let before = bid
        .e_cumulative_demand_before
        .ok_or(ClearingError::BidNotRanked(index))?;
    let open = fhe.lt(before, c.total_supply)?;
    let left = fhe.sub(c.total_supply, before)?;
    let remaining = fhe.select(open, left, c.zero)?;
    Ok(fhe.min(bid.e_effective_quantity, remaining)?)
}

/// Allocation, cost, refund and penalty of one bid.
pub fn settle_bid(
    fhe: &mut dyn FheOps,
    bid: &Bid,
    index: u32,
    path: ClearingPath,
    settlement_price: u64,
    c: &EncryptedConstants,
) -> HandlerResult<BidSettlement> {
    let allocated = allocated_quantity(fhe, bid, index, path, c)?;
    let cost = fhe.mul_plain(allocated, settlement_price)?;
    let covered = fhe.ge(bid.e_escrow, cost)?;
    let change = fhe.sub(bid.e_escrow, cost)?;
    let change = fhe.select(covered, change, c.zero)?;
    let refund = fhe.select(bid.e_valid, change, c.zero)?;
    let penalty = fhe.select(bid.e_valid, c.zero, bid.e_escrow)?;

    Ok(BidSettlement {
        allocated,
        cost,
        refund,
        penalty,
    })
}

/// Encrypted sum of `values`.
pub fn sum(
    fhe: &mut dyn FheOps,
    zero: EncryptedU64,
    values: impl IntoIterator<Item = EncryptedU64>,
) -> HandlerResult<EncryptedU64> {
    values
        .into_iter()
        .try_fold(zero, |acc, v| -> HandlerResult<EncryptedU64> {
            Ok(fhe.add(acc, v)?)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClearingConfig;
    use crate::state::ClearingState;
    use clearing_fhe::MockCoprocessor;

    struct Fixture {
        fhe: MockCoprocessor,
        constants: EncryptedConstants,
    }

    impl Fixture {
        fn new(supply: u64) -> Self {
            let mut fhe = MockCoprocessor::new();
            let config = ClearingConfig::new([1; 32], [2; 32], [3; 32], [4; 32], [5; 32], supply, 0);
            let constants = ClearingState::new(config, &mut fhe).constants;
            Self { fhe, constants }
        }

        fn bid(&mut self, valid: bool, price: u64, quantity: u64, before: u64) -> Bid {
            let fhe = &mut self.fhe;
            let e_price = fhe.trivial_encrypt(price);
            let e_quantity = fhe.trivial_encrypt(quantity);
            let e_valid = fhe.trivial_encrypt_bool(valid);
            let zero = self.constants.zero;
            Bid {
                bidder: [7; 32],
                e_price,
                e_quantity,
                e_valid,
                e_effective_price: fhe.select(e_valid, e_price, zero).unwrap(),
                e_effective_quantity: fhe.select(e_valid, e_quantity, zero).unwrap(),
                e_escrow: fhe.trivial_encrypt(price * quantity + 50),
                submitted_at: 0,
                e_index: None,
                e_cumulative_demand_before: Some(fhe.trivial_encrypt(before)),
                e_allocated_quantity: None,
                e_deposit: None,
                e_refund: None,
                claimed: false,
                withdrawn: false,
            }
        }

        fn settle(&mut self, bid: &Bid, path: ClearingPath, price: u64) -> (u64, u64, u64, u64) {
            let s = settle_bid(&mut self.fhe, bid, 0, path, price, &self.constants).unwrap();
            let keys = self.fhe.key_holder();
            (
                keys.reveal_u64(s.allocated).unwrap(),
                keys.reveal_u64(s.cost).unwrap(),
                keys.reveal_u64(s.refund).unwrap(),
                keys.reveal_u64(s.penalty).unwrap(),
            )
        }
    }

    #[test]
    fn test_full_partial_and_zero_fill() {
        let mut f = Fixture::new(10);

        // Ahead of the marginal bid
        let bid = f.bid(true, 20, 7, 0);
        assert_eq!(f.settle(&bid, ClearingPath::SortingNetwork, 15), (7, 105, 35 + 50, 0));

        // Marginal bid
        let bid = f.bid(true, 15, 7, 7);
        assert_eq!(f.settle(&bid, ClearingPath::SortingNetwork, 15), (3, 45, 60 + 50, 0));

        // Behind the marginal bid
        let bid = f.bid(true, 12, 4, 14);
        assert_eq!(f.settle(&bid, ClearingPath::CumulativeDemand, 15), (0, 0, 48 + 50, 0));
    }

    #[test]
    fn test_invalid_bid_forfeits_escrow() {
        let mut f = Fixture::new(10);
        let bid = f.bid(false, 1, 3, 0);
        assert_eq!(f.settle(&bid, ClearingPath::SortingNetwork, 1), (0, 0, 0, 53));
        assert_eq!(f.settle(&bid, ClearingPath::MinPrice, 1), (0, 0, 0, 53));
    }

    #[test]
    fn test_min_price_fills_in_full() {
        let mut f = Fixture::new(20);
        let bid = f.bid(true, 5, 3, 99);
        assert_eq!(f.settle(&bid, ClearingPath::MinPrice, 2), (3, 6, 15 + 50 - 6, 0));
    }

    #[test]
    fn test_refund_never_wraps() {
        let mut f = Fixture::new(10);
        // Escrow of 2 × 3 + 50 cannot cover 10 units at 100
        let mut bid = f.bid(true, 2, 3, 0);
        bid.e_effective_quantity = f.fhe.trivial_encrypt(10);
        assert_eq!(f.settle(&bid, ClearingPath::SortingNetwork, 100), (10, 1_000, 0, 0));
    }

    #[test]
    fn test_unranked_bid_rejected() {
        let mut f = Fixture::new(10);
        let mut bid = f.bid(true, 5, 3, 0);
        bid.e_cumulative_demand_before = None;
        let err = settle_bid(&mut f.fhe, &bid, 4, ClearingPath::SortingNetwork, 5, &f.constants)
            .unwrap_err();
        assert_eq!(err, ClearingError::BidNotRanked(4));
    }

    #[test]
    fn test_sum() {
        let mut f = Fixture::new(10);
        let values: Vec<EncryptedU64> = (1..=4).map(|v| f.fhe.trivial_encrypt(v)).collect();
        let total = sum(&mut f.fhe, f.constants.zero, values).unwrap();
        assert_eq!(f.fhe.key_holder().reveal_u64(total).unwrap(), 10);
    }
}

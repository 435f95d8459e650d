//! Rank-and-clear strategies.
//!
//! Once demand has been compared to supply, exactly one strategy runs for the
//! rest of the auction. Each strategy splits its work into steps that the
//! owner drives in batches, and ends by producing the encrypted settlement
//! price.
//!
//! All comparisons run on ciphertexts and every step performs the same
//! operations whatever the bid contents are. Ties in price rank the earlier
//! submission first on every path. Quantity sums saturate at `u64::MAX`, which
//! preserves every comparison against a supply below it.

use clearing_fhe::FheOps;
use clearing_types::{ClearingPath, EncryptedBool, EncryptedU64};
use sorting_network::{apply_layer, network_layer, number_of_layers};

use crate::error::ClearingError;
use crate::handlers::HandlerResult;
use crate::state::{Bid, ClearingState, EncryptedConstants, RankingWork, Slot};

/// A resumable rank-and-clear computation.
pub trait RankAndClear: Sync {
    fn path(&self) -> ClearingPath;

    /// Number of steps needed for `bid_count` bids.
    fn total_steps(&self, bid_count: usize) -> u64;

    /// Initial scratch state, built when the strategy is selected.
    fn begin(&self, state: &ClearingState, fhe: &mut dyn FheOps) -> HandlerResult<RankingWork>;

    /// Run step `step`. Either the whole step is applied or nothing is.
    fn step(&self, state: &mut ClearingState, fhe: &mut dyn FheOps, step: u64) -> HandlerResult<()>;

    /// Write per-bid ranking outputs and return the encrypted settlement price.
    fn finish(&self, state: &mut ClearingState, fhe: &mut dyn FheOps) -> HandlerResult<EncryptedU64>;
}

/// Strategy implementing `path`.
pub fn strategy_for(path: ClearingPath) -> &'static dyn RankAndClear {
    match path {
        ClearingPath::MinPrice => &MinPriceStrategy,
        ClearingPath::SortingNetwork => &SortingNetworkStrategy,
        ClearingPath::CumulativeDemand => &CumulativeDemandStrategy,
    }
}

fn work_mut(state: &mut ClearingState) -> HandlerResult<&mut RankingWork> {
    state.work.as_mut().ok_or(ClearingError::DemandNotDecided)
}

fn work_ref(state: &ClearingState) -> HandlerResult<&RankingWork> {
    state.work.as_ref().ok_or(ClearingError::DemandNotDecided)
}

/// Whether a bid with `before` units ranked ahead of it, bidding `quantity`,
/// is the one that reaches `supply`.
fn is_marginal(
    fhe: &mut dyn FheOps,
    before: EncryptedU64,
    quantity: EncryptedU64,
    supply: EncryptedU64,
) -> HandlerResult<EncryptedBool> {
    let short = fhe.lt(before, supply)?;
    let through = fhe.saturating_add(before, quantity)?;
    let reaches = fhe.ge(through, supply)?;
    Ok(fhe.and(short, reaches)?)
}

// =========================
// MIN PRICE
// =========================

/// Demand within supply: every valid bid is filled, at the lowest valid price.
pub struct MinPriceStrategy;

impl RankAndClear for MinPriceStrategy {
    fn path(&self) -> ClearingPath {
        ClearingPath::MinPrice
    }

    fn total_steps(&self, bid_count: usize) -> u64 {
        bid_count as u64
    }

    fn begin(&self, state: &ClearingState, fhe: &mut dyn FheOps) -> HandlerResult<RankingWork> {
        Ok(RankingWork {
            slots: Vec::new(),
            accumulator: state.constants.max,
            seen_valid: fhe.trivial_encrypt_bool(false),
        })
    }

    fn step(&self, state: &mut ClearingState, fhe: &mut dyn FheOps, step: u64) -> HandlerResult<()> {
        let bid = &state.bids[step as usize];
        let max = state.constants.max;
        let work = work_ref(state)?;
        let (running, seen) = (work.accumulator, work.seen_valid);

        // Invalid bids compete with the sentinel, never with their price
        let candidate = fhe.select(bid.e_valid, bid.e_price, max)?;
        let next = fhe.min(running, candidate)?;
        let seen = fhe.or(seen, bid.e_valid)?;

        let work = work_mut(state)?;
        work.accumulator = next;
        work.seen_valid = seen;
        Ok(())
    }

    fn finish(&self, state: &mut ClearingState, fhe: &mut dyn FheOps) -> HandlerResult<EncryptedU64> {
        let work = work_ref(state)?;
        Ok(fhe.select(work.seen_valid, work.accumulator, state.constants.zero)?)
    }
}

// =========================
// SORTING NETWORK
// =========================

/// Demand over supply: full oblivious sort.
///
/// Steps `0..L` apply the network layers ordering slots by price descending
/// (submission index ascending on ties). Step `L` walks the sorted slots once,
/// recording each slot's rank and the quantity ahead of it and picking out the
/// marginal price. Steps `L+1..=2L` apply the same layers keyed on submission
/// index, returning every slot to its bid's position.
pub struct SortingNetworkStrategy;

impl SortingNetworkStrategy {
    fn exchange(
        fhe: &mut dyn FheOps,
        swap: EncryptedBool,
        a: &Slot,
        b: &Slot,
    ) -> HandlerResult<(Slot, Slot)> {
        let mut pick = |x: EncryptedU64, y: EncryptedU64| -> HandlerResult<(EncryptedU64, EncryptedU64)> {
            Ok((fhe.select(swap, y, x)?, fhe.select(swap, x, y)?))
        };
        let (price_a, price_b) = pick(a.price, b.price)?;
        let (quantity_a, quantity_b) = pick(a.quantity, b.quantity)?;
        let (origin_a, origin_b) = pick(a.origin, b.origin)?;
        let (cumulative_a, cumulative_b) = pick(a.cumulative_before, b.cumulative_before)?;
        let (rank_a, rank_b) = pick(a.rank, b.rank)?;
        Ok((
            Slot {
                price: price_a,
                quantity: quantity_a,
                origin: origin_a,
                cumulative_before: cumulative_a,
                rank: rank_a,
            },
            Slot {
                price: price_b,
                quantity: quantity_b,
                origin: origin_b,
                cumulative_before: cumulative_b,
                rank: rank_b,
            },
        ))
    }

    /// Apply `layer` ordering by price descending.
    fn rank_layer(fhe: &mut dyn FheOps, slots: &mut [Slot], layer: &[(usize, usize)]) -> HandlerResult<()> {
        apply_layer(slots, layer, |a: &Slot, b: &Slot| -> HandlerResult<(Slot, Slot)> {
            // b belongs ahead of a
            let higher = fhe.gt(b.price, a.price)?;
            let same = fhe.eq(b.price, a.price)?;
            let earlier = fhe.lt(b.origin, a.origin)?;
            let tie_won = fhe.and(same, earlier)?;
            let swap = fhe.or(higher, tie_won)?;
            Self::exchange(&mut *fhe, swap, a, b)
        })
    }

    /// Apply `layer` ordering by submission index ascending.
    fn restore_layer(fhe: &mut dyn FheOps, slots: &mut [Slot], layer: &[(usize, usize)]) -> HandlerResult<()> {
        apply_layer(slots, layer, |a: &Slot, b: &Slot| -> HandlerResult<(Slot, Slot)> {
            let swap = fhe.lt(b.origin, a.origin)?;
            Self::exchange(&mut *fhe, swap, a, b)
        })
    }
}

impl RankAndClear for SortingNetworkStrategy {
    fn path(&self) -> ClearingPath {
        ClearingPath::SortingNetwork
    }

    fn total_steps(&self, bid_count: usize) -> u64 {
        2 * number_of_layers(bid_count) as u64 + 1
    }

    fn begin(&self, state: &ClearingState, fhe: &mut dyn FheOps) -> HandlerResult<RankingWork> {
        let zero = state.constants.zero;
        let slots = state
            .bids
            .iter()
            .enumerate()
            .map(|(i, bid)| Slot {
                price: bid.e_effective_price,
                quantity: bid.e_effective_quantity,
                origin: fhe.trivial_encrypt(i as u64),
                cumulative_before: zero,
                rank: zero,
            })
            .collect();
        Ok(RankingWork {
            slots,
            accumulator: zero,
            seen_valid: fhe.trivial_encrypt_bool(false),
        })
    }

    fn step(&self, state: &mut ClearingState, fhe: &mut dyn FheOps, step: u64) -> HandlerResult<()> {
        let n = state.bids.len();
        let layers = number_of_layers(n) as u64;
        let c = state.constants;
        let work = work_ref(state)?;
        let mut slots = work.slots.clone();
        let mut accumulator = work.accumulator;

        if step < layers {
            let layer = network_layer(n, step as usize)?;
            Self::rank_layer(fhe, &mut slots, &layer)?;
        } else if step == layers {
            let mut running = c.zero;
            for (position, slot) in slots.iter_mut().enumerate() {
                let marginal = is_marginal(fhe, running, slot.quantity, c.total_supply)?;
                accumulator = fhe.select(marginal, slot.price, accumulator)?;
                slot.cumulative_before = running;
                slot.rank = fhe.trivial_encrypt(position as u64);
                running = fhe.saturating_add(running, slot.quantity)?;
            }
        } else {
            let layer = network_layer(n, (step - layers - 1) as usize)?;
            Self::restore_layer(fhe, &mut slots, &layer)?;
        }

        let work = work_mut(state)?;
        work.slots = slots;
        work.accumulator = accumulator;
        Ok(())
    }

    fn finish(&self, state: &mut ClearingState, _fhe: &mut dyn FheOps) -> HandlerResult<EncryptedU64> {
        let work = work_ref(state)?;
        let settlement = work.accumulator;
        // Slots are back in submission order
        let outputs: Vec<(EncryptedU64, EncryptedU64)> = work
            .slots
            .iter()
            .map(|slot| (slot.rank, slot.cumulative_before))
            .collect();

        for (bid, (rank, before)) in state.bids.iter_mut().zip(outputs) {
            bid.e_index = Some(rank);
            bid.e_cumulative_demand_before = Some(before);
        }
        Ok(settlement)
    }
}

// =========================
// CUMULATIVE DEMAND
// =========================

/// Demand over supply without sorting.
///
/// Step `i` compares bid `i` with every other bid: bid `j` is ahead of bid `i`
/// when its price is higher, or equal with `j < i`. Summing the quantities of
/// bids ahead gives bid `i`'s cumulative demand directly.
pub struct CumulativeDemandStrategy;

impl CumulativeDemandStrategy {
    fn ahead_of(
        fhe: &mut dyn FheOps,
        bids: &[Bid],
        j: usize,
        i: usize,
    ) -> HandlerResult<EncryptedBool> {
        let (pj, pi) = (bids[j].e_effective_price, bids[i].e_effective_price);
        // Branches on public indices only
        if j < i {
            Ok(fhe.ge(pj, pi)?)
        } else {
            Ok(fhe.gt(pj, pi)?)
        }
    }
}

impl RankAndClear for CumulativeDemandStrategy {
    fn path(&self) -> ClearingPath {
        ClearingPath::CumulativeDemand
    }

    fn total_steps(&self, bid_count: usize) -> u64 {
        bid_count as u64
    }

    fn begin(&self, state: &ClearingState, fhe: &mut dyn FheOps) -> HandlerResult<RankingWork> {
        Ok(RankingWork {
            slots: Vec::new(),
            accumulator: state.constants.zero,
            seen_valid: fhe.trivial_encrypt_bool(false),
        })
    }

    fn step(&self, state: &mut ClearingState, fhe: &mut dyn FheOps, step: u64) -> HandlerResult<()> {
        let i = step as usize;
        let EncryptedConstants {
            zero,
            one,
            total_supply,
            ..
        } = state.constants;

        let mut before = zero;
        let mut rank = zero;
        for j in (0..state.bids.len()).filter(|&j| j != i) {
            let ahead = Self::ahead_of(fhe, &state.bids, j, i)?;
            let quantity = fhe.select(ahead, state.bids[j].e_effective_quantity, zero)?;
            before = fhe.saturating_add(before, quantity)?;
            let counted = fhe.select(ahead, one, zero)?;
            rank = fhe.add(rank, counted)?;
        }

        let bid = &state.bids[i];
        let marginal = is_marginal(fhe, before, bid.e_effective_quantity, total_supply)?;
        let settlement = fhe.select(marginal, bid.e_effective_price, work_ref(state)?.accumulator)?;

        work_mut(state)?.accumulator = settlement;
        let bid = &mut state.bids[i];
        bid.e_cumulative_demand_before = Some(before);
        bid.e_index = Some(rank);
        Ok(())
    }

    fn finish(&self, state: &mut ClearingState, _fhe: &mut dyn FheOps) -> HandlerResult<EncryptedU64> {
        Ok(work_ref(state)?.accumulator)
    }
}

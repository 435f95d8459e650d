//! Batcher's odd-even merge sort for inputs beyond the hard-coded tables.
//!
//! The network is built for the next power of two and pruned to the real
//! input size. Layers left empty by pruning are dropped so layer indices stay
//! dense.

use crate::Pair;

/// All layers of the pruned odd-even merge network for `n` inputs.
pub(crate) fn odd_even_merge_layers(n: usize) -> Vec<Vec<Pair>> {
    let width = n.next_power_of_two();
    let mut layers = Vec::new();

    let mut p = 1;
    while p < width {
        let mut k = p;
        while k >= 1 {
            let mut layer = Vec::new();
            let mut j = k % p;
            while j + k < width {
                for i in 0..k.min(width - j - k) {
                    let (lo, hi) = (i + j, i + j + k);
                    // Only merge within the same block of size 2p
                    if lo / (2 * p) == hi / (2 * p) && hi < n {
                        layer.push((lo, hi));
                    }
                }
                j += 2 * k;
            }
            if !layer.is_empty() {
                layers.push(layer);
            }
            k /= 2;
        }
        p *= 2;
    }

    layers
}

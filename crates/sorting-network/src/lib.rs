//! Oblivious Sorting Network Generator
//!
//! Produces, for an input size `n`, a fixed sequence of comparator layers that
//! sorts any `n` values. The layers depend only on `n`, never on the values
//! being sorted, so applying them reveals nothing about the inputs.
//!
//! Sizes up to [`MAX_TABLE_SIZE`] use hard-coded depth-optimal networks. Larger
//! sizes use a pruned Batcher odd-even merge network, which has `O(n log² n)`
//! comparators in `O(log² n)` layers.
//!
//! Every pair `(i, j)` has `i < j`; applying it leaves the larger value at `i`.
//! Inputs therefore end up in descending order.

mod batcher;
mod tables;

use thiserror::Error;

pub use tables::MAX_TABLE_SIZE;

/// Comparator between two positions, `(i, j)` with `i < j`.
pub type Pair = (usize, usize);

/// Errors from layer lookup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("Layer {layer} out of range for {size} inputs ({layers} layers)")]
    LayerOutOfRange {
        size: usize,
        layer: usize,
        layers: usize,
    },
}

/// Number of comparator layers in the network for `size` inputs.
pub fn number_of_layers(size: usize) -> usize {
    if size <= MAX_TABLE_SIZE {
        pruned_table(size).len()
    } else {
        batcher::odd_even_merge_layers(size).len()
    }
}

/// Comparator pairs of layer `layer` for `size` inputs.
///
/// # Errors
/// Returns [`NetworkError::LayerOutOfRange`] when `layer >= number_of_layers(size)`.
pub fn network_layer(size: usize, layer: usize) -> Result<Vec<Pair>, NetworkError> {
    let mut all = layers(size);
    let count = all.len();
    if layer >= count {
        return Err(NetworkError::LayerOutOfRange {
            size,
            layer,
            layers: count,
        });
    }
    Ok(all.swap_remove(layer))
}

/// Every layer of the network for `size` inputs, in application order.
pub fn layers(size: usize) -> Vec<Vec<Pair>> {
    if size <= MAX_TABLE_SIZE {
        pruned_table(size)
    } else {
        batcher::odd_even_merge_layers(size)
    }
}

/// Apply one layer to `values`.
///
/// `compare_exchange(a, b)` must return `(larger, smaller)`; the larger value
/// is written to the lower index. Every pair in the layer is evaluated exactly
/// once regardless of the values involved.
pub fn apply_layer<T, E>(
    values: &mut [T],
    layer: &[Pair],
    mut compare_exchange: impl FnMut(&T, &T) -> Result<(T, T), E>,
) -> Result<(), E> {
    for &(i, j) in layer {
        let (hi, lo) = compare_exchange(&values[i], &values[j])?;
        values[i] = hi;
        values[j] = lo;
    }
    Ok(())
}

fn pruned_table(size: usize) -> Vec<Vec<Pair>> {
    if size < 2 {
        return Vec::new();
    }
    let Some(table) = tables::covering_table(size) else {
        return Vec::new();
    };
    table
        .iter()
        .map(|layer| {
            layer
                .iter()
                .copied()
                .filter(|&(_, j)| j < size)
                .collect::<Vec<_>>()
        })
        .filter(|layer| !layer.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    const REFERENCE_LAYERS: [usize; 17] = [0, 0, 1, 3, 3, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 9, 9];

    fn sort_with_network(values: &mut [u64]) {
        for layer in layers(values.len()) {
            apply_layer(values, &layer, |a, b| {
                Ok::<_, ()>(if a >= b { (*a, *b) } else { (*b, *a) })
            })
            .unwrap();
        }
    }

    fn is_descending(values: &[u64]) -> bool {
        values.windows(2).all(|w| w[0] >= w[1])
    }

    #[test]
    fn test_number_of_layers_reference_table() {
        for (n, expected) in REFERENCE_LAYERS.iter().enumerate() {
            assert_eq!(number_of_layers(n), *expected, "size {}", n);
        }
    }

    #[test]
    fn test_layer_count_matches_layers() {
        for n in [0, 1, 2, 7, 13, 16, 17, 31, 64, 65] {
            assert_eq!(number_of_layers(n), layers(n).len());
        }
    }

    #[test]
    fn test_known_layers() {
        assert_eq!(network_layer(2, 0).unwrap(), vec![(0, 1)]);

        let three: Vec<_> = (0..3).map(|l| network_layer(3, l).unwrap()).collect();
        assert_eq!(three, vec![vec![(0, 2)], vec![(0, 1)], vec![(1, 2)]]);

        assert_eq!(
            layers(4),
            vec![vec![(0, 2), (1, 3)], vec![(0, 1), (2, 3)], vec![(1, 2)]]
        );

        assert_eq!(
            layers(5),
            vec![
                vec![(0, 3), (1, 4)],
                vec![(0, 2), (1, 3)],
                vec![(0, 1), (2, 4)],
                vec![(1, 2), (3, 4)],
                vec![(2, 3)],
            ]
        );

        assert_eq!(
            layers(8),
            vec![
                vec![(0, 2), (1, 3), (4, 6), (5, 7)],
                vec![(0, 4), (1, 5), (2, 6), (3, 7)],
                vec![(0, 1), (2, 3), (4, 5), (6, 7)],
                vec![(2, 4), (3, 5)],
                vec![(1, 4), (3, 6)],
                vec![(1, 2), (3, 4), (5, 6)],
            ]
        );
    }

    #[test]
    fn test_layer_out_of_range() {
        assert_eq!(
            network_layer(4, 3),
            Err(NetworkError::LayerOutOfRange {
                size: 4,
                layer: 3,
                layers: 3
            })
        );
        assert!(network_layer(0, 0).is_err());
        assert!(network_layer(1, 0).is_err());
    }

    #[test]
    fn test_pairs_ordered_and_disjoint() {
        for n in 0..=40 {
            for layer in layers(n) {
                let mut used = vec![false; n];
                for (i, j) in layer {
                    assert!(i < j && j < n, "size {} pair ({}, {})", n, i, j);
                    assert!(!used[i] && !used[j], "size {} reuses a position", n);
                    used[i] = true;
                    used[j] = true;
                }
            }
        }
    }

    /// 0-1 principle: a comparator network sorts every input iff it sorts
    /// every 0/1 input.
    #[test]
    fn test_sorts_all_binary_inputs() {
        for n in 0..=18 {
            let network = layers(n);
            for bits in 0u32..(1 << n) {
                let mut values: Vec<u64> = (0..n).map(|k| ((bits >> k) & 1) as u64).collect();
                for layer in &network {
                    apply_layer(&mut values, layer, |a, b| {
                        Ok::<_, ()>((*a.max(b), *a.min(b)))
                    })
                    .unwrap();
                }
                assert!(is_descending(&values), "size {} input {:b}", n, bits);
            }
        }
    }

    #[test]
    fn test_sorts_random_permutations() {
        let mut rng = StdRng::seed_from_u64(7);
        for n in [0, 1, 2, 3, 4, 5, 8, 16, 17, 29, 32, 50, 100] {
            for _ in 0..20 {
                let mut values: Vec<u64> = (1..=n as u64).collect();
                values.shuffle(&mut rng);
                sort_with_network(&mut values);
                let expected: Vec<u64> = (1..=n as u64).rev().collect();
                assert_eq!(values, expected, "size {}", n);
            }
        }
    }

    #[test]
    fn test_sorts_with_duplicates() {
        let mut values = vec![3, 1, 3, 2, 2, 9, 1, 3, 0, 9, 4];
        sort_with_network(&mut values);
        assert_eq!(values, vec![9, 9, 4, 3, 3, 3, 2, 2, 1, 1, 0]);
    }

    #[test]
    fn test_compare_exchange_error_propagates() {
        let mut values = vec![1u64, 2];
        let result = apply_layer(&mut values, &[(0, 1)], |_, _| Err("boom"));
        assert_eq!(result, Err("boom"));
        assert_eq!(values, vec![1, 2]);
    }
}

//! Hard-coded networks for small inputs.
//!
//! Each table sorts descending under the convention of [`crate::Pair`]. Sizes
//! without their own table are served by pruning the next larger one: every
//! comparator touching a position at or beyond the input size is dropped,
//! which is sound because those positions behave as infinitely low values.

use crate::Pair;

/// 2 inputs, a single comparator.
const NETWORK_2: &[&[Pair]] = &[
    &[(0, 1)],
];

/// 4 inputs, 3 layers, 5 comparators.
const NETWORK_4: &[&[Pair]] = &[
    &[(0, 2), (1, 3)],
    &[(0, 1), (2, 3)],
    &[(1, 2)],
];

/// 5 inputs, 5 layers, 9 comparators.
const NETWORK_5: &[&[Pair]] = &[
    &[(0, 3), (1, 4)],
    &[(0, 2), (1, 3)],
    &[(0, 1), (2, 4)],
    &[(1, 2), (3, 4)],
    &[(2, 3)],
];

/// 6 inputs, 5 layers, 12 comparators.
const NETWORK_6: &[&[Pair]] = &[
    &[(0, 5), (1, 3), (2, 4)],
    &[(1, 2), (3, 4)],
    &[(0, 3), (2, 5)],
    &[(0, 1), (2, 3), (4, 5)],
    &[(1, 2), (3, 4)],
];

/// 8 inputs, 6 layers, 19 comparators.
const NETWORK_8: &[&[Pair]] = &[
    &[(0, 2), (1, 3), (4, 6), (5, 7)],
    &[(0, 4), (1, 5), (2, 6), (3, 7)],
    &[(0, 1), (2, 3), (4, 5), (6, 7)],
    &[(2, 4), (3, 5)],
    &[(1, 4), (3, 6)],
    &[(1, 2), (3, 4), (5, 6)],
];

/// 10 inputs, 7 layers, 31 comparators.
const NETWORK_10: &[&[Pair]] = &[
    &[(0, 1), (2, 5), (3, 6), (4, 7), (8, 9)],
    &[(0, 6), (1, 8), (2, 4), (3, 9), (5, 7)],
    &[(0, 2), (1, 3), (4, 5), (6, 8), (7, 9)],
    &[(0, 1), (2, 7), (3, 5), (4, 6), (8, 9)],
    &[(1, 2), (3, 4), (5, 6), (7, 8)],
    &[(1, 3), (2, 4), (5, 7), (6, 8)],
    &[(2, 3), (4, 5), (6, 7)],
];

/// 12 inputs, 8 layers, 41 comparators.
const NETWORK_12: &[&[Pair]] = &[
    &[(0, 8), (1, 7), (2, 6), (3, 11), (4, 10), (5, 9)],
    &[(0, 7), (1, 2), (3, 5), (4, 11), (6, 8), (9, 10)],
    &[(0, 1), (2, 6), (3, 4), (5, 9), (7, 8), (10, 11)],
    &[(0, 3), (1, 5), (2, 4), (6, 10), (7, 9), (8, 11)],
    &[(1, 2), (3, 6), (4, 7), (5, 8), (9, 10)],
    &[(1, 3), (2, 4), (5, 6), (7, 9), (8, 10)],
    &[(2, 3), (4, 5), (6, 7), (8, 9)],
    &[(3, 4), (5, 6), (7, 8)],
];

/// 16 inputs, 9 layers, 61 comparators.
const NETWORK_16: &[&[Pair]] = &[
    &[(0, 1), (2, 3), (4, 5), (6, 7), (8, 9), (10, 11), (12, 13), (14, 15)],
    &[(0, 2), (1, 3), (4, 6), (5, 7), (8, 10), (9, 11), (12, 14), (13, 15)],
    &[(0, 4), (1, 5), (2, 6), (3, 7), (8, 12), (9, 13), (10, 14), (11, 15)],
    &[(0, 8), (1, 9), (2, 12), (3, 13), (4, 10), (5, 11), (6, 14), (7, 15)],
    &[(1, 8), (2, 4), (3, 10), (5, 12), (6, 9), (7, 14), (11, 13)],
    &[(1, 2), (3, 9), (4, 8), (5, 10), (6, 12), (7, 11), (13, 14)],
    &[(2, 4), (3, 8), (5, 6), (7, 12), (9, 10), (11, 13)],
    &[(3, 5), (6, 8), (7, 9), (10, 12)],
    &[(3, 4), (5, 6), (7, 8), (9, 10), (11, 12)],
];

/// Sizes with a dedicated table, ascending.
const SIZES: &[(usize, &[&[Pair]])] = &[
    (2, NETWORK_2),
    (4, NETWORK_4),
    (5, NETWORK_5),
    (6, NETWORK_6),
    (8, NETWORK_8),
    (10, NETWORK_10),
    (12, NETWORK_12),
    (16, NETWORK_16),
];

/// Largest input size served from a table.
pub const MAX_TABLE_SIZE: usize = 16;

/// Smallest table covering `n` inputs.
pub(crate) fn covering_table(n: usize) -> Option<&'static [&'static [Pair]]> {
    SIZES
        .iter()
        .find(|(size, _)| *size >= n)
        .map(|(_, table)| *table)
}

//! Collection of utility functions.

pub use self::counter::*;
pub use self::drop_guard::*;
use std::ops::{Add, Div, Rem};

mod counter;
mod drop_guard;

/// Divide `x` by `y` and round up towards infinity. For example, `21/5 =  4.2` thus
/// `div_ceil(21,5) == 5`. Only defined for unsigned operands.
pub fn div_ceil<T>(x: T, y: T) -> T
where
    T: Div<Output = T> + Rem<Output = T> + Add<Output = T> + PartialEq + Copy + From<u8>,
{
    let (q, r) = (x / y, x % y);
    if r != T::from(0) {
        q + T::from(1)
    } else {
        q
    }
}

/// Split `0..n` into `parts` contiguous ranges whose lengths differ by at most one. The
/// longer ranges come last.
pub fn balanced_split(n: usize, parts: usize) -> Vec<std::ops::Range<usize>> {
    assert!(parts > 0);

    (0..parts)
        .map(|i| (i * n / parts)..((i + 1) * n / parts))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_div_ceil() {
        assert_eq!(div_ceil(0u64, 5), 0);
        assert_eq!(div_ceil(1u64, 5), 1);
        assert_eq!(div_ceil(9usize, 5), 2);
        assert_eq!(div_ceil(10usize, 5), 2);
        assert_eq!(div_ceil(11usize, 5), 3);
        assert_eq!(div_ceil(1_000_000usize, 250_000), 4);
    }

    #[test]
    fn test_balanced_split() {
        assert_eq!(balanced_split(10, 4), vec![0..2, 2..5, 5..7, 7..10]);
        assert_eq!(balanced_split(8, 4), vec![0..2, 2..4, 4..6, 6..8]);
        assert_eq!(balanced_split(3, 1), vec![0..3]);

        for n in 0..50 {
            for parts in 1..9 {
                let ranges = balanced_split(n, parts);
                assert_eq!(ranges.len(), parts);
                assert_eq!(ranges[0].start, 0);
                assert_eq!(ranges[parts - 1].end, n);

                for w in ranges.windows(2) {
                    assert_eq!(w[0].end, w[1].start);
                }
            }
        }
    }
}

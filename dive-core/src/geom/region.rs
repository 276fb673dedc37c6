use super::{row_major_strides, Dims};
use serde::{Deserialize, Serialize};
use std::cmp::{max, min};
use std::fmt::{self, Debug};
use std::iter::FusedIterator;
use std::ops::Range;

/// Axis aligned box having an arbitrary number of dimensions.
///
/// This box is defined by a [lower bound](Region::low()) (inclusive) and an
/// [upper bound](Region::high()) (exclusive) along each axis. The upper bound is exclusive to
/// allow zero-volume boxes to be defined as the lower bound equalling the upper bound.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    lo: Dims,
    hi: Dims,
}

impl Region {
    /// Returns a region having lower bounds `lo` and upper bounds `hi`.
    ///
    /// # Panics
    /// Panics if the bounds differ in length or if `lo[i] > hi[i]` for any `i`.
    pub fn from_bounds(lo: &[usize], hi: &[usize]) -> Self {
        assert_eq!(lo.len(), hi.len(), "bounds have different dimensionality");
        assert!(
            lo.iter().zip(hi).all(|(a, b)| a <= b),
            "invalid bounds {:?}..{:?}",
            lo,
            hi
        );

        Self {
            lo: Dims::from_slice(lo),
            hi: Dims::from_slice(hi),
        }
    }

    /// Returns a region having lower bounds `offset` and upper bounds `offset + extents`.
    pub fn new(offset: &[usize], extents: &[usize]) -> Self {
        let hi = offset.iter().zip(extents).map(|(a, b)| a + b).collect::<Dims>();
        Self::from_bounds(offset, &hi)
    }

    /// The region `0..shape[i]` along every axis `i`.
    pub fn from_shape(shape: &[usize]) -> Self {
        Self {
            lo: smallvec::smallvec![0; shape.len()],
            hi: Dims::from_slice(shape),
        }
    }

    pub fn ndims(&self) -> usize {
        self.lo.len()
    }

    pub fn low(&self) -> &[usize] {
        &self.lo
    }

    pub fn high(&self) -> &[usize] {
        &self.hi
    }

    /// The size along each axis.
    pub fn extents(&self) -> Dims {
        self.lo.iter().zip(&self.hi).map(|(a, b)| b - a).collect()
    }

    pub fn volume(&self) -> usize {
        self.lo.iter().zip(&self.hi).map(|(a, b)| b - a).product()
    }

    /// Returns true if this region contains no points.
    pub fn is_empty(&self) -> bool {
        self.lo.iter().zip(&self.hi).any(|(a, b)| a == b)
    }

    pub fn axis_range(&self, axis: usize) -> Range<usize> {
        self.lo[axis]..self.hi[axis]
    }

    /// Returns `true` if all points represented by `other` lie within this region.
    pub fn contains(&self, other: &Region) -> bool {
        assert_eq!(self.ndims(), other.ndims());

        (0..self.ndims()).all(|i| other.lo[i] >= self.lo[i] && other.hi[i] <= self.hi[i])
    }

    /// Returns the region representing the points which lie in the intersection of two
    /// regions, or `None` if they do not overlap.
    pub fn intersection(&self, other: &Region) -> Option<Region> {
        assert_eq!(self.ndims(), other.ndims());
        let mut lo = Dims::new();
        let mut hi = Dims::new();

        for i in 0..self.ndims() {
            let l = max(self.lo[i], other.lo[i]);
            let h = min(self.hi[i], other.hi[i]);

            if l >= h {
                return None;
            }

            lo.push(l);
            hi.push(h);
        }

        Some(Region { lo, hi })
    }

    pub fn intersects(&self, other: &Region) -> bool {
        self.intersection(other).is_some()
    }

    /// Shift this region by `+offset`.
    pub fn offset_add(&self, offset: &[usize]) -> Region {
        Region {
            lo: self.lo.iter().zip(offset).map(|(a, b)| a + b).collect(),
            hi: self.hi.iter().zip(offset).map(|(a, b)| a + b).collect(),
        }
    }

    /// Shift this region by `-offset`, e.g., to express it relative to another region's origin.
    pub fn offset_sub(&self, offset: &[usize]) -> Region {
        Region {
            lo: self.lo.iter().zip(offset).map(|(a, b)| a - b).collect(),
            hi: self.hi.iter().zip(offset).map(|(a, b)| a - b).collect(),
        }
    }

    /// Replace the bounds along `axis` by `range`, given in absolute coordinates.
    pub fn with_axis(&self, axis: usize, range: Range<usize>) -> Region {
        assert!(range.start <= range.end);
        let mut result = self.clone();
        result.lo[axis] = range.start;
        result.hi[axis] = range.end;
        result
    }

    /// Restrict `axis` to `range`, given relative to the lower bound of this region.
    ///
    /// # Panics
    /// Panics if the range does not lie within this region.
    pub fn slice_axis(&self, axis: usize, range: Range<usize>) -> Region {
        let (lo, hi) = (self.lo[axis], self.hi[axis]);
        assert!(
            range.start <= range.end && lo + range.end <= hi,
            "slice range {:?} not within region {}..{}",
            range,
            lo,
            hi
        );

        self.with_axis(axis, (lo + range.start)..(lo + range.end))
    }

    /// Iterate over the contiguous runs this region occupies within a row-major array of the
    /// given `shape`. Each item is `(element offset, element count)`, in row-major order.
    pub fn runs(&self, shape: &[usize]) -> Runs {
        assert_eq!(shape.len(), self.ndims());
        assert!(
            Region::from_shape(shape).contains(self),
            "region {:?} out of bounds for shape {:?}",
            self,
            shape
        );

        let ndims = self.ndims();
        let strides = row_major_strides(shape);

        // Trailing axes that are fully covered merge with their predecessor into one run.
        let mut outer = ndims;
        let mut run_length = 1;
        while outer > 0 {
            let axis = outer - 1;
            run_length *= self.hi[axis] - self.lo[axis];
            outer -= 1;

            if self.lo[axis] != 0 || self.hi[axis] != shape[axis] {
                break;
            }
        }

        Runs {
            lo: self.lo.clone(),
            hi: self.hi.clone(),
            index: self.lo.clone(),
            strides,
            outer,
            run_length,
            done: self.is_empty(),
        }
    }
}

impl Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;

        for i in 0..self.ndims() {
            if i > 0 {
                f.write_str(", ")?;
            }

            write!(f, "{}..{}", self.lo[i], self.hi[i])?;
        }

        f.write_str("]")
    }
}

/// Iterator returned by [`Region::runs`].
#[derive(Debug, Clone)]
pub struct Runs {
    lo: Dims,
    hi: Dims,
    index: Dims,
    strides: Dims,
    outer: usize,
    run_length: usize,
    done: bool,
}

impl Iterator for Runs {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut offset = 0;
        for axis in 0..self.index.len() {
            offset += self.index[axis] * self.strides[axis];
        }

        // Advance the odometer over the outer axes.
        self.done = true;
        for axis in (0..self.outer).rev() {
            self.index[axis] += 1;

            if self.index[axis] < self.hi[axis] {
                self.done = false;
                break;
            }

            self.index[axis] = self.lo[axis];
        }

        Some((offset, self.run_length))
    }
}

impl FusedIterator for Runs {}

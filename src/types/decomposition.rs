use crate::prelude::*;
use crate::types::{balanced_split, Dims, EngineId, Region};
use serde::{Deserialize, Serialize};
use smallvec::smallvec;
use std::cmp::Reverse;
use std::ops::Range;

/// Describes which engine owns which part of an array.
///
/// The domain is split along the distributed axes into a row-major grid of patches, and every
/// patch is owned by exactly one engine. Patches are contiguous and disjoint and their union
/// is the full domain. A replicated decomposition instead assigns the full domain to every
/// engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decomposition {
    domain: Region,
    distaxes: Dims,
    patches: Vec<(EngineId, Region)>,
    replicated: bool,
}

impl Decomposition {
    /// Block decomposition of `domain` over `engines`.
    ///
    /// Never creates empty patches for non-empty domains: an axis of length `n` is split in at
    /// most `n` parts, so trailing engines may be left without a patch.
    pub fn block(domain: &Region, distaxes: &[usize], engines: &[EngineId]) -> Self {
        assert!(!engines.is_empty(), "decomposition requires at least one engine");
        assert!(
            all(distaxes, |&axis| axis < domain.ndims()),
            "invalid distributed axes {:?} for {}-dimensional domain",
            distaxes,
            domain.ndims()
        );

        let extents = domain.extents();
        let axis_extents = distaxes.iter().map(|&axis| extents[axis]).collect::<Dims>();
        let grid = grid_shape(&axis_extents, engines.len());

        let splits = enumerate(distaxes)
            .map(|(i, &axis)| {
                let lo = domain.low()[axis];

                balanced_split(axis_extents[i], grid[i])
                    .into_iter()
                    .map(|r| (lo + r.start)..(lo + r.end))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        let regions: Vec<Region> = if splits.is_empty() {
            vec![domain.clone()]
        } else {
            splits
                .iter()
                .map(|ranges| ranges.iter())
                .multi_cartesian_product()
                .map(|ranges| apply_ranges(domain, distaxes, &ranges))
                .collect()
        };

        let patches = zip(engines.iter().copied(), regions).collect();

        Self {
            domain: domain.clone(),
            distaxes: Dims::from_slice(distaxes),
            patches,
            replicated: false,
        }
    }

    /// Every engine owns the full domain.
    pub fn replicated(domain: &Region, engines: &[EngineId]) -> Self {
        Self {
            domain: domain.clone(),
            distaxes: Dims::new(),
            patches: engines.iter().map(|&e| (e, domain.clone())).collect(),
            replicated: true,
        }
    }

    pub fn domain(&self) -> &Region {
        &self.domain
    }

    pub fn distaxes(&self) -> &[usize] {
        &self.distaxes
    }

    pub fn is_replicated(&self) -> bool {
        self.replicated
    }

    /// Owning engines in patch order.
    pub fn engines(&self) -> Vec<EngineId> {
        self.patches.iter().map(|(e, _)| *e).collect()
    }

    pub fn patches(&self) -> &[(EngineId, Region)] {
        &self.patches
    }

    pub fn patch_of(&self, engine: EngineId) -> Option<&Region> {
        self.patches
            .iter()
            .find(|(e, _)| *e == engine)
            .map(|(_, region)| region)
    }

    /// The non-empty intersections of `region` with the patches, in patch order.
    pub fn overlapping(&self, region: &Region) -> Vec<(EngineId, Region)> {
        self.patches
            .iter()
            .filter_map(|(e, patch)| Some((*e, patch.intersection(region)?)))
            .collect()
    }

    /// The decomposition of `region` obtained by clipping every patch. Engines whose patch
    /// does not overlap `region` are dropped.
    pub fn restrict(&self, region: &Region) -> Self {
        Self {
            domain: region.clone(),
            distaxes: self.distaxes.clone(),
            patches: self.overlapping(region),
            replicated: self.replicated,
        }
    }

    /// Translate all coordinates by `-offset`.
    pub fn offset_sub(&self, offset: &[usize]) -> Self {
        Self {
            domain: self.domain.offset_sub(offset),
            distaxes: self.distaxes.clone(),
            patches: self
                .patches
                .iter()
                .map(|(e, patch)| (*e, patch.offset_sub(offset)))
                .collect(),
            replicated: self.replicated,
        }
    }

    /// Returns `true` if both assign the same regions to the same engines.
    pub fn same_layout(&self, other: &Decomposition) -> bool {
        self.replicated == other.replicated && self.patches == other.patches
    }
}

fn apply_ranges(domain: &Region, distaxes: &[usize], ranges: &[&Range<usize>]) -> Region {
    let mut region = domain.clone();

    for (&axis, range) in zip(distaxes, ranges) {
        region = region.with_axis(axis, (*range).clone());
    }

    region
}

/// Number of parts along each distributed axis. The product never exceeds `engines` and a
/// non-empty axis is never split in more parts than it has elements.
fn grid_shape(extents: &[usize], engines: usize) -> Dims {
    let mut grid: Dims = smallvec![1; extents.len()];

    if let [extent] = extents {
        grid[0] = max(min(*extent, engines), 1);
        return grid;
    }

    for factor in prime_factors(engines).into_iter().rev() {
        let candidate = (0..extents.len())
            .filter(|&i| grid[i] * factor <= extents[i])
            .max_by_key(|&i| (extents[i] / (grid[i] * factor), Reverse(i)));

        if let Some(i) = candidate {
            grid[i] *= factor;
        }
    }

    grid
}

fn prime_factors(mut n: usize) -> Vec<usize> {
    let mut factors = vec![];
    let mut p = 2;

    while p * p <= n {
        while n % p == 0 {
            factors.push(p);
            n /= p;
        }

        p += 1;
    }

    if n > 1 {
        factors.push(n);
    }

    factors
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn engines(n: usize) -> Vec<EngineId> {
        (0..n).map(EngineId::new).collect()
    }

    fn assert_partition(d: &Decomposition) {
        let total: usize = d.patches().iter().map(|(_, p)| p.volume()).sum();
        assert_eq!(total, d.domain().volume());

        for (i, (a, p)) in enumerate(d.patches()) {
            assert!(d.domain().contains(p));

            for (b, q) in &d.patches()[i + 1..] {
                assert_ne!(a, b);
                assert!(!p.intersects(q));
            }
        }
    }

    #[test]
    fn test_block_1d() {
        let d = Decomposition::block(&Region::from_shape(&[10]), &[0], &engines(4));
        let ranges = d
            .patches()
            .iter()
            .map(|(_, p)| p.axis_range(0))
            .collect::<Vec<_>>();

        assert_eq!(ranges, vec![0..2, 2..5, 5..7, 7..10]);
        assert_eq!(d.engines(), engines(4));
        assert_eq!(d.patch_of(EngineId(2)), Some(&Region::from_bounds(&[5], &[7])));
        assert_partition(&d);
    }

    #[test]
    fn test_block_no_empty_patches() {
        let d = Decomposition::block(&Region::from_shape(&[3, 5]), &[0], &engines(8));
        assert_eq!(d.engines(), engines(3));
        assert!(d.patches().iter().all(|(_, p)| !p.is_empty()));
        assert_partition(&d);
    }

    #[test]
    fn test_block_2d_grid() {
        let d = Decomposition::block(&Region::from_shape(&[8, 8]), &[0, 1], &engines(4));
        assert_eq!(d.patches().len(), 4);
        assert_eq!(d.patches()[1].1, Region::from_bounds(&[0, 4], &[4, 8]));
        assert_partition(&d);

        let d = Decomposition::block(&Region::from_shape(&[12, 4]), &[0, 1], &engines(6));
        assert_eq!(d.patches().len(), 6);
        assert_eq!(d.patches()[0].1.extents().as_slice(), &[2, 4]);
        assert_partition(&d);
    }

    #[test]
    fn test_block_not_distributed() {
        let d = Decomposition::block(&Region::from_shape(&[4, 4]), &[], &engines(3));
        assert_eq!(d.engines(), engines(1));
        assert_eq!(d.patches()[0].1, Region::from_shape(&[4, 4]));
    }

    #[test]
    fn test_overlapping_and_restrict() {
        let d = Decomposition::block(&Region::from_shape(&[10, 2]), &[0], &engines(4));
        let window = Region::from_bounds(&[3, 0], &[6, 2]);

        let pieces = d.overlapping(&window);
        assert_eq!(
            pieces,
            vec![
                (EngineId(1), Region::from_bounds(&[3, 0], &[5, 2])),
                (EngineId(2), Region::from_bounds(&[5, 0], &[6, 2])),
            ]
        );

        let r = d.restrict(&window).offset_sub(window.low());
        assert_eq!(r.domain(), &Region::from_shape(&[3, 2]));
        assert_eq!(r.engines(), vec![EngineId(1), EngineId(2)]);
        assert_partition(&r);
    }

    #[test]
    fn test_same_layout() {
        let domain = Region::from_shape(&[10]);
        let a = Decomposition::block(&domain, &[0], &engines(4));
        let b = Decomposition::block(&domain, &[0], &engines(4));
        let c = Decomposition::block(&domain, &[0], &engines(3));
        let r = Decomposition::replicated(&domain, &engines(1));

        assert!(a.same_layout(&b));
        assert!(!a.same_layout(&c));
        assert!(!Decomposition::block(&domain, &[0], &engines(1)).same_layout(&r));
        assert!(r.is_replicated());
    }

    #[test]
    fn test_random_block_partitions() {
        let mut rng = SmallRng::seed_from_u64(42);

        for _ in 0..200 {
            let ndims = rng.gen_range(1..=3);
            let shape = (0..ndims).map(|_| rng.gen_range(1..20)).collect::<Vec<_>>();
            let distaxes = (0..ndims).filter(|_| rng.gen_bool(0.5)).collect::<Vec<_>>();
            let n = rng.gen_range(1..=9);

            let d = Decomposition::block(&Region::from_shape(&shape), &distaxes, &engines(n));
            assert!(d.patches().len() <= n);
            assert!(d.patches().iter().all(|(_, p)| !p.is_empty()));
            assert_partition(&d);
        }
    }
}

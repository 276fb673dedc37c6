use crate::prelude::*;
use crate::types::{Decomposition, Dims, EngineId, Region};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// One unit of a [`ChunkPlan`]: a slice of the chunked axis together with the engines that
/// hold it while the chunk is processed.
///
/// All coordinates are logical, i.e., relative to the shape shared by the arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    /// Position of this chunk along the chunked axis.
    pub index: usize,
    /// `None` if the arguments are passed through unchanged.
    pub axis: Option<usize>,
    pub range: Range<usize>,
    pub layout: Decomposition,
}

impl ChunkDescriptor {
    pub fn is_pass_through(&self) -> bool {
        self.axis.is_none()
    }

    pub fn region(&self) -> &Region {
        self.layout.domain()
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Engines holding this chunk.
    pub fn targets(&self) -> Vec<EngineId> {
        self.layout.engines()
    }
}

/// Sequence of chunks produced by [`plan`](crate::planner::plan).
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    shape: Dims,
    stride: Option<usize>,
    chunks: Vec<ChunkDescriptor>,
}

impl ChunkPlan {
    pub(crate) fn new(shape: &[usize], stride: Option<usize>, chunks: Vec<ChunkDescriptor>) -> Self {
        Self {
            shape: Dims::from_slice(shape),
            stride,
            chunks,
        }
    }

    /// Logical shape of the arguments.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Chunk length along the chunked axis, or `None` if the arguments are not chunked.
    pub fn stride(&self) -> Option<usize> {
        self.stride
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[ChunkDescriptor] {
        &self.chunks
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChunkDescriptor> {
        self.chunks.iter()
    }

    /// Reorder the chunks such that the `i`-th chunk emitted is the chunk currently at position
    /// `order[i]`.
    pub fn permute(&mut self, order: &[usize]) -> Result {
        let n = self.chunks.len();
        ensure!(
            order.len() == n && order.iter().copied().sorted().eq(0..n),
            "{:?} is not a permutation of {} chunks",
            order,
            n
        );

        let chunks = order.iter().map(|&i| self.chunks[i].clone()).collect();
        self.chunks = chunks;
        Ok(())
    }
}

impl<'a> IntoIterator for &'a ChunkPlan {
    type Item = &'a ChunkDescriptor;
    type IntoIter = std::slice::Iter<'a, ChunkDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.chunks.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn plan(n: usize) -> ChunkPlan {
        let engines = [EngineId(0)];
        let chunks = (0..n)
            .map(|index| {
                let region = Region::from_bounds(&[index * 10], &[(index + 1) * 10]);

                ChunkDescriptor {
                    index,
                    axis: Some(0),
                    range: region.axis_range(0),
                    layout: Decomposition::block(&region, &[0], &engines),
                }
            })
            .collect();

        ChunkPlan::new(&[n * 10], Some(10), chunks)
    }

    #[test]
    fn test_permute() {
        let mut p = plan(4);
        p.permute(&[2, 0, 3, 1]).unwrap();

        let indices = p.iter().map(|c| c.index).collect::<Vec<_>>();
        assert_eq!(indices, vec![2, 0, 3, 1]);
        assert_eq!(p.chunks()[0].range, 20..30);

        assert!(p.permute(&[0, 0, 1, 2]).is_err());
        assert!(p.permute(&[0, 1]).is_err());
    }
}

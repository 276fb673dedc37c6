//! Splitting of collective operations into chunks that fit the memory budget.
use crate::api::{ArrayVariant, Context, DistributedArray, FileArray};
use crate::prelude::*;
use crate::types::{
    volume, CacheConfig, ChunkDescriptor, ChunkPlan, Decomposition, Dims, EngineId,
    ExecutionError, Region,
};

/// Plan the chunks of an operation over `arrays`.
///
/// Without file-backed arguments, the plan consists of a single chunk that passes the arguments
/// through unchanged. Otherwise the arguments are sliced along the first distributed axis of
/// the first file-backed argument such that every chunk of the file-backed arguments fits the
/// budget of [`CacheConfig`]. Arrays without elements yield an empty plan.
pub fn plan(ctx: &Context, arrays: &[&dyn DistributedArray]) -> Result<ChunkPlan> {
    let variants = variants_of(ctx, arrays)?;
    plan_variants(ctx.engines(), ctx.cache_config(), &variants)
}

/// Engines that participate in an operation over `arrays`: the owners of the first argument
/// if it is in memory, otherwise the whole pool.
pub fn targets_for(ctx: &Context, arrays: &[&dyn DistributedArray]) -> Result<Vec<EngineId>> {
    let variants = variants_of(ctx, arrays)?;
    let first = variants.first().ok_or(ExecutionError::EmptyArguments)?;

    Ok(match first {
        ArrayVariant::InMemory(array) => array.logical_layout().engines(),
        ArrayVariant::FileBacked(_) | ArrayVariant::Cloned(_) => ctx.engines().to_vec(),
    })
}

/// The variants of `arrays`, which must all belong to `ctx`.
pub(crate) fn variants_of<'a>(
    ctx: &Context,
    arrays: &[&'a dyn DistributedArray],
) -> Result<Vec<ArrayVariant<'a>>> {
    arrays
        .iter()
        .map(|array| {
            ensure!(array.context().same_as(ctx), ExecutionError::ForeignArray);
            Ok(array.variant())
        })
        .collect()
}

pub(crate) fn plan_variants(
    pool: &[EngineId],
    config: &CacheConfig,
    arrays: &[ArrayVariant<'_>],
) -> Result<ChunkPlan> {
    let shape = check_arguments(arrays)?;
    let first = arrays[0];

    if volume(&shape) == 0 {
        debug!("arguments of shape {:?} are empty, no chunks", shape);
        return Ok(ChunkPlan::new(&shape, None, vec![]));
    }

    let governing = arrays.iter().find_map(|array| match array {
        ArrayVariant::FileBacked(array) => Some(*array),
        _ => None,
    });

    let governing = match governing {
        Some(array) => array,
        None => {
            let layout = match first {
                ArrayVariant::InMemory(array) => array.logical_layout(),
                _ => Decomposition::replicated(&Region::from_shape(&shape), pool),
            };

            let range = match shape.first() {
                Some(&n) => 0..n,
                None => 0..1,
            };

            let chunk = ChunkDescriptor {
                index: 0,
                axis: None,
                range,
                layout,
            };

            return Ok(ChunkPlan::new(&shape, None, vec![chunk]));
        }
    };

    let (axis, stride) = chunk_stride(pool, config, &shape, governing, arrays)?;
    let length = shape[axis];
    let domain = Region::from_shape(&shape);

    let chunks = (0..length)
        .step_by(stride)
        .enumerate()
        .map(|(index, start)| {
            let range = start..min(start + stride, length);
            let region = domain.with_axis(axis, range.clone());

            let layout = match first {
                ArrayVariant::InMemory(array) => array.logical_layout().restrict(&region),
                _ => Decomposition::block(&region, governing.distaxes(), pool),
            };

            ChunkDescriptor {
                index,
                axis: Some(axis),
                range,
                layout,
            }
        })
        .collect::<Vec<_>>();

    debug!(
        "planned {} chunks of {} along axis {} of {:?}",
        chunks.len(),
        stride,
        axis,
        shape
    );

    Ok(ChunkPlan::new(&shape, Some(stride), chunks))
}

/// Returns the chunked axis and the number of indices along it per chunk.
fn chunk_stride(
    pool: &[EngineId],
    config: &CacheConfig,
    shape: &[usize],
    governing: &FileArray,
    arrays: &[ArrayVariant<'_>],
) -> Result<(usize, usize)> {
    let axis = *governing
        .distaxes()
        .first()
        .ok_or_else(|| anyhow!("file-backed array has no distributed axis"))?;

    // Bytes of one index along the chunked axis, over all file-backed arguments.
    let elements_per_row = volume(shape) / shape[axis];
    let row_bytes: usize = arrays
        .iter()
        .filter_map(|array| match array {
            ArrayVariant::FileBacked(array) => {
                Some(array.data_type().size_in_bytes() * elements_per_row)
            }
            _ => None,
        })
        .sum();

    let budget = config.budget();
    let mut per_engine = budget / (pool.len() * row_bytes);

    if per_engine == 0 {
        warn!(
            "rows of {} bytes exceed the chunk budget of {} bytes on {} engines, \
             using one row per engine",
            row_bytes,
            budget,
            pool.len()
        );
        per_engine = 1;
    }

    Ok((axis, per_engine * pool.len()))
}

/// Returns the logical shape shared by the non-cloned arguments.
fn check_arguments(arrays: &[ArrayVariant<'_>]) -> Result<Dims> {
    let first = arrays.first().ok_or(ExecutionError::EmptyArguments)?;
    let mut reference: Option<(&[usize], &[usize])> = None;

    for array in arrays {
        let (shape, distaxes) = match array {
            ArrayVariant::Cloned(_) => continue,
            ArrayVariant::InMemory(a) => (a.shape(), a.distaxes()),
            ArrayVariant::FileBacked(a) => (a.shape(), a.distaxes()),
        };

        let (expected_shape, expected_distaxes) = match reference {
            Some(r) => r,
            None => {
                reference = Some((shape, distaxes));
                continue;
            }
        };

        if shape != expected_shape {
            bail!(ExecutionError::ShapeMismatch {
                expected: Dims::from_slice(expected_shape),
                found: Dims::from_slice(shape),
            });
        }

        if distaxes != expected_distaxes {
            bail!(ExecutionError::DistAxisMismatch {
                expected: Dims::from_slice(expected_distaxes),
                found: Dims::from_slice(distaxes),
            });
        }
    }

    let shape = match reference {
        Some((shape, _)) => shape,
        None => match first {
            ArrayVariant::Cloned(a) => a.shape(),
            ArrayVariant::InMemory(a) => a.shape(),
            ArrayVariant::FileBacked(a) => a.shape(),
        },
    };

    Ok(Dims::from_slice(shape))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::testing::CountingDataset;
    use crate::types::{ClusterConfig, Config, DataType, EngineId, LocalArray, ReductionFunction};
    use std::sync::Arc;

    fn context(engines: usize, available_memory: usize) -> Context {
        let cache = CacheConfig::new(1.0, available_memory);
        Context::new(Config::new(ClusterConfig::new(engines), cache)).unwrap()
    }

    fn file_array(ctx: &Context, shape: &[usize], distaxes: &[usize]) -> FileArray {
        let dataset = CountingDataset::new(LocalArray::zeros(shape, DataType::F64));
        ctx.open_dataset(Arc::new(dataset), distaxes).unwrap()
    }

    fn downcast(err: Error) -> ExecutionError {
        err.downcast::<ExecutionError>().unwrap()
    }

    #[test]
    fn test_pass_through() {
        let ctx = context(4, 1000);
        let a = ctx.zeros(&[10, 3], DataType::F64, &[0]).unwrap();
        let b = ctx.zeros(&[10, 3], DataType::F64, &[0]).unwrap();
        let c = ctx.cloned_full(&[5], 1.0f64.into()).unwrap();

        let plan = plan(&ctx, &[&a, &b, &c]).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.stride(), None);

        let chunk = &plan.chunks()[0];
        assert!(chunk.is_pass_through());
        assert_eq!(chunk.range, 0..10);
        assert_eq!(chunk.layout, a.logical_layout());
        assert_eq!(chunk.targets(), ctx.engines());
    }

    #[test]
    fn test_pass_through_cloned_first() {
        let ctx = context(3, 1000);
        let c = ctx.cloned_full(&[], 1u8.into()).unwrap();

        let plan = plan(&ctx, &[&c]).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.chunks()[0].range, 0..1);
        assert!(plan.chunks()[0].layout.is_replicated());
    }

    #[test]
    fn test_chunks_partition_axis() {
        // 4 engines and 8 bytes per row: 5 rows per engine, stride 20.
        let ctx = context(4, 160);

        for &length in &[1, 19, 20, 21, 79, 80, 81, 1000] {
            let a = file_array(&ctx, &[length], &[0]);
            let plan = plan(&ctx, &[&a]).unwrap();

            assert_eq!(plan.stride(), Some(20));
            assert_eq!(plan.len(), dive_core::util::div_ceil(length, 20));

            let mut next = 0;
            for (i, chunk) in enumerate(plan.iter()) {
                assert_eq!(chunk.index, i);
                assert_eq!(chunk.axis, Some(0));
                assert_eq!(chunk.range.start, next);
                assert!(chunk.len() <= 20 && !chunk.is_empty());
                next = chunk.range.end;
            }

            assert_eq!(next, length);
        }
    }

    #[test]
    fn test_row_bytes_sum_over_file_arguments() {
        let ctx = context(2, 1600);
        let a = file_array(&ctx, &[100, 10], &[0]);
        let b = file_array(&ctx, &[100, 10], &[0]);
        let c = ctx.zeros(&[100, 10], DataType::F64, &[0]).unwrap();

        // Two file-backed arguments of 80 bytes per row: 5 rows per engine.
        let plan = plan(&ctx, &[&a, &b, &c]).unwrap();
        assert_eq!(plan.stride(), Some(10));
        assert_eq!(plan.len(), 10);

        // The in-memory first argument lends its layout.
        let plan = super::plan(&ctx, &[&c, &a]).unwrap();
        assert_eq!(plan.stride(), Some(20));
        let chunk = &plan.chunks()[0];
        assert_eq!(chunk.targets(), vec![EngineId(0)]);
        assert_eq!(chunk.region(), &Region::from_bounds(&[0, 0], &[20, 10]));
    }

    #[test]
    fn test_degenerate_budget() {
        let ctx = context(4, 10);
        let a = file_array(&ctx, &[10, 4], &[0]);

        let plan = plan(&ctx, &[&a]).unwrap();
        assert_eq!(plan.stride(), Some(4));
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn test_one_million_elements() {
        let ctx = context(4, 2_000_000);
        let a = file_array(&ctx, &[1_000_000], &[0]);

        let plan = plan(&ctx, &[&a]).unwrap();
        assert_eq!(plan.len(), 4);

        for (i, chunk) in enumerate(plan.iter()) {
            assert_eq!(chunk.range, (i * 250_000)..((i + 1) * 250_000));
            assert_eq!(chunk.targets(), ctx.engines());

            let lengths = chunk
                .layout
                .patches()
                .iter()
                .map(|(_, p)| p.volume())
                .collect::<Vec<_>>();
            assert_eq!(lengths, vec![62_500; 4]);
        }
    }

    #[test]
    fn test_empty_arrays() {
        let ctx = context(2, 1000);
        let a = file_array(&ctx, &[0, 3], &[0]);
        let b = ctx.zeros(&[0, 3], DataType::F64, &[0]).unwrap();

        assert!(plan(&ctx, &[&a]).unwrap().is_empty());
        assert!(plan(&ctx, &[&b]).unwrap().is_empty());
    }

    #[test]
    fn test_preconditions() {
        let ctx = context(2, 1000);
        let a = ctx.zeros(&[4, 4], DataType::F64, &[0]).unwrap();
        let b = ctx.zeros(&[4, 5], DataType::F64, &[0]).unwrap();
        let c = ctx.zeros(&[4, 4], DataType::F64, &[1]).unwrap();
        let d = ctx.cloned_full(&[7], 0.0f64.into()).unwrap();

        assert!(matches!(
            downcast(plan(&ctx, &[]).unwrap_err()),
            ExecutionError::EmptyArguments
        ));
        assert!(matches!(
            downcast(plan(&ctx, &[&a, &b]).unwrap_err()),
            ExecutionError::ShapeMismatch { .. }
        ));
        assert!(matches!(
            downcast(plan(&ctx, &[&a, &c]).unwrap_err()),
            ExecutionError::DistAxisMismatch { .. }
        ));
        assert!(plan(&ctx, &[&d, &a]).is_ok());
        assert!(matches!(
            downcast(targets_for(&ctx, &[]).unwrap_err()),
            ExecutionError::EmptyArguments
        ));

        let other = context(2, 1000);
        let e = other.zeros(&[4, 4], DataType::F64, &[0]).unwrap();
        assert!(matches!(
            downcast(plan(&ctx, &[&a, &e]).unwrap_err()),
            ExecutionError::ForeignArray
        ));
        let sum = crate::executor::reduce(&ctx, &e, ReductionFunction::Sum);
        assert!(matches!(downcast(sum.unwrap_err()), ExecutionError::ForeignArray));
    }

    #[test]
    fn test_targets_for() {
        let ctx = context(4, 1000);
        let a = ctx.zeros(&[2], DataType::F64, &[0]).unwrap();
        let f = file_array(&ctx, &[2], &[0]);

        assert_eq!(targets_for(&ctx, &[&a]).unwrap(), vec![EngineId(0), EngineId(1)]);
        assert_eq!(targets_for(&ctx, &[&f, &a]).unwrap(), ctx.engines());
    }

    #[test]
    fn test_permute() {
        let ctx = context(2, 16);
        let a = file_array(&ctx, &[6], &[0]);

        let mut plan = plan(&ctx, &[&a]).unwrap();
        assert_eq!(plan.len(), 3);

        plan.permute(&[2, 0, 1]).unwrap();
        let starts = plan.iter().map(|c| c.range.start).collect::<Vec<_>>();
        assert_eq!(starts, vec![4, 0, 2]);
        assert!(plan.permute(&[0, 0, 1]).is_err());
    }
}

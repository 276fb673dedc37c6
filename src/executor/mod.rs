//! Collective operations over distributed arrays: `map`, `reduce` and `map_reduce`.
//!
//! Every operation is planned into chunks which are executed one after the other. For each
//! chunk, the arguments are materialized on the engines of the chunk, the engine target list
//! is narrowed to those engines, the user function runs on all of them, and the chunk is left
//! again. The target list is restored on every exit path.
use dive_core::util::DropGuard;
use dive_memops::host_combine;
use std::sync::Arc;

use crate::api::{ArrayVariant, Context, DistributedArray};
use crate::cache::{leave, materialize, write_back, Access, BoundChunk};
use crate::engine::{Kwargs, MapFn, MapReduceFn, Request, Response};
use crate::planner::{plan_variants, targets_for, variants_of};
use crate::prelude::*;
use crate::types::{
    ChunkDescriptor, ChunkPlan, DataValue, EngineId, ExecutionError, LocalArrayId, Reduction,
    ReductionFunction,
};

/// Apply `fun` to the local arrays of `arrays` on every engine, chunk by chunk. Changes made
/// by `fun` to in-memory arguments are kept.
pub fn map(ctx: &Context, fun: MapFn, arrays: &[&dyn DistributedArray], kwargs: Kwargs) -> Result {
    let variants = variants_of(ctx, arrays)?;
    let plan = plan_variants(ctx.engines(), ctx.cache_config(), &variants)?;
    let kwargs = Arc::new(kwargs);

    debug!(
        "map over {} arguments in {} chunks on {:?}",
        arrays.len(),
        plan.len(),
        targets_for(ctx, arrays)?
    );

    for chunk in &plan {
        run_chunk(ctx, &variants, chunk, Access::ReadWrite, |bound| {
            ctx.view().apply(|engine| Request::Map {
                fun: Arc::clone(&fun),
                args: bound.args_on(engine),
                kwargs: Arc::clone(&kwargs),
            })?;

            write_back(ctx, bound)
        })?;
    }

    Ok(())
}

/// Reduce all elements of `array` using `fun`.
pub fn reduce(
    ctx: &Context,
    array: &dyn DistributedArray,
    fun: ReductionFunction,
) -> Result<DataValue> {
    let variants = variants_of(ctx, &[array])?;
    let plan = plan_variants(ctx.engines(), ctx.cache_config(), &variants)?;
    reduce_planned(ctx, array, fun, &plan)
}

/// [`reduce`] following the given plan.
pub fn reduce_planned(
    ctx: &Context,
    array: &dyn DistributedArray,
    fun: ReductionFunction,
    plan: &ChunkPlan,
) -> Result<DataValue> {
    let dtype = array.data_type();
    let reduction =
        Reduction::new(fun, dtype).ok_or(ExecutionError::UnsupportedReduction { fun, dtype })?;
    let variants = variants_of(ctx, &[array])?;

    let mut result = None;
    for chunk in plan {
        let value = run_chunk(ctx, &variants, chunk, Access::ReadOnly, |bound| {
            let responses = call_targets(ctx, bound, |_, args| {
                Ok(Request::Reduce {
                    id: first_argument(args)?,
                    reduction,
                })
            })?;

            fold_responses(fun, responses)
        })?;

        trace!("chunk {} of reduction: {:?}", chunk.index, value);
        result = combine(fun, result, value)?;
    }

    result.ok_or_else(|| ExecutionError::EmptyReduction.into())
}

/// Apply `fun` on every engine and reduce the arrays it returns using `combine`.
pub fn map_reduce(
    ctx: &Context,
    fun: MapReduceFn,
    combine: ReductionFunction,
    arrays: &[&dyn DistributedArray],
    kwargs: Kwargs,
) -> Result<DataValue> {
    let variants = variants_of(ctx, arrays)?;
    let plan = plan_variants(ctx.engines(), ctx.cache_config(), &variants)?;
    map_reduce_planned(ctx, fun, combine, arrays, kwargs, &plan)
}

/// [`map_reduce`] following the given plan.
pub fn map_reduce_planned(
    ctx: &Context,
    fun: MapReduceFn,
    reduction: ReductionFunction,
    arrays: &[&dyn DistributedArray],
    kwargs: Kwargs,
    plan: &ChunkPlan,
) -> Result<DataValue> {
    let variants = variants_of(ctx, arrays)?;
    let kwargs = Arc::new(kwargs);

    let mut result = None;
    for chunk in plan {
        let value = run_chunk(ctx, &variants, chunk, Access::ReadOnly, |bound| {
            let responses = call_targets(ctx, bound, |_, args| {
                Ok(Request::MapReduce {
                    fun: Arc::clone(&fun),
                    args,
                    kwargs: Arc::clone(&kwargs),
                    reduction,
                })
            })?;

            fold_responses(reduction, responses)
        })?;

        result = combine(reduction, result, value)?;
    }

    result.ok_or_else(|| ExecutionError::EmptyReduction.into())
}

/// Bind the arguments of `chunk`, narrow the target list to its engines and run `fun`. The
/// chunk is left and the target list restored afterwards, whether `fun` succeeds or not.
fn run_chunk<T, F>(
    ctx: &Context,
    arrays: &[ArrayVariant<'_>],
    chunk: &ChunkDescriptor,
    access: Access,
    fun: F,
) -> Result<T>
where
    F: FnOnce(&BoundChunk) -> Result<T>,
{
    let bound = materialize(ctx, arrays, chunk, access)?;
    let bound = DropGuard::new(bound, |bound| leave(ctx, bound));
    let _scope = ctx.view().scope(bound.targets());

    fun(&bound)
}

/// Send one request to every engine of the target list. A replicated chunk holds the same
/// data on every engine, so only its first engine is addressed.
fn call_targets<F>(ctx: &Context, bound: &BoundChunk, mut fun: F) -> Result<Vec<Response>>
where
    F: FnMut(EngineId, Vec<LocalArrayId>) -> Result<Request>,
{
    let mut targets = ctx.view().targets();
    if bound.layout().is_replicated() {
        targets.truncate(1);
    }

    let requests = targets
        .into_iter()
        .map(|engine| Ok((engine, fun(engine, bound.args_on(engine))?)))
        .collect::<Result<Vec<_>>>()?;

    ctx.view().call(requests)
}

fn first_argument(args: Vec<LocalArrayId>) -> Result<LocalArrayId> {
    args.first()
        .copied()
        .ok_or_else(|| anyhow!("no argument bound on engine"))
}

/// Fold the per-engine values in target order. Engines without elements do not contribute.
fn fold_responses(fun: ReductionFunction, responses: Vec<Response>) -> Result<Option<DataValue>> {
    let mut result = None;

    for response in responses {
        let value = match response {
            Response::Value(value) => value,
            other => bail!("unexpected response: {:?}", other),
        };

        result = combine(fun, result, value)?;
    }

    Ok(result)
}

/// Combine two partial results. There is no identity element: a missing value leaves the
/// other one unchanged.
fn combine(
    fun: ReductionFunction,
    lhs: Option<DataValue>,
    rhs: Option<DataValue>,
) -> Result<Option<DataValue>> {
    let (lhs, rhs) = match (lhs, rhs) {
        (Some(lhs), Some(rhs)) => (lhs, rhs),
        (lhs, rhs) => return Ok(lhs.or(rhs)),
    };

    let (expected, found) = (lhs.data_type(), rhs.data_type());
    if expected != found {
        bail!(ExecutionError::DataTypeMismatch { expected, found });
    }

    let reduction = Reduction::new(fun, expected).ok_or(ExecutionError::UnsupportedReduction {
        fun,
        dtype: expected,
    })?;

    Ok(Some(host_combine(reduction, lhs, rhs)?))
}

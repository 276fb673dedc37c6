use rayon::prelude::*;

use crate::api::{ArrayVariant, Context, DistributedArray, FileArray};
use crate::cache::{realign, CacheKey, Realigned};
use crate::engine::Request;
use crate::prelude::*;
use crate::types::{ChunkDescriptor, Decomposition, EngineId, ExecutionError, LocalArrayId, Region};

/// How the user function accesses the arguments of a chunk.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Access {
    ReadOnly,
    /// Arguments may be mutated: realigned data is written back and file-backed regions are
    /// not kept in the cache.
    ReadWrite,
}

/// The arguments of one chunk, resident on the engines of its layout.
#[derive(Debug)]
pub(crate) struct BoundChunk {
    layout: Decomposition,
    access: Access,
    args: IndexMap<EngineId, Vec<LocalArrayId>>,
    realigned: Vec<Realigned>,
    pinned: Vec<CacheKey>,
}

impl BoundChunk {
    pub(crate) fn layout(&self) -> &Decomposition {
        &self.layout
    }

    /// Engines holding the chunk, in layout order.
    pub(crate) fn targets(&self) -> Vec<EngineId> {
        self.args.keys().copied().collect()
    }

    /// Local arrays bound to the arguments on `engine`, in argument order.
    pub(crate) fn args_on(&self, engine: EngineId) -> Vec<LocalArrayId> {
        self.args.get(&engine).cloned().unwrap_or_default()
    }
}

/// Make the arguments of `chunk` resident on the engines of its layout.
///
/// On failure, everything that was already bound is released again.
pub(crate) fn materialize(
    ctx: &Context,
    arrays: &[ArrayVariant<'_>],
    chunk: &ChunkDescriptor,
    access: Access,
) -> Result<BoundChunk> {
    let mut bound = BoundChunk {
        layout: chunk.layout.clone(),
        access,
        args: chunk
            .layout
            .engines()
            .into_iter()
            .map(|e| (e, Vec::with_capacity(arrays.len())))
            .collect(),
        realigned: vec![],
        pinned: vec![],
    };

    trace!(
        "materializing chunk {} ({:?}) on {} engines",
        chunk.index,
        chunk.region(),
        bound.args.len()
    );

    match bind_arguments(ctx, arrays, chunk, &mut bound) {
        Ok(()) => Ok(bound),
        Err(e) => {
            leave(ctx, bound);
            Err(e)
        }
    }
}

fn bind_arguments(
    ctx: &Context,
    arrays: &[ArrayVariant<'_>],
    chunk: &ChunkDescriptor,
    bound: &mut BoundChunk,
) -> Result {
    for array in arrays {
        let realigned = match array {
            ArrayVariant::InMemory(array) => realign(ctx, array.source(), &chunk.layout, true)?,
            ArrayVariant::Cloned(array) => {
                let region = Region::from_shape(array.shape());
                let layout = Decomposition::replicated(&region, &chunk.layout.engines());
                realign(ctx, array.source(), &layout, true)?
            }
            ArrayVariant::FileBacked(array) => {
                let ids = fetch(ctx, array, &chunk.layout, &mut bound.pinned)?;

                for ((_, args), id) in zip(&mut bound.args, ids) {
                    args.push(id);
                }

                continue;
            }
        };

        let result = bound.args.iter_mut().try_for_each(|(&engine, args)| -> Result {
            let id = realigned
                .local_id(engine)
                .ok_or_else(|| anyhow!("argument was not realigned onto engine {}", engine))?;
            args.push(id);
            Ok(())
        });

        bound.realigned.push(realigned);
        result?;
    }

    Ok(())
}

/// Bind the regions of a file-backed array selected by `layout`, reading the ones that are not
/// resident yet. Returns the local array per engine of `layout`.
fn fetch(
    ctx: &Context,
    array: &FileArray,
    layout: &Decomposition,
    pinned: &mut Vec<CacheKey>,
) -> Result<Vec<LocalArrayId>> {
    let dataset_id = array.dataset_id();
    let origin = array.window().low();

    let mut ids = vec![None; layout.patches().len()];
    let mut misses = vec![];
    let mut evicted = vec![];
    let mut reserved = 0;

    {
        let mut cache = ctx.cache().lock();

        for (index, (engine, patch)) in enumerate(layout.patches()) {
            let key = CacheKey {
                dataset: dataset_id,
                engine: *engine,
                region: patch.offset_add(origin),
            };

            match cache.acquire(&key) {
                Some(id) => {
                    ids[index] = Some(id);
                    pinned.push(key);
                }
                None => misses.push((index, key)),
            }
        }

        if !misses.is_empty() {
            let elem_size = array.data_type().size_in_bytes();
            reserved = misses
                .iter()
                .map(|(_, key)| key.region.volume() * elem_size)
                .sum();
            evicted = cache.reserve(reserved);
        }
    }

    if !misses.is_empty() {
        let result = push_misses(ctx, array, &misses, evicted);
        let mut replaced = vec![];

        {
            let mut cache = ctx.cache().lock();
            let id = match result {
                Ok(id) => id,
                Err(e) => {
                    cache.unreserve(reserved);
                    return Err(e);
                }
            };

            let elem_size = array.data_type().size_in_bytes();
            for (index, key) in misses {
                let size = key.region.volume() * elem_size;
                replaced.extend(cache.insert(key.clone(), id, size));
                ids[index] = Some(id);
                pinned.push(key);
            }
        }

        if !replaced.is_empty() {
            ctx.view().release(replaced)?;
        }
    }

    ids.into_iter()
        .map(|id| id.ok_or_else(|| anyhow!("region of {} was not bound", dataset_id)))
        .collect()
}

/// Release the `evicted` regions, then read the `misses` from the dataset and push them to
/// their engines. Returns the local array id they were pushed under.
fn push_misses(
    ctx: &Context,
    array: &FileArray,
    misses: &[(usize, CacheKey)],
    evicted: Vec<(EngineId, LocalArrayId)>,
) -> Result<LocalArrayId> {
    let dataset_id = array.dataset_id();

    if !evicted.is_empty() {
        trace!("evicting {} cached regions", evicted.len());
        ctx.view().release(evicted)?;
    }

    debug!(
        "reading {} regions of {} onto {} engines",
        misses.len(),
        dataset_id,
        misses.iter().map(|(_, key)| key.engine).unique().count()
    );

    let arrays = misses
        .par_iter()
        .map(|(_, key)| {
            array
                .dataset()
                .read(&key.region)
                .map_err(|source| ExecutionError::Fetch {
                    dataset: dataset_id,
                    region: key.region.clone(),
                    source,
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    for ((_, key), data) in zip(misses, &arrays) {
        ensure!(
            data.shape() == &key.region.extents()[..] && data.data_type() == array.data_type(),
            "dataset {} returned {:?} of {} for region {:?}",
            dataset_id,
            data.shape(),
            data.data_type(),
            key.region
        );
    }

    let id = ctx.next_local_id();
    let requests = zip(misses, arrays)
        .map(|((_, key), array)| (key.engine, Request::Push { id, array }))
        .collect();

    if let Err(e) = ctx.view().call(requests) {
        let pushed = misses.iter().map(|(_, key)| (key.engine, id)).collect();
        if let Err(e) = ctx.view().release(pushed) {
            warn!("failed to release partially pushed regions: {}", e);
        }

        return Err(e);
    }

    Ok(id)
}

/// Copy realigned arguments back to the arrays they were taken from.
pub(crate) fn write_back(ctx: &Context, bound: &BoundChunk) -> Result {
    if bound.access != Access::ReadWrite {
        return Ok(());
    }

    for realigned in &bound.realigned {
        realigned.write_back(ctx)?;
    }

    Ok(())
}

/// Release the temporaries of a chunk and unpin its cached regions. Failures are logged
/// since the chunk is left on error paths as well.
pub(crate) fn leave(ctx: &Context, bound: BoundChunk) {
    let mut garbage = bound
        .realigned
        .iter()
        .flat_map(|r| r.temporaries())
        .collect::<Vec<_>>();

    {
        let mut cache = ctx.cache().lock();

        for key in &bound.pinned {
            cache.unpin(key);

            if bound.access == Access::ReadWrite {
                garbage.extend(cache.remove(key));
            }
        }
    }

    if let Err(e) = ctx.view().release(garbage) {
        warn!("failed to release arguments of chunk: {}", e);
    }
}

use crate::api::Context;
use crate::engine::Request;
use crate::prelude::*;
use crate::types::{DataType, Decomposition, Dims, EngineId, LocalArray, LocalArrayId, Region};

/// The distributed data of an in-memory or cloned array, as seen through its window.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ArraySource<'a> {
    pub(crate) id: LocalArrayId,
    pub(crate) dtype: DataType,
    pub(crate) decomposition: &'a Decomposition,
    pub(crate) window: &'a Region,
}

#[derive(Debug)]
enum Placement {
    /// The engine already holds exactly the requested region.
    Direct,
    /// Copy of a part of the engine's own patch, starting at `offset` within that patch.
    Local { offset: Dims },
    /// Assembled from pieces pulled from other engines. Pieces are in source coordinates.
    Assembled {
        origin: Dims,
        pieces: Vec<(EngineId, Region)>,
    },
}

/// Result of [`realign`]: for every engine of the requested layout, the local array holding
/// its part of the data.
#[derive(Debug)]
pub(crate) struct Realigned {
    src: LocalArrayId,
    tmp: LocalArrayId,
    owners: Decomposition,
    placements: Vec<(EngineId, Placement)>,
}

impl Realigned {
    pub(crate) fn local_id(&self, engine: EngineId) -> Option<LocalArrayId> {
        self.placements
            .iter()
            .find(|(e, _)| *e == engine)
            .map(|(_, placement)| match placement {
                Placement::Direct => self.src,
                _ => self.tmp,
            })
    }

    /// Identifier under which the new arrays are stored.
    pub(crate) fn temporary_id(&self) -> LocalArrayId {
        self.tmp
    }

    /// Local arrays created by [`realign`], which must be released once no longer needed.
    pub(crate) fn temporaries(&self) -> Vec<(EngineId, LocalArrayId)> {
        self.placements
            .iter()
            .filter(|(_, placement)| !matches!(placement, Placement::Direct))
            .map(|(e, _)| (*e, self.tmp))
            .collect()
    }

    /// Copy the contents of the temporaries back into the source array.
    pub(crate) fn write_back(&self, ctx: &Context) -> Result {
        let view = ctx.view();
        let mut copies = vec![];
        let mut pulls = vec![];

        for (engine, placement) in &self.placements {
            match placement {
                Placement::Direct => {}
                Placement::Local { offset } => copies.push((
                    *engine,
                    Request::CopyBlock {
                        src: self.tmp,
                        dst: self.src,
                        offset: offset.clone(),
                    },
                )),
                Placement::Assembled { origin, pieces } => {
                    pulls.push((*engine, origin, pieces));
                }
            }
        }

        view.call(copies)?;

        if pulls.is_empty() {
            return Ok(());
        }

        let arrays = view.pull_many(pulls.iter().map(|(e, _, _)| (*e, self.tmp, None)).collect())?;
        let mut writes = vec![];

        for ((_, origin, pieces), array) in zip(pulls, arrays) {
            for (owner, piece) in pieces {
                let owned = self.owned_patch(*owner)?;

                writes.push((
                    *owner,
                    Request::Write {
                        id: self.src,
                        offset: difference(piece.low(), owned.low()),
                        array: array.slice(&piece.offset_sub(origin)),
                    },
                ));
            }
        }

        view.call(writes)?;
        Ok(())
    }

    fn owned_patch(&self, engine: EngineId) -> Result<&Region> {
        self.owners
            .patch_of(engine)
            .ok_or_else(|| anyhow!("engine {} does not own a patch of {}", engine, self.src))
    }
}

fn difference(a: &[usize], b: &[usize]) -> Dims {
    zip(a, b).map(|(x, y)| x - y).collect()
}

/// Make the data of `source` available on the engines of `layout`, such that every engine
/// holds the part of the window that `layout` assigns to it.
///
/// `layout` is given in window coordinates. If `reuse` is set, engines whose patch is exactly
/// the requested region use the source array itself; otherwise every engine receives a new
/// local array.
pub(crate) fn realign(
    ctx: &Context,
    source: ArraySource<'_>,
    layout: &Decomposition,
    reuse: bool,
) -> Result<Realigned> {
    let owners = source.decomposition;
    let origin = source.window.low();
    let mut placements = Vec::with_capacity(layout.patches().len());

    for (engine, patch) in layout.patches() {
        let wanted = patch.offset_add(origin);

        let placement = match owners.patch_of(*engine) {
            Some(owned) if reuse && *owned == wanted => Placement::Direct,
            Some(owned) if owned.contains(&wanted) => Placement::Local {
                offset: difference(wanted.low(), owned.low()),
            },
            _ => {
                let mut pieces = owners.overlapping(&wanted);
                if owners.is_replicated() {
                    pieces.truncate(1);
                }

                Placement::Assembled {
                    origin: Dims::from_slice(wanted.low()),
                    pieces,
                }
            }
        };

        placements.push((*engine, placement));
    }

    let realigned = Realigned {
        src: source.id,
        tmp: ctx.next_local_id(),
        owners: owners.clone(),
        placements,
    };

    if let Err(e) = populate(ctx, &source, layout, &realigned) {
        if let Err(e) = ctx.view().release(realigned.temporaries()) {
            warn!("failed to release temporaries: {}", e);
        }

        return Err(e);
    }

    Ok(realigned)
}

fn populate(
    ctx: &Context,
    source: &ArraySource<'_>,
    layout: &Decomposition,
    realigned: &Realigned,
) -> Result {
    let view = ctx.view();
    let tmp = realigned.tmp;
    let mut slices = vec![];
    let mut pulls = vec![];
    let mut assembled = vec![];

    for ((engine, placement), (_, patch)) in zip(&realigned.placements, layout.patches()) {
        match placement {
            Placement::Direct => {}
            Placement::Local { offset } => {
                let region = Region::new(offset, &patch.extents());
                slices.push((
                    *engine,
                    Request::Slice {
                        src: source.id,
                        dst: tmp,
                        region,
                    },
                ));
            }
            Placement::Assembled { origin, pieces } => {
                for (owner, piece) in pieces {
                    let owned = realigned.owned_patch(*owner)?;
                    pulls.push((*owner, source.id, Some(piece.offset_sub(owned.low()))));
                }

                assembled.push((*engine, patch.extents(), origin, pieces));
            }
        }
    }

    view.call(slices)?;

    if assembled.is_empty() {
        return Ok(());
    }

    trace!(
        "assembling {} patches of {} from {} pieces",
        assembled.len(),
        source.id,
        pulls.len()
    );

    let mut fetched = view.pull_many(pulls)?.into_iter();
    let mut pushes = vec![];

    for (engine, extents, origin, pieces) in assembled {
        let blocks = pieces
            .iter()
            .map(|(_, piece)| difference(piece.low(), origin))
            .zip(fetched.by_ref())
            .collect::<Vec<(Dims, LocalArray)>>();

        let array = LocalArray::assemble(&extents, source.dtype, blocks)?;
        pushes.push((engine, array));
    }

    view.push(tmp, pushes)
}

use std::fmt::{self, Debug};
use std::ops::Range;
use std::sync::Arc;

use dive_memops::{host_binary, BinaryOperand, SequentialPolicy};

use crate::api::{Context, Dataset};
use crate::cache::{realign, ArraySource};
use crate::engine::{EngineOperand, Kwargs, LocalArgs, MapFn, Request};
use crate::executor;
use crate::prelude::*;
use crate::types::{
    BinaryOp, DataType, DataValue, DatasetId, Decomposition, Dims, EngineId, ExecutionError,
    LocalArray, LocalArrayId, Region, ReductionFunction,
};

/// Operations shared by all array variants.
pub trait DistributedArray: Send + Sync {
    fn context(&self) -> &Context;

    /// Logical shape, i.e., the extents of the window.
    fn shape(&self) -> &[usize];

    fn data_type(&self) -> DataType;

    /// Axes along which the array is distributed. Empty for cloned arrays.
    fn distaxes(&self) -> &[usize];

    fn variant(&self) -> ArrayVariant<'_>;

    /// View of the elements `range` along `axis`. No data is copied.
    fn slice(&self, axis: usize, range: Range<usize>) -> Result<AnyArray>;

    /// New array holding `self <op> operand`.
    fn elementwise(&self, op: BinaryOp, operand: Operand<'_>) -> Result<AnyArray>;

    fn reduce(&self, fun: ReductionFunction) -> Result<DataValue>;

    /// Copy the logical contents to the controller.
    fn gather(&self) -> Result<LocalArray>;
}

/// Borrowed view of an array, tagged by its storage.
#[derive(Debug, Clone, Copy)]
pub enum ArrayVariant<'a> {
    InMemory(&'a NdArray),
    FileBacked(&'a FileArray),
    Cloned(&'a ClonedArray),
}

/// Right-hand side of an element-wise operation.
#[derive(Clone, Copy)]
pub enum Operand<'a> {
    Scalar(DataValue),
    Array(&'a dyn DistributedArray),
}

impl Operand<'_> {
    pub fn data_type(&self) -> DataType {
        match self {
            Operand::Scalar(value) => value.data_type(),
            Operand::Array(array) => array.data_type(),
        }
    }
}

impl From<DataValue> for Operand<'_> {
    fn from(value: DataValue) -> Self {
        Operand::Scalar(value)
    }
}

impl<'a, A: DistributedArray> From<&'a A> for Operand<'a> {
    fn from(array: &'a A) -> Self {
        Operand::Array(array)
    }
}

/// Per-engine storage of an in-memory or cloned array. Released once the last handle is
/// dropped.
struct ArrayMeta {
    ctx: Context,
    id: LocalArrayId,
    decomposition: Decomposition,
    dtype: DataType,
}

impl Drop for ArrayMeta {
    fn drop(&mut self) {
        let arrays = self
            .decomposition
            .engines()
            .into_iter()
            .map(|e| (e, self.id))
            .collect();

        if let Err(e) = self.ctx.view().release(arrays) {
            warn!("failed to release {}: {}", self.id, e);
        }
    }
}

fn check_slice(shape: &[usize], axis: usize, range: &Range<usize>) -> Result {
    ensure!(
        axis < shape.len(),
        "axis {} out of bounds for shape {:?}",
        axis,
        shape
    );
    ensure!(
        range.start <= range.end && range.end <= shape[axis],
        "slice {:?} out of bounds for axis {} of length {}",
        range,
        axis,
        shape[axis]
    );

    Ok(())
}

fn check_operand(lhs: &dyn DistributedArray, operand: &Operand<'_>) -> Result {
    let (expected, found) = (lhs.data_type(), operand.data_type());
    if expected != found {
        bail!(ExecutionError::DataTypeMismatch { expected, found });
    }

    if let Operand::Array(rhs) = operand {
        if lhs.shape() != rhs.shape() {
            bail!(ExecutionError::ShapeMismatch {
                expected: Dims::from_slice(lhs.shape()),
                found: Dims::from_slice(rhs.shape()),
            });
        }
    }

    Ok(())
}

/// Array whose window is distributed over the engines that own its patches.
#[derive(Clone)]
pub struct NdArray {
    meta: Arc<ArrayMeta>,
    window: Region,
    shape: Dims,
}

impl NdArray {
    pub(crate) fn from_parts(
        ctx: &Context,
        id: LocalArrayId,
        decomposition: Decomposition,
        dtype: DataType,
    ) -> Self {
        let window = decomposition.domain().clone();

        Self {
            shape: window.extents(),
            window,
            meta: Arc::new(ArrayMeta {
                ctx: ctx.clone(),
                id,
                decomposition,
                dtype,
            }),
        }
    }

    /// Identifier of the local arrays holding the patches.
    pub fn id(&self) -> LocalArrayId {
        self.meta.id
    }

    /// Layout of the underlying storage, which may be larger than the window.
    pub fn decomposition(&self) -> &Decomposition {
        &self.meta.decomposition
    }

    pub fn window(&self) -> &Region {
        &self.window
    }

    /// Layout of the window, relative to the window's origin. Engines that hold no part of the
    /// window are left out.
    pub fn logical_layout(&self) -> Decomposition {
        self.meta
            .decomposition
            .restrict(&self.window)
            .offset_sub(self.window.low())
    }

    pub(crate) fn source(&self) -> ArraySource<'_> {
        ArraySource {
            id: self.meta.id,
            dtype: self.meta.dtype,
            decomposition: &self.meta.decomposition,
            window: &self.window,
        }
    }

    fn is_full_window(&self) -> bool {
        self.window == *self.meta.decomposition.domain()
    }

    /// Redistribute a copy of this array over `layout`, which is given relative to the window.
    fn redistribute(&self, layout: Decomposition) -> Result<NdArray> {
        ensure!(
            layout.domain() == &Region::from_shape(&self.shape),
            "layout over {:?} does not match shape {:?}",
            layout.domain(),
            self.shape
        );

        let ctx = &self.meta.ctx;
        let realigned = realign(ctx, self.source(), &layout, false)?;

        Ok(NdArray::from_parts(
            ctx,
            realigned.temporary_id(),
            layout,
            self.meta.dtype,
        ))
    }

    /// Copy of the window into new storage.
    pub fn copy(&self) -> Result<NdArray> {
        self.redistribute(self.logical_layout())
    }

    /// Copy of this array distributed like `other`.
    pub fn dist_like(&self, other: &NdArray) -> Result<NdArray> {
        ensure!(
            self.shape == other.shape,
            ExecutionError::ShapeMismatch {
                expected: other.shape.clone(),
                found: self.shape.clone(),
            }
        );

        self.redistribute(other.logical_layout())
    }

    /// Compute `self = self <op> operand` in place.
    pub fn elementwise_assign(&self, op: BinaryOp, operand: Operand<'_>) -> Result {
        check_operand(self, &operand)?;

        if self.is_full_window() {
            let operand = match operand {
                Operand::Scalar(value) => Some((EngineOperand::Scalar(value), None)),
                Operand::Array(rhs) => match rhs.variant() {
                    ArrayVariant::InMemory(rhs) if rhs.is_full_window() => {
                        if rhs.decomposition().same_layout(self.decomposition()) {
                            Some((EngineOperand::Local(rhs.id()), None))
                        } else {
                            let aligned = rhs.dist_like(self)?;
                            Some((EngineOperand::Local(aligned.id()), Some(aligned)))
                        }
                    }
                    _ => None,
                },
            };

            if let Some((operand, _keep_alive)) = operand {
                let requests = self
                    .decomposition()
                    .engines()
                    .into_iter()
                    .map(|e| {
                        let request = Request::Elementwise {
                            dst: self.id(),
                            op,
                            operand,
                        };

                        (e, request)
                    })
                    .collect();

                self.meta.ctx.view().call(requests)?;
                return Ok(());
            }
        }

        let ctx = &self.meta.ctx;
        match operand {
            Operand::Scalar(value) => {
                let fun: MapFn = Arc::new(move |args: &mut LocalArgs, _: &Kwargs| -> Result {
                    host_binary(SequentialPolicy, op, args.get_mut(0), BinaryOperand::Scalar(value))
                });

                executor::map(ctx, fun, &[self], Kwargs::default())
            }
            Operand::Array(rhs) => {
                let fun: MapFn = Arc::new(move |args: &mut LocalArgs, _: &Kwargs| -> Result {
                    let rhs = args.get(1).clone();
                    host_binary(SequentialPolicy, op, args.get_mut(0), BinaryOperand::Array(&rhs))
                });

                executor::map(ctx, fun, &[self, rhs], Kwargs::default())
            }
        }
    }
}

impl DistributedArray for NdArray {
    fn context(&self) -> &Context {
        &self.meta.ctx
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data_type(&self) -> DataType {
        self.meta.dtype
    }

    fn distaxes(&self) -> &[usize] {
        self.meta.decomposition.distaxes()
    }

    fn variant(&self) -> ArrayVariant<'_> {
        ArrayVariant::InMemory(self)
    }

    fn slice(&self, axis: usize, range: Range<usize>) -> Result<AnyArray> {
        check_slice(&self.shape, axis, &range)?;
        let window = self.window.slice_axis(axis, range);

        Ok(AnyArray::InMemory(NdArray {
            meta: Arc::clone(&self.meta),
            shape: window.extents(),
            window,
        }))
    }

    fn elementwise(&self, op: BinaryOp, operand: Operand<'_>) -> Result<AnyArray> {
        check_operand(self, &operand)?;

        let result = self.copy()?;
        result.elementwise_assign(op, operand)?;
        Ok(AnyArray::InMemory(result))
    }

    fn reduce(&self, fun: ReductionFunction) -> Result<DataValue> {
        executor::reduce(&self.meta.ctx, self, fun)
    }

    fn gather(&self) -> Result<LocalArray> {
        let decomposition = &self.meta.decomposition;
        let origin = self.window.low();
        let pieces = decomposition.overlapping(&self.window);

        let requests = pieces
            .iter()
            .map(|(engine, piece)| -> Result<_> {
                let owned = decomposition
                    .patch_of(*engine)
                    .ok_or_else(|| anyhow!("engine {} owns no patch", engine))?;

                Ok((*engine, self.meta.id, Some(piece.offset_sub(owned.low()))))
            })
            .collect::<Result<Vec<_>>>()?;

        let arrays = self.meta.ctx.view().pull_many(requests)?;
        let blocks = zip(&pieces, arrays).map(|((_, piece), array)| {
            let offset = zip(piece.low(), origin).map(|(a, b)| a - b).collect::<Dims>();
            (offset, array)
        });

        LocalArray::assemble(&self.shape, self.meta.dtype, blocks)
    }
}

impl Debug for NdArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NdArray")
            .field("id", &self.meta.id)
            .field("dtype", &self.meta.dtype)
            .field("shape", &self.shape)
            .field("window", &self.window)
            .finish()
    }
}

/// Dataset registration shared by all views of a file-backed array.
struct FileMeta {
    ctx: Context,
    id: DatasetId,
    dataset: Arc<dyn Dataset>,
}

impl Drop for FileMeta {
    fn drop(&mut self) {
        let evicted = self.ctx.cache().lock().evict_dataset(self.id);
        if evicted.is_empty() {
            return;
        }

        trace!("evicting {} cached regions of {}", evicted.len(), self.id);
        if let Err(e) = self.ctx.view().release(evicted) {
            warn!("failed to release cached regions of {}: {}", self.id, e);
        }
    }
}

/// Read-only array backed by a [`Dataset`]. Its data is brought onto the engines chunk by
/// chunk when an operation runs.
#[derive(Clone)]
pub struct FileArray {
    meta: Arc<FileMeta>,
    window: Region,
    shape: Dims,
    distaxes: Dims,
}

impl FileArray {
    pub(crate) fn from_parts(
        ctx: &Context,
        id: DatasetId,
        dataset: Arc<dyn Dataset>,
        distaxes: &[usize],
    ) -> Self {
        let window = Region::from_shape(dataset.shape());

        Self {
            shape: window.extents(),
            window,
            distaxes: Dims::from_slice(distaxes),
            meta: Arc::new(FileMeta {
                ctx: ctx.clone(),
                id,
                dataset,
            }),
        }
    }

    pub fn dataset(&self) -> &Arc<dyn Dataset> {
        &self.meta.dataset
    }

    pub fn dataset_id(&self) -> DatasetId {
        self.meta.id
    }

    /// Region of the dataset covered by this array.
    pub fn window(&self) -> &Region {
        &self.window
    }

    /// Engines currently caching regions of the dataset.
    pub fn targets_in_use(&self) -> Vec<EngineId> {
        self.meta.ctx.cache().lock().engines_of(self.meta.id)
    }
}

impl DistributedArray for FileArray {
    fn context(&self) -> &Context {
        &self.meta.ctx
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data_type(&self) -> DataType {
        self.meta.dataset.data_type()
    }

    fn distaxes(&self) -> &[usize] {
        &self.distaxes
    }

    fn variant(&self) -> ArrayVariant<'_> {
        ArrayVariant::FileBacked(self)
    }

    fn slice(&self, axis: usize, range: Range<usize>) -> Result<AnyArray> {
        check_slice(&self.shape, axis, &range)?;
        let window = self.window.slice_axis(axis, range);

        Ok(AnyArray::FileBacked(FileArray {
            meta: Arc::clone(&self.meta),
            shape: window.extents(),
            window,
            distaxes: self.distaxes.clone(),
        }))
    }

    fn elementwise(&self, _op: BinaryOp, _operand: Operand<'_>) -> Result<AnyArray> {
        bail!(ExecutionError::ReadOnly)
    }

    fn reduce(&self, fun: ReductionFunction) -> Result<DataValue> {
        executor::reduce(&self.meta.ctx, self, fun)
    }

    fn gather(&self) -> Result<LocalArray> {
        let array = self
            .meta
            .dataset
            .read(&self.window)
            .map_err(|source| ExecutionError::Fetch {
                dataset: self.meta.id,
                region: self.window.clone(),
                source,
            })?;

        Ok(array)
    }
}

impl Debug for FileArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileArray")
            .field("dataset", &self.meta.dataset)
            .field("id", &self.meta.id)
            .field("window", &self.window)
            .field("distaxes", &self.distaxes)
            .finish()
    }
}

/// Array of which every engine of the pool holds a full copy.
#[derive(Clone)]
pub struct ClonedArray {
    meta: Arc<ArrayMeta>,
    window: Region,
    shape: Dims,
}

impl ClonedArray {
    pub(crate) fn from_parts(
        ctx: &Context,
        id: LocalArrayId,
        decomposition: Decomposition,
        dtype: DataType,
    ) -> Self {
        let window = decomposition.domain().clone();

        Self {
            shape: window.extents(),
            window,
            meta: Arc::new(ArrayMeta {
                ctx: ctx.clone(),
                id,
                decomposition,
                dtype,
            }),
        }
    }

    pub fn id(&self) -> LocalArrayId {
        self.meta.id
    }

    pub fn decomposition(&self) -> &Decomposition {
        &self.meta.decomposition
    }

    pub fn window(&self) -> &Region {
        &self.window
    }

    pub(crate) fn source(&self) -> ArraySource<'_> {
        ArraySource {
            id: self.meta.id,
            dtype: self.meta.dtype,
            decomposition: &self.meta.decomposition,
            window: &self.window,
        }
    }

    /// Copy of the window into new storage on every engine.
    pub fn copy(&self) -> Result<ClonedArray> {
        let ctx = &self.meta.ctx;
        let layout = Decomposition::replicated(&Region::from_shape(&self.shape), ctx.engines());
        let realigned = realign(ctx, self.source(), &layout, false)?;

        Ok(ClonedArray::from_parts(
            ctx,
            realigned.temporary_id(),
            layout,
            self.meta.dtype,
        ))
    }
}

impl DistributedArray for ClonedArray {
    fn context(&self) -> &Context {
        &self.meta.ctx
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data_type(&self) -> DataType {
        self.meta.dtype
    }

    fn distaxes(&self) -> &[usize] {
        &[]
    }

    fn variant(&self) -> ArrayVariant<'_> {
        ArrayVariant::Cloned(self)
    }

    fn slice(&self, axis: usize, range: Range<usize>) -> Result<AnyArray> {
        check_slice(&self.shape, axis, &range)?;
        let window = self.window.slice_axis(axis, range);

        Ok(AnyArray::Cloned(ClonedArray {
            meta: Arc::clone(&self.meta),
            shape: window.extents(),
            window,
        }))
    }

    fn elementwise(&self, op: BinaryOp, operand: Operand<'_>) -> Result<AnyArray> {
        check_operand(self, &operand)?;
        let ctx = &self.meta.ctx;

        let (rhs, _keep_alive) = match operand {
            Operand::Scalar(value) => (EngineOperand::Scalar(value), None),
            Operand::Array(rhs) => match rhs.variant() {
                ArrayVariant::Cloned(rhs) => {
                    let rhs = rhs.copy()?;
                    (EngineOperand::Local(rhs.id()), Some(rhs))
                }
                _ => {
                    // The result takes the distribution of the distributed operand.
                    let layout = match rhs.variant() {
                        ArrayVariant::InMemory(rhs) => rhs.logical_layout(),
                        _ => Decomposition::block(
                            &Region::from_shape(rhs.shape()),
                            rhs.distaxes(),
                            ctx.engines(),
                        ),
                    };

                    let realigned = realign(ctx, self.source(), &layout, false)?;
                    let result =
                        NdArray::from_parts(ctx, realigned.temporary_id(), layout, self.meta.dtype);
                    result.elementwise_assign(op, operand)?;

                    return Ok(AnyArray::InMemory(result));
                }
            },
        };

        let result = self.copy()?;
        let requests = ctx
            .engines()
            .iter()
            .map(|&e| {
                let request = Request::Elementwise {
                    dst: result.id(),
                    op,
                    operand: rhs,
                };

                (e, request)
            })
            .collect();

        ctx.view().call(requests)?;
        Ok(AnyArray::Cloned(result))
    }

    fn reduce(&self, fun: ReductionFunction) -> Result<DataValue> {
        executor::reduce(&self.meta.ctx, self, fun)
    }

    fn gather(&self) -> Result<LocalArray> {
        let engine = self
            .meta
            .decomposition
            .engines()
            .first()
            .copied()
            .ok_or_else(|| anyhow!("cloned array {} has no engines", self.meta.id))?;

        self.meta
            .ctx
            .view()
            .pull(engine, self.meta.id, Some(self.window.clone()))
    }
}

impl Debug for ClonedArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClonedArray")
            .field("id", &self.meta.id)
            .field("dtype", &self.meta.dtype)
            .field("window", &self.window)
            .finish()
    }
}

/// Owned array of any variant.
#[derive(Debug, Clone)]
pub enum AnyArray {
    InMemory(NdArray),
    FileBacked(FileArray),
    Cloned(ClonedArray),
}

macro_rules! dispatch_any {
    ($array:expr, $a:ident => $body:expr) => {
        match $array {
            AnyArray::InMemory($a) => $body,
            AnyArray::FileBacked($a) => $body,
            AnyArray::Cloned($a) => $body,
        }
    };
}

impl AnyArray {
    pub fn into_in_memory(self) -> Option<NdArray> {
        match self {
            AnyArray::InMemory(array) => Some(array),
            _ => None,
        }
    }
}

impl DistributedArray for AnyArray {
    fn context(&self) -> &Context {
        dispatch_any!(self, a => a.context())
    }

    fn shape(&self) -> &[usize] {
        dispatch_any!(self, a => a.shape())
    }

    fn data_type(&self) -> DataType {
        dispatch_any!(self, a => a.data_type())
    }

    fn distaxes(&self) -> &[usize] {
        dispatch_any!(self, a => a.distaxes())
    }

    fn variant(&self) -> ArrayVariant<'_> {
        dispatch_any!(self, a => a.variant())
    }

    fn slice(&self, axis: usize, range: Range<usize>) -> Result<AnyArray> {
        dispatch_any!(self, a => a.slice(axis, range))
    }

    fn elementwise(&self, op: BinaryOp, operand: Operand<'_>) -> Result<AnyArray> {
        dispatch_any!(self, a => a.elementwise(op, operand))
    }

    fn reduce(&self, fun: ReductionFunction) -> Result<DataValue> {
        dispatch_any!(self, a => a.reduce(fun))
    }

    fn gather(&self) -> Result<LocalArray> {
        dispatch_any!(self, a => a.gather())
    }
}

impl From<NdArray> for AnyArray {
    fn from(array: NdArray) -> Self {
        AnyArray::InMemory(array)
    }
}

impl From<FileArray> for AnyArray {
    fn from(array: FileArray) -> Self {
        AnyArray::FileBacked(array)
    }
}

impl From<ClonedArray> for AnyArray {
    fn from(array: ClonedArray) -> Self {
        AnyArray::Cloned(array)
    }
}

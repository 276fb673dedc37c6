//! User-facing handles: the [`Context`], the array variants and datasets.
mod array;
mod context;
mod dataset;

pub use self::array::{AnyArray, ArrayVariant, ClonedArray, DistributedArray, FileArray, NdArray, Operand};
pub use self::context::Context;
pub use self::dataset::{Dataset, RawFileDataset};

#[cfg(test)]
pub(crate) use self::dataset::testing;

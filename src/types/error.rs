use crate::types::{DataType, DatasetId, Dims, EngineId, Region, ReductionFunction};
use std::io;
use thiserror::Error;

/// Failures of a collective operation.
///
/// Public functions return `anyhow::Error`; use `downcast_ref::<ExecutionError>()` to inspect
/// the cause.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("operation requires at least one array argument")]
    EmptyArguments,

    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch { expected: Dims, found: Dims },

    #[error("distributed axes mismatch: expected {expected:?}, found {found:?}")]
    DistAxisMismatch { expected: Dims, found: Dims },

    #[error("failed to fetch region {region:?} of {dataset}")]
    Fetch {
        dataset: DatasetId,
        region: Region,
        #[source]
        source: io::Error,
    },

    #[error("cannot reduce an array without chunks")]
    EmptyReduction,

    #[error("execution failed on engine {engine}: {message}")]
    EngineExecution { engine: EngineId, message: String },

    #[error("data type mismatch: expected {expected}, found {found}")]
    DataTypeMismatch { expected: DataType, found: DataType },

    #[error("file-backed arrays are read-only")]
    ReadOnly,

    #[error("array belongs to a different context")]
    ForeignArray,

    #[error("reduction {fun} is not supported for data type {dtype}")]
    UnsupportedReduction {
        fun: ReductionFunction,
        dtype: DataType,
    },
}

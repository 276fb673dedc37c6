use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::sync::Arc;

use crate::engine::{Kwargs, MapFn, MapReduceFn};
use crate::types::{
    BinaryOp, DataValue, Dims, LocalArray, LocalArrayId, Reduction, ReductionFunction, Region,
};

/// Operation executed by a single engine.
pub enum Request {
    /// Store a new array of `shape` filled with `value`.
    Allocate {
        id: LocalArrayId,
        shape: Dims,
        value: DataValue,
    },
    Push {
        id: LocalArrayId,
        array: LocalArray,
    },
    /// Return a copy of the array, or of the given region of it.
    Pull {
        id: LocalArrayId,
        region: Option<Region>,
    },
    /// Store a copy of `region` of `src` as `dst`.
    Slice {
        src: LocalArrayId,
        dst: LocalArrayId,
        region: Region,
    },
    Write {
        id: LocalArrayId,
        offset: Dims,
        array: LocalArray,
    },
    /// Copy all of `src` into `dst` at `offset`.
    CopyBlock {
        src: LocalArrayId,
        dst: LocalArrayId,
        offset: Dims,
    },
    Release {
        ids: Vec<LocalArrayId>,
    },
    Map {
        fun: MapFn,
        args: Vec<LocalArrayId>,
        kwargs: Arc<Kwargs>,
    },
    Reduce {
        id: LocalArrayId,
        reduction: Reduction,
    },
    MapReduce {
        fun: MapReduceFn,
        args: Vec<LocalArrayId>,
        kwargs: Arc<Kwargs>,
        reduction: ReductionFunction,
    },
    Elementwise {
        dst: LocalArrayId,
        op: BinaryOp,
        operand: EngineOperand,
    },
}

impl Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Request::*;

        match self {
            Allocate { id, shape, value } => f
                .debug_struct("Allocate")
                .field("id", id)
                .field("shape", shape)
                .field("value", value)
                .finish(),
            Push { id, array } => f
                .debug_struct("Push")
                .field("id", id)
                .field("array", array)
                .finish(),
            Pull { id, region } => f
                .debug_struct("Pull")
                .field("id", id)
                .field("region", region)
                .finish(),
            Slice { src, dst, region } => f
                .debug_struct("Slice")
                .field("src", src)
                .field("dst", dst)
                .field("region", region)
                .finish(),
            Write { id, offset, array } => f
                .debug_struct("Write")
                .field("id", id)
                .field("offset", offset)
                .field("array", array)
                .finish(),
            CopyBlock { src, dst, offset } => f
                .debug_struct("CopyBlock")
                .field("src", src)
                .field("dst", dst)
                .field("offset", offset)
                .finish(),
            Release { ids } => f.debug_struct("Release").field("ids", ids).finish(),
            Map { args, kwargs, .. } => f
                .debug_struct("Map")
                .field("args", args)
                .field("kwargs", kwargs)
                .finish(),
            Reduce { id, reduction } => f
                .debug_struct("Reduce")
                .field("id", id)
                .field("reduction", reduction)
                .finish(),
            MapReduce {
                args,
                kwargs,
                reduction,
                ..
            } => f
                .debug_struct("MapReduce")
                .field("args", args)
                .field("kwargs", kwargs)
                .field("reduction", reduction)
                .finish(),
            Elementwise { dst, op, operand } => f
                .debug_struct("Elementwise")
                .field("dst", dst)
                .field("op", op)
                .field("operand", operand)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum EngineOperand {
    Local(LocalArrayId),
    Scalar(DataValue),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Done,
    Value(Option<DataValue>),
    Array(LocalArray),
}

/// Error raised on an engine, carried back to the controller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SerializedError {
    Panic(String),
    Other(String),
}

impl fmt::Display for SerializedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializedError::Panic(msg) => write!(f, "panicked: {}", msg),
            SerializedError::Other(msg) => f.write_str(msg),
        }
    }
}

impl From<&anyhow::Error> for SerializedError {
    fn from(r: &anyhow::Error) -> Self {
        SerializedError::Other(format!("{:#}", r))
    }
}

impl From<anyhow::Error> for SerializedError {
    fn from(r: anyhow::Error) -> Self {
        (&r).into()
    }
}

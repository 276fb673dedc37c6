//! Common types used throughout the dive runtime.
mod chunk;
mod config;
mod decomposition;
mod error;

pub use dive_core::info::*;
pub use dive_core::util::{balanced_split, div_ceil};
pub use dive_core::*;
pub use dive_memops::{BinaryOp, Reduction, ReductionFunction};

pub use self::chunk::*;
pub use self::config::*;
pub use self::decomposition::*;
pub use self::error::*;

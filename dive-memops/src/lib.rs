//! Host-side memory operations on engine-resident arrays.
pub use host::elementwise::{host_binary, host_fill, BinaryOp, BinaryOperand};
pub use host::reduce::{host_combine, host_reduce};
pub use host::{Policy, RayonPolicy, SequentialPolicy};
pub use reduction::{Reduction, ReductionFunction};

mod host;
mod reduction;

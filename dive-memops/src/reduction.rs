use dive_core::DataType;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Associative and commutative operator used to collapse an array into a single value.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ReductionFunction {
    Max,
    Min,
    Sum,
    Product,
    And,
    Or,
}

impl Display for ReductionFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ReductionFunction::*;
        let name = match self {
            Max => "max",
            Min => "min",
            Sum => "sum",
            Product => "product",
            And => "bit_and",
            Or => "bit_or",
        };

        f.write_str(name)
    }
}

/// A [`ReductionFunction`] bound to the data type it operates on.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Reduction {
    fun: ReductionFunction,
    dtype: DataType,
}

impl Reduction {
    /// Returns `None` if `fun` is not defined for `dtype` (bitwise reductions on floats).
    pub fn new(fun: ReductionFunction, dtype: DataType) -> Option<Self> {
        use ReductionFunction::*;

        let supported = match fun {
            Min | Max | Sum | Product => true,
            And | Or => dtype.is_integer(),
        };

        if supported {
            Some(Self { fun, dtype })
        } else {
            None
        }
    }

    pub fn function(&self) -> ReductionFunction {
        self.fun
    }

    pub fn data_type(&self) -> DataType {
        self.dtype
    }
}

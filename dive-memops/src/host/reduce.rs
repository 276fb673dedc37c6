use crate::host::elementwise::Arith;
use crate::host::{host_fold_recur, Policy};
use crate::{Reduction, ReductionFunction};
use anyhow::{ensure, Result};
use dive_core::{DataValue, HostBuffer, LocalArray};

macro_rules! impl_reductions {
    ($reduction: expr, $base:ident, $input:tt) => {
        match $reduction.function() {
            ReductionFunction::Sum => {
                impl_reductions!(@scalars, |x, y| Arith::add(x, y), $base, $input)
            }
            ReductionFunction::Product => {
                impl_reductions!(@scalars, |x, y| Arith::mul(x, y), $base, $input)
            }
            ReductionFunction::Min => {
                impl_reductions!(@scalars, |x, y| if y < x { y } else { x }, $base, $input)
            }
            ReductionFunction::Max => {
                impl_reductions!(@scalars, |x, y| if y > x { y } else { x }, $base, $input)
            }
            ReductionFunction::And => {
                impl_reductions!(@integers, |x, y| x & y, $base, $input)
            }
            ReductionFunction::Or => {
                impl_reductions!(@integers, |x, y| x | y, $base, $input)
            }
        }
    };
    (@scalars, $combine: expr, $base:ident, $input: tt) => {
        impl_reductions!(F32 => f32, F64 => f64, I8 => i8, I16 => i16, I32 => i32, I64 => i64, U8 => u8, U16 => u16, U32 => u32, U64 => u64; $combine, $base, $input)
    };
    (@integers, $combine: expr, $base:ident, $input: tt) => {
        impl_reductions!(I8 => i8, I16 => i16, I32 => i32, I64 => i64, U8 => u8, U16 => u16, U32 => u32, U64 => u64; $combine, $base, $input)
    };
    ($($variant:ident => $ty:ident),*; $combine: expr, $base:ident, $input: tt) => {
        $base!($input, $(
            $variant => |lhs: $ty, rhs: $ty| -> $ty { ($combine)(lhs, rhs) }
        ),*)
    };
}

macro_rules! fold_buffer {
    (($policy:expr, $buffer:expr), $($variant:ident => $combine:expr),*) => {
        match $buffer {
            $(HostBuffer::$variant(data) => host_fold_recur($policy, data, &$combine).map(DataValue::from),)*
            _ => unreachable!("reduction was validated for this data type"),
        }
    };
}

macro_rules! combine_values {
    (($lhs:expr, $rhs:expr), $($variant:ident => $combine:expr),*) => {
        match ($lhs, $rhs) {
            $((DataValue::$variant(a), DataValue::$variant(b)) => DataValue::$variant(($combine)(a, b)),)*
            _ => unreachable!("reduction was validated for this data type"),
        }
    };
}

/// Collapse all elements of `array` using `reduction`. Returns `None` for an empty array since
/// reductions have no identity element here.
pub fn host_reduce(
    policy: impl Policy,
    array: &LocalArray,
    reduction: Reduction,
) -> Result<Option<DataValue>> {
    ensure!(
        array.data_type() == reduction.data_type(),
        "cannot reduce array of type {} using {} reduction over {}",
        array.data_type(),
        reduction.function(),
        reduction.data_type()
    );

    let result = impl_reductions!(reduction, fold_buffer, (policy, array.buffer()));
    Ok(result)
}

/// Combine two partial results of the same reduction.
pub fn host_combine(reduction: Reduction, lhs: DataValue, rhs: DataValue) -> Result<DataValue> {
    ensure!(
        lhs.data_type() == reduction.data_type() && rhs.data_type() == reduction.data_type(),
        "cannot combine {:?} and {:?} using {} reduction over {}",
        lhs,
        rhs,
        reduction.function(),
        reduction.data_type()
    );

    Ok(impl_reductions!(reduction, combine_values, (lhs, rhs)))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{RayonPolicy, SequentialPolicy};
    use dive_core::DataType;

    #[test]
    fn test_reduce_sum() {
        let n = 100_000;
        let array = LocalArray::from_vec(&[n], (0..n).map(|i| i as u64).collect()).unwrap();
        let reduction = Reduction::new(ReductionFunction::Sum, DataType::U64).unwrap();

        let expected = (n as u64 * (n as u64 - 1)) / 2;
        let a = host_reduce(RayonPolicy, &array, reduction).unwrap();
        let b = host_reduce(SequentialPolicy, &array, reduction).unwrap();
        assert_eq!(a, Some(DataValue::U64(expected)));
        assert_eq!(a, b);
    }

    #[test]
    fn test_reduce_float_is_deterministic() {
        let n = 70_001;
        let data = (0..n).map(|i| 1.0 / (i as f64 + 1.0)).collect();
        let array = LocalArray::from_vec(&[n], data).unwrap();
        let reduction = Reduction::new(ReductionFunction::Sum, DataType::F64).unwrap();

        let a = host_reduce(RayonPolicy, &array, reduction).unwrap();
        let b = host_reduce(SequentialPolicy, &array, reduction).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_reduce_min_max_bits() {
        let array = LocalArray::from_vec(&[2, 2], vec![5i32, -3, 9, 0]).unwrap();

        let min = Reduction::new(ReductionFunction::Min, DataType::I32).unwrap();
        let max = Reduction::new(ReductionFunction::Max, DataType::I32).unwrap();
        let or = Reduction::new(ReductionFunction::Or, DataType::I32).unwrap();

        assert_eq!(host_reduce(SequentialPolicy, &array, min).unwrap(), Some(DataValue::I32(-3)));
        assert_eq!(host_reduce(SequentialPolicy, &array, max).unwrap(), Some(DataValue::I32(9)));
        assert_eq!(
            host_reduce(SequentialPolicy, &array, or).unwrap(),
            Some(DataValue::I32(5 | -3 | 9))
        );
    }

    #[test]
    fn test_reduce_empty_and_mismatch() {
        let empty = LocalArray::zeros(&[0, 3], DataType::F32);
        let sum = Reduction::new(ReductionFunction::Sum, DataType::F32).unwrap();
        assert_eq!(host_reduce(SequentialPolicy, &empty, sum).unwrap(), None);

        let ints = LocalArray::zeros(&[3], DataType::I64);
        assert!(host_reduce(SequentialPolicy, &ints, sum).is_err());
    }

    #[test]
    fn test_combine() {
        let sum = Reduction::new(ReductionFunction::Sum, DataType::F64).unwrap();
        let value = host_combine(sum, DataValue::F64(1.5), DataValue::F64(2.0)).unwrap();
        assert_eq!(value, DataValue::F64(3.5));

        assert!(host_combine(sum, DataValue::F64(1.5), DataValue::F32(2.0)).is_err());
    }

    #[test]
    fn test_integer_overflow_wraps() {
        let array = LocalArray::from_vec(&[300], vec![1u8; 300]).unwrap();
        let sum = Reduction::new(ReductionFunction::Sum, DataType::U8).unwrap();
        assert_eq!(
            host_reduce(RayonPolicy, &array, sum).unwrap(),
            Some(DataValue::U8((300 % 256) as u8))
        );
        assert_eq!(
            host_combine(sum, DataValue::U8(200), DataValue::U8(100)).unwrap(),
            DataValue::U8(44)
        );

        let product = Reduction::new(ReductionFunction::Product, DataType::I16).unwrap();
        assert_eq!(
            host_combine(product, DataValue::I16(300), DataValue::I16(300)).unwrap(),
            DataValue::I16(300i16.wrapping_mul(300))
        );
    }
}

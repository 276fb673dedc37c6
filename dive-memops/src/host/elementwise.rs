use crate::host::{host_zip_recur, Broadcast, Policy};
use dive_core::prelude::*;
use dive_core::{dispatch_buffer_pair, CastError, DataValue, HasDataType, HostBuffer, LocalArray};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt::{self, Display};

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
}

impl Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use BinaryOp::*;
        let symbol = match self {
            Add => "+",
            Sub => "-",
            Mul => "*",
            Div => "/",
            Min => "min",
            Max => "max",
        };

        f.write_str(symbol)
    }
}

/// Right-hand side of [`host_binary`].
#[derive(Debug, Copy, Clone)]
pub enum BinaryOperand<'a> {
    Array(&'a LocalArray),
    Scalar(DataValue),
}

// Integer arithmetic wraps on overflow. Integer division by zero yields zero.
pub(crate) trait Arith: HasDataType {
    fn add(self, rhs: Self) -> Self;
    fn sub(self, rhs: Self) -> Self;
    fn mul(self, rhs: Self) -> Self;
    fn div(self, rhs: Self) -> Self;
}

macro_rules! impl_arith_integer {
    ($($ty:ident),*) => {
        $(
            impl Arith for $ty {
                fn add(self, rhs: Self) -> Self { self.wrapping_add(rhs) }
                fn sub(self, rhs: Self) -> Self { self.wrapping_sub(rhs) }
                fn mul(self, rhs: Self) -> Self { self.wrapping_mul(rhs) }
                fn div(self, rhs: Self) -> Self { self.checked_div(rhs).unwrap_or(0) }
            }
        )*
    };
}

macro_rules! impl_arith_float {
    ($($ty:ident),*) => {
        $(
            impl Arith for $ty {
                fn add(self, rhs: Self) -> Self { self + rhs }
                fn sub(self, rhs: Self) -> Self { self - rhs }
                fn mul(self, rhs: Self) -> Self { self * rhs }
                fn div(self, rhs: Self) -> Self { self / rhs }
            }
        )*
    };
}

impl_arith_integer!(i8, i16, i32, i64, u8, u16, u32, u64);
impl_arith_float!(f32, f64);

fn binary_fn<T: Arith>(op: BinaryOp) -> impl Fn(&mut T, T) + Sync {
    move |x: &mut T, y: T| {
        *x = match op {
            BinaryOp::Add => x.add(y),
            BinaryOp::Sub => x.sub(y),
            BinaryOp::Mul => x.mul(y),
            BinaryOp::Div => x.div(y),
            BinaryOp::Min => {
                if y < *x {
                    y
                } else {
                    *x
                }
            }
            BinaryOp::Max => {
                if y > *x {
                    y
                } else {
                    *x
                }
            }
        }
    }
}

fn binary_scalar<P: Policy, T: Arith>(policy: P, op: BinaryOp, dst: &mut [T], rhs: DataValue) -> Result {
    let rhs = T::try_from(rhs)?;
    host_zip_recur(policy, dst, Broadcast(rhs), &binary_fn::<T>(op));
    Ok(())
}

/// Compute `dst = dst <op> rhs` element-wise. Array operands must have the same shape and data
/// type as `dst`; scalar operands must have the same data type.
pub fn host_binary(
    policy: impl Policy,
    op: BinaryOp,
    dst: &mut LocalArray,
    rhs: BinaryOperand<'_>,
) -> Result {
    let dtype = dst.data_type();

    match rhs {
        BinaryOperand::Array(src) => {
            ensure!(
                dst.shape() == src.shape(),
                "shape mismatch for {}: {:?} and {:?}",
                op,
                dst.shape(),
                src.shape()
            );

            let found = src.data_type();
            dispatch_buffer_pair!(dst.buffer_mut(), src.buffer(), (a, b) => {
                host_zip_recur(policy, a.as_mut_slice(), b.as_slice(), &binary_fn(op));
            }, _ => bail!(CastError { expected: dtype, found }));
        }
        BinaryOperand::Scalar(value) => {
            let buffer = dst.buffer_mut();
            match buffer {
                HostBuffer::I8(data) => binary_scalar(policy, op, data, value)?,
                HostBuffer::I16(data) => binary_scalar(policy, op, data, value)?,
                HostBuffer::I32(data) => binary_scalar(policy, op, data, value)?,
                HostBuffer::I64(data) => binary_scalar(policy, op, data, value)?,
                HostBuffer::U8(data) => binary_scalar(policy, op, data, value)?,
                HostBuffer::U16(data) => binary_scalar(policy, op, data, value)?,
                HostBuffer::U32(data) => binary_scalar(policy, op, data, value)?,
                HostBuffer::U64(data) => binary_scalar(policy, op, data, value)?,
                HostBuffer::F32(data) => binary_scalar(policy, op, data, value)?,
                HostBuffer::F64(data) => binary_scalar(policy, op, data, value)?,
            }
        }
    }

    Ok(())
}

/// Overwrite every element of `dst` with `value`.
pub fn host_fill(policy: impl Policy, dst: &mut LocalArray, value: DataValue) -> Result {
    fn fill<P: Policy, T: HasDataType>(policy: P, dst: &mut [T], value: DataValue) -> Result {
        let value = T::try_from(value)?;
        host_zip_recur(policy, dst, Broadcast(value), &|x: &mut T, y: T| *x = y);
        Ok(())
    }

    match dst.buffer_mut() {
        HostBuffer::I8(data) => fill(policy, data, value),
        HostBuffer::I16(data) => fill(policy, data, value),
        HostBuffer::I32(data) => fill(policy, data, value),
        HostBuffer::I64(data) => fill(policy, data, value),
        HostBuffer::U8(data) => fill(policy, data, value),
        HostBuffer::U16(data) => fill(policy, data, value),
        HostBuffer::U32(data) => fill(policy, data, value),
        HostBuffer::U64(data) => fill(policy, data, value),
        HostBuffer::F32(data) => fill(policy, data, value),
        HostBuffer::F64(data) => fill(policy, data, value),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{RayonPolicy, SequentialPolicy};
    use dive_core::DataType;

    #[test]
    fn test_binary_array() {
        let n = 50_000;
        let mut a = LocalArray::from_vec(&[n], (0..n).map(|i| i as f32).collect()).unwrap();
        let b = LocalArray::full(&[n], DataValue::F32(2.0));

        host_binary(RayonPolicy, BinaryOp::Mul, &mut a, BinaryOperand::Array(&b)).unwrap();
        let data = a.as_slice::<f32>().unwrap();
        assert_eq!(data[0], 0.0);
        assert_eq!(data[n - 1], 2.0 * (n - 1) as f32);
    }

    #[test]
    fn test_binary_scalar() {
        let mut a = LocalArray::from_vec(&[2, 2], vec![1i64, 5, -2, 8]).unwrap();

        host_binary(SequentialPolicy, BinaryOp::Max, &mut a, BinaryOperand::Scalar(DataValue::I64(2)))
            .unwrap();
        assert_eq!(a.as_slice::<i64>().unwrap(), &[2, 5, 2, 8]);

        host_binary(SequentialPolicy, BinaryOp::Div, &mut a, BinaryOperand::Scalar(DataValue::I64(0)))
            .unwrap();
        assert_eq!(a.as_slice::<i64>().unwrap(), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_binary_mismatch() {
        let mut a = LocalArray::zeros(&[4], DataType::F64);
        let b = LocalArray::zeros(&[4], DataType::F32);
        let c = LocalArray::zeros(&[5], DataType::F64);

        assert!(host_binary(SequentialPolicy, BinaryOp::Add, &mut a, BinaryOperand::Array(&b)).is_err());
        assert!(host_binary(SequentialPolicy, BinaryOp::Add, &mut a, BinaryOperand::Array(&c)).is_err());
        assert!(host_binary(
            SequentialPolicy,
            BinaryOp::Add,
            &mut a,
            BinaryOperand::Scalar(DataValue::I32(1))
        )
        .is_err());
    }

    #[test]
    fn test_fill() {
        let mut a = LocalArray::zeros(&[3, 3], DataType::U16);
        host_fill(SequentialPolicy, &mut a, DataValue::U16(7)).unwrap();
        assert_eq!(a.as_slice::<u16>().unwrap(), &[7; 9]);
    }
}

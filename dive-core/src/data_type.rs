//! Defines primitive data types and a container to hold a single value of any of them.

use crate::local_array::HostBuffer;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt::{self, Debug, Display};
use std::mem::size_of;
use thiserror::Error;

/// Element type of a distributed array.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
pub enum DataType {
    // Signed integers
    I8,
    I16,
    I32,
    I64,

    // Unsigned integers
    U8,
    U16,
    U32,
    U64,

    // Floats
    F32,
    F64,
}

impl DataType {
    pub fn of<T: HasDataType>() -> Self {
        T::data_type()
    }

    pub fn size_in_bytes(&self) -> usize {
        use DataType::*;

        match self {
            I8 | U8 => 1,
            I16 | U16 => 2,
            I32 | U32 | F32 => 4,
            I64 | U64 | F64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }

    pub fn is_integer(&self) -> bool {
        !self.is_float()
    }

    pub fn name(&self) -> &'static str {
        use DataType::*;

        match self {
            I8 => "int8",
            I16 => "int16",
            I32 => "int32",
            I64 => "int64",
            U8 => "uint8",
            U16 => "uint16",
            U32 => "uint32",
            U64 => "uint64",
            F32 => "float32",
            F64 => "float64",
        }
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Alias for [`DataType::I8`].
pub const DTYPE_I8: DataType = DataType::I8;
/// Alias for [`DataType::I16`].
pub const DTYPE_I16: DataType = DataType::I16;
/// Alias for [`DataType::I32`].
pub const DTYPE_I32: DataType = DataType::I32;
/// Alias for [`DataType::I64`].
pub const DTYPE_I64: DataType = DataType::I64;
/// Alias for [`DataType::U8`].
pub const DTYPE_U8: DataType = DataType::U8;
/// Alias for [`DataType::U16`].
pub const DTYPE_U16: DataType = DataType::U16;
/// Alias for [`DataType::U32`].
pub const DTYPE_U32: DataType = DataType::U32;
/// Alias for [`DataType::U64`].
pub const DTYPE_U64: DataType = DataType::U64;
/// Alias for [`DataType::F32`] (`float` in C).
pub const DTYPE_FLOAT: DataType = DataType::F32;
/// Alias for [`DataType::F64`] (`double` in C).
pub const DTYPE_DOUBLE: DataType = DataType::F64;

/// Error indicating failure to cast a [`DataValue`] or [`HostBuffer`] to a rust type.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[error("cannot cast value of type {found} to {expected}")]
pub struct CastError {
    pub expected: DataType,
    pub found: DataType,
}

/// Types which correspond to [`DataType`] variants.
///
/// These type should satisify the following requirements.
/// - [`Send`] + [`Sync`]: thread safe.
/// - [`Copy`]: Trivial copyable.
/// - [`Into<DataValue>`]: Can be converted into [`DataValue`].
/// - [`TryFrom<DataValue>`]: Can be converted from a [`DataValue`].
pub trait HasDataType:
    Send
    + Sync
    + Copy
    + Default
    + Debug
    + PartialOrd
    + Into<DataValue>
    + TryFrom<DataValue, Error = CastError>
    + 'static
{
    fn data_type() -> DataType;

    /// Decode one element from exactly `size_of::<Self>()` little-endian bytes.
    fn from_le_slice(bytes: &[u8]) -> Self;

    fn extend_le_bytes(self, out: &mut Vec<u8>);

    fn slice_of(buffer: &HostBuffer) -> Result<&[Self], CastError>;

    fn slice_of_mut(buffer: &mut HostBuffer) -> Result<&mut [Self], CastError>;

    fn into_vec(buffer: HostBuffer) -> Result<Vec<Self>, CastError>;

    fn into_buffer(data: Vec<Self>) -> HostBuffer;
}

/// Type-erased scalar for a given [`DataType`].
///
/// Use any of the many `From` impls to convert a value into [`DataValue`] and use many of the
/// many `TryFrom` impls to convert back into a value.
///
/// # Example
/// ```
/// # use dive_core::*;
/// # use std::convert::TryInto;
/// let x: i32 = 123;
/// let y = DataValue::from(x);
///
/// assert_eq!(y.data_type(), DTYPE_I32);
///
/// let z: i32 = y.try_into().unwrap();
/// assert_eq!(x, z);
/// ```
#[derive(Copy, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum DataValue {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
}

/// Expands `$body` once for every [`DataValue`] variant with `$v` bound to the inner value.
#[macro_export]
macro_rules! dispatch_value {
    ($value:expr, $v:ident => $body:expr) => {
        match $value {
            $crate::DataValue::I8($v) => $body,
            $crate::DataValue::I16($v) => $body,
            $crate::DataValue::I32($v) => $body,
            $crate::DataValue::I64($v) => $body,
            $crate::DataValue::U8($v) => $body,
            $crate::DataValue::U16($v) => $body,
            $crate::DataValue::U32($v) => $body,
            $crate::DataValue::U64($v) => $body,
            $crate::DataValue::F32($v) => $body,
            $crate::DataValue::F64($v) => $body,
        }
    };
}

impl DataValue {
    /// Returns [`DataType`] of value.
    pub fn data_type(&self) -> DataType {
        use DataValue::*;

        match self {
            I8(_) => DataType::I8,
            I16(_) => DataType::I16,
            I32(_) => DataType::I32,
            I64(_) => DataType::I64,
            U8(_) => DataType::U8,
            U16(_) => DataType::U16,
            U32(_) => DataType::U32,
            U64(_) => DataType::U64,
            F32(_) => DataType::F32,
            F64(_) => DataType::F64,
        }
    }

    /// Convert to `dtype` using the semantics of an `as` cast.
    pub fn cast(self, dtype: DataType) -> DataValue {
        macro_rules! cast_to {
            ($v:expr) => {
                match dtype {
                    DataType::I8 => DataValue::I8($v as i8),
                    DataType::I16 => DataValue::I16($v as i16),
                    DataType::I32 => DataValue::I32($v as i32),
                    DataType::I64 => DataValue::I64($v as i64),
                    DataType::U8 => DataValue::U8($v as u8),
                    DataType::U16 => DataValue::U16($v as u16),
                    DataType::U32 => DataValue::U32($v as u32),
                    DataType::U64 => DataValue::U64($v as u64),
                    DataType::F32 => DataValue::F32($v as f32),
                    DataType::F64 => DataValue::F64($v as f64),
                }
            };
        }

        dispatch_value!(self, v => cast_to!(v))
    }

    pub fn to_f64(self) -> f64 {
        match self.cast(DataType::F64) {
            DataValue::F64(v) => v,
            _ => unreachable!(),
        }
    }
}

impl Debug for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        dispatch_value!(self, v => write!(f, "{:?}_{}", v, self.data_type()))
    }
}

impl Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        dispatch_value!(self, v => Display::fmt(v, f))
    }
}

macro_rules! impl_primitive {
    ($($typ:ident => $variant:ident),*) => {
        $(
            impl HasDataType for $typ {
                fn data_type() -> DataType {
                    DataType::$variant
                }

                fn from_le_slice(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; size_of::<$typ>()];
                    raw.copy_from_slice(bytes);
                    $typ::from_le_bytes(raw)
                }

                fn extend_le_bytes(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn slice_of(buffer: &HostBuffer) -> Result<&[Self], CastError> {
                    match buffer {
                        HostBuffer::$variant(v) => Ok(v),
                        other => Err(CastError { expected: DataType::$variant, found: other.data_type() }),
                    }
                }

                fn slice_of_mut(buffer: &mut HostBuffer) -> Result<&mut [Self], CastError> {
                    match buffer {
                        HostBuffer::$variant(v) => Ok(v),
                        other => Err(CastError { expected: DataType::$variant, found: other.data_type() }),
                    }
                }

                fn into_vec(buffer: HostBuffer) -> Result<Vec<Self>, CastError> {
                    match buffer {
                        HostBuffer::$variant(v) => Ok(v),
                        other => Err(CastError { expected: DataType::$variant, found: other.data_type() }),
                    }
                }

                fn into_buffer(data: Vec<Self>) -> HostBuffer {
                    HostBuffer::$variant(data)
                }
            }

            impl From<$typ> for DataValue {
                fn from(this: $typ) -> DataValue {
                    DataValue::$variant(this)
                }
            }

            impl From<&$typ> for DataValue {
                fn from(this: &$typ) -> DataValue {
                    DataValue::$variant(*this)
                }
            }

            impl TryFrom<DataValue> for $typ {
                type Error = CastError;

                fn try_from(this: DataValue) -> Result<$typ, CastError> {
                    match this {
                        DataValue::$variant(v) => Ok(v),
                        other => Err(CastError { expected: DataType::$variant, found: other.data_type() }),
                    }
                }
            }

            impl TryFrom<&DataValue> for $typ {
                type Error = CastError;

                fn try_from(this: &DataValue) -> Result<$typ, CastError> {
                    <$typ as TryFrom<DataValue>>::try_from(*this)
                }
            }

            impl From<Vec<$typ>> for HostBuffer {
                fn from(this: Vec<$typ>) -> HostBuffer {
                    HostBuffer::$variant(this)
                }
            }
        )*
    };
}

impl_primitive!(
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    f32 => F32, f64 => F64
);

#[cfg(test)]
mod test {
    use super::*;
    use std::convert::TryInto;

    #[test]
    fn test_cast() {
        assert_eq!(DataValue::from(3.7f64).cast(DataType::I32), DataValue::I32(3));
        assert_eq!(DataValue::from(200u8).cast(DataType::F32), DataValue::F32(200.0));
        assert_eq!(DataValue::from(-1i64).to_f64(), -1.0);
    }

    #[test]
    fn test_try_into() {
        let v = DataValue::from(42u16);
        let x: u16 = v.try_into().unwrap();
        assert_eq!(x, 42);

        let err = <f32 as TryFrom<DataValue>>::try_from(v).unwrap_err();
        assert_eq!(err.expected, DataType::F32);
        assert_eq!(err.found, DataType::U16);
    }

    #[test]
    fn test_le_bytes() {
        let mut out = vec![];
        1.5f64.extend_le_bytes(&mut out);
        assert_eq!(out.len(), DataType::F64.size_in_bytes());
        assert_eq!(f64::from_le_slice(&out), 1.5);
    }
}

//! Engine-resident n-dimensional arrays.

use crate::geom::{volume, Dims, Region};
use crate::prelude::*;
use crate::{dispatch_value, CastError, DataType, DataValue, HasDataType};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

/// Typed, contiguous element storage of a [`LocalArray`].
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub enum HostBuffer {
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

/// Expands `$body` once for every [`HostBuffer`] variant with `$data` bound to the inner vector.
#[macro_export]
macro_rules! dispatch_buffer {
    ($buffer:expr, $data:ident => $body:expr) => {
        match $buffer {
            $crate::HostBuffer::I8($data) => $body,
            $crate::HostBuffer::I16($data) => $body,
            $crate::HostBuffer::I32($data) => $body,
            $crate::HostBuffer::I64($data) => $body,
            $crate::HostBuffer::U8($data) => $body,
            $crate::HostBuffer::U16($data) => $body,
            $crate::HostBuffer::U32($data) => $body,
            $crate::HostBuffer::U64($data) => $body,
            $crate::HostBuffer::F32($data) => $body,
            $crate::HostBuffer::F64($data) => $body,
        }
    };
}

/// Like [`dispatch_buffer!`] but for two buffers that must hold the same type. Evaluates
/// `$mismatch` if they do not.
#[macro_export]
macro_rules! dispatch_buffer_pair {
    ($lhs:expr, $rhs:expr, ($a:ident, $b:ident) => $body:expr, _ => $mismatch:expr) => {
        match ($lhs, $rhs) {
            ($crate::HostBuffer::I8($a), $crate::HostBuffer::I8($b)) => $body,
            ($crate::HostBuffer::I16($a), $crate::HostBuffer::I16($b)) => $body,
            ($crate::HostBuffer::I32($a), $crate::HostBuffer::I32($b)) => $body,
            ($crate::HostBuffer::I64($a), $crate::HostBuffer::I64($b)) => $body,
            ($crate::HostBuffer::U8($a), $crate::HostBuffer::U8($b)) => $body,
            ($crate::HostBuffer::U16($a), $crate::HostBuffer::U16($b)) => $body,
            ($crate::HostBuffer::U32($a), $crate::HostBuffer::U32($b)) => $body,
            ($crate::HostBuffer::U64($a), $crate::HostBuffer::U64($b)) => $body,
            ($crate::HostBuffer::F32($a), $crate::HostBuffer::F32($b)) => $body,
            ($crate::HostBuffer::F64($a), $crate::HostBuffer::F64($b)) => $body,
            _ => $mismatch,
        }
    };
}

impl HostBuffer {
    /// Buffer holding `len` copies of `value`.
    pub fn filled(value: DataValue, len: usize) -> Self {
        dispatch_value!(value, v => HostBuffer::from(vec![v; len]))
    }

    pub fn data_type(&self) -> DataType {
        use HostBuffer::*;

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

    pub fn len(&self) -> usize {
        dispatch_buffer!(self, data => data.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<DataValue> {
        dispatch_buffer!(self, data => data.get(index).map(DataValue::from))
    }
}

/// A dense row-major array living on one engine (or on the controller after a gather).
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalArray {
    shape: Dims,
    buffer: HostBuffer,
}

impl Debug for LocalArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalArray")
            .field("shape", &self.shape)
            .field("dtype", &self.data_type())
            .finish()
    }
}

impl LocalArray {
    pub fn new(shape: &[usize], buffer: HostBuffer) -> Result<Self> {
        ensure!(
            buffer.len() == volume(shape),
            "buffer of length {} does not match shape {:?}",
            buffer.len(),
            shape
        );

        Ok(Self {
            shape: Dims::from_slice(shape),
            buffer,
        })
    }

    pub fn from_vec<T: HasDataType>(shape: &[usize], data: Vec<T>) -> Result<Self> {
        Self::new(shape, T::into_buffer(data))
    }

    pub fn full(shape: &[usize], value: DataValue) -> Self {
        Self {
            shape: Dims::from_slice(shape),
            buffer: HostBuffer::filled(value, volume(shape)),
        }
    }

    pub fn zeros(shape: &[usize], dtype: DataType) -> Self {
        Self::full(shape, DataValue::U8(0).cast(dtype))
    }

    /// Decode an array from little-endian raw bytes.
    pub fn from_le_bytes(shape: &[usize], dtype: DataType, bytes: &[u8]) -> Result<Self> {
        fn decode<T: HasDataType>(bytes: &[u8]) -> HostBuffer {
            let data = bytes
                .chunks_exact(std::mem::size_of::<T>())
                .map(T::from_le_slice)
                .collect::<Vec<T>>();

            T::into_buffer(data)
        }

        let nbytes = volume(shape) * dtype.size_in_bytes();
        ensure!(
            bytes.len() == nbytes,
            "expecting {} bytes for shape {:?} of {}, got {}",
            nbytes,
            shape,
            dtype,
            bytes.len()
        );

        let buffer = match dtype {
            DataType::I8 => decode::<i8>(bytes),
            DataType::I16 => decode::<i16>(bytes),
            DataType::I32 => decode::<i32>(bytes),
            DataType::I64 => decode::<i64>(bytes),
            DataType::U8 => decode::<u8>(bytes),
            DataType::U16 => decode::<u16>(bytes),
            DataType::U32 => decode::<u32>(bytes),
            DataType::U64 => decode::<u64>(bytes),
            DataType::F32 => decode::<f32>(bytes),
            DataType::F64 => decode::<f64>(bytes),
        };

        Self::new(shape, buffer)
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size_in_bytes());
        dispatch_buffer!(&self.buffer, data => {
            for &v in data.iter() {
                v.extend_le_bytes(&mut out);
            }
        });
        out
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndims(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn data_type(&self) -> DataType {
        self.buffer.data_type()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.len() * self.data_type().size_in_bytes()
    }

    pub fn buffer(&self) -> &HostBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut HostBuffer {
        &mut self.buffer
    }

    pub fn as_slice<T: HasDataType>(&self) -> Result<&[T]> {
        Ok(T::slice_of(&self.buffer)?)
    }

    pub fn as_mut_slice<T: HasDataType>(&mut self) -> Result<&mut [T]> {
        Ok(T::slice_of_mut(&mut self.buffer)?)
    }

    pub fn into_vec<T: HasDataType>(self) -> Result<Vec<T>> {
        Ok(T::into_vec(self.buffer)?)
    }

    /// Element at the given n-dimensional index.
    pub fn get(&self, index: &[usize]) -> Option<DataValue> {
        if index.len() != self.ndims() || any(zip(index, &self.shape), |(i, n)| i >= n) {
            return None;
        }

        let offset = Region::new(index, &vec![1; index.len()])
            .runs(&self.shape)
            .next()?
            .0;

        self.buffer.get(offset)
    }

    /// Returns a new array by applying `fun` to every element.
    pub fn map<T, U, F>(&self, fun: F) -> Result<LocalArray>
    where
        T: HasDataType,
        U: HasDataType,
        F: Fn(T) -> U,
    {
        let data = self.as_slice::<T>()?.iter().map(|&v| fun(v)).collect();
        LocalArray::from_vec::<U>(&self.shape, data)
    }

    /// Apply `fun` to every element in place.
    pub fn apply<T, F>(&mut self, mut fun: F) -> Result
    where
        T: HasDataType,
        F: FnMut(&mut T),
    {
        self.as_mut_slice::<T>()?.iter_mut().for_each(|v| fun(v));
        Ok(())
    }

    /// Copy the elements inside `region` into a new array of shape `region.extents()`.
    pub fn slice(&self, region: &Region) -> LocalArray {
        let runs = region.runs(&self.shape);
        let n = region.volume();

        let buffer = dispatch_buffer!(&self.buffer, data => {
            let mut out = Vec::with_capacity(n);
            for (offset, len) in runs {
                out.extend_from_slice(&data[offset..offset + len]);
            }

            HostBuffer::from(out)
        });

        LocalArray {
            shape: region.extents(),
            buffer,
        }
    }

    /// Overwrite the block `offset..offset + block.shape()` of this array with `block`.
    pub fn write_block(&mut self, offset: &[usize], block: &LocalArray) -> Result {
        let region = Region::new(offset, block.shape());
        ensure!(
            Region::from_shape(&self.shape).contains(&region),
            "block {:?} out of bounds for array of shape {:?}",
            region,
            self.shape()
        );

        let (expected, found) = (self.data_type(), block.data_type());
        let runs = region.runs(&self.shape);

        dispatch_buffer_pair!(&mut self.buffer, &block.buffer, (dst, src) => {
            let mut position = 0;
            for (offset, len) in runs {
                dst[offset..offset + len].copy_from_slice(&src[position..position + len]);
                position += len;
            }
        }, _ => bail!(CastError { expected, found }));

        Ok(())
    }

    /// Build an array of `shape` from disjoint pieces given as `(offset, block)` pairs.
    ///
    /// Points not covered by any piece are zero.
    pub fn assemble<I>(shape: &[usize], dtype: DataType, pieces: I) -> Result<LocalArray>
    where
        I: IntoIterator<Item = (Dims, LocalArray)>,
    {
        let mut result = LocalArray::zeros(shape, dtype);

        for (offset, block) in pieces {
            result.write_block(&offset, &block)?;
        }

        Ok(result)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn iota(shape: &[usize]) -> LocalArray {
        let data = (0..volume(shape)).map(|i| i as i32).collect();
        LocalArray::from_vec(shape, data).unwrap()
    }

    #[test]
    fn test_from_vec_checks_length() {
        assert!(LocalArray::from_vec(&[2, 3], vec![0.0f64; 5]).is_err());
        assert!(LocalArray::from_vec(&[2, 3], vec![0.0f64; 6]).is_ok());
    }

    #[test]
    fn test_slice() {
        let a = iota(&[4, 5]);
        let s = a.slice(&Region::from_bounds(&[1, 2], &[3, 4]));

        assert_eq!(s.shape(), &[2, 2]);
        assert_eq!(s.as_slice::<i32>().unwrap(), &[7, 8, 12, 13]);
        assert_eq!(s.get(&[1, 0]), Some(DataValue::I32(12)));
        assert_eq!(a.get(&[4, 0]), None);
    }

    #[test]
    fn test_write_block_and_assemble() {
        let a = iota(&[4, 5]);
        let top = a.slice(&Region::from_bounds(&[0, 0], &[2, 5]));
        let bottom = a.slice(&Region::from_bounds(&[2, 0], &[4, 5]));

        let b = LocalArray::assemble(
            &[4, 5],
            DataType::I32,
            vec![
                (Dims::from_slice(&[2, 0]), bottom),
                (Dims::from_slice(&[0, 0]), top),
            ],
        )
        .unwrap();

        assert_eq!(a, b);

        let mut c = LocalArray::zeros(&[4, 5], DataType::F32);
        assert!(c.write_block(&[0, 0], &iota(&[1, 1])).is_err());
        assert!(c
            .write_block(&[3, 4], &LocalArray::zeros(&[2, 1], DataType::F32))
            .is_err());
    }

    #[test]
    fn test_map_and_apply() {
        let mut a = LocalArray::full(&[3], DataValue::F64(2.0));
        let b = a.map(|x: f64| x * x).unwrap();
        assert_eq!(b.as_slice::<f64>().unwrap(), &[4.0, 4.0, 4.0]);

        a.apply(|x: &mut f64| *x += 1.0).unwrap();
        assert_eq!(a.as_slice::<f64>().unwrap(), &[3.0, 3.0, 3.0]);

        assert!(a.as_slice::<f32>().is_err());
    }

    #[test]
    fn test_le_bytes() {
        let a = iota(&[2, 3]);
        let bytes = a.to_le_bytes();
        assert_eq!(bytes.len(), 24);

        let b = LocalArray::from_le_bytes(&[2, 3], DataType::I32, &bytes).unwrap();
        assert_eq!(a, b);
        assert!(LocalArray::from_le_bytes(&[2, 3], DataType::I32, &bytes[1..]).is_err());
    }
}

use smallvec::SmallVec;

mod region;

pub use region::{Region, Runs};

/// Number of dimensions stored inline before [`Dims`] spills to the heap.
pub const INLINE_DIMS: usize = 4;

/// Shape or index of an n-dimensional array.
pub type Dims = SmallVec<[usize; INLINE_DIMS]>;

/// Number of elements of an array having the given shape.
pub fn volume(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Row-major (C order) element strides of an array having the given shape.
pub fn row_major_strides(shape: &[usize]) -> Dims {
    let mut strides: Dims = smallvec::smallvec![0; shape.len()];
    let mut stride = 1;

    for i in (0..shape.len()).rev() {
        strides[i] = stride;
        stride *= shape[i];
    }

    strides
}

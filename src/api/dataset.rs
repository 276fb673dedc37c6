use std::fmt::Debug;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::prelude::*;
use crate::types::{DataType, Dims, LocalArray, Region};

/// A file-backed n-dimensional dataset that can be read region by region.
pub trait Dataset: Send + Sync + Debug {
    fn shape(&self) -> &[usize];

    fn data_type(&self) -> DataType;

    /// Read the elements inside `region` into an array of shape `region.extents()`.
    fn read(&self, region: &Region) -> io::Result<LocalArray>;
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{path:?} has {found} bytes, expecting {expected} bytes")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        found: u64,
    },
}

/// Dataset stored as raw little-endian elements in row-major order, without header.
#[derive(Debug)]
pub struct RawFileDataset {
    path: PathBuf,
    file: Mutex<File>,
    shape: Dims,
    dtype: DataType,
}

impl RawFileDataset {
    pub fn open<P: AsRef<Path>>(path: P, shape: &[usize], dtype: DataType) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).with_context(|| format!("failed to open {:?}", path))?;

        let expected = (shape.iter().product::<usize>() * dtype.size_in_bytes()) as u64;
        let found = file.metadata()?.len();

        if expected != found {
            bail!(Error::SizeMismatch {
                path,
                expected,
                found
            });
        }

        debug!("opened {:?}: {:?} of {}", path, shape, dtype);

        Ok(Self {
            path,
            file: Mutex::new(file),
            shape: Dims::from_slice(shape),
            dtype,
        })
    }

    /// Write `array` to a new file at `path` and open it as a dataset.
    pub fn create<P: AsRef<Path>>(path: P, array: &LocalArray) -> Result<Self> {
        let path = path.as_ref();
        let mut file =
            File::create(path).with_context(|| format!("failed to create {:?}", path))?;
        file.write_all(&array.to_le_bytes())?;
        file.sync_all()?;
        drop(file);

        Self::open(path, array.shape(), array.data_type())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Dataset for RawFileDataset {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data_type(&self) -> DataType {
        self.dtype
    }

    fn read(&self, region: &Region) -> io::Result<LocalArray> {
        if region.ndims() != self.shape.len() || !Region::from_shape(&self.shape).contains(region)
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("region {:?} out of bounds for {:?}", region, self.shape),
            ));
        }

        let size = self.dtype.size_in_bytes();
        let mut bytes = vec![0u8; region.volume() * size];
        let mut position = 0;
        let mut file = self.file.lock();

        for (offset, len) in region.runs(&self.shape) {
            let nbytes = len * size;
            file.seek(SeekFrom::Start((offset * size) as u64))?;
            file.read_exact(&mut bytes[position..position + nbytes])?;
            position += nbytes;
        }

        LocalArray::from_le_bytes(&region.extents(), self.dtype, &bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Dataset backed by a local array that counts its reads.
    #[derive(Debug)]
    pub(crate) struct CountingDataset {
        array: LocalArray,
        reads: AtomicUsize,
        fail: AtomicBool,
    }

    impl CountingDataset {
        pub(crate) fn new(array: LocalArray) -> Self {
            Self {
                array,
                reads: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            }
        }

        pub(crate) fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }

        pub(crate) fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }
    }

    impl Dataset for CountingDataset {
        fn shape(&self) -> &[usize] {
            self.array.shape()
        }

        fn data_type(&self) -> DataType {
            self.array.data_type()
        }

        fn read(&self, region: &Region) -> io::Result<LocalArray> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read"));
            }

            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.array.slice(region))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::DataValue;

    #[test]
    fn test_raw_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let data = (0..60).map(|i| i as f32).collect();
        let array = LocalArray::from_vec(&[3, 4, 5], data).unwrap();

        let dataset = RawFileDataset::create(dir.path().join("a.raw"), &array).unwrap();
        assert_eq!(dataset.shape(), &[3, 4, 5]);
        assert_eq!(dataset.data_type(), DataType::F32);

        let region = Region::from_bounds(&[1, 1, 2], &[3, 3, 4]);
        let slice = dataset.read(&region).unwrap();
        assert_eq!(slice, array.slice(&region));
        assert_eq!(slice.get(&[0, 0, 0]), Some(DataValue::F32(27.0)));

        assert!(dataset.read(&Region::from_shape(&[4, 4, 5])).is_err());
    }

    #[test]
    fn test_open_size_mismatch() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 12]).unwrap();

        assert!(RawFileDataset::open(file.path(), &[3], DataType::I32).is_ok());

        let err = RawFileDataset::open(file.path(), &[4], DataType::I32).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::SizeMismatch {
                expected: 16,
                found: 12,
                ..
            })
        ));
    }
}

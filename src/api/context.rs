use crossbeam::atomic::AtomicCell;
use dive_core::util::Counter;
use std::fmt::{self, Debug};
use std::path::Path;
use std::sync::Arc;

use crate::api::{ArrayVariant, ClonedArray, Dataset, DistributedArray, FileArray, NdArray, RawFileDataset};
use crate::cache::{CacheStats, ChunkCache};
use crate::engine::{EngineService, EngineView, LocalCluster, Request};
use crate::prelude::*;
use crate::types::{
    CacheConfig, Config, DataType, DataValue, DatasetId, Decomposition, Dims, EngineId,
    LocalArray, LocalArrayId, Region,
};

/// Handle to the engine pool and the shared state of all arrays living on it.
///
/// Cloning is cheap; all clones refer to the same pool.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    view: EngineView,
    cache: Mutex<ChunkCache>,
    cache_config: CacheConfig,
    next_local_id: AtomicCell<u64>,
    next_dataset_id: AtomicCell<u64>,
}

impl Context {
    /// Start a [`LocalCluster`] as described by `config`.
    pub fn new(config: Config) -> Result<Self> {
        let cluster = LocalCluster::new(config.cluster.engines)?;
        Self::with_service(Arc::new(cluster), config.cache)
    }

    pub fn from_env() -> Result<Self> {
        Self::new(Config::from_env())
    }

    pub fn with_service(
        service: Arc<dyn EngineService>,
        cache_config: CacheConfig,
    ) -> Result<Self> {
        ensure!(!service.engines().is_empty(), "engine service has no engines");

        info!(
            "using {} engines, chunk budget of {} bytes",
            service.engines().len(),
            cache_config.budget()
        );

        let cache = ChunkCache::new(cache_config.budget());

        Ok(Self {
            inner: Arc::new(ContextInner {
                view: EngineView::new(service),
                cache: Mutex::new(cache),
                cache_config,
                next_local_id: AtomicCell::new(1),
                next_dataset_id: AtomicCell::new(1),
            }),
        })
    }

    /// Returns `true` if both handles refer to the same pool.
    pub fn same_as(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn view(&self) -> &EngineView {
        &self.inner.view
    }

    /// The engine pool.
    pub fn engines(&self) -> &[EngineId] {
        self.inner.view.engines()
    }

    pub fn cache_config(&self) -> &CacheConfig {
        &self.inner.cache_config
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.lock().stats()
    }

    pub(crate) fn cache(&self) -> &Mutex<ChunkCache> {
        &self.inner.cache
    }

    pub(crate) fn next_local_id(&self) -> LocalArrayId {
        LocalArrayId(self.inner.next_local_id.get_and_increment())
    }

    fn next_dataset_id(&self) -> DatasetId {
        DatasetId(self.inner.next_dataset_id.get_and_increment())
    }

    /// Array of `shape` filled with `value`, block-distributed along `distaxes`.
    pub fn full(&self, shape: &[usize], value: DataValue, distaxes: &[usize]) -> Result<NdArray> {
        check_distaxes(shape, distaxes)?;
        let decomposition = Decomposition::block(&Region::from_shape(shape), distaxes, self.engines());
        self.allocate(decomposition, value)
    }

    fn allocate(&self, decomposition: Decomposition, value: DataValue) -> Result<NdArray> {
        let id = self.next_local_id();
        let requests = decomposition
            .patches()
            .iter()
            .map(|(engine, patch)| {
                let request = Request::Allocate {
                    id,
                    shape: patch.extents(),
                    value,
                };

                (*engine, request)
            })
            .collect();

        self.view().call(requests)?;
        Ok(NdArray::from_parts(self, id, decomposition, value.data_type()))
    }

    pub fn zeros(&self, shape: &[usize], dtype: DataType, distaxes: &[usize]) -> Result<NdArray> {
        self.full(shape, DataValue::from(0u8).cast(dtype), distaxes)
    }

    pub fn ones(&self, shape: &[usize], dtype: DataType, distaxes: &[usize]) -> Result<NdArray> {
        self.full(shape, DataValue::from(1u8).cast(dtype), distaxes)
    }

    /// Scatter `array` over the pool.
    pub fn from_local(&self, array: &LocalArray, distaxes: &[usize]) -> Result<NdArray> {
        check_distaxes(array.shape(), distaxes)?;
        let decomposition =
            Decomposition::block(&Region::from_shape(array.shape()), distaxes, self.engines());

        let id = self.next_local_id();
        let pieces = decomposition
            .patches()
            .iter()
            .map(|(engine, patch)| (*engine, array.slice(patch)))
            .collect();

        self.view().push(id, pieces)?;
        Ok(NdArray::from_parts(self, id, decomposition, array.data_type()))
    }

    /// Array having the shape and distributed axes of `other`, filled with `value`. An
    /// in-memory `other` also lends its layout.
    pub fn full_like(&self, other: &dyn DistributedArray, value: DataValue) -> Result<NdArray> {
        let decomposition = match other.variant() {
            ArrayVariant::InMemory(array) => array.logical_layout(),
            _ => Decomposition::block(
                &Region::from_shape(other.shape()),
                other.distaxes(),
                self.engines(),
            ),
        };

        self.allocate(decomposition, value)
    }

    /// Array of `shape` stored in full on every engine.
    pub fn cloned_full(&self, shape: &[usize], value: DataValue) -> Result<ClonedArray> {
        let decomposition = Decomposition::replicated(&Region::from_shape(shape), self.engines());
        let id = self.next_local_id();

        let requests = self
            .engines()
            .iter()
            .map(|&engine| {
                let request = Request::Allocate {
                    id,
                    shape: Dims::from_slice(shape),
                    value,
                };

                (engine, request)
            })
            .collect();

        self.view().call(requests)?;

        Ok(ClonedArray::from_parts(self, id, decomposition, value.data_type()))
    }

    /// Copy `array` to every engine.
    pub fn cloned_from_local(&self, array: &LocalArray) -> Result<ClonedArray> {
        let decomposition =
            Decomposition::replicated(&Region::from_shape(array.shape()), self.engines());
        let id = self.next_local_id();

        let copies = self.engines().iter().map(|&e| (e, array.clone())).collect();
        self.view().push(id, copies)?;

        Ok(ClonedArray::from_parts(self, id, decomposition, array.data_type()))
    }

    /// Wrap `dataset` as a file-backed array. At least one distributed axis is required since
    /// chunks are formed along the first one.
    pub fn open_dataset(
        &self,
        dataset: Arc<dyn Dataset>,
        distaxes: &[usize],
    ) -> Result<FileArray> {
        ensure!(
            !distaxes.is_empty(),
            "file-backed arrays need at least one distributed axis"
        );
        check_distaxes(dataset.shape(), distaxes)?;

        let id = self.next_dataset_id();
        debug!(
            "opened {}: {:?} of {}",
            id,
            dataset.shape(),
            dataset.data_type()
        );

        Ok(FileArray::from_parts(self, id, dataset, distaxes))
    }

    pub fn open_raw_file<P: AsRef<Path>>(
        &self,
        path: P,
        shape: &[usize],
        dtype: DataType,
        distaxes: &[usize],
    ) -> Result<FileArray> {
        let dataset = RawFileDataset::open(path, shape, dtype)?;
        self.open_dataset(Arc::new(dataset), distaxes)
    }
}

impl Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("engines", &self.engines())
            .field("cache", &self.cache_stats())
            .finish()
    }
}

fn check_distaxes(shape: &[usize], distaxes: &[usize]) -> Result {
    for (i, &axis) in enumerate(distaxes) {
        ensure!(
            axis < shape.len(),
            "distributed axis {} out of bounds for shape {:?}",
            axis,
            shape
        );
        ensure!(
            !distaxes[..i].contains(&axis),
            "distributed axis {} given twice",
            axis
        );
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::Response;
    use crate::types::ClusterConfig;

    fn context(engines: usize) -> Context {
        let config = Config::new(ClusterConfig::new(engines), CacheConfig::default());
        Context::new(config).unwrap()
    }

    #[test]
    fn test_full_and_gather() {
        let ctx = context(3);
        let array = ctx.full(&[7, 2], DataValue::from(2.5f32), &[0]).unwrap();

        assert_eq!(array.shape(), &[7, 2]);
        assert_eq!(array.decomposition().engines().len(), 3);
        assert_eq!(array.gather().unwrap().into_vec::<f32>().unwrap(), vec![2.5; 14]);
    }

    #[test]
    fn test_service_without_engines() {
        struct Empty;

        impl EngineService for Empty {
            fn engines(&self) -> &[EngineId] {
                &[]
            }

            fn call(&self, requests: Vec<(EngineId, Request)>) -> Result<Vec<Response>> {
                bail!("unexpected requests: {:?}", requests)
            }
        }

        let err = Context::with_service(Arc::new(Empty), CacheConfig::default()).unwrap_err();
        assert!(err.to_string().contains("no engines"));
    }

    #[test]
    fn test_from_local_roundtrip() {
        let ctx = context(4);
        let data = (0..30).collect::<Vec<i64>>();
        let local = LocalArray::from_vec(&[5, 6], data.clone()).unwrap();
        let array = ctx.from_local(&local, &[0, 1]).unwrap();

        assert_eq!(array.gather().unwrap().into_vec::<i64>().unwrap(), data);
    }

    #[test]
    fn test_cloned() {
        let ctx = context(2);
        let array = ctx.cloned_full(&[3], DataValue::from(7u16)).unwrap();

        assert!(array.decomposition().is_replicated());
        assert_eq!(array.gather().unwrap().into_vec::<u16>().unwrap(), vec![7, 7, 7]);
    }

    #[test]
    fn test_invalid_distaxes() {
        let ctx = context(2);
        assert!(ctx.zeros(&[4, 4], DataType::F64, &[2]).is_err());
        assert!(ctx.zeros(&[4, 4], DataType::F64, &[1, 1]).is_err());

        let dataset = crate::api::testing::CountingDataset::new(LocalArray::zeros(&[4], DataType::U8));
        assert!(ctx.open_dataset(Arc::new(dataset), &[]).is_err());
    }

    #[test]
    fn test_release_on_drop() {
        let ctx = context(2);
        let array = ctx.ones(&[4], DataType::I32, &[0]).unwrap();
        let id = array.id();
        drop(array);

        let err = ctx.view().pull(EngineId(0), id, None).unwrap_err();
        assert!(format!("{:#}", err).contains("does not exist"));
    }
}

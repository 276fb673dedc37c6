use std::sync::Arc;

use crate::engine::{EngineService, Request, Response};
use crate::prelude::*;
use crate::types::{EngineId, LocalArray, LocalArrayId, Region};

/// The engine pool as seen by the controller, together with the active target list.
///
/// The target list selects the engines addressed by [`EngineView::apply`]. It is overridden
/// for the duration of a collective operation through [`EngineView::scope`].
pub struct EngineView {
    service: Arc<dyn EngineService>,
    targets: Mutex<Vec<EngineId>>,
}

impl EngineView {
    pub fn new(service: Arc<dyn EngineService>) -> Self {
        let targets = service.engines().to_vec();

        Self {
            service,
            targets: Mutex::new(targets),
        }
    }

    pub fn engines(&self) -> &[EngineId] {
        self.service.engines()
    }

    pub fn targets(&self) -> Vec<EngineId> {
        self.targets.lock().clone()
    }

    pub fn set_targets(&self, targets: Vec<EngineId>) {
        *self.targets.lock() = targets;
    }

    /// Install `targets` as the target list until the returned guard is dropped, after which
    /// the current list is restored.
    pub fn scope(&self, targets: Vec<EngineId>) -> TargetScope<'_> {
        let saved = replace(&mut *self.targets.lock(), targets);
        TargetScope { view: self, saved }
    }

    pub fn call(&self, requests: Vec<(EngineId, Request)>) -> Result<Vec<Response>> {
        if requests.is_empty() {
            return Ok(vec![]);
        }

        self.service.call(requests)
    }

    /// Send the request produced by `fun` to every engine of the target list. Responses are
    /// returned in target order.
    pub fn apply<F>(&self, mut fun: F) -> Result<Vec<(EngineId, Response)>>
    where
        F: FnMut(EngineId) -> Request,
    {
        let targets = self.targets();
        let requests = targets.iter().map(|&e| (e, fun(e))).collect();
        let responses = self.call(requests)?;

        Ok(zip(targets, responses).collect())
    }

    /// Store `array` under `id` on `engine`, for every given pair.
    pub fn push(&self, id: LocalArrayId, arrays: Vec<(EngineId, LocalArray)>) -> Result {
        let requests = arrays
            .into_iter()
            .map(|(e, array)| (e, Request::Push { id, array }))
            .collect();

        self.call(requests)?;
        Ok(())
    }

    /// Fetch `region` of the local array `id` from `engine`, or the whole array if `region` is
    /// `None`.
    pub fn pull(
        &self,
        engine: EngineId,
        id: LocalArrayId,
        region: Option<Region>,
    ) -> Result<LocalArray> {
        let mut responses = self.call(vec![(engine, Request::Pull { id, region })])?;

        match responses.pop() {
            Some(Response::Array(array)) => Ok(array),
            other => bail!("unexpected response from engine {}: {:?}", engine, other),
        }
    }

    /// Fetch several regions at once. Results are in the order of `requests`.
    pub fn pull_many(
        &self,
        requests: Vec<(EngineId, LocalArrayId, Option<Region>)>,
    ) -> Result<Vec<LocalArray>> {
        let requests = requests
            .into_iter()
            .map(|(e, id, region)| (e, Request::Pull { id, region }))
            .collect();

        self.call(requests)?
            .into_iter()
            .map(|response| match response {
                Response::Array(array) => Ok(array),
                other => bail!("unexpected response: {:?}", other),
            })
            .collect()
    }

    pub fn release(&self, arrays: Vec<(EngineId, LocalArrayId)>) -> Result {
        let mut per_engine = IndexMap::<EngineId, Vec<LocalArrayId>>::default();
        for (e, id) in arrays {
            per_engine.entry(e).or_insert_with(Vec::new).push(id);
        }

        let requests = per_engine
            .into_iter()
            .map(|(e, ids)| (e, Request::Release { ids }))
            .collect();

        self.call(requests)?;
        Ok(())
    }
}

/// Guard returned by [`EngineView::scope`].
pub struct TargetScope<'a> {
    view: &'a EngineView,
    saved: Vec<EngineId>,
}

impl Drop for TargetScope<'_> {
    fn drop(&mut self) {
        let saved = take(&mut self.saved);
        self.view.set_targets(saved);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::LocalCluster;
    use crate::types::{DataValue, Dims};

    fn view(n: usize) -> EngineView {
        EngineView::new(Arc::new(LocalCluster::new(n).unwrap()))
    }

    #[test]
    fn test_scope_restores_targets() {
        let view = view(4);
        let all = view.engines().to_vec();
        assert_eq!(view.targets(), all);

        {
            let _outer = view.scope(vec![EngineId(1), EngineId(2)]);
            assert_eq!(view.targets(), vec![EngineId(1), EngineId(2)]);

            {
                let _inner = view.scope(vec![EngineId(3)]);
                assert_eq!(view.targets(), vec![EngineId(3)]);
            }

            assert_eq!(view.targets(), vec![EngineId(1), EngineId(2)]);
        }

        assert_eq!(view.targets(), all);
    }

    #[test]
    fn test_scope_restores_on_error() {
        let view = view(2);

        let attempt = |view: &EngineView| -> Result {
            let _scope = view.scope(vec![EngineId(1)]);
            view.pull(EngineId(1), LocalArrayId(99), None)?;
            Ok(())
        };

        let result = attempt(&view);

        assert!(result.is_err());
        assert_eq!(view.targets(), view.engines().to_vec());
    }

    #[test]
    fn test_apply_push_pull() {
        let view = view(3);
        let id = LocalArrayId(1);
        let _scope = view.scope(vec![EngineId(0), EngineId(2)]);

        let responses = view
            .apply(|e| Request::Allocate {
                id,
                shape: Dims::from_slice(&[2]),
                value: DataValue::U32(e.get() as u32),
            })
            .unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[1].0, EngineId(2));

        let a = view.pull(EngineId(2), id, None).unwrap();
        assert_eq!(a.as_slice::<u32>().unwrap(), &[2, 2]);
        assert!(view.pull(EngineId(1), id, None).is_err());

        view.push(id, vec![(EngineId(1), a)]).unwrap();
        let pieces = view
            .pull_many(vec![(EngineId(1), id, None), (EngineId(0), id, None)])
            .unwrap();
        assert_eq!(pieces[0].as_slice::<u32>().unwrap(), &[2, 2]);
        assert_eq!(pieces[1].as_slice::<u32>().unwrap(), &[0, 0]);

        view.release(vec![(EngineId(0), id), (EngineId(1), id), (EngineId(2), id)])
            .unwrap();
        assert!(view.pull(EngineId(0), id, None).is_err());
    }
}

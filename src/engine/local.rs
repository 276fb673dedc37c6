use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use dive_memops::{host_binary, host_reduce, BinaryOperand, RayonPolicy};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crate::engine::{EngineOperand, EngineService, LocalArgs, Request, Response, SerializedError};
use crate::prelude::*;
use crate::types::{
    DataType, Dims, EngineId, ExecutionError, LocalArray, LocalArrayId, Reduction, Region,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("engine {0} is disconnected")]
    Disconnected(EngineId),
    #[error("unknown engine {0}")]
    UnknownEngine(EngineId),
    #[error("local array {id} does not exist on engine {engine}")]
    UnknownArray { engine: EngineId, id: LocalArrayId },
}

type Reply = Result<Response, SerializedError>;

struct Envelope {
    request: Request,
    reply: Sender<Reply>,
}

/// Engine pool running inside the controller process, one thread per engine.
///
/// Engines only communicate with the controller. Dropping the cluster stops all engines and
/// releases their arrays.
pub struct LocalCluster {
    engines: Vec<EngineId>,
    senders: Vec<Sender<Envelope>>,
    handles: Vec<JoinHandle<()>>,
}

impl LocalCluster {
    pub fn new(num_engines: usize) -> Result<Self> {
        ensure!(
            num_engines > 0 && num_engines <= u16::MAX as usize,
            "invalid number of engines: {}",
            num_engines
        );

        let mut engines = Vec::with_capacity(num_engines);
        let mut senders = Vec::with_capacity(num_engines);
        let mut handles = Vec::with_capacity(num_engines);

        for i in 0..num_engines {
            let id = EngineId::new(i);
            let (sender, receiver) = unbounded();

            let handle = thread::Builder::new()
                .name(format!("engine-{}", i))
                .spawn(move || execute_engine(id, receiver))
                .with_context(|| format!("failed to spawn thread for engine {}", id))?;

            engines.push(id);
            senders.push(sender);
            handles.push(handle);
        }

        info!("launched {} engines", num_engines);

        Ok(Self {
            engines,
            senders,
            handles,
        })
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        // Engines exit once their channel is disconnected.
        self.senders.clear();

        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("engine thread terminated abnormally");
            }
        }
    }
}

impl EngineService for LocalCluster {
    fn engines(&self) -> &[EngineId] {
        &self.engines
    }

    fn call(&self, requests: Vec<(EngineId, Request)>) -> Result<Vec<Response>> {
        for (engine, _) in &requests {
            if engine.get() >= self.senders.len() {
                bail!(Error::UnknownEngine(*engine));
            }
        }

        let mut first_error: Option<anyhow::Error> = None;
        let mut pending = Vec::with_capacity(requests.len());

        for (engine, request) in requests {
            trace!("engine {}: {:?}", engine, request);
            let (reply, receiver) = bounded(1);

            match self.senders[engine.get()].send(Envelope { request, reply }) {
                Ok(()) => pending.push((engine, Some(receiver))),
                Err(_) => pending.push((engine, None)),
            }
        }

        let mut responses = Vec::with_capacity(pending.len());
        for (engine, receiver) in pending {
            let reply = receiver.and_then(|r| r.recv().ok());

            let error: anyhow::Error = match reply {
                Some(Ok(response)) => {
                    responses.push(response);
                    continue;
                }
                Some(Err(e)) => ExecutionError::EngineExecution {
                    engine,
                    message: e.to_string(),
                }
                .into(),
                None => Error::Disconnected(engine).into(),
            };

            if first_error.is_none() {
                first_error = Some(error);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(responses),
        }
    }
}

fn execute_engine(id: EngineId, receiver: Receiver<Envelope>) {
    let mut engine = Engine {
        id,
        arrays: default(),
    };

    for Envelope { request, reply } in receiver {
        let result = match catch_unwind(AssertUnwindSafe(|| engine.handle_request(request))) {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                debug!("request failed on engine {}: {:?}", id, e);
                Err(SerializedError::from(&e))
            }
            Err(payload) => Err(SerializedError::Panic(panic_message(&*payload))),
        };

        // The controller may have given up on this reply.
        let _ = reply.send(result);
    }

    if !engine.arrays.is_empty() {
        debug!(
            "engine {} shutting down with {} arrays allocated",
            id,
            engine.arrays.len()
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<unknown panic>".to_string()
    }
}

struct Engine {
    id: EngineId,
    arrays: HashMap<LocalArrayId, LocalArray>,
}

impl Engine {
    fn get(&self, id: LocalArrayId) -> Result<&LocalArray> {
        match self.arrays.get(&id) {
            Some(array) => Ok(array),
            None => bail!(Error::UnknownArray {
                engine: self.id,
                id
            }),
        }
    }

    fn get_mut(&mut self, id: LocalArrayId) -> Result<&mut LocalArray> {
        let engine = self.id;
        self.arrays
            .get_mut(&id)
            .ok_or_else(|| Error::UnknownArray { engine, id }.into())
    }

    fn take(&mut self, id: LocalArrayId) -> Result<LocalArray> {
        let engine = self.id;
        self.arrays
            .remove(&id)
            .ok_or_else(|| Error::UnknownArray { engine, id }.into())
    }

    fn handle_request(&mut self, request: Request) -> Result<Response> {
        use Request::*;

        let response = match request {
            Allocate { id, shape, value } => {
                self.arrays.insert(id, LocalArray::full(&shape, value));
                Response::Done
            }
            Push { id, array } => {
                self.arrays.insert(id, array);
                Response::Done
            }
            Pull { id, region } => {
                let array = self.get(id)?;

                match region {
                    Some(region) => Response::Array(checked_slice(array, &region)?),
                    None => Response::Array(array.clone()),
                }
            }
            Slice { src, dst, region } => {
                let slice = checked_slice(self.get(src)?, &region)?;
                self.arrays.insert(dst, slice);
                Response::Done
            }
            Write { id, offset, array } => {
                self.get_mut(id)?.write_block(&offset, &array)?;
                Response::Done
            }
            CopyBlock { src, dst, offset } => {
                ensure!(src != dst, "cannot copy {} onto itself", src);
                let block = self.take(src)?;
                let result = self
                    .get_mut(dst)
                    .and_then(|array| array.write_block(&offset, &block));
                self.arrays.insert(src, block);

                result?;
                Response::Done
            }
            Release { ids } => {
                for id in ids {
                    if self.arrays.remove(&id).is_none() {
                        trace!("engine {}: release of unknown array {}", self.id, id);
                    }
                }

                Response::Done
            }
            Map { fun, args, kwargs } => {
                self.with_args(&args, |local| (fun)(local, &*kwargs))?;
                Response::Done
            }
            Reduce { id, reduction } => {
                let value = host_reduce(RayonPolicy, self.get(id)?, reduction)?;
                Response::Value(value)
            }
            MapReduce {
                fun,
                args,
                kwargs,
                reduction,
            } => {
                let output = self.with_args(&args, |local| (fun)(local, &*kwargs))?;
                let dtype = output.data_type();
                let reduction = Reduction::new(reduction, dtype).ok_or(
                    ExecutionError::UnsupportedReduction {
                        fun: reduction,
                        dtype,
                    },
                )?;

                Response::Value(host_reduce(RayonPolicy, &output, reduction)?)
            }
            Elementwise { dst, op, operand } => {
                match operand {
                    EngineOperand::Scalar(value) => {
                        let array = self.get_mut(dst)?;
                        host_binary(RayonPolicy, op, array, BinaryOperand::Scalar(value))?;
                    }
                    EngineOperand::Local(src) if src == dst => {
                        let array = self.get_mut(dst)?;
                        let copy = array.clone();
                        host_binary(RayonPolicy, op, array, BinaryOperand::Array(&copy))?;
                    }
                    EngineOperand::Local(src) => {
                        let mut array = self.take(dst)?;
                        let result = self.get(src).and_then(|rhs| {
                            host_binary(RayonPolicy, op, &mut array, BinaryOperand::Array(rhs))
                        });
                        self.arrays.insert(dst, array);
                        result?;
                    }
                }

                Response::Done
            }
        };

        Ok(response)
    }

    /// Bind `args` to their local arrays and call `fun`. The arrays are returned to the
    /// registry afterwards, even if `fun` fails or panics.
    fn with_args<F, T>(&mut self, args: &[LocalArrayId], fun: F) -> Result<T>
    where
        F: FnOnce(&mut LocalArgs) -> Result<T>,
    {
        let mut unique = Vec::<LocalArrayId>::new();
        let mut index = Vec::with_capacity(args.len());

        for id in args {
            let slot = match unique.iter().position(|u| u == id) {
                Some(slot) => slot,
                None => {
                    unique.push(*id);
                    unique.len() - 1
                }
            };

            index.push(slot);
        }

        let mut slots = Vec::with_capacity(unique.len());
        for &id in &unique {
            match self.arrays.remove(&id) {
                Some(array) => slots.push(array),
                None => {
                    for (&taken, array) in zip(&unique, slots) {
                        self.arrays.insert(taken, array);
                    }

                    bail!(Error::UnknownArray {
                        engine: self.id,
                        id
                    });
                }
            }
        }

        let before: Vec<(Dims, DataType)> = slots
            .iter()
            .map(|a| (Dims::from_slice(a.shape()), a.data_type()))
            .collect();

        let mut local = LocalArgs::new(slots, index);
        let result = catch_unwind(AssertUnwindSafe(|| fun(&mut local)));

        let mut changed = None;
        for ((id, array), (shape, dtype)) in zip(zip(unique, local.into_slots()), before) {
            if array.shape() != &shape[..] || array.data_type() != dtype {
                changed = Some(id);
            }

            self.arrays.insert(id, array);
        }

        let output = match result {
            Ok(output) => output?,
            Err(payload) => bail!("function panicked: {}", panic_message(&*payload)),
        };

        if let Some(id) = changed {
            bail!("function changed shape or data type of local array {}", id);
        }

        Ok(output)
    }
}

fn checked_slice(array: &LocalArray, region: &Region) -> Result<LocalArray> {
    ensure!(
        region.ndims() == array.ndims() && Region::from_shape(array.shape()).contains(region),
        "region {:?} out of bounds for local array of shape {:?}",
        region,
        array.shape()
    );

    Ok(array.slice(region))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::Kwargs;
    use crate::types::{DataValue, ReductionFunction};
    use std::sync::Arc;

    fn id(i: u64) -> LocalArrayId {
        LocalArrayId(i)
    }

    #[test]
    fn test_allocate_pull_release() {
        let cluster = LocalCluster::new(3).unwrap();
        let requests = cluster
            .engines()
            .iter()
            .map(|&e| {
                let shape = Dims::from_slice(&[2, e.get() + 1]);
                let value = DataValue::I32(e.get() as i32);
                (e, Request::Allocate { id: id(1), shape, value })
            })
            .collect();
        cluster.call(requests).unwrap();

        let responses = cluster
            .call(vec![(
                EngineId(2),
                Request::Pull {
                    id: id(1),
                    region: Some(Region::from_bounds(&[1, 1], &[2, 3])),
                },
            )])
            .unwrap();

        match &responses[0] {
            Response::Array(a) => assert_eq!(a.as_slice::<i32>().unwrap(), &[2, 2]),
            other => panic!("unexpected response {:?}", other),
        }

        cluster
            .call(vec![(EngineId(2), Request::Release { ids: vec![id(1)] })])
            .unwrap();

        let err = cluster
            .call(vec![(EngineId(2), Request::Pull { id: id(1), region: None })])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExecutionError>(),
            Some(ExecutionError::EngineExecution { engine: EngineId(2), .. })
        ));
    }

    #[test]
    fn test_map_with_duplicate_args() {
        let cluster = LocalCluster::new(1).unwrap();
        let engine = EngineId(0);
        let array = LocalArray::full(&[4], DataValue::F64(1.5));

        let fun: crate::engine::MapFn = Arc::new(|args: &mut LocalArgs, kwargs: &Kwargs| -> Result {
            assert_eq!(args.len(), 2);
            let factor = kwargs["factor"].to_f64();
            args.get_mut(0).apply(|x: &mut f64| *x *= factor)?;
            assert_eq!(args.get(1).as_slice::<f64>()?[0], 3.0);
            Ok(())
        });

        let mut kwargs = Kwargs::default();
        kwargs.insert("factor".to_string(), DataValue::F64(2.0));

        cluster
            .call(vec![
                (engine, Request::Push { id: id(7), array }),
                (
                    engine,
                    Request::Map {
                        fun,
                        args: vec![id(7), id(7)],
                        kwargs: Arc::new(kwargs),
                    },
                ),
            ])
            .unwrap();

        let responses = cluster
            .call(vec![(
                engine,
                Request::Reduce {
                    id: id(7),
                    reduction: Reduction::new(ReductionFunction::Sum, DataType::F64).unwrap(),
                },
            )])
            .unwrap();

        assert!(matches!(responses[0], Response::Value(Some(DataValue::F64(v))) if v == 12.0));
    }

    #[test]
    fn test_panic_keeps_arrays() {
        let cluster = LocalCluster::new(2).unwrap();
        let engine = EngineId(1);

        cluster
            .call(vec![(
                engine,
                Request::Push {
                    id: id(3),
                    array: LocalArray::zeros(&[2], DataType::U8),
                },
            )])
            .unwrap();

        let fun: crate::engine::MapFn = Arc::new(|_: &mut LocalArgs, _: &Kwargs| -> Result { panic!("boom") });
        let err = cluster
            .call(vec![(
                engine,
                Request::Map {
                    fun,
                    args: vec![id(3)],
                    kwargs: default(),
                },
            )])
            .unwrap_err();

        assert!(err.to_string().contains("boom"));

        // The argument is still registered.
        let responses = cluster
            .call(vec![(engine, Request::Pull { id: id(3), region: None })])
            .unwrap();
        assert!(matches!(&responses[0], Response::Array(a) if a.len() == 2));
    }

    #[test]
    fn test_elementwise_and_copy_block() {
        let cluster = LocalCluster::new(1).unwrap();
        let e = EngineId(0);
        let a = LocalArray::from_vec(&[2, 2], vec![1i64, 2, 3, 4]).unwrap();
        let b = LocalArray::from_vec(&[1, 2], vec![10i64, 20]).unwrap();

        cluster
            .call(vec![
                (e, Request::Push { id: id(1), array: a }),
                (e, Request::Push { id: id(2), array: b }),
                (
                    e,
                    Request::Elementwise {
                        dst: id(1),
                        op: crate::types::BinaryOp::Add,
                        operand: EngineOperand::Local(id(1)),
                    },
                ),
                (
                    e,
                    Request::CopyBlock {
                        src: id(2),
                        dst: id(1),
                        offset: Dims::from_slice(&[1, 0]),
                    },
                ),
            ])
            .unwrap();

        let responses = cluster
            .call(vec![(e, Request::Pull { id: id(1), region: None })])
            .unwrap();

        match &responses[0] {
            Response::Array(a) => assert_eq!(a.as_slice::<i64>().unwrap(), &[2, 4, 10, 20]),
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_unknown_engine() {
        let cluster = LocalCluster::new(1).unwrap();
        let err = cluster
            .call(vec![(EngineId(5), Request::Release { ids: vec![] })])
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::UnknownEngine(EngineId(5)))
        ));
    }
}

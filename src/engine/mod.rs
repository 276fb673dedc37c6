//! Addressing of and execution on the engines.
//!
//! The controller talks to the engines through an [`EngineService`], which fans a batch of
//! requests out to the engines and blocks until every addressed engine has replied.
//! [`LocalCluster`] implements this service with one thread per engine.
mod local;
mod message;
mod view;

use crate::prelude::*;
use crate::types::{DataValue, EngineId, LocalArray};
use std::sync::Arc;

pub use self::local::LocalCluster;
pub use self::message::{EngineOperand, Request, Response, SerializedError};
pub use self::view::{EngineView, TargetScope};

/// Keyword arguments passed to user functions.
pub type Kwargs = IndexMap<String, DataValue>;

/// Function applied by `map` to the local arrays of every engine.
pub type MapFn = Arc<dyn Fn(&mut LocalArgs, &Kwargs) -> Result + Send + Sync>;

/// Function applied by `map_reduce`; the returned array is reduced on the engine.
pub type MapReduceFn = Arc<dyn Fn(&mut LocalArgs, &Kwargs) -> Result<LocalArray> + Send + Sync>;

pub trait EngineService: Send + Sync {
    /// All engines of the pool, in order.
    fn engines(&self) -> &[EngineId];

    /// Send every request to its engine and wait until all of them have completed. Responses
    /// are returned in the order of `requests`.
    ///
    /// If one or more requests fail, all requests are still completed before the first
    /// failure is returned.
    fn call(&self, requests: Vec<(EngineId, Request)>) -> Result<Vec<Response>>;
}

/// The local arrays bound to the arguments of a user function on one engine.
///
/// Passing the same array twice binds both arguments to the same local array.
#[derive(Debug)]
pub struct LocalArgs {
    slots: Vec<LocalArray>,
    index: Vec<usize>,
}

impl LocalArgs {
    pub(crate) fn new(slots: Vec<LocalArray>, index: Vec<usize>) -> Self {
        assert!(all(&index, |&i| i < slots.len()));
        Self { slots, index }
    }

    pub(crate) fn into_slots(self) -> Vec<LocalArray> {
        self.slots
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn get(&self, arg: usize) -> &LocalArray {
        &self.slots[self.index[arg]]
    }

    pub fn get_mut(&mut self, arg: usize) -> &mut LocalArray {
        &mut self.slots[self.index[arg]]
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocalArray> + '_ {
        self.index.iter().map(move |&i| &self.slots[i])
    }
}

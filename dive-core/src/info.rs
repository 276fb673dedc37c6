use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Identifies one engine (worker process) of the cluster.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EngineId(pub u16);

impl EngineId {
    pub fn new(i: usize) -> Self {
        EngineId(i as u16)
    }

    pub fn get(&self) -> usize {
        self.0 as usize
    }
}

impl Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle under which an engine keeps one of its local arrays.
///
/// The controller allocates these; an engine never interprets the value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalArrayId(pub u64);

impl Display for LocalArrayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local{}", self.0)
    }
}

/// Identifies a file-backed dataset opened by the controller.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub u64);

impl Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dataset{}", self.0)
    }
}

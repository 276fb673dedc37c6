pub use dive_core::prelude::*;

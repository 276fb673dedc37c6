mod data_type;
mod geom;
pub mod info;
mod local_array;
pub mod prelude;
pub mod util;

pub use data_type::*;
pub use geom::*;
pub use local_array::*;

#![allow(clippy::too_many_arguments)]
//! Chunked execution of collective operations over distributed and file-backed arrays.

mod prelude;
pub mod api;
mod cache;
pub mod engine;
pub mod executor;
pub mod planner;
pub mod types;

pub use crate::api::*;
pub use crate::cache::CacheStats;
pub use crate::executor::{map, map_reduce, map_reduce_planned, reduce, reduce_planned};
pub use crate::planner::{plan, targets_for};

pub fn hostname() -> &'static str {
    lazy_static::lazy_static! {
        static ref HOSTNAME: String = {
            match ::hostname::get() {
                Ok(s) => s.to_string_lossy().into_owned(),
                Err(_) => "<anonymous>".into(),
            }
        };
    };

    &*HOSTNAME
}

pub fn initialize_logger() {
    use std::time::Instant;

    lazy_static::lazy_static! {
        static ref START_TIMING: Instant = Instant::now();
    }

    let _ = *START_TIMING;

    env_logger::Builder::from_default_env()
        .format(|formatter, record| {
            use std::io::Write;
            let duration = START_TIMING.elapsed();

            writeln!(
                formatter,
                "[{} {} {:.06}] {}: {}",
                hostname(),
                record.module_path().unwrap_or("?"),
                duration.as_secs_f64(),
                record.level(),
                record.args(),
            )
        })
        .init();
}

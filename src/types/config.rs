use std::env;
use std::fs;
use std::str::FromStr;

use crate::prelude::*;

// Used when `/proc/meminfo` cannot be read.
const FALLBACK_AVAILABLE_MEMORY: usize = 4_000_000_000;
const DEFAULT_MEMORY_FRACTION: f64 = 0.25;

#[derive(Debug, Clone)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub cache: CacheConfig,
}

impl Config {
    pub fn new(cluster: ClusterConfig, cache: CacheConfig) -> Self {
        Self { cluster, cache }
    }

    pub fn from_env() -> Self {
        Self {
            cluster: ClusterConfig::from_env(),
            cache: CacheConfig::from_env(),
        }
    }
}

fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    let value = env::var(key).ok()?;
    let value = value.trim();

    if value.is_empty() {
        return None;
    }

    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("invalid value {:?} for {}, using default", value, key);
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of engines in the pool.
    pub engines: usize,
}

impl ClusterConfig {
    pub fn new(engines: usize) -> Self {
        Self { engines }
    }

    pub fn from_env() -> Self {
        let mut engines = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        if let Some(n) = parse_env::<usize>("DIVE_ENGINES") {
            if n == 0 || n > u16::MAX as usize {
                warn!("DIVE_ENGINES must be in 1..={}, ignoring {}", u16::MAX, n);
            } else {
                engines = n;
            }
        }

        Self { engines }
    }
}

/// Memory budget for chunks of file-backed arrays.
///
/// A chunk of a file-backed array occupies at most
/// `fraction_of_available_memory * available_memory` bytes summed over all engines.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub fraction_of_available_memory: f64,
    pub available_memory: usize,
}

impl CacheConfig {
    pub fn new(fraction_of_available_memory: f64, available_memory: usize) -> Self {
        Self {
            fraction_of_available_memory,
            available_memory,
        }
    }

    pub fn from_env() -> Self {
        let mut fraction = DEFAULT_MEMORY_FRACTION;

        if let Some(f) = parse_env::<f64>("DIVE_MEMORY_FRACTION") {
            if f > 0.0 && f <= 1.0 {
                fraction = f;
            } else {
                warn!("DIVE_MEMORY_FRACTION must be in (0, 1], ignoring {}", f);
            }
        }

        let available_memory = match parse_env::<usize>("DIVE_AVAILABLE_MEMORY") {
            Some(n) => n,
            None => system_available_memory().unwrap_or_else(|| {
                debug!(
                    "cannot determine available memory, assuming {} bytes",
                    FALLBACK_AVAILABLE_MEMORY
                );
                FALLBACK_AVAILABLE_MEMORY
            }),
        };

        Self {
            fraction_of_available_memory: fraction,
            available_memory,
        }
    }

    /// Number of bytes one chunk may occupy.
    pub fn budget(&self) -> usize {
        (self.fraction_of_available_memory * self.available_memory as f64) as usize
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_FRACTION, FALLBACK_AVAILABLE_MEMORY)
    }
}

fn system_available_memory() -> Option<usize> {
    let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&meminfo)
}

fn parse_meminfo(meminfo: &str) -> Option<usize> {
    for line in meminfo.lines() {
        let mut parts = line.split_whitespace();

        if parts.next() == Some("MemAvailable:") {
            let kilobytes: usize = parts.next()?.parse().ok()?;
            return Some(kilobytes * 1024);
        }
    }

    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_meminfo() {
        let meminfo = "MemTotal:       16318412 kB\n\
                       MemFree:         1403548 kB\n\
                       MemAvailable:    9838120 kB\n";

        assert_eq!(parse_meminfo(meminfo), Some(9838120 * 1024));
        assert_eq!(parse_meminfo("MemTotal: 12 kB\n"), None);
    }

    #[test]
    fn test_budget() {
        let config = CacheConfig::new(0.25, 4_000_000);
        assert_eq!(config.budget(), 1_000_000);

        let config = CacheConfig::new(1.0, 2_000_000);
        assert_eq!(config.budget(), 2_000_000);
    }
}

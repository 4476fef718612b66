//! Tunables for the engine, overridable via `BLKSNAP_*` environment
//! variables (spec.md §6's knobs). Defaults are chosen for moderate-size
//! devices under test; production deployments are expected to override
//! `diff_storage_low_water_sectors` and `inflight_budget` for their own
//! device sizes and I/O depth.

use std::env;

#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Minimum CBT tracking block size, as a power-of-two byte shift.
    pub cbt_min_shift: u32,
    /// Upper bound on the number of CBT tracking blocks per device.
    pub cbt_max_count: usize,
    /// Minimum COW chunk size, as a power-of-two byte shift.
    pub chunk_min_shift: u32,
    /// Upper bound on the number of chunks per diff area.
    pub chunk_max_count: usize,
    /// Chunks held resident in a diff area's LRU cache at once.
    pub cache_capacity: usize,
    /// Released diff buffers kept for reuse before being freed.
    pub diff_buffer_high_water: usize,
    /// Hard ceiling on diff buffers outstanding at once, if any.
    pub diff_buffer_hard_cap: Option<usize>,
    /// Free-space threshold below which `LowFreeSpace` fires.
    pub diff_storage_low_water_sectors: u64,
    /// Background difference-storage writes a diff area lets run
    /// concurrently before `throttling_io` blocks the caller.
    pub inflight_budget: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cbt_min_shift: 16,        // 64 KiB tracking blocks
            cbt_max_count: 1 << 20,
            chunk_min_shift: 18,      // 256 KiB chunks
            chunk_max_count: 1 << 18,
            cache_capacity: 4096,
            diff_buffer_high_water: 256,
            diff_buffer_hard_cap: None,
            diff_storage_low_water_sectors: 1 << 16, // 32 MiB
            inflight_budget: 64,
        }
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    env_parsed(name, default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env_parsed(name, default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env_parsed(name, default)
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(val) => val.parse().unwrap_or_else(|_| {
            tracing::warn!(name, val, "ignoring unparsable env override");
            default
        }),
        Err(_) => default,
    }
}

impl Config {
    /// Build a `Config` from defaults overridden by any `BLKSNAP_*`
    /// variables present in the environment.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            cbt_min_shift: env_u32("BLKSNAP_CBT_MIN_SHIFT", default.cbt_min_shift),
            cbt_max_count: env_usize("BLKSNAP_CBT_MAX_COUNT", default.cbt_max_count),
            chunk_min_shift: env_u32("BLKSNAP_CHUNK_MIN_SHIFT", default.chunk_min_shift),
            chunk_max_count: env_usize("BLKSNAP_CHUNK_MAX_COUNT", default.chunk_max_count),
            cache_capacity: env_usize("BLKSNAP_CACHE_CAPACITY", default.cache_capacity),
            diff_buffer_high_water: env_usize(
                "BLKSNAP_DIFF_BUFFER_HIGH_WATER",
                default.diff_buffer_high_water,
            ),
            diff_buffer_hard_cap: match env::var("BLKSNAP_DIFF_BUFFER_HARD_CAP") {
                Ok(val) => val.parse().ok(),
                Err(_) => default.diff_buffer_hard_cap,
            },
            diff_storage_low_water_sectors: env_u64(
                "BLKSNAP_DIFF_STORAGE_LOW_WATER_SECTORS",
                default.diff_storage_low_water_sectors,
            ),
            inflight_budget: env_usize("BLKSNAP_INFLIGHT_BUDGET", default.inflight_budget),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let cfg = Config::default();
        assert!(cfg.chunk_min_shift >= cfg.cbt_min_shift.min(cfg.chunk_min_shift));
        assert!(cfg.cache_capacity > 0);
    }

    #[test]
    fn from_env_falls_back_on_unset_vars() {
        env::remove_var("BLKSNAP_CACHE_CAPACITY");
        let cfg = Config::from_env();
        assert_eq!(cfg.cache_capacity, Config::default().cache_capacity);
    }
}

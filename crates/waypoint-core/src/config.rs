//! Engine configuration
//!
//! Every section deserializes with `#[serde(default)]`, so a TOML file only
//! needs the keys it overrides. [`EngineConfig::load`] layers
//! environment variables over the file over the built-in defaults.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Full engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Central join table sizing
    pub table: HashTableConfig,
    /// Token pool sizes
    pub tokens: TokenConfig,
    /// Scan / producer settings
    pub scan: ScanConfig,
    /// Worker pool and merge settings
    pub scheduler: SchedulerConfig,
}

/// Segmented hash table configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashTableConfig {
    /// Number of independently checkable segments (at most 64)
    pub num_segments: usize,
    /// log2 of the slot count in each segment
    pub slot_bits: u32,
    /// Sampled fill rate at which a segment reports itself overfull
    pub max_fill_rate: f64,
    /// Fill ratio the cleaner evicts down to
    pub clean_fill_rate: f64,
    /// Random slots probed after an insert batch to estimate fill rate
    pub test_probes: usize,
}

impl Default for HashTableConfig {
    fn default() -> Self {
        Self {
            num_segments: 64,
            slot_bits: 16,
            max_fill_rate: 0.7,
            clean_fill_rate: 0.35,
            test_probes: 200,
        }
    }
}

impl HashTableConfig {
    /// Slots per segment
    pub fn slots_per_segment(&self) -> usize {
        1usize << self.slot_bits
    }
}

/// Token pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// CPU tokens: chunks processed in parallel
    pub cpu_tokens: usize,
    /// Disk tokens: outstanding disk reads
    pub disk_tokens: usize,
    /// CPU tokens reserved for the table cleaner
    pub cleaner_cpu_tokens: usize,
    /// Disk tokens reserved for the table cleaner
    pub cleaner_disk_tokens: usize,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            cpu_tokens: default_parallelism(),
            disk_tokens: 4,
            cleaner_cpu_tokens: 1,
            cleaner_disk_tokens: 2,
        }
    }
}

/// Scan configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Target tuples per chunk for producers that cut their own chunks
    pub preferred_tuples_per_chunk: usize,
    /// Chunk reads a scan keeps in flight
    pub max_chunk_requests: usize,
    /// Chunks between disk statistics log lines
    pub disk_statistics_interval: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            preferred_tuples_per_chunk: 2 * 1024 * 1023,
            max_chunk_requests: 5,
            disk_statistics_interval: 100,
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// OS threads in the worker pool
    pub worker_threads: usize,
    /// Maximum states combined by one merge work item
    pub merge_at_a_time: usize,
    /// Local schedulers requested per worker when a GIST round is prepared
    pub gist_tasks_per_worker: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_parallelism(),
            merge_at_a_time: 4,
            gist_tasks_per_worker: 4,
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl EngineConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config(format!("invalid TOML: {e}")))
    }

    /// Load a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!("Loaded engine configuration from {:?}", path);
        Ok(config)
    }

    /// Load configuration.
    /// Priority: environment variables > config file > defaults
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = match config_file {
            Some(path) if path.exists() => Self::from_file(path)?,
            Some(path) => {
                tracing::debug!("Engine config file not found: {:?}", path);
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `WAYPOINT_*` overrides from a variable lookup
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        override_from(&lookup, "WAYPOINT_NUM_SEGMENTS", &mut self.table.num_segments);
        override_from(&lookup, "WAYPOINT_SLOT_BITS", &mut self.table.slot_bits);
        override_from(&lookup, "WAYPOINT_MAX_FILL_RATE", &mut self.table.max_fill_rate);
        override_from(&lookup, "WAYPOINT_CLEAN_FILL_RATE", &mut self.table.clean_fill_rate);
        override_from(&lookup, "WAYPOINT_TEST_PROBES", &mut self.table.test_probes);
        override_from(&lookup, "WAYPOINT_CPU_TOKENS", &mut self.tokens.cpu_tokens);
        override_from(&lookup, "WAYPOINT_DISK_TOKENS", &mut self.tokens.disk_tokens);
        override_from(&lookup, "WAYPOINT_CLEANER_CPU_TOKENS", &mut self.tokens.cleaner_cpu_tokens);
        override_from(&lookup, "WAYPOINT_CLEANER_DISK_TOKENS", &mut self.tokens.cleaner_disk_tokens);
        override_from(&lookup, "WAYPOINT_TUPLES_PER_CHUNK", &mut self.scan.preferred_tuples_per_chunk);
        override_from(&lookup, "WAYPOINT_MAX_CHUNK_REQUESTS", &mut self.scan.max_chunk_requests);
        override_from(&lookup, "WAYPOINT_DISK_STATS_INTERVAL", &mut self.scan.disk_statistics_interval);
        override_from(&lookup, "WAYPOINT_WORKER_THREADS", &mut self.scheduler.worker_threads);
        override_from(&lookup, "WAYPOINT_MERGE_AT_A_TIME", &mut self.scheduler.merge_at_a_time);
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let t = &self.table;
        if t.num_segments == 0 || t.num_segments > 64 {
            return Err(Error::config(format!(
                "table.num_segments must be in 1..=64, got {}",
                t.num_segments
            )));
        }
        if !(4..=28).contains(&t.slot_bits) {
            return Err(Error::config(format!(
                "table.slot_bits must be in 4..=28, got {}",
                t.slot_bits
            )));
        }
        for (name, rate) in [
            ("table.max_fill_rate", t.max_fill_rate),
            ("table.clean_fill_rate", t.clean_fill_rate),
        ] {
            if !(rate > 0.0 && rate <= 1.0) {
                return Err(Error::config(format!("{name} must be in (0, 1], got {rate}")));
            }
        }
        if t.clean_fill_rate > t.max_fill_rate {
            return Err(Error::config(
                "table.clean_fill_rate must not exceed table.max_fill_rate",
            ));
        }
        for (name, value) in [
            ("table.test_probes", t.test_probes),
            ("tokens.cpu_tokens", self.tokens.cpu_tokens),
            ("tokens.disk_tokens", self.tokens.disk_tokens),
            ("tokens.cleaner_cpu_tokens", self.tokens.cleaner_cpu_tokens),
            ("tokens.cleaner_disk_tokens", self.tokens.cleaner_disk_tokens),
            ("scan.max_chunk_requests", self.scan.max_chunk_requests),
            ("scan.disk_statistics_interval", self.scan.disk_statistics_interval),
            ("scheduler.worker_threads", self.scheduler.worker_threads),
            ("scheduler.gist_tasks_per_worker", self.scheduler.gist_tasks_per_worker),
        ] {
            if value == 0 {
                return Err(Error::config(format!("{name} must be positive")));
            }
        }
        if self.scheduler.merge_at_a_time < 2 {
            return Err(Error::config("scheduler.merge_at_a_time must be at least 2"));
        }
        Ok(())
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))
    }
}

fn override_from<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!("Ignoring unparseable {}={:?}", key, raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.table.num_segments, 64);
        assert_eq!(config.table.slots_per_segment(), 65536);
        assert_eq!(config.scan.preferred_tuples_per_chunk, 2 * 1024 * 1023);
        assert_eq!(config.scan.max_chunk_requests, 5);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [table]
            num_segments = 8

            [tokens]
            disk_tokens = 9
            "#,
        )
        .unwrap();
        assert_eq!(config.table.num_segments, 8);
        assert_eq!(config.table.slot_bits, 16);
        assert_eq!(config.tokens.disk_tokens, 9);
        assert_eq!(config.tokens.cleaner_disk_tokens, 2);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[table]\nnum_segments = 8\nslot_bits = 10").unwrap();

        let mut config = EngineConfig::from_file(file.path()).unwrap();
        let env: HashMap<&str, &str> = [("WAYPOINT_NUM_SEGMENTS", "16"), ("WAYPOINT_SLOT_BITS", "oops")]
            .into_iter()
            .collect();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.table.num_segments, 16);
        // unparseable values leave the file setting in place
        assert_eq!(config.table.slot_bits, 10);
    }

    #[test]
    #[serial]
    fn test_load_reads_process_environment() {
        // SAFETY: serialized with the other environment tests
        unsafe { std::env::set_var("WAYPOINT_MERGE_AT_A_TIME", "7") };
        let config = EngineConfig::load(None).unwrap();
        unsafe { std::env::remove_var("WAYPOINT_MERGE_AT_A_TIME") };
        assert_eq!(config.scheduler.merge_at_a_time, 7);
    }

    #[test]
    #[serial]
    fn test_load_missing_file_falls_back_to_defaults() {
        let config = EngineConfig::load(Some(Path::new("/nonexistent/waypoint.toml"))).unwrap();
        assert_eq!(config.table, HashTableConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.table.num_segments = 65;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.table.clean_fill_rate = 0.9;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.tokens.cpu_tokens = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.tokens.cleaner_disk_tokens = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.scheduler.merge_at_a_time = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = EngineConfig::default();
        let text = config.to_toml().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }
}

//! Simulation configuration.

use crate::error::ConfigError;
use motesim_env::{SimTime, MILLISECOND};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default capacity of the log output history.
pub const DEFAULT_LOG_OUTPUT_BUFFER_SIZE: usize = 40_000;

/// What happens when a fault terminates the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPolicy {
    /// Headless/batch: the fault is fatal to the process.
    ExitProcess,

    /// Interactive: report the fault and leave the simulation stopped.
    #[default]
    KeepStopped,
}

/// Configuration for a simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Short description
    pub title: String,

    /// Seed for the kernel's random generator
    pub random_seed: u64,

    /// Draw the seed from the wall clock instead of `random_seed`
    pub random_seed_generated: bool,

    /// Upper bound (exclusive) of the random boot offset given to each mote
    pub max_mote_startup_delay: SimTime,

    /// Simulated/real time ratio cap (`None` = full speed)
    pub speed_limit: Option<f64>,

    /// Log output history capacity
    pub log_output_buffer_size: usize,

    /// Fault handling mode
    pub fault_policy: FaultPolicy,

    /// How long a blocking stop (or query) waits for the simulation thread
    pub stop_timeout_ms: u64,

    /// Cache the active-interface snapshot between ticks
    pub cache_active_interfaces: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            title: "My simulation".to_string(),
            random_seed: 123_456,
            random_seed_generated: false,
            max_mote_startup_delay: 1000 * MILLISECOND,
            speed_limit: None,
            log_output_buffer_size: DEFAULT_LOG_OUTPUT_BUFFER_SIZE,
            fault_policy: FaultPolicy::KeepStopped,
            stop_timeout_ms: 1000,
            cache_active_interfaces: true,
        }
    }
}

impl SimConfig {
    /// Loads a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: SimConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every value that the kernel would otherwise reject later.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_speed_limit(self.speed_limit)?;
        validate_buffer_size(self.log_output_buffer_size)?;
        Ok(())
    }

    /// Sets the random seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self.random_seed_generated = false;
        self
    }

    /// Sets the maximum mote startup delay.
    pub fn with_max_startup_delay(mut self, delay: SimTime) -> Self {
        self.max_mote_startup_delay = delay;
        self
    }

    /// Sets the speed limit.
    pub fn with_speed_limit(mut self, limit: Option<f64>) -> Self {
        self.speed_limit = limit;
        self
    }

    /// Sets the log output history capacity.
    pub fn with_log_buffer_size(mut self, size: usize) -> Self {
        self.log_output_buffer_size = size;
        self
    }

    /// Sets the fault policy.
    pub fn with_fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.fault_policy = policy;
        self
    }

    /// Sets the title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }
}

pub(crate) fn validate_speed_limit(limit: Option<f64>) -> Result<(), ConfigError> {
    match limit {
        Some(ratio) if !ratio.is_finite() || ratio <= 0.0 => Err(ConfigError::InvalidSpeedLimit(ratio)),
        _ => Ok(()),
    }
}

pub(crate) fn validate_buffer_size(size: usize) -> Result<(), ConfigError> {
    if size == 0 {
        Err(ConfigError::InvalidBufferSize(size))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = SimConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_mote_startup_delay, 1_000_000);
        assert_eq!(config.log_output_buffer_size, 40_000);
        assert_eq!(config.speed_limit, None);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = SimConfig::default().with_speed_limit(Some(0.0));
        assert!(matches!(config.validate(), Err(ConfigError::InvalidSpeedLimit(_))));

        let config = SimConfig::default().with_speed_limit(Some(f64::NAN));
        assert!(config.validate().is_err());

        let config = SimConfig::default().with_log_buffer_size(0);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBufferSize(0))));
    }

    #[test]
    fn test_partial_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "random_seed": 7, "speed_limit": 2.0, "fault_policy": "exit_process" }}"#).unwrap();

        let config = SimConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.random_seed, 7);
        assert_eq!(config.speed_limit, Some(2.0));
        assert_eq!(config.fault_policy, FaultPolicy::ExitProcess);
        assert_eq!(config.log_output_buffer_size, DEFAULT_LOG_OUTPUT_BUFFER_SIZE);
    }

    #[test]
    fn test_malformed_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(SimConfig::from_json_file(file.path()), Err(ConfigError::Malformed(_))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "log_output_buffer_size": 0 }}"#).unwrap();
        assert!(matches!(SimConfig::from_json_file(file.path()), Err(ConfigError::InvalidBufferSize(0))));
    }

    #[test]
    fn test_missing_file() {
        let err = SimConfig::from_json_file("/nonexistent/motesim.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}

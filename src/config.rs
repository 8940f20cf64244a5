//! Configuration
//!
//! TOML configuration with defaulted sections; CLI flags override the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub detector: DetectorConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Render the default configuration as TOML.
    pub fn default_toml() -> Result<String> {
        Ok(toml::to_string_pretty(&Config::default())?)
    }
}

/// Detector parameters; mirrors the module's command-line surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// File with bogon prefixes. Mandatory.
    #[serde(default)]
    pub bogon_file: PathBuf,

    /// File with watched-network prefixes; when absent the specific checks
    /// are skipped and the flow-rate filter has nothing to watch.
    #[serde(default)]
    pub specific_file: Option<PathBuf>,

    /// Seconds before symmetric-route entries may be rewritten (0 = default).
    #[serde(default = "default_rw_time")]
    pub sym_rw_time: u64,

    /// New flows per window per watched prefix before reporting (0 = default).
    #[serde(default = "default_threshold")]
    pub nf_threshold: u64,

    /// Seconds before the flow-rate slots rotate.
    #[serde(default = "default_swap_time")]
    pub bf_swap_time: u64,

    /// Projected distinct-source cardinality per flow-rate slot.
    #[serde(default = "default_capacity")]
    pub bf_capacity: usize,

    /// Target false-positive rate per flow-rate slot.
    #[serde(default = "default_fp_rate")]
    pub bf_fp_rate: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            bogon_file: PathBuf::new(),
            specific_file: None,
            sym_rw_time: default_rw_time(),
            nf_threshold: default_threshold(),
            bf_swap_time: default_swap_time(),
            bf_capacity: default_capacity(),
            bf_fp_rate: default_fp_rate(),
        }
    }
}

impl DetectorConfig {
    /// Reject configurations the detector cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.bogon_file.as_os_str().is_empty() {
            anyhow::bail!("bogon prefix file not specified; unable to continue");
        }
        Ok(())
    }
}

fn default_rw_time() -> u64 {
    45
}

fn default_threshold() -> u64 {
    1000
}

fn default_swap_time() -> u64 {
    90
}

fn default_capacity() -> usize {
    1_000_000
}

fn default_fp_rate() -> f64 {
    0.01
}

/// Channel sizing for the record pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Record input buffer size.
    #[serde(default = "default_record_buffer")]
    pub record_buffer: usize,

    /// Flagged-record output buffer size.
    #[serde(default = "default_spoofed_buffer")]
    pub spoofed_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            record_buffer: default_record_buffer(),
            spoofed_buffer: default_spoofed_buffer(),
        }
    }
}

fn default_record_buffer() -> usize {
    10_000
}

fn default_spoofed_buffer() -> usize {
    1_024
}

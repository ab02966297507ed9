// SPDX-License-Identifier: MIT

//! Engine configuration and the `TorchParams.conf` loader
//!
//! All tunables ship with documented defaults; a missing config file means
//! "use the defaults", and unrecognized lines are ignored so that old and
//! new parameter files stay interchangeable.

use std::fs;
use std::path::{Path, PathBuf};

/// Config file name, looked up inside the working directory.
pub const CONFIG_FILE_NAME: &str = "TorchParams.conf";

/// Trace log emitted by the online engine.
pub const TRACE_LOG_NAME: &str = "Runtime.wfl";

/// Candidate-race table.
pub const CANDIDATES_FILE_NAME: &str = "Candidates.wfl";

/// Interference-pair table.
pub const OVERLAPS_FILE_NAME: &str = "Overlaps.wfl";

/// Per-site delay-probability table.
pub const PROBS_FILE_NAME: &str = "Probs.wfl";

/// Aggregate delay statistics.
pub const STATS_FILE_NAME: &str = "Stats.wfl";

/// Tunables for race inference and delay injection.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the trace log and all persisted tables.
    pub working_dir: PathBuf,
    /// Maximum gap between two accesses for them to form a race pair.
    pub near_miss_window_ms: u64,
    /// Upper bound for a single injected delay.
    pub max_delay_ms: u64,
    /// Lower bound for a single injected delay.
    pub min_delay_ms: u64,
    /// Injected delay = observed gap scaled by this factor, capped at max.
    pub delay_factor: f64,
    /// Probability subtracted from a site after a non-confirming delay.
    pub prob_decay_step: f64,
    /// Floor below which a site's probability resets to 1.0.
    pub zero_probability: f64,
    /// How many recent delays feed the order-violation diagnostics.
    pub delay_history_count: usize,
    /// Globally disables the trace log sink.
    pub logging_disabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            near_miss_window_ms: 100,
            max_delay_ms: 100,
            min_delay_ms: 1,
            delay_factor: 1.15,
            prob_decay_step: 0.1,
            zero_probability: 0.001,
            delay_history_count: 10,
            logging_disabled: false,
        }
    }
}

impl EngineConfig {
    /// Loads `TorchParams.conf` from `dir`, falling back to defaults for a
    /// missing file and for every unrecognized or malformed line.
    pub fn load(dir: &Path) -> Self {
        let mut config = Self {
            working_dir: dir.to_path_buf(),
            ..Self::default()
        };

        let path = dir.join(CONFIG_FILE_NAME);
        let Ok(contents) = fs::read_to_string(&path) else {
            return config;
        };

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let number: String = line
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.')
                .collect();

            if line.starts_with("NearMissWindowMs") {
                if let Ok(v) = number.parse() {
                    config.near_miss_window_ms = v;
                }
            } else if line.starts_with("MaxDelayValueMs") {
                if let Ok(v) = number.parse() {
                    config.max_delay_ms = v;
                }
            } else if line.starts_with("MinDelayValueMs") {
                if let Ok(v) = number.parse() {
                    config.min_delay_ms = v;
                }
            } else if line.starts_with("ProbDecayStep") {
                if let Ok(v) = number.parse() {
                    config.prob_decay_step = v;
                }
            }
        }

        config
    }

    pub fn trace_log_path(&self) -> PathBuf {
        self.working_dir.join(TRACE_LOG_NAME)
    }

    pub fn candidates_path(&self) -> PathBuf {
        self.working_dir.join(CANDIDATES_FILE_NAME)
    }

    pub fn overlaps_path(&self) -> PathBuf {
        self.working_dir.join(OVERLAPS_FILE_NAME)
    }

    pub fn probs_path(&self) -> PathBuf {
        self.working_dir.join(PROBS_FILE_NAME)
    }

    pub fn stats_path(&self) -> PathBuf {
        self.working_dir.join(STATS_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(dir.path());
        assert_eq!(config.near_miss_window_ms, 100);
        assert_eq!(config.max_delay_ms, 100);
        assert!((config.prob_decay_step - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn recognized_keys_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "NearMissWindowMs = 250\nMaxDelayValueMs=80\nProbDecayStep: 0.25\nBogusKey = 7\n",
        )
        .unwrap();

        let config = EngineConfig::load(dir.path());
        assert_eq!(config.near_miss_window_ms, 250);
        assert_eq!(config.max_delay_ms, 80);
        assert!((config.prob_decay_step - 0.25).abs() < f64::EPSILON);
        // unrecognized key left everything else alone
        assert_eq!(config.min_delay_ms, 1);
    }
}

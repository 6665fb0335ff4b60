use crate::error::{LResult, LocalizerError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ─── Configuration ───────────────────────────────────────────────────────────

/// Tunables for the positioning loops and the motion gate.
///
/// Matching thresholds are not configurable; see `matcher`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizerConfig {
    // ── Voting ──
    pub voting_scan_frequency: u32,
    pub voting_sample_ms: u64,
    pub voting_history_capacity: usize,

    // ── Continuous positioning ──
    pub cycle_interval_ms: u64,
    pub poll_interval_ms: u64,

    // ── Result surface ──
    pub max_matches: usize,

    // ── Motion gate ──
    pub motion_window: usize,
    pub motion_threshold: f64,
    pub motion_sustain_ms: u64,
    pub motion_gating: bool,
}

impl Default for LocalizerConfig {
    fn default() -> Self {
        Self {
            voting_scan_frequency: 4,
            voting_sample_ms: 500,
            voting_history_capacity: 30,
            cycle_interval_ms: 1000,
            poll_interval_ms: 50,
            max_matches: 20,
            motion_window: 20,
            motion_threshold: 4.0,
            motion_sustain_ms: 1500,
            motion_gating: true,
        }
    }
}

impl LocalizerConfig {
    /// Load from a JSON file. Missing fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> LResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: LocalizerConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> LResult<()> {
        if self.voting_scan_frequency == 0 {
            return Err(LocalizerError::Config(
                "voting_scan_frequency must be positive".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(LocalizerError::Config(
                "poll_interval_ms must be positive".into(),
            ));
        }
        if self.motion_window < 2 {
            return Err(LocalizerError::Config(
                "motion_window needs at least two samples".into(),
            ));
        }
        if self.voting_history_capacity == 0 {
            return Err(LocalizerError::Config(
                "voting_history_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn voting_sample(&self) -> Duration {
        Duration::from_millis(self.voting_sample_ms)
    }
}

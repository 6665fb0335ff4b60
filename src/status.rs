use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Localizer state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalizerState {
    /// Nothing in flight
    Idle,
    /// Accumulating WiFi scans
    Scanning,
    /// Scoring a scan against the fingerprints
    Matching,
    /// Collecting or aggregating voting samples
    Voting,
    /// Ranking built, nothing published (no candidates)
    Ranked,
    /// Latest cycle published
    Published,
}

/// Snapshot of the localizer for dashboards and logs.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LocalizerStatus {
    pub timestamp: f64,
    pub state: LocalizerState,
    pub ready: bool,
    pub fingerprints: usize,
    pub scanning: bool,
    pub flushing: bool,
    pub moving: bool,
    pub voting: bool,
    pub positioning_subscribers: usize,
    pub voting_samples: usize,
    pub cycles: u64,
    pub publishes: u64,
    // Latest published result
    pub best_location: Option<String>,
    pub best_score: Option<f64>,
    pub candidates: usize,
    pub x: i32,
    pub y: i32,
    pub latitude: f64,
    pub longitude: f64,
    pub published_at: f64,
}

impl LocalizerStatus {
    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

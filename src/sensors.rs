use crate::error::LResult;
use crate::scanner::ScanSource;
use crate::status::current_timestamp;
use crate::store::read_json;
use crate::types::{AccelSample, SignalSample, SignalTable};
use crossbeam::channel::{Sender, TrySendError};
use log::{debug, warn};
use serde::Deserialize;
use std::path::Path;
use std::process::Command;
use tokio::time::{interval, Duration};

// ─── WiFi ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TermuxWifiEntry {
    bssid: Option<String>,
    rssi: f64,
}

/// Radio sweeps via `termux-wifi-scaninfo`.
#[derive(Debug, Default)]
pub struct TermuxWifiSource {
    failures: u64,
}

impl TermuxWifiSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScanSource for TermuxWifiSource {
    fn scan(&mut self) -> Option<Vec<SignalSample>> {
        let output = Command::new("termux-wifi-scaninfo").output().ok()?;
        let text = String::from_utf8_lossy(&output.stdout);
        match parse_wifi_scaninfo(&text) {
            Some(samples) => Some(samples),
            None => {
                self.failures += 1;
                if self.failures % 10 == 1 {
                    warn!("[wifi] unreadable scan output ({} failures)", self.failures);
                }
                None
            }
        }
    }
}

/// Parse the JSON array printed by `termux-wifi-scaninfo`. Entries without a
/// BSSID are skipped; an error object or garbage yields `None`.
pub fn parse_wifi_scaninfo(output: &str) -> Option<Vec<SignalSample>> {
    let entries: Vec<TermuxWifiEntry> = serde_json::from_str(output.trim()).ok()?;
    Some(
        entries
            .into_iter()
            .filter_map(|e| e.bssid.map(|bssid| SignalSample::new(bssid, e.rssi)))
            .collect(),
    )
}

/// Replays recorded sweeps in a loop.
///
/// File format: JSON array of `{bssid: dBm}` objects, optionally gzipped.
#[derive(Debug, Clone)]
pub struct ReplaySource {
    scans: Vec<Vec<SignalSample>>,
    cursor: usize,
}

impl ReplaySource {
    pub fn new(scans: Vec<SignalTable>) -> Self {
        let scans = scans
            .into_iter()
            .map(|table| {
                let mut sweep: Vec<SignalSample> = table
                    .into_iter()
                    .map(|(ap, dbm)| SignalSample::new(ap, dbm))
                    .collect();
                sweep.sort_by(|a, b| a.access_point.cmp(&b.access_point));
                sweep
            })
            .collect();
        Self { scans, cursor: 0 }
    }

    pub fn load(path: &Path) -> LResult<Self> {
        let scans: Vec<SignalTable> = read_json(path)?;
        debug!("[replay] {} sweeps from {}", scans.len(), path.display());
        Ok(Self::new(scans))
    }

    pub fn len(&self) -> usize {
        self.scans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scans.is_empty()
    }
}

impl ScanSource for ReplaySource {
    fn scan(&mut self) -> Option<Vec<SignalSample>> {
        if self.scans.is_empty() {
            return None;
        }
        let sweep = self.scans[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.scans.len();
        Some(sweep)
    }
}

// ─── Accelerometer ───────────────────────────────────────────────────────────

pub async fn accel_loop(tx: Sender<AccelSample>, use_mock: bool) {
    let mut interval = interval(Duration::from_millis(20)); // ~50Hz sampling
    let mut sample_count = 0u64;

    loop {
        interval.tick().await;

        // Try to read from termux-sensor, fall back to mock data
        let accel = if use_mock {
            mock_accel_data()
        } else {
            read_accelerometer().unwrap_or_else(mock_accel_data)
        };

        match tx.try_send(accel) {
            Ok(_) => {
                sample_count += 1;
                if sample_count % 500 == 0 {
                    debug!("[accel] {} samples", sample_count);
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("[accel] channel closed after {} samples", sample_count);
                break;
            }
            Err(TrySendError::Full(_)) => {
                // Motion feed is behind, drop this sample
            }
        }
    }
}

fn read_accelerometer() -> Option<AccelSample> {
    // Format: Accelerometer event: x=X, y=Y, z=Z, accuracy=0, timestamp=TS
    let output = Command::new("termux-sensor")
        .arg("-n")
        .arg("1")
        .arg("-s")
        .arg("accelerometer")
        .output()
        .ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    parse_accel_output(&text)
}

fn parse_accel_output(output: &str) -> Option<AccelSample> {
    let mut axes = [None, None, None];

    for part in output.split(',') {
        let part = part.trim();
        let part = part.rsplit(' ').next().unwrap_or(part);
        for (i, prefix) in ["x=", "y=", "z="].iter().enumerate() {
            if let Some(value) = part.strip_prefix(*prefix) {
                axes[i] = Some(value.trim().parse::<f64>().ok()?);
            }
        }
    }

    Some(AccelSample {
        timestamp: current_timestamp(),
        x: axes[0]?,
        y: axes[1]?,
        z: axes[2]?,
    })
}

fn mock_accel_data() -> AccelSample {
    use std::f64::consts::PI;
    static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let t = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed) as f64 * 0.02;

    // Resting phone with slight hand tremor.
    AccelSample {
        timestamp: current_timestamp(),
        x: (t * 2.0 * PI).sin() * 0.05,
        y: (t * 2.0 * PI).cos() * 0.03,
        z: 9.81 + (t * PI).sin() * 0.01,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_scaninfo() {
        let json = r#"[
            {"bssid": "aa:bb:cc:dd:ee:01", "frequency_mhz": 2412, "rssi": -61, "ssid": "lab"},
            {"bssid": "aa:bb:cc:dd:ee:02", "frequency_mhz": 5180, "rssi": -78, "ssid": ""},
            {"frequency_mhz": 2437, "rssi": -90}
        ]"#;
        let samples = parse_wifi_scaninfo(json).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0], SignalSample::new("aa:bb:cc:dd:ee:01", -61.0));
    }

    #[test]
    fn test_parse_scaninfo_error_object() {
        assert!(parse_wifi_scaninfo(r#"{"API_ERROR": "Location needs to be enabled"}"#).is_none());
        assert!(parse_wifi_scaninfo("").is_none());
    }

    #[test]
    fn test_parse_accel() {
        let sample = parse_accel_output("Accelerometer event: x=0.5, y=0.3, z=9.8, accuracy=0").unwrap();
        assert_eq!((sample.x, sample.y, sample.z), (0.5, 0.3, 9.8));
        assert!(parse_accel_output("nothing here").is_none());
    }

    #[test]
    fn test_replay_cycles() {
        let mut source = ReplaySource::new(vec![
            HashMap::from([("ap1".to_string(), -60.0)]),
            HashMap::from([("ap2".to_string(), -70.0)]),
        ]);
        assert_eq!(source.scan().unwrap()[0].access_point, "ap1");
        assert_eq!(source.scan().unwrap()[0].access_point, "ap2");
        assert_eq!(source.scan().unwrap()[0].access_point, "ap1");
        assert!(ReplaySource::new(Vec::new()).scan().is_none());
    }

    #[test]
    fn test_mock_accel_reads_stationary() {
        let mut gate = crate::motion_gate::MotionGate::new(20, 4.0, 1500);
        let mut moving = false;
        for _ in 0..200 {
            moving |= gate.push(&mock_accel_data());
        }
        assert!(!moving);
    }
}

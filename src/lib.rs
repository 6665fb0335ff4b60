//! WiFi fingerprint indoor localization.
//!
//! Scans nearby access points, scores the observed signal table against
//! recorded fingerprints, optionally votes over a history of samples, and
//! publishes a ranked, interpolated position estimate.

pub mod accumulator;
pub mod config;
pub mod controller;
pub mod error;
pub mod interpolate;
pub mod matcher;
pub mod motion_gate;
pub mod ranker;
pub mod scanner;
pub mod sensors;
pub mod status;
pub mod store;
pub mod types;

pub use config::LocalizerConfig;
pub use controller::{Localizer, PositioningSubscription};
pub use error::{LResult, LocalizerError};
pub use matcher::{DiagnosticMatcher, FingerprintMatcher, LocalMatcher};
pub use ranker::PublishedResults;
pub use scanner::{ScanSource, ThreadedScanner, WifiScanner};
pub use status::{LocalizerState, LocalizerStatus};
pub use store::{FingerprintDb, FingerprintStore, LocalFingerprintStore};
pub use types::{
    AccelSample, FinalPosition, FingerprintRecord, LatLon, LocationUpdate, MatchResult,
    PixelPoint, SignalSample, SignalTable,
};

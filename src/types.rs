use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Access point id (BSSID) to signal strength in dBm.
pub type SignalTable = HashMap<String, f64>;

/// Separator between map name and location name in a location key.
pub const LOCATION_KEY_SEPARATOR: char = '_';

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalSample {
    pub access_point: String,
    pub strength_dbm: f64,
}

impl SignalSample {
    pub fn new(access_point: impl Into<String>, strength_dbm: f64) -> Self {
        Self {
            access_point: access_point.into(),
            strength_dbm,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccelSample {
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Position on the floor-plan bitmap. `(-1, -1)` means "not placed".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelPoint {
    pub x: i32,
    pub y: i32,
}

impl PixelPoint {
    pub const UNKNOWN: PixelPoint = PixelPoint { x: -1, y: -1 };

    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }
}

impl Default for PixelPoint {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

/// Geographic position. `(0, 0)` means "not geo-referenced".
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub latitude: f64,
    pub longitude: f64,
}

impl LatLon {
    pub const UNKNOWN: LatLon = LatLon {
        latitude: 0.0,
        longitude: 0.0,
    };

    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.latitude == 0.0 && self.longitude == 0.0
    }
}

impl Default for LatLon {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

/// A recorded fingerprint of one location on one map.
///
/// `frequencies` and `stddevs` describe how the mean strengths were obtained
/// and are only used to build the reverse index. Records written without them
/// treat every access point as always observed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub map_name: String,
    pub location_name: String,
    pub strengths: SignalTable,
    #[serde(default)]
    pub frequencies: HashMap<String, f64>,
    #[serde(default)]
    pub stddevs: HashMap<String, f64>,
    #[serde(default)]
    pub pixel: PixelPoint,
    #[serde(default)]
    pub lat_lon: LatLon,
}

impl FingerprintRecord {
    pub fn new(
        map_name: impl Into<String>,
        location_name: impl Into<String>,
        strengths: SignalTable,
        pixel: PixelPoint,
        lat_lon: LatLon,
    ) -> Self {
        Self {
            map_name: map_name.into(),
            location_name: location_name.into(),
            strengths,
            frequencies: HashMap::new(),
            stddevs: HashMap::new(),
            pixel,
            lat_lon,
        }
    }

    pub fn location_key(&self) -> String {
        location_key(&self.map_name, &self.location_name)
    }

    /// Fraction of scans in which `access_point` was seen (1.0 when unrecorded).
    pub fn frequency(&self, access_point: &str) -> f64 {
        self.frequencies.get(access_point).copied().unwrap_or(1.0)
    }
}

pub fn location_key(map_name: &str, location_name: &str) -> String {
    format!("{}{}{}", map_name, LOCATION_KEY_SEPARATOR, location_name)
}

/// One ranked candidate location.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub location_key: String,
    pub score: f64,
    pub pixel: PixelPoint,
    pub lat_lon: LatLon,
}

impl MatchResult {
    /// Map part of the key. Location names may not contain the separator,
    /// map names may.
    pub fn map_name(&self) -> &str {
        self.location_key
            .rsplit_once(LOCATION_KEY_SEPARATOR)
            .map(|(map, _)| map)
            .unwrap_or("")
    }

    pub fn location_name(&self) -> &str {
        self.location_key
            .rsplit_once(LOCATION_KEY_SEPARATOR)
            .map(|(_, location)| location)
            .unwrap_or(&self.location_key)
    }
}

/// Interpolated position emitted at the end of a positioning cycle.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FinalPosition {
    pub pixel: PixelPoint,
    pub lat_lon: LatLon,
}

impl Default for FinalPosition {
    fn default() -> Self {
        Self {
            pixel: PixelPoint::UNKNOWN,
            lat_lon: LatLon::UNKNOWN,
        }
    }
}

/// Event delivered to subscribers on every publish.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub timestamp: f64,
    pub position: FinalPosition,
    pub best_location: Option<String>,
    pub best_score: Option<f64>,
    pub candidates: usize,
}

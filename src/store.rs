use crate::error::{LResult, LocalizerError};
use crate::types::{FingerprintRecord, LatLon, PixelPoint, SignalTable};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, info, warn};
use regex::Regex;
use serde::de::DeserializeOwned;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// An access point indexes a location only if it was seen in more than this
/// fraction of the recording scans...
pub const INDEX_MIN_FREQUENCY: f64 = 0.7;
/// ...and with a mean strength above this.
pub const INDEX_MIN_SIGNAL_DBM: f64 = -75.0;
/// Seed strength needed to preload a location on a seeded reload.
pub const PRELOAD_SIGNAL_DBM: f64 = -70.0;

pub const REVERSE_INDEX_FILE: &str = "reverse_index.json";
const TEMP_FILE: &str = "temp.json.gz";

// ─── Snapshot ────────────────────────────────────────────────────────────────

/// Immutable fingerprint database. A reload builds a new one and swaps it in
/// whole, so matchers never see a half-built index.
#[derive(Debug, Default)]
pub struct FingerprintDb {
    records: Vec<FingerprintRecord>,
    reverse_index: HashMap<String, HashSet<String>>,
    access_points: HashSet<String>,
}

impl FingerprintDb {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build the database and its reverse index from records.
    pub fn from_records(records: Vec<FingerprintRecord>) -> Self {
        let reverse_index = build_reverse_index(&records);
        Self::with_index(records, reverse_index)
    }

    /// Use a previously persisted reverse index instead of rebuilding it.
    pub fn with_index(
        records: Vec<FingerprintRecord>,
        reverse_index: HashMap<String, HashSet<String>>,
    ) -> Self {
        let access_points = records
            .iter()
            .flat_map(|r| r.strengths.keys().cloned())
            .collect();
        Self {
            records,
            reverse_index,
            access_points,
        }
    }

    pub fn records(&self) -> &[FingerprintRecord] {
        &self.records
    }

    /// Access point id to the location keys it reliably identifies.
    pub fn reverse_index(&self) -> &HashMap<String, HashSet<String>> {
        &self.reverse_index
    }

    /// Every access point referenced by any record.
    pub fn access_points(&self) -> &HashSet<String> {
        &self.access_points
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Location keys whose location name starts with `prefix`, optionally
    /// restricted to maps fully matching `map_pattern`.
    pub fn locations_by_prefix(&self, map_pattern: Option<&Regex>, prefix: &str) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| map_matches(map_pattern, &r.map_name) && r.location_name.starts_with(prefix))
            .map(|r| r.location_key())
            .collect()
    }

    pub fn xy_for_location(&self, map_pattern: Option<&Regex>, location: &str) -> Option<PixelPoint> {
        self.records
            .iter()
            .find(|r| map_matches(map_pattern, &r.map_name) && r.location_name == location)
            .map(|r| r.pixel)
    }

    /// Map names compare case-insensitively here.
    pub fn lat_lon_for_location(&self, map_name: Option<&str>, location: &str) -> Option<LatLon> {
        self.records
            .iter()
            .find(|r| {
                map_name.map_or(true, |m| m.eq_ignore_ascii_case(&r.map_name))
                    && r.location_name == location
            })
            .map(|r| r.lat_lon)
    }
}

fn map_matches(pattern: Option<&Regex>, map_name: &str) -> bool {
    pattern.map_or(true, |p| p.is_match(map_name))
}

/// Every access point gets an entry, possibly empty.
pub fn build_reverse_index(records: &[FingerprintRecord]) -> HashMap<String, HashSet<String>> {
    let mut index: HashMap<String, HashSet<String>> = HashMap::new();
    for record in records {
        let key = record.location_key();
        for (ap, strength) in &record.strengths {
            let entry = index.entry(ap.clone()).or_default();
            if record.frequency(ap) > INDEX_MIN_FREQUENCY && *strength > INDEX_MIN_SIGNAL_DBM {
                entry.insert(key.clone());
            }
        }
    }
    index
}

/// Compile a map-name pattern that must match the whole name.
pub fn full_match_regex(pattern: &str) -> LResult<Regex> {
    Ok(Regex::new(&format!("^(?:{})$", pattern))?)
}

// ─── Store collaborator ──────────────────────────────────────────────────────

/// Source of fingerprint snapshots for the matcher.
pub trait FingerprintStore: Send + Sync {
    /// Current snapshot. Cheap; callers keep the `Arc` for one matching pass.
    fn snapshot(&self) -> Arc<FingerprintDb>;

    /// Load fingerprints under `root`. With a seed table only the locations
    /// indexed by strong seed access points are loaded.
    fn reload(&self, root: &Path, map_pattern: Option<&str>, seed: Option<&SignalTable>)
        -> LResult<usize>;

    fn done_reloading(&self) -> bool;

    /// Ask an in-flight reload to give up.
    fn stop_reload(&self);

    /// Persist a new fingerprint and make it visible to matching.
    /// Returns the location key it was stored under.
    fn save_fingerprint(&self, record: FingerprintRecord) -> LResult<String>;
}

/// Directory-backed store: one gzip JSON file per location plus the
/// persisted reverse index.
///
/// Layout: `{root}/{map}_{location}.json.gz` (plain `.json` also read) and
/// `{root}/reverse_index.json`.
pub struct LocalFingerprintStore {
    current: RwLock<Arc<FingerprintDb>>,
    root: Mutex<Option<PathBuf>>,
    reloaded: AtomicBool,
    stop_reloading: AtomicBool,
}

impl Default for LocalFingerprintStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalFingerprintStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(FingerprintDb::empty())),
            root: Mutex::new(None),
            reloaded: AtomicBool::new(false),
            stop_reloading: AtomicBool::new(false),
        }
    }

    /// In-memory store, mostly for tests and replay.
    pub fn from_records(records: Vec<FingerprintRecord>) -> Self {
        let store = Self::new();
        store.swap(FingerprintDb::from_records(records));
        store.reloaded.store(true, Ordering::SeqCst);
        store
    }

    fn swap(&self, db: FingerprintDb) {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *current = Arc::new(db);
    }

    fn check_cancelled(&self) -> LResult<()> {
        if self.stop_reloading.load(Ordering::SeqCst) {
            return Err(LocalizerError::ReloadCancelled);
        }
        Ok(())
    }

    fn read_all(&self, root: &Path, pattern: Option<&Regex>) -> LResult<usize> {
        let mut paths: Vec<PathBuf> = fs::read_dir(root)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        paths.sort();

        let mut records = Vec::new();
        for path in paths {
            self.check_cancelled()?;
            let Some(stem) = fingerprint_stem(&path) else {
                continue;
            };
            if pattern.map_or(false, |p| !p.is_match(stem)) {
                continue;
            }
            match read_json::<FingerprintRecord>(&path) {
                Ok(record) => records.push(record),
                Err(e) => warn!("[store] skipping {}: {}", path.display(), e),
            }
        }

        let db = FingerprintDb::from_records(records);
        if let Err(e) = write_reverse_index(root, db.reverse_index()) {
            warn!("[store] could not persist reverse index: {}", e);
        }
        let count = db.len();
        self.swap(db);
        self.reloaded.store(true, Ordering::SeqCst);
        info!("[store] loaded {} fingerprints from {}", count, root.display());
        Ok(count)
    }

    fn read_seeded(&self, root: &Path, pattern: Option<&Regex>, seed: &SignalTable) -> LResult<usize> {
        self.reloaded.store(false, Ordering::SeqCst);
        let index = read_reverse_index(root)?;

        let preload: BTreeSet<&String> = seed
            .iter()
            .filter(|(_, strength)| **strength > PRELOAD_SIGNAL_DBM)
            .filter_map(|(ap, _)| index.get(ap))
            .flatten()
            .collect();
        if preload.is_empty() {
            debug!("[store] seed matched no indexed locations");
            return Ok(0);
        }

        let mut records = Vec::new();
        for key in preload {
            self.check_cancelled()?;
            if pattern.map_or(false, |p| !p.is_match(key)) {
                continue;
            }
            let Some(path) = fingerprint_path(root, key) else {
                continue;
            };
            match read_json::<FingerprintRecord>(&path) {
                Ok(record) => records.push(record),
                Err(e) => warn!("[store] skipping {}: {}", path.display(), e),
            }
        }

        let count = records.len();
        self.swap(FingerprintDb::with_index(records, index));
        self.reloaded.store(true, Ordering::SeqCst);
        info!("[store] preloaded {} fingerprints", count);
        Ok(count)
    }
}

impl FingerprintStore for LocalFingerprintStore {
    fn snapshot(&self) -> Arc<FingerprintDb> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn reload(&self, root: &Path, map_pattern: Option<&str>, seed: Option<&SignalTable>) -> LResult<usize> {
        if !root.is_dir() {
            return Err(LocalizerError::MissingRoot(root.display().to_string()));
        }
        let pattern = map_pattern.map(full_match_regex).transpose()?;
        *self.root.lock().unwrap_or_else(PoisonError::into_inner) = Some(root.to_path_buf());
        self.stop_reloading.store(false, Ordering::SeqCst);

        match seed {
            Some(seed) => self.read_seeded(root, pattern.as_ref(), seed),
            None => self.read_all(root, pattern.as_ref()),
        }
    }

    fn done_reloading(&self) -> bool {
        self.reloaded.load(Ordering::SeqCst)
    }

    fn stop_reload(&self) {
        self.stop_reloading.store(true, Ordering::SeqCst);
    }

    fn save_fingerprint(&self, record: FingerprintRecord) -> LResult<String> {
        if record.strengths.is_empty() {
            return Err(LocalizerError::EmptyScan);
        }
        if record.location_name.contains(crate::types::LOCATION_KEY_SEPARATOR) {
            return Err(LocalizerError::InvalidParameters(format!(
                "location name '{}' may not contain '{}'",
                record.location_name,
                crate::types::LOCATION_KEY_SEPARATOR
            )));
        }
        let root = self
            .root
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| LocalizerError::MissingRoot("no fingerprint root set".into()))?;
        fs::create_dir_all(&root)?;

        let key = record.location_key().replace(' ', "-");
        let temp = root.join(TEMP_FILE);
        write_json_gz(&temp, &record)?;
        fs::rename(&temp, root.join(format!("{}.json.gz", key)))?;

        let mut records: Vec<FingerprintRecord> = self
            .snapshot()
            .records()
            .iter()
            .filter(|r| r.location_key() != record.location_key())
            .cloned()
            .collect();
        records.push(record);
        let db = FingerprintDb::from_records(records);
        write_reverse_index(&root, db.reverse_index())?;
        self.swap(db);

        info!("[store] saved fingerprint {}", key);
        Ok(key)
    }
}

// ─── Files ───────────────────────────────────────────────────────────────────

/// Location key of a fingerprint file, or `None` for anything else in the root.
fn fingerprint_stem(path: &Path) -> Option<&str> {
    let name = path.file_name()?.to_str()?;
    if name == REVERSE_INDEX_FILE || name == TEMP_FILE {
        return None;
    }
    name.strip_suffix(".json.gz")
        .or_else(|| name.strip_suffix(".json"))
}

fn fingerprint_path(root: &Path, key: &str) -> Option<PathBuf> {
    [format!("{}.json.gz", key), format!("{}.json", key)]
        .into_iter()
        .map(|name| root.join(name))
        .find(|p| p.exists())
}

/// Read JSON, transparently gunzipping `.gz` files.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> LResult<T> {
    let file = File::open(path)?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        let reader = BufReader::new(GzDecoder::new(file));
        Ok(serde_json::from_reader(reader)?)
    } else {
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

fn write_json_gz<T: serde::Serialize>(path: &Path, value: &T) -> LResult<()> {
    let json = serde_json::to_string(value)?;
    let mut encoder = GzEncoder::new(File::create(path)?, Compression::default());
    encoder.write_all(json.as_bytes())?;
    encoder.finish()?;
    Ok(())
}

fn write_reverse_index(root: &Path, index: &HashMap<String, HashSet<String>>) -> LResult<()> {
    // Sorted for stable diffs.
    let sorted: std::collections::BTreeMap<&String, BTreeSet<&String>> = index
        .iter()
        .map(|(ap, keys)| (ap, keys.iter().collect()))
        .collect();
    fs::write(root.join(REVERSE_INDEX_FILE), serde_json::to_string_pretty(&sorted)?)?;
    Ok(())
}

fn read_reverse_index(root: &Path) -> LResult<HashMap<String, HashSet<String>>> {
    read_json(&root.join(REVERSE_INDEX_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(map: &str, loc: &str, aps: &[(&str, f64)]) -> FingerprintRecord {
        FingerprintRecord::new(
            map,
            loc,
            aps.iter().map(|(a, s)| (a.to_string(), *s)).collect(),
            PixelPoint::new(1, 2),
            LatLon::new(37.0, -122.0),
        )
    }

    fn temp_root(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "wifi_localizer_{}_{}_{}",
            name,
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_reverse_index_thresholds() {
        let mut weak_freq = record("lab", "b", &[("ap1", -60.0)]);
        weak_freq.frequencies.insert("ap1".into(), 0.5);
        let records = vec![
            record("lab", "a", &[("ap1", -60.0), ("ap2", -80.0)]),
            weak_freq,
        ];
        let index = build_reverse_index(&records);
        assert_eq!(index["ap1"], HashSet::from(["lab_a".to_string()]));
        assert!(index["ap2"].is_empty(), "weak AP still gets an entry");
    }

    #[test]
    fn test_lookups() {
        let db = FingerprintDb::from_records(vec![
            record("eng_1", "room101", &[("ap1", -60.0)]),
            record("eng_1", "room102", &[("ap2", -60.0)]),
            record("lib_1", "room101", &[("ap3", -60.0)]),
        ]);
        let eng = full_match_regex("eng_.*").unwrap();
        assert_eq!(db.locations_by_prefix(Some(&eng), "room").len(), 2);
        assert_eq!(db.locations_by_prefix(None, "room101").len(), 2);
        assert_eq!(db.xy_for_location(Some(&eng), "room102"), Some(PixelPoint::new(1, 2)));
        assert!(db.lat_lon_for_location(Some("LIB_1"), "room101").is_some());
        assert!(db.lat_lon_for_location(Some("lib_1"), "room102").is_none());
        assert_eq!(db.access_points().len(), 3);
    }

    #[test]
    fn test_full_match_pattern() {
        let re = full_match_regex("eng").unwrap();
        assert!(re.is_match("eng"));
        assert!(!re.is_match("eng_1"));
    }

    #[test]
    fn test_save_then_reload_full_and_seeded() {
        let root = temp_root("store");
        let store = LocalFingerprintStore::new();
        assert_eq!(store.reload(&root, None, None).unwrap(), 0);

        store
            .save_fingerprint(record("lab", "door", &[("ap1", -60.0), ("ap2", -90.0)]))
            .unwrap();
        store
            .save_fingerprint(record("lab", "desk", &[("ap3", -65.0)]))
            .unwrap();
        store
            .save_fingerprint(record("other", "hall", &[("ap1", -50.0)]))
            .unwrap();
        assert_eq!(store.snapshot().len(), 3);

        let seed: SignalTable = HashMap::from([("ap1".to_string(), -55.0), ("ap3".to_string(), -80.0)]);
        let seeded = LocalFingerprintStore::new();
        assert_eq!(seeded.reload(&root, None, Some(&seed)).unwrap(), 2);
        let keys: HashSet<String> = seeded
            .snapshot()
            .records()
            .iter()
            .map(|r| r.location_key())
            .collect();
        assert_eq!(keys, HashSet::from(["lab_door".to_string(), "other_hall".to_string()]));

        let fresh = LocalFingerprintStore::new();
        assert_eq!(fresh.reload(&root, Some("lab_.*"), None).unwrap(), 2);
        assert!(fresh.done_reloading());

        // A filtered load persists an index covering only what it loaded.
        let narrowed = LocalFingerprintStore::new();
        assert_eq!(narrowed.reload(&root, None, Some(&seed)).unwrap(), 1);
        assert_eq!(narrowed.snapshot().records()[0].location_key(), "lab_door");

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_reload_missing_root_and_bad_pattern() {
        let store = LocalFingerprintStore::new();
        assert!(matches!(
            store.reload(Path::new("/nonexistent/wifi/root"), None, None),
            Err(LocalizerError::MissingRoot(_))
        ));
        let root = temp_root("pattern");
        assert!(matches!(
            store.reload(&root, Some("("), None),
            Err(LocalizerError::InvalidPattern(_))
        ));
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_unreadable_file_is_skipped() {
        let root = temp_root("corrupt");
        fs::write(root.join("lab_bad.json"), "not json").unwrap();
        fs::write(
            root.join("lab_good.json"),
            serde_json::to_string(&record("lab", "good", &[("ap1", -60.0)])).unwrap(),
        )
        .unwrap();
        let store = LocalFingerprintStore::new();
        assert_eq!(store.reload(&root, None, None).unwrap(), 1);
        assert!(root.join(REVERSE_INDEX_FILE).exists());
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_reload_clears_stale_stop_request() {
        let root = temp_root("cancel");
        fs::write(
            root.join("lab_a.json"),
            serde_json::to_string(&record("lab", "a", &[("ap1", -60.0)])).unwrap(),
        )
        .unwrap();
        let store = LocalFingerprintStore::new();
        store.stop_reload();
        // reload clears the flag before starting, so this one completes.
        assert_eq!(store.reload(&root, None, None).unwrap(), 1);
        fs::remove_dir_all(&root).ok();
    }
}

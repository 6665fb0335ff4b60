//! Scan → match → vote → interpolate → publish orchestration.
//!
//! # Architecture
//! - Single-shot: `start_scanning_for_location` / `stop_scanning_for_location`
//!   run one cycle on the caller's thread.
//! - Voting: a worker thread collects fixed-length scan samples until told to
//!   stop (or a sample budget is reached), then scores every sample and
//!   publishes the mean-score vote.
//! - Continuous: a worker thread shared by every `PositioningSubscription`.
//!   It runs while at least one subscription is alive.
//!
//! Results reach readers only through an `Arc<PublishedResults>` swapped in
//! at the end of a cycle.

use crate::config::LocalizerConfig;
use crate::error::LResult;
use crate::interpolate::final_position;
use crate::matcher::{FingerprintMatcher, LocalMatcher};
use crate::motion_gate::{MotionFeed, MotionGate};
use crate::ranker::{LocationRanker, PublishedResults};
use crate::scanner::{WifiScanner, MAX_SCAN_TIME_MS};
use crate::status::{current_timestamp, LocalizerState, LocalizerStatus};
use crate::store::{full_match_regex, FingerprintStore};
use crate::types::{
    AccelSample, FingerprintRecord, LatLon, LocationUpdate, PixelPoint, SignalTable,
};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Frequency used for the fingerprint-loading seed scan.
const SEED_SCAN_FREQUENCY: u32 = 4;
const SEED_SCAN_TIME_MS: u64 = 1000;
const UPDATE_CHANNEL_CAPACITY: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct LoopHandle {
    cancel: Sender<()>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct PositioningSession {
    subscribers: HashSet<u64>,
    next_id: u64,
    worker: Option<LoopHandle>,
}

struct Inner {
    config: LocalizerConfig,
    scanner: Arc<dyn WifiScanner>,
    store: Arc<dyn FingerprintStore>,
    matcher: Box<dyn FingerprintMatcher>,

    ranker: Mutex<LocationRanker>,
    published: RwLock<Arc<PublishedResults>>,
    location_updated: AtomicBool,
    state: Mutex<LocalizerState>,

    // Voting session
    use_voting: AtomicBool,
    keep_sampling: AtomicBool,
    expected_location: Mutex<Option<String>>,
    voting_worker: Mutex<Option<JoinHandle<()>>>,

    positioning: Mutex<PositioningSession>,
    loader: Mutex<Option<LoopHandle>>,

    motion_gate: Arc<Mutex<MotionGate>>,
    moving: Arc<AtomicBool>,

    listeners: Mutex<Vec<Sender<LocationUpdate>>>,
    cycles: AtomicU64,
    publishes: AtomicU64,
}

/// WiFi fingerprint localizer.
///
/// # Usage
/// ```no_run
/// use std::sync::Arc;
/// use wifi_localizer::{Localizer, LocalizerConfig, LocalFingerprintStore, ThreadedScanner};
/// use wifi_localizer::sensors::TermuxWifiSource;
///
/// let scanner = Arc::new(ThreadedScanner::new(Box::new(TermuxWifiSource::new())));
/// let store = Arc::new(LocalFingerprintStore::new());
/// let localizer = Localizer::with_local_matcher(LocalizerConfig::default(), scanner, store);
///
/// let _sub = localizer.start_continuous_positioning(4, 1000);
/// if localizer.is_location_updated() {
///     println!("{:?}", localizer.get_locations().first());
/// }
/// ```
pub struct Localizer {
    inner: Arc<Inner>,
    motion_feed: MotionFeed,
}

impl Localizer {
    pub fn new(
        config: LocalizerConfig,
        scanner: Arc<dyn WifiScanner>,
        store: Arc<dyn FingerprintStore>,
        matcher: Box<dyn FingerprintMatcher>,
    ) -> Self {
        let motion_gate = Arc::new(Mutex::new(MotionGate::from_config(&config)));
        let moving = Arc::new(AtomicBool::new(false));
        let motion_feed = MotionFeed::spawn(motion_gate.clone(), moving.clone());

        let inner = Arc::new(Inner {
            ranker: Mutex::new(LocationRanker::new(config.voting_history_capacity)),
            config,
            scanner,
            store,
            matcher,
            published: RwLock::new(Arc::new(PublishedResults::default())),
            location_updated: AtomicBool::new(false),
            state: Mutex::new(LocalizerState::Idle),
            use_voting: AtomicBool::new(false),
            keep_sampling: AtomicBool::new(false),
            expected_location: Mutex::new(None),
            voting_worker: Mutex::new(None),
            positioning: Mutex::new(PositioningSession::default()),
            loader: Mutex::new(None),
            motion_gate,
            moving,
            listeners: Mutex::new(Vec::new()),
            cycles: AtomicU64::new(0),
            publishes: AtomicU64::new(0),
        });

        Self { inner, motion_feed }
    }

    pub fn with_local_matcher(
        config: LocalizerConfig,
        scanner: Arc<dyn WifiScanner>,
        store: Arc<dyn FingerprintStore>,
    ) -> Self {
        Self::new(config, scanner, store, Box::new(LocalMatcher))
    }

    // ─── Single-shot and voting ──────────────────────────────────────────────

    /// Begin collecting WiFi scans for a location fix.
    ///
    /// With `voting` the scans are collected as `samples` fixed-length
    /// samples on a worker thread (`samples == 0` runs until stopped). Does
    /// nothing while a voting session is active, and refuses voting while
    /// continuous positioning runs.
    pub fn start_scanning_for_location(&self, frequency_hz: u32, voting: bool, samples: u32) {
        let inner = &self.inner;
        lock(&inner.ranker).clear();

        if !voting {
            {
                let _session = lock(&inner.positioning);
                if inner.use_voting.load(Ordering::SeqCst) {
                    debug!("[localizer] voting already active, ignoring start");
                    return;
                }
                inner.reap_voting_worker();
            }
            inner.scanner.start_scan(frequency_hz);
            inner.set_state(LocalizerState::Scanning);
            return;
        }

        // Held until the worker is installed so continuous positioning cannot
        // start in between.
        let session = lock(&inner.positioning);
        if session.worker.is_some() {
            warn!("[localizer] voting refused while continuous positioning runs");
            return;
        }
        if inner
            .use_voting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("[localizer] voting already active, ignoring start");
            return;
        }
        // A previous worker has already cleared `use_voting`, so it is exiting.
        inner.reap_voting_worker();

        inner.keep_sampling.store(true, Ordering::SeqCst);
        *lock(&inner.expected_location) = None;
        lock(&inner.ranker).clear_voting_samples();

        let worker = inner.clone();
        let handle = thread::spawn(move || worker.voting_loop(samples));
        *lock(&inner.voting_worker) = Some(handle);
        drop(session);
        info!("[localizer] voting started ({} samples)", samples);
    }

    /// Finish the current fix and publish it.
    ///
    /// In voting mode the in-flight sample completes before the vote is
    /// taken; this returns once the result is published. `expected_location`
    /// is only used for diagnostics.
    pub fn stop_scanning_for_location(&self, expected_location: Option<&str>) {
        let inner = &self.inner;
        *lock(&inner.expected_location) = expected_location.map(str::to_string);

        let voting_worker = lock(&inner.voting_worker).take();
        if let Some(handle) = voting_worker {
            inner.keep_sampling.store(false, Ordering::SeqCst);
            if handle.join().is_err() {
                warn!("[localizer] voting worker panicked");
                inner.use_voting.store(false, Ordering::SeqCst);
            }
            return;
        }

        inner.scanner.stop_scan();
        let observed = inner.scanner.snapshot().mean_table();
        let mut ranker = lock(&inner.ranker);
        inner.match_scan(&mut ranker, &observed, expected_location);
        inner.publish(&ranker);
    }

    // ─── Continuous positioning ──────────────────────────────────────────────

    /// Subscribe to continuous positioning. The shared loop starts with the
    /// first live subscription and stops when the last one is dropped.
    ///
    /// # Arguments
    /// * `frequency_hz` - WiFi scans per second
    /// * `duration_ms` - scan window per cycle (0 = `cycle_interval_ms`)
    pub fn start_continuous_positioning(&self, frequency_hz: u32, duration_ms: u64) -> PositioningSubscription {
        let inner = &self.inner;
        let mut session = lock(&inner.positioning);
        let id = session.next_id;
        session.next_id += 1;
        session.subscribers.insert(id);

        if session.worker.is_none() {
            inner.location_updated.store(false, Ordering::SeqCst);
            lock(&inner.motion_gate).reset();

            let window = if duration_ms == 0 {
                inner.config.cycle_interval()
            } else {
                Duration::from_millis(duration_ms)
            };
            let (cancel, cancel_rx) = bounded::<()>(1);
            let worker = inner.clone();
            let handle = thread::spawn(move || worker.positioning_loop(frequency_hz, window, cancel_rx));
            session.worker = Some(LoopHandle { cancel, handle });
            info!("[localizer] continuous positioning started");
        }
        debug!(
            "[localizer] positioning subscriber {} ({} active)",
            id,
            session.subscribers.len()
        );

        PositioningSubscription {
            id,
            inner: Arc::downgrade(inner),
        }
    }

    /// Release a subscription. Same as dropping it.
    pub fn stop_continuous_positioning(&self, subscription: PositioningSubscription) {
        drop(subscription);
    }

    pub fn positioning_subscribers(&self) -> usize {
        lock(&self.inner.positioning).subscribers.len()
    }

    pub fn is_positioning(&self) -> bool {
        self.inner.positioning_active()
    }

    // ─── Result surface ──────────────────────────────────────────────────────

    /// True once per publish.
    pub fn is_location_updated(&self) -> bool {
        self.inner.location_updated.swap(false, Ordering::SeqCst)
    }

    /// Latest published snapshot.
    pub fn results(&self) -> Arc<PublishedResults> {
        self.inner.published()
    }

    pub fn get_locations(&self) -> Vec<String> {
        self.results().locations(self.inner.config.max_matches)
    }

    pub fn get_proximities(&self) -> Vec<f64> {
        self.results().proximities(self.inner.config.max_matches)
    }

    pub fn get_x_coordinates(&self) -> Vec<i32> {
        self.results().x_coordinates(self.inner.config.max_matches)
    }

    pub fn get_y_coordinates(&self) -> Vec<i32> {
        self.results().y_coordinates(self.inner.config.max_matches)
    }

    pub fn get_latitudes(&self) -> Vec<f64> {
        self.results().latitudes(self.inner.config.max_matches)
    }

    pub fn get_longitudes(&self) -> Vec<f64> {
        self.results().longitudes(self.inner.config.max_matches)
    }

    pub fn get_x(&self) -> i32 {
        self.results().position.pixel.x
    }

    pub fn get_y(&self) -> i32 {
        self.results().position.pixel.y
    }

    pub fn get_latitude(&self) -> f64 {
        self.results().position.lat_lon.latitude
    }

    pub fn get_longitude(&self) -> f64 {
        self.results().position.lat_lon.longitude
    }

    /// Channel receiving one `LocationUpdate` per publish. Slow receivers
    /// miss updates rather than block the loop.
    pub fn subscribe(&self) -> Receiver<LocationUpdate> {
        let (tx, rx) = bounded(UPDATE_CHANNEL_CAPACITY);
        lock(&self.inner.listeners).push(tx);
        rx
    }

    // ─── Motion ──────────────────────────────────────────────────────────────

    /// Sender feeding raw accelerometer samples to the motion gate.
    pub fn motion_sender(&self) -> Sender<AccelSample> {
        self.motion_feed.sender()
    }

    pub fn is_device_moving(&self) -> bool {
        self.inner.moving.load(Ordering::SeqCst)
    }

    // ─── Fingerprint data ────────────────────────────────────────────────────

    /// Load fingerprints under `root` in the background: flush stale radio
    /// results, take a short seed scan, preload the locations it points at,
    /// then load everything matching `map_pattern`.
    pub fn load_fingerprints(&self, root: impl AsRef<Path>, map_pattern: Option<&str>) -> LResult<()> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(crate::error::LocalizerError::MissingRoot(root.display().to_string()));
        }
        if let Some(pattern) = map_pattern {
            full_match_regex(pattern)?;
        }

        let inner = &self.inner;
        let mut loader = lock(&inner.loader);
        if let Some(old) = loader.take() {
            inner.stop_loader(old);
        }

        let scanner = inner.scanner.clone();
        let store = inner.store.clone();
        let poll = inner.config.poll_interval();
        let pattern = map_pattern.map(str::to_string);
        let (cancel, cancel_rx) = bounded::<()>(1);
        let handle = thread::spawn(move || load_data(scanner, store, root, pattern, poll, cancel_rx));
        *loader = Some(LoopHandle { cancel, handle });
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.inner.store.done_reloading()
    }

    pub fn get_all_locations_by_prefix(&self, map_pattern: Option<&str>, prefix: &str) -> LResult<Vec<String>> {
        let pattern = map_pattern.map(full_match_regex).transpose()?;
        Ok(self.inner.store.snapshot().locations_by_prefix(pattern.as_ref(), prefix))
    }

    pub fn get_xy_for_location(&self, map_pattern: Option<&str>, location: &str) -> LResult<Option<PixelPoint>> {
        let pattern = map_pattern.map(full_match_regex).transpose()?;
        Ok(self.inner.store.snapshot().xy_for_location(pattern.as_ref(), location))
    }

    pub fn get_lat_lon_for_location(&self, map_name: Option<&str>, location: &str) -> Option<LatLon> {
        self.inner.store.snapshot().lat_lon_for_location(map_name, location)
    }

    /// Save the scans accumulated since the last scan start as a fingerprint.
    pub fn save_current_scan(
        &self,
        map_name: &str,
        location_name: &str,
        pixel: PixelPoint,
        lat_lon: LatLon,
    ) -> LResult<String> {
        let acc = self.inner.scanner.snapshot();
        if acc.is_empty() {
            return Err(crate::error::LocalizerError::EmptyScan);
        }
        let mut record = FingerprintRecord::new(map_name, location_name, acc.mean_table(), pixel, lat_lon);
        record.frequencies = acc.frequency_table();
        record.stddevs = acc.stddev_table();
        self.inner.store.save_fingerprint(record)
    }

    // ─── Scanner pass-through ────────────────────────────────────────────────

    pub fn flush_wifi_scans(&self) {
        self.inner.scanner.flush_wifi_scans();
    }

    pub fn is_flushing(&self) -> bool {
        self.inner.scanner.is_flushing()
    }

    pub fn is_scanning_wifi(&self) -> bool {
        self.inner.scanner.is_scanning_wifi()
    }

    // ─── Introspection ───────────────────────────────────────────────────────

    pub fn state(&self) -> LocalizerState {
        *lock(&self.inner.state)
    }

    pub fn config(&self) -> &LocalizerConfig {
        &self.inner.config
    }

    pub fn status(&self) -> LocalizerStatus {
        let inner = &self.inner;
        let results = inner.published();
        let best = results.best();
        LocalizerStatus {
            timestamp: current_timestamp(),
            state: self.state(),
            ready: inner.store.done_reloading(),
            fingerprints: inner.store.snapshot().len(),
            scanning: inner.scanner.is_scanning_wifi(),
            flushing: inner.scanner.is_flushing(),
            moving: inner.moving.load(Ordering::SeqCst),
            voting: inner.use_voting.load(Ordering::SeqCst),
            positioning_subscribers: self.positioning_subscribers(),
            voting_samples: lock(&inner.ranker).voting_sample_count(),
            cycles: inner.cycles.load(Ordering::SeqCst),
            publishes: inner.publishes.load(Ordering::SeqCst),
            best_location: best.map(|m| m.location_key.clone()),
            best_score: best.map(|m| m.score),
            candidates: results.ranked.len(),
            x: results.position.pixel.x,
            y: results.position.pixel.y,
            latitude: results.position.lat_lon.latitude,
            longitude: results.position.lat_lon.longitude,
            published_at: results.published_at,
        }
    }

    /// Stop every worker and the scanner. Idempotent.
    pub fn shutdown(&self) {
        let inner = &self.inner;

        inner.keep_sampling.store(false, Ordering::SeqCst);
        if let Some(handle) = lock(&inner.voting_worker).take() {
            let _ = handle.join();
        }

        {
            let mut session = lock(&inner.positioning);
            session.subscribers.clear();
            if let Some(worker) = session.worker.take() {
                inner.stop_loop(worker);
            }
        }

        if let Some(loader) = lock(&inner.loader).take() {
            inner.stop_loader(loader);
        }

        inner.scanner.stop_scan();
        inner.set_state(LocalizerState::Idle);
    }
}

impl Drop for Localizer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Keeps continuous positioning alive while held.
pub struct PositioningSubscription {
    id: u64,
    inner: Weak<Inner>,
}

impl PositioningSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for PositioningSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.unsubscribe(self.id);
        }
    }
}

// ─── Worker side ─────────────────────────────────────────────────────────────

impl Inner {
    fn set_state(&self, state: LocalizerState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!("[localizer] {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    fn published(&self) -> Arc<PublishedResults> {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn positioning_active(&self) -> bool {
        lock(&self.positioning).worker.is_some()
    }

    fn unsubscribe(&self, id: u64) {
        let mut session = lock(&self.positioning);
        if !session.subscribers.remove(&id) {
            return;
        }
        debug!(
            "[localizer] positioning subscriber {} released ({} left)",
            id,
            session.subscribers.len()
        );
        if session.subscribers.is_empty() {
            if let Some(worker) = session.worker.take() {
                // Joined under the session lock so a concurrent start cannot
                // spawn a second loop in between.
                self.stop_loop(worker);
            }
        }
    }

    /// Join a voting worker left in its slot. Call with the positioning lock
    /// held and `use_voting` clear, so the worker is already on its way out.
    fn reap_voting_worker(&self) {
        let finished = lock(&self.voting_worker).take();
        if let Some(old) = finished {
            let _ = old.join();
        }
    }

    /// Cancel a fingerprint loader and wait for it. A seed scan in flight is
    /// stopped so the loader never waits on the radio.
    fn stop_loader(&self, loader: LoopHandle) {
        self.store.stop_reload();
        let _ = loader.cancel.try_send(());
        if !loader.handle.is_finished() {
            self.scanner.stop_scan();
        }
        if loader.handle.join().is_err() {
            warn!("[loader] loader thread panicked");
        }
    }

    fn stop_loop(&self, worker: LoopHandle) {
        let _ = worker.cancel.try_send(());
        if worker.handle.join().is_err() {
            warn!("[localizer] positioning loop panicked");
        }
        self.location_updated.store(false, Ordering::SeqCst);
        self.set_state(LocalizerState::Idle);
        info!("[localizer] continuous positioning stopped");
    }

    /// Replace the working ranking with the matches for `observed`.
    fn match_scan(&self, ranker: &mut LocationRanker, observed: &SignalTable, expected: Option<&str>) -> usize {
        self.set_state(LocalizerState::Matching);
        self.cycles.fetch_add(1, Ordering::SeqCst);
        let db = self.store.snapshot();
        let found = self.matcher.compute_match(observed, &db, ranker, expected);
        debug!(
            "[localizer] {} candidates from {} access points",
            found,
            observed.len()
        );
        found
    }

    /// Interpolate and hand the ranking to readers. Returns false (and keeps
    /// the previous results) when there is nothing to publish.
    fn publish(&self, ranker: &LocationRanker) -> bool {
        let Some(position) = final_position(ranker.matches()) else {
            self.set_state(LocalizerState::Ranked);
            debug!("[localizer] no candidates, nothing published");
            return false;
        };

        let results = Arc::new(ranker.copy_results_to_final(position));
        *self.published.write().unwrap_or_else(PoisonError::into_inner) = results.clone();
        self.location_updated.store(true, Ordering::SeqCst);
        self.publishes.fetch_add(1, Ordering::SeqCst);
        self.set_state(LocalizerState::Published);

        let best = results.best();
        let update = LocationUpdate {
            timestamp: results.published_at,
            position,
            best_location: best.map(|m| m.location_key.clone()),
            best_score: best.map(|m| m.score),
            candidates: results.ranked.len(),
        };
        lock(&self.listeners).retain(|tx| match tx.try_send(update.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
        true
    }

    fn wait_while_flushing(&self) {
        while self.scanner.is_flushing() {
            thread::sleep(self.config.poll_interval());
        }
    }

    fn voting_loop(self: Arc<Self>, samples: u32) {
        self.set_state(LocalizerState::Voting);
        self.wait_while_flushing();

        let mut history: Vec<SignalTable> = Vec::new();
        while self.keep_sampling.load(Ordering::SeqCst)
            && (samples == 0 || (history.len() as u32) < samples)
        {
            self.scanner.start_scan(self.config.voting_scan_frequency);
            thread::sleep(self.config.voting_sample());
            self.scanner.stop_scan();
            history.push(self.scanner.snapshot().mean_table());
        }
        debug!("[localizer] voting over {} samples", history.len());

        let expected = lock(&self.expected_location).clone();
        let mut ranker = lock(&self.ranker);
        ranker.set_voting(true);
        for observed in &history {
            self.match_scan(&mut ranker, observed, expected.as_deref());
            ranker.add_result_to_voting_samples();
        }
        ranker.set_voting(false);

        self.set_state(LocalizerState::Voting);
        ranker.do_voting();
        self.publish(&ranker);
        drop(ranker);

        self.use_voting.store(false, Ordering::SeqCst);
        self.keep_sampling.store(false, Ordering::SeqCst);
    }

    fn positioning_loop(self: Arc<Self>, frequency_hz: u32, window: Duration, cancel: Receiver<()>) {
        let poll = self.config.poll_interval();
        loop {
            if !self.use_voting.load(Ordering::SeqCst) {
                if self.scanner.is_scanning_wifi() {
                    self.positioning_cycle();
                }

                let mut cancelled = false;
                while self.scanner.is_flushing() {
                    if cancelled_within(&cancel, poll) {
                        cancelled = true;
                        break;
                    }
                }
                if cancelled {
                    break;
                }

                lock(&self.ranker).clear();
                self.scanner.start_scan(frequency_hz);
                self.set_state(LocalizerState::Scanning);
            }

            if cancelled_within(&cancel, window) {
                break;
            }
        }
        self.scanner.stop_scan();
    }

    fn positioning_cycle(&self) {
        self.scanner.stop_scan();
        let observed = self.scanner.snapshot().mean_table();

        let mut ranker = lock(&self.ranker);
        self.match_scan(&mut ranker, &observed, None);

        let moving = self.config.motion_gating && self.moving.load(Ordering::SeqCst);
        if moving {
            debug!("[localizer] moving, dropping voting history");
            ranker.clear_voting_samples();
        } else {
            ranker.add_result_to_voting_samples();
            ranker.do_voting();
        }
        self.publish(&ranker);
    }
}

/// Sleep for `timeout` unless cancelled. Returns true on cancellation.
fn cancelled_within(cancel: &Receiver<()>, timeout: Duration) -> bool {
    !matches!(cancel.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
}

fn load_data(
    scanner: Arc<dyn WifiScanner>,
    store: Arc<dyn FingerprintStore>,
    root: PathBuf,
    map_pattern: Option<String>,
    poll: Duration,
    cancel: Receiver<()>,
) {
    scanner.flush_wifi_scans();
    while scanner.is_flushing() {
        if cancelled_within(&cancel, poll) {
            debug!("[loader] cancelled while flushing");
            return;
        }
    }

    scanner.set_scan_time(SEED_SCAN_TIME_MS);
    scanner.start_scan(SEED_SCAN_FREQUENCY);
    let deadline = Instant::now() + Duration::from_millis(SEED_SCAN_TIME_MS);
    let mut cancelled = false;
    while scanner.is_scanning_wifi() && Instant::now() < deadline {
        if cancelled_within(&cancel, poll) {
            cancelled = true;
            break;
        }
    }
    scanner.stop_scan();
    scanner.set_scan_time(MAX_SCAN_TIME_MS);
    if cancelled {
        debug!("[loader] cancelled during seed scan");
        return;
    }
    let seed = scanner.snapshot().mean_table();

    let pattern = map_pattern.as_deref();
    if !seed.is_empty() {
        match store.reload(&root, pattern, Some(&seed)) {
            Ok(n) => info!("[loader] seeded {} fingerprints", n),
            Err(e) => warn!("[loader] seeded reload failed: {}", e),
        }
    }
    if !matches!(cancel.try_recv(), Err(TryRecvError::Empty)) {
        debug!("[loader] cancelled before full reload");
        return;
    }
    match store.reload(&root, pattern, None) {
        Ok(n) => info!("[loader] {} fingerprints ready", n),
        Err(e) => warn!("[loader] reload failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{ScanSource, ThreadedScanner};
    use crate::store::LocalFingerprintStore;
    use crate::types::SignalSample;

    /// Radio returning the same sweep forever.
    struct SteadySource(Vec<SignalSample>);

    impl ScanSource for SteadySource {
        fn scan(&mut self) -> Option<Vec<SignalSample>> {
            Some(self.0.clone())
        }
    }

    fn table(aps: &[(&str, f64)]) -> SignalTable {
        aps.iter().map(|(a, s)| (a.to_string(), *s)).collect()
    }

    fn two_room_store() -> Arc<LocalFingerprintStore> {
        Arc::new(LocalFingerprintStore::from_records(vec![
            FingerprintRecord::new("lab", "A", table(&[("ap1", -60.0), ("ap2", -70.0)]), PixelPoint::new(0, 0), LatLon::UNKNOWN),
            FingerprintRecord::new("lab", "B", table(&[("ap1", -65.0), ("ap2", -90.0)]), PixelPoint::new(100, 0), LatLon::UNKNOWN),
        ]))
    }

    fn fast_config() -> LocalizerConfig {
        LocalizerConfig {
            voting_sample_ms: 120,
            voting_scan_frequency: 20,
            cycle_interval_ms: 150,
            poll_interval_ms: 10,
            ..Default::default()
        }
    }

    fn localizer(sweep: &[(&str, f64)]) -> Localizer {
        let samples = sweep.iter().map(|(a, s)| SignalSample::new(*a, *s)).collect();
        let scanner = Arc::new(ThreadedScanner::with_flush_time(Box::new(SteadySource(samples)), 100));
        Localizer::with_local_matcher(fast_config(), scanner, two_room_store())
    }

    fn wait_for_update(loc: &Localizer, max_ms: u64) -> bool {
        let mut waited = 0;
        while waited < max_ms {
            if loc.is_location_updated() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
            waited += 10;
        }
        false
    }

    #[test]
    fn test_single_shot_two_rooms() {
        let loc = localizer(&[("ap1", -61.0), ("ap2", -71.0)]);
        let updates = loc.subscribe();
        loc.start_scanning_for_location(20, false, 0);
        thread::sleep(Duration::from_millis(200));
        loc.stop_scanning_for_location(Some("lab_A"));

        assert!(loc.is_location_updated());
        assert!(!loc.is_location_updated(), "edge-triggered");
        assert_eq!(loc.get_locations(), vec!["lab_A".to_string(), "lab_B".to_string()]);
        let prox = loc.get_proximities();
        assert!(prox[0] < prox[1]);
        // Pulled slightly toward B: 100 * 0.707 / (0.707 + 9.708) = 6.79.
        assert_eq!(loc.get_x(), 6);
        assert_eq!(loc.get_y(), 0);
        assert_eq!(loc.state(), LocalizerState::Published);

        let update = updates.try_recv().unwrap();
        assert_eq!(update.best_location.as_deref(), Some("lab_A"));
        assert_eq!(update.position.pixel.x, 6);
    }

    #[test]
    fn test_no_candidates_publishes_nothing() {
        // Only weak access points: reverse index yields no candidates.
        let loc = localizer(&[("ap1", -80.0), ("ap2", -90.0)]);
        loc.start_scanning_for_location(20, false, 0);
        thread::sleep(Duration::from_millis(150));
        loc.stop_scanning_for_location(None);
        assert!(!loc.is_location_updated());
        assert!(loc.get_locations().is_empty());
        assert_eq!(loc.state(), LocalizerState::Ranked);
    }

    #[test]
    fn test_voting_with_sample_budget() {
        let loc = localizer(&[("ap1", -61.0), ("ap2", -71.0)]);
        loc.start_scanning_for_location(20, true, 3);
        assert!(wait_for_update(&loc, 3000), "voting must publish");
        // Identical samples vote back to the single-sample score.
        let prox = loc.get_proximities();
        approx::assert_relative_eq!(prox[0], 2f64.sqrt() / 2.0, epsilon = 1e-9);
        assert_eq!(loc.get_locations()[0], "lab_A");
        assert_eq!(loc.status().voting_samples, 3);
        loc.stop_scanning_for_location(None);
    }

    #[test]
    fn test_voting_until_stopped() {
        let loc = localizer(&[("ap1", -61.0), ("ap2", -71.0)]);
        loc.start_scanning_for_location(20, true, 0);
        thread::sleep(Duration::from_millis(400));
        // Second start while voting is a no-op.
        loc.start_scanning_for_location(20, true, 0);
        loc.stop_scanning_for_location(Some("lab_A"));
        assert!(loc.is_location_updated());
        assert!(loc.status().voting_samples >= 2);
        assert!(!loc.status().voting);
    }

    #[test]
    fn test_continuous_positioning_is_ref_counted() {
        let loc = localizer(&[("ap1", -61.0), ("ap2", -71.0)]);
        let first = loc.start_continuous_positioning(20, 0);
        let second = loc.start_continuous_positioning(20, 0);
        assert_eq!(loc.positioning_subscribers(), 2);

        loc.stop_continuous_positioning(first);
        assert!(loc.is_positioning(), "one subscriber left, loop keeps running");
        assert!(wait_for_update(&loc, 2000), "loop still publishes");

        loc.stop_continuous_positioning(second);
        assert!(!loc.is_positioning());
        assert_eq!(loc.state(), LocalizerState::Idle);

        let publishes = loc.status().publishes;
        thread::sleep(Duration::from_millis(400));
        assert_eq!(loc.status().publishes, publishes, "no publish after stop");
        assert!(!loc.is_location_updated());
    }

    #[test]
    fn test_voting_refused_during_continuous() {
        let loc = localizer(&[("ap1", -61.0), ("ap2", -71.0)]);
        let sub = loc.start_continuous_positioning(20, 0);
        loc.start_scanning_for_location(20, true, 2);
        assert!(!loc.status().voting);
        drop(sub);
        assert!(!loc.is_positioning());
    }

    #[test]
    fn test_motion_clears_history() {
        let loc = localizer(&[("ap1", -61.0), ("ap2", -71.0)]);
        loc.inner.moving.store(true, Ordering::SeqCst);
        let _sub = loc.start_continuous_positioning(20, 0);
        assert!(wait_for_update(&loc, 2000));
        assert_eq!(loc.status().voting_samples, 0);
        assert_eq!(loc.get_locations()[0], "lab_A");
    }

    #[test]
    fn test_stationary_accumulates_history() {
        let loc = localizer(&[("ap1", -61.0), ("ap2", -71.0)]);
        let _sub = loc.start_continuous_positioning(20, 0);
        assert!(wait_for_update(&loc, 2000));
        assert!(wait_for_update(&loc, 2000));
        assert!(loc.status().voting_samples >= 2);
    }

    #[test]
    fn test_save_and_lookup_round_trip() {
        let root = temp_root("ctl");
        let loc = localizer(&[("ap7", -55.0)]);
        loc.load_fingerprints(&root, None).unwrap();
        let loader = lock(&loc.inner.loader).take();
        loader.unwrap().handle.join().unwrap();
        assert!(loc.is_ready());
        assert_eq!(loc.status().fingerprints, 0, "empty root replaces the in-memory records");

        loc.start_scanning_for_location(20, false, 0);
        thread::sleep(Duration::from_millis(150));
        loc.inner.scanner.stop_scan();
        let key = loc
            .save_current_scan("lab", "door", PixelPoint::new(3, 4), LatLon::new(1.0, 2.0))
            .unwrap();
        assert_eq!(key, "lab_door");
        assert_eq!(loc.get_all_locations_by_prefix(Some("lab"), "do").unwrap(), vec!["lab_door".to_string()]);
        assert_eq!(loc.get_xy_for_location(None, "door").unwrap(), Some(PixelPoint::new(3, 4)));
        assert_eq!(loc.get_lat_lon_for_location(Some("LAB"), "door"), Some(LatLon::new(1.0, 2.0)));

        std::fs::remove_dir_all(&root).ok();
    }

    /// Radio that answers every sweep with nothing in range.
    struct EmptyRadio;

    impl ScanSource for EmptyRadio {
        fn scan(&mut self) -> Option<Vec<SignalSample>> {
            Some(Vec::new())
        }
    }

    fn empty_radio_localizer() -> Localizer {
        let scanner = Arc::new(ThreadedScanner::with_flush_time(Box::new(EmptyRadio), 100));
        Localizer::with_local_matcher(fast_config(), scanner, Arc::new(LocalFingerprintStore::new()))
    }

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "wifi_localizer_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
        ));
        std::fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn test_shutdown_interrupts_seed_scan() {
        let root = temp_root("shutdown");
        let loc = empty_radio_localizer();
        loc.load_fingerprints(&root, None).unwrap();
        thread::sleep(Duration::from_millis(300));
        assert!(!loc.is_ready(), "still in the seed scan");

        let (done_tx, done_rx) = bounded(1);
        thread::spawn(move || {
            let started = Instant::now();
            loc.shutdown();
            drop(loc);
            let _ = done_tx.send(started.elapsed());
        });
        let elapsed = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("shutdown must not hang");
        assert!(elapsed < Duration::from_millis(800), "took {:?}", elapsed);

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_load_finishes_with_silent_radio() {
        let root = temp_root("silent");
        let loc = empty_radio_localizer();
        loc.load_fingerprints(&root, None).unwrap();
        let mut waited = 0;
        while !loc.is_ready() && waited < 3000 {
            thread::sleep(Duration::from_millis(20));
            waited += 20;
        }
        assert!(loc.is_ready());
        assert!(!loc.is_scanning_wifi());
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_concurrent_voting_starts_run_one_session() {
        let loc = Arc::new(localizer(&[("ap1", -61.0), ("ap2", -71.0)]));
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let starters: Vec<_> = (0..8)
            .map(|_| {
                let loc = loc.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    loc.start_scanning_for_location(20, true, 0);
                })
            })
            .collect();
        for starter in starters {
            starter.join().unwrap();
        }

        thread::sleep(Duration::from_millis(300));
        loc.stop_scanning_for_location(None);
        assert!(!loc.status().voting);
        assert_eq!(loc.status().publishes, 1);

        thread::sleep(Duration::from_millis(400));
        assert_eq!(loc.status().publishes, 1, "no stray worker publishes later");
    }

    #[test]
    fn test_stop_interrupts_sleeping_loop() {
        let samples = vec![SignalSample::new("ap1", -61.0)];
        let scanner = Arc::new(ThreadedScanner::with_flush_time(Box::new(SteadySource(samples)), 100));
        let config = LocalizerConfig {
            cycle_interval_ms: 10_000,
            ..fast_config()
        };
        let loc = Localizer::with_local_matcher(config, scanner, two_room_store());

        let sub = loc.start_continuous_positioning(20, 0);
        thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        drop(sub);
        assert!(started.elapsed() < Duration::from_millis(500), "took {:?}", started.elapsed());
        assert!(!loc.is_positioning());
        assert!(!loc.is_scanning_wifi());
    }

    #[test]
    fn test_load_rejects_missing_root() {
        let loc = localizer(&[("ap1", -61.0)]);
        assert!(loc.load_fingerprints("/nonexistent/fingerprints", None).is_err());
        assert!(loc.load_fingerprints(std::env::temp_dir(), Some("(")).is_err());
    }
}

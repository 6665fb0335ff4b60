use crate::accumulator::SignalAccumulator;
use crate::types::{SignalSample, SignalTable};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const DEFAULT_SCAN_FREQUENCY: u32 = 4;
pub const FLUSH_FREQUENCY: u32 = 10;
pub const FLUSH_TIME_MS: u64 = 2000;
pub const MAX_SCAN_TIME_MS: u64 = 30_000;
const WAIT_POLL: Duration = Duration::from_millis(50);

/// One radio sweep. `None` means the radio is unavailable.
pub trait ScanSource: Send {
    fn scan(&mut self) -> Option<Vec<SignalSample>>;
}

/// WiFi scanner collaborator used by the controller.
pub trait WifiScanner: Send + Sync {
    /// Reset the accumulated table and start sampling at `frequency_hz`
    /// (0 selects the default). Blocks while a flush is in progress.
    fn start_scan(&self, frequency_hz: u32);

    /// Stop sampling. Once this returns no further scan lands in the table.
    fn stop_scan(&self);

    fn is_scanning_wifi(&self) -> bool;

    fn is_flushing(&self) -> bool;

    /// Discard stale radio results for a while.
    fn flush_wifi_scans(&self);

    /// Bound on the length of a scan session.
    fn set_scan_time(&self, millis: u64);

    /// Copy of the table accumulated since the last `start_scan`.
    fn snapshot(&self) -> SignalAccumulator;

    fn wifi_strength_table(&self) -> SignalTable {
        self.snapshot().mean_table()
    }

    fn wifi_count_table(&self) -> HashMap<String, u32> {
        self.snapshot().count_table()
    }

    fn num_scans(&self) -> u32 {
        self.snapshot().num_scans()
    }
}

struct ScannerShared {
    source: Mutex<Box<dyn ScanSource>>,
    table: Mutex<SignalAccumulator>,
    scanning: AtomicBool,
    flushing: AtomicBool,
    generation: AtomicU64,
    max_scan_ms: AtomicU64,
    flush_time_ms: u64,
}

/// `WifiScanner` driving a `ScanSource` from a sampling thread.
///
/// # Architecture
/// Each `start_scan` or `flush_wifi_scans` bumps a generation counter and
/// spawns a fresh worker; a worker exits as soon as it notices it has been
/// superseded or scanning was stopped.
pub struct ThreadedScanner {
    shared: Arc<ScannerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadedScanner {
    pub fn new(source: Box<dyn ScanSource>) -> Self {
        Self::with_flush_time(source, FLUSH_TIME_MS)
    }

    pub fn with_flush_time(source: Box<dyn ScanSource>, flush_time_ms: u64) -> Self {
        Self {
            shared: Arc::new(ScannerShared {
                source: Mutex::new(source),
                table: Mutex::new(SignalAccumulator::new()),
                scanning: AtomicBool::new(false),
                flushing: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                max_scan_ms: AtomicU64::new(MAX_SCAN_TIME_MS),
                flush_time_ms,
            }),
            worker: Mutex::new(None),
        }
    }

    fn replace_worker(&self, handle: Option<JoinHandle<()>>) {
        let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = slot.take() {
            let _ = old.join();
        }
        *slot = handle;
    }

    fn wait_while_flushing(&self) {
        while self.shared.flushing.load(Ordering::SeqCst) {
            thread::sleep(WAIT_POLL);
        }
    }
}

impl WifiScanner for ThreadedScanner {
    fn start_scan(&self, frequency_hz: u32) {
        self.wait_while_flushing();
        let frequency = if frequency_hz == 0 { DEFAULT_SCAN_FREQUENCY } else { frequency_hz };

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.replace_worker(None);

        self.shared
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
        self.shared.scanning.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let handle = thread::spawn(move || scan_loop(shared, generation, frequency));
        self.replace_worker(Some(handle));
        debug!("[scanner] scanning at {} Hz", frequency);
    }

    fn stop_scan(&self) {
        if !self.shared.scanning.swap(false, Ordering::SeqCst) {
            return;
        }
        // Wait out an in-flight accumulation.
        drop(self.shared.table.lock().unwrap_or_else(PoisonError::into_inner));
        debug!("[scanner] stopped");
    }

    fn is_scanning_wifi(&self) -> bool {
        self.shared.scanning.load(Ordering::SeqCst)
    }

    fn is_flushing(&self) -> bool {
        self.shared.flushing.load(Ordering::SeqCst)
    }

    fn flush_wifi_scans(&self) {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.scanning.store(false, Ordering::SeqCst);
        self.shared.flushing.store(true, Ordering::SeqCst);
        self.replace_worker(None);

        let shared = self.shared.clone();
        let handle = thread::spawn(move || flush_loop(shared, generation));
        self.replace_worker(Some(handle));
    }

    fn set_scan_time(&self, millis: u64) {
        self.shared.max_scan_ms.store(millis, Ordering::SeqCst);
    }

    fn snapshot(&self) -> SignalAccumulator {
        self.shared
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for ThreadedScanner {
    fn drop(&mut self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.scanning.store(false, Ordering::SeqCst);
        self.replace_worker(None);
        self.shared.flushing.store(false, Ordering::SeqCst);
    }
}

fn period_for(frequency: u32) -> u64 {
    1000 / frequency.max(1) as u64
}

fn scan_loop(shared: Arc<ScannerShared>, generation: u64, frequency: u32) {
    let period_ms = period_for(frequency);
    let mut scan_no = 0u64;

    loop {
        thread::sleep(Duration::from_millis(period_ms));
        if shared.generation.load(Ordering::SeqCst) != generation
            || !shared.scanning.load(Ordering::SeqCst)
        {
            return;
        }

        let result = shared
            .source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .scan();
        let Some(samples) = result else {
            warn!("[scanner] radio unavailable, stopping scan");
            shared.scanning.store(false, Ordering::SeqCst);
            return;
        };
        // Empty sweeps add nothing but still use up scan time.
        if !samples.is_empty() {
            let mut table = shared.table.lock().unwrap_or_else(PoisonError::into_inner);
            if shared.generation.load(Ordering::SeqCst) != generation
                || !shared.scanning.load(Ordering::SeqCst)
            {
                return;
            }
            table.add_scan(&samples);
        }
        scan_no += 1;

        if scan_no * period_ms >= shared.max_scan_ms.load(Ordering::SeqCst) {
            info!("[scanner] max scan time reached after {} scans", scan_no);
            shared.scanning.store(false, Ordering::SeqCst);
            return;
        }
    }
}

fn flush_loop(shared: Arc<ScannerShared>, generation: u64) {
    let period_ms = period_for(FLUSH_FREQUENCY);
    let mut ticks = 0u64;

    while ticks * period_ms < shared.flush_time_ms {
        thread::sleep(Duration::from_millis(period_ms));
        if shared.generation.load(Ordering::SeqCst) != generation {
            break;
        }
        let result = shared
            .source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .scan();
        if result.is_none() {
            warn!("[scanner] radio unavailable during flush");
            break;
        }
        ticks += 1;
    }
    shared.flushing.store(false, Ordering::SeqCst);
    debug!("[scanner] flush done after {} sweeps", ticks);
}

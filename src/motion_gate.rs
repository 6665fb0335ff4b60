use crate::config::LocalizerConfig;
use crate::types::AccelSample;
use crossbeam::channel::{bounded, select, Receiver, Sender};
use log::{debug, info};
use nalgebra::Vector3;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

/// Stationary/moving classifier over a sliding accelerometer window.
///
/// Motion score per axis is the summed absolute sample-to-sample change over
/// the window. A single spike above the threshold only arms the detector;
/// `is_moving` turns true once the threshold has been exceeded continuously
/// for longer than the sustain time.
pub struct MotionGate {
    window: VecDeque<Vector3<f64>>,
    window_size: usize,
    threshold: f64,
    sustain_secs: f64,
    moving_since: Option<f64>,
    is_moving: bool,
}

impl MotionGate {
    pub fn new(window_size: usize, threshold: f64, sustain_ms: u64) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(2),
            threshold,
            sustain_secs: sustain_ms as f64 / 1000.0,
            moving_since: None,
            is_moving: false,
        }
    }

    pub fn from_config(config: &LocalizerConfig) -> Self {
        Self::new(
            config.motion_window,
            config.motion_threshold,
            config.motion_sustain_ms,
        )
    }

    /// Feed one sample and return the updated moving flag.
    pub fn push(&mut self, sample: &AccelSample) -> bool {
        self.window
            .push_back(Vector3::new(sample.x, sample.y, sample.z));
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }

        let variation = self.variation();
        let exceeded = variation.iter().any(|v| *v > self.threshold);

        self.is_moving = if exceeded {
            match self.moving_since {
                None => {
                    self.moving_since = Some(sample.timestamp);
                    false
                }
                Some(start) => sample.timestamp - start > self.sustain_secs,
            }
        } else {
            self.moving_since = None;
            false
        };
        self.is_moving
    }

    /// Summed absolute per-axis change across the window.
    pub fn variation(&self) -> Vector3<f64> {
        self.window
            .iter()
            .zip(self.window.iter().skip(1))
            .fold(Vector3::zeros(), |acc, (prev, next)| {
                acc + (next - prev).map(f64::abs)
            })
    }

    pub fn is_moving(&self) -> bool {
        self.is_moving
    }

    /// Drop buffered samples. The armed start time is kept.
    pub fn reset(&mut self) {
        self.window.clear();
    }
}

// ─── Background feed ─────────────────────────────────────────────────────────

/// Filters raw accelerometer samples into a shared `MotionGate` on its own
/// thread. Readers check `moving` without blocking on the feed.
pub struct MotionFeed {
    tx: Sender<AccelSample>,
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<u64>>,
}

impl MotionFeed {
    pub fn spawn(gate: Arc<Mutex<MotionGate>>, moving: Arc<AtomicBool>) -> Self {
        let (tx, rx) = bounded::<AccelSample>(500);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let handle = std::thread::spawn(move || feed_loop(gate, moving, rx, stop_rx));

        Self {
            tx,
            stop_tx,
            handle: Some(handle),
        }
    }

    pub fn sender(&self) -> Sender<AccelSample> {
        self.tx.clone()
    }
}

impl Drop for MotionFeed {
    fn drop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            if let Ok(count) = handle.join() {
                debug!("[motion] feed stopped after {} samples", count);
            }
        }
    }
}

fn feed_loop(
    gate: Arc<Mutex<MotionGate>>,
    moving: Arc<AtomicBool>,
    rx: Receiver<AccelSample>,
    stop_rx: Receiver<()>,
) -> u64 {
    let mut sample_count = 0u64;
    loop {
        select! {
            recv(rx) -> msg => match msg {
                Ok(sample) => {
                    let now_moving = gate
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(&sample);
                    let was_moving = moving.swap(now_moving, Ordering::SeqCst);
                    if was_moving != now_moving {
                        info!("[motion] device {}", if now_moving { "moving" } else { "stationary" });
                    }
                    sample_count += 1;
                }
                Err(_) => break,
            },
            recv(stop_rx) -> _ => break,
        }
    }
    sample_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample(t: f64, x: f64) -> AccelSample {
        AccelSample {
            timestamp: t,
            x,
            y: 0.0,
            z: 9.8,
        }
    }

    /// 50 Hz samples alternating +/-3 on x: summed change far above 4.
    fn shake(gate: &mut MotionGate, start: f64, secs: f64) -> (bool, f64) {
        let mut t = start;
        let mut last = false;
        let mut i = 0;
        while t < start + secs {
            let x = if i % 2 == 0 { 3.0 } else { -3.0 };
            last = gate.push(&sample(t, x));
            t += 0.02;
            i += 1;
        }
        (last, t)
    }

    #[test]
    fn test_short_jostle_is_not_motion() {
        let mut gate = MotionGate::new(20, 4.0, 1500);
        let (moving, _) = shake(&mut gate, 0.0, 1.0);
        assert!(!moving, "1s of shaking must not count as moving");
    }

    #[test]
    fn test_sustained_motion_then_full_quiet_window() {
        let mut gate = MotionGate::new(20, 4.0, 1500);
        let (moving, mut t) = shake(&mut gate, 0.0, 2.0);
        assert!(moving, "2s of shaking must count as moving");

        // A few flat samples keep earlier spikes inside the window.
        for _ in 0..5 {
            assert!(gate.push(&sample(t, 0.0)), "spikes still in window");
            t += 0.02;
        }

        for _ in 0..20 {
            gate.push(&sample(t, 0.0));
            t += 0.02;
        }
        assert!(!gate.is_moving(), "a full quiet window clears motion");
        assert_eq!(gate.variation().x, 0.0);
    }

    #[test]
    fn test_reset_clears_window_only() {
        let mut gate = MotionGate::new(20, 4.0, 1500);
        shake(&mut gate, 0.0, 0.5);
        gate.reset();
        assert_eq!(gate.variation(), Vector3::zeros());
        // The first sample after a reset has no neighbour, so detection re-arms.
        let (moving, _) = shake(&mut gate, 0.5, 1.2);
        assert!(!moving);
    }

    #[test]
    fn test_feed_updates_shared_flag() {
        let gate = Arc::new(Mutex::new(MotionGate::new(20, 4.0, 100)));
        let moving = Arc::new(AtomicBool::new(false));
        let feed = MotionFeed::spawn(gate.clone(), moving.clone());
        let tx = feed.sender();

        for i in 0..30 {
            let x = if i % 2 == 0 { 5.0 } else { -5.0 };
            tx.send(sample(i as f64 * 0.02, x)).unwrap();
        }

        let mut waited = 0;
        while !moving.load(Ordering::SeqCst) && waited < 100 {
            std::thread::sleep(Duration::from_millis(10));
            waited += 1;
        }
        assert!(moving.load(Ordering::SeqCst));
        drop(feed);
    }
}

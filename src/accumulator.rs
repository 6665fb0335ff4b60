use crate::types::{SignalSample, SignalTable};
use std::collections::HashMap;

/// Running per-access-point sums over the scans of one session.
///
/// Cloning takes a snapshot; the scanner hands out clones so a matcher never
/// reads a table that the sampling thread is still writing.
#[derive(Clone, Debug, Default)]
pub struct SignalAccumulator {
    sums: HashMap<String, f64>,
    sum_squares: HashMap<String, f64>,
    counts: HashMap<String, u32>,
    num_scans: u32,
}

impl SignalAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sample(&mut self, access_point: &str, strength_dbm: f64) {
        *self.sums.entry(access_point.to_string()).or_insert(0.0) += strength_dbm;
        *self.sum_squares.entry(access_point.to_string()).or_insert(0.0) +=
            strength_dbm * strength_dbm;
        *self.counts.entry(access_point.to_string()).or_insert(0) += 1;
    }

    /// Fold one complete scan in and count it.
    pub fn add_scan(&mut self, samples: &[SignalSample]) {
        for sample in samples {
            self.add_sample(&sample.access_point, sample.strength_dbm);
        }
        self.num_scans += 1;
    }

    pub fn mean_table(&self) -> SignalTable {
        self.sums
            .iter()
            .filter_map(|(ap, sum)| {
                let count = *self.counts.get(ap)?;
                (count > 0).then(|| (ap.clone(), sum / count as f64))
            })
            .collect()
    }

    pub fn count_table(&self) -> HashMap<String, u32> {
        self.counts.clone()
    }

    /// Fraction of scans in which each access point appeared.
    pub fn frequency_table(&self) -> HashMap<String, f64> {
        if self.num_scans == 0 {
            return HashMap::new();
        }
        self.counts
            .iter()
            .map(|(ap, count)| (ap.clone(), *count as f64 / self.num_scans as f64))
            .collect()
    }

    /// Population standard deviation per access point.
    pub fn stddev_table(&self) -> HashMap<String, f64> {
        self.counts
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(ap, count)| {
                let n = *count as f64;
                let mean = self.sums.get(ap).copied().unwrap_or(0.0) / n;
                let mean_sq = self.sum_squares.get(ap).copied().unwrap_or(0.0) / n;
                (ap.clone(), (mean_sq - mean * mean).max(0.0).sqrt())
            })
            .collect()
    }

    pub fn num_scans(&self) -> u32 {
        self.num_scans
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn reset(&mut self) {
        self.sums.clear();
        self.sum_squares.clear();
        self.counts.clear();
        self.num_scans = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mean_and_frequency() {
        let mut acc = SignalAccumulator::new();
        acc.add_scan(&[SignalSample::new("ap1", -60.0), SignalSample::new("ap2", -80.0)]);
        acc.add_scan(&[SignalSample::new("ap1", -70.0)]);

        let means = acc.mean_table();
        assert_relative_eq!(means["ap1"], -65.0);
        assert_relative_eq!(means["ap2"], -80.0);

        let freq = acc.frequency_table();
        assert_relative_eq!(freq["ap1"], 1.0);
        assert_relative_eq!(freq["ap2"], 0.5);

        assert_eq!(acc.count_table()["ap1"], 2);
        assert_eq!(acc.num_scans(), 2);
    }

    #[test]
    fn test_stddev_is_population() {
        let mut acc = SignalAccumulator::new();
        acc.add_sample("ap1", -60.0);
        acc.add_sample("ap1", -70.0);
        assert_relative_eq!(acc.stddev_table()["ap1"], 5.0, epsilon = 1e-9);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut acc = SignalAccumulator::new();
        acc.add_scan(&[SignalSample::new("ap1", -60.0)]);
        let snapshot = acc.clone();
        acc.reset();
        assert!(acc.is_empty());
        assert_eq!(acc.num_scans(), 0);
        assert!(acc.mean_table().is_empty());
        assert_eq!(snapshot.len(), 1, "snapshot must survive reset");
    }
}

use crate::types::{location_key, FinalPosition, LatLon, MatchResult, PixelPoint};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

pub const DEFAULT_VOTING_CAPACITY: usize = 30;

/// Working ranking for one positioning cycle plus the voting history.
///
/// Outside voting the list is kept sorted ascending by score (lower is
/// better, ties keep insertion order). While voting, inserts append and the
/// order is only rebuilt by `do_voting`.
#[derive(Debug, Clone)]
pub struct LocationRanker {
    matches: Vec<MatchResult>,
    voting: bool,
    history: VecDeque<Vec<MatchResult>>,
    capacity: usize,
}

impl Default for LocationRanker {
    fn default() -> Self {
        Self::new(DEFAULT_VOTING_CAPACITY)
    }
}

impl LocationRanker {
    pub fn new(capacity: usize) -> Self {
        Self {
            matches: Vec::new(),
            voting: false,
            history: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn insert_matching_location(
        &mut self,
        score: f64,
        location_name: &str,
        map_name: &str,
        pixel: PixelPoint,
        lat_lon: LatLon,
    ) {
        self.insert(MatchResult {
            location_key: location_key(map_name, location_name),
            score,
            pixel,
            lat_lon,
        });
    }

    pub fn insert(&mut self, result: MatchResult) {
        if self.voting {
            self.matches.push(result);
        } else {
            self.insert_sorted(result);
        }
    }

    fn insert_sorted(&mut self, result: MatchResult) {
        let index = self
            .matches
            .iter()
            .position(|m| m.score > result.score)
            .unwrap_or(self.matches.len());
        self.matches.insert(index, result);
    }

    pub fn set_voting(&mut self, voting: bool) {
        self.voting = voting;
    }

    pub fn matches(&self) -> &[MatchResult] {
        &self.matches
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    /// Drop the working ranking. Voting history is untouched.
    pub fn clear(&mut self) {
        self.matches.clear();
    }

    /// Store the current ranking as one voting sample, evicting the oldest
    /// sample when full. A location appearing twice keeps its last entry.
    pub fn add_result_to_voting_samples(&mut self) {
        let mut sample: Vec<MatchResult> = Vec::with_capacity(self.matches.len());
        for result in &self.matches {
            match sample
                .iter_mut()
                .find(|m| m.location_key == result.location_key)
            {
                Some(existing) => *existing = result.clone(),
                None => sample.push(result.clone()),
            }
        }
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(sample);
    }

    pub fn clear_voting_samples(&mut self) {
        self.history.clear();
    }

    pub fn voting_sample_count(&self) -> usize {
        self.history.len()
    }

    /// Rebuild the ranking from the voting history: each location scores the
    /// mean of its scores across the samples it appears in.
    pub fn do_voting(&mut self) {
        let mut order: Vec<String> = Vec::new();
        let mut totals: HashMap<String, (f64, u32, PixelPoint, LatLon)> = HashMap::new();

        for sample in &self.history {
            for result in sample {
                match totals.get_mut(&result.location_key) {
                    Some(entry) => {
                        entry.0 += result.score;
                        entry.1 += 1;
                    }
                    None => {
                        order.push(result.location_key.clone());
                        totals.insert(
                            result.location_key.clone(),
                            (result.score, 1, result.pixel, result.lat_lon),
                        );
                    }
                }
            }
        }

        self.matches.clear();
        for key in order {
            if let Some((total, sightings, pixel, lat_lon)) = totals.remove(&key) {
                self.insert_sorted(MatchResult {
                    location_key: key,
                    score: total / sightings as f64,
                    pixel,
                    lat_lon,
                });
            }
        }
    }

    /// Snapshot the ranking for external readers.
    pub fn copy_results_to_final(&self, position: FinalPosition) -> PublishedResults {
        PublishedResults {
            ranked: self.matches.clone(),
            position,
            published_at: Utc::now().timestamp_millis() as f64 / 1000.0,
        }
    }
}

// ─── Published snapshot ──────────────────────────────────────────────────────

/// Immutable result of one completed cycle. Readers hold an `Arc` to it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishedResults {
    pub ranked: Vec<MatchResult>,
    pub position: FinalPosition,
    pub published_at: f64,
}

impl PublishedResults {
    fn capped(&self, max: usize) -> &[MatchResult] {
        &self.ranked[..max.min(self.ranked.len())]
    }

    pub fn locations(&self, max: usize) -> Vec<String> {
        self.capped(max)
            .iter()
            .map(|m| m.location_key.clone())
            .collect()
    }

    pub fn proximities(&self, max: usize) -> Vec<f64> {
        self.capped(max).iter().map(|m| m.score).collect()
    }

    pub fn x_coordinates(&self, max: usize) -> Vec<i32> {
        self.capped(max).iter().map(|m| m.pixel.x).collect()
    }

    pub fn y_coordinates(&self, max: usize) -> Vec<i32> {
        self.capped(max).iter().map(|m| m.pixel.y).collect()
    }

    pub fn latitudes(&self, max: usize) -> Vec<f64> {
        self.capped(max).iter().map(|m| m.lat_lon.latitude).collect()
    }

    pub fn longitudes(&self, max: usize) -> Vec<f64> {
        self.capped(max).iter().map(|m| m.lat_lon.longitude).collect()
    }

    pub fn best(&self) -> Option<&MatchResult> {
        self.ranked.first()
    }
}

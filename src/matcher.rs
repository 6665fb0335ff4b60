//! Fingerprint scoring.
//!
//! # Scoring
//!
//! `compare_scans` returns a distance-like score: lower is better and
//! `NO_MATCH_SCORE` means "reject". The thresholds below are calibrated
//! against recorded data and must not drift.

use crate::ranker::LocationRanker;
use crate::store::FingerprintDb;
use crate::types::SignalTable;
use log::{debug, trace};
use std::collections::HashSet;

/// Reject sentinel. Callers compare with `< NO_MATCH_SCORE`.
pub const NO_MATCH_SCORE: f64 = 100_000.0;
/// Above this an access point is reliable: it drives candidate filtering and
/// counts against a fingerprint when expected but unseen (or seen but
/// unexpected).
pub const RELIABLE_SIGNAL_DBM: f64 = -75.0;
/// Above this an access point counts towards overlap.
pub const STRONG_SIGNAL_DBM: f64 = -85.0;
/// Floor strength; unseen access points are treated as observed here.
pub const MIN_SIGNAL_DBM: f64 = -100.0;
/// Minimum ratio of shared strong access points to all strong ones.
pub const MIN_OVERLAP_RATIO: f64 = 0.25;

/// Score `actual` (a live scan) against `expected` (a stored fingerprint).
///
/// `known_aps` is the set of access points present anywhere in the database;
/// unexpected access points outside it are ignored.
///
/// A scan that shares no contribution with the fingerprint, or that has no
/// strong access point at all, is rejected with `NO_MATCH_SCORE`. So is an
/// exact match, whose squared distance is zero.
pub fn compare_scans(expected: &SignalTable, actual: &SignalTable, known_aps: &HashSet<String>) -> f64 {
    let mut match_score = 0.0;
    let mut total_count = 0u32;
    let mut num_matching_keys = 0u32;

    for (ap, seen) in actual {
        if let Some(&wanted) = expected.get(ap) {
            if wanted > MIN_SIGNAL_DBM {
                match_score += (seen - wanted).powi(2);
                total_count += 1;
            }
            if wanted > STRONG_SIGNAL_DBM {
                num_matching_keys += 1;
            }
        }
    }

    if match_score <= 0.0 {
        return NO_MATCH_SCORE;
    }

    let mut strong_expected = 0u32;
    for (ap, &wanted) in expected {
        if !actual.contains_key(ap) && wanted > RELIABLE_SIGNAL_DBM {
            match_score += (wanted - MIN_SIGNAL_DBM).powi(2);
            total_count += 1;
        }
        if wanted > STRONG_SIGNAL_DBM {
            strong_expected += 1;
        }
    }

    let unexpected: Vec<f64> = actual
        .iter()
        .filter(|(ap, seen)| {
            !expected.contains_key(*ap) && **seen > RELIABLE_SIGNAL_DBM && known_aps.contains(*ap)
        })
        .map(|(_, seen)| *seen)
        .collect();
    let strong_points = strong_expected + unexpected.len() as u32;

    // No strong access point on either side: nothing to judge overlap by.
    if strong_points == 0 {
        return NO_MATCH_SCORE;
    }
    if (num_matching_keys as f64 / strong_points as f64) < MIN_OVERLAP_RATIO {
        return NO_MATCH_SCORE;
    }

    for seen in &unexpected {
        match_score += (seen - MIN_SIGNAL_DBM).powi(2);
        total_count += 1;
    }
    let score = match_score.sqrt() * strong_points as f64 / num_matching_keys as f64;
    score / total_count as f64
}

/// Location keys worth scoring for `observed`: the union of reverse-index
/// entries of every access point seen above `RELIABLE_SIGNAL_DBM`.
pub fn valid_locations(observed: &SignalTable, db: &FingerprintDb) -> HashSet<String> {
    observed
        .iter()
        .filter(|(_, strength)| **strength > RELIABLE_SIGNAL_DBM)
        .filter_map(|(ap, _)| db.reverse_index().get(ap))
        .flatten()
        .cloned()
        .collect()
}

/// Matching capability used by the controller.
pub trait FingerprintMatcher: Send + Sync {
    fn compare_scans(&self, location_key: &str, expected: &SignalTable, actual: &SignalTable, known_aps: &HashSet<String>) -> f64 {
        let _ = location_key;
        compare_scans(expected, actual, known_aps)
    }

    /// Rank every eligible fingerprint in `db` against `observed` into
    /// `ranker`, replacing its working list. Rejected fingerprints and
    /// fingerprints outside the reverse-index candidates are left out.
    ///
    /// `expected_location` is only a label for diagnostics.
    /// Returns the number of inserted candidates.
    fn compute_match(
        &self,
        observed: &SignalTable,
        db: &FingerprintDb,
        ranker: &mut LocationRanker,
        expected_location: Option<&str>,
    ) -> usize {
        let _ = expected_location;
        rank_candidates(self, observed, db, ranker)
    }
}

/// Shared body of `compute_match`, scoring through `matcher.compare_scans`.
pub fn rank_candidates<M: FingerprintMatcher + ?Sized>(
    matcher: &M,
    observed: &SignalTable,
    db: &FingerprintDb,
    ranker: &mut LocationRanker,
) -> usize {
    ranker.clear();
    let candidates = valid_locations(observed, db);
    let mut inserted = 0;
    for record in db.records() {
        let key = record.location_key();
        if !candidates.contains(&key) {
            continue;
        }
        let score = matcher.compare_scans(&key, &record.strengths, observed, db.access_points());
        if score < NO_MATCH_SCORE {
            ranker.insert_matching_location(
                score,
                &record.location_name,
                &record.map_name,
                record.pixel,
                record.lat_lon,
            );
            inserted += 1;
        }
    }
    inserted
}

/// Plain on-device matcher.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalMatcher;

impl FingerprintMatcher for LocalMatcher {}

/// Same scores as `LocalMatcher`, with a per-access-point breakdown at
/// `trace` and the resulting ranking at `debug`.
///
/// Breakdown legend: `-` seen but not expected, `+` expected but not seen.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiagnosticMatcher;

impl FingerprintMatcher for DiagnosticMatcher {
    fn compare_scans(&self, location_key: &str, expected: &SignalTable, actual: &SignalTable, known_aps: &HashSet<String>) -> f64 {
        trace!("*** location {}", location_key);
        for (ap, seen) in actual {
            match expected.get(ap) {
                Some(wanted) => trace!("  {} : actual = {} : expected = {}", ap, seen, wanted),
                None => trace!("- {} : {}", ap, seen),
            }
        }
        for (ap, wanted) in expected {
            if !actual.contains_key(ap) {
                trace!("+ {} : {}", ap, wanted);
            }
        }
        let score = compare_scans(expected, actual, known_aps);
        trace!("*** score {}", score);
        score
    }

    fn compute_match(
        &self,
        observed: &SignalTable,
        db: &FingerprintDb,
        ranker: &mut LocationRanker,
        expected_location: Option<&str>,
    ) -> usize {
        for (ap, strength) in observed {
            debug!("[match] observed {} {:.1}", ap, strength);
        }
        let inserted = rank_candidates(self, observed, db, ranker);
        for (i, m) in ranker.matches().iter().enumerate() {
            debug!("[match] {} : {} : {:.3}", i, m.location_key, m.score);
        }
        debug!("[match] expected location: {}", expected_location.unwrap_or("-"));
        inserted
    }
}

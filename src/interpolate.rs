use crate::types::{FinalPosition, LatLon, MatchResult, PixelPoint};
use nalgebra::Vector2;

/// Candidates farther than this from the top one are never blended in.
const NEIGHBOUR_SEARCH_LIMIT: f64 = 1_000_000.0;
/// Lower bound on scores used for lat/lon weights.
pub const LATLON_SCORE_FLOOR: f64 = 15.0;

/// Index of the candidate (other than the top one) nearest to the top one
/// under `position`. Falls back to the top candidate itself.
fn nearest_to_top<F>(ranked: &[MatchResult], position: F) -> usize
where
    F: Fn(&MatchResult) -> Vector2<f64>,
{
    let origin = position(&ranked[0]);
    let mut min_dist = NEIGHBOUR_SEARCH_LIMIT;
    let mut nearest = 0;
    for (i, candidate) in ranked.iter().enumerate().skip(1) {
        let dist = (position(candidate) - origin).norm();
        if dist < min_dist {
            min_dist = dist;
            nearest = i;
        }
    }
    nearest
}

fn pixel_vec(m: &MatchResult) -> Vector2<f64> {
    Vector2::new(m.pixel.x as f64, m.pixel.y as f64)
}

fn lat_lon_vec(m: &MatchResult) -> Vector2<f64> {
    Vector2::new(m.lat_lon.latitude, m.lat_lon.longitude)
}

/// Pull the top candidate's pixel position toward its geometrically nearest
/// rival, weighted by `score0 / (score0 + score_nearest)`.
///
/// Returns `None` with fewer than two candidates. If the top or the
/// runner-up candidate is unplaced, the top position passes through.
pub fn interpolate_xy(ranked: &[MatchResult]) -> Option<PixelPoint> {
    if ranked.len() < 2 {
        return None;
    }
    let top = &ranked[0];
    if top.pixel.is_unknown() || ranked[1].pixel.is_unknown() {
        return Some(top.pixel);
    }

    let nearest = &ranked[nearest_to_top(ranked, pixel_vec)];
    let aff0 = top.score / (top.score + nearest.score);
    let diff = pixel_vec(top) - pixel_vec(nearest);
    let blended = pixel_vec(top) - diff * aff0;

    // Truncate toward zero like an integer cast.
    Some(PixelPoint::new(blended.x as i32, blended.y as i32))
}

/// Lat/lon counterpart of `interpolate_xy`.
///
/// The nearest rival is chosen by geographic distance, so it can differ from
/// the one used for pixels. Weights use the top and runner-up scores, each
/// floored at `LATLON_SCORE_FLOOR`. An unreferenced top or nearest candidate
/// makes the top position pass through.
pub fn interpolate_lat_lon(ranked: &[MatchResult]) -> Option<LatLon> {
    if ranked.len() < 2 {
        return None;
    }
    let top = &ranked[0];
    let nearest = &ranked[nearest_to_top(ranked, lat_lon_vec)];
    if top.lat_lon.is_unknown() || nearest.lat_lon.is_unknown() {
        return Some(top.lat_lon);
    }

    let score0 = top.score.max(LATLON_SCORE_FLOOR);
    let score1 = ranked[1].score.max(LATLON_SCORE_FLOOR);
    let aff0 = score0 / (score0 + score1);
    let diff = lat_lon_vec(top) - lat_lon_vec(nearest);
    let blended = lat_lon_vec(top) - diff * aff0;

    Some(LatLon::new(blended.x, blended.y))
}

/// Final position for a ranking. With a single candidate its coordinates are
/// used as-is; an empty ranking yields `None`.
pub fn final_position(ranked: &[MatchResult]) -> Option<FinalPosition> {
    let top = ranked.first()?;
    Some(FinalPosition {
        pixel: interpolate_xy(ranked).unwrap_or(top.pixel),
        lat_lon: interpolate_lat_lon(ranked).unwrap_or(top.lat_lon),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn candidate(key: &str, score: f64, x: i32, y: i32, lat: f64, lon: f64) -> MatchResult {
        MatchResult {
            location_key: key.to_string(),
            score,
            pixel: PixelPoint::new(x, y),
            lat_lon: LatLon::new(lat, lon),
        }
    }

    #[test]
    fn test_identical_coordinates_pass_through() {
        let ranked = vec![
            candidate("lab_a", 1.0, 40, 60, 37.1, -122.1),
            candidate("lab_b", 3.0, 40, 60, 37.1, -122.1),
        ];
        assert_eq!(interpolate_xy(&ranked), Some(PixelPoint::new(40, 60)));
        let ll = interpolate_lat_lon(&ranked).unwrap();
        assert_relative_eq!(ll.latitude, 37.1);
        assert_relative_eq!(ll.longitude, -122.1);
    }

    #[test]
    fn test_pulls_toward_nearest_not_runner_up() {
        let ranked = vec![
            candidate("lab_a", 1.0, 0, 0, 0.0, 0.0),
            candidate("lab_far", 2.0, 500, 0, 0.0, 0.0),
            candidate("lab_near", 3.0, 0, 100, 0.0, 0.0),
        ];
        // aff0 = 1 / (1 + 3) = 0.25 toward (0, 100).
        assert_eq!(interpolate_xy(&ranked), Some(PixelPoint::new(0, 25)));
    }

    #[test]
    fn test_unplaced_top_or_runner_up_passes_through() {
        let ranked = vec![
            candidate("lab_a", 1.0, 10, 10, 0.0, 0.0),
            candidate("lab_b", 2.0, -1, -1, 0.0, 0.0),
        ];
        assert_eq!(interpolate_xy(&ranked), Some(PixelPoint::new(10, 10)));
        assert!(interpolate_xy(&ranked[..1]).is_none());
    }

    #[test]
    fn test_lat_lon_floor_and_runner_up_score() {
        let ranked = vec![
            candidate("lab_a", 1.0, 0, 0, 10.0, 20.0),
            candidate("lab_b", 5.0, 0, 0, 12.0, 20.0),
        ];
        // Both scores floored to 15: halfway.
        let ll = interpolate_lat_lon(&ranked).unwrap();
        assert_relative_eq!(ll.latitude, 11.0, epsilon = 1e-12);
        assert_relative_eq!(ll.longitude, 20.0, epsilon = 1e-12);
    }

    #[test]
    fn test_lat_lon_unreferenced_nearest_passes_through() {
        let ranked = vec![
            candidate("lab_a", 1.0, 0, 0, 0.5, 0.5),
            candidate("lab_b", 5.0, 0, 0, 0.0, 0.0),
        ];
        let ll = interpolate_lat_lon(&ranked).unwrap();
        assert_eq!(ll, LatLon::new(0.5, 0.5));
    }

    #[test]
    fn test_final_position_single_and_empty() {
        assert!(final_position(&[]).is_none());
        let one = vec![candidate("lab_a", 1.0, 7, 8, 1.0, 2.0)];
        let pos = final_position(&one).unwrap();
        assert_eq!(pos.pixel, PixelPoint::new(7, 8));
        assert_eq!(pos.lat_lon, LatLon::new(1.0, 2.0));
    }
}

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::LineConfig;
use crate::track::Track;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Point { x, y }
    }
}

/// Horizontal counting segment with a vertical tolerance band.
///
/// A centroid qualifies when `start.x < cx < end.x` and it lies strictly
/// within `band` pixels of `start.y`. Each identity is counted at most once.
#[derive(Debug, Clone)]
pub struct CountingLine {
    start: Point,
    end: Point,
    band: i32,
    counted: HashSet<u64>,
}

impl CountingLine {
    pub fn new(start: Point, end: Point, band: i32) -> Self {
        CountingLine {
            start,
            end,
            band,
            counted: HashSet::new(),
        }
    }

    pub fn from_config(line: &LineConfig) -> Self {
        let [x1, y1, x2, y2] = line.limits;
        Self::new(Point::new(x1, y1), Point::new(x2, y2), line.band)
    }

    /// `(cx, cy)` is a pixel centroid, see [`Track::centroid`].
    pub fn qualifies(&self, cx: i32, cy: i32) -> bool {
        let (x1, x2, y) = (self.start.x, self.end.x, self.start.y);
        x1 < cx && cx < x2 && y - self.band < cy && cy < y + self.band
    }

    /// Register first-time crossings among confirmed tracks.
    /// Returns the identities counted during this call.
    pub fn evaluate<'a, I>(&mut self, tracks: I) -> Vec<u64>
    where
        I: IntoIterator<Item = &'a Track>,
    {
        let mut newly = Vec::new();
        for track in tracks {
            if !track.is_confirmed() {
                continue;
            }
            let (cx, cy) = track.centroid();
            if self.qualifies(cx, cy) && self.counted.insert(track.track_id) {
                info!(track_id = track.track_id, total = self.counted.len(), "vehicle counted");
                newly.push(track.track_id);
            }
        }
        newly
    }

    pub fn count(&self) -> usize {
        self.counted.len()
    }

    pub fn is_counted(&self, track_id: u64) -> bool {
        self.counted.contains(&track_id)
    }

    /// Counted identities in ascending order.
    pub fn counted_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.counted.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Move the line. Already counted identities stay counted.
    pub fn set_endpoints(&mut self, start: Point, end: Point, band: i32) {
        self.start = start;
        self.end = end;
        self.band = band;
    }

    pub fn start(&self) -> Point {
        self.start
    }

    pub fn end(&self) -> Point {
        self.end
    }

    pub fn band(&self) -> i32 {
        self.band
    }

    pub fn reset(&mut self) {
        self.counted.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Detection;
    use crate::kalman_filter::KalmanFilter;

    fn default_line() -> CountingLine {
        CountingLine::from_config(&LineConfig::default())
    }

    /// Confirmed track whose box is centred on `(cx, cy)`.
    fn track_at(id: u64, cx: f32, cy: f32) -> Track {
        let det = Detection::from_xyxy(cx - 30.0, cy - 20.0, cx + 30.0, cy + 20.0, 0.9, 2);
        Track::new(id, &det, 1, &KalmanFilter::new())
    }

    #[test]
    fn test_qualifies_strict_bounds() {
        let line = default_line();
        assert!(line.qualifies(500, 297));
        assert!(line.qualifies(500, 283));
        assert!(!line.qualifies(500, 282));
        assert!(!line.qualifies(500, 312));
        assert!(!line.qualifies(400, 297));
        assert!(!line.qualifies(673, 297));
        assert!(!line.qualifies(380, 297));
    }

    #[test]
    fn test_identity_counted_once() {
        let mut line = default_line();
        let track = track_at(4, 500.0, 297.0);

        assert_eq!(line.evaluate([&track]), vec![4]);
        assert!(line.evaluate([&track]).is_empty());
        assert_eq!(line.count(), 1);
        assert!(line.is_counted(4));
    }

    #[test]
    fn test_tentative_tracks_are_ignored() {
        let mut line = default_line();
        let det = Detection::from_xyxy(470.0, 277.0, 530.0, 317.0, 0.9, 2);
        let tentative = Track::new(1, &det, 3, &KalmanFilter::new());
        assert!(line.evaluate([&tentative]).is_empty());
        assert_eq!(line.count(), 0);
    }

    #[test]
    fn test_moving_line_keeps_counts() {
        let mut line = default_line();
        line.evaluate([&track_at(1, 500.0, 297.0), &track_at(2, 100.0, 297.0)]);
        assert_eq!(line.counted_ids(), vec![1]);

        line.set_endpoints(Point::new(0, 297), Point::new(200, 297), 15);
        assert_eq!(line.evaluate([&track_at(2, 100.0, 297.0)]), vec![2]);
        assert_eq!(line.counted_ids(), vec![1, 2]);

        line.reset();
        assert_eq!(line.count(), 0);
    }

    #[test]
    fn test_reversed_line_never_counts() {
        let mut line = CountingLine::new(Point::new(673, 297), Point::new(400, 297), 15);
        assert!(line.evaluate([&track_at(1, 500.0, 297.0)]).is_empty());
    }
}

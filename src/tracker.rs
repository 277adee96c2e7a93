use tracing::{debug, warn};

use crate::assignment::linear_assignment;
use crate::config::TrackerConfig;
use crate::detection::Detection;
use crate::kalman_filter::KalmanFilter;
use crate::track::Track;
use crate::utils::compute_iou;

/// What happened to one detection during a [`Tracker::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Association {
    /// Corrected an existing track.
    Matched(u64),
    /// Seeded a new track.
    Spawned(u64),
}

impl Association {
    pub fn track_id(&self) -> u64 {
        match *self {
            Association::Matched(id) | Association::Spawned(id) => id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    /// One entry per input detection, in input order.
    pub outcomes: Vec<Association>,
    /// Identities lost and removed this cycle.
    pub removed: Vec<u64>,
}

/// SORT-style multi-object tracker: Kalman prediction, IoU cost, optimal
/// assignment.
#[derive(Debug, Clone)]
pub struct Tracker {
    kalman: KalmanFilter,
    tracks: Vec<Track>,
    next_id: u64,
    max_age: u32,
    min_hits: u32,
    iou_threshold: f32,
}

impl Tracker {
    pub fn new(config: &TrackerConfig) -> Self {
        Tracker {
            kalman: KalmanFilter::new(),
            tracks: Vec::new(),
            next_id: 1,
            max_age: config.max_age,
            min_hits: config.min_hits,
            iou_threshold: config.iou_threshold,
        }
    }

    /// Run one predict / associate / update cycle.
    pub fn step(&mut self, detections: &[Detection]) -> StepReport {
        let mut report = StepReport::default();
        if self.tracks.is_empty() && detections.is_empty() {
            return report;
        }

        for track in self.tracks.iter_mut() {
            track.predict(&self.kalman);
        }
        let before = self.tracks.len();
        self.tracks.retain(|t| {
            if t.is_finite() {
                true
            } else {
                warn!(track_id = t.track_id, "dropping track with non-finite prediction");
                report.removed.push(t.track_id);
                false
            }
        });
        if self.tracks.len() != before {
            debug!(dropped = before - self.tracks.len(), "diverged tracks removed");
        }

        let (matches, unmatched_tracks, unmatched_dets) = self.match_tracks(detections);

        let mut outcomes: Vec<Option<Association>> = vec![None; detections.len()];
        for &(ti, di) in &matches {
            let track = &mut self.tracks[ti];
            track.update(&detections[di], &self.kalman);
            outcomes[di] = Some(Association::Matched(track.track_id));
        }

        for &ti in &unmatched_tracks {
            let track = &mut self.tracks[ti];
            if track.time_since_update > self.max_age {
                track.mark_lost();
            }
        }
        self.tracks.retain(|t| {
            if t.is_lost() {
                debug!(track_id = t.track_id, age = t.age, "track lost");
                report.removed.push(t.track_id);
                false
            } else {
                true
            }
        });

        for &di in &unmatched_dets {
            let id = self.next_id;
            self.next_id += 1;
            self.tracks.push(Track::new(id, &detections[di], self.min_hits, &self.kalman));
            debug!(track_id = id, "new track");
            outcomes[di] = Some(Association::Spawned(id));
        }

        report.outcomes = outcomes.into_iter().flatten().collect();
        report
    }

    /// Match predicted tracks with detections using IoU.
    /// Returns `(matches, unmatched_tracks, unmatched_dets)` as index lists.
    fn match_tracks(&self, detections: &[Detection]) -> (Vec<(usize, usize)>, Vec<usize>, Vec<usize>) {
        if self.tracks.is_empty() || detections.is_empty() {
            return (Vec::new(), (0..self.tracks.len()).collect(), (0..detections.len()).collect());
        }

        let predicted: Vec<_> = self.tracks.iter().map(Track::bbox).collect();
        let ious: Vec<Vec<f32>> = predicted
            .iter()
            .map(|p| detections.iter().map(|d| compute_iou(p, d.tlbr())).collect())
            .collect();
        let cost: Vec<Vec<f64>> = ious
            .iter()
            .map(|row| row.iter().map(|&iou| 1.0 - f64::from(iou)).collect())
            .collect();

        let mut track_matched = vec![false; self.tracks.len()];
        let mut det_matched = vec![false; detections.len()];
        let mut matches = Vec::new();
        for (ti, di) in linear_assignment(&cost) {
            if ious[ti][di] < self.iou_threshold {
                continue;
            }
            track_matched[ti] = true;
            det_matched[di] = true;
            matches.push((ti, di));
        }

        let unmatched_tracks = (0..self.tracks.len()).filter(|&i| !track_matched[i]).collect();
        let unmatched_dets = (0..detections.len()).filter(|&j| !det_matched[j]).collect();
        (matches, unmatched_tracks, unmatched_dets)
    }

    /// All live tracks, tentative ones included.
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Tracks visible to counting and the overlay.
    pub fn confirmed_tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter().filter(|t| t.is_confirmed())
    }

    /// Forget every track and restart identities at 1.
    pub fn reset(&mut self) {
        self.tracks.clear();
        self.next_id = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_age: u32, min_hits: u32) -> TrackerConfig {
        TrackerConfig {
            max_age,
            min_hits,
            iou_threshold: 0.3,
        }
    }

    fn car(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection::from_xyxy(x1, y1, x2, y2, 0.9, 2)
    }

    #[test]
    fn test_empty_cycle_is_noop() {
        let mut tracker = Tracker::new(&config(20, 3));
        let report = tracker.step(&[]);
        assert_eq!(report, StepReport::default());
        assert!(tracker.tracks().is_empty());
    }

    #[test]
    fn test_no_tracks_spawns_every_detection() {
        let mut tracker = Tracker::new(&config(20, 3));
        let report = tracker.step(&[car(0.0, 0.0, 10.0, 10.0), car(100.0, 100.0, 120.0, 120.0)]);
        assert_eq!(report.outcomes, vec![Association::Spawned(1), Association::Spawned(2)]);
        assert_eq!(tracker.tracks().len(), 2);
        assert_eq!(tracker.confirmed_tracks().count(), 0);
    }

    #[test]
    fn test_no_detections_ages_tracks() {
        let mut tracker = Tracker::new(&config(20, 3));
        tracker.step(&[car(0.0, 0.0, 10.0, 10.0)]);
        let report = tracker.step(&[]);
        assert!(report.outcomes.is_empty());
        assert!(report.removed.is_empty());
        assert_eq!(tracker.tracks()[0].time_since_update, 1);
        assert_eq!(tracker.tracks()[0].age, 1);
    }

    #[test]
    fn test_two_by_two_association_keeps_identities() {
        let mut tracker = Tracker::new(&config(20, 1));
        tracker.step(&[car(0.0, 0.0, 40.0, 40.0), car(200.0, 0.0, 240.0, 40.0)]);

        // Same objects nudged, supplied in reverse order.
        let report = tracker.step(&[car(202.0, 0.0, 242.0, 40.0), car(2.0, 0.0, 42.0, 40.0)]);
        assert_eq!(report.outcomes, vec![Association::Matched(2), Association::Matched(1)]);
    }

    #[test]
    fn test_low_iou_pair_is_rejected() {
        let mut tracker = Tracker::new(&config(20, 1));
        tracker.step(&[car(0.0, 0.0, 10.0, 10.0)]);
        // Overlap 1/19 of the union, well under 0.3.
        let report = tracker.step(&[car(9.0, 0.0, 19.0, 10.0)]);
        assert_eq!(report.outcomes, vec![Association::Spawned(2)]);
        assert_eq!(tracker.tracks().len(), 2);
    }

    #[test]
    fn test_track_removed_after_max_age_plus_one_misses() {
        let max_age = 3;
        let mut tracker = Tracker::new(&config(max_age, 1));
        tracker.step(&[car(0.0, 0.0, 10.0, 10.0)]);

        for _ in 0..max_age {
            let report = tracker.step(&[]);
            assert!(report.removed.is_empty());
            assert_eq!(tracker.tracks().len(), 1);
        }
        let report = tracker.step(&[]);
        assert_eq!(report.removed, vec![1]);
        assert!(tracker.tracks().is_empty());
    }

    #[test]
    fn test_confirmation_at_min_hits() {
        let mut tracker = Tracker::new(&config(20, 3));
        tracker.step(&[car(0.0, 0.0, 40.0, 40.0)]);
        tracker.step(&[car(1.0, 0.0, 41.0, 40.0)]);
        assert_eq!(tracker.confirmed_tracks().count(), 0);
        tracker.step(&[car(2.0, 0.0, 42.0, 40.0)]);
        assert_eq!(tracker.confirmed_tracks().count(), 1);
    }

    #[test]
    fn test_identities_never_reused() {
        let mut tracker = Tracker::new(&config(0, 1));
        tracker.step(&[car(0.0, 0.0, 10.0, 10.0)]);
        let report = tracker.step(&[]);
        assert_eq!(report.removed, vec![1]);

        let report = tracker.step(&[car(0.0, 0.0, 10.0, 10.0)]);
        assert_eq!(report.outcomes, vec![Association::Spawned(2)]);

        tracker.reset();
        let report = tracker.step(&[car(0.0, 0.0, 10.0, 10.0)]);
        assert_eq!(report.outcomes, vec![Association::Spawned(1)]);
    }

    #[test]
    fn test_stationary_object_keeps_single_identity() {
        let mut tracker = Tracker::new(&config(20, 3));
        for _ in 0..30 {
            let report = tracker.step(&[car(50.0, 50.0, 90.0, 80.0)]);
            assert_eq!(report.outcomes[0].track_id(), 1);
        }
        assert_eq!(tracker.tracks().len(), 1);
    }
}

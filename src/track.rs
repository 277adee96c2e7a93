use nalgebra::SVector;
use tracing::debug;

use crate::detection::Detection;
use crate::kalman_filter::{tlbr_to_z, z_to_tlbr, KalmanFilter, StateCovariance, StateMean};
use crate::utils::centroid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Tentative,
    Confirmed,
    Lost,
}

/// One tracked object: motion state plus lifecycle bookkeeping.
#[derive(Debug, Clone)]
pub struct Track {
    /// `[cx, cy, s, r, vcx, vcy, vs, vr]`
    mean: StateMean,
    covariance: StateCovariance,
    pub track_id: u64,
    pub state: TrackState,
    /// Cycles since creation.
    pub age: u32,
    /// Matched detections, the seeding one included.
    pub hits: u32,
    pub time_since_update: u32,
    min_hits: u32,
    /// Score of the last matched detection.
    pub score: f32,
    pub class_id: u32,
}

impl Track {
    /// Start a track from an unmatched detection. Velocities are zero.
    pub fn new(track_id: u64, detection: &Detection, min_hits: u32, kalman: &KalmanFilter) -> Self {
        let (mean, covariance) = kalman.initiate(&tlbr_to_z(detection.tlbr()));
        let mut track = Track {
            mean,
            covariance,
            track_id,
            state: TrackState::Tentative,
            age: 0,
            hits: 1,
            time_since_update: 0,
            min_hits,
            score: detection.confidence,
            class_id: detection.class_id,
        };
        track.refresh_confirmation();
        track
    }

    /// Advance the motion state one step.
    pub fn predict(&mut self, kalman: &KalmanFilter) {
        let (mean, covariance) = kalman.predict(&self.mean, &self.covariance);
        self.mean = mean;
        self.covariance = covariance;
        self.age += 1;
        self.time_since_update += 1;
    }

    /// Correct the motion state from the matched detection.
    pub fn update(&mut self, detection: &Detection, kalman: &KalmanFilter) {
        let z = tlbr_to_z(detection.tlbr());
        match kalman.update(&self.mean, &self.covariance, &z) {
            Some((mean, covariance)) => {
                self.mean = mean;
                self.covariance = covariance;
            }
            None => {
                debug!(track_id = self.track_id, "singular innovation covariance, re-initiating");
                let (mean, covariance) = kalman.initiate(&z);
                self.mean = mean;
                self.covariance = covariance;
            }
        }
        self.time_since_update = 0;
        self.hits += 1;
        self.score = detection.confidence;
        self.class_id = detection.class_id;
        self.refresh_confirmation();
    }

    fn refresh_confirmation(&mut self) {
        if self.state == TrackState::Tentative && self.hits >= self.min_hits {
            self.state = TrackState::Confirmed;
        }
    }

    pub fn mark_lost(&mut self) {
        self.state = TrackState::Lost;
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == TrackState::Confirmed
    }

    pub fn is_lost(&self) -> bool {
        self.state == TrackState::Lost
    }

    /// False once the filter has diverged.
    pub fn is_finite(&self) -> bool {
        self.mean.iter().all(|v| v.is_finite())
    }

    /// Current box estimate as `[x1, y1, x2, y2]`.
    pub fn bbox(&self) -> SVector<f32, 4> {
        z_to_tlbr(self.mean[0], self.mean[1], self.mean[2], self.mean[3])
    }

    pub fn centroid(&self) -> (i32, i32) {
        centroid(&self.bbox())
    }

    pub fn velocity(&self) -> (f64, f64) {
        (self.mean[4], self.mean[5])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn car(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection::from_xyxy(x1, y1, x2, y2, 0.9, 2)
    }

    #[test]
    fn test_track_initialization() {
        let kf = KalmanFilter::new();
        let track = Track::new(1, &car(100.0, 100.0, 150.0, 150.0), 3, &kf);

        assert_eq!(track.track_id, 1);
        assert_eq!(track.hits, 1);
        assert_eq!(track.age, 0);
        assert_eq!(track.time_since_update, 0);
        assert_eq!(track.state, TrackState::Tentative);
        assert_eq!(track.velocity(), (0.0, 0.0));

        let bbox = track.bbox();
        assert_relative_eq!(bbox[0], 100.0, epsilon = 1e-3);
        assert_relative_eq!(bbox[3], 150.0, epsilon = 1e-3);
    }

    #[test]
    fn test_single_hit_confirms_immediately() {
        let kf = KalmanFilter::new();
        let track = Track::new(7, &car(0.0, 0.0, 10.0, 10.0), 1, &kf);
        assert!(track.is_confirmed());
    }

    #[test]
    fn test_confirmation_flips_at_min_hits() {
        let kf = KalmanFilter::new();
        let mut track = Track::new(1, &car(100.0, 100.0, 150.0, 150.0), 3, &kf);

        track.predict(&kf);
        track.update(&car(102.0, 100.0, 152.0, 150.0), &kf);
        assert_eq!(track.hits, 2);
        assert!(!track.is_confirmed());

        track.predict(&kf);
        track.update(&car(104.0, 100.0, 154.0, 150.0), &kf);
        assert_eq!(track.hits, 3);
        assert!(track.is_confirmed());
    }

    #[test]
    fn test_predict_ages_and_update_resets() {
        let kf = KalmanFilter::new();
        let mut track = Track::new(1, &car(100.0, 100.0, 150.0, 150.0), 3, &kf);

        track.predict(&kf);
        track.predict(&kf);
        assert_eq!(track.age, 2);
        assert_eq!(track.time_since_update, 2);

        track.update(&car(100.0, 100.0, 150.0, 150.0), &kf);
        assert_eq!(track.time_since_update, 0);
        assert_eq!(track.age, 2);
    }

    #[test]
    fn test_update_learns_velocity() {
        let kf = KalmanFilter::new();
        let mut track = Track::new(1, &car(100.0, 100.0, 150.0, 150.0), 3, &kf);
        for step in 1..=5 {
            let dx = 10.0 * step as f32;
            track.predict(&kf);
            track.update(&car(100.0 + dx, 100.0, 150.0 + dx, 150.0), &kf);
        }
        let (vx, vy) = track.velocity();
        assert!(vx > 5.0, "vx = {vx}");
        assert!(vy.abs() < 1.0);

        let (cx, _) = track.centroid();
        assert!(cx > 160 && cx < 180, "cx = {cx}");
    }

    #[test]
    fn test_lost_track_is_not_confirmed() {
        let kf = KalmanFilter::new();
        let mut track = Track::new(1, &car(0.0, 0.0, 10.0, 10.0), 1, &kf);
        track.mark_lost();
        assert!(track.is_lost());
        assert!(!track.is_confirmed());
    }
}

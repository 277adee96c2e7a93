//! Constant-velocity Kalman filter over bounding-box geometry.
//!
//! The state is `[cx, cy, s, r, vcx, vcy, vs, vr]` where `s` is the box area
//! (scale) and `r` its width / height aspect ratio. Measurements are the first
//! four components. Boxes enter and leave this space only through
//! [`tlbr_to_z`] and [`z_to_tlbr`].

use nalgebra::{SMatrix, SVector};

pub type StateMean = SVector<f64, 8>;
pub type StateCovariance = SMatrix<f64, 8, 8>;
pub type Measurement = SVector<f64, 4>;

/// Convert a `[x1, y1, x2, y2]` box into `[cx, cy, s, r]`.
pub fn tlbr_to_z(tlbr: &SVector<f32, 4>) -> Measurement {
    let w = f64::from(tlbr[2] - tlbr[0]);
    let h = f64::from(tlbr[3] - tlbr[1]);
    let cx = f64::from(tlbr[0]) + w / 2.0;
    let cy = f64::from(tlbr[1]) + h / 2.0;
    let aspect = if h > 0.0 { w / h } else { 0.0 };
    Measurement::new(cx, cy, w * h, aspect)
}

/// Convert the measurement part of a state (`[cx, cy, s, r, ..]`) back into `[x1, y1, x2, y2]`.
pub fn z_to_tlbr(cx: f64, cy: f64, scale: f64, aspect: f64) -> SVector<f32, 4> {
    let area = scale.max(0.0);
    let w = (area * aspect.max(0.0)).sqrt();
    let h = if w > 0.0 { area / w } else { 0.0 };
    SVector::<f32, 4>::new(
        (cx - w / 2.0) as f32,
        (cy - h / 2.0) as f32,
        (cx + w / 2.0) as f32,
        (cy + h / 2.0) as f32,
    )
}

/// Kalman filter matrices. Track state (mean, covariance) lives with the track.
#[derive(Debug, Clone)]
pub struct KalmanFilter {
    motion_mat: SMatrix<f64, 8, 8>,       // 8×8 motion matrix
    update_mat: SMatrix<f64, 4, 8>,       // 4×8 observation matrix
    process_noise: SMatrix<f64, 8, 8>,
    measurement_noise: SMatrix<f64, 4, 4>,
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl KalmanFilter {
    /// Initialize motion, observation and noise matrices.
    pub fn new() -> Self {
        let ndim = 4;
        let dt = 1.0;
        let mut motion_mat = SMatrix::<f64, 8, 8>::identity();
        for i in 0..ndim {
            motion_mat[(i, ndim + i)] = dt;
        }
        let update_mat = SMatrix::<f64, 4, 8>::identity();

        let process_noise = SMatrix::<f64, 8, 8>::from_diagonal(&SVector::<f64, 8>::from_column_slice(&[
            1.0, 1.0, 1.0, 1.0, 0.01, 0.01, 0.01, 0.0001,
        ]));
        let measurement_noise =
            SMatrix::<f64, 4, 4>::from_diagonal(&SVector::<f64, 4>::new(1.0, 1.0, 10.0, 10.0));

        KalmanFilter {
            motion_mat,
            update_mat,
            process_noise,
            measurement_noise,
        }
    }

    /// Create track state from a measurement. Velocities start at zero and
    /// are given a large uncertainty.
    pub fn initiate(&self, measurement: &Measurement) -> (StateMean, StateCovariance) {
        let mut mean = StateMean::zeros();
        mean.fixed_rows_mut::<4>(0).copy_from(measurement);
        let covariance = StateCovariance::from_diagonal(&SVector::<f64, 8>::from_column_slice(&[
            10.0, 10.0, 10.0, 10.0, 10_000.0, 10_000.0, 10_000.0, 10_000.0,
        ]));
        (mean, covariance)
    }

    /// Predict step: x' = F x, P' = F P F^T + Q
    pub fn predict(&self, mean: &StateMean, covariance: &StateCovariance) -> (StateMean, StateCovariance) {
        let mut mean = *mean;
        // area must not go negative
        if mean[2] + mean[6] <= 0.0 {
            mean[6] = 0.0;
        }
        let new_mean = self.motion_mat * mean;
        let new_cov = self.motion_mat * covariance * self.motion_mat.transpose() + self.process_noise;
        (new_mean, new_cov)
    }

    /// Project state to measurement space: z = Hx, S = H P H^T + R
    pub fn project(&self, mean: &StateMean, covariance: &StateCovariance) -> (Measurement, SMatrix<f64, 4, 4>) {
        let z_mean = self.update_mat * mean;
        let s_cov = self.update_mat * covariance * self.update_mat.transpose() + self.measurement_noise;
        (z_mean, s_cov)
    }

    /// Correction step. Returns `None` when the innovation covariance is not
    /// positive definite.
    pub fn update(
        &self,
        mean: &StateMean,
        covariance: &StateCovariance,
        measurement: &Measurement,
    ) -> Option<(StateMean, StateCovariance)> {
        let (projected_mean, projected_cov) = self.project(mean, covariance);
        let s_inv = projected_cov.cholesky()?.inverse();

        // K = P H^T S^-1
        let kalman_gain = covariance * self.update_mat.transpose() * s_inv;
        let innovation = measurement - projected_mean;

        let new_mean = mean + kalman_gain * innovation;
        let i_kh = SMatrix::<f64, 8, 8>::identity() - kalman_gain * self.update_mat;
        let new_cov = i_kh * covariance;

        Some((new_mean, new_cov))
    }
}

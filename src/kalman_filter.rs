use nalgebra::{SMatrix, SVector};

use crate::detection::BoundingBox;

/// Smallest width/height a predicted box may shrink to.
const MIN_EXTENT: f32 = 1e-3;

/// Constant-velocity Kalman filter over `(x, y, w, h, vx, vy, vw, vh)`,
/// where `(x, y)` is the top-left corner. Velocities are in pixels per frame.
///
/// One instance belongs to exactly one track.
#[derive(Debug, Clone)]
pub struct KalmanFilter {
    mean: SVector<f32, 8>,
    covariance: SMatrix<f32, 8, 8>,
    std_weight_position: f32,
    std_weight_velocity: f32,
}

impl KalmanFilter {
    /// Start a filter at a measured box with zero velocity.
    pub fn initiate(bbox: &BoundingBox) -> Self {
        let std_weight_position = 1.0 / 20.0;
        let std_weight_velocity = 1.0 / 160.0;

        let measurement = bbox.to_tlwh();
        let mut mean = SVector::<f32, 8>::zeros();
        mean.fixed_rows_mut::<4>(0).copy_from(&measurement);

        let (w, h) = (measurement[2], measurement[3]);
        let std = SVector::<f32, 8>::from_iterator([
            2.0 * std_weight_position * w,
            2.0 * std_weight_position * h,
            2.0 * std_weight_position * w,
            2.0 * std_weight_position * h,
            10.0 * std_weight_velocity * w,
            10.0 * std_weight_velocity * h,
            10.0 * std_weight_velocity * w,
            10.0 * std_weight_velocity * h,
        ]);
        let covariance = SMatrix::<f32, 8, 8>::from_diagonal(&std.component_mul(&std));

        KalmanFilter {
            mean,
            covariance,
            std_weight_position,
            std_weight_velocity,
        }
    }

    /// Predict step: x' = F x, P' = F P F^T + Q, advancing `dt` frames.
    pub fn predict(&mut self, dt: f32) -> BoundingBox {
        let (w, h) = self.scale();
        let std = SVector::<f32, 8>::from_iterator([
            self.std_weight_position * w,
            self.std_weight_position * h,
            self.std_weight_position * w,
            self.std_weight_position * h,
            self.std_weight_velocity * w,
            self.std_weight_velocity * h,
            self.std_weight_velocity * w,
            self.std_weight_velocity * h,
        ]);
        let q = SMatrix::<f32, 8, 8>::from_diagonal(&std.component_mul(&std)) * dt;

        let motion = motion_matrix(dt);
        self.mean = motion * self.mean;
        self.covariance = motion * self.covariance * motion.transpose() + q;

        self.bbox()
    }

    /// Correct the estimate with a measured box.
    pub fn update(&mut self, bbox: &BoundingBox) {
        let measurement = bbox.to_tlwh();
        let (w, h) = self.scale();
        let std = SVector::<f32, 4>::from_iterator([
            self.std_weight_position * w,
            self.std_weight_position * h,
            self.std_weight_position * w,
            self.std_weight_position * h,
        ]);
        let r = SMatrix::<f32, 4, 4>::from_diagonal(&std.component_mul(&std));

        let update_mat = SMatrix::<f32, 4, 8>::identity();
        let projected_mean = update_mat * self.mean;
        let projected_cov = update_mat * self.covariance * update_mat.transpose() + r;

        let Some(projected_inv) = projected_cov.try_inverse() else {
            // Singular innovation covariance: trust the measurement outright.
            self.mean.fixed_rows_mut::<4>(0).copy_from(&measurement);
            return;
        };

        let gain = self.covariance * update_mat.transpose() * projected_inv;
        let innovation = measurement - projected_mean;
        self.mean += gain * innovation;

        // Joseph form
        let i_kh = SMatrix::<f32, 8, 8>::identity() - gain * update_mat;
        self.covariance = i_kh * self.covariance * i_kh.transpose() + gain * r * gain.transpose();
    }

    /// Current box estimate.
    pub fn bbox(&self) -> BoundingBox {
        let mut tlwh: SVector<f32, 4> = self.mean.fixed_rows::<4>(0).clone_owned();
        tlwh[2] = tlwh[2].max(MIN_EXTENT);
        tlwh[3] = tlwh[3].max(MIN_EXTENT);
        BoundingBox::from_tlwh(&tlwh)
    }

    /// Velocity of `(x, y, w, h)` in pixels per frame.
    #[cfg(test)]
    pub(crate) fn velocity(&self) -> SVector<f32, 4> {
        self.mean.fixed_rows::<4>(4).clone_owned()
    }

    fn scale(&self) -> (f32, f32) {
        (self.mean[2].abs().max(1.0), self.mean[3].abs().max(1.0))
    }
}

fn motion_matrix(dt: f32) -> SMatrix<f32, 8, 8> {
    let mut motion = SMatrix::<f32, 8, 8>::identity();
    for i in 0..4 {
        motion[(i, 4 + i)] = dt;
    }
    motion
}

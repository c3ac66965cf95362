// Field pose estimation
//
// Fuses per-tick swerve odometry with sparse, latency-delayed vision poses.
// Odometry poses are kept for a short history window. A vision pose is
// compared against the estimate at its capture time, blended in with a
// steady-state Kalman gain, and stored together with the odometry pose of
// that instant. The present estimate is the newest blended pose carried
// forward by the odometry motion since it was captured.

mod buffer;
mod odometry;

use tracing::{debug, warn};

use crate::config::EstimatorConfig;
use crate::geometry::{Pose2d, Rotation2d, Translation2d, Twist2d};
use crate::swerve::{ModulePosition, Modules, SwerveKinematics};

pub use buffer::PoseHistory;
pub use odometry::SwerveOdometry;

/// A blended vision pose and the odometry pose at the same timestamp
#[derive(Debug, Clone, Copy)]
struct VisionUpdate {
    vision_pose: Pose2d,
    odometry_pose: Pose2d,
}

impl VisionUpdate {
    /// Carry the blended pose forward by the odometry motion since then
    fn compensate(&self, odometry_pose: Pose2d) -> Pose2d {
        self.vision_pose + (odometry_pose - self.odometry_pose)
    }
}

pub struct PoseEstimator {
    odometry: SwerveOdometry,
    odometry_history: PoseHistory,
    // Sorted by timestamp, no duplicates
    vision_updates: Vec<(f64, VisionUpdate)>,
    // Squared state standard deviations
    state_variance: [f64; 3],
    vision_gain: [f64; 3],
    pose_estimate: Pose2d,
}

impl PoseEstimator {
    pub fn new(
        kinematics: SwerveKinematics,
        heading: Rotation2d,
        positions: Modules<ModulePosition>,
        initial_pose: Pose2d,
        config: &EstimatorConfig,
    ) -> Self {
        let mut estimator = Self {
            odometry: SwerveOdometry::new(kinematics, heading, positions, initial_pose),
            odometry_history: PoseHistory::new(config.history_seconds),
            vision_updates: Vec::new(),
            state_variance: config.state_std_devs.map(|s| s * s),
            vision_gain: [0.0; 3],
            pose_estimate: initial_pose,
        };
        estimator.set_vision_std_devs(config.vision_std_devs);
        estimator
    }

    /// Trust in vision per axis (x m, y m, heading rad); lower = more trust
    pub fn set_vision_std_devs(&mut self, std_devs: [f64; 3]) {
        for i in 0..3 {
            let q = self.state_variance[i];
            let r = std_devs[i] * std_devs[i];
            self.vision_gain[i] = if q == 0.0 { 0.0 } else { q / (q + (q * r).sqrt()) };
        }
        debug!("Vision gain now {:?}", self.vision_gain);
    }

    /// Integrate odometry at `timestamp` (s).
    ///
    /// Timestamps that do not advance past the latest update are ignored.
    pub fn update_with_time(&mut self, timestamp: f64, heading: Rotation2d, positions: Modules<ModulePosition>) -> Pose2d {
        if !timestamp.is_finite() || !heading.radians().is_finite() || !positions.iter().all(|p| p.is_finite()) {
            warn!("Ignoring non-finite odometry update at t={}", timestamp);
            return self.pose_estimate;
        }
        if self
            .odometry_history
            .newest_timestamp()
            .is_some_and(|newest| timestamp <= newest)
        {
            debug!("Ignoring non-monotonic odometry update at t={}", timestamp);
            return self.pose_estimate;
        }

        let odometry_pose = self.odometry.update(heading, positions);
        self.odometry_history.add_sample(timestamp, odometry_pose);

        self.pose_estimate = match self.vision_updates.last() {
            Some((_, update)) => update.compensate(odometry_pose),
            None => odometry_pose,
        };
        self.pose_estimate
    }

    /// Blend in a field pose observed at `timestamp` (s), which may be in the past.
    ///
    /// Measurements older than the history window are dropped.
    pub fn add_vision_measurement(&mut self, pose: Pose2d, timestamp: f64) {
        if !pose.is_finite() || !timestamp.is_finite() {
            warn!("Ignoring non-finite vision measurement {:?} at t={}", pose, timestamp);
            return;
        }
        let Some(newest) = self.odometry_history.newest_timestamp() else {
            return;
        };
        if newest - self.odometry_history.history_seconds() > timestamp {
            debug!("Dropping vision measurement {:.3}s older than history", newest - timestamp);
            return;
        }

        self.clean_up_vision_updates();

        let (Some(odometry_sample), Some(estimate_sample)) =
            (self.odometry_history.sample(timestamp), self.sample_at(timestamp))
        else {
            return;
        };

        let twist = estimate_sample.log(pose);
        let scaled = Twist2d::new(
            twist.dx * self.vision_gain[0],
            twist.dy * self.vision_gain[1],
            twist.dtheta * self.vision_gain[2],
        );
        let update = VisionUpdate {
            vision_pose: estimate_sample.exp(scaled),
            odometry_pose: odometry_sample,
        };

        // Later updates were derived from the old belief; drop them
        let at_or_after = self.vision_updates.partition_point(|(t, _)| *t < timestamp);
        self.vision_updates.truncate(at_or_after);
        self.vision_updates.push((timestamp, update));

        self.pose_estimate = update.compensate(self.odometry.pose());
    }

    pub fn add_vision_measurement_with_std_devs(&mut self, pose: Pose2d, timestamp: f64, std_devs: [f64; 3]) {
        self.set_vision_std_devs(std_devs);
        self.add_vision_measurement(pose, timestamp);
    }

    /// Current fused field pose
    pub fn pose(&self) -> Pose2d {
        self.pose_estimate
    }

    /// Pose from wheel odometry and gyro alone
    pub fn odometry_pose(&self) -> Pose2d {
        self.odometry.pose()
    }

    /// Fused estimate at a past `timestamp`, clamped to the history window
    pub fn sample_at(&self, timestamp: f64) -> Option<Pose2d> {
        let oldest = self.odometry_history.oldest_timestamp()?;
        let newest = self.odometry_history.newest_timestamp()?;
        let timestamp = timestamp.clamp(oldest, newest);

        let floor = self.vision_updates.partition_point(|(t, _)| *t <= timestamp);
        if floor == 0 {
            return self.odometry_history.sample(timestamp);
        }
        let (_, update) = self.vision_updates[floor - 1];
        self.odometry_history
            .sample(timestamp)
            .map(|odometry_pose| update.compensate(odometry_pose))
    }

    /// Hard-seed the pose, keeping the current encoder and gyro baselines
    pub fn reset(&mut self, pose: Pose2d) {
        self.odometry.reset_pose(pose);
        self.clear_history();
    }

    pub fn reset_rotation(&mut self, rotation: Rotation2d) {
        self.odometry.reset_rotation(rotation);
        self.clear_history();
    }

    pub fn reset_translation(&mut self, translation: Translation2d) {
        self.odometry.reset_translation(translation);
        self.clear_history();
    }

    /// Hard-seed the pose against new raw gyro and encoder readings
    pub fn reset_position(&mut self, heading: Rotation2d, positions: Modules<ModulePosition>, pose: Pose2d) {
        self.odometry.reset_position(heading, positions, pose);
        self.clear_history();
    }

    fn clear_history(&mut self) {
        self.odometry_history.clear();
        self.vision_updates.clear();
        self.pose_estimate = self.odometry.pose();
    }

    /// Drop vision updates no longer needed to sample the odometry history,
    /// keeping the newest one at or before its oldest entry
    fn clean_up_vision_updates(&mut self) {
        let Some(oldest) = self.odometry_history.oldest_timestamp() else {
            return;
        };
        match self.vision_updates.first() {
            Some((first, _)) if oldest >= *first => {}
            _ => return,
        }
        let floor = self.vision_updates.partition_point(|(t, _)| *t <= oldest);
        self.vision_updates.drain(..floor - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const DT: f64 = 0.02;

    fn positions(distance: f64) -> Modules<ModulePosition> {
        Modules::from_array([ModulePosition::new(distance, Rotation2d::ZERO); 4])
    }

    fn estimator(vision_std_devs: [f64; 3]) -> PoseEstimator {
        let config = EstimatorConfig {
            vision_std_devs,
            ..EstimatorConfig::default()
        };
        let kinematics = SwerveKinematics::rectangular(0.6, 0.6).unwrap();
        PoseEstimator::new(kinematics, Rotation2d::ZERO, positions(0.0), Pose2d::default(), &config)
    }

    /// Drive straight ahead at 1 m/s for `ticks` ticks starting at t=0
    fn drive(estimator: &mut PoseEstimator, ticks: usize) {
        for i in 0..=ticks {
            let t = i as f64 * DT;
            estimator.update_with_time(t, Rotation2d::ZERO, positions(t));
        }
    }

    #[test]
    fn test_odometry_only_tracks_wheels() {
        let mut est = estimator([0.9; 3]);
        drive(&mut est, 50);
        assert_relative_eq!(est.pose().x(), 1.0, epsilon = 1e-9);
        assert_eq!(est.pose(), est.odometry_pose());
    }

    #[test]
    fn test_non_monotonic_update_is_noop() {
        let mut est = estimator([0.9; 3]);
        drive(&mut est, 10);
        let before = est.pose();
        est.update_with_time(0.1, Rotation2d::ZERO, positions(5.0));
        est.update_with_time(10.0 * DT, Rotation2d::ZERO, positions(5.0));
        assert_eq!(est.pose(), before);
    }

    #[test]
    fn test_measurement_matching_odometry_is_negligible() {
        let mut est = estimator([0.9; 3]);
        drive(&mut est, 50);
        let before = est.pose();
        let then = est.sample_at(0.5).unwrap();
        est.add_vision_measurement(then, 0.5);
        assert_relative_eq!(est.pose().x(), before.x(), epsilon = 1e-9);
        assert_relative_eq!(est.pose().y(), before.y(), epsilon = 1e-9);
        assert_relative_eq!(est.pose().rotation.radians(), before.rotation.radians(), epsilon = 1e-9);
    }

    #[test]
    fn test_latency_compensation_shifts_by_offset() {
        // Full trust in vision
        let mut est = estimator([0.0; 3]);
        drive(&mut est, 50);
        let now = est.pose();

        // Observation 25 ticks ago says we were 0.3 m further left
        let then = est.sample_at(0.5).unwrap();
        let seen = Pose2d::new(then.x(), then.y() + 0.3, then.rotation);
        est.add_vision_measurement(seen, 0.5);

        assert_relative_eq!(est.pose().x(), now.x(), epsilon = 1e-9);
        assert_relative_eq!(est.pose().y(), now.y() + 0.3, epsilon = 1e-9);
        // Not snapped back to the stale vision pose
        assert!((est.pose().x() - seen.x()).abs() > 0.4);

        // Later odometry keeps the correction
        est.update_with_time(51.0 * DT, Rotation2d::ZERO, positions(51.0 * DT));
        assert_relative_eq!(est.pose().y(), 0.3, epsilon = 1e-9);
        assert_relative_eq!(est.pose().x(), 1.02, epsilon = 1e-9);
    }

    #[test]
    fn test_default_gain_moves_part_way() {
        // q = 0.01, r = 0.81 -> K = 0.01 / (0.01 + 0.09) = 0.1
        let mut est = estimator([0.9; 3]);
        drive(&mut est, 50);
        let now = est.pose();
        est.add_vision_measurement(Pose2d::new(now.x(), now.y() + 1.0, now.rotation), 1.0);
        assert_relative_eq!(est.pose().y(), 0.1, epsilon = 1e-9);
    }

    #[test]
    fn test_old_measurement_dropped() {
        let mut est = estimator([0.0; 3]);
        drive(&mut est, 100);
        let before = est.pose();
        est.add_vision_measurement(Pose2d::new(-5.0, 3.0, Rotation2d::ZERO), 0.1);
        assert_eq!(est.pose(), before);
    }

    #[test]
    fn test_measurement_before_any_update_dropped() {
        let mut est = estimator([0.0; 3]);
        est.add_vision_measurement(Pose2d::new(1.0, 1.0, Rotation2d::ZERO), 0.0);
        assert_eq!(est.pose(), Pose2d::default());
    }

    #[test]
    fn test_newer_measurement_replaces_later_corrections() {
        let mut est = estimator([0.0; 3]);
        drive(&mut est, 50);
        let then = est.sample_at(0.8).unwrap();
        est.add_vision_measurement(Pose2d::new(then.x(), 0.5, Rotation2d::ZERO), 0.8);
        // An older measurement re-derives from its own time and discards the 0.8 s one
        let earlier = est.sample_at(0.4).unwrap();
        est.add_vision_measurement(Pose2d::new(earlier.x(), -0.2, Rotation2d::ZERO), 0.4);
        assert_relative_eq!(est.pose().y(), -0.2, epsilon = 1e-9);
        assert_eq!(est.vision_updates.len(), 1);
    }

    #[test]
    fn test_reset_clears_vision_history() {
        let mut est = estimator([0.0; 3]);
        drive(&mut est, 20);
        est.add_vision_measurement(Pose2d::new(0.0, 2.0, Rotation2d::ZERO), 0.2);
        est.reset(Pose2d::new(3.0, 4.0, Rotation2d::new(1.0)));
        assert_eq!(est.pose(), Pose2d::new(3.0, 4.0, Rotation2d::new(1.0)));
        assert!(est.vision_updates.is_empty());
        assert!(est.sample_at(0.0).is_none());
    }

    #[test]
    fn test_reset_rotation_and_translation() {
        let mut est = estimator([0.9; 3]);
        drive(&mut est, 50);
        est.reset_rotation(Rotation2d::new(0.5));
        assert_relative_eq!(est.pose().x(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(est.pose().rotation.radians(), 0.5, epsilon = 1e-12);

        est.reset_translation(Translation2d::new(-1.0, 2.0));
        assert_relative_eq!(est.pose().x(), -1.0);
        assert_relative_eq!(est.pose().rotation.radians(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_state_variance_ignores_vision() {
        let config = EstimatorConfig {
            state_std_devs: [0.0; 3],
            ..EstimatorConfig::default()
        };
        let kinematics = SwerveKinematics::rectangular(0.6, 0.6).unwrap();
        let mut est = PoseEstimator::new(kinematics, Rotation2d::ZERO, positions(0.0), Pose2d::default(), &config);
        drive(&mut est, 10);
        let before = est.pose();
        est.add_vision_measurement(Pose2d::new(5.0, 5.0, Rotation2d::ZERO), 0.1);
        assert_relative_eq!(est.pose().x(), before.x(), epsilon = 1e-9);
        assert_relative_eq!(est.pose().y(), before.y(), epsilon = 1e-9);
    }

    #[test]
    fn test_non_finite_inputs_ignored() {
        let mut est = estimator([0.0; 3]);
        drive(&mut est, 5);
        let before = est.pose();
        est.update_with_time(1.0, Rotation2d::ZERO, positions(f64::NAN));
        est.add_vision_measurement(Pose2d::new(f64::NAN, 0.0, Rotation2d::ZERO), 0.05);
        assert_eq!(est.pose(), before);
    }
}

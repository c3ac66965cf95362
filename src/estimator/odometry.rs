// Swerve wheel odometry: integrates module position deltas as arcs, with
// heading taken from the gyro rather than the wheels.

use crate::geometry::{Pose2d, Rotation2d, Translation2d};
use crate::swerve::{ModulePosition, Modules, SwerveKinematics};

#[derive(Debug, Clone)]
pub struct SwerveOdometry {
    kinematics: SwerveKinematics,
    pose: Pose2d,
    // Field heading minus raw gyro heading
    gyro_offset: Rotation2d,
    previous_angle: Rotation2d,
    previous_positions: Modules<ModulePosition>,
}

impl SwerveOdometry {
    pub fn new(
        kinematics: SwerveKinematics,
        gyro_angle: Rotation2d,
        positions: Modules<ModulePosition>,
        initial_pose: Pose2d,
    ) -> Self {
        Self {
            kinematics,
            pose: initial_pose,
            gyro_offset: initial_pose.rotation - gyro_angle,
            previous_angle: initial_pose.rotation,
            previous_positions: positions,
        }
    }

    pub fn pose(&self) -> Pose2d {
        self.pose
    }

    /// Integrate one step and return the new pose
    pub fn update(&mut self, gyro_angle: Rotation2d, positions: Modules<ModulePosition>) -> Pose2d {
        let angle = gyro_angle + self.gyro_offset;

        let mut twist = self.kinematics.to_twist(&self.previous_positions, &positions);
        twist.dtheta = (angle - self.previous_angle).radians();

        let moved = self.pose.exp(twist);
        self.previous_positions = positions;
        self.previous_angle = angle;
        self.pose = Pose2d::from_parts(moved.translation, angle);
        self.pose
    }

    /// Re-seed against the given raw gyro angle and module positions
    pub fn reset_position(&mut self, gyro_angle: Rotation2d, positions: Modules<ModulePosition>, pose: Pose2d) {
        self.pose = pose;
        self.previous_angle = pose.rotation;
        self.gyro_offset = pose.rotation - gyro_angle;
        self.previous_positions = positions;
    }

    pub fn reset_pose(&mut self, pose: Pose2d) {
        self.gyro_offset = self.gyro_offset + (pose.rotation - self.pose.rotation);
        self.pose = pose;
        self.previous_angle = pose.rotation;
    }

    pub fn reset_translation(&mut self, translation: Translation2d) {
        self.pose = Pose2d::from_parts(translation, self.pose.rotation);
    }

    pub fn reset_rotation(&mut self, rotation: Rotation2d) {
        self.gyro_offset = self.gyro_offset + (rotation - self.pose.rotation);
        self.pose = Pose2d::from_parts(self.pose.translation, rotation);
        self.previous_angle = rotation;
    }
}

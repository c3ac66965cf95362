// Wire messages exchanged over zenoh

use serde::{Deserialize, Serialize};

use crate::geometry::{Pose2d, RigidTransform, Rotation2d};
use crate::swerve::ChassisSpeeds;

// Command from teleop/scripts -> runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChassisCommand {
    pub x_vel: f64,     // m/s, positive = forward
    pub y_vel: f64,     // m/s, positive = left
    pub theta_vel: f64, // rad/s, positive = counter-clockwise
    // Interpret x/y in the field frame instead of the robot frame
    #[serde(default)]
    pub field_relative: bool,
}

impl From<&ChassisCommand> for ChassisSpeeds {
    fn from(cmd: &ChassisCommand) -> Self {
        ChassisSpeeds::new(cmd.x_vel, cmd.y_vel, cmd.theta_vel)
    }
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
}

// Setpoint from runtime -> hardware bridge, one per motor per tick at most
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum MotorSetpoint {
    /// Motor RPM with an additive feedforward in volts
    Velocity { value: f64, feedforward: f64 },
    /// Fraction of bus voltage in [-1, 1]
    DutyCycle { value: f64 },
    /// Motor rotations with an additive feedforward in volts
    Position { value: f64, feedforward: f64 },
}

impl MotorSetpoint {
    pub fn stop() -> Self {
        MotorSetpoint::DutyCycle { value: 0.0 }
    }
}

// Feedback from hardware bridge -> runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MotorFeedback {
    pub position: f64, // rotations (absolute encoder for steer motors)
    pub velocity: f64, // RPM
    #[serde(default)]
    pub current: f64, // A
    #[serde(default)]
    pub forward_limit: bool,
    #[serde(default)]
    pub reverse_limit: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GyroFeedback {
    pub yaw: f64, // rad, counter-clockwise positive
}

/// One landmark seen in a camera frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackedTarget {
    pub fiducial_id: u32,
    /// Reprojection ambiguity in [0, 1]; negative when the pipeline could not compute it
    pub ambiguity: f64,
    pub camera_to_target: RigidTransform,
}

// Camera pipeline -> runtime, one completed frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMessage {
    /// Capture to publish delay
    #[serde(default)]
    pub latency_ms: f64,
    pub targets: Vec<TrackedTarget>,
}

// Fused field pose published each tick
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseMessage {
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub heading: f64, // rad
}

impl PoseMessage {
    pub fn new(timestamp: f64, pose: Pose2d) -> Self {
        Self {
            timestamp,
            x: pose.x(),
            y: pose.y(),
            heading: pose.rotation.radians(),
        }
    }

    pub fn pose(&self) -> Pose2d {
        Pose2d::new(self.x, self.y, Rotation2d::new(self.heading))
    }
}

// Vision: camera pipelines to filtered field-pose measurements
//
// Provides:
// - Landmark (AprilTag) field layout
// - Camera-backed provider with ambiguity and distance filtering
// - Simulated camera world for running without hardware

pub mod layout;
pub mod provider;
pub mod sim;

use crate::geometry::Pose2d;
use crate::messages::TrackedTarget;
use crate::telemetry::Table;

pub use layout::FieldLayout;
pub use provider::{CameraVision, FrameQueue};
pub use sim::SimulatedVision;

/// A field pose observed at a past instant; consumed once by the estimator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub pose: Pose2d,
    pub timestamp: f64, // s, runtime clock
}

/// One completed camera frame
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionFrame {
    /// Capture time, s, runtime clock
    pub timestamp: f64,
    pub targets: Vec<TrackedTarget>,
}

/// Error types for vision (never fatal; the affected item is skipped)
#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error("Camera {camera} pipeline error: {reason}")]
    Pipeline { camera: String, reason: String },

    #[error("Camera {camera} reported a malformed target: {reason}")]
    MalformedTarget { camera: String, reason: String },

    #[error("Tag {id} is not in the field layout")]
    UnknownTag { id: u32 },
}

/// Source of detection frames for one camera
pub trait CameraPipeline {
    /// Frames completed since the last poll, oldest first
    fn poll_frames(&mut self) -> Result<Vec<DetectionFrame>, VisionError>;
}

pub trait VisionProvider {
    /// Advance hook, called once per tick before draining; real cameras ignore it
    fn periodic(&mut self, _timestamp: f64) {}

    /// Measurements from every frame completed since the last drain.
    ///
    /// `reference` is the current best pose, used to resolve each detection.
    fn drain_measurements(&mut self, reference: Pose2d) -> Vec<Measurement>;

    /// Robot pose from the single most confident landmark currently in view
    fn best_start_pose(&self) -> Option<Pose2d>;

    fn publish(&self, _table: &mut Table<'_>) {}
}

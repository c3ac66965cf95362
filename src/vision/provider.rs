// Camera-backed vision provider
//
// Each camera is a pipeline of detection frames plus its mounting transform.
// Every frame completed since the last drain is processed; each target is
// filtered on ambiguity and distance, then resolved to a robot field pose
// using the reference heading.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use nalgebra::{Isometry3, Point3};
use tracing::{debug, info, warn};

use super::{CameraPipeline, DetectionFrame, FieldLayout, Measurement, VisionError, VisionProvider};
use crate::config::{CameraConfig, VisionConfig};
use crate::geometry::{Pose2d, RigidTransform, Rotation2d, Translation2d, isometry_to_pose2d};
use crate::messages::{FrameMessage, TrackedTarget};
use crate::telemetry::Table;

/// Quality gate applied to every target before pose resolution
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetFilter {
    pub max_ambiguity: f64,
    pub max_distance: f64,
}

impl TargetFilter {
    pub fn from_config(config: &VisionConfig) -> Self {
        Self {
            max_ambiguity: config.max_ambiguity,
            max_distance: config.max_distance,
        }
    }

    pub fn accepts(&self, target: &TrackedTarget) -> bool {
        // Negative ambiguity means the pipeline could not compute it
        let ambiguity_ok = target.ambiguity >= 0.0 && target.ambiguity <= self.max_ambiguity;
        ambiguity_ok && target.camera_to_target.distance() < self.max_distance
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct CameraStats {
    frames: u64,
    accepted: u64,
    rejected: u64,
    errors: u64,
}

struct Camera {
    name: String,
    robot_to_camera: Isometry3<f64>,
    pipeline: Box<dyn CameraPipeline>,
    latest_frame: Option<DetectionFrame>,
    stats: CameraStats,
}

impl Camera {
    fn check_target(&self, target: &TrackedTarget) -> Result<(), VisionError> {
        let c = target.camera_to_target;
        if [c.x, c.y, c.z, c.roll, c.pitch, c.yaw].iter().all(|v| v.is_finite()) {
            Ok(())
        } else {
            Err(VisionError::MalformedTarget {
                camera: self.name.clone(),
                reason: format!("non-finite transform for tag {}", target.fiducial_id),
            })
        }
    }
}

pub struct CameraVision {
    layout: FieldLayout,
    filter: TargetFilter,
    cameras: Vec<Camera>,
}

impl CameraVision {
    pub fn new(config: &VisionConfig, layout: FieldLayout) -> Self {
        Self {
            layout,
            filter: TargetFilter::from_config(config),
            cameras: Vec::new(),
        }
    }

    /// Provider fed by one [`FrameQueue`] per configured camera
    pub fn with_frame_queues(config: &VisionConfig, layout: FieldLayout) -> (Self, Vec<FrameQueue>) {
        let mut vision = Self::new(config, layout);
        let queues: Vec<FrameQueue> = config
            .cameras
            .iter()
            .map(|camera| {
                let queue = FrameQueue::new(&camera.name);
                vision.add_camera(camera, queue.clone());
                queue
            })
            .collect();
        (vision, queues)
    }

    pub fn add_camera(&mut self, config: &CameraConfig, pipeline: impl CameraPipeline + 'static) {
        info!("Adding camera {} at {:?}", config.name, config.robot_to_camera);
        self.cameras.push(Camera {
            name: config.name.clone(),
            robot_to_camera: config.robot_to_camera.to_isometry(),
            pipeline: Box::new(pipeline),
            latest_frame: None,
            stats: CameraStats::default(),
        });
    }

    pub fn layout(&self) -> &FieldLayout {
        &self.layout
    }

    pub fn filter(&self) -> TargetFilter {
        self.filter
    }

    pub fn camera_names(&self) -> impl Iterator<Item = &str> {
        self.cameras.iter().map(|c| c.name.as_str())
    }
}

impl VisionProvider for CameraVision {
    fn drain_measurements(&mut self, reference: Pose2d) -> Vec<Measurement> {
        let heading = reference.rotation;
        let mut measurements = Vec::new();

        for camera in &mut self.cameras {
            let frames = match camera.pipeline.poll_frames() {
                Ok(frames) => frames,
                Err(e) => {
                    warn!("{}", e);
                    camera.stats.errors += 1;
                    continue;
                }
            };

            for frame in &frames {
                if !frame.timestamp.is_finite() {
                    warn!("Camera {}: dropping frame with bad timestamp", camera.name);
                    camera.stats.errors += 1;
                    continue;
                }
                for target in &frame.targets {
                    let resolved = match camera.check_target(target) {
                        Err(e) => Err(e),
                        Ok(()) if !self.filter.accepts(target) => Ok(None),
                        Ok(()) => resolve_with_heading(&self.layout, &camera.robot_to_camera, target, heading).map(Some),
                    };
                    match resolved {
                        Ok(Some(pose)) => {
                            camera.stats.accepted += 1;
                            measurements.push(Measurement {
                                pose,
                                timestamp: frame.timestamp,
                            });
                        }
                        Ok(None) => camera.stats.rejected += 1,
                        Err(e) => {
                            debug!("Camera {}: {}", camera.name, e);
                            camera.stats.errors += 1;
                        }
                    }
                }
            }

            camera.stats.frames += frames.len() as u64;
            if let Some(frame) = frames.into_iter().last() {
                camera.latest_frame = Some(frame);
            }
        }

        measurements
    }

    fn best_start_pose(&self) -> Option<Pose2d> {
        let (camera, target, tag) = self
            .cameras
            .iter()
            .filter_map(|c| c.latest_frame.as_ref().map(|f| (c, f)))
            .flat_map(|(c, f)| f.targets.iter().map(move |t| (c, t)))
            .filter(|(c, t)| t.ambiguity >= 0.0 && c.check_target(t).is_ok())
            .filter_map(|(c, t)| self.layout.tag_pose(t.fiducial_id).map(|tag| (c, t, tag)))
            .min_by(|a, b| a.1.ambiguity.total_cmp(&b.1.ambiguity))?;

        let field_to_robot = solve_field_to_robot(tag, &target.camera_to_target.to_isometry(), &camera.robot_to_camera);
        let pose = isometry_to_pose2d(&field_to_robot);
        debug!("Start pose from tag {} on {}: {:?}", target.fiducial_id, camera.name, pose);
        pose.is_finite().then_some(pose)
    }

    fn publish(&self, table: &mut Table<'_>) {
        for camera in &self.cameras {
            let key = |k: &str| format!("{}/{}", camera.name, k);
            table.log_int(&key("frames"), camera.stats.frames as i64);
            table.log_int(&key("accepted"), camera.stats.accepted as i64);
            table.log_int(&key("rejected"), camera.stats.rejected as i64);
            table.log_int(&key("errors"), camera.stats.errors as i64);
            table.log_transform(&key("robot_to_camera"), RigidTransform::from_isometry(&camera.robot_to_camera));
            if let Some(frame) = &camera.latest_frame {
                table.log_double(&key("latest_frame_timestamp"), frame.timestamp);
                table.log_int(&key("visible_tags"), frame.targets.len() as i64);
            }
        }
    }
}

/// Robot field pose from one target, trusting `heading` for orientation.
///
/// The camera-to-target translation is rotated into the robot frame and
/// offset by the mount; the result, rotated by the heading, is subtracted
/// from the tag's field position.
pub fn resolve_with_heading(
    layout: &FieldLayout,
    robot_to_camera: &Isometry3<f64>,
    target: &TrackedTarget,
    heading: Rotation2d,
) -> Result<Pose2d, VisionError> {
    let tag = layout
        .tag_pose(target.fiducial_id)
        .ok_or(VisionError::UnknownTag { id: target.fiducial_id })?;

    let c = &target.camera_to_target;
    let robot_to_tag = robot_to_camera * Point3::new(c.x, c.y, c.z);
    let offset = Translation2d::new(robot_to_tag.x, robot_to_tag.y).rotate_by(heading);
    let tag_xy = Translation2d::new(tag.translation.vector.x, tag.translation.vector.y);

    Ok(Pose2d::from_parts(tag_xy - offset, heading))
}

/// Full 3D solve: field->tag * (camera->tag)^-1 * (robot->camera)^-1
pub fn solve_field_to_robot(
    field_to_tag: &Isometry3<f64>,
    camera_to_tag: &Isometry3<f64>,
    robot_to_camera: &Isometry3<f64>,
) -> Isometry3<f64> {
    field_to_tag * camera_to_tag.inverse() * robot_to_camera.inverse()
}

#[derive(Debug, Default)]
struct FrameQueueState {
    frames: VecDeque<DetectionFrame>,
    error: Option<String>,
}

/// Camera pipeline fed from outside the tick (zenoh samples in the runtime)
#[derive(Debug, Clone)]
pub struct FrameQueue {
    camera: String,
    state: Rc<RefCell<FrameQueueState>>,
}

impl FrameQueue {
    pub fn new(camera: &str) -> Self {
        Self {
            camera: camera.to_string(),
            state: Rc::default(),
        }
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }

    pub fn push(&self, frame: DetectionFrame) {
        self.state.borrow_mut().frames.push_back(frame);
    }

    /// Queue a wire frame received at `received_at`; capture time is
    /// back-dated by the reported latency
    pub fn push_message(&self, message: FrameMessage, received_at: f64) {
        if !(message.latency_ms.is_finite() && message.latency_ms >= 0.0) {
            self.fail(format!("invalid latency {} ms", message.latency_ms));
            return;
        }
        self.push(DetectionFrame {
            timestamp: received_at - message.latency_ms / 1000.0,
            targets: message.targets,
        });
    }

    /// Report a failure on the next poll
    pub fn fail(&self, reason: impl Into<String>) {
        self.state.borrow_mut().error = Some(reason.into());
    }

    pub fn len(&self) -> usize {
        self.state.borrow().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CameraPipeline for FrameQueue {
    fn poll_frames(&mut self) -> Result<Vec<DetectionFrame>, VisionError> {
        let mut state = self.state.borrow_mut();
        if let Some(reason) = state.error.take() {
            return Err(VisionError::Pipeline {
                camera: self.camera.clone(),
                reason,
            });
        }
        Ok(state.frames.drain(..).collect())
    }
}

// Simulated camera world
//
// Renders detection frames for every tag a camera could see from the
// current robot pose: inside the field of view, within range and facing
// the camera. Frames are captured at the configured rate and released
// after a Gaussian latency. Ambiguity grows with viewing obliqueness.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use nalgebra::{Isometry3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use tracing::info;

use super::{CameraPipeline, CameraVision, DetectionFrame, FieldLayout, Measurement, VisionError, VisionProvider};
use crate::config::{SimCameraConfig, VisionConfig};
use crate::geometry::{Pose2d, RigidTransform, pose2d_to_isometry};
use crate::messages::TrackedTarget;
use crate::telemetry::Table;

#[derive(Debug, Clone, Copy)]
struct Optics {
    half_hfov: f64, // rad
    half_vfov: f64, // rad
    max_range: f64,
    frame_period: f64, // s
    latency: f64,      // s
    latency_std_dev: f64,
}

impl Optics {
    fn from_config(config: &SimCameraConfig) -> Self {
        // Pinhole model: split the diagonal FOV by the sensor aspect ratio
        let (w, h) = (config.width as f64, config.height as f64);
        let focal = (w.hypot(h) / 2.0) / (config.fov_deg.to_radians() / 2.0).tan();
        Self {
            half_hfov: (w / 2.0 / focal).atan(),
            half_vfov: (h / 2.0 / focal).atan(),
            max_range: config.max_range,
            frame_period: 1.0 / config.fps,
            latency: config.avg_latency_ms / 1000.0,
            latency_std_dev: config.latency_std_dev_ms / 1000.0,
        }
    }
}

/// Ground truth shared by all simulated cameras
pub struct SimWorld {
    layout: FieldLayout,
    optics: Optics,
    robot_pose: Pose2d,
    now: f64,
    rng: StdRng,
}

impl SimWorld {
    pub fn new(layout: FieldLayout, config: &SimCameraConfig) -> Self {
        Self {
            layout,
            optics: Optics::from_config(config),
            robot_pose: Pose2d::default(),
            now: 0.0,
            rng: StdRng::seed_from_u64(config.seed),
        }
    }

    pub fn set_robot_pose(&mut self, pose: Pose2d) {
        self.robot_pose = pose;
    }

    pub fn advance_to(&mut self, now: f64) {
        if now > self.now {
            self.now = now;
        }
    }

    pub fn now(&self) -> f64 {
        self.now
    }

    /// Targets visible from a camera mounted at `robot_to_camera`, by tag id
    pub fn render(&self, timestamp: f64, robot_to_camera: &Isometry3<f64>) -> DetectionFrame {
        let field_to_camera = pose2d_to_isometry(self.robot_pose) * robot_to_camera;
        let camera_to_field = field_to_camera.inverse();
        let camera_position = field_to_camera.translation.vector;

        let mut targets: Vec<TrackedTarget> = self
            .layout
            .tags()
            .filter_map(|(id, field_to_tag)| {
                let camera_to_tag = camera_to_field * field_to_tag;
                let t = camera_to_tag.translation.vector;
                if t.x <= 0.0 || t.norm() > self.optics.max_range {
                    return None;
                }
                if t.y.atan2(t.x).abs() > self.optics.half_hfov || t.z.atan2(t.x).abs() > self.optics.half_vfov {
                    return None;
                }

                // The tag face points along its +x axis
                let normal = field_to_tag.rotation * Vector3::x();
                let to_camera = (camera_position - field_to_tag.translation.vector).normalize();
                let facing = normal.dot(&to_camera);
                if facing <= 0.0 {
                    return None;
                }

                Some(TrackedTarget {
                    fiducial_id: id,
                    ambiguity: (1.0 - facing).clamp(0.0, 1.0),
                    camera_to_target: RigidTransform::from_isometry(&camera_to_tag),
                })
            })
            .collect();
        targets.sort_by_key(|t| t.fiducial_id);

        DetectionFrame { timestamp, targets }
    }

    /// Gaussian latency, never negative
    fn sample_latency(&mut self) -> f64 {
        if self.optics.latency_std_dev == 0.0 {
            return self.optics.latency;
        }
        let n: f64 = self.rng.sample(StandardNormal);
        (self.optics.latency + n * self.optics.latency_std_dev).max(0.0)
    }
}

/// One simulated camera; frames are released once their latency has elapsed.
///
/// At most one frame is captured per poll.
pub struct SimCamera {
    robot_to_camera: Isometry3<f64>,
    world: Rc<RefCell<SimWorld>>,
    next_capture: Option<f64>,
    // (release time, frame), in capture order
    in_flight: VecDeque<(f64, DetectionFrame)>,
}

impl SimCamera {
    pub fn new(robot_to_camera: Isometry3<f64>, world: Rc<RefCell<SimWorld>>) -> Self {
        Self {
            robot_to_camera,
            world,
            next_capture: None,
            in_flight: VecDeque::new(),
        }
    }
}

impl CameraPipeline for SimCamera {
    fn poll_frames(&mut self) -> Result<Vec<DetectionFrame>, VisionError> {
        let mut world = self.world.borrow_mut();
        let now = world.now;
        let period = world.optics.frame_period;

        // The world only knows the pose at `now`, so captures due since the
        // last poll are rendered and stamped at `now`
        let next = self.next_capture.get_or_insert(now);
        if *next <= now {
            let frame = world.render(now, &self.robot_to_camera);
            let release = now + world.sample_latency();
            self.in_flight.push_back((release, frame));
            while *next <= now {
                *next += period;
            }
        }

        let mut ready = Vec::new();
        while self.in_flight.front().is_some_and(|(release, _)| *release <= now) {
            if let Some((_, frame)) = self.in_flight.pop_front() {
                ready.push(frame);
            }
        }
        Ok(ready)
    }
}

/// Camera vision over a simulated world.
///
/// The world is rendered at the reference pose handed to each drain, so
/// measurements agree with the estimate; this only exercises the pipeline.
pub struct SimulatedVision {
    world: Rc<RefCell<SimWorld>>,
    cameras: CameraVision,
}

impl SimulatedVision {
    pub fn new(config: &VisionConfig, layout: FieldLayout) -> Self {
        let world = Rc::new(RefCell::new(SimWorld::new(layout.clone(), &config.sim)));
        let mut cameras = CameraVision::new(config, layout);
        for camera in &config.cameras {
            let pipeline = SimCamera::new(camera.robot_to_camera.to_isometry(), Rc::clone(&world));
            cameras.add_camera(camera, pipeline);
        }
        info!(
            "Simulated vision: {} cameras at {} fps, {} ms latency",
            config.cameras.len(),
            config.sim.fps,
            config.sim.avg_latency_ms
        );
        Self { world, cameras }
    }

    pub fn world(&self) -> &Rc<RefCell<SimWorld>> {
        &self.world
    }
}

impl VisionProvider for SimulatedVision {
    fn periodic(&mut self, timestamp: f64) {
        self.world.borrow_mut().advance_to(timestamp);
    }

    fn drain_measurements(&mut self, reference: Pose2d) -> Vec<Measurement> {
        self.world.borrow_mut().set_robot_pose(reference);
        self.cameras.drain_measurements(reference)
    }

    fn best_start_pose(&self) -> Option<Pose2d> {
        self.cameras.best_start_pose()
    }

    fn publish(&self, table: &mut Table<'_>) {
        table.log_double("sim_time", self.world.borrow().now());
        self.cameras.publish(table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rotation2d;
    use approx::assert_relative_eq;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn sim_config(latency_ms: f64, std_dev_ms: f64, fps: f64) -> SimCameraConfig {
        SimCameraConfig {
            fps,
            avg_latency_ms: latency_ms,
            latency_std_dev_ms: std_dev_ms,
            ..SimCameraConfig::default()
        }
    }

    fn world(config: &SimCameraConfig) -> Rc<RefCell<SimWorld>> {
        Rc::new(RefCell::new(SimWorld::new(FieldLayout::builtin().unwrap(), config)))
    }

    fn front_mount() -> Isometry3<f64> {
        RigidTransform { x: 0.3, z: 0.25, ..Default::default() }.to_isometry()
    }

    fn visible_ids(world: &SimWorld, pose: Pose2d) -> Vec<u32> {
        let mut world_at = SimWorld::new(world.layout.clone(), &SimCameraConfig::default());
        world_at.set_robot_pose(pose);
        world_at.render(0.0, &front_mount()).targets.iter().map(|t| t.fiducial_id).collect()
    }

    #[test]
    fn test_fov_fits_diagonal() {
        let optics = Optics::from_config(&SimCameraConfig::default());
        // 4:3 sensor with a 90 degree diagonal
        assert_relative_eq!(optics.half_hfov, (0.8_f64).atan(), epsilon = 1e-12);
        assert_relative_eq!(optics.half_vfov, (0.6_f64).atan(), epsilon = 1e-12);
    }

    #[test]
    fn test_visibility_rules() {
        let w = world(&SimCameraConfig::default());
        let w = w.borrow();
        // Facing tag 8 head-on
        assert_eq!(visible_ids(&w, Pose2d::new(2.0, 2.0, Rotation2d::new(PI))), vec![8]);
        // Facing away from it; tag 6 on the side wall is just inside the FOV
        assert_eq!(visible_ids(&w, Pose2d::new(2.0, 2.0, Rotation2d::ZERO)), vec![6]);
        // Looking at a bare stretch of wall
        assert!(visible_ids(&w, Pose2d::new(2.0, 2.0, Rotation2d::new(-FRAC_PI_2))).is_empty());
        // Behind the tag, looking at its back
        assert!(!visible_ids(&w, Pose2d::new(-1.0, 2.0, Rotation2d::ZERO)).contains(&8));
        // Out of range
        assert!(!visible_ids(&w, Pose2d::new(9.0, 2.0, Rotation2d::new(PI))).contains(&8));
    }

    #[test]
    fn test_ambiguity_grows_with_obliqueness() {
        let mut w = SimWorld::new(FieldLayout::builtin().unwrap(), &SimCameraConfig::default());
        w.set_robot_pose(Pose2d::new(2.0, 2.0, Rotation2d::new(PI)));
        let head_on = w.render(0.0, &front_mount()).targets[0].ambiguity;

        // Off to the side, still pointed at tag 8
        w.set_robot_pose(Pose2d::new(2.0, 3.2, Rotation2d::new((-1.2_f64).atan2(-2.0))));
        let frame = w.render(0.0, &front_mount());
        let oblique = frame.targets.iter().find(|t| t.fiducial_id == 8).unwrap().ambiguity;
        assert!(head_on < 0.05);
        assert!(oblique > 0.1);
    }

    #[test]
    fn test_frame_cadence_follows_fps() {
        let config = sim_config(0.0, 0.0, 10.0);
        let w = world(&config);
        w.borrow_mut().set_robot_pose(Pose2d::new(2.0, 2.0, Rotation2d::new(PI)));
        let mut camera = SimCamera::new(front_mount(), Rc::clone(&w));

        let mut frames = 0;
        for tick in 0..50 {
            w.borrow_mut().advance_to(tick as f64 * 0.02);
            frames += camera.poll_frames().unwrap().len();
        }
        assert_eq!(frames, 10);
    }

    #[test]
    fn test_latency_delays_release() {
        let config = sim_config(35.0, 0.0, 30.0);
        let w = world(&config);
        let mut camera = SimCamera::new(front_mount(), Rc::clone(&w));

        w.borrow_mut().advance_to(1.0);
        assert!(camera.poll_frames().unwrap().is_empty());
        w.borrow_mut().advance_to(1.04);
        let frames = camera.poll_frames().unwrap();
        assert_eq!(frames.len(), 1);
        // Stamped with the capture time, not the release time
        assert_relative_eq!(frames[0].timestamp, 1.0);
    }

    #[test]
    fn test_frames_stamped_when_rendered() {
        let config = VisionConfig {
            sim: sim_config(35.0, 0.0, 15.0),
            ..VisionConfig::default()
        };
        let mut vision = SimulatedVision::new(&config, FieldLayout::builtin().unwrap());
        // Backing away from tag 8 at 0.5 m/s
        let pose_at = |t: f64| Pose2d::new(2.0 + 0.5 * t, 2.0, Rotation2d::new(PI));

        let mut measurements = Vec::new();
        for tick in 0..50 {
            let t = tick as f64 * 0.02;
            vision.periodic(t);
            measurements.extend(vision.drain_measurements(pose_at(t)));
        }
        assert!(measurements.len() > 5);
        for m in &measurements {
            assert_relative_eq!(m.pose.x(), pose_at(m.timestamp).x(), epsilon = 1e-6);
        }
    }

    #[test]
    fn test_latency_is_seeded_gaussian() {
        let config = sim_config(35.0, 5.0, 30.0);
        let (a, b) = (world(&config), world(&config));
        let samples: Vec<f64> = (0..4000).map(|_| a.borrow_mut().sample_latency()).collect();
        let again: Vec<f64> = (0..4000).map(|_| b.borrow_mut().sample_latency()).collect();
        assert_eq!(samples, again);

        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let std_dev = (samples.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / n).sqrt();
        assert_relative_eq!(mean, 0.035, epsilon = 5e-4);
        assert_relative_eq!(std_dev, 0.005, epsilon = 5e-4);
        // Tails reach past one standard deviation
        assert!(samples.iter().any(|l| *l > 0.0405));
        assert!(samples.iter().all(|l| *l >= 0.0));
    }

    #[test]
    fn test_latency_never_negative() {
        let config = sim_config(1.0, 50.0, 30.0);
        let w = world(&config);
        assert!((0..500).all(|_| w.borrow_mut().sample_latency() >= 0.0));
    }

    #[test]
    fn test_simulated_provider_round_trip() {
        let config = VisionConfig {
            sim: sim_config(35.0, 0.0, 15.0),
            ..VisionConfig::default()
        };
        let mut vision = SimulatedVision::new(&config, FieldLayout::builtin().unwrap());
        let pose = Pose2d::new(2.0, 2.0, Rotation2d::new(PI));

        let mut measurements = Vec::new();
        for tick in 0..10 {
            vision.periodic(tick as f64 * 0.02);
            measurements.extend(vision.drain_measurements(pose));
        }
        assert!(!measurements.is_empty());
        for m in &measurements {
            assert_relative_eq!(m.pose.x(), 2.0, epsilon = 1e-6);
            assert_relative_eq!(m.pose.y(), 2.0, epsilon = 1e-6);
            assert!(m.timestamp <= 0.18);
        }

        let start = vision.best_start_pose().unwrap();
        assert_relative_eq!(start.x(), 2.0, epsilon = 1e-6);
        assert_relative_eq!(start.rotation.radians().abs(), PI, epsilon = 1e-6);
    }
}

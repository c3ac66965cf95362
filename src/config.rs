// Timeouts, topics, chassis geometry and tuning
use std::collections::HashSet;
use std::f64::consts::{FRAC_PI_2, PI};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::geometry::{RigidTransform, Rotation2d, Translation2d};
use crate::swerve::Modules;

// Runtime loop frequency
pub const LOOP_HZ: u64 = 50;
pub const TICK_PERIOD_S: f64 = 1.0 / LOOP_HZ as f64;

// Command timeout for watchdog
pub const CMD_TIMEOUT: Duration = Duration::from_millis(250);

// Ticks to wait after boot before zeroing the heading (gyro settling)
pub const HEADING_WARMUP_TICKS: u32 = 50;

// Ticks during which a vision start pose may seed the estimator
pub const START_POSE_WINDOW_TICKS: u64 = 150;

// Bus voltage used to turn feedforward volts into duty cycle
pub const NOMINAL_VOLTAGE: f64 = 12.0;

// Zenoh topics
pub const TOPIC_CMD_CHASSIS: &str = "swerve/cmd/chassis"; // commands
pub const TOPIC_HEALTH: &str = "swerve/state/health"; // health status
pub const TOPIC_POSE: &str = "swerve/state/pose"; // fused field pose
pub const TOPIC_TELEMETRY: &str = "swerve/telemetry"; // per-subsystem telemetry root
pub const TOPIC_MOTOR_PREFIX: &str = "swerve/hw/motor"; // <prefix>/<id>/cmd, <prefix>/<id>/state
pub const TOPIC_GYRO_STATE: &str = "swerve/hw/gyro/state";
pub const TOPIC_VISION_PREFIX: &str = "swerve/vision"; // <prefix>/<camera>/frames

// MAXSwerve bevel and spur stages around the drive pinion
const DRIVE_SPUR_TEETH: f64 = 22.0;
const DRIVE_BEVEL_GEAR: f64 = 45.0;
const DRIVE_BEVEL_PINION: f64 = 15.0;
const INCH: f64 = 0.0254;

/// Error types for configuration (all fatal at startup)
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Unsupported drive pinion: {0}T (expected 12, 13 or 14)")]
    UnsupportedPinion(u8),

    #[error("Motor id {id} is assigned more than once")]
    DuplicateMotorId { id: u8 },

    #[error("Invalid value for {name}: {value}")]
    InvalidParameter { name: &'static str, value: f64 },

    #[error("Invalid camera config: {0}")]
    InvalidCamera(String),

    #[error("Invalid field layout: {0}")]
    InvalidLayout(String),
}

/// Hardware identity and mounting of one module
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub drive_id: u8,
    pub steer_id: u8,
    /// Angle of the module's zero relative to the chassis (rad)
    pub chassis_offset: f64,
}

impl ModuleConfig {
    pub fn offset(&self) -> Rotation2d {
        Rotation2d::new(self.chassis_offset)
    }
}

/// Drive train shared by all four modules
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// 12T, 13T or 14T drive pinion
    pub pinion_teeth: u8,
    pub wheel_diameter: f64, // m
    pub motor_free_speed_rps: f64,
    // Feedforward gains (V, V/(m/s), V/(m/s^2))
    pub ks: f64,
    pub kv: f64,
    pub ka: f64,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            pinion_teeth: 14,
            wheel_diameter: 0.97 * 3.0 * INCH,
            motor_free_speed_rps: 5820.0 / 60.0,
            ks: 0.068841,
            kv: 2.4568,
            ka: 0.22524,
        }
    }
}

impl DriveConfig {
    /// Motor rotations per wheel rotation
    pub fn reduction(&self) -> f64 {
        (DRIVE_BEVEL_GEAR * DRIVE_SPUR_TEETH) / (self.pinion_teeth as f64 * DRIVE_BEVEL_PINION)
    }

    pub fn wheel_circumference(&self) -> f64 {
        self.wheel_diameter * PI
    }

    /// Free-speed wheel surface speed (m/s)
    pub fn max_wheel_speed(&self) -> f64 {
        (self.motor_free_speed_rps / self.reduction()) * self.wheel_circumference()
    }

    /// Meters of travel per drive motor rotation
    pub fn position_factor(&self) -> f64 {
        self.wheel_circumference() / self.reduction()
    }

    /// Meters per second per drive motor RPM
    pub fn velocity_factor(&self) -> f64 {
        self.position_factor() / 60.0
    }
}

/// Chassis geometry and module assignment, fixed for the process lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChassisConfig {
    /// Wheel center to wheel center, left to right (m)
    pub wheel_base_width: f64,
    /// Wheel center to wheel center, front to back (m)
    pub wheel_base_length: f64,
    pub modules: Modules<ModuleConfig>,
    pub drive: DriveConfig,
}

impl Default for ChassisConfig {
    fn default() -> Self {
        Self {
            wheel_base_width: 24.5 * INCH,
            wheel_base_length: 24.5 * INCH,
            modules: Modules::new(
                ModuleConfig { drive_id: 1, steer_id: 2, chassis_offset: FRAC_PI_2 },
                ModuleConfig { drive_id: 3, steer_id: 4, chassis_offset: 0.0 },
                ModuleConfig { drive_id: 5, steer_id: 6, chassis_offset: -PI },
                ModuleConfig { drive_id: 7, steer_id: 8, chassis_offset: -FRAC_PI_2 },
            ),
            drive: DriveConfig::default(),
        }
    }
}

impl ChassisConfig {
    /// Module centers relative to the chassis center, in kinematics order
    pub fn module_locations(&self) -> Modules<Translation2d> {
        let (hl, hw) = (self.wheel_base_length / 2.0, self.wheel_base_width / 2.0);
        Modules::new(
            Translation2d::new(hl, hw),
            Translation2d::new(hl, -hw),
            Translation2d::new(-hl, hw),
            Translation2d::new(-hl, -hw),
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("wheel_base_width", self.wheel_base_width),
            ("wheel_base_length", self.wheel_base_length),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::InvalidGeometry(format!("{} must be positive, got {}", name, value)));
            }
        }

        if !(12..=14).contains(&self.drive.pinion_teeth) {
            return Err(ConfigError::UnsupportedPinion(self.drive.pinion_teeth));
        }
        positive("drive.wheel_diameter", self.drive.wheel_diameter)?;
        positive("drive.motor_free_speed_rps", self.drive.motor_free_speed_rps)?;
        for (name, value) in [("drive.ks", self.drive.ks), ("drive.kv", self.drive.kv), ("drive.ka", self.drive.ka)] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::InvalidParameter { name, value });
            }
        }

        let mut seen = HashSet::new();
        for module in self.modules.iter() {
            if !module.chassis_offset.is_finite() {
                return Err(ConfigError::InvalidParameter {
                    name: "chassis_offset",
                    value: module.chassis_offset,
                });
            }
            for id in [module.drive_id, module.steer_id] {
                if !seen.insert(id) {
                    return Err(ConfigError::DuplicateMotorId { id });
                }
            }
        }
        Ok(())
    }
}

/// Pose estimator tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Trust in odometry (x m, y m, heading rad); lower = more trust
    pub state_std_devs: [f64; 3],
    /// Trust in vision (x m, y m, heading rad); lower = more trust
    pub vision_std_devs: [f64; 3],
    /// How far back vision measurements may reach (s)
    pub history_seconds: f64,
    /// Pose guess used until vision or an operator reseeds it
    pub initial_pose: [f64; 3],
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            state_std_devs: [0.1, 0.1, 0.1],
            vision_std_devs: [0.9, 0.9, 0.9],
            history_seconds: 1.5,
            initial_pose: [0.0, 0.0, 0.0],
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for value in self.state_std_devs.iter().chain(self.vision_std_devs.iter()) {
            if !(value.is_finite() && *value >= 0.0) {
                return Err(ConfigError::InvalidParameter { name: "std_devs", value: *value });
            }
        }
        positive("estimator.history_seconds", self.history_seconds)?;
        if self.initial_pose.iter().any(|v| !v.is_finite()) {
            return Err(ConfigError::InvalidParameter {
                name: "estimator.initial_pose",
                value: f64::NAN,
            });
        }
        Ok(())
    }
}

/// One camera mounted on the robot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub name: String,
    pub robot_to_camera: RigidTransform,
}

/// Parameters for the simulated camera world
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimCameraConfig {
    pub width: u32,
    pub height: u32,
    /// Diagonal field of view (deg)
    pub fov_deg: f64,
    pub fps: f64,
    pub avg_latency_ms: f64,
    pub latency_std_dev_ms: f64,
    /// Tags further than this are never rendered (m)
    pub max_range: f64,
    pub seed: u64,
}

impl Default for SimCameraConfig {
    fn default() -> Self {
        Self {
            width: 960,
            height: 720,
            fov_deg: 90.0,
            fps: 15.0,
            avg_latency_ms: 35.0,
            latency_std_dev_ms: 5.0,
            max_range: 8.0,
            seed: 2025,
        }
    }
}

/// Vision provider configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub cameras: Vec<CameraConfig>,
    /// Maximum acceptable pose ambiguity; negative values are invalid
    pub max_ambiguity: f64,
    /// Maximum straight-line camera to tag distance (m)
    pub max_distance: f64,
    /// Field layout JSON; the built-in layout is used when absent
    pub field_layout: Option<String>,
    pub sim: SimCameraConfig,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            cameras: vec![
                CameraConfig {
                    name: "front".to_string(),
                    robot_to_camera: RigidTransform { x: 0.30, y: 0.0, z: 0.25, ..Default::default() },
                },
                CameraConfig {
                    name: "rear".to_string(),
                    robot_to_camera: RigidTransform { x: -0.30, y: 0.0, z: 0.25, yaw: PI, ..Default::default() },
                },
            ],
            max_ambiguity: 0.2,
            max_distance: 4.0,
            field_layout: None,
            sim: SimCameraConfig::default(),
        }
    }
}

impl VisionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("vision.max_distance", self.max_distance)?;
        if !(self.max_ambiguity.is_finite() && self.max_ambiguity >= 0.0) {
            return Err(ConfigError::InvalidParameter {
                name: "vision.max_ambiguity",
                value: self.max_ambiguity,
            });
        }
        let mut names = HashSet::new();
        for camera in &self.cameras {
            if camera.name.is_empty() || camera.name.contains(['/', '*', '$', '?', '#']) {
                return Err(ConfigError::InvalidCamera(format!("bad camera name {:?}", camera.name)));
            }
            if !names.insert(camera.name.as_str()) {
                return Err(ConfigError::InvalidCamera(format!("duplicate camera {:?}", camera.name)));
            }
        }
        positive("vision.sim.fov_deg", self.sim.fov_deg)?;
        positive("vision.sim.fps", self.sim.fps)?;
        if self.sim.width == 0 || self.sim.height == 0 {
            return Err(ConfigError::InvalidCamera("sim resolution must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Everything the runtime needs, loadable from one JSON file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Use simulated modules, gyro and cameras instead of the hardware bridge
    pub simulate: bool,
    pub chassis: ChassisConfig,
    pub estimator: EstimatorConfig,
    pub vision: VisionConfig,
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: RuntimeConfig = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.chassis.validate()?;
        self.estimator.validate()?;
        self.vision.validate()
    }
}

fn positive(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidParameter { name, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_default_config_is_valid() {
        RuntimeConfig::default().validate().unwrap();
    }

    #[test]
    fn test_max_wheel_speed_for_14t_pinion() {
        let drive = DriveConfig::default();
        assert_relative_eq!(drive.reduction(), 990.0 / 210.0, epsilon = 1e-12);
        // About 4.8 m/s with a NEO Vortex free speed
        assert!((4.7..4.9).contains(&drive.max_wheel_speed()));
        assert_relative_eq!(drive.velocity_factor() * 60.0, drive.position_factor(), epsilon = 1e-12);
    }

    #[test]
    fn test_duplicate_motor_id_rejected() {
        let mut config = ChassisConfig::default();
        config.modules.back_right.steer_id = config.modules.front_left.drive_id;
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateMotorId { id: 1 })));
    }

    #[test]
    fn test_bad_geometry_rejected() {
        let mut config = ChassisConfig::default();
        config.wheel_base_width = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidGeometry(_))));
    }

    #[test]
    fn test_unsupported_pinion_rejected() {
        let mut config = ChassisConfig::default();
        config.drive.pinion_teeth = 16;
        assert!(matches!(config.validate(), Err(ConfigError::UnsupportedPinion(16))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{ "simulate": true, "vision": { "max_distance": 3.0 } }"#).unwrap();
        assert!(config.simulate);
        assert_relative_eq!(config.vision.max_distance, 3.0);
        assert_eq!(config.vision.cameras.len(), 2);
        assert_eq!(config.chassis, ChassisConfig::default());
    }

    #[test]
    fn test_module_locations_quadrants() {
        let locations = ChassisConfig::default().module_locations();
        assert!(locations.front_left.x > 0.0 && locations.front_left.y > 0.0);
        assert!(locations.front_right.x > 0.0 && locations.front_right.y < 0.0);
        assert!(locations.back_left.x < 0.0 && locations.back_left.y > 0.0);
        assert!(locations.back_right.x < 0.0 && locations.back_right.y < 0.0);
    }

    #[test]
    fn test_duplicate_camera_rejected() {
        let mut config = VisionConfig::default();
        config.cameras[1].name = "front".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidCamera(_))));
    }
}

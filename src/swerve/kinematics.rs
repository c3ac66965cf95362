// Swerve kinematics for a four-module chassis
// Converts robot-relative chassis speeds (vx, vy, omega) to per-module
// (speed, heading) vectors and back.

use std::f64::consts::{FRAC_PI_2, PI};

use nalgebra::{SMatrix, SVector};

use super::Modules;
use crate::config::ConfigError;
use crate::geometry::{Rotation2d, Translation2d, Twist2d};

/// Singular values below this are treated as zero in the least-squares solve
const PSEUDO_INVERSE_EPS: f64 = 1e-9;

/// Robot-relative chassis velocity
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChassisSpeeds {
    pub vx: f64,    // m/s, positive = forward
    pub vy: f64,    // m/s, positive = left
    pub omega: f64, // rad/s, positive = counter-clockwise
}

impl ChassisSpeeds {
    pub fn new(vx: f64, vy: f64, omega: f64) -> Self {
        Self { vx, vy, omega }
    }

    /// Convert field-relative speeds into the robot frame
    pub fn from_field_relative(field: ChassisSpeeds, robot_heading: Rotation2d) -> Self {
        let v = Translation2d::new(field.vx, field.vy).rotate_by(-robot_heading);
        Self::new(v.x, v.y, field.omega)
    }

    pub fn is_zero(&self) -> bool {
        self.vx == 0.0 && self.vy == 0.0 && self.omega == 0.0
    }

    pub fn is_finite(&self) -> bool {
        self.vx.is_finite() && self.vy.is_finite() && self.omega.is_finite()
    }
}

/// Instantaneous wheel vector
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ModuleState {
    pub speed: f64, // m/s
    pub angle: Rotation2d,
}

impl ModuleState {
    pub fn new(speed: f64, angle: Rotation2d) -> Self {
        Self { speed, angle }
    }

    /// Re-express this state within 90 degrees of `current`, flipping the
    /// speed sign when the heading is turned around. The physical wheel
    /// vector is unchanged.
    pub fn optimize(&self, current: Rotation2d) -> Self {
        let delta = self.angle - current;
        if delta.radians().abs() > FRAC_PI_2 {
            Self {
                speed: -self.speed,
                angle: self.angle + Rotation2d::new(PI),
            }
        } else {
            *self
        }
    }

    /// Scale speed by the cosine of the steering error so the wheel does not
    /// push sideways while it is still turning
    pub fn cosine_scale(&self, current: Rotation2d) -> Self {
        Self {
            speed: self.speed * (self.angle - current).cos(),
            angle: self.angle,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.speed.is_finite() && self.angle.radians().is_finite()
    }
}

/// Odometry accumulator of one module; distance is not wrapped
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ModulePosition {
    pub distance: f64, // m
    pub angle: Rotation2d,
}

impl ModulePosition {
    pub fn new(distance: f64, angle: Rotation2d) -> Self {
        Self { distance, angle }
    }

    pub fn is_finite(&self) -> bool {
        self.distance.is_finite() && self.angle.radians().is_finite()
    }
}

/// Kinematics over fixed module locations (meters from the chassis center)
#[derive(Debug, Clone)]
pub struct SwerveKinematics {
    locations: Modules<Translation2d>,
    // Least-squares solve of the 8x3 inverse kinematics matrix
    forward: SMatrix<f64, 3, 8>,
    // Last commanded headings, reused when the chassis is asked to stop
    module_headings: Modules<Rotation2d>,
}

impl SwerveKinematics {
    pub fn new(locations: Modules<Translation2d>) -> Result<Self, ConfigError> {
        let mut inverse = SMatrix::<f64, 8, 3>::zeros();
        for (i, loc) in locations.iter().enumerate() {
            if !(loc.x.is_finite() && loc.y.is_finite()) {
                return Err(ConfigError::InvalidGeometry(format!(
                    "module location {:?} is not finite",
                    loc
                )));
            }
            // vx_i = vx - omega * y_i
            inverse[(2 * i, 0)] = 1.0;
            inverse[(2 * i, 2)] = -loc.y;
            // vy_i = vy + omega * x_i
            inverse[(2 * i + 1, 1)] = 1.0;
            inverse[(2 * i + 1, 2)] = loc.x;
        }

        if inverse.rank(PSEUDO_INVERSE_EPS) < 3 {
            return Err(ConfigError::InvalidGeometry(
                "module locations must not all coincide".to_string(),
            ));
        }

        let forward = inverse
            .pseudo_inverse(PSEUDO_INVERSE_EPS)
            .map_err(|e| ConfigError::InvalidGeometry(e.to_string()))?;

        Ok(Self {
            locations,
            forward,
            module_headings: Modules::default(),
        })
    }

    /// Rectangular chassis with the given wheel-center spacing
    pub fn rectangular(length: f64, width: f64) -> Result<Self, ConfigError> {
        let (hl, hw) = (length / 2.0, width / 2.0);
        Self::new(Modules::new(
            Translation2d::new(hl, hw),
            Translation2d::new(hl, -hw),
            Translation2d::new(-hl, hw),
            Translation2d::new(-hl, -hw),
        ))
    }

    pub fn locations(&self) -> &Modules<Translation2d> {
        &self.locations
    }

    /// Inverse kinematics: chassis speeds -> module states.
    ///
    /// A zero request keeps each module at its previous heading instead of
    /// snapping the wheels back to 0 rad.
    pub fn to_module_states(&mut self, speeds: ChassisSpeeds) -> Modules<ModuleState> {
        if speeds.is_zero() {
            return self.module_headings.map(|&angle| ModuleState::new(0.0, angle));
        }

        let states = self.locations.map(|loc| {
            let vx = speeds.vx - speeds.omega * loc.y;
            let vy = speeds.vy + speeds.omega * loc.x;
            ModuleState::new(vx.hypot(vy), Rotation2d::from_vector(vx, vy))
        });
        self.module_headings = states.map(|s| s.angle);
        states
    }

    /// Forward kinematics: module states -> chassis speeds (least squares)
    pub fn to_chassis_speeds(&self, states: &Modules<ModuleState>) -> ChassisSpeeds {
        let solved = self.solve(states.map(|s| (s.speed, s.angle)));
        ChassisSpeeds::new(solved[0], solved[1], solved[2])
    }

    /// Odometry twist between two sets of module positions
    pub fn to_twist(&self, start: &Modules<ModulePosition>, end: &Modules<ModulePosition>) -> Twist2d {
        let mut deltas = end.map(|p| (p.distance, p.angle));
        for (delta, from) in deltas.iter_mut().zip(start.iter()) {
            delta.0 -= from.distance;
        }
        let solved = self.solve(deltas);
        Twist2d::new(solved[0], solved[1], solved[2])
    }

    fn solve(&self, vectors: Modules<(f64, Rotation2d)>) -> SVector<f64, 3> {
        let mut b = SVector::<f64, 8>::zeros();
        for (i, (magnitude, angle)) in vectors.iter().enumerate() {
            b[2 * i] = magnitude * angle.cos();
            b[2 * i + 1] = magnitude * angle.sin();
        }
        self.forward * b
    }
}

/// Scale all module speeds uniformly so none exceeds `max_speed`.
///
/// Speeds are only ever scaled down, and every module shares the same ratio
/// so the motion keeps its shape.
pub fn desaturate_wheel_speeds(states: &mut Modules<ModuleState>, max_speed: f64) {
    let real_max = states.iter().map(|s| s.speed.abs()).fold(0.0, f64::max);
    if max_speed > 0.0 && real_max > max_speed {
        let scale = max_speed / real_max;
        for state in states.iter_mut() {
            state.speed *= scale;
        }
    }
}

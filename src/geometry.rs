// Planar geometry for the field and chassis frames, plus 3D rigid transforms
// for camera mounts and landmark poses.
//
// Conventions: +x forward, +y left, angles counter-clockwise positive,
// headings wrapped to [-pi, pi].

use std::f64::consts::PI;
use std::ops::{Add, Mul, Neg, Sub};

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Below this, series expansions replace sin(x)/x style terms
const SMALL_ANGLE: f64 = 1e-9;

/// Wrap an angle in radians to [-pi, pi]
pub fn wrap_angle(radians: f64) -> f64 {
    if radians.is_finite() && (-PI..=PI).contains(&radians) {
        return radians;
    }
    radians.sin().atan2(radians.cos())
}

/// Heading in the plane, always stored wrapped
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rotation2d {
    radians: f64,
}

impl Rotation2d {
    pub const ZERO: Self = Self { radians: 0.0 };

    pub fn new(radians: f64) -> Self {
        Self {
            radians: wrap_angle(radians),
        }
    }

    pub fn from_degrees(degrees: f64) -> Self {
        Self::new(degrees.to_radians())
    }

    /// Heading of the vector (x, y); zero for the zero vector
    pub fn from_vector(x: f64, y: f64) -> Self {
        if x.hypot(y) < SMALL_ANGLE {
            return Self::ZERO;
        }
        Self::new(y.atan2(x))
    }

    pub fn radians(&self) -> f64 {
        self.radians
    }

    pub fn degrees(&self) -> f64 {
        self.radians.to_degrees()
    }

    pub fn cos(&self) -> f64 {
        self.radians.cos()
    }

    pub fn sin(&self) -> f64 {
        self.radians.sin()
    }

    pub fn rotate_by(&self, other: Rotation2d) -> Self {
        Self::new(self.radians + other.radians)
    }
}

impl Add for Rotation2d {
    type Output = Rotation2d;

    fn add(self, rhs: Rotation2d) -> Rotation2d {
        self.rotate_by(rhs)
    }
}

impl Sub for Rotation2d {
    type Output = Rotation2d;

    fn sub(self, rhs: Rotation2d) -> Rotation2d {
        Rotation2d::new(self.radians - rhs.radians)
    }
}

impl Neg for Rotation2d {
    type Output = Rotation2d;

    fn neg(self) -> Rotation2d {
        Rotation2d::new(-self.radians)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Translation2d {
    pub x: f64,
    pub y: f64,
}

impl Translation2d {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn norm(&self) -> f64 {
        self.x.hypot(self.y)
    }

    pub fn distance(&self, other: Translation2d) -> f64 {
        (*self - other).norm()
    }

    pub fn angle(&self) -> Rotation2d {
        Rotation2d::from_vector(self.x, self.y)
    }

    pub fn rotate_by(&self, rotation: Rotation2d) -> Self {
        let (sin, cos) = (rotation.sin(), rotation.cos());
        Self {
            x: self.x * cos - self.y * sin,
            y: self.x * sin + self.y * cos,
        }
    }
}

impl Add for Translation2d {
    type Output = Translation2d;

    fn add(self, rhs: Translation2d) -> Translation2d {
        Translation2d::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Translation2d {
    type Output = Translation2d;

    fn sub(self, rhs: Translation2d) -> Translation2d {
        Translation2d::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Neg for Translation2d {
    type Output = Translation2d;

    fn neg(self) -> Translation2d {
        Translation2d::new(-self.x, -self.y)
    }
}

impl Mul<f64> for Translation2d {
    type Output = Translation2d;

    fn mul(self, scalar: f64) -> Translation2d {
        Translation2d::new(self.x * scalar, self.y * scalar)
    }
}

/// Rigid offset expressed in the frame of the starting pose
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Transform2d {
    pub translation: Translation2d,
    pub rotation: Rotation2d,
}

impl Transform2d {
    pub fn new(translation: Translation2d, rotation: Rotation2d) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    /// Transform that maps `initial` onto `last`
    pub fn between(initial: Pose2d, last: Pose2d) -> Self {
        Self {
            translation: (last.translation - initial.translation).rotate_by(-initial.rotation),
            rotation: last.rotation - initial.rotation,
        }
    }

    pub fn inverse(&self) -> Self {
        Self {
            translation: (-self.translation).rotate_by(-self.rotation),
            rotation: -self.rotation,
        }
    }
}

/// Constant-curvature motion increment (dx, dy in the starting frame)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Twist2d {
    pub dx: f64,
    pub dy: f64,
    pub dtheta: f64,
}

impl Twist2d {
    pub fn new(dx: f64, dy: f64, dtheta: f64) -> Self {
        Self { dx, dy, dtheta }
    }
}

impl Mul<f64> for Twist2d {
    type Output = Twist2d;

    fn mul(self, scalar: f64) -> Twist2d {
        Twist2d::new(self.dx * scalar, self.dy * scalar, self.dtheta * scalar)
    }
}

/// Field-relative position and heading
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Pose2d {
    pub translation: Translation2d,
    pub rotation: Rotation2d,
}

impl Pose2d {
    pub fn new(x: f64, y: f64, rotation: Rotation2d) -> Self {
        Self {
            translation: Translation2d::new(x, y),
            rotation,
        }
    }

    pub fn from_parts(translation: Translation2d, rotation: Rotation2d) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    pub fn x(&self) -> f64 {
        self.translation.x
    }

    pub fn y(&self) -> f64 {
        self.translation.y
    }

    pub fn heading(&self) -> Rotation2d {
        self.rotation
    }

    pub fn is_finite(&self) -> bool {
        self.translation.x.is_finite()
            && self.translation.y.is_finite()
            && self.rotation.radians().is_finite()
    }

    pub fn transform_by(&self, transform: Transform2d) -> Pose2d {
        Pose2d {
            translation: self.translation + transform.translation.rotate_by(self.rotation),
            rotation: self.rotation + transform.rotation,
        }
    }

    /// This pose expressed in the frame of `other`
    pub fn relative_to(&self, other: Pose2d) -> Pose2d {
        let t = Transform2d::between(other, *self);
        Pose2d::from_parts(t.translation, t.rotation)
    }

    /// Apply a constant-curvature twist starting from this pose
    pub fn exp(&self, twist: Twist2d) -> Pose2d {
        let Twist2d { dx, dy, dtheta } = twist;
        let (sin_theta, cos_theta) = (dtheta.sin(), dtheta.cos());

        let (s, c) = if dtheta.abs() < SMALL_ANGLE {
            (1.0 - dtheta * dtheta / 6.0, 0.5 * dtheta)
        } else {
            (sin_theta / dtheta, (1.0 - cos_theta) / dtheta)
        };

        let transform = Transform2d::new(
            Translation2d::new(dx * s - dy * c, dx * c + dy * s),
            Rotation2d::from_vector(cos_theta, sin_theta),
        );
        self.transform_by(transform)
    }

    /// Twist that carries this pose onto `end`
    pub fn log(&self, end: Pose2d) -> Twist2d {
        let transform = end.relative_to(*self);
        let dtheta = transform.rotation.radians();
        let half_dtheta = dtheta / 2.0;
        let cos_minus_one = dtheta.cos() - 1.0;

        let half_theta_by_tan = if cos_minus_one.abs() < SMALL_ANGLE {
            1.0 - dtheta * dtheta / 12.0
        } else {
            -(half_dtheta * dtheta.sin()) / cos_minus_one
        };

        let translation = transform
            .translation
            .rotate_by(Rotation2d::from_vector(half_theta_by_tan, -half_dtheta))
            * half_theta_by_tan.hypot(half_dtheta);

        Twist2d::new(translation.x, translation.y, dtheta)
    }

    /// Interpolate along the twist between two poses, t clamped to [0, 1]
    pub fn interpolate(&self, end: Pose2d, t: f64) -> Pose2d {
        if t <= 0.0 {
            *self
        } else if t >= 1.0 {
            end
        } else {
            self.exp(self.log(end) * t)
        }
    }
}

impl Add<Transform2d> for Pose2d {
    type Output = Pose2d;

    fn add(self, rhs: Transform2d) -> Pose2d {
        self.transform_by(rhs)
    }
}

impl Sub for Pose2d {
    type Output = Transform2d;

    fn sub(self, rhs: Pose2d) -> Transform2d {
        Transform2d::between(rhs, self)
    }
}

/// 3D rigid transform as written in config files: meters and radians
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RigidTransform {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub z: f64,
    #[serde(default)]
    pub roll: f64,
    #[serde(default)]
    pub pitch: f64,
    #[serde(default)]
    pub yaw: f64,
}

impl RigidTransform {
    pub fn to_isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::new(self.x, self.y, self.z),
            UnitQuaternion::from_euler_angles(self.roll, self.pitch, self.yaw),
        )
    }

    pub fn from_isometry(iso: &Isometry3<f64>) -> Self {
        let (roll, pitch, yaw) = iso.rotation.euler_angles();
        let t = iso.translation.vector;
        Self {
            x: t.x,
            y: t.y,
            z: t.z,
            roll,
            pitch,
            yaw,
        }
    }

    pub fn distance(&self) -> f64 {
        Vector3::new(self.x, self.y, self.z).norm()
    }
}

/// Lift a planar pose onto the floor plane
pub fn pose2d_to_isometry(pose: Pose2d) -> Isometry3<f64> {
    Isometry3::from_parts(
        Translation3::new(pose.x(), pose.y(), 0.0),
        UnitQuaternion::from_euler_angles(0.0, 0.0, pose.rotation.radians()),
    )
}

/// Project a 3D pose onto the floor plane, keeping yaw
pub fn isometry_to_pose2d(iso: &Isometry3<f64>) -> Pose2d {
    let (_, _, yaw) = iso.rotation.euler_angles();
    let t = iso.translation.vector;
    Pose2d::new(t.x, t.y, Rotation2d::new(yaw))
}

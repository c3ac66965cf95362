// Swerve drive core for a four-module chassis
//
// Provides:
// - Swerve kinematics (chassis speeds <-> module states, odometry twists)
// - Per-wheel actuation with heading optimization
// - Whole-chassis coordination and heading tracking

pub mod chassis;
pub mod kinematics;
pub mod module;

use serde::{Deserialize, Serialize};

pub use chassis::{ChassisCoordinator, ChassisHardware, HeadingSource, SimGyro};
pub use kinematics::{ChassisSpeeds, ModulePosition, ModuleState, SwerveKinematics, desaturate_wheel_speeds};
pub use module::{ModuleIo, SwerveModule};

/// Module names in kinematics order
pub const MODULE_NAMES: [&str; 4] = ["front_left", "front_right", "back_left", "back_right"];

/// One value per swerve module, keyed by corner.
///
/// Iteration order is front-left, front-right, back-left, back-right. The
/// kinematics matrix is built in this same order, so every array handed to
/// or returned from it must come from here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Modules<T> {
    pub front_left: T,
    pub front_right: T,
    pub back_left: T,
    pub back_right: T,
}

impl<T> Modules<T> {
    pub fn new(front_left: T, front_right: T, back_left: T, back_right: T) -> Self {
        Self {
            front_left,
            front_right,
            back_left,
            back_right,
        }
    }

    pub fn from_array([front_left, front_right, back_left, back_right]: [T; 4]) -> Self {
        Self::new(front_left, front_right, back_left, back_right)
    }

    pub fn into_array(self) -> [T; 4] {
        [self.front_left, self.front_right, self.back_left, self.back_right]
    }

    pub fn as_array(&self) -> [&T; 4] {
        [&self.front_left, &self.front_right, &self.back_left, &self.back_right]
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.as_array().into_iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        [
            &mut self.front_left,
            &mut self.front_right,
            &mut self.back_left,
            &mut self.back_right,
        ]
        .into_iter()
    }

    /// Iterate together with the module name
    pub fn named(&self) -> impl Iterator<Item = (&'static str, &T)> {
        MODULE_NAMES.into_iter().zip(self.iter())
    }

    pub fn map<U>(&self, mut f: impl FnMut(&T) -> U) -> Modules<U> {
        Modules {
            front_left: f(&self.front_left),
            front_right: f(&self.front_right),
            back_left: f(&self.back_left),
            back_right: f(&self.back_right),
        }
    }
}

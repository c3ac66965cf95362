// One MAXSwerve-style module: a drive motor and a steer motor with an
// absolute encoder, mounted at a fixed angle to the chassis.

use std::f64::consts::{FRAC_PI_4, TAU};

use tracing::{debug, warn};

use super::kinematics::{ModulePosition, ModuleState};
use crate::config::{DriveConfig, ModuleConfig, NOMINAL_VOLTAGE, TICK_PERIOD_S};
use crate::geometry::Rotation2d;
use crate::motor::{Motor, SimpleMotorFeedforward};

/// Where a module's sensor readings come from, chosen once at construction
pub enum ModuleIo {
    Real {
        drive: Box<dyn Motor>,
        /// Position is the absolute steer encoder, rotations in [0, 1)
        steer: Box<dyn Motor>,
    },
    /// Reports the last commanded state; distance is integrated per tick
    Simulated { distance: f64 },
}

impl ModuleIo {
    pub fn real(drive: impl Motor + 'static, steer: impl Motor + 'static) -> Self {
        ModuleIo::Real {
            drive: Box::new(drive),
            steer: Box::new(steer),
        }
    }

    pub fn simulated() -> Self {
        ModuleIo::Simulated { distance: 0.0 }
    }

    pub fn is_simulated(&self) -> bool {
        matches!(self, ModuleIo::Simulated { .. })
    }
}

pub struct SwerveModule {
    name: &'static str,
    chassis_offset: Rotation2d,
    drive_config: DriveConfig,
    feedforward: SimpleMotorFeedforward,
    io: ModuleIo,
    target_state: ModuleState,
    // Raw drive rotations treated as zero distance
    drive_zero: f64,
}

impl SwerveModule {
    pub fn new(name: &'static str, config: &ModuleConfig, drive: &DriveConfig, io: ModuleIo) -> Self {
        debug!(
            "Module {}: drive {} steer {} offset {:.3} rad (simulated: {})",
            name,
            config.drive_id,
            config.steer_id,
            config.chassis_offset,
            io.is_simulated()
        );
        Self {
            name,
            chassis_offset: config.offset(),
            drive_config: *drive,
            feedforward: SimpleMotorFeedforward::new(drive.ks, drive.kv, drive.ka),
            io,
            target_state: ModuleState::default(),
            drive_zero: 0.0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Steer heading in the chassis frame
    pub fn corrected_steer(&self) -> Rotation2d {
        match &self.io {
            ModuleIo::Real { steer, .. } => Rotation2d::new(steer.position() * TAU) + self.chassis_offset,
            ModuleIo::Simulated { .. } => self.target_state.angle,
        }
    }

    /// Measured (speed, heading)
    pub fn state(&self) -> ModuleState {
        match &self.io {
            ModuleIo::Real { drive, .. } => ModuleState::new(
                drive.velocity() * self.drive_config.velocity_factor(),
                self.corrected_steer(),
            ),
            ModuleIo::Simulated { .. } => self.target_state,
        }
    }

    /// Wheel distance since the last encoder reset, with heading
    pub fn position(&self) -> ModulePosition {
        let distance = match &self.io {
            ModuleIo::Real { drive, .. } => (drive.position() - self.drive_zero) * self.drive_config.position_factor(),
            ModuleIo::Simulated { distance } => *distance,
        };
        ModulePosition::new(distance, self.corrected_steer())
    }

    pub fn target_state(&self) -> ModuleState {
        self.target_state
    }

    pub fn heading_error(&self) -> Rotation2d {
        self.target_state.angle - self.corrected_steer()
    }

    /// Command the wheel vector.
    ///
    /// With `optimize_heading` the steer never turns more than 90 degrees;
    /// the drive speed is then scaled by the cosine of the remaining steer
    /// error. Open loop drive applies the feedforward voltage directly.
    pub fn set_target_state(&mut self, desired: ModuleState, closed_loop_drive: bool, optimize_heading: bool) {
        if !desired.is_finite() {
            warn!("Module {}: ignoring non-finite target {:?}", self.name, desired);
            return;
        }

        let current = self.corrected_steer();
        let mut state = if optimize_heading { desired.optimize(current) } else { desired };
        state = state.cosine_scale(current);

        let feedforward = self.feedforward.calculate(state.speed);
        let steer_rotations = steer_setpoint(state.angle - self.chassis_offset);
        let velocity_factor = self.drive_config.velocity_factor();

        match &mut self.io {
            ModuleIo::Real { drive, steer } => {
                if closed_loop_drive {
                    drive.set_velocity_with_feedforward(state.speed / velocity_factor, feedforward);
                } else {
                    drive.set_duty_cycle(volts_to_duty(feedforward));
                }
                steer.set_position(steer_rotations);
            }
            ModuleIo::Simulated { distance } => {
                *distance += state.speed * TICK_PERIOD_S;
            }
        }

        self.target_state = state;
    }

    /// Brake preset: wheels form an X
    pub fn set_x(&mut self) {
        let angle = Rotation2d::new(FRAC_PI_4) + self.chassis_offset;
        self.set_target_state(ModuleState::new(0.0, angle), false, true);
    }

    /// Wheels tangent to a circle, used for rotational characterization
    pub fn set_o(&mut self) {
        let angle = Rotation2d::new(3.0 * FRAC_PI_4) + self.chassis_offset;
        self.set_target_state(ModuleState::new(0.0, angle), false, true);
    }

    /// Zero the wheel distance used for odometry
    pub fn reset_encoder(&mut self) {
        match &mut self.io {
            ModuleIo::Real { drive, .. } => self.drive_zero = drive.position(),
            ModuleIo::Simulated { distance } => *distance = 0.0,
        }
    }

    /// Raw open-loop drive voltage, for characterization
    pub fn set_raw_drive_voltage(&mut self, volts: f64) {
        if let ModuleIo::Real { drive, .. } = &mut self.io {
            drive.set_duty_cycle(volts_to_duty(volts));
        }
    }

    pub fn drive_current(&self) -> f64 {
        match &self.io {
            ModuleIo::Real { drive, .. } => drive.current(),
            ModuleIo::Simulated { .. } => 0.0,
        }
    }
}

/// Absolute encoder rotations in [0, 1) for a heading
fn steer_setpoint(angle: Rotation2d) -> f64 {
    let rotations = angle.radians().rem_euclid(TAU) / TAU;
    if rotations >= 1.0 { 0.0 } else { rotations }
}

fn volts_to_duty(volts: f64) -> f64 {
    (volts / NOMINAL_VOLTAGE).clamp(-1.0, 1.0)
}

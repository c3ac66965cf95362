// Whole-chassis coordination: kinematics, desaturation and heading
//
// Module order is the quadrant order used to build the kinematics:
// BL        FL
//       C
// BR        FR

use tracing::{debug, info, warn};

use super::kinematics::{ChassisSpeeds, ModulePosition, ModuleState, SwerveKinematics, desaturate_wheel_speeds};
use super::module::{ModuleIo, SwerveModule};
use super::{MODULE_NAMES, Modules};
use crate::config::{ChassisConfig, ConfigError, TICK_PERIOD_S};
use crate::geometry::Rotation2d;
use crate::motor::{Gyro, HardwareBridge};
use crate::telemetry::Table;

/// Integrating heading for simulation.
///
/// Commands stage the next heading; the scheduler applies it once per tick
/// so every reader in a tick sees the same value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SimGyro {
    next_heading: f64,
    current_heading: f64,
}

impl SimGyro {
    pub fn reset(&mut self) {
        self.set_next_heading(0.0);
        self.apply_next_heading();
    }

    pub fn set_next_heading(&mut self, radians: f64) {
        self.next_heading = radians;
    }

    pub fn apply_next_heading(&mut self) {
        self.current_heading = self.next_heading;
    }

    pub fn next_heading(&self) -> f64 {
        self.next_heading
    }

    pub fn current_heading(&self) -> f64 {
        self.current_heading
    }
}

/// Heading source, chosen once at construction
pub enum HeadingSource {
    Real(Box<dyn Gyro>),
    Simulated(SimGyro),
}

/// Sensor and actuator sources for the four modules and the heading
pub struct ChassisHardware {
    pub modules: Modules<ModuleIo>,
    pub heading: HeadingSource,
}

impl ChassisHardware {
    pub fn simulated() -> Self {
        Self {
            modules: Modules::new(
                ModuleIo::simulated(),
                ModuleIo::simulated(),
                ModuleIo::simulated(),
                ModuleIo::simulated(),
            ),
            heading: HeadingSource::Simulated(SimGyro::default()),
        }
    }

    /// Motors and gyro owned by a remote hardware process
    pub fn bridged(config: &ChassisConfig, bridge: &HardwareBridge) -> Self {
        Self {
            modules: config
                .modules
                .map(|m| ModuleIo::real(bridge.motor(m.drive_id), bridge.motor(m.steer_id))),
            heading: HeadingSource::Real(Box::new(bridge.gyro())),
        }
    }
}

pub struct ChassisCoordinator {
    modules: Modules<SwerveModule>,
    kinematics: SwerveKinematics,
    heading: HeadingSource,
    max_wheel_speed: f64,
    // Last robot-relative request and the desaturated states derived from it
    requested_speeds: ChassisSpeeds,
    desired_states: Modules<ModuleState>,
}

impl ChassisCoordinator {
    pub fn new(config: &ChassisConfig, hardware: ChassisHardware) -> Result<Self, ConfigError> {
        config.validate()?;
        let kinematics = SwerveKinematics::new(config.module_locations())?;

        let [fl, fr, bl, br] = hardware.modules.into_array();
        let [n_fl, n_fr, n_bl, n_br] = MODULE_NAMES;
        let cfg = &config.modules;
        let modules = Modules::new(
            SwerveModule::new(n_fl, &cfg.front_left, &config.drive, fl),
            SwerveModule::new(n_fr, &cfg.front_right, &config.drive, fr),
            SwerveModule::new(n_bl, &cfg.back_left, &config.drive, bl),
            SwerveModule::new(n_br, &cfg.back_right, &config.drive, br),
        );

        let max_wheel_speed = config.drive.max_wheel_speed();
        info!(
            "Chassis ready: {:.3} x {:.3} m, max wheel speed {:.2} m/s, {} heading",
            config.wheel_base_length,
            config.wheel_base_width,
            max_wheel_speed,
            match hardware.heading {
                HeadingSource::Real(_) => "gyro",
                HeadingSource::Simulated(_) => "simulated",
            }
        );

        Ok(Self {
            modules,
            kinematics,
            heading: hardware.heading,
            max_wheel_speed,
            requested_speeds: ChassisSpeeds::default(),
            desired_states: Modules::default(),
        })
    }

    /// Drive with robot-relative speeds
    pub fn set_chassis_speeds(&mut self, speeds: ChassisSpeeds) {
        if !speeds.is_finite() {
            warn!("Ignoring non-finite chassis speeds {:?}", speeds);
            return;
        }

        let mut states = self.kinematics.to_module_states(speeds);
        desaturate_wheel_speeds(&mut states, self.max_wheel_speed);

        for (module, state) in self.modules.iter_mut().zip(states.iter()) {
            module.set_target_state(*state, true, true);
        }
        self.requested_speeds = speeds;
        self.desired_states = states;

        if let HeadingSource::Simulated(gyro) = &mut self.heading {
            gyro.set_next_heading(gyro.next_heading() + speeds.omega * TICK_PERIOD_S);
        }
    }

    /// Drive with field-relative speeds, rotated by the current heading
    pub fn drive_field_relative(&mut self, field_speeds: ChassisSpeeds) {
        let speeds = ChassisSpeeds::from_field_relative(field_speeds, self.heading());
        self.set_chassis_speeds(speeds);
    }

    pub fn stop(&mut self) {
        self.set_chassis_speeds(ChassisSpeeds::default());
    }

    pub fn module_states(&self) -> Modules<ModuleState> {
        self.modules.map(|m| m.state())
    }

    pub fn module_positions(&self) -> Modules<ModulePosition> {
        self.modules.map(|m| m.position())
    }

    pub fn desired_states(&self) -> Modules<ModuleState> {
        self.desired_states
    }

    pub fn requested_speeds(&self) -> ChassisSpeeds {
        self.requested_speeds
    }

    /// Measured robot-relative speeds
    pub fn chassis_speeds(&self) -> ChassisSpeeds {
        self.kinematics.to_chassis_speeds(&self.module_states())
    }

    pub fn heading(&self) -> Rotation2d {
        match &self.heading {
            HeadingSource::Real(gyro) => gyro.rotation(),
            HeadingSource::Simulated(gyro) => Rotation2d::new(gyro.current_heading()),
        }
    }

    pub fn zero_heading(&mut self) {
        info!("Zeroing heading");
        match &mut self.heading {
            HeadingSource::Real(gyro) => gyro.reset(),
            HeadingSource::Simulated(gyro) => gyro.reset(),
        }
    }

    /// Stage the simulated heading; no effect on a real gyro
    pub fn set_next_sim_heading(&mut self, radians: f64) {
        if let HeadingSource::Simulated(gyro) = &mut self.heading {
            gyro.set_next_heading(radians);
        }
    }

    /// Commit the staged simulated heading
    pub fn apply_sim_heading(&mut self) {
        if let HeadingSource::Simulated(gyro) = &mut self.heading {
            gyro.apply_next_heading();
        }
    }

    pub fn is_simulated(&self) -> bool {
        matches!(self.heading, HeadingSource::Simulated(_))
    }

    pub fn set_x(&mut self) {
        debug!("Modules to X");
        for module in self.modules.iter_mut() {
            module.set_x();
        }
    }

    pub fn set_o(&mut self) {
        debug!("Modules to O");
        for module in self.modules.iter_mut() {
            module.set_o();
        }
    }

    pub fn reset_encoders(&mut self) {
        for module in self.modules.iter_mut() {
            module.reset_encoder();
        }
    }

    pub fn modules(&self) -> &Modules<SwerveModule> {
        &self.modules
    }

    pub fn kinematics(&self) -> &SwerveKinematics {
        &self.kinematics
    }

    pub fn max_wheel_speed(&self) -> f64 {
        self.max_wheel_speed
    }

    pub fn publish(&self, table: &mut Table<'_>) {
        table.log_double("heading_deg", self.heading().degrees());
        table.log_module_states("module_states", self.module_states().iter());
        table.log_module_states("desired_module_states", self.desired_states.iter());
        table.log_chassis_speeds("requested_speeds", self.requested_speeds);
        table.log_chassis_speeds("measured_speeds", self.chassis_speeds());
        if let HeadingSource::Simulated(gyro) = &self.heading {
            table.log_double("next_sim_heading_deg", gyro.next_heading().to_degrees());
        }
        for (name, module) in self.modules.named() {
            table.log_double(&format!("{}/drive_current", name), module.drive_current());
            table.log_double(&format!("{}/heading_error_deg", name), module.heading_error().degrees());
        }
    }
}

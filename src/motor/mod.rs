// Actuator and sensor capabilities consumed by the swerve core
//
// Provides:
// - Motor / Gyro traits the modules and chassis drive
// - Simple drive feedforward (kS, kV)
// - Zenoh hardware bridge implementations

pub mod bridge;

use crate::geometry::Rotation2d;

pub use bridge::{HardwareBridge, RemoteGyro, RemoteMotor};

/// A smart motor controller.
///
/// Units are the controller's native ones: rotations, RPM, volts, amps.
/// Commands never fail at this level; transport problems belong to the
/// implementation.
pub trait Motor {
    /// Closed-loop velocity setpoint in RPM
    fn set_velocity(&mut self, rpm: f64);

    fn set_velocity_with_feedforward(&mut self, rpm: f64, feedforward_volts: f64) {
        let _ = feedforward_volts;
        self.set_velocity(rpm);
    }

    /// Open-loop output as a fraction of bus voltage
    fn set_duty_cycle(&mut self, duty: f64);

    fn set_position(&mut self, rotations: f64) {
        self.set_position_with_feedforward(rotations, 0.0);
    }

    fn set_position_with_feedforward(&mut self, rotations: f64, feedforward_volts: f64);

    fn position(&self) -> f64;

    fn velocity(&self) -> f64;

    fn current(&self) -> f64;

    fn forward_limit_switch(&self) -> bool {
        false
    }

    fn reverse_limit_switch(&self) -> bool {
        false
    }
}

/// Yaw source, counter-clockwise positive
pub trait Gyro {
    fn rotation(&self) -> Rotation2d;

    /// Make the current heading read as zero
    fn reset(&mut self);
}

/// Static friction plus velocity feedforward, in volts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimpleMotorFeedforward {
    pub ks: f64,
    pub kv: f64,
    pub ka: f64,
}

impl SimpleMotorFeedforward {
    pub fn new(ks: f64, kv: f64, ka: f64) -> Self {
        Self { ks, kv, ka }
    }

    /// Volts to hold `velocity` (m/s) with no acceleration
    pub fn calculate(&self, velocity: f64) -> f64 {
        let friction = if velocity == 0.0 { 0.0 } else { self.ks * velocity.signum() };
        friction + self.kv * velocity
    }

    pub fn calculate_with_acceleration(&self, velocity: f64, acceleration: f64) -> f64 {
        self.calculate(velocity) + self.ka * acceleration
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feedforward_static_friction_follows_sign() {
        let ff = SimpleMotorFeedforward::new(0.1, 2.0, 0.3);
        assert_eq!(ff.calculate(0.0), 0.0);
        assert!((ff.calculate(1.0) - 2.1).abs() < 1e-12);
        assert!((ff.calculate(-1.0) + 2.1).abs() < 1e-12);
        assert!((ff.calculate_with_acceleration(1.0, 2.0) - 2.7).abs() < 1e-12);
    }
}

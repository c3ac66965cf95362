pub mod config;
pub mod estimator;
pub mod geometry;
pub mod messages;
pub mod motor;
pub mod runtime;
pub mod swerve;
pub mod telemetry;
pub mod vision;

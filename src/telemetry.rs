// Write-only telemetry sink, namespaced per subsystem
//
// Values are kept as the latest JSON value per key; keys written since the
// last drain are published by the runtime on
// `swerve/telemetry/<subsystem>/<key>`.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Value, json};

use crate::config::TOPIC_TELEMETRY;
use crate::geometry::{Pose2d, RigidTransform};
use crate::swerve::{ChassisSpeeds, ModuleState};

#[derive(Debug)]
pub struct Telemetry {
    root: String,
    latest: BTreeMap<String, Value>,
    dirty: BTreeSet<String>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(TOPIC_TELEMETRY)
    }
}

impl Telemetry {
    pub fn new(root: &str) -> Self {
        Self {
            root: root.trim_end_matches('/').to_string(),
            latest: BTreeMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    /// Writer for one subsystem
    pub fn table(&mut self, subsystem: &str) -> Table<'_> {
        let prefix = format!("{}/{}", self.root, subsystem);
        Table { sink: self, prefix }
    }

    /// Latest value under a full topic
    pub fn get(&self, topic: &str) -> Option<&Value> {
        self.latest.get(topic)
    }

    /// Topics written since the last drain, with their latest values
    pub fn drain(&mut self) -> Vec<(String, Value)> {
        std::mem::take(&mut self.dirty)
            .into_iter()
            .filter_map(|topic| {
                let value = self.latest.get(&topic)?.clone();
                Some((topic, value))
            })
            .collect()
    }

    fn put(&mut self, topic: String, value: Value) {
        self.dirty.insert(topic.clone());
        self.latest.insert(topic, value);
    }
}

/// Namespaced writer borrowed from a [`Telemetry`] sink
pub struct Table<'a> {
    sink: &'a mut Telemetry,
    prefix: String,
}

impl Table<'_> {
    pub fn topic(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.sink.get(&self.topic(key))
    }

    pub fn log_double(&mut self, key: &str, value: f64) {
        // NaN and infinities are not representable in JSON
        let value = if value.is_finite() { json!(value) } else { Value::Null };
        self.put(key, value);
    }

    pub fn log_int(&mut self, key: &str, value: i64) {
        self.put(key, json!(value));
    }

    pub fn log_bool(&mut self, key: &str, value: bool) {
        self.put(key, json!(value));
    }

    pub fn log_string(&mut self, key: &str, value: &str) {
        self.put(key, json!(value));
    }

    pub fn log_pose(&mut self, key: &str, pose: Pose2d) {
        self.put(
            key,
            json!({ "x": pose.x(), "y": pose.y(), "heading": pose.rotation.radians() }),
        );
    }

    pub fn log_transform(&mut self, key: &str, transform: RigidTransform) {
        self.put(key, json!(transform));
    }

    pub fn log_chassis_speeds(&mut self, key: &str, speeds: ChassisSpeeds) {
        self.put(
            key,
            json!({ "vx": speeds.vx, "vy": speeds.vy, "omega": speeds.omega }),
        );
    }

    pub fn log_module_states<'s>(&mut self, key: &str, states: impl IntoIterator<Item = &'s ModuleState>) {
        let states: Vec<Value> = states
            .into_iter()
            .map(|s| json!({ "speed": s.speed, "angle": s.angle.radians() }))
            .collect();
        self.put(key, Value::Array(states));
    }

    fn put(&mut self, key: &str, value: Value) {
        let topic = self.topic(key);
        self.sink.put(topic, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rotation2d;

    #[test]
    fn test_log_double_keeps_latest_per_key() {
        let mut telemetry = Telemetry::new("test");
        for i in 0..10 {
            let mut table = telemetry.table("logger");
            table.log_double("someValue", i as f64);
            table.log_double("someOtherValue", i as f64 * 2.0);
            assert_eq!(table.get("someValue"), Some(&json!(i as f64)));
            assert_eq!(table.get("someOtherValue"), Some(&json!(i as f64 * 2.0)));
        }
    }

    #[test]
    fn test_log_bool_and_string() {
        let mut telemetry = Telemetry::new("test");
        let mut table = telemetry.table("logger");
        for i in 0..4 {
            table.log_bool("even", i % 2 == 0);
            assert_eq!(table.get("even"), Some(&json!(i % 2 == 0)));
        }
        table.log_string("mode", "teleop");
        table.log_int("count", 3);
        assert_eq!(telemetry.get("test/logger/mode"), Some(&json!("teleop")));
        assert_eq!(telemetry.get("test/logger/count"), Some(&json!(3)));
    }

    #[test]
    fn test_subsystems_are_namespaced() {
        let mut telemetry = Telemetry::default();
        telemetry.table("chassis").log_double("heading", 1.0);
        telemetry.table("vision").log_double("heading", 2.0);
        assert_eq!(telemetry.get("swerve/telemetry/chassis/heading"), Some(&json!(1.0)));
        assert_eq!(telemetry.get("swerve/telemetry/vision/heading"), Some(&json!(2.0)));
    }

    #[test]
    fn test_drain_returns_only_changed_keys() {
        let mut telemetry = Telemetry::new("t");
        telemetry.table("a").log_double("x", 1.0);
        telemetry.table("a").log_double("x", 2.0);
        telemetry.table("a").log_pose("pose", Pose2d::new(1.0, 2.0, Rotation2d::ZERO));

        let drained = telemetry.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[1], ("t/a/x".to_string(), json!(2.0)));
        assert!(telemetry.drain().is_empty());
        // Latest values survive a drain
        assert_eq!(telemetry.get("t/a/x"), Some(&json!(2.0)));
    }

    #[test]
    fn test_transform_fields() {
        let mut telemetry = Telemetry::new("t");
        let mount = RigidTransform { x: 0.3, z: 0.25, yaw: 0.5, ..Default::default() };
        telemetry.table("vision").log_transform("front/robot_to_camera", mount);
        let value = telemetry.get("t/vision/front/robot_to_camera").unwrap();
        assert_eq!(value["x"], json!(0.3));
        assert_eq!(value["yaw"], json!(0.5));
        assert_eq!(value["pitch"], json!(0.0));
    }

    #[test]
    fn test_non_finite_double_is_null() {
        let mut telemetry = Telemetry::new("t");
        telemetry.table("a").log_double("nan", f64::NAN);
        assert_eq!(telemetry.get("t/a/nan"), Some(&Value::Null));
    }

    #[test]
    fn test_module_states_array() {
        let mut telemetry = Telemetry::new("t");
        let states = [ModuleState::new(1.0, Rotation2d::ZERO), ModuleState::new(-0.5, Rotation2d::ZERO)];
        telemetry.table("chassis").log_module_states("states", states.iter());
        let value = telemetry.get("t/chassis/states").unwrap();
        assert_eq!(value.as_array().map(|a| a.len()), Some(2));
        assert_eq!(value[1]["speed"], json!(-0.5));
    }
}

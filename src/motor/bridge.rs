// Hardware bridge: motors and gyro owned by a remote process on zenoh
//
// Setpoints are queued here during the tick and flushed by the runtime as
// one sample per motor. Feedback samples update a cache that the Motor and
// Gyro implementations read from.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

use tracing::{debug, info};

use super::{Gyro, Motor};
use crate::config::TOPIC_MOTOR_PREFIX;
use crate::geometry::Rotation2d;
use crate::messages::{GyroFeedback, MotorFeedback, MotorSetpoint};

#[derive(Debug, Default)]
struct BridgeState {
    motor_ids: BTreeSet<u8>,
    // Latest setpoint per motor since the last flush
    pending: BTreeMap<u8, MotorSetpoint>,
    feedback: HashMap<u8, MotorFeedback>,
    gyro_yaw: f64,
}

/// Shared handle to the bridge; cheap to clone
#[derive(Debug, Clone, Default)]
pub struct HardwareBridge {
    state: Rc<RefCell<BridgeState>>,
}

impl HardwareBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Motor handle for a CAN id
    pub fn motor(&self, id: u8) -> RemoteMotor {
        debug!("Registering bridged motor {}", id);
        self.state.borrow_mut().motor_ids.insert(id);
        RemoteMotor {
            id,
            state: Rc::clone(&self.state),
        }
    }

    pub fn gyro(&self) -> RemoteGyro {
        RemoteGyro {
            state: Rc::clone(&self.state),
            offset: 0.0,
        }
    }

    pub fn motor_ids(&self) -> Vec<u8> {
        self.state.borrow().motor_ids.iter().copied().collect()
    }

    pub fn on_motor_feedback(&self, id: u8, feedback: MotorFeedback) {
        let mut state = self.state.borrow_mut();
        if state.motor_ids.contains(&id) {
            state.feedback.insert(id, feedback);
        } else {
            debug!("Ignoring feedback for unknown motor {}", id);
        }
    }

    pub fn on_gyro_feedback(&self, feedback: GyroFeedback) {
        if feedback.yaw.is_finite() {
            self.state.borrow_mut().gyro_yaw = feedback.yaw;
        }
    }

    /// Take every setpoint queued since the last call, ordered by motor id
    pub fn drain_setpoints(&self) -> Vec<(u8, MotorSetpoint)> {
        std::mem::take(&mut self.state.borrow_mut().pending)
            .into_iter()
            .collect()
    }

    /// Queue a zero-output command for every registered motor
    pub fn stop_all(&self) {
        info!("Stopping all bridged motors");
        let mut state = self.state.borrow_mut();
        let ids: Vec<u8> = state.motor_ids.iter().copied().collect();
        for id in ids {
            state.pending.insert(id, MotorSetpoint::stop());
        }
    }

    pub fn command_topic(id: u8) -> String {
        format!("{}/{}/cmd", TOPIC_MOTOR_PREFIX, id)
    }

    pub fn feedback_topic(id: u8) -> String {
        format!("{}/{}/state", TOPIC_MOTOR_PREFIX, id)
    }

    /// Motor id from a `<prefix>/<id>/state` key
    pub fn parse_feedback_topic(key: &str) -> Option<u8> {
        key.strip_prefix(TOPIC_MOTOR_PREFIX)?
            .strip_prefix('/')?
            .strip_suffix("/state")?
            .parse()
            .ok()
    }
}

/// One motor behind the bridge
#[derive(Debug)]
pub struct RemoteMotor {
    id: u8,
    state: Rc<RefCell<BridgeState>>,
}

impl RemoteMotor {
    pub fn id(&self) -> u8 {
        self.id
    }

    fn queue(&self, setpoint: MotorSetpoint) {
        self.state.borrow_mut().pending.insert(self.id, setpoint);
    }

    fn feedback(&self) -> MotorFeedback {
        self.state
            .borrow()
            .feedback
            .get(&self.id)
            .copied()
            .unwrap_or_default()
    }
}

impl Motor for RemoteMotor {
    fn set_velocity(&mut self, rpm: f64) {
        self.set_velocity_with_feedforward(rpm, 0.0);
    }

    fn set_velocity_with_feedforward(&mut self, rpm: f64, feedforward_volts: f64) {
        self.queue(MotorSetpoint::Velocity {
            value: rpm,
            feedforward: feedforward_volts,
        });
    }

    fn set_duty_cycle(&mut self, duty: f64) {
        self.queue(MotorSetpoint::DutyCycle { value: duty });
    }

    fn set_position_with_feedforward(&mut self, rotations: f64, feedforward_volts: f64) {
        self.queue(MotorSetpoint::Position {
            value: rotations,
            feedforward: feedforward_volts,
        });
    }

    fn position(&self) -> f64 {
        self.feedback().position
    }

    fn velocity(&self) -> f64 {
        self.feedback().velocity
    }

    fn current(&self) -> f64 {
        self.feedback().current
    }

    fn forward_limit_switch(&self) -> bool {
        self.feedback().forward_limit
    }

    fn reverse_limit_switch(&self) -> bool {
        self.feedback().reverse_limit
    }
}

/// Gyro behind the bridge; reset is local so the remote yaw is never written
#[derive(Debug)]
pub struct RemoteGyro {
    state: Rc<RefCell<BridgeState>>,
    offset: f64,
}

impl Gyro for RemoteGyro {
    fn rotation(&self) -> Rotation2d {
        Rotation2d::new(self.state.borrow().gyro_yaw - self.offset)
    }

    fn reset(&mut self) {
        self.offset = self.state.borrow().gyro_yaw;
    }
}

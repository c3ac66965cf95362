// 50 Hz loop with watchdog
// Each tick: commit sim heading, integrate odometry, fuse vision, drive from
// the latest command (or stop when it goes stale), run deferred startup work,
// then publish telemetry.

use std::error::Error;
use std::path::Path;
use std::time::{Duration, Instant};

use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::{
    CMD_TIMEOUT, ConfigError, HEADING_WARMUP_TICKS, LOOP_HZ, RuntimeConfig, START_POSE_WINDOW_TICKS,
    TOPIC_CMD_CHASSIS, TOPIC_GYRO_STATE, TOPIC_HEALTH, TOPIC_MOTOR_PREFIX, TOPIC_POSE, TOPIC_VISION_PREFIX,
};
use crate::estimator::PoseEstimator;
use crate::geometry::{Pose2d, Rotation2d};
use crate::messages::{ChassisCommand, FrameMessage, GyroFeedback, MotorFeedback, PoseMessage, RuntimeHealth};
use crate::motor::HardwareBridge;
use crate::swerve::{ChassisCoordinator, ChassisHardware, ChassisSpeeds};
use crate::telemetry::Telemetry;
use crate::vision::{CameraVision, FieldLayout, FrameQueue, SimulatedVision, VisionProvider};

/// One-shot action that fires on the Nth poll
#[derive(Debug, Clone)]
pub struct DeferredTask {
    remaining: u32,
    fired: bool,
}

impl DeferredTask {
    pub fn after_ticks(ticks: u32) -> Self {
        Self { remaining: ticks, fired: false }
    }

    /// Count one tick; true exactly once, when the countdown completes
    pub fn poll(&mut self) -> bool {
        if self.fired {
            return false;
        }
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.fired = true;
        }
        self.fired
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }
}

pub struct Runtime {
    chassis: ChassisCoordinator,
    estimator: PoseEstimator,
    vision: Box<dyn VisionProvider>,
    telemetry: Telemetry,
    latest_cmd: Option<ChassisCommand>,
    cmd_received_at: f64,
    health: RuntimeHealth,
    heading_zero: DeferredTask,
    start_pose_seeded: bool,
    ticks: u64,
}

impl Runtime {
    pub fn new(
        config: &RuntimeConfig,
        hardware: ChassisHardware,
        vision: Box<dyn VisionProvider>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let chassis = ChassisCoordinator::new(&config.chassis, hardware)?;

        let [x, y, heading] = config.estimator.initial_pose;
        let estimator = PoseEstimator::new(
            chassis.kinematics().clone(),
            chassis.heading(),
            chassis.module_positions(),
            Pose2d::new(x, y, Rotation2d::new(heading)),
            &config.estimator,
        );

        Ok(Self {
            chassis,
            estimator,
            vision,
            telemetry: Telemetry::default(),
            latest_cmd: None,
            cmd_received_at: 0.0,
            health: RuntimeHealth::CmdStale, // Start stale until first cmd
            heading_zero: DeferredTask::after_ticks(HEADING_WARMUP_TICKS),
            start_pose_seeded: false,
            ticks: 0,
        })
    }

    /// Process incoming command received at `timestamp` (s)
    pub fn on_command(&mut self, cmd: ChassisCommand, timestamp: f64) {
        if !ChassisSpeeds::from(&cmd).is_finite() {
            warn!("Dropping non-finite command: {:?}", cmd);
            return;
        }
        debug!("Received command: {:?}", &cmd);
        self.latest_cmd = Some(cmd);
        self.cmd_received_at = timestamp;
    }

    /// Run one control period ending at `timestamp` (s)
    pub fn tick(&mut self, timestamp: f64) {
        // 1. Heading staged during the previous tick becomes current
        self.chassis.apply_sim_heading();

        // 2. Odometry
        self.estimator
            .update_with_time(timestamp, self.chassis.heading(), self.chassis.module_positions());

        // 3. Vision
        self.vision.periodic(timestamp);
        if !self.start_pose_seeded && self.ticks < START_POSE_WINDOW_TICKS {
            if let Some(start) = self.vision.best_start_pose() {
                info!("Seeding pose from vision: ({:.2}, {:.2}, {:.1} deg)", start.x(), start.y(), start.heading().degrees());
                self.estimator
                    .reset_position(self.chassis.heading(), self.chassis.module_positions(), start);
                self.start_pose_seeded = true;
            }
        }
        let measurements = self.vision.drain_measurements(self.estimator.pose());
        for measurement in &measurements {
            self.estimator.add_vision_measurement(measurement.pose, measurement.timestamp);
        }

        // 4. Drive (includes watchdog logic)
        match self.fresh_command(timestamp) {
            Some(cmd) if cmd.field_relative => self.chassis.drive_field_relative(ChassisSpeeds::from(&cmd)),
            Some(cmd) => self.chassis.set_chassis_speeds(ChassisSpeeds::from(&cmd)),
            None => self.chassis.stop(),
        }

        // 5. Deferred startup work
        if self.heading_zero.poll() {
            // Keep the field pose; only the sensor reference moves
            let pose = self.estimator.pose();
            self.chassis.zero_heading();
            self.estimator
                .reset_position(self.chassis.heading(), self.chassis.module_positions(), pose);
        }

        // 6. Telemetry
        self.chassis.publish(&mut self.telemetry.table("chassis"));
        {
            let mut table = self.telemetry.table("estimator");
            table.log_pose("pose", self.estimator.pose());
            table.log_pose("odometry_pose", self.estimator.odometry_pose());
        }
        self.vision.publish(&mut self.telemetry.table("vision"));
        {
            let mut table = self.telemetry.table("runtime");
            table.log_string("health", health_label(self.health));
            table.log_int("tick", self.ticks as i64);
            table.log_int("vision_measurements", measurements.len() as i64);
            table.log_bool("heading_zeroed", self.heading_zero.has_fired());
        }

        self.ticks += 1;
    }

    /// Latest command if it is recent enough; updates health
    fn fresh_command(&mut self, timestamp: f64) -> Option<ChassisCommand> {
        let cmd_age = timestamp - self.cmd_received_at;

        match self.latest_cmd {
            Some(cmd) if cmd_age <= CMD_TIMEOUT.as_secs_f64() => {
                if self.health != RuntimeHealth::Ok {
                    info!("Command stream live");
                }
                self.health = RuntimeHealth::Ok;
                Some(cmd)
            }
            Some(_) => {
                // Watchdog triggered - stop the robot
                if self.health != RuntimeHealth::CmdStale {
                    warn!("Command stale ({:.3}s old), stopping robot", cmd_age);
                }
                self.health = RuntimeHealth::CmdStale;
                None
            }
            None => {
                // No command ever received
                self.health = RuntimeHealth::CmdStale;
                None
            }
        }
    }

    pub fn stop(&mut self) {
        self.latest_cmd = None;
        self.chassis.stop();
    }

    pub fn health(&self) -> RuntimeHealth {
        self.health
    }

    pub fn pose(&self) -> Pose2d {
        self.estimator.pose()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn chassis(&self) -> &ChassisCoordinator {
        &self.chassis
    }

    pub fn chassis_mut(&mut self) -> &mut ChassisCoordinator {
        &mut self.chassis
    }

    pub fn estimator(&self) -> &PoseEstimator {
        &self.estimator
    }

    pub fn estimator_mut(&mut self) -> &mut PoseEstimator {
        &mut self.estimator
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn telemetry_mut(&mut self) -> &mut Telemetry {
        &mut self.telemetry
    }
}

fn health_label(health: RuntimeHealth) -> &'static str {
    match health {
        RuntimeHealth::Ok => "ok",
        RuntimeHealth::CmdStale => "cmd_stale",
    }
}

/// Camera name from a `<prefix>/<camera>/frames` key
fn parse_frames_topic(key: &str) -> Option<&str> {
    key.strip_prefix(TOPIC_VISION_PREFIX)?
        .strip_prefix('/')?
        .strip_suffix("/frames")
        .filter(|name| !name.is_empty() && !name.contains('/'))
}

async fn flush_setpoints(
    session: &zenoh::Session,
    bridge: &HardwareBridge,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    for (id, setpoint) in bridge.drain_setpoints() {
        session
            .put(HardwareBridge::command_topic(id), serde_json::to_string(&setpoint)?)
            .await?;
    }
    Ok(())
}

pub async fn run(config: RuntimeConfig) -> Result<(), Box<dyn Error + Send + Sync>> {
    config.validate()?;
    let layout = match &config.vision.field_layout {
        Some(path) => FieldLayout::load(Path::new(path))?,
        None => FieldLayout::builtin()?,
    };

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let sub_cmd = session.declare_subscriber(TOPIC_CMD_CHASSIS).await?;
    let sub_motor = session
        .declare_subscriber(format!("{}/*/state", TOPIC_MOTOR_PREFIX))
        .await?;
    let sub_gyro = session.declare_subscriber(TOPIC_GYRO_STATE).await?;
    let sub_frames = session
        .declare_subscriber(format!("{}/*/frames", TOPIC_VISION_PREFIX))
        .await?;
    let pub_pose = session.declare_publisher(TOPIC_POSE).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    let bridge = HardwareBridge::new();
    let (hardware, vision, frame_queues): (ChassisHardware, Box<dyn VisionProvider>, Vec<FrameQueue>) =
        if config.simulate {
            info!("Simulation mode: no hardware bridge");
            let vision = SimulatedVision::new(&config.vision, layout);
            (ChassisHardware::simulated(), Box::new(vision), Vec::new())
        } else {
            let (vision, queues) = CameraVision::with_frame_queues(&config.vision, layout);
            info!("Cameras: {}", vision.camera_names().collect::<Vec<_>>().join(", "));
            (ChassisHardware::bridged(&config.chassis, &bridge), Box::new(vision), queues)
        };

    let mut runtime = Runtime::new(&config, hardware, vision)?;
    let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let start = Instant::now();

    info!(
        "Runtime started: {}Hz loop, {}ms watchdog timeout",
        LOOP_HZ,
        CMD_TIMEOUT.as_millis()
    );
    info!("Subscribed to: {}", TOPIC_CMD_CHASSIS);
    info!("Publishing to: {}, {}", TOPIC_POSE, TOPIC_HEALTH);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
        }
        let now = start.elapsed().as_secs_f64();

        // 1. Drain all pending inputs (non-blocking), keep latest
        while let Ok(Some(sample)) = sub_cmd.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<ChassisCommand>(&payload) {
                Ok(cmd) => runtime.on_command(cmd, now),
                Err(e) => warn!("Failed to parse command: {}", e),
            }
        }
        while let Ok(Some(sample)) = sub_motor.try_recv() {
            let Some(id) = HardwareBridge::parse_feedback_topic(sample.key_expr().as_str()) else {
                continue;
            };
            match serde_json::from_slice::<MotorFeedback>(&sample.payload().to_bytes()) {
                Ok(feedback) => bridge.on_motor_feedback(id, feedback),
                Err(e) => warn!("Failed to parse feedback for motor {}: {}", id, e),
            }
        }
        while let Ok(Some(sample)) = sub_gyro.try_recv() {
            match serde_json::from_slice::<GyroFeedback>(&sample.payload().to_bytes()) {
                Ok(feedback) => bridge.on_gyro_feedback(feedback),
                Err(e) => warn!("Failed to parse gyro feedback: {}", e),
            }
        }
        while let Ok(Some(sample)) = sub_frames.try_recv() {
            let key = sample.key_expr().as_str();
            let Some(queue) = parse_frames_topic(key).and_then(|name| frame_queues.iter().find(|q| q.camera() == name))
            else {
                debug!("Frames from unconfigured camera on {}", key);
                continue;
            };
            match serde_json::from_slice::<FrameMessage>(&sample.payload().to_bytes()) {
                Ok(frame) => queue.push_message(frame, now),
                Err(e) => queue.fail(format!("malformed frame: {}", e)),
            }
        }

        // 2. Control tick
        runtime.tick(now);

        // 3. Publish setpoints, telemetry, pose and health
        flush_setpoints(&session, &bridge).await?;
        for (key, value) in runtime.telemetry_mut().drain() {
            session.put(key, value.to_string()).await?;
        }
        pub_pose
            .put(serde_json::to_string(&PoseMessage::new(now, runtime.pose()))?)
            .await?;
        pub_health.put(serde_json::to_string(&runtime.health())?).await?;
    }

    runtime.stop();
    bridge.stop_all();
    flush_setpoints(&session, &bridge).await?;
    info!("Runtime stopped after {} ticks", runtime.ticks());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TICK_PERIOD_S;
    use crate::vision::Measurement;
    use approx::assert_relative_eq;
    use serde_json::json;
    use std::f64::consts::{FRAC_PI_2, PI};

    /// Provider with a fixed start pose and a one-shot batch of measurements
    #[derive(Default)]
    struct ScriptedVision {
        start: Option<Pose2d>,
        pending: Vec<Measurement>,
    }

    impl VisionProvider for ScriptedVision {
        fn drain_measurements(&mut self, _reference: Pose2d) -> Vec<Measurement> {
            std::mem::take(&mut self.pending)
        }

        fn best_start_pose(&self) -> Option<Pose2d> {
            self.start
        }
    }

    fn sim_runtime(vision: ScriptedVision) -> Runtime {
        Runtime::new(&RuntimeConfig::default(), ChassisHardware::simulated(), Box::new(vision)).unwrap()
    }

    fn command(x_vel: f64, y_vel: f64, theta_vel: f64) -> ChassisCommand {
        ChassisCommand { x_vel, y_vel, theta_vel, field_relative: false }
    }

    fn time(tick: u64) -> f64 {
        tick as f64 * TICK_PERIOD_S
    }

    #[test]
    fn test_deferred_task_fires_once() {
        let mut task = DeferredTask::after_ticks(3);
        let fired: Vec<bool> = (0..6).map(|_| task.poll()).collect();
        assert_eq!(fired, vec![false, false, true, false, false, false]);
        assert!(task.has_fired());
    }

    #[test]
    fn test_starts_stale() {
        let mut runtime = sim_runtime(ScriptedVision::default());
        runtime.tick(0.0);
        assert_eq!(runtime.health(), RuntimeHealth::CmdStale);
        assert!(runtime.chassis().requested_speeds().is_zero());
    }

    #[test]
    fn test_watchdog_stops_stale_commands() {
        let mut runtime = sim_runtime(ScriptedVision::default());
        runtime.on_command(command(1.0, 0.0, 0.0), 0.0);
        runtime.tick(0.0);
        assert_eq!(runtime.health(), RuntimeHealth::Ok);
        assert_relative_eq!(runtime.chassis().requested_speeds().vx, 1.0);

        // Still fresh just inside the timeout
        runtime.tick(0.24);
        assert_eq!(runtime.health(), RuntimeHealth::Ok);

        runtime.tick(0.30);
        assert_eq!(runtime.health(), RuntimeHealth::CmdStale);
        assert!(runtime.chassis().requested_speeds().is_zero());

        // A new command revives the stream
        runtime.on_command(command(0.5, 0.0, 0.0), 0.32);
        runtime.tick(0.32);
        assert_eq!(runtime.health(), RuntimeHealth::Ok);
    }

    #[test]
    fn test_non_finite_command_dropped() {
        let mut runtime = sim_runtime(ScriptedVision::default());
        runtime.on_command(command(f64::NAN, 0.0, 0.0), 0.0);
        runtime.tick(0.0);
        assert_eq!(runtime.health(), RuntimeHealth::CmdStale);
    }

    #[test]
    fn test_heading_zeroed_once_after_warmup() {
        let mut runtime = sim_runtime(ScriptedVision::default());
        let warmup = HEADING_WARMUP_TICKS as u64;

        for tick in 0..warmup - 1 {
            runtime.on_command(command(0.0, 0.0, 1.0), time(tick));
            runtime.tick(time(tick));
        }
        assert!(runtime.chassis().heading().radians() > 0.5);
        let pose_before = runtime.pose();

        runtime.on_command(command(0.0, 0.0, 1.0), time(warmup - 1));
        runtime.tick(time(warmup - 1));
        assert_relative_eq!(runtime.chassis().heading().radians(), 0.0);
        // The field pose does not jump with the sensor reference
        assert_relative_eq!(
            runtime.pose().heading().radians(),
            pose_before.heading().radians(),
            epsilon = 0.05
        );

        // Rotation resumes from zero and is never zeroed again
        for tick in warmup..warmup + 10 {
            runtime.on_command(command(0.0, 0.0, 1.0), time(tick));
            runtime.tick(time(tick));
        }
        assert!(runtime.chassis().heading().radians() > 0.1);
    }

    #[test]
    fn test_field_relative_command_rotated_by_heading() {
        let mut runtime = sim_runtime(ScriptedVision::default());
        runtime.chassis_mut().set_next_sim_heading(FRAC_PI_2);
        runtime.on_command(
            ChassisCommand { x_vel: 1.0, y_vel: 0.0, theta_vel: 0.0, field_relative: true },
            0.0,
        );
        runtime.tick(0.0);

        let requested = runtime.chassis().requested_speeds();
        assert_relative_eq!(requested.vx, 0.0, epsilon = 1e-9);
        assert_relative_eq!(requested.vy, -1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_vision_seeds_start_pose_and_fuses() {
        let start = Pose2d::new(3.0, 4.0, Rotation2d::ZERO);
        let mut runtime = sim_runtime(ScriptedVision { start: Some(start), pending: Vec::new() });
        runtime.tick(0.0);
        assert_relative_eq!(runtime.pose().x(), 3.0, epsilon = 1e-9);
        assert_relative_eq!(runtime.pose().y(), 4.0, epsilon = 1e-9);

        // Later start poses are ignored once seeded
        runtime.vision = Box::new(ScriptedVision {
            start: Some(Pose2d::new(9.0, 9.0, Rotation2d::ZERO)),
            pending: vec![Measurement { pose: Pose2d::new(3.5, 4.0, Rotation2d::ZERO), timestamp: 0.0 }],
        });
        runtime.tick(time(1));
        let x = runtime.pose().x();
        assert!(x > 3.0 && x < 3.5, "vision pulls the estimate part way, got {}", x);
        assert_eq!(
            runtime.telemetry().get("swerve/telemetry/runtime/vision_measurements"),
            Some(&json!(1))
        );
    }

    #[test]
    fn test_telemetry_published_each_tick() {
        let mut runtime = sim_runtime(ScriptedVision::default());
        runtime.tick(0.0);
        let drained = runtime.telemetry_mut().drain();
        assert!(drained.iter().any(|(k, v)| k == "swerve/telemetry/runtime/health" && v == &json!("cmd_stale")));
        assert!(drained.iter().any(|(k, _)| k.starts_with("swerve/telemetry/chassis/")));
        assert!(drained.iter().any(|(k, _)| k == "swerve/telemetry/estimator/pose"));

        runtime.tick(time(1));
        assert!(!runtime.telemetry_mut().drain().is_empty());
    }

    #[test]
    fn test_simulated_vision_does_not_pull_ahead_of_odometry() {
        let mut config = RuntimeConfig::default();
        config.estimator.initial_pose = [2.0, 2.0, PI];
        let vision = SimulatedVision::new(&config.vision, FieldLayout::builtin().unwrap());
        let mut runtime = Runtime::new(&config, ChassisHardware::simulated(), Box::new(vision)).unwrap();

        // Back away from tag 8 at 1 m/s
        for tick in 0..100 {
            runtime.on_command(command(-1.0, 0.0, 0.0), time(tick));
            runtime.tick(time(tick));
        }

        let accepted = runtime
            .telemetry()
            .get("swerve/telemetry/vision/front/accepted")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        assert!(accepted > 10, "front camera fused {} targets", accepted);
        let fused = runtime.pose();
        let odometry = runtime.estimator().odometry_pose();
        assert!(fused.x() > 3.5);
        assert_relative_eq!(fused.x(), odometry.x(), epsilon = 1e-6);
        assert_relative_eq!(fused.y(), odometry.y(), epsilon = 1e-6);
    }

    #[test]
    fn test_parse_frames_topic() {
        assert_eq!(parse_frames_topic("swerve/vision/front/frames"), Some("front"));
        assert_eq!(parse_frames_topic("swerve/vision//frames"), None);
        assert_eq!(parse_frames_topic("swerve/vision/a/b/frames"), None);
        assert_eq!(parse_frames_topic("swerve/hw/motor/1/state"), None);
    }
}

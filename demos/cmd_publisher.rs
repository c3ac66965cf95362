// Keyboard teleop for the swerve runtime.
//
// WASD translate, Z/X rotate, G toggles field/robot frame, R/F change the
// speed preset, P prints the latest fused pose, Q quits.
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use std::time::{Duration, Instant};
use swerve_zenoh_runtime::config::{TOPIC_CMD_CHASSIS, TOPIC_POSE};
use swerve_zenoh_runtime::messages::{ChassisCommand, PoseMessage};
use tracing::{info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// (label, translation m/s, rotation deg/s)
const PRESETS: [(&str, f64, f64); 3] = [("LOW", 0.5, 45.0), ("MED", 1.5, 120.0), ("HIGH", 3.0, 270.0)];
const HOLD: Duration = Duration::from_millis(100); // motion keys expire after this
const PUBLISH_PERIOD: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy)]
enum Axis {
    X,
    Y,
    Theta,
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Move(Axis, f64),
    ToggleFrame,
    Preset(isize),
    ShowPose,
    Quit,
}

fn action_for(code: KeyCode) -> Option<Action> {
    let action = match code {
        KeyCode::Char('w') => Action::Move(Axis::X, 1.0),
        KeyCode::Char('s') => Action::Move(Axis::X, -1.0),
        KeyCode::Char('a') => Action::Move(Axis::Y, 1.0),
        KeyCode::Char('d') => Action::Move(Axis::Y, -1.0),
        KeyCode::Char('z') => Action::Move(Axis::Theta, 1.0),
        KeyCode::Char('x') => Action::Move(Axis::Theta, -1.0),
        KeyCode::Char('g') => Action::ToggleFrame,
        KeyCode::Char('r') => Action::Preset(1),
        KeyCode::Char('f') => Action::Preset(-1),
        KeyCode::Char('p') => Action::ShowPose,
        KeyCode::Char('q') | KeyCode::Esc => Action::Quit,
        _ => return None,
    };
    Some(action)
}

// Toggles fire once per press; everything else also follows auto-repeat
fn accepts(action: Action, kind: KeyEventKind) -> bool {
    match action {
        Action::ToggleFrame => kind == KeyEventKind::Press,
        _ => matches!(kind, KeyEventKind::Press | KeyEventKind::Repeat),
    }
}

struct Teleop {
    cmd: ChassisCommand,
    preset: usize,
    last_motion: Instant,
}

impl Teleop {
    fn new() -> Self {
        Self {
            cmd: ChassisCommand::default(),
            preset: 0,
            last_motion: Instant::now(),
        }
    }

    /// Returns false on quit
    fn apply(&mut self, action: Action, latest_pose: Option<&PoseMessage>) -> bool {
        let (label, linear, angular) = PRESETS[self.preset];
        match action {
            Action::Move(Axis::X, sign) => self.cmd.x_vel = sign * linear,
            Action::Move(Axis::Y, sign) => self.cmd.y_vel = sign * linear,
            Action::Move(Axis::Theta, sign) => self.cmd.theta_vel = sign * angular.to_radians(),
            Action::ToggleFrame => {
                self.cmd.field_relative = !self.cmd.field_relative;
                info!("Frame: {}", if self.cmd.field_relative { "field" } else { "robot" });
            }
            Action::Preset(step) => {
                self.preset = self.preset.saturating_add_signed(step).min(PRESETS.len() - 1);
                info!("Speed: {} (was {})", PRESETS[self.preset].0, label);
            }
            Action::ShowPose => match latest_pose {
                Some(msg) => {
                    let pose = msg.pose();
                    info!(
                        "Pose @ {:.2}s: x={:.3} y={:.3} heading={:.1} deg",
                        msg.timestamp,
                        pose.x(),
                        pose.y(),
                        pose.rotation.degrees()
                    );
                }
                None => info!("No pose received yet"),
            },
            Action::Quit => return false,
        }
        if matches!(action, Action::Move(..)) {
            self.last_motion = Instant::now();
        }
        true
    }

    fn command(&mut self) -> &ChassisCommand {
        if self.last_motion.elapsed() > HOLD {
            self.cmd.x_vel = 0.0;
            self.cmd.y_vel = 0.0;
            self.cmd.theta_vel = 0.0;
        }
        &self.cmd
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD_CHASSIS).await?;
    let poses = session.declare_subscriber(TOPIC_POSE).await?;

    info!("Controls: WASD=move, Z/X=rotate, G=frame, R/F=speed, P=pose, Q=quit");

    enable_raw_mode()?;
    let result = teleop_loop(&publisher, &poses).await;
    disable_raw_mode()?;
    result
}

async fn teleop_loop(
    publisher: &zenoh::pubsub::Publisher<'_>,
    poses: &zenoh::pubsub::Subscriber<zenoh::handlers::FifoChannelHandler<zenoh::sample::Sample>>,
) -> Result<(), BoxError> {
    let mut teleop = Teleop::new();
    let mut latest_pose: Option<PoseMessage> = None;

    loop {
        while let Ok(Some(sample)) = poses.try_recv() {
            match serde_json::from_slice::<PoseMessage>(&sample.payload().to_bytes()) {
                Ok(msg) => latest_pose = Some(msg),
                Err(e) => warn!("Failed to parse pose: {}", e),
            }
        }

        if event::poll(PUBLISH_PERIOD)? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                if let Some(action) = action_for(code).filter(|a| accepts(*a, kind)) {
                    if !teleop.apply(action, latest_pose.as_ref()) {
                        break;
                    }
                }
            }
        }

        publisher.put(serde_json::to_string(teleop.command())?).await?;
    }

    Ok(())
}

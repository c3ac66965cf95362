use std::path::PathBuf;

use clap::Parser;
use swerve_zenoh_runtime::config::RuntimeConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Swerve drive runtime: 50 Hz control, odometry and vision fusion over zenoh
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON runtime config; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run with simulated modules, gyro and cameras
    #[arg(long)]
    sim: bool,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init(); // installs the subscriber globally

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => match RuntimeConfig::load(path) {
            Ok(config) => {
                info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                eprintln!("Config error: {}", e);
                std::process::exit(1);
            }
        },
        None => RuntimeConfig::default(),
    };
    config.simulate |= args.sim;

    if let Err(e) = swerve_zenoh_runtime::runtime::run(config).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}

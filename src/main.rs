use std::path::PathBuf;

use clap::Parser;
use guepier::controller::Controller;
use log::{error, info};

#[derive(Parser)]
#[command(name = "guepier")]
#[command(version)]
#[command(about = "SSH interception honeypot: decoy server, session proxy, transcript capture")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(env = "GUEPIER_CONFIG")]
    config_file: PathBuf,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    let args = Args::parse();
    info!("Starting up with configuration {}", args.config_file.display());

    let mut controller = match Controller::new(args.config_file) {
        Ok(controller) => controller,
        Err(e) => {
            error!("Unable to start: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = controller.run().await {
        error!("Controller failed: {}", e);
        std::process::exit(1);
    }
    info!("Shutdown complete");
}

use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use catlet_controller::config::Config;
use catlet_controller::controller::Controller;

/// Catlet controller - saga orchestration for catlet fleets
#[derive(Parser, Debug)]
#[command(name = "catlet-controller", version, about)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Controller ID, overrides the config file
    #[arg(short, long)]
    id: Option<String>,

    /// MQTT broker address, overrides the config file
    #[arg(short, long)]
    broker: Option<String>,

    /// MQTT broker port, overrides the config file
    #[arg(short, long)]
    port: Option<u16>,
}

fn load_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default_for_controller(
            args.id.clone().unwrap_or_else(|| "controller".to_string()),
        ),
    };
    if let Some(id) = &args.id {
        config.controller_id = id.clone();
    }
    if let Some(broker) = &args.broker {
        config.mqtt.broker = broker.clone();
    }
    if let Some(port) = args.port {
        config.mqtt.port = port;
    }
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_target(false)
        .with_level(true)
        .init();

    info!(
        controller_id = %config.controller_id,
        broker = %config.mqtt.broker,
        agents = config.placement.agents.len(),
        "catlet controller starting"
    );

    let (controller, eventloop) = Controller::new(config)?;
    controller.run(eventloop).await
}

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use mqtt_aprs::config::Settings;
use mqtt_aprs::gateway;

#[derive(Parser, Debug)]
#[command(name = "mqtt-aprs", about = "Gateway between APRS-IS and an Owntracks MQTT broker")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/etc/mqtt-aprs/mqtt-aprs.toml")]
    config: PathBuf,

    /// Enable debug logging regardless of the config file
    #[arg(long)]
    debug: bool,
}

fn init_logging(settings: &Settings, debug_flag: bool) -> Result<()> {
    let default_level = if debug_flag || settings.global.debug {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mqtt_aprs={default_level}")));

    let writer = match &settings.global.logfile {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {path}"))?;
            BoxMakeWriter::new(std::sync::Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(settings.global.logfile.is_none())
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)?;
    init_logging(&settings, cli.debug)?;

    info!("Starting mqtt-aprs");
    gateway::run(settings).await
}

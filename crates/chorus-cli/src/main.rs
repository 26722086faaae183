//! chorus: command-line front end for live audio rooms.

mod cli;
mod demo;
mod events;
mod monitor;
mod settings;

use std::process::ExitCode;
use std::time::Duration;

use chorus_config::ChorusConfig;
use tracing_subscriber::EnvFilter;

use crate::cli::Command;

fn load_config(args: &cli::Args) -> ChorusConfig {
    let loaded = match &args.config {
        Some(path) => chorus_config::load_config_from(path),
        None => chorus_config::load_config(),
    };
    loaded.unwrap_or_else(|e| {
        eprintln!("Config load failed, using defaults: {e}");
        ChorusConfig::default()
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::parse();
    let config = load_config(&args);

    let fallback = format!("chorus={}", config.logging.level.as_directive());
    let log_directive = args
        .log_level
        .as_deref()
        .map(|level| format!("chorus={level}"))
        .unwrap_or(fallback);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(&log_directive).unwrap_or_else(|_| EnvFilter::new("chorus=info"))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("chorus v{} starting", env!("CARGO_PKG_VERSION"));
    let room_config = settings::room_config(&config);

    let result = match args.command {
        Command::Demo {
            speakers,
            listeners,
            duration_secs,
        } => {
            demo::run(
                room_config,
                speakers,
                listeners,
                Duration::from_secs(duration_secs),
            )
            .await
        }
        Command::Monitor {
            room,
            profile,
            role,
        } => monitor::run(&config, room_config, &room, &profile, role.into()).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("chorus: {e}");
            ExitCode::FAILURE
        }
    }
}

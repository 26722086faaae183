use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use chorus_live::Role;

/// Chorus: multi-party live audio rooms over a peer-to-peer mesh.
#[derive(Parser, Debug)]
#[command(name = "chorus", version, about)]
pub struct Args {
    /// Config file path override.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level override (debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a room entirely in-process and print what happens.
    Demo {
        /// Speakers joining besides the host.
        #[arg(long, default_value_t = 2)]
        speakers: usize,

        #[arg(long, default_value_t = 1)]
        listeners: usize,

        /// How long the host talks before everyone leaves.
        #[arg(long, default_value_t = 3)]
        duration_secs: u64,
    },
    /// Join a Supabase-backed room without a microphone and print its events.
    Monitor {
        #[arg(long)]
        room: String,

        /// Profile to join as.
        #[arg(long)]
        profile: String,

        #[arg(long, value_enum, default_value_t = MonitorRole::Viewer)]
        role: MonitorRole,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorRole {
    Viewer,
    Listener,
}

impl From<MonitorRole> for Role {
    fn from(role: MonitorRole) -> Self {
        match role {
            MonitorRole::Viewer => Role::Viewer,
            MonitorRole::Listener => Role::Listener,
        }
    }
}

pub fn parse() -> Args {
    Args::parse()
}

//! Shiba host — drives the instrumentation engine from a settings file.
//!
//! # Usage
//!
//! ```text
//! shiba-host run [--settings FILE] [--no-connect] [--no-load] [--once]
//! shiba-host settings init|show|path
//! shiba-host send [--ip IP] [--port PORT] build|export|run ...
//! ```

mod commands;

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{run::RunArgs, send::SendArgs, settings::SettingsCommand};
use shiba_protocol::{BuildMode, BuildTarget, ExportOutput};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "shiba-host",
    version,
    about = "Keep a hot-reloaded render library and its build server in sync",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load the library, connect to the build server and follow settings changes.
    Run(RunArgs),

    /// Manage the settings file.
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },

    /// Send one command to a running build server and print its events.
    Send(SendArgs),
}

// ---------------------------------------------------------------------------
// Shared protocol arguments
// ---------------------------------------------------------------------------

/// Thin wrapper so clap can parse `BuildTarget` from CLI args.
#[derive(Debug, Clone, Copy)]
pub struct TargetArg(pub BuildTarget);

impl FromStr for TargetArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "library" | "lib" => Ok(Self(BuildTarget::Library)),
            "executable" | "exe" => Ok(Self(BuildTarget::Executable)),
            other => Err(format!(
                "unknown build target '{other}'; expected: library, executable"
            )),
        }
    }
}

impl fmt::Display for TargetArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ModeArg(pub BuildMode);

impl FromStr for ModeArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self(BuildMode::Full)),
            "updates" => Ok(Self(BuildMode::Updates)),
            other => Err(format!("unknown build mode '{other}'; expected: full, updates")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OutputArg(pub ExportOutput);

impl FromStr for OutputArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "directory" | "dir" => Ok(Self(ExportOutput::Directory)),
            "7z" => Ok(Self(ExportOutput::SevenZip)),
            "zip" => Ok(Self(ExportOutput::Zip)),
            other => Err(format!(
                "unknown export output '{other}'; expected: directory, 7z, zip"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => args.run(),
        Commands::Settings { command } => commands::settings::run(command),
        Commands::Send(args) => args.run(),
    }
}

pub(crate) fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

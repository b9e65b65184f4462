//! `shiba-host send` — one-shot command to a running build server.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use serde_json::Value;

use shiba_core::settings;
use shiba_protocol::{
    BuildEnded, BuildStarted, Command, ErrorEvent, Event, EventChannel, EventHandlers,
    ExecutableCompiled, Exported, LibraryCompiled, RunFinished, ShaderSetProvided,
};

use crate::{ModeArg, OutputArg, TargetArg};

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Server address; defaults to the one in the settings file.
    #[arg(long)]
    pub ip: Option<String>,

    /// Server port; defaults to the one in the settings file.
    #[arg(long)]
    pub port: Option<u16>,

    /// How long to print incoming events after sending.
    #[arg(long, default_value_t = 5)]
    pub wait_secs: u64,

    #[command(subcommand)]
    pub command: SendCommand,
}

#[derive(Subcommand, Debug)]
pub enum SendCommand {
    /// Request a build.
    Build {
        #[arg(long, default_value = "full")]
        mode: ModeArg,
        #[arg(long, default_value = "library")]
        target: TargetArg,
    },
    /// Export the project.
    Export {
        directory: PathBuf,
        #[arg(long, default_value = "zip")]
        output: OutputArg,
        /// Passed to the server unchanged.
        #[arg(long, default_value = "executable")]
        target: String,
    },
    /// Run the built executable.
    Run,
}

impl SendCommand {
    fn to_command(&self) -> Command {
        match self {
            SendCommand::Build { mode, target } => Command::Build {
                mode: mode.0,
                target: target.0,
            },
            SendCommand::Export {
                directory,
                output,
                target,
            } => Command::Export {
                directory: directory.to_string_lossy().into_owned(),
                output: output.0,
                target: target.clone(),
            },
            SendCommand::Run => Command::Run,
        }
    }
}

const EVENT_NAMES: [&str; 8] = [
    BuildStarted::NAME,
    BuildEnded::NAME,
    LibraryCompiled::NAME,
    ExecutableCompiled::NAME,
    Exported::NAME,
    RunFinished::NAME,
    ErrorEvent::NAME,
    ShaderSetProvided::NAME,
];

impl SendArgs {
    pub fn run(self) -> Result<()> {
        crate::init_tracing();
        let home = dirs::home_dir().context("could not determine home directory")?;
        let settings = settings::load_at(&home).context("failed to load settings")?;
        let ip = self.ip.clone().unwrap_or(settings.server.ip);
        let port = self.port.unwrap_or(settings.server.port);

        let mut handlers = EventHandlers::new();
        for name in EVENT_NAMES {
            handlers.insert(name, move |frame: &Value| print_event(name, frame));
        }
        let channel = EventChannel::new(handlers);
        channel
            .connect(&ip, port)
            .with_context(|| format!("failed to connect to {ip}:{port}"))?;

        let command = self.command.to_command();
        channel
            .send(&command)
            .with_context(|| format!("failed to send {}", command.name()))?;
        println!("{} {}", "sent".green(), command.name());

        std::thread::sleep(Duration::from_secs(self.wait_secs));
        channel.disconnect();
        Ok(())
    }
}

fn print_event(name: &str, frame: &Value) {
    let mut payload = frame.clone();
    if let Some(object) = payload.as_object_mut() {
        object.remove("event");
    }
    println!("{} {}", name.cyan(), payload);
}

//! `shiba-host settings` — create and inspect the settings file.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;

use shiba_core::paths::settings_path;
use shiba_core::settings;

#[derive(Subcommand, Debug)]
pub enum SettingsCommand {
    /// Write default settings unless the file already exists.
    Init,
    /// Print the effective settings.
    Show {
        /// Emit JSON instead of YAML.
        #[arg(long)]
        json: bool,
    },
    /// Print where the settings file lives.
    Path,
}

pub fn run(command: SettingsCommand) -> Result<()> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    let path = settings_path(&home);

    match command {
        SettingsCommand::Init => {
            let existed = path.exists();
            settings::init_at(&home).context("failed to initialise settings")?;
            if existed {
                println!("{} {}", "exists".yellow(), path.display());
            } else {
                println!("{} {}", "created".green(), path.display());
            }
        }
        SettingsCommand::Show { json } => {
            let settings = settings::load_at(&home).context("failed to load settings")?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&settings)
                        .context("failed to render settings JSON")?
                );
            } else {
                print!(
                    "{}",
                    serde_yaml::to_string(&settings).context("failed to render settings")?
                );
            }
        }
        SettingsCommand::Path => println!("{}", path.display()),
    }
    Ok(())
}

//! Build-server session: optional CLI process plus the event channel.
//!
//! For `built-in-cli` and `custom-cli` locations the CLI executable runs from
//! a [`LockedResource`] working copy, launched as
//! `<cli> server --ip <ip> --port <port>`. Every location then connects the
//! [`EventChannel`] and sends the bootstrap commands. A CLI whose connect
//! attempt failed is kept running for the next attempt as long as its
//! launch configuration does not change.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use shiba_core::paths::{resolve_bundled_cli, working_dir};
use shiba_core::{ServerConfig, ServerCurrent, ServerLocation};
use shiba_protocol::{BuildMode, BuildTarget, Command, EventChannel, EventHandlers, ExportOutput};
use shiba_resource::{HookError, LockedResource, ProcessSupervisor, ResourceHooks, GRACE_PERIOD};

use crate::error::ServerError;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// What the server is told right after connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapOptions {
    pub project_directory: PathBuf,
    pub build_executable_on_change: bool,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            project_directory: PathBuf::from("."),
            build_executable_on_change: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Where the CLI working copy is placed.
    pub work_dir: PathBuf,
    /// Overrides the bundled CLI lookup.
    pub bundled_cli: Option<PathBuf>,
    pub grace_period: Duration,
    pub bootstrap: BootstrapOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            work_dir: working_dir(),
            bundled_cli: None,
            grace_period: GRACE_PERIOD,
            bootstrap: BootstrapOptions::default(),
        }
    }
}

/// Commands sent after every successful connect.
pub fn bootstrap_commands(options: &BootstrapOptions) -> Vec<Command> {
    let mut commands = vec![
        Command::SetBuildOnChange {
            executable: options.build_executable_on_change,
            library: true,
        },
        Command::SetProjectDirectory {
            path: project_directory_arg(&options.project_directory),
        },
    ];
    commands.extend(build_commands(BuildMode::Full, options));
    commands
}

/// Library build, plus the executable for full builds or when it is
/// rebuilt on change.
pub fn build_commands(mode: BuildMode, options: &BootstrapOptions) -> Vec<Command> {
    let mut commands = vec![Command::Build {
        mode,
        target: BuildTarget::Library,
    }];
    if mode == BuildMode::Full || options.build_executable_on_change {
        commands.push(Command::Build {
            mode,
            target: BuildTarget::Executable,
        });
    }
    commands
}

fn project_directory_arg(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

// ---------------------------------------------------------------------------
// CLI process
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct Launch {
    path: PathBuf,
    ip: String,
    port: u16,
}

impl Launch {
    fn args(&self) -> Vec<String> {
        vec![
            "server".to_string(),
            "--ip".to_string(),
            self.ip.clone(),
            "--port".to_string(),
            self.port.to_string(),
        ]
    }
}

struct CliHooks {
    supervisor: ProcessSupervisor,
    args: Vec<String>,
}

impl ResourceHooks for CliHooks {
    fn opened(&mut self, working_copy: &Path) -> Result<(), HookError> {
        self.supervisor.start(working_copy, &self.args)?;
        Ok(())
    }

    fn closed(&mut self) -> Result<(), HookError> {
        self.supervisor.stop();
        Ok(())
    }
}

struct Session {
    cli: LockedResource<CliHooks>,
    launched: Option<Launch>,
    applied: Option<ServerConfig>,
}

impl Session {
    fn stop_cli(&mut self) {
        if self.launched.take().is_some() || self.cli.is_open() {
            tracing::info!("stopping CLI server");
            self.cli.close();
        }
    }

    fn cli_running(&self) -> bool {
        self.cli.is_open() && self.cli.hooks().supervisor.is_running()
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct ServerManager {
    session: Mutex<Session>,
    channel: EventChannel,
    bundled_cli: Mutex<Option<PathBuf>>,
    bootstrap: Mutex<BootstrapOptions>,
}

impl ServerManager {
    pub fn new(handlers: EventHandlers, options: ServerOptions) -> Self {
        let hooks = CliHooks {
            supervisor: ProcessSupervisor::new("cli").with_grace_period(options.grace_period),
            args: Vec::new(),
        };
        Self {
            session: Mutex::new(Session {
                cli: LockedResource::with_work_dir(hooks, options.work_dir),
                launched: None,
                applied: None,
            }),
            channel: EventChannel::new(handlers),
            bundled_cli: Mutex::new(options.bundled_cli),
            bootstrap: Mutex::new(options.bootstrap),
        }
    }

    pub fn set_bundled_cli(&self, path: Option<PathBuf>) {
        *self.bundled_cli.lock() = path;
    }

    pub fn bootstrap_options(&self) -> BootstrapOptions {
        self.bootstrap.lock().clone()
    }

    /// Replace the bootstrap options without telling the server.
    pub fn set_bootstrap_options(&self, options: BootstrapOptions) {
        *self.bootstrap.lock() = options;
    }

    // -- session ------------------------------------------------------------

    /// Start the CLI if the location needs one, connect and bootstrap.
    ///
    /// Connected with the same configuration is a no-op; connected with a
    /// different one reconnects from scratch.
    pub fn connect(&self, config: &ServerConfig) -> Result<(), ServerError> {
        let mut session = self.session.lock();
        if self.channel.is_connected() {
            if session.applied.as_ref() == Some(config) {
                return Ok(());
            }
            self.disconnect_session(&mut session);
        }

        if config.location.spawns_cli() {
            let launch = Launch {
                path: self.cli_path(config)?,
                ip: config.ip.clone(),
                port: config.port,
            };
            if session.launched.as_ref() == Some(&launch) && session.cli_running() {
                tracing::debug!(path = %launch.path.display(), "reusing running CLI server");
            } else {
                session.stop_cli();
                tracing::info!(path = %launch.path.display(), "starting CLI server");
                session.cli.hooks_mut().args = launch.args();
                session.cli.set_path(Some(launch.path.clone()));
                if !session.cli.open() {
                    return Err(ServerError::CliStart { path: launch.path });
                }
                session.launched = Some(launch);
            }
        } else {
            session.stop_cli();
        }

        tracing::info!(address = %config.address(), "connecting to server");
        if let Err(err) = self.channel.connect(&config.ip, config.port) {
            tracing::warn!(address = %config.address(), error = %err, "failed to connect");
            return Err(err.into());
        }

        let commands = bootstrap_commands(&self.bootstrap.lock());
        for command in &commands {
            if let Err(err) = self.channel.send(command) {
                tracing::warn!(command = command.name(), error = %err, "bootstrap failed");
                self.channel.disconnect();
                return Err(err.into());
            }
        }

        session.applied = Some(config.clone());
        tracing::info!(address = %config.address(), location = %config.location, "connected to server");
        Ok(())
    }

    /// Close the channel and stop any CLI this manager started.
    pub fn disconnect(&self) {
        let mut session = self.session.lock();
        self.disconnect_session(&mut session);
    }

    fn disconnect_session(&self, session: &mut Session) {
        let connected = self.channel.address().is_some();
        if !connected && session.launched.is_none() && !session.cli.is_open() {
            return;
        }
        tracing::info!("disconnecting from server");
        session.stop_cli();
        self.channel.disconnect();
        tracing::info!("disconnected from server");
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    pub fn current(&self) -> ServerCurrent {
        let session = self.session.lock();
        let connected = self.channel.is_connected();
        ServerCurrent {
            connected,
            applied: session.applied.clone(),
        }
    }

    /// Pid of the CLI server this manager started, if it is running.
    pub fn cli_pid(&self) -> Option<u32> {
        let session = self.session.lock();
        if session.cli_running() {
            session.cli.hooks().supervisor.pid()
        } else {
            None
        }
    }

    fn cli_path(&self, config: &ServerConfig) -> Result<PathBuf, ServerError> {
        match config.location {
            ServerLocation::CustomCli => config
                .custom_cli_path
                .clone()
                .ok_or(ServerError::MissingCustomCli),
            _ => Ok(resolve_bundled_cli(self.bundled_cli.lock().as_deref())),
        }
    }

    // -- commands -----------------------------------------------------------

    pub fn send(&self, command: &Command) -> Result<(), ServerError> {
        self.channel.send(command)?;
        Ok(())
    }

    pub fn build(&self, mode: BuildMode, target: BuildTarget) -> Result<(), ServerError> {
        self.send(&Command::Build { mode, target })
    }

    pub fn export(
        &self,
        directory: impl Into<String>,
        output: ExportOutput,
        target: impl Into<String>,
    ) -> Result<(), ServerError> {
        self.send(&Command::Export {
            directory: directory.into(),
            output,
            target: target.into(),
        })
    }

    pub fn run(&self) -> Result<(), ServerError> {
        self.send(&Command::Run)
    }

    /// Store the preference and, when connected, announce it and request
    /// incremental builds.
    pub fn update_build_on_change(&self, executable: bool) -> Result<(), ServerError> {
        let options = {
            let mut bootstrap = self.bootstrap.lock();
            bootstrap.build_executable_on_change = executable;
            bootstrap.clone()
        };
        if !self.is_connected() {
            return Ok(());
        }
        self.send(&Command::SetBuildOnChange {
            executable,
            library: true,
        })?;
        self.send_builds(BuildMode::Updates, &options)
    }

    /// Store the directory and, when connected, announce it and request
    /// incremental builds.
    pub fn update_project_directory(&self, directory: PathBuf) -> Result<(), ServerError> {
        let options = {
            let mut bootstrap = self.bootstrap.lock();
            bootstrap.project_directory = directory;
            bootstrap.clone()
        };
        if !self.is_connected() {
            return Ok(());
        }
        self.send(&Command::SetProjectDirectory {
            path: project_directory_arg(&options.project_directory),
        })?;
        self.send_builds(BuildMode::Updates, &options)
    }

    fn send_builds(&self, mode: BuildMode, options: &BootstrapOptions) -> Result<(), ServerError> {
        for command in build_commands(mode, options) {
            self.send(&command)?;
        }
        Ok(())
    }
}

impl Drop for ServerManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use shiba_protocol::ChannelError;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use tempfile::TempDir;

    fn read_frames(listener: &TcpListener, count: usize) -> Vec<Value> {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream);
        (0..count)
            .map(|_| {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                serde_json::from_str(&line).unwrap()
            })
            .collect()
    }

    fn external(port: u16) -> ServerConfig {
        ServerConfig {
            port,
            location: ServerLocation::External,
            ..ServerConfig::default()
        }
    }

    fn manager(work: &TempDir) -> ServerManager {
        ServerManager::new(
            EventHandlers::new(),
            ServerOptions {
                work_dir: work.path().to_path_buf(),
                ..ServerOptions::default()
            },
        )
    }

    #[test]
    fn bootstrap_announces_then_builds_everything() {
        let options = BootstrapOptions {
            project_directory: PathBuf::from("/does/not/exist"),
            build_executable_on_change: false,
        };
        let commands = bootstrap_commands(&options);
        assert_eq!(
            commands,
            vec![
                Command::SetBuildOnChange {
                    executable: false,
                    library: true
                },
                Command::SetProjectDirectory {
                    path: "/does/not/exist".to_string()
                },
                Command::Build {
                    mode: BuildMode::Full,
                    target: BuildTarget::Library
                },
                Command::Build {
                    mode: BuildMode::Full,
                    target: BuildTarget::Executable
                },
            ]
        );
    }

    #[test]
    fn incremental_builds_include_executable_only_when_rebuilt_on_change() {
        let mut options = BootstrapOptions::default();
        assert_eq!(build_commands(BuildMode::Updates, &options).len(), 1);
        options.build_executable_on_change = true;
        assert_eq!(build_commands(BuildMode::Updates, &options).len(), 2);
    }

    #[test]
    fn external_server_is_bootstrapped_in_order() {
        let work = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let manager = manager(&work);

        manager.connect(&external(port)).unwrap();
        let frames = read_frames(&listener, 4);
        let names: Vec<&str> = frames.iter().map(|f| f["command"].as_str().unwrap()).collect();
        assert_eq!(
            names,
            vec!["set-build-on-change", "set-project-directory", "build", "build"]
        );
        assert_eq!(frames[2]["mode"], "full");

        let current = manager.current();
        assert!(current.connected);
        assert_eq!(current.applied, Some(external(port)));
        assert!(manager.cli_pid().is_none());
    }

    #[test]
    fn refused_connect_leaves_state_untouched() {
        let work = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let manager = manager(&work);

        let err = manager.connect(&external(port)).unwrap_err();
        assert!(matches!(err, ServerError::Channel(ChannelError::Refused { .. })));
        assert_eq!(manager.current(), ServerCurrent::default());
    }

    #[test]
    fn failed_reconnect_keeps_last_applied_config() {
        let work = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let refused = {
            let spare = TcpListener::bind("127.0.0.1:0").unwrap();
            spare.local_addr().unwrap().port()
        };
        let manager = manager(&work);

        manager.connect(&external(port)).unwrap();
        read_frames(&listener, 4);
        assert!(manager.connect(&external(refused)).is_err());

        let current = manager.current();
        assert!(!current.connected);
        assert_eq!(current.applied, Some(external(port)));
        assert_eq!(current.port(), Some(port));

        // Asking for the old config again reconnects rather than no-ops.
        manager.connect(&external(port)).unwrap();
        assert_eq!(read_frames(&listener, 4).len(), 4);
        assert!(manager.is_connected());
    }

    #[test]
    fn custom_location_requires_a_path() {
        let work = TempDir::new().unwrap();
        let manager = manager(&work);
        let config = ServerConfig {
            location: ServerLocation::CustomCli,
            ..ServerConfig::default()
        };
        assert!(matches!(
            manager.connect(&config),
            Err(ServerError::MissingCustomCli)
        ));
    }

    #[test]
    fn missing_cli_fails_to_start() {
        let work = TempDir::new().unwrap();
        let manager = manager(&work);
        let config = ServerConfig {
            location: ServerLocation::CustomCli,
            custom_cli_path: Some(work.path().join("no-such-cli")),
            ..ServerConfig::default()
        };
        assert!(matches!(
            manager.connect(&config),
            Err(ServerError::CliStart { .. })
        ));
        assert!(!manager.is_connected());
    }

    #[test]
    fn commands_need_a_connection() {
        let work = TempDir::new().unwrap();
        let manager = manager(&work);
        assert!(manager.run().is_err());
        // Preferences are still recorded while disconnected.
        manager.update_build_on_change(true).unwrap();
        assert!(manager.bootstrap_options().build_executable_on_change);
    }

    #[test]
    fn update_project_directory_reannounces_and_rebuilds() {
        let work = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let manager = manager(&work);
        manager.connect(&external(port)).unwrap();

        manager
            .update_project_directory(PathBuf::from("/elsewhere"))
            .unwrap();
        let frames = read_frames(&listener, 6);
        assert_eq!(frames[4]["command"], "set-project-directory");
        assert_eq!(frames[4]["path"], "/elsewhere");
        assert_eq!(frames[5]["mode"], "updates");
        assert_eq!(frames[5]["target"], "library");
    }
}

//! State model for the reconciler.
//!
//! [`DesiredState`] is owned by the settings layer and edited freely.
//! [`CurrentState`] is a snapshot of what the managed resources actually
//! entered; it is produced by the reconciler, never edited by callers.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const DEFAULT_SERVER_IP: &str = "127.0.0.1";
pub const DEFAULT_SERVER_PORT: u16 = 5184;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Where the build server comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ServerLocation {
    /// The CLI shipped next to the host binary.
    #[default]
    BuiltInCli,
    /// A CLI executable chosen by the user.
    CustomCli,
    /// A server started by someone else; only the socket is managed.
    External,
}

impl ServerLocation {
    /// Whether a CLI process has to be launched before connecting.
    pub fn spawns_cli(self) -> bool {
        !matches!(self, ServerLocation::External)
    }
}

impl fmt::Display for ServerLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerLocation::BuiltInCli => write!(f, "built-in-cli"),
            ServerLocation::CustomCli => write!(f, "custom-cli"),
            ServerLocation::External => write!(f, "external"),
        }
    }
}

impl FromStr for ServerLocation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "built-in-cli" | "builtin" | "built-in" => Ok(ServerLocation::BuiltInCli),
            "custom-cli" | "custom" => Ok(ServerLocation::CustomCli),
            "external" => Ok(ServerLocation::External),
            other => Err(format!(
                "unknown server location '{other}'; expected: built-in-cli, custom-cli, external"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Server configuration
// ---------------------------------------------------------------------------

/// The part of the server settings that requires a full reconnect when it
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub ip: String,
    pub port: u16,
    pub location: ServerLocation,
    /// Only meaningful for [`ServerLocation::CustomCli`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_cli_path: Option<PathBuf>,
}

impl ServerConfig {
    /// `ip:port`, suitable for log lines and `TcpStream::connect`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: DEFAULT_SERVER_IP.to_string(),
            port: DEFAULT_SERVER_PORT,
            location: ServerLocation::default(),
            custom_cli_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Desired state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LibraryDesired {
    pub loaded: bool,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDesired {
    pub connected: bool,
    pub ip: String,
    pub port: u16,
    pub location: ServerLocation,
    pub custom_cli_path: Option<PathBuf>,
}

impl ServerDesired {
    /// Effective configuration: the custom CLI path only counts when the
    /// location actually uses it.
    pub fn config(&self) -> ServerConfig {
        ServerConfig {
            ip: self.ip.clone(),
            port: self.port,
            location: self.location,
            custom_cli_path: match self.location {
                ServerLocation::CustomCli => self.custom_cli_path.clone(),
                _ => None,
            },
        }
    }
}

impl Default for ServerDesired {
    fn default() -> Self {
        Self {
            connected: false,
            ip: DEFAULT_SERVER_IP.to_string(),
            port: DEFAULT_SERVER_PORT,
            location: ServerLocation::default(),
            custom_cli_path: None,
        }
    }
}

/// What the user wants in effect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    pub library: LibraryDesired,
    pub server: ServerDesired,
}

// ---------------------------------------------------------------------------
// Current state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LibraryCurrent {
    pub loaded: bool,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerCurrent {
    pub connected: bool,
    /// Last configuration that was fully applied (CLI started, socket
    /// connected, bootstrap sent). `None` until the first success, and
    /// kept across disconnects.
    pub applied: Option<ServerConfig>,
}

impl ServerCurrent {
    pub fn ip(&self) -> Option<&str> {
        self.applied.as_ref().map(|c| c.ip.as_str())
    }

    pub fn port(&self) -> Option<u16> {
        self.applied.as_ref().map(|c| c.port)
    }

    pub fn location(&self) -> Option<ServerLocation> {
        self.applied.as_ref().map(|c| c.location)
    }
}

/// What is actually in effect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CurrentState {
    pub library: LibraryCurrent,
    pub server: ServerCurrent,
}

impl CurrentState {
    /// True when every observable field agrees with `desired`.
    pub fn matches(&self, desired: &DesiredState) -> bool {
        let library = self.library.loaded == desired.library.loaded
            && self.library.path == desired.library.path;
        let server = self.server.connected == desired.server.connected
            && (!self.server.connected
                || self.server.applied.as_ref() == Some(&desired.server.config()));
        library && server
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("built-in-cli", ServerLocation::BuiltInCli)]
    #[case("BUILT_IN_CLI", ServerLocation::BuiltInCli)]
    #[case("custom-cli", ServerLocation::CustomCli)]
    #[case("custom", ServerLocation::CustomCli)]
    #[case("External", ServerLocation::External)]
    fn location_parses(#[case] input: &str, #[case] expected: ServerLocation) {
        assert_eq!(input.parse::<ServerLocation>().unwrap(), expected);
    }

    #[test]
    fn location_rejects_unknown() {
        let err = "cloud".parse::<ServerLocation>().unwrap_err();
        assert!(err.contains("cloud"));
    }

    #[test]
    fn location_display_matches_serde() {
        for location in [
            ServerLocation::BuiltInCli,
            ServerLocation::CustomCli,
            ServerLocation::External,
        ] {
            let yaml = serde_yaml::to_string(&location).expect("serialize");
            assert_eq!(yaml.trim(), location.to_string());
        }
    }

    #[test]
    fn custom_path_ignored_unless_custom_location() {
        let mut desired = ServerDesired {
            custom_cli_path: Some(PathBuf::from("/opt/cli")),
            ..ServerDesired::default()
        };
        assert_eq!(desired.config().custom_cli_path, None);

        desired.location = ServerLocation::CustomCli;
        assert_eq!(
            desired.config().custom_cli_path,
            Some(PathBuf::from("/opt/cli"))
        );
    }

    #[test]
    fn current_matches_desired() {
        let mut desired = DesiredState::default();
        let mut current = CurrentState::default();
        assert!(current.matches(&desired));

        desired.server.connected = true;
        assert!(!current.matches(&desired));

        current.server.connected = true;
        current.server.applied = Some(desired.server.config());
        assert!(current.matches(&desired));

        desired.server.port = 5185;
        assert!(!current.matches(&desired), "port change must count as divergence");
    }

    #[test]
    fn disconnected_server_ignores_stale_config() {
        let desired = DesiredState::default();
        let current = CurrentState {
            server: ServerCurrent {
                connected: false,
                applied: Some(ServerConfig {
                    port: 9999,
                    ..ServerConfig::default()
                }),
            },
            ..CurrentState::default()
        };
        assert!(current.matches(&desired));
    }
}

//! User-editable settings, persisted as YAML.
//!
//! # Storage layout
//!
//! ```text
//! ~/.shiba/
//!   settings.yaml   (mode 0600)
//! ```
//!
//! # API pattern
//!
//! Every function has two forms:
//! - `fn_at(home: &Path, …)` — explicit home; used in tests with `TempDir`
//! - `fn(…)` — derives home from `dirs::home_dir()`, delegates to `_at`

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{io_err, SettingsError};
use crate::paths::{settings_path, shiba_root};
use crate::types::{DesiredState, ServerLocation, DEFAULT_SERVER_IP, DEFAULT_SERVER_PORT};

// ---------------------------------------------------------------------------
// 1. Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub ip: String,
    pub port: u16,
    pub location: ServerLocation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_cli_path: Option<PathBuf>,
    /// Overrides where the built-in CLI is looked up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundled_cli_path: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            ip: DEFAULT_SERVER_IP.to_string(),
            port: DEFAULT_SERVER_PORT,
            location: ServerLocation::default(),
            custom_cli_path: None,
            bundled_cli_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSettings {
    pub directory: PathBuf,
    pub build_executable_on_change: bool,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            build_executable_on_change: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibrarySettings {
    /// Library to load before the server reports a freshly compiled one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    /// Lifetime of transient notifications (executable size, exports).
    pub duration_secs: u64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self { duration_secs: 5 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSettings {
    /// How often the host re-runs a pass while desired and current diverge.
    pub retry_interval_ms: u64,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            retry_interval_ms: 1000,
        }
    }
}

/// Root of `settings.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub project: ProjectSettings,
    pub library: LibrarySettings,
    pub notifications: NotificationSettings,
    pub reconcile: ReconcileSettings,
}

impl Settings {
    /// Copy the preferences into `desired`.
    ///
    /// `loaded` and `connected` are left alone; they belong to whoever
    /// activates the renderer. The custom CLI path is only taken when the
    /// location is [`ServerLocation::CustomCli`]. The library path only
    /// seeds a desired state that has none; afterwards the build server
    /// owns it.
    pub fn apply_to(&self, desired: &mut DesiredState) {
        desired.server.ip = self.server.ip.clone();
        desired.server.port = self.server.port;
        desired.server.location = self.server.location;
        if self.server.location == ServerLocation::CustomCli {
            desired.server.custom_cli_path = self.server.custom_cli_path.clone();
        }
        if desired.library.path.is_none() {
            desired.library.path = self.library.path.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// 2. Load
// ---------------------------------------------------------------------------

/// Load settings from an explicit file. A missing file yields defaults.
pub fn load_from(path: &Path) -> Result<Settings, SettingsError> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    if contents.trim().is_empty() {
        return Ok(Settings::default());
    }
    serde_yaml::from_str(&contents).map_err(|source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load `<home>/.shiba/settings.yaml`.
pub fn load_at(home: &Path) -> Result<Settings, SettingsError> {
    load_from(&settings_path(home))
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<Settings, SettingsError> {
    load_at(&home()?)
}

// ---------------------------------------------------------------------------
// 3. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically write settings to `path`.
///
/// Write flow: serialize → `.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_to(path: &Path, settings: &Settings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            set_dir_permissions(parent)?;
        }
    }
    let tmp_path = path.with_extension("yaml.tmp");
    let yaml = serde_yaml::to_string(settings)?;
    std::fs::write(&tmp_path, yaml).map_err(|e| io_err(&tmp_path, e))?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

pub fn save_at(home: &Path, settings: &Settings) -> Result<(), SettingsError> {
    let root = shiba_root(home);
    if !root.exists() {
        std::fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
        set_dir_permissions(&root)?;
    }
    save_to(&settings_path(home), settings)
}

/// `save_at` convenience wrapper.
pub fn save(settings: &Settings) -> Result<(), SettingsError> {
    save_at(&home()?, settings)
}

// ---------------------------------------------------------------------------
// 4. Init
// ---------------------------------------------------------------------------

/// Write default settings if none exist yet; returns what is on disk.
///
/// Idempotent: an existing file is loaded and returned unchanged.
pub fn init_at(home: &Path) -> Result<Settings, SettingsError> {
    let path = settings_path(home);
    if path.exists() {
        return load_from(&path);
    }
    let settings = Settings::default();
    save_at(home, &settings)?;
    Ok(settings)
}

/// `init_at` convenience wrapper.
pub fn init() -> Result<Settings, SettingsError> {
    init_at(&home()?)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, SettingsError> {
    dirs::home_dir().ok_or(SettingsError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), SettingsError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), SettingsError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), SettingsError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), SettingsError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

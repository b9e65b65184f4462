//! Shiba core library — state model, settings persistence, paths, errors.
//!
//! - [`types`] — desired/current state and server configuration
//! - [`settings`] — YAML settings file (load / save / init)
//! - [`paths`] — on-disk and temporary locations
//! - [`error`] — [`SettingsError`]

pub mod error;
pub mod paths;
pub mod settings;
pub mod types;

pub use error::SettingsError;
pub use settings::Settings;
pub use types::{
    CurrentState, DesiredState, LibraryCurrent, LibraryDesired, ServerConfig, ServerCurrent,
    ServerDesired, ServerLocation,
};

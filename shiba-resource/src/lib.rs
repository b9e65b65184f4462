//! # shiba-resource
//!
//! Resources that stay in use while the files behind them are rebuilt:
//! [`LockedResource`] keeps a private working copy of a file open, and
//! [`ProcessSupervisor`] owns a child process with a bounded shutdown.

pub mod error;
pub mod locked;
pub mod process;

pub use error::{HookError, ResourceError};
pub use locked::{LockedResource, ResourceHooks};
pub use process::{ProcessSupervisor, DRAIN_TIMEOUT, GRACE_PERIOD};

//! A file that stays in use while its source is rebuilt.
//!
//! Loaded libraries and running executables cannot be overwritten on some
//! platforms. [`LockedResource`] never opens the source itself: it copies it
//! to `<work_dir>/locked.<file name>` once and hands that copy to the
//! caller's [`ResourceHooks::opened`]. The copy is reused by later opens and
//! removed on close, so the source can be rebuilt at any time.
//!
//! Open-time failures (missing source, failing hooks) are logged and turned
//! into a `false` result; nothing is left open after a failure.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use shiba_core::paths::{working_copy_name, working_dir};

use crate::error::{io_err, HookError, ResourceError};

/// Side effects run when the working copy is attached or detached.
pub trait ResourceHooks: Send {
    fn opened(&mut self, working_copy: &Path) -> Result<(), HookError>;
    fn closed(&mut self) -> Result<(), HookError>;
}

pub struct LockedResource<H: ResourceHooks> {
    hooks: H,
    work_dir: PathBuf,
    source: Option<PathBuf>,
    /// `Some` while a working copy exists on disk.
    working_copy: Option<PathBuf>,
    should_be_open: bool,
    is_open: bool,
}

impl<H: ResourceHooks> LockedResource<H> {
    /// Resource whose working copies live in the shared per-add-on temp dir.
    pub fn new(hooks: H) -> Self {
        Self::with_work_dir(hooks, working_dir())
    }

    pub fn with_work_dir(hooks: H, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            hooks,
            work_dir: work_dir.into(),
            source: None,
            working_copy: None,
            should_be_open: false,
            is_open: false,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn has_copy(&self) -> bool {
        self.working_copy.is_some()
    }

    pub fn working_copy_path(&self) -> Option<&Path> {
        self.working_copy.as_deref()
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    /// Record a new source and swap to it if the resource should be open.
    pub fn set_path(&mut self, path: Option<PathBuf>) -> bool {
        self.source = path;
        self.reload()
    }

    /// Close then reopen when the intent is "open"; otherwise a no-op.
    pub fn reload(&mut self) -> bool {
        if !self.should_be_open {
            return true;
        }
        if !self.close_inner() {
            return false;
        }
        self.open_inner()
    }

    pub fn open(&mut self) -> bool {
        self.should_be_open = true;
        self.open_inner()
    }

    pub fn close(&mut self) -> bool {
        self.should_be_open = false;
        self.close_inner()
    }

    fn open_inner(&mut self) -> bool {
        if self.is_open {
            return true;
        }
        let Some(source) = self.source.clone() else {
            tracing::debug!("no path set, nothing to open");
            return false;
        };

        let copy = match self.working_copy.clone() {
            Some(copy) => copy,
            None => match self.copy_source(&source) {
                Ok(copy) => {
                    self.working_copy = Some(copy.clone());
                    copy
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to copy locked file");
                    return false;
                }
            },
        };

        if let Err(err) = self.hooks.opened(&copy) {
            tracing::warn!(path = %source.display(), error = %err, "failed to open locked file");
            self.discard_copy();
            return false;
        }

        self.is_open = true;
        true
    }

    fn close_inner(&mut self) -> bool {
        if self.working_copy.is_none() {
            return true;
        }

        if self.is_open {
            if let Err(err) = self.hooks.closed() {
                tracing::warn!(error = %err, "failed to close locked file");
                return false;
            }
            self.is_open = false;
        }

        self.discard_copy();
        true
    }

    fn copy_source(&self, source: &Path) -> Result<PathBuf, ResourceError> {
        if !source.exists() {
            return Err(ResourceError::MissingSource {
                path: source.to_path_buf(),
            });
        }
        let name = working_copy_name(source).ok_or_else(|| ResourceError::NoFileName {
            path: source.to_path_buf(),
        })?;
        if !self.work_dir.exists() {
            fs::create_dir_all(&self.work_dir).map_err(|e| io_err(&self.work_dir, e))?;
        }
        let copy = self.work_dir.join(name);
        fs::copy(source, &copy).map_err(|e| io_err(&copy, e))?;
        tracing::debug!(from = %source.display(), to = %copy.display(), "working copy created");
        Ok(copy)
    }

    fn discard_copy(&mut self) {
        let Some(copy) = self.working_copy.take() else {
            return;
        };
        match fs::remove_file(&copy) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            // Still mapped by the OS right after an unload; left for the next copy to overwrite.
            Err(err) if is_still_in_use(&err) => {}
            Err(err) => {
                tracing::warn!(path = %copy.display(), error = %err, "failed to remove working copy");
            }
        }
    }
}

impl<H: ResourceHooks> Drop for LockedResource<H> {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_still_in_use(err: &std::io::Error) -> bool {
    if err.kind() == ErrorKind::PermissionDenied {
        return true;
    }
    // ERROR_SHARING_VIOLATION
    cfg!(windows) && err.raw_os_error() == Some(32)
}

//! # shiba-instrumentation
//!
//! Keeps a hot-reloaded rendering library and a build server session in
//! line with what the user asked for.
//!
//! - [`library`] / [`ffi`]: the loaded rendering library and its C ABI
//! - [`server`]: CLI process, event channel and bootstrap
//! - [`reconciler`]: desired → current state passes
//! - [`handlers`]: reactions to server events
//! - [`build_spans`], [`notifications`], [`observers`], [`uniforms`]:
//!   state shown to the user
//!
//! [`Instrumentation`] wires them together.

pub mod build_spans;
pub mod error;
pub mod ffi;
pub mod handlers;
pub mod library;
pub mod notifications;
pub mod observers;
pub mod reconciler;
pub mod server;
pub mod uniforms;

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use shiba_core::paths::working_dir;
use shiba_core::{CurrentState, DesiredState, Settings};
use shiba_resource::GRACE_PERIOD;

pub use build_spans::BuildSpans;
pub use error::{LibraryError, ReconcileError, ServerError};
pub use ffi::{DylibLoader, ObjectInstance};
pub use library::{LibraryLoader, LibraryManager, RenderLibrary};
pub use notifications::{Notification, NotificationId, Notifications};
pub use observers::{Observers, Subscription};
pub use reconciler::{DesiredUpdate, LibraryControl, ReconcileStatus, Reconciler, ServerControl};
pub use server::{BootstrapOptions, ServerManager, ServerOptions};
pub use uniforms::{ContextValues, ControlValues, UniformAnnotation, UniformValue, Uniforms};

use handlers::{default_handlers, HandlerContext};

/// The reconciler over the real managers.
pub type Engine = Reconciler<LibraryManager, ServerManager>;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct InstrumentationOptions {
    pub work_dir: PathBuf,
    pub bundled_cli: Option<PathBuf>,
    pub grace_period: Duration,
    pub bootstrap: BootstrapOptions,
    pub notification_lifetime: Duration,
    /// Initial desired state; `loaded`/`connected` are normally switched on
    /// later by the caller.
    pub desired: DesiredState,
}

impl Default for InstrumentationOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl InstrumentationOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let mut desired = DesiredState::default();
        settings.apply_to(&mut desired);
        Self {
            work_dir: working_dir(),
            bundled_cli: settings.server.bundled_cli_path.clone(),
            grace_period: GRACE_PERIOD,
            bootstrap: BootstrapOptions {
                project_directory: settings.project.directory.clone(),
                build_executable_on_change: settings.project.build_executable_on_change,
            },
            notification_lifetime: Duration::from_secs(settings.notifications.duration_secs),
            desired,
        }
    }
}

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

pub struct Instrumentation {
    engine: Arc<Engine>,
    notifications: Arc<Notifications>,
    spans: Arc<BuildSpans>,
    uniforms: Arc<Uniforms>,
    redraw: Observers,
    _library_redraw: Subscription,
}

impl Instrumentation {
    /// Instrumentation loading real dynamic libraries.
    pub fn new(options: InstrumentationOptions) -> Self {
        Self::with_loader(DylibLoader, options)
    }

    pub fn with_loader(loader: impl LibraryLoader + 'static, options: InstrumentationOptions) -> Self {
        let redraw = Observers::new();
        let notifications = Arc::new(Notifications::new(
            options.notification_lifetime,
            redraw.clone(),
        ));
        let spans = Arc::new(BuildSpans::new(notifications.clone()));
        let uniforms = Arc::new(Uniforms::new(redraw.clone()));
        let library = Arc::new(LibraryManager::with_work_dir(loader, options.work_dir.clone()));
        let library_redraw = {
            let redraw = redraw.clone();
            library.on_change(move || redraw.notify())
        };

        let engine = Arc::new_cyclic(|engine: &Weak<Engine>| {
            let handlers = default_handlers(HandlerContext {
                engine: engine.clone(),
                library: library.clone(),
                spans: spans.clone(),
                notifications: notifications.clone(),
                uniforms: uniforms.clone(),
            });
            let server = ServerManager::new(
                handlers,
                ServerOptions {
                    work_dir: options.work_dir.clone(),
                    bundled_cli: options.bundled_cli.clone(),
                    grace_period: options.grace_period,
                    bootstrap: options.bootstrap.clone(),
                },
            );
            Reconciler::new(library, Arc::new(server), options.desired.clone())
        });

        Self {
            engine,
            notifications,
            spans,
            uniforms,
            redraw,
            _library_redraw: library_redraw,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn library(&self) -> &Arc<LibraryManager> {
        self.engine.library()
    }

    pub fn server(&self) -> &Arc<ServerManager> {
        self.engine.server()
    }

    pub fn notifications(&self) -> &Arc<Notifications> {
        &self.notifications
    }

    pub fn spans(&self) -> &Arc<BuildSpans> {
        &self.spans
    }

    pub fn uniforms(&self) -> &Arc<Uniforms> {
        &self.uniforms
    }

    /// Fired when anything visible changed: notifications, the loaded
    /// library, uniform descriptors.
    pub fn redraw(&self) -> &Observers {
        &self.redraw
    }

    pub fn desired(&self) -> DesiredState {
        self.engine.desired()
    }

    pub fn current(&self) -> CurrentState {
        self.engine.current()
    }

    pub fn reconcile(&self) -> Result<(), ReconcileError> {
        self.engine.reconcile()
    }

    pub fn apply<F>(&self, mutate: F) -> Result<(), ReconcileError>
    where
        F: FnOnce(&mut DesiredState),
    {
        self.engine.apply(mutate)
    }

    /// Re-read user preferences. Bootstrap preferences are announced to a
    /// connected server right away; connection preferences go through a
    /// reconciliation pass.
    pub fn apply_settings(&self, settings: &Settings) -> Result<(), ReconcileError> {
        if self.engine.is_exiting() {
            tracing::debug!("exiting, settings change ignored");
            return Ok(());
        }

        self.notifications
            .set_default_lifetime(Duration::from_secs(settings.notifications.duration_secs));

        let server = self.engine.server();
        server.set_bundled_cli(settings.server.bundled_cli_path.clone());
        let bootstrap = server.bootstrap_options();
        if bootstrap.build_executable_on_change != settings.project.build_executable_on_change {
            if let Err(err) =
                server.update_build_on_change(settings.project.build_executable_on_change)
            {
                tracing::warn!(error = %err, "failed to announce build-on-change");
            }
        }
        if bootstrap.project_directory != settings.project.directory {
            if let Err(err) = server.update_project_directory(settings.project.directory.clone()) {
                tracing::warn!(error = %err, "failed to announce project directory");
            }
        }

        self.engine.apply_settings(settings)
    }

    /// Exit hook: unload the library, disconnect, and ignore later settings.
    pub fn shutdown(&self) -> Result<(), ReconcileError> {
        self.engine.shutdown()
    }

    /// Guard that runs [`Instrumentation::shutdown`] when dropped.
    pub fn exit_guard(&self) -> ExitGuard {
        ExitGuard {
            engine: self.engine.clone(),
        }
    }
}

/// Tears the engine down when dropped, even if the owner is unwinding.
#[must_use = "the engine is torn down when the guard is dropped"]
pub struct ExitGuard {
    engine: Arc<Engine>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if let Err(err) = self.engine.shutdown() {
            tracing::warn!(error = %err, "teardown failed");
        }
    }
}

//! Drives [`CurrentState`] toward [`DesiredState`].
//!
//! A pass resolves the server first, then the library, and stops at the
//! first failure. Each manager only reports a transition once it fully
//! succeeded, so a failed pass leaves current state at its last known good
//! value. Passes are serialised; edits to desired state are not, and the
//! last write wins at the next pass.

use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use shiba_core::{
    CurrentState, DesiredState, LibraryCurrent, ServerConfig, ServerCurrent, Settings,
};

use crate::error::{ReconcileError, ServerError};
use crate::library::LibraryManager;
use crate::server::ServerManager;

// ---------------------------------------------------------------------------
// Managed resources
// ---------------------------------------------------------------------------

pub trait LibraryControl: Send + Sync {
    fn current(&self) -> LibraryCurrent;
    fn set_path(&self, path: Option<PathBuf>) -> bool;
    fn load(&self) -> bool;
    fn unload(&self) -> bool;
}

pub trait ServerControl: Send + Sync {
    fn current(&self) -> ServerCurrent;
    fn connect(&self, config: &ServerConfig) -> Result<(), ServerError>;
    fn disconnect(&self);
}

impl LibraryControl for LibraryManager {
    fn current(&self) -> LibraryCurrent {
        LibraryManager::current(self)
    }

    fn set_path(&self, path: Option<PathBuf>) -> bool {
        LibraryManager::set_path(self, path)
    }

    fn load(&self) -> bool {
        LibraryManager::load(self)
    }

    fn unload(&self) -> bool {
        LibraryManager::unload(self)
    }
}

impl ServerControl for ServerManager {
    fn current(&self) -> ServerCurrent {
        ServerManager::current(self)
    }

    fn connect(&self, config: &ServerConfig) -> Result<(), ServerError> {
        ServerManager::connect(self, config)
    }

    fn disconnect(&self) {
        ServerManager::disconnect(self)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileStatus {
    pub passes: u64,
    pub converged: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct Reconciler<L, S> {
    library: Arc<L>,
    server: Arc<S>,
    desired: RwLock<DesiredState>,
    pass: Mutex<()>,
    exiting: AtomicBool,
    status: Mutex<ReconcileStatus>,
}

impl<L: LibraryControl, S: ServerControl> Reconciler<L, S> {
    pub fn new(library: Arc<L>, server: Arc<S>, desired: DesiredState) -> Self {
        Self {
            library,
            server,
            desired: RwLock::new(desired),
            pass: Mutex::new(()),
            exiting: AtomicBool::new(false),
            status: Mutex::new(ReconcileStatus::default()),
        }
    }

    pub fn library(&self) -> &Arc<L> {
        &self.library
    }

    pub fn server(&self) -> &Arc<S> {
        &self.server
    }

    pub fn desired(&self) -> DesiredState {
        self.desired.read().clone()
    }

    pub fn current(&self) -> CurrentState {
        CurrentState {
            library: self.library.current(),
            server: self.server.current(),
        }
    }

    pub fn status(&self) -> ReconcileStatus {
        self.status.lock().clone()
    }

    pub fn is_converged(&self) -> bool {
        self.current().matches(&self.desired.read())
    }

    // -- mutation -----------------------------------------------------------

    /// Mutate desired state, then run exactly one pass.
    pub fn apply<F>(&self, mutate: F) -> Result<(), ReconcileError>
    where
        F: FnOnce(&mut DesiredState),
    {
        mutate(&mut self.desired.write());
        self.reconcile()
    }

    /// Edit a copy of desired state; it is written back and reconciled on
    /// [`DesiredUpdate::commit`] or when the guard is dropped.
    pub fn begin_update(&self) -> DesiredUpdate<'_, L, S> {
        DesiredUpdate {
            draft: self.desired(),
            reconciler: self,
            committed: false,
        }
    }

    /// Mutate desired state now and reconcile on a background thread.
    ///
    /// Event handlers run on the channel's reader thread, which a pass may
    /// need to join.
    pub fn schedule<F>(self: &Arc<Self>, mutate: F)
    where
        F: FnOnce(&mut DesiredState),
        L: 'static,
        S: 'static,
    {
        mutate(&mut self.desired.write());
        let this = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("shiba-reconcile".to_string())
            .spawn(move || {
                let _ = this.reconcile();
            });
        if let Err(err) = spawned {
            tracing::warn!(error = %err, "failed to spawn reconcile thread");
        }
    }

    /// Map user preferences onto desired state and reconcile. Ignored once
    /// the exit hook has run.
    pub fn apply_settings(&self, settings: &Settings) -> Result<(), ReconcileError> {
        if self.is_exiting() {
            tracing::debug!("exiting, settings change ignored");
            return Ok(());
        }
        self.apply(|desired| settings.apply_to(desired))
    }

    pub fn set_exiting(&self) {
        self.exiting.store(true, Ordering::SeqCst);
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    /// Exit hook: unload the library and disconnect the server.
    pub fn shutdown(&self) -> Result<(), ReconcileError> {
        self.set_exiting();
        tracing::info!("tearing down");
        self.apply(|desired| {
            desired.library.loaded = false;
            desired.server.connected = false;
        })
    }

    // -- pass ---------------------------------------------------------------

    /// One reconciliation pass.
    pub fn reconcile(&self) -> Result<(), ReconcileError> {
        let _pass = self.pass.lock();
        let desired = self.desired();

        let result = self
            .match_server(&desired)
            .and_then(|()| self.match_library(&desired));

        let converged = self.current().matches(&desired);
        let mut status = self.status.lock();
        status.passes += 1;
        match &result {
            Ok(()) => {
                status.last_success = Some(Utc::now());
                status.converged = converged;
                if converged {
                    tracing::debug!("states match");
                } else {
                    tracing::debug!("waiting for a library path");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to match states");
                status.last_failure = Some(Utc::now());
                status.last_error = Some(err.to_string());
                status.converged = false;
            }
        }
        result
    }

    fn match_server(&self, desired: &DesiredState) -> Result<(), ReconcileError> {
        let wanted = &desired.server;
        let config = wanted.config();
        let current = self.server.current();

        if current.connected
            && (!wanted.connected || current.applied.as_ref() != Some(&config))
        {
            self.server.disconnect();
        }

        if wanted.connected {
            if !self.server.current().connected {
                self.server.connect(&config)?;
            }
        } else {
            // Also reaps a CLI left running by a failed connect.
            self.server.disconnect();
        }
        Ok(())
    }

    fn match_library(&self, desired: &DesiredState) -> Result<(), ReconcileError> {
        let wanted = &desired.library;

        if !wanted.loaded && self.library.current().loaded && !self.library.unload() {
            return Err(ReconcileError::LibraryUnload);
        }

        if self.library.current().path != wanted.path
            && !self.library.set_path(wanted.path.clone())
        {
            return Err(ReconcileError::LibraryLoad {
                path: wanted.path.clone().unwrap_or_default(),
            });
        }

        if wanted.loaded && !self.library.current().loaded {
            if let Some(path) = &wanted.path {
                if !self.library.load() {
                    return Err(ReconcileError::LibraryLoad { path: path.clone() });
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scoped update
// ---------------------------------------------------------------------------

pub struct DesiredUpdate<'a, L: LibraryControl, S: ServerControl> {
    draft: DesiredState,
    reconciler: &'a Reconciler<L, S>,
    committed: bool,
}

impl<L: LibraryControl, S: ServerControl> DesiredUpdate<'_, L, S> {
    pub fn commit(mut self) -> Result<(), ReconcileError> {
        self.commit_inner()
    }

    fn commit_inner(&mut self) -> Result<(), ReconcileError> {
        self.committed = true;
        let draft = std::mem::take(&mut self.draft);
        self.reconciler.apply(|desired| *desired = draft)
    }
}

impl<L: LibraryControl, S: ServerControl> Deref for DesiredUpdate<'_, L, S> {
    type Target = DesiredState;

    fn deref(&self) -> &DesiredState {
        &self.draft
    }
}

impl<L: LibraryControl, S: ServerControl> DerefMut for DesiredUpdate<'_, L, S> {
    fn deref_mut(&mut self) -> &mut DesiredState {
        &mut self.draft
    }
}

impl<L: LibraryControl, S: ServerControl> Drop for DesiredUpdate<'_, L, S> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.commit_inner();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use shiba_core::ServerLocation;
    use shiba_protocol::ChannelError;
    use std::path::Path;

    #[derive(Default)]
    struct FakeLibrary {
        state: Mutex<LibraryCurrent>,
        fail_load: AtomicBool,
        log: Mutex<Vec<String>>,
    }

    impl LibraryControl for FakeLibrary {
        fn current(&self) -> LibraryCurrent {
            self.state.lock().clone()
        }

        fn set_path(&self, path: Option<PathBuf>) -> bool {
            self.log.lock().push(format!("set_path {path:?}"));
            self.state.lock().path = path;
            true
        }

        fn load(&self) -> bool {
            if self.fail_load.load(Ordering::SeqCst) {
                return false;
            }
            self.log.lock().push("load".to_string());
            self.state.lock().loaded = true;
            true
        }

        fn unload(&self) -> bool {
            self.log.lock().push("unload".to_string());
            self.state.lock().loaded = false;
            true
        }
    }

    #[derive(Default)]
    struct FakeServer {
        state: Mutex<ServerCurrent>,
        refuse: AtomicBool,
        log: Mutex<Vec<String>>,
    }

    impl ServerControl for FakeServer {
        fn current(&self) -> ServerCurrent {
            self.state.lock().clone()
        }

        fn connect(&self, config: &ServerConfig) -> Result<(), ServerError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(ChannelError::Refused {
                    address: config.address(),
                }
                .into());
            }
            self.log.lock().push(format!("connect {}", config.port));
            *self.state.lock() = ServerCurrent {
                connected: true,
                applied: Some(config.clone()),
            };
            Ok(())
        }

        fn disconnect(&self) {
            let mut state = self.state.lock();
            if state.connected {
                self.log.lock().push("disconnect".to_string());
            }
            state.connected = false;
        }
    }

    type Fixture = Reconciler<FakeLibrary, FakeServer>;

    fn reconciler() -> Fixture {
        Reconciler::new(
            Arc::new(FakeLibrary::default()),
            Arc::new(FakeServer::default()),
            DesiredState::default(),
        )
    }

    fn connect_to(port: u16) -> impl FnOnce(&mut DesiredState) {
        move |desired| {
            desired.server.connected = true;
            desired.server.port = port;
            desired.server.location = ServerLocation::External;
        }
    }

    #[test]
    fn converges_on_library_then_server() {
        let r = reconciler();
        r.apply(|d| {
            d.library.loaded = true;
            d.library.path = Some(PathBuf::from("/build/lib.so"));
        })
        .unwrap();
        assert!(r.current().library.loaded);
        assert!(!r.current().server.connected);

        r.apply(connect_to(5184)).unwrap();
        assert!(r.is_converged());
        assert_eq!(r.current().server.port(), Some(5184));
        assert!(r.status().converged);
    }

    #[test]
    fn failed_connect_leaves_current_state_unchanged() {
        let r = reconciler();
        r.apply(connect_to(5184)).unwrap();

        r.server().refuse.store(true, Ordering::SeqCst);
        let err = r.apply(connect_to(5185)).unwrap_err();
        assert!(matches!(err, ReconcileError::Server(_)));

        // The old session was torn down but is still the last one applied.
        let after = r.current().server;
        assert!(!after.connected);
        assert_eq!(after.port(), Some(5184));
        assert_eq!(after.location(), Some(ServerLocation::External));

        let status = r.status();
        assert!(status.last_error.unwrap().contains("5185"));
        assert!(!status.converged);
    }

    #[test]
    fn refused_first_connect_keeps_default_state() {
        let r = reconciler();
        r.server().refuse.store(true, Ordering::SeqCst);
        assert!(r.apply(connect_to(5184)).is_err());
        assert_eq!(r.current(), CurrentState::default());
    }

    #[test]
    fn failure_short_circuits_the_library() {
        let r = reconciler();
        r.server().refuse.store(true, Ordering::SeqCst);
        let result = r.apply(|d| {
            connect_to(5184)(d);
            d.library.loaded = true;
            d.library.path = Some(PathBuf::from("/build/lib.so"));
        });
        assert!(result.is_err());
        assert!(r.library().log.lock().is_empty());
    }

    #[test]
    fn port_change_reconnects_from_scratch() {
        let r = reconciler();
        r.apply(connect_to(5184)).unwrap();
        r.apply(|d| d.server.port = 5185).unwrap();
        assert_eq!(
            *r.server().log.lock(),
            vec!["connect 5184", "disconnect", "connect 5185"]
        );
    }

    #[test]
    fn unchanged_config_does_not_reconnect() {
        let r = reconciler();
        r.apply(connect_to(5184)).unwrap();
        r.reconcile().unwrap();
        r.apply(|d| d.server.custom_cli_path = Some(PathBuf::from("/opt/cli")))
            .unwrap();
        assert_eq!(*r.server().log.lock(), vec!["connect 5184"]);
    }

    #[test]
    fn loaded_without_path_waits_quietly() {
        let r = reconciler();
        r.apply(|d| d.library.loaded = true).unwrap();
        assert!(!r.current().library.loaded);
        assert!(!r.status().converged);

        r.apply(|d| d.library.path = Some(PathBuf::from("/build/lib.so")))
            .unwrap();
        assert!(r.current().library.loaded);
        assert!(r.status().converged);
    }

    #[test]
    fn failed_load_is_reported() {
        let r = reconciler();
        r.library().fail_load.store(true, Ordering::SeqCst);
        let err = r
            .apply(|d| {
                d.library.loaded = true;
                d.library.path = Some(PathBuf::from("/build/lib.so"));
            })
            .unwrap_err();
        match err {
            ReconcileError::LibraryLoad { path } => assert_eq!(path, Path::new("/build/lib.so")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unload_happens_before_retargeting() {
        let r = reconciler();
        r.apply(|d| {
            d.library.loaded = true;
            d.library.path = Some(PathBuf::from("/a.so"));
        })
        .unwrap();
        r.apply(|d| {
            d.library.loaded = false;
            d.library.path = Some(PathBuf::from("/b.so"));
        })
        .unwrap();
        let log = r.library().log.lock().clone();
        assert_eq!(&log[log.len() - 2..], ["unload", "set_path Some(\"/b.so\")"]);
    }

    #[test]
    fn dropped_update_guard_commits() {
        let r = reconciler();
        {
            let mut update = r.begin_update();
            update.server.connected = true;
            update.server.location = ServerLocation::External;
        }
        assert!(r.current().server.connected);

        let mut update = r.begin_update();
        update.server.connected = false;
        update.commit().unwrap();
        assert!(!r.current().server.connected);
        assert_eq!(r.status().passes, 2);
    }

    #[test]
    fn shutdown_tears_down_and_ignores_later_settings() {
        let r = reconciler();
        r.apply(|d| {
            connect_to(5184)(d);
            d.library.loaded = true;
            d.library.path = Some(PathBuf::from("/a.so"));
        })
        .unwrap();

        r.shutdown().unwrap();
        assert!(r.is_exiting());
        assert!(!r.current().server.connected);
        assert!(!r.current().library.loaded);

        let mut settings = Settings::default();
        settings.server.port = 6000;
        r.apply_settings(&settings).unwrap();
        assert_eq!(r.desired().server.port, 5184);
    }

    #[test]
    fn scheduled_change_reconciles_in_background() {
        let r = Arc::new(reconciler());
        r.schedule(|d| d.library.path = Some(PathBuf::from("/c.so")));
        assert_eq!(r.desired().library.path, Some(PathBuf::from("/c.so")));

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while r.current().library.path.is_none() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(r.current().library.path, Some(PathBuf::from("/c.so")));
    }
}

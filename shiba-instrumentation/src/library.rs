//! The hot-swappable rendering library.
//!
//! [`LibraryManager`] keeps the library behind a [`LockedResource`], so the
//! build server can overwrite the compiled file while a copy of it stays
//! loaded. Updates pushed while no library is loaded (shader programs,
//! uniform values, object instances) are kept and replayed into every newly
//! loaded instance. Render and update calls are no-ops while unloaded.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use shiba_core::LibraryCurrent;
use shiba_protocol::ShaderSource;
use shiba_resource::{HookError, LockedResource, ResourceHooks};

use crate::error::LibraryError;
use crate::ffi::ObjectInstance;
use crate::observers::{Observers, Subscription};
use crate::uniforms::UniformValue;

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Entry points of a loaded rendering library.
pub trait RenderLibrary: Send {
    fn ensure_is_initialized(&mut self, width: u32, height: u32);
    fn update(&mut self, width: u32, height: u32, is_preview: bool);
    /// Render into `frame`, one RGBA pixel per entry, `width * height` long.
    fn render(&mut self, width: u32, height: u32, is_preview: bool, frame: &mut [[f32; 4]]);
    fn viewport_ensure_is_initialized(&mut self, width: u32, height: u32);
    fn viewport_update(&mut self, width: u32, height: u32);
    fn viewport_render(&mut self, width: u32, height: u32);
    fn update_programs(&mut self, programs: &[ShaderSource]);
    fn set_uniform_values(&mut self, values: &[UniformValue]);
    /// Optional entry point; libraries without it ignore instances.
    fn set_object_instances(&mut self, _instances: &[ObjectInstance]) {}
}

/// Turns a file on disk into a [`RenderLibrary`].
pub trait LibraryLoader: Send {
    fn load(&mut self, path: &Path) -> Result<Box<dyn RenderLibrary>, LibraryError>;
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Loaded {
    instance: Option<Box<dyn RenderLibrary>>,
    programs: Option<Vec<ShaderSource>>,
    /// Programs still to be pushed into the final-render pass.
    render_programs_pending: bool,
    /// Programs still to be pushed into the viewport pass.
    viewport_programs_pending: bool,
    uniform_values: Option<Vec<UniformValue>>,
    object_instances: Option<Vec<ObjectInstance>>,
}

impl Loaded {
    fn mark_programs_pending(&mut self) {
        let pending = self.programs.is_some();
        self.render_programs_pending = pending;
        self.viewport_programs_pending = pending;
    }
}

struct LibraryHooks {
    loader: Box<dyn LibraryLoader>,
    loaded: Arc<Mutex<Loaded>>,
    changed: Observers,
}

impl ResourceHooks for LibraryHooks {
    fn opened(&mut self, working_copy: &Path) -> Result<(), HookError> {
        tracing::info!(path = %working_copy.display(), "loading library");
        let mut instance = self.loader.load(working_copy)?;
        {
            let mut loaded = self.loaded.lock();
            if let Some(values) = &loaded.uniform_values {
                instance.set_uniform_values(values);
            }
            if let Some(instances) = &loaded.object_instances {
                instance.set_object_instances(instances);
            }
            loaded.mark_programs_pending();
            loaded.instance = Some(instance);
        }
        tracing::info!("library loaded");
        self.changed.notify();
        Ok(())
    }

    fn closed(&mut self) -> Result<(), HookError> {
        tracing::info!("unloading library");
        let instance = self.loaded.lock().instance.take();
        drop(instance);
        tracing::info!("library unloaded");
        self.changed.notify();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct LibraryManager {
    resource: Mutex<LockedResource<LibraryHooks>>,
    loaded: Arc<Mutex<Loaded>>,
    changed: Observers,
    search_dirs: Mutex<Vec<PathBuf>>,
}

impl LibraryManager {
    pub fn new(loader: impl LibraryLoader + 'static) -> Self {
        Self::with_work_dir(loader, shiba_core::paths::working_dir())
    }

    pub fn with_work_dir(loader: impl LibraryLoader + 'static, work_dir: impl Into<PathBuf>) -> Self {
        let loaded = Arc::new(Mutex::new(Loaded::default()));
        let changed = Observers::new();
        let hooks = LibraryHooks {
            loader: Box::new(loader),
            loaded: loaded.clone(),
            changed: changed.clone(),
        };
        Self {
            resource: Mutex::new(LockedResource::with_work_dir(hooks, work_dir)),
            loaded,
            changed,
            search_dirs: Mutex::new(Vec::new()),
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Point at a new library file; swaps immediately if one is loaded.
    pub fn set_path(&self, path: Option<PathBuf>) -> bool {
        if let Some(dir) = path.as_deref().and_then(Path::parent) {
            self.register_search_dir(dir);
        }
        self.resource.lock().set_path(path)
    }

    pub fn load(&self) -> bool {
        self.resource.lock().open()
    }

    pub fn unload(&self) -> bool {
        self.resource.lock().close()
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.resource.lock().path().map(Path::to_path_buf)
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.lock().instance.is_some()
    }

    pub fn current(&self) -> LibraryCurrent {
        let resource = self.resource.lock();
        LibraryCurrent {
            loaded: resource.is_open(),
            path: resource.path().map(Path::to_path_buf),
        }
    }

    /// Called after every load and unload.
    pub fn on_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.changed.subscribe(callback)
    }

    // -- pending updates ----------------------------------------------------

    pub fn set_shader_programs(&self, programs: Vec<ShaderSource>) {
        let mut loaded = self.loaded.lock();
        loaded.programs = Some(programs);
        loaded.mark_programs_pending();
    }

    pub fn set_uniform_values(&self, values: Vec<UniformValue>) {
        let mut loaded = self.loaded.lock();
        let loaded = &mut *loaded;
        if let Some(instance) = loaded.instance.as_mut() {
            instance.set_uniform_values(&values);
        }
        loaded.uniform_values = Some(values);
    }

    pub fn set_object_instances(&self, instances: Vec<ObjectInstance>) {
        let mut loaded = self.loaded.lock();
        let loaded = &mut *loaded;
        if let Some(instance) = loaded.instance.as_mut() {
            instance.set_object_instances(&instances);
        }
        loaded.object_instances = Some(instances);
    }

    // -- final render pass --------------------------------------------------

    pub fn update(&self, width: u32, height: u32, is_preview: bool) {
        if let Some(instance) = self.loaded.lock().instance.as_mut() {
            instance.update(width, height, is_preview);
        }
    }

    /// `None` while no library is loaded.
    pub fn render(&self, width: u32, height: u32, is_preview: bool) -> Option<Vec<[f32; 4]>> {
        let mut loaded = self.loaded.lock();
        let loaded = &mut *loaded;
        let instance = loaded.instance.as_mut()?;

        instance.ensure_is_initialized(width, height);
        if loaded.render_programs_pending {
            if let Some(programs) = &loaded.programs {
                instance.update_programs(programs);
            }
            loaded.render_programs_pending = false;
        }

        let mut frame = vec![[0.0; 4]; width as usize * height as usize];
        instance.render(width, height, is_preview, &mut frame);
        Some(frame)
    }

    // -- viewport pass ------------------------------------------------------

    pub fn viewport_update(&self, width: u32, height: u32) {
        if let Some(instance) = self.loaded.lock().instance.as_mut() {
            instance.viewport_update(width, height);
        }
    }

    /// Returns whether anything was drawn.
    pub fn viewport_render(&self, width: u32, height: u32) -> bool {
        let mut loaded = self.loaded.lock();
        let loaded = &mut *loaded;
        let Some(instance) = loaded.instance.as_mut() else {
            return false;
        };

        instance.viewport_ensure_is_initialized(width, height);
        if loaded.viewport_programs_pending {
            if let Some(programs) = &loaded.programs {
                instance.update_programs(programs);
            }
            loaded.viewport_programs_pending = false;
        }
        instance.viewport_render(width, height);
        true
    }

    // -- helpers ------------------------------------------------------------

    fn register_search_dir(&self, dir: &Path) {
        let mut known = self.search_dirs.lock();
        if known.iter().any(|d| d == dir) {
            return;
        }
        known.push(dir.to_path_buf());
        if cfg!(windows) {
            // Indirect DLL dependencies are resolved through PATH.
            if let Some(updated) = prepend_search_dir(std::env::var_os("PATH"), dir) {
                std::env::set_var("PATH", updated);
                tracing::debug!(dir = %dir.display(), "added library directory to PATH");
            }
        }
    }
}

/// `current` with `dir` in front, or `None` when `dir` is already listed.
fn prepend_search_dir(current: Option<OsString>, dir: &Path) -> Option<OsString> {
    let existing: Vec<PathBuf> = current
        .as_deref()
        .map(|c| std::env::split_paths(c).collect())
        .unwrap_or_default();
    if existing.iter().any(|p| p == dir) {
        return None;
    }
    let mut paths = vec![dir.to_path_buf()];
    paths.extend(existing);
    std::env::join_paths(paths).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Init(u32, u32),
        Render,
        ViewportInit,
        ViewportRender,
        Programs(Vec<String>),
        Uniforms(usize),
        Instances(usize),
        Dropped(String),
    }

    type Journal = Arc<Mutex<Vec<Call>>>;

    struct Fake {
        name: String,
        journal: Journal,
    }

    impl Drop for Fake {
        fn drop(&mut self) {
            self.journal.lock().push(Call::Dropped(self.name.clone()));
        }
    }

    impl RenderLibrary for Fake {
        fn ensure_is_initialized(&mut self, width: u32, height: u32) {
            self.journal.lock().push(Call::Init(width, height));
        }
        fn update(&mut self, _w: u32, _h: u32, _p: bool) {}
        fn render(&mut self, _w: u32, _h: u32, _p: bool, frame: &mut [[f32; 4]]) {
            frame.fill([1.0, 0.5, 0.25, 1.0]);
            self.journal.lock().push(Call::Render);
        }
        fn viewport_ensure_is_initialized(&mut self, _w: u32, _h: u32) {
            self.journal.lock().push(Call::ViewportInit);
        }
        fn viewport_update(&mut self, _w: u32, _h: u32) {}
        fn viewport_render(&mut self, _w: u32, _h: u32) {
            self.journal.lock().push(Call::ViewportRender);
        }
        fn update_programs(&mut self, programs: &[ShaderSource]) {
            let names = programs.iter().map(|p| p.name.clone()).collect();
            self.journal.lock().push(Call::Programs(names));
        }
        fn set_uniform_values(&mut self, values: &[UniformValue]) {
            self.journal.lock().push(Call::Uniforms(values.len()));
        }
        fn set_object_instances(&mut self, instances: &[ObjectInstance]) {
            self.journal.lock().push(Call::Instances(instances.len()));
        }
    }

    /// Loads a `Fake` named after the working copy's contents.
    struct FakeLoader(Journal);

    impl LibraryLoader for FakeLoader {
        fn load(&mut self, path: &Path) -> Result<Box<dyn RenderLibrary>, LibraryError> {
            let name = fs::read_to_string(path).unwrap_or_default();
            Ok(Box::new(Fake {
                name,
                journal: self.0.clone(),
            }))
        }
    }

    struct Setup {
        _dirs: (TempDir, TempDir),
        source: PathBuf,
        journal: Journal,
        manager: LibraryManager,
    }

    fn setup() -> Setup {
        let sources = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let source = sources.path().join("libdemo.so");
        fs::write(&source, "v1").unwrap();
        let journal = Journal::default();
        let manager = LibraryManager::with_work_dir(FakeLoader(journal.clone()), work.path());
        Setup {
            _dirs: (sources, work),
            source,
            journal,
            manager,
        }
    }

    fn program(name: &str) -> ShaderSource {
        ShaderSource {
            name: name.to_string(),
            ..ShaderSource::default()
        }
    }

    #[test]
    fn calls_are_no_ops_while_unloaded() {
        let s = setup();
        assert!(s.manager.render(2, 2, false).is_none());
        assert!(!s.manager.viewport_render(2, 2));
        s.manager.update(2, 2, true);
        s.manager.viewport_update(2, 2);
        assert!(s.journal.lock().is_empty());
    }

    #[test]
    fn render_returns_one_pixel_per_entry() {
        let s = setup();
        s.manager.set_path(Some(s.source.clone()));
        assert!(s.manager.load());

        let frame = s.manager.render(3, 2, false).unwrap();
        assert_eq!(frame.len(), 6);
        assert_eq!(frame[5], [1.0, 0.5, 0.25, 1.0]);
    }

    #[test]
    fn pending_programs_flush_after_initialization_once_per_pass() {
        let s = setup();
        s.manager.set_shader_programs(vec![program("main")]);
        s.manager.set_path(Some(s.source.clone()));
        assert!(s.manager.load());

        s.manager.render(1, 1, false);
        s.manager.render(1, 1, false);
        s.manager.viewport_render(1, 1);

        let calls = s.journal.lock().clone();
        assert_eq!(
            calls,
            vec![
                Call::Init(1, 1),
                Call::Programs(vec!["main".into()]),
                Call::Render,
                Call::Init(1, 1),
                Call::Render,
                Call::ViewportInit,
                Call::Programs(vec!["main".into()]),
                Call::ViewportRender,
            ]
        );
    }

    #[test]
    fn updates_are_replayed_into_a_reloaded_library() {
        let s = setup();
        s.manager.set_uniform_values(vec![UniformValue::default(); 3]);
        s.manager.set_object_instances(vec![ObjectInstance::default(); 2]);
        s.manager.set_shader_programs(vec![program("a"), program("b")]);
        s.manager.set_path(Some(s.source.clone()));
        assert!(s.manager.load());
        s.manager.render(1, 1, false);

        fs::write(&s.source, "v2").unwrap();
        s.journal.lock().clear();
        assert!(s.manager.set_path(Some(s.source.clone())), "swap while loaded");
        s.manager.render(1, 1, false);

        let calls = s.journal.lock().clone();
        assert_eq!(
            calls,
            vec![
                Call::Dropped("v1".into()),
                Call::Uniforms(3),
                Call::Instances(2),
                Call::Init(1, 1),
                Call::Programs(vec!["a".into(), "b".into()]),
                Call::Render,
            ]
        );
    }

    #[test]
    fn uniform_values_go_straight_to_a_loaded_library() {
        let s = setup();
        s.manager.set_path(Some(s.source.clone()));
        assert!(s.manager.load());
        s.manager.set_uniform_values(vec![UniformValue::scalar(1.0)]);
        assert_eq!(s.journal.lock().last(), Some(&Call::Uniforms(1)));
    }

    #[test]
    fn change_observers_see_load_and_unload() {
        let s = setup();
        let count = Arc::new(Mutex::new(0));
        let seen = count.clone();
        let _sub = s.manager.on_change(move || *seen.lock() += 1);

        s.manager.set_path(Some(s.source.clone()));
        assert!(s.manager.load());
        assert!(s.manager.is_loaded());
        assert!(s.manager.unload());
        assert!(!s.manager.is_loaded());
        assert_eq!(*count.lock(), 2);
    }

    #[test]
    fn current_mirrors_the_resource() {
        let s = setup();
        assert_eq!(s.manager.current(), LibraryCurrent::default());

        s.manager.set_path(Some(s.source.clone()));
        assert!(s.manager.load());
        assert_eq!(
            s.manager.current(),
            LibraryCurrent {
                loaded: true,
                path: Some(s.source.clone()),
            }
        );
    }

    #[test]
    fn search_dir_is_prepended_once() {
        let dir = Path::new("/opt/build");
        let current = std::env::join_paths([Path::new("/usr/bin")]).ok();
        let updated = prepend_search_dir(current, dir).unwrap();
        let paths: Vec<PathBuf> = std::env::split_paths(&updated).collect();
        assert_eq!(paths, vec![PathBuf::from("/opt/build"), PathBuf::from("/usr/bin")]);
        assert!(prepend_search_dir(Some(updated), dir).is_none());
        assert!(prepend_search_dir(None, dir).is_some());
    }
}

//! C ABI of the rendering library, bound with `libloading`.

use std::ffi::{c_char, CString};
use std::path::{Path, PathBuf};
use std::ptr;

use libloading::Library;
use shiba_protocol::ShaderSource;

use crate::error::LibraryError;
use crate::library::{LibraryLoader, RenderLibrary};
use crate::uniforms::UniformValue;

#[repr(C)]
struct ShaderProgram {
    vertex: *const c_char,
    fragment: *const c_char,
}

/// One object placed in the scene, as a column-major world transform.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ObjectInstance {
    pub transform: [f32; 16],
}

type EnsureIsInitializedFn = unsafe extern "C" fn(i32, i32);
type UpdateFn = unsafe extern "C" fn(i32, i32, bool);
type RenderFn = unsafe extern "C" fn(i32, i32, bool, *mut f32);
type ViewportFn = unsafe extern "C" fn(i32, i32);
type UpdateProgramsFn = unsafe extern "C" fn(i32, *const ShaderProgram);
type SetActiveUniformValuesFn = unsafe extern "C" fn(*const UniformValue);
type SetObjectInstancesFn = unsafe extern "C" fn(i32, *const ObjectInstance);

/// Loads libraries from disk with the platform's dynamic loader.
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibLoader;

impl LibraryLoader for DylibLoader {
    fn load(&mut self, path: &Path) -> Result<Box<dyn RenderLibrary>, LibraryError> {
        Ok(Box::new(NativeLibrary::open(path)?))
    }
}

struct NativeLibrary {
    ensure_is_initialized: EnsureIsInitializedFn,
    update: UpdateFn,
    render: RenderFn,
    viewport_ensure_is_initialized: EnsureIsInitializedFn,
    viewport_update: ViewportFn,
    viewport_render: ViewportFn,
    update_programs: UpdateProgramsFn,
    set_active_uniform_values: SetActiveUniformValuesFn,
    set_object_instances: Option<SetObjectInstancesFn>,
    // Declared last so the function pointers above never outlive it.
    _library: Library,
}

macro_rules! symbol {
    ($library:expr, $path:expr, $name:literal, $ty:ty) => {{
        // SAFETY: the signature matches the library's exported C ABI.
        let symbol = unsafe { $library.get::<$ty>(concat!($name, "\0").as_bytes()) }
            .map_err(|source| LibraryError::MissingSymbol {
                path: $path.clone(),
                symbol: $name,
                source,
            })?;
        *symbol
    }};
}

impl NativeLibrary {
    fn open(path: &Path) -> Result<Self, LibraryError> {
        let path_buf: PathBuf = path.to_path_buf();
        // SAFETY: loading runs the library's initialisers; the file is our own build output.
        let library = unsafe { Library::new(path) }.map_err(|source| LibraryError::Load {
            path: path_buf.clone(),
            source,
        })?;

        // SAFETY: same ABI contract as `symbol!`.
        let set_object_instances =
            unsafe { library.get::<SetObjectInstancesFn>(b"_shibaSetObjectInstances\0") }
                .ok()
                .map(|symbol| *symbol);

        Ok(Self {
            ensure_is_initialized: symbol!(
                library,
                path_buf,
                "_shibaEnsureIsInitialized",
                EnsureIsInitializedFn
            ),
            update: symbol!(library, path_buf, "_shibaUpdate", UpdateFn),
            render: symbol!(library, path_buf, "_shibaRender", RenderFn),
            viewport_ensure_is_initialized: symbol!(
                library,
                path_buf,
                "_shibaViewportEnsureIsInitialized",
                EnsureIsInitializedFn
            ),
            viewport_update: symbol!(library, path_buf, "_shibaViewportUpdate", ViewportFn),
            viewport_render: symbol!(library, path_buf, "_shibaViewportRender", ViewportFn),
            update_programs: symbol!(library, path_buf, "_shibaUpdatePrograms", UpdateProgramsFn),
            set_active_uniform_values: symbol!(
                library,
                path_buf,
                "_shibaSetActiveUniformValues",
                SetActiveUniformValuesFn
            ),
            set_object_instances,
            _library: library,
        })
    }
}

fn dim(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn stage(source: Option<&str>, program: &str) -> Option<CString> {
    let source = source?;
    match CString::new(source) {
        Ok(source) => Some(source),
        Err(_) => {
            tracing::warn!(program, "shader source contains a NUL byte, stage dropped");
            None
        }
    }
}

// SAFETY (all methods): the pointers handed over stay valid for the duration
// of the call, which is all the library is allowed to assume.
impl RenderLibrary for NativeLibrary {
    fn ensure_is_initialized(&mut self, width: u32, height: u32) {
        unsafe { (self.ensure_is_initialized)(dim(width), dim(height)) }
    }

    fn update(&mut self, width: u32, height: u32, is_preview: bool) {
        unsafe { (self.update)(dim(width), dim(height), is_preview) }
    }

    fn render(&mut self, width: u32, height: u32, is_preview: bool, frame: &mut [[f32; 4]]) {
        let needed = width as usize * height as usize;
        if frame.len() < needed {
            tracing::warn!(needed, got = frame.len(), "render buffer too small");
            return;
        }
        unsafe {
            (self.render)(
                dim(width),
                dim(height),
                is_preview,
                frame.as_mut_ptr().cast::<f32>(),
            )
        }
    }

    fn viewport_ensure_is_initialized(&mut self, width: u32, height: u32) {
        unsafe { (self.viewport_ensure_is_initialized)(dim(width), dim(height)) }
    }

    fn viewport_update(&mut self, width: u32, height: u32) {
        unsafe { (self.viewport_update)(dim(width), dim(height)) }
    }

    fn viewport_render(&mut self, width: u32, height: u32) {
        unsafe { (self.viewport_render)(dim(width), dim(height)) }
    }

    fn update_programs(&mut self, programs: &[ShaderSource]) {
        let sources: Vec<(Option<CString>, Option<CString>)> = programs
            .iter()
            .map(|p| {
                (
                    stage(p.vertex.as_deref(), &p.name),
                    stage(p.fragment.as_deref(), &p.name),
                )
            })
            .collect();
        let raw: Vec<ShaderProgram> = sources
            .iter()
            .map(|(vertex, fragment)| ShaderProgram {
                vertex: vertex.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
                fragment: fragment.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
            })
            .collect();
        let count = i32::try_from(raw.len()).unwrap_or(i32::MAX);
        unsafe { (self.update_programs)(count, raw.as_ptr()) }
    }

    fn set_uniform_values(&mut self, values: &[UniformValue]) {
        unsafe { (self.set_active_uniform_values)(values.as_ptr()) }
    }

    fn set_object_instances(&mut self, instances: &[ObjectInstance]) {
        if let Some(set) = self.set_object_instances {
            let count = i32::try_from(instances.len()).unwrap_or(i32::MAX);
            unsafe { set(count, instances.as_ptr()) }
        }
    }
}

//! Uniform values derived from the server's shader reflection.
//!
//! [`Uniforms::apply_descriptors`] keeps the active uniforms of the last
//! shader set, in order. [`Uniforms::compute_values`] turns them into the
//! C-layout array handed to the library, one entry per descriptor, reading
//! built-in values from a [`ContextValues`] and user controls from a
//! [`ControlValues`] implementation supplied by the host.

use parking_lot::RwLock;
use shiba_protocol::{parse_control_parameters, ShaderVariable, UniformAnnotationKind};

use crate::observers::Observers;

/// Row-major 4×4 matrix, `m[row][column]`.
pub type Mat4 = [[f32; 4]; 4];

const SLIDER_LIMIT: f32 = 3.402_823e38;

// ---------------------------------------------------------------------------
// C layout
// ---------------------------------------------------------------------------

/// Mirrors the library's `UniformValue` struct. Only the fields matching
/// the uniform's type are read.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UniformValue {
    pub as_float: f32,
    pub as_int: i32,
    pub as_mat2: [f32; 4],
    pub as_mat3: [f32; 9],
    pub as_mat4: [f32; 16],
    pub as_uint: u32,
    pub as_vec2: [f32; 2],
    pub as_vec3: [f32; 3],
    pub as_vec4: [f32; 4],
}

impl UniformValue {
    /// Fill the float, int and uint views from one scalar.
    pub fn scalar(value: f32) -> Self {
        Self {
            as_float: value,
            as_int: value as i32,
            as_uint: value as u32,
            ..Self::default()
        }
    }

    pub fn matrix(matrix: &Mat4) -> Self {
        Self {
            as_mat4: column_major(matrix),
            ..Self::default()
        }
    }
}

/// Column-major flattening expected by the library.
pub fn column_major(matrix: &Mat4) -> [f32; 16] {
    let mut out = [0.0; 16];
    for (column, chunk) in out.chunks_exact_mut(4).enumerate() {
        for (row, value) in chunk.iter_mut().enumerate() {
            *value = matrix[row][column];
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Built-in values of the frame being rendered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextValues {
    pub inverse_projection: Option<Mat4>,
    pub inverse_view: Option<Mat4>,
    pub projection: Option<Mat4>,
    pub view: Option<Mat4>,
    pub resolution_width: Option<f32>,
    pub resolution_height: Option<f32>,
    pub time: Option<f32>,
}

/// Current values of user-editable controls, looked up by uniform name.
/// `None` means the control has never been edited.
pub trait ControlValues {
    fn checkbox(&self, name: &str) -> Option<bool>;
    fn slider(&self, name: &str) -> Option<f32>;
    fn object_transform(&self, name: &str) -> Option<Mat4>;
}

/// Controls that were never edited.
pub struct NoControls;

impl ControlValues for NoControls {
    fn checkbox(&self, _name: &str) -> Option<bool> {
        None
    }

    fn slider(&self, _name: &str) -> Option<f32> {
        None
    }

    fn object_transform(&self, _name: &str) -> Option<Mat4> {
        None
    }
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum UniformAnnotation {
    Checkbox { default: bool },
    Slider { default: f32, min: f32, max: f32 },
    Object,
    InverseProjection,
    InverseView,
    Projection,
    View,
    ResolutionWidth,
    ResolutionHeight,
    Time,
}

impl UniformAnnotation {
    /// `None` for a control kind this host does not know.
    pub fn from_wire(kind: &UniformAnnotationKind) -> Option<Self> {
        Some(match kind {
            UniformAnnotationKind::Control {
                control_kind,
                control_parameters,
            } => {
                let parameters = control_parameters
                    .as_deref()
                    .map(parse_control_parameters)
                    .unwrap_or_default();
                let float = |key: &str, fallback: f32| {
                    parameters
                        .get(key)
                        .and_then(|v| v.parse::<f32>().ok())
                        .unwrap_or(fallback)
                };
                match control_kind.as_str() {
                    "checkbox" => UniformAnnotation::Checkbox {
                        default: parameters.get("default").map(String::as_str) == Some("checked"),
                    },
                    "slider" => UniformAnnotation::Slider {
                        default: float("default", 0.0),
                        min: float("min", -SLIDER_LIMIT),
                        max: float("max", SLIDER_LIMIT),
                    },
                    "object" => UniformAnnotation::Object,
                    other => {
                        tracing::warn!(control = other, "unknown uniform control kind");
                        return None;
                    }
                }
            }
            UniformAnnotationKind::InverseProjection => UniformAnnotation::InverseProjection,
            UniformAnnotationKind::InverseView => UniformAnnotation::InverseView,
            UniformAnnotationKind::Projection => UniformAnnotation::Projection,
            UniformAnnotationKind::View => UniformAnnotation::View,
            UniformAnnotationKind::ResolutionWidth => UniformAnnotation::ResolutionWidth,
            UniformAnnotationKind::ResolutionHeight => UniformAnnotation::ResolutionHeight,
            UniformAnnotationKind::Time => UniformAnnotation::Time,
        })
    }

    pub fn is_control(&self) -> bool {
        matches!(
            self,
            UniformAnnotation::Checkbox { .. }
                | UniformAnnotation::Slider { .. }
                | UniformAnnotation::Object
        )
    }

    fn value(&self, name: &str, context: &ContextValues, controls: &dyn ControlValues) -> UniformValue {
        let matrix = |m: &Option<Mat4>| m.as_ref().map(UniformValue::matrix).unwrap_or_default();
        let scalar = |v: Option<f32>| v.map(UniformValue::scalar).unwrap_or_default();
        match self {
            UniformAnnotation::Checkbox { default } => {
                let checked = controls.checkbox(name).unwrap_or(*default);
                UniformValue::scalar(if checked { 1.0 } else { 0.0 })
            }
            UniformAnnotation::Slider { default, min, max } => {
                let value = controls.slider(name).unwrap_or(*default);
                if min <= max {
                    UniformValue::scalar(value.clamp(*min, *max))
                } else {
                    UniformValue::scalar(value)
                }
            }
            UniformAnnotation::Object => controls
                .object_transform(name)
                .map(|m| UniformValue::matrix(&m))
                .unwrap_or_default(),
            UniformAnnotation::InverseProjection => matrix(&context.inverse_projection),
            UniformAnnotation::InverseView => matrix(&context.inverse_view),
            UniformAnnotation::Projection => matrix(&context.projection),
            UniformAnnotation::View => matrix(&context.view),
            UniformAnnotation::ResolutionWidth => scalar(context.resolution_width),
            UniformAnnotation::ResolutionHeight => scalar(context.resolution_height),
            UniformAnnotation::Time => scalar(context.time),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UniformDescriptor {
    pub name: String,
    pub type_name: String,
    pub annotations: Vec<UniformAnnotation>,
}

impl UniformDescriptor {
    pub fn control(&self) -> Option<&UniformAnnotation> {
        self.annotations.iter().find(|a| a.is_control())
    }

    /// Value from the first annotation; zeroed when there is none.
    pub fn value(&self, context: &ContextValues, controls: &dyn ControlValues) -> UniformValue {
        self.annotations
            .first()
            .map(|a| a.value(&self.name, context, controls))
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct Uniforms {
    descriptors: RwLock<Vec<UniformDescriptor>>,
    changed: Observers,
}

impl Uniforms {
    pub fn new(changed: Observers) -> Self {
        Self {
            descriptors: RwLock::new(Vec::new()),
            changed,
        }
    }

    /// Replace the descriptors with the active uniforms in `variables`.
    pub fn apply_descriptors(&self, variables: &[ShaderVariable]) {
        let descriptors: Vec<UniformDescriptor> = variables
            .iter()
            .filter_map(|variable| {
                let annotations = variable.uniform_annotations()?;
                Some(UniformDescriptor {
                    name: variable.name.clone(),
                    type_name: variable.type_name.clone(),
                    annotations: annotations
                        .iter()
                        .filter_map(UniformAnnotation::from_wire)
                        .collect(),
                })
            })
            .collect();
        tracing::debug!(count = descriptors.len(), "active uniforms updated");
        *self.descriptors.write() = descriptors;
        self.changed.notify();
    }

    pub fn descriptors(&self) -> Vec<UniformDescriptor> {
        self.descriptors.read().clone()
    }

    /// One value per active descriptor, in descriptor order.
    pub fn compute_values(
        &self,
        context: &ContextValues,
        controls: &dyn ControlValues,
    ) -> Vec<UniformValue> {
        self.descriptors
            .read()
            .iter()
            .map(|d| d.value(context, controls))
            .collect()
    }
}

//! Message vocabulary.
//!
//! Every frame is one JSON object followed by `\n`. Outbound frames carry a
//! `command` tag, inbound frames an `event` tag; each inbound payload type
//! implements [`Event`] so handlers can be registered by type.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ChannelError;

// ---------------------------------------------------------------------------
// Shared enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildTarget {
    Library,
    Executable,
}

impl fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildTarget::Library => write!(f, "library"),
            BuildTarget::Executable => write!(f, "executable"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildMode {
    /// Rebuild everything.
    Full,
    /// Only what changed since the last build.
    Updates,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportOutput {
    #[serde(rename = "directory")]
    Directory,
    #[serde(rename = "7z")]
    SevenZip,
    #[serde(rename = "zip")]
    Zip,
}

// ---------------------------------------------------------------------------
// Commands (application → server)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Command {
    Build {
        mode: BuildMode,
        target: BuildTarget,
    },
    SetBuildOnChange {
        executable: bool,
        library: bool,
    },
    SetProjectDirectory {
        path: String,
    },
    /// `target` is forwarded as given; the server decides what it names.
    Export {
        directory: String,
        output: ExportOutput,
        target: String,
    },
    /// Run the last built executable.
    Run,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Build { .. } => "build",
            Command::SetBuildOnChange { .. } => "set-build-on-change",
            Command::SetProjectDirectory { .. } => "set-project-directory",
            Command::Export { .. } => "export",
            Command::Run => "run",
        }
    }
}

// ---------------------------------------------------------------------------
// Events (server → application)
// ---------------------------------------------------------------------------

/// An inbound payload, identified on the wire by its `event` field.
pub trait Event: DeserializeOwned + Serialize {
    const NAME: &'static str;
}

/// Encode `event` as a frame body, `event` tag included.
pub fn event_frame<E: Event>(event: &E) -> Result<Value, ChannelError> {
    let mut value = serde_json::to_value(event)?;
    if !value.is_object() {
        value = Value::Object(serde_json::Map::new());
    }
    if let Some(map) = value.as_object_mut() {
        map.insert("event".to_string(), Value::String(E::NAME.to_string()));
    }
    Ok(value)
}

macro_rules! event {
    ($ty:ident, $name:literal) => {
        impl Event for $ty {
            const NAME: &'static str = $name;
        }
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildStarted {
    pub target: BuildTarget,
}
event!(BuildStarted, "build-started");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildEnded {
    pub target: BuildTarget,
    pub successful: bool,
    /// Seconds; absent when the build failed before timing was available.
    #[serde(default)]
    pub duration: Option<f64>,
}
event!(BuildEnded, "build-ended");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryCompiled {
    pub path: PathBuf,
}
event!(LibraryCompiled, "library-compiled");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutableCompiled {
    pub path: PathBuf,
    pub size: u64,
}
event!(ExecutableCompiled, "executable-compiled");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exported {
    pub path: PathBuf,
}
event!(Exported, "exported");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFinished {
    pub duration: f64,
}
event!(RunFinished, "run");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,
}
event!(ErrorEvent, "error");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShaderSetProvided {
    pub target: BuildTarget,
    #[serde(alias = "programs")]
    pub sources: Vec<ShaderSource>,
    #[serde(default)]
    pub variables: Vec<ShaderVariable>,
}
event!(ShaderSetProvided, "shader-set-provided");

/// One shader program; either stage may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShaderSource {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment: Option<String>,
}

// ---------------------------------------------------------------------------
// Shader reflection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ShaderVariable {
    #[serde(flatten)]
    pub kind: ShaderVariableKind,
    pub name: String,
    pub type_name: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minified_name: Option<String>,
}

impl ShaderVariable {
    /// Annotations of an active uniform; `None` for anything else.
    pub fn uniform_annotations(&self) -> Option<&[UniformAnnotationKind]> {
        match &self.kind {
            ShaderVariableKind::Uniform { annotations } if self.active => {
                Some(annotations.as_slice())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ShaderVariableKind {
    Const {
        value: String,
    },
    Regular,
    Uniform {
        #[serde(default)]
        annotations: Vec<UniformAnnotationKind>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum UniformAnnotationKind {
    /// A user-editable control. `control_parameters` is a
    /// `key=value, key=value` list.
    #[serde(rename_all = "kebab-case")]
    Control {
        control_kind: String,
        #[serde(default)]
        control_parameters: Option<String>,
    },
    InverseProjection,
    InverseView,
    Projection,
    ResolutionHeight,
    ResolutionWidth,
    Time,
    View,
}

/// Parse `key=value, key=value`; items without exactly one `=` are skipped.
pub fn parse_control_parameters(input: &str) -> BTreeMap<String, String> {
    input
        .split(',')
        .filter_map(|item| {
            let mut parts = item.split('=');
            let key = parts.next()?.trim();
            let value = parts.next()?.trim();
            if parts.next().is_some() || key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case(
        Command::Build { mode: BuildMode::Full, target: BuildTarget::Library },
        json!({"command": "build", "mode": "full", "target": "library"})
    )]
    #[case(
        Command::SetBuildOnChange { executable: false, library: true },
        json!({"command": "set-build-on-change", "executable": false, "library": true})
    )]
    #[case(
        Command::SetProjectDirectory { path: "/work/demo".into() },
        json!({"command": "set-project-directory", "path": "/work/demo"})
    )]
    #[case(
        Command::Export {
            directory: "/out".into(),
            output: ExportOutput::SevenZip,
            target: "executable".into(),
        },
        json!({"command": "export", "directory": "/out", "output": "7z", "target": "executable"})
    )]
    #[case(
        Command::Export {
            directory: "/out".into(),
            output: ExportOutput::Zip,
            target: "web-release".into(),
        },
        json!({"command": "export", "directory": "/out", "output": "zip", "target": "web-release"})
    )]
    #[case(Command::Run, json!({"command": "run"}))]
    fn commands_use_wire_names(#[case] command: Command, #[case] expected: Value) {
        assert_eq!(serde_json::to_value(&command).unwrap(), expected);
        assert_eq!(expected["command"], command.name());
    }

    #[test]
    fn build_ended_tolerates_missing_duration() {
        let ended: BuildEnded =
            serde_json::from_value(json!({"target": "executable", "successful": false})).unwrap();
        assert_eq!(ended.duration, None);
        assert!(!ended.successful);
    }

    #[test]
    fn event_frame_adds_tag() {
        let frame = event_frame(&LibraryCompiled {
            path: PathBuf::from("/b/lib.so"),
        })
        .unwrap();
        assert_eq!(frame, json!({"event": "library-compiled", "path": "/b/lib.so"}));
    }

    #[test]
    fn shader_set_accepts_program_alias_and_variables() {
        let frame = json!({
            "target": "library",
            "programs": [{"name": "main", "fragment": "void main(){}"}],
            "variables": [
                {"kind": "const", "value": "3", "name": "N", "type-name": "int", "active": true},
                {
                    "kind": "uniform",
                    "name": "speed",
                    "type-name": "float",
                    "active": true,
                    "annotations": [
                        {"kind": "control", "control-kind": "slider", "control-parameters": "min=0, max=2"},
                        {"kind": "time"}
                    ]
                }
            ]
        });
        let set: ShaderSetProvided = serde_json::from_value(frame).unwrap();
        assert_eq!(set.sources[0].name, "main");
        assert_eq!(set.sources[0].vertex, None);
        assert!(set.variables[0].uniform_annotations().is_none());

        let annotations = set.variables[1].uniform_annotations().unwrap();
        assert_eq!(annotations.len(), 2);
        assert!(matches!(
            &annotations[0],
            UniformAnnotationKind::Control { control_kind, .. } if control_kind == "slider"
        ));
        assert_eq!(annotations[1], UniformAnnotationKind::Time);
    }

    #[test]
    fn inactive_uniform_has_no_annotations() {
        let variable: ShaderVariable = serde_json::from_value(json!({
            "kind": "uniform", "name": "u", "type-name": "vec2", "active": false, "annotations": []
        }))
        .unwrap();
        assert!(variable.uniform_annotations().is_none());
    }

    #[rstest]
    #[case("default=checked", &[("default", "checked")])]
    #[case(" min = 0 , max=10 ", &[("max", "10"), ("min", "0")])]
    #[case("broken, a=b=c, ok=1", &[("ok", "1")])]
    #[case("", &[])]
    fn control_parameters_parse(#[case] input: &str, #[case] expected: &[(&str, &str)]) {
        let parsed = parse_control_parameters(input);
        let expected: BTreeMap<String, String> = expected
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(parsed, expected);
    }
}

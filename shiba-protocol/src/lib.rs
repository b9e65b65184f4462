//! # shiba-protocol
//!
//! Newline-delimited JSON spoken with the build server: the outbound
//! [`Command`] vocabulary, the inbound event payloads, and the
//! [`EventChannel`] that carries them over TCP.

pub mod channel;
pub mod error;
pub mod wire;

pub use channel::{EventChannel, EventHandlers};
pub use error::ChannelError;
pub use wire::{
    event_frame, parse_control_parameters, BuildEnded, BuildMode, BuildStarted, BuildTarget,
    Command, ErrorEvent, Event, ExecutableCompiled, ExportOutput, Exported, LibraryCompiled,
    RunFinished, ShaderSetProvided, ShaderSource, ShaderVariable, ShaderVariableKind,
    UniformAnnotationKind,
};

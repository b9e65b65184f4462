//! Reactions to server events.

use std::sync::{Arc, Weak};

use shiba_protocol::{
    BuildEnded, BuildStarted, BuildTarget, ErrorEvent, EventHandlers, ExecutableCompiled,
    Exported, LibraryCompiled, RunFinished, ShaderSetProvided,
};

use crate::build_spans::BuildSpans;
use crate::library::LibraryManager;
use crate::notifications::Notifications;
use crate::uniforms::Uniforms;
use crate::Engine;

/// Everything the handlers touch. The engine is held weakly because it owns
/// the channel that runs them.
#[derive(Clone)]
pub struct HandlerContext {
    pub engine: Weak<Engine>,
    pub library: Arc<LibraryManager>,
    pub spans: Arc<BuildSpans>,
    pub notifications: Arc<Notifications>,
    pub uniforms: Arc<Uniforms>,
}

pub fn default_handlers(context: HandlerContext) -> EventHandlers {
    let mut handlers = EventHandlers::new();

    let spans = context.spans.clone();
    handlers.on(move |event: BuildStarted| spans.started(event.target));

    let spans = context.spans.clone();
    let notifications = context.notifications.clone();
    handlers.on(move |event: BuildEnded| {
        spans.ended(event.target);
        if event.successful {
            tracing::info!(target_kind = %event.target, duration = ?event.duration, "build succeeded");
        } else {
            tracing::warn!(target_kind = %event.target, duration = ?event.duration, "build failed");
            notifications.add_timed(format!("Build failed: {}.", event.target));
        }
    });

    let engine = context.engine.clone();
    handlers.on(move |event: LibraryCompiled| {
        tracing::info!(path = %event.path.display(), "library compiled");
        match engine.upgrade() {
            Some(engine) => engine.schedule(move |desired| desired.library.path = Some(event.path)),
            None => tracing::debug!("engine gone, library path dropped"),
        }
    });

    let notifications = context.notifications.clone();
    handlers.on(move |event: ExecutableCompiled| {
        tracing::info!(path = %event.path.display(), size = event.size, "executable compiled");
        notifications.add_timed(format!("Executable size: {}.", event.size));
    });

    let notifications = context.notifications.clone();
    handlers.on(move |event: Exported| {
        tracing::info!(path = %event.path.display(), "exported");
        notifications.add_timed(format!("Exported to {}.", event.path.display()));
    });

    handlers.on(|event: RunFinished| tracing::info!(duration = event.duration, "run finished"));

    handlers.on(|event: ErrorEvent| tracing::warn!(message = %event.message, "server error"));

    let library = context.library.clone();
    let uniforms = context.uniforms.clone();
    handlers.on(move |event: ShaderSetProvided| {
        if event.target != BuildTarget::Library {
            tracing::debug!(target_kind = %event.target, "ignoring shader set");
            return;
        }
        tracing::debug!(programs = event.sources.len(), "shader set provided");
        library.set_shader_programs(event.sources);
        uniforms.apply_descriptors(&event.variables);
    });

    handlers
}

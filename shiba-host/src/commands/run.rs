//! `shiba-host run` — keep the engine reconciled until Ctrl-C.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Args;
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use shiba_core::paths::settings_path;
use shiba_core::{settings, Settings};
use shiba_instrumentation::{ExitGuard, Instrumentation, InstrumentationOptions};

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(300);
const MIN_RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Settings file to use instead of ~/.shiba/settings.yaml.
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Leave the build server disconnected.
    #[arg(long)]
    pub no_connect: bool,

    /// Leave the library unloaded.
    #[arg(long)]
    pub no_load: bool,

    /// Run one pass, print the resulting state as JSON and exit.
    #[arg(long)]
    pub once: bool,
}

impl RunArgs {
    pub fn run(self) -> Result<()> {
        crate::init_tracing();
        let path = match &self.settings {
            Some(path) => path.clone(),
            None => {
                let home = dirs::home_dir().context("could not determine home directory")?;
                settings_path(&home)
            }
        };
        let settings = settings::load_from(&path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?;

        let mut options = InstrumentationOptions::from_settings(&settings);
        options.desired.server.connected = !self.no_connect;
        options.desired.library.loaded = !self.no_load;
        let instrumentation = Arc::new(Instrumentation::new(options));

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to start tokio runtime")?;
        runtime.block_on(serve(instrumentation, path, settings, self.once))
    }
}

async fn serve(
    instrumentation: Arc<Instrumentation>,
    path: PathBuf,
    settings: Settings,
    once: bool,
) -> Result<()> {
    let guard = instrumentation.exit_guard();
    run_pass(&instrumentation, true).await?;

    if once {
        let state = serde_json::json!({
            "current": instrumentation.current(),
            "status": instrumentation.engine().status(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&state).context("failed to render state JSON")?
        );
        return teardown(guard).await;
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })
    .context("failed to create settings watcher")?;
    let watch_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    std::fs::create_dir_all(&watch_dir)
        .with_context(|| format!("failed to create {}", watch_dir.display()))?;
    watcher
        .watch(&watch_dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", watch_dir.display()))?;
    tracing::info!(path = %path.display(), "watching settings");

    let mut retry = retry_interval(&settings);
    let mut debounce = HashMap::<PathBuf, Instant>::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                match signal {
                    Ok(()) => tracing::info!("received ctrl-c, shutting down"),
                    Err(err) => tracing::warn!(error = %err, "ctrl-c handler failed, shutting down"),
                }
                break;
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind)
                    || !event.paths.iter().any(|p| is_settings_file(p, &path))
                {
                    continue;
                }
                if !should_process_event(&mut debounce, &path, Instant::now()) {
                    continue;
                }

                match settings::load_from(&path) {
                    Ok(settings) => {
                        tracing::info!("settings changed");
                        retry = retry_interval(&settings);
                        let instrumentation = instrumentation.clone();
                        let applied = tokio::task::spawn_blocking(move || {
                            instrumentation.apply_settings(&settings)
                        })
                        .await
                        .context("settings task failed")?;
                        if let Err(err) = applied {
                            tracing::warn!(error = %err, "settings not fully applied, will retry");
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "ignoring unreadable settings"),
                }
            }
            _ = retry.tick() => {
                run_pass(&instrumentation, false).await?;
            }
        }
    }

    drop(watcher);
    teardown(guard).await
}

/// Run a pass on a blocking thread. Unless forced, skipped while current
/// state already matches.
async fn run_pass(instrumentation: &Arc<Instrumentation>, force: bool) -> Result<()> {
    let instrumentation = instrumentation.clone();
    let result = tokio::task::spawn_blocking(move || {
        if !force && instrumentation.engine().is_converged() {
            return Ok(());
        }
        instrumentation.reconcile()
    })
    .await
    .context("reconcile task failed")?;
    if let Err(err) = result {
        tracing::debug!(error = %err, "retrying on the next tick");
    }
    Ok(())
}

async fn teardown(guard: ExitGuard) -> Result<()> {
    tokio::task::spawn_blocking(move || drop(guard))
        .await
        .context("teardown task failed")
}

fn retry_interval(settings: &Settings) -> tokio::time::Interval {
    let period = Duration::from_millis(settings.reconcile.retry_interval_ms).max(MIN_RETRY_INTERVAL);
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

fn is_settings_file(candidate: &Path, settings: &Path) -> bool {
    candidate.file_name().is_some() && candidate.file_name() == settings.file_name()
}

fn should_process_event(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
) -> bool {
    should_process_event_with_threshold(debounce, path, now, DEBOUNCE_WINDOW)
}

fn should_process_event_with_threshold(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
    threshold: Duration,
) -> bool {
    debounce.retain(|_, seen_at| now.duration_since(*seen_at) <= Duration::from_secs(30));
    match debounce.get(path) {
        Some(last_seen) if now.duration_since(*last_seen) < threshold => false,
        _ => {
            debounce.insert(path.to_path_buf(), now);
            true
        }
    }
}

//! Child process ownership with a two-phase shutdown.
//!
//! [`ProcessSupervisor::start`] spawns the child in its own process group
//! with piped output. Both streams feed a single output thread, so the log
//! carries one combined stream in arrival order.
//! [`ProcessSupervisor::stop`] asks the group to terminate, waits up to the
//! grace period, then kills it. The output thread is given
//! [`DRAIN_TIMEOUT`] to finish and is left behind after that.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::ResourceError;

/// How long a child gets to exit after a graceful termination request.
pub const GRACE_PERIOD: Duration = Duration::from_secs(15);

/// How long `stop` waits for the child's output to close once it exited.
/// Descendants that left the process group can hold the pipes open.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct Running {
    child: Arc<Mutex<Child>>,
    pid: u32,
    path: PathBuf,
    output: JoinHandle<()>,
}

pub struct ProcessSupervisor {
    name: String,
    grace_period: Duration,
    running: Option<Running>,
}

impl ProcessSupervisor {
    /// `name` labels the child's output in the log.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            grace_period: GRACE_PERIOD,
            running: None,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn pid(&self) -> Option<u32> {
        self.running.as_ref().map(|r| r.pid)
    }

    pub fn path(&self) -> Option<&Path> {
        self.running.as_ref().map(|r| r.path.as_path())
    }

    /// True while a started child has not exited.
    pub fn is_running(&self) -> bool {
        match &self.running {
            Some(running) => matches!(running.child.lock().try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Spawn `path` with `args`. Returns the child's pid.
    pub fn start(&mut self, path: &Path, args: &[String]) -> Result<u32, ResourceError> {
        if let Some(running) = &self.running {
            return Err(ResourceError::AlreadyRunning(running.pid));
        }

        tracing::info!(process = %self.name, path = %path.display(), ?args, "starting process");
        let mut command = Command::new(path);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command.spawn().map_err(|source| ResourceError::Spawn {
            path: path.to_path_buf(),
            source,
        })?;

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let child = Arc::new(Mutex::new(child));

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(stdout) = stdout {
            forward_lines(stdout, tx.clone());
        }
        if let Some(stderr) = stderr {
            forward_lines(stderr, tx.clone());
        }
        drop(tx);

        let output = {
            let name = self.name.clone();
            let child = child.clone();
            thread::spawn(move || {
                for line in rx {
                    tracing::info!(process = %name, "{}", line);
                }
                match child.lock().try_wait() {
                    Ok(Some(status)) => {
                        tracing::info!(process = %name, code = ?status.code(), "process exited")
                    }
                    _ => tracing::debug!(process = %name, "process output closed"),
                }
            })
        };

        self.running = Some(Running {
            child,
            pid,
            path: path.to_path_buf(),
            output,
        });
        tracing::info!(process = %self.name, pid, "process started");
        Ok(pid)
    }

    /// Terminate the child, escalating to a kill after the grace period.
    ///
    /// Returns the exit status, or `None` if nothing was running or the
    /// status could not be collected.
    pub fn stop(&mut self) -> Option<ExitStatus> {
        let running = self.running.take()?;
        tracing::info!(process = %self.name, pid = running.pid, "stopping process");

        let mut status = match running.child.lock().try_wait() {
            Ok(Some(status)) => Some(status),
            _ => None,
        };

        if status.is_none() {
            if let Err(err) = request_termination(running.pid) {
                tracing::warn!(process = %self.name, error = %err, "graceful termination request failed");
            }
            status = wait_until(&running.child, Instant::now() + self.grace_period);
        }

        if status.is_none() {
            tracing::warn!(process = %self.name, pid = running.pid, "forcing process to exit");
            if let Err(err) = force_termination(running.pid) {
                tracing::debug!(process = %self.name, error = %err, "group kill failed");
            }
            let mut child = running.child.lock();
            if let Err(err) = child.kill() {
                tracing::debug!(process = %self.name, error = %err, "kill failed");
            }
            status = child.wait().ok();
        }

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while !running.output.is_finished() && Instant::now() < deadline {
            thread::sleep(POLL_INTERVAL);
        }
        if running.output.is_finished() {
            if running.output.join().is_err() {
                tracing::warn!(process = %self.name, "output thread panicked");
            }
        } else {
            tracing::warn!(process = %self.name, "output still open after exit, detaching");
        }

        match status {
            Some(status) => {
                tracing::info!(process = %self.name, code = ?status.code(), "process stopped")
            }
            None => tracing::warn!(process = %self.name, "process stopped without exit status"),
        }
        status
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Send every line of `reader` to `tx` from a detached thread. The thread
/// ends at end of stream or once the receiver is gone.
fn forward_lines<R: Read + Send + 'static>(reader: R, tx: Sender<String>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::debug!(error = %err, "output stream error");
                    break;
                }
            }
        }
    });
}

fn wait_until(child: &Mutex<Child>, deadline: Instant) -> Option<ExitStatus> {
    loop {
        match child.lock().try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(error = %err, "failed to poll process");
                return None;
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

// The child leads its own process group, so `-pid` reaches every
// descendant that stayed in it.

#[cfg(unix)]
fn request_termination(pid: u32) -> std::io::Result<()> {
    signal_command("kill", &["-TERM", "--", &format!("-{pid}")])
}

#[cfg(unix)]
fn force_termination(pid: u32) -> std::io::Result<()> {
    signal_command("kill", &["-KILL", "--", &format!("-{pid}")])
}

#[cfg(windows)]
fn request_termination(pid: u32) -> std::io::Result<()> {
    signal_command("taskkill", &["/T", "/PID", &pid.to_string()])
}

#[cfg(windows)]
fn force_termination(pid: u32) -> std::io::Result<()> {
    signal_command("taskkill", &["/F", "/T", "/PID", &pid.to_string()])
}

#[cfg(not(any(unix, windows)))]
fn request_termination(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "graceful termination is not supported on this platform",
    ))
}

#[cfg(not(any(unix, windows)))]
fn force_termination(_pid: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(any(unix, windows))]
fn signal_command(program: &str, args: &[&str]) -> std::io::Result<()> {
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("{program} exited with {status}"),
        ))
    }
}

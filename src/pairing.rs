//! Pairing helper supervision.
//!
//! When no device is given, an external helper (by default `socat`) creates two linked
//! pseudo-terminals and exposes them as filesystem links: one for the application under test
//! and one for the emulator. [`PairingHelperHandle`] launches that process, forwards its
//! diagnostics to the log sink, and terminates it on shutdown.
//!
//! The helper must be started from within a Tokio runtime.

use crate::config::ConfigError;
use crate::error::{EmuResult, EmulatorError};
use crate::logging::LogSink;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// How long the helper gets to exit after SIGTERM before it is killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Default `socat` arguments. `{app_side}` and `{emu_side}` are substituted.
pub const SOCAT_ARGS: [&str; 4] = [
    "-d",
    "-d",
    "pty,raw,echo=0,link={app_side},perm=0666",
    "pty,raw,echo=0,link={emu_side},perm=0666",
];

/// Program and argument template for the helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperCommand {
    /// Executable name or path
    pub program: String,
    /// Argument templates
    pub args: Vec<String>,
}

impl HelperCommand {
    /// `socat` with the standard raw, no-echo pseudo-terminal arguments.
    pub fn socat(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: SOCAT_ARGS.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Arguments with both endpoint names filled in.
    pub fn render(&self, app_side: &Path, emu_side: &Path) -> EmuResult<Vec<String>> {
        let vars: HashMap<String, String> = [
            ("app_side".to_string(), app_side.display().to_string()),
            ("emu_side".to_string(), emu_side.display().to_string()),
        ]
        .into_iter()
        .collect();

        self.args
            .iter()
            .map(|template| {
                strfmt::strfmt(template, &vars).map_err(|e| {
                    EmulatorError::from(ConfigError::ValidationError(format!(
                        "bad helper argument template '{template}': {e}"
                    )))
                })
            })
            .collect()
    }

    /// Short tag for log lines, e.g. `socat`.
    fn tag(&self) -> String {
        Path::new(&self.program)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.clone())
    }
}

/// A running pairing helper and the two endpoints it owns.
pub struct PairingHelperHandle {
    child: Option<Child>,
    pid: Option<u32>,
    tag: String,
    app_side: PathBuf,
    emu_side: PathBuf,
    sink: Arc<dyn LogSink>,
    readers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for PairingHelperHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingHelperHandle")
            .field("tag", &self.tag)
            .field("pid", &self.pid)
            .field("app_side", &self.app_side)
            .field("emu_side", &self.emu_side)
            .field("running", &self.child.is_some())
            .finish()
    }
}

impl PairingHelperHandle {
    /// Remove anything already at either endpoint, then launch the helper.
    ///
    /// Spawn failures are returned as [`EmulatorError::HelperSpawn`] and are not retried.
    pub fn start(
        command: &HelperCommand,
        app_side: &Path,
        emu_side: &Path,
        sink: Arc<dyn LogSink>,
    ) -> EmuResult<Self> {
        for path in [app_side, emu_side] {
            remove_endpoint(path, sink.as_ref());
        }

        let args = command.render(app_side, emu_side)?;
        let mut child = Command::new(&command.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EmulatorError::HelperSpawn {
                program: command.program.clone(),
                source,
            })?;

        let tag = command.tag();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(stdout, format!("{tag}[out]"), sink.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(stderr, format!("{tag}[err]"), sink.clone()));
        }

        let pid = child.id();
        sink.info(&format!(
            "{tag} pid={} -> {} <-> {}",
            pid.map_or_else(|| "?".to_string(), |p| p.to_string()),
            app_side.display(),
            emu_side.display()
        ));

        Ok(Self {
            child: Some(child),
            pid,
            tag,
            app_side: app_side.to_path_buf(),
            emu_side: emu_side.to_path_buf(),
            sink,
            readers,
        })
    }

    /// Process id of the helper, if it was known at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Endpoint intended for the application under test.
    pub fn app_side(&self) -> &Path {
        &self.app_side
    }

    /// Endpoint the emulator opens.
    pub fn emu_side(&self) -> &Path {
        &self.emu_side
    }

    /// Whether [`terminate`](Self::terminate) has not yet run.
    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// Exit status if the helper has already quit on its own.
    pub fn try_exit_status(&mut self) -> EmuResult<Option<ExitStatus>> {
        match self.child.as_mut() {
            Some(child) => Ok(child.try_wait()?),
            None => Ok(None),
        }
    }

    /// Stop the helper: SIGTERM, wait up to [`TERMINATE_GRACE`], then kill.
    ///
    /// Safe to call more than once; failures are logged as warnings and never returned.
    pub async fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        self.sink.info(&format!(
            "TERM {} pid={}",
            self.tag,
            self.pid.map_or_else(|| "?".to_string(), |p| p.to_string())
        ));

        if let Err(e) = request_stop(&mut child) {
            self.sink
                .warn(&format!("signal {} failed: {e}", self.tag));
        }

        match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            Ok(Ok(status)) => self.sink.debug(&format!("{} exited: {status}", self.tag)),
            Ok(Err(e)) => self.sink.warn(&format!("wait {} failed: {e}", self.tag)),
            Err(_) => {
                self.sink.warn(&format!(
                    "{} still running after {:?}, killing",
                    self.tag, TERMINATE_GRACE
                ));
                if let Err(e) = child.kill().await {
                    self.sink.warn(&format!("kill {} failed: {e}", self.tag));
                }
            }
        }

        // The readers finish on their own once the pipes close.
        self.readers.clear();

        for path in [self.app_side.clone(), self.emu_side.clone()] {
            remove_endpoint(&path, self.sink.as_ref());
        }
    }
}

#[cfg(unix)]
fn request_stop(child: &mut Child) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    // `id()` is None once the child has been reaped.
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pid = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

/// Best-effort removal of a filesystem endpoint, including a dangling link.
pub(crate) fn remove_endpoint(path: &Path, sink: &dyn LogSink) {
    if std::fs::symlink_metadata(path).is_err() {
        return;
    }
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            sink.warn(&format!("unlink {}: {e}", path.display()));
        }
    }
}

fn forward_lines<R>(stream: R, tag: String, sink: Arc<dyn LogSink>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink.debug(&format!("{tag} {}", line.trim()));
        }
    })
}

//! Process lifecycle.
//!
//! [`LifecycleController`] wires provisioning and the link loop together and owns every
//! resource that has to be released on the way out: the transport and the pairing helper.
//!
//! Termination signals (SIGINT, SIGTERM) do not tear anything down themselves. They raise a
//! stop flag; provisioning and the link loop both watch it and return, and the controller then
//! runs [`LifecycleController::shutdown`]. Shutdown can be invoked any number of times.
//!
//! ```no_run
//! use std::sync::Arc;
//! use vserial_emu::config::EmulatorConfig;
//! use vserial_emu::lifecycle::LifecycleController;
//! use vserial_emu::logging::TracingSink;
//!
//! # async fn example() -> std::io::Result<std::process::ExitCode> {
//! let mut controller = LifecycleController::new(EmulatorConfig::default(), Arc::new(TracingSink));
//! let _signals = controller.install_signal_handlers()?;
//! Ok(controller.run().await.exit_code())
//! # }
//! ```

use crate::clock::{Clock, SystemClock};
use crate::config::EmulatorConfig;
use crate::error::{EmuResult, EmulatorError};
use crate::link::{LinkRunner, LinkSettings};
use crate::logging::LogSink;
use crate::pairing::PairingHelperHandle;
use crate::provision::TransportProvisioner;
use crate::transport::Transport;
use std::io;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Stopped on request (signal or [`StopHandle::stop`]).
    Stopped,
    /// Provisioning or the link loop failed.
    Failed,
}

impl RunOutcome {
    /// Whether the run ended without an error.
    pub fn is_success(self) -> bool {
        self == RunOutcome::Stopped
    }

    /// Process exit code: 0 after a requested stop, 1 after a failure.
    pub fn exit_code(self) -> ExitCode {
        match self {
            RunOutcome::Stopped => ExitCode::SUCCESS,
            RunOutcome::Failed => ExitCode::FAILURE,
        }
    }
}

/// Requests an orderly stop. Cheap to clone; stopping twice is harmless.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Raise the stop flag.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the flag is raised.
    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Owns the run: provisioning, the link loop, and shutdown.
pub struct LifecycleController {
    config: EmulatorConfig,
    sink: Arc<dyn LogSink>,
    clock: Arc<dyn Clock>,
    provisioner: TransportProvisioner,
    transport: Option<Box<dyn Transport>>,
    helper: Option<PairingHelperHandle>,
    stop: StopHandle,
    exited: bool,
}

impl LifecycleController {
    /// Controller for `config`, provisioning real serial devices.
    pub fn new(config: EmulatorConfig, sink: Arc<dyn LogSink>) -> Self {
        let provisioner = TransportProvisioner::new(&config, sink.clone());
        let (tx, _rx) = watch::channel(false);
        Self {
            config,
            sink,
            clock: Arc::new(SystemClock),
            provisioner,
            transport: None,
            helper: None,
            stop: StopHandle { tx: Arc::new(tx) },
            exited: false,
        }
    }

    /// Replace the provisioner.
    pub fn with_provisioner(mut self, provisioner: TransportProvisioner) -> Self {
        self.provisioner = provisioner;
        self
    }

    /// Replace the clock handed to the link loop.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Handle for requesting a stop from elsewhere.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Turn SIGINT and SIGTERM into stop requests for as long as the process lives.
    ///
    /// The handlers are registered before this returns, so a signal sent right after the call
    /// is already a stop request. Must be called from within a Tokio runtime.
    pub fn install_signal_handlers(&self) -> io::Result<JoinHandle<()>> {
        let mut signals = TerminationSignals::register()?;
        let stop = self.stop_handle();
        let sink = self.sink.clone();
        Ok(tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(name) => {
                        sink.info(&format!("{name} received, shutting down"));
                        stop.stop();
                    }
                    Err(e) => {
                        sink.warn(&format!("signal handling unavailable: {e}"));
                        break;
                    }
                }
            }
        }))
    }

    /// Provision, run the link until stopped or failed, then shut down.
    pub async fn run(&mut self) -> RunOutcome {
        self.sink.info("START emulator");
        let outcome = match self.provision_and_run().await {
            Ok(()) => RunOutcome::Stopped,
            Err(e) => {
                self.report(e);
                RunOutcome::Failed
            }
        };
        self.shutdown().await;
        outcome
    }

    async fn provision_and_run(&mut self) -> EmuResult<()> {
        let mut stop = self.stop.tx.subscribe();

        let transport = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => return Ok(()),
            result = self.provisioner.acquire(&mut self.helper) => result?,
        };

        let mut runner = LinkRunner::new(
            transport,
            LinkSettings::from(&self.config),
            self.sink.clone(),
            self.clock.clone(),
        );
        let result = runner.run(stop).await;
        self.transport = Some(runner.into_transport());
        result
    }

    /// Release everything: stop the loop, close the transport, terminate the helper.
    ///
    /// Each step tolerates a resource that was never acquired or is already released, and
    /// failures are logged as warnings only.
    pub async fn shutdown(&mut self) {
        self.stop.stop();

        if let Some(mut transport) = self.transport.take() {
            if transport.is_open() {
                self.sink.info("CLOSE serial");
                if let Err(e) = transport.close() {
                    self.sink
                        .warn(&format!("close {}: {e}", transport.name()));
                }
            }
        }

        if let Some(mut helper) = self.helper.take() {
            helper.terminate().await;
        }

        if !self.exited {
            self.exited = true;
            self.sink.info("EXIT");
        }
    }

    fn report(&self, err: EmulatorError) {
        match err {
            EmulatorError::Transport(_) | EmulatorError::Serial(_) => {
                self.sink.error(&format!("SERIAL ERR: {err}"));
            }
            _ => self.sink.error(&format!("FATAL: {}", diagnostic(err))),
        }
    }
}

/// The error with its cause chain, and a backtrace when `RUST_BACKTRACE` enables one.
fn diagnostic(err: EmulatorError) -> String {
    format!("{:?}", anyhow::Error::from(err))
}

#[cfg(unix)]
struct TerminationSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl TerminationSignals {
    fn register() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> io::Result<&'static str> {
        let received = tokio::select! {
            received = self.interrupt.recv() => received.map(|()| "SIGINT"),
            received = self.terminate.recv() => received.map(|()| "SIGTERM"),
        };
        received.ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "signal stream closed"))
    }
}

#[cfg(not(unix))]
struct TerminationSignals;

#[cfg(not(unix))]
impl TerminationSignals {
    fn register() -> io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> io::Result<&'static str> {
        tokio::signal::ctrl_c().await.map(|()| "CTRL-C")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;
    use crate::transport::{MemoryTransport, TransportOpener};
    use std::time::Duration;
    use tracing::Level;

    /// Hands out one side of an in-memory pair.
    struct MemoryOpener(MemoryTransport);

    impl TransportOpener for MemoryOpener {
        fn open(&self, _path: &str, _baud: u32) -> EmuResult<Box<dyn Transport>> {
            Ok(Box::new(self.0.clone()))
        }
    }

    struct AbsentOpener;

    impl TransportOpener for AbsentOpener {
        fn open(&self, path: &str, _baud: u32) -> EmuResult<Box<dyn Transport>> {
            Err(EmulatorError::Transport(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such device: {path}"),
            )))
        }
    }

    fn device_config(open_timeout: f64) -> EmulatorConfig {
        EmulatorConfig {
            port: Some("mem://emu".into()),
            tx_period: 0.1,
            stats_period: 1.0,
            open_timeout,
            log_file: None,
            ..EmulatorConfig::default()
        }
    }

    fn controller(
        config: EmulatorConfig,
        opener: Arc<dyn TransportOpener>,
    ) -> (LifecycleController, MemorySink) {
        let sink = MemorySink::new();
        let shared: Arc<dyn LogSink> = Arc::new(sink.clone());
        let provisioner = TransportProvisioner::new(&config, shared.clone()).with_opener(opener);
        let controller = LifecycleController::new(config, shared).with_provisioner(provisioner);
        (controller, sink)
    }

    fn stop_after(handle: StopHandle, after: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            handle.stop();
        });
    }

    #[tokio::test]
    async fn test_shutdown_twice_without_resources() {
        let (mut controller, sink) = controller(device_config(1.0), Arc::new(AbsentOpener));

        controller.shutdown().await;
        controller.shutdown().await;

        assert_eq!(sink.messages_with_prefix("EXIT").len(), 1);
        assert!(sink.messages_at(Level::WARN).is_empty());
        assert!(sink.messages_at(Level::ERROR).is_empty());
        assert!(controller.stop_handle().is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_transport_once() {
        let (emu, mut app) = MemoryTransport::pair("emu", "app");
        let (mut controller, sink) =
            controller(device_config(1.0), Arc::new(MemoryOpener(emu)));
        stop_after(controller.stop_handle(), Duration::from_millis(250));

        let outcome = controller.run().await;

        assert_eq!(outcome, RunOutcome::Stopped);
        assert!(outcome.is_success());
        assert_eq!(sink.messages_with_prefix("CLOSE serial").len(), 1);
        assert_eq!(sink.messages_with_prefix("TX ").len(), 2);
        assert_eq!(
            app.write_all(b"late\n").unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );

        controller.shutdown().await;
        assert_eq!(sink.messages_with_prefix("CLOSE serial").len(), 1);
        assert_eq!(sink.messages_with_prefix("EXIT").len(), 1);
        assert!(sink.messages_at(Level::ERROR).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_fails_run_and_still_cleans_up() {
        let (emu, _app) = MemoryTransport::pair("emu", "app");
        emu.inject_read_failure();
        let (mut controller, sink) =
            controller(device_config(1.0), Arc::new(MemoryOpener(emu)));

        let outcome = controller.run().await;

        assert_eq!(outcome, RunOutcome::Failed);
        assert!(!outcome.is_success());
        let errors = sink.messages_at(Level::ERROR);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("SERIAL ERR:"), "got {}", errors[0]);
        assert!(sink.contains("CLOSE serial"));
        assert!(sink.contains("EXIT"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_provisioning_failure_fails_run() {
        let (mut controller, sink) = controller(device_config(0.5), Arc::new(AbsentOpener));

        let outcome = controller.run().await;

        assert_eq!(outcome, RunOutcome::Failed);
        let errors = sink.messages_at(Level::ERROR);
        assert!(errors[0].starts_with("FATAL: Failed to open 'mem://emu'"));
        assert!(errors[0].contains("no such device"));
        assert!(!sink.contains("CLOSE serial"));
        assert!(sink.contains("EXIT"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_provisioning() {
        let (mut controller, sink) = controller(device_config(15.0), Arc::new(AbsentOpener));
        stop_after(controller.stop_handle(), Duration::from_secs(1));

        let start = tokio::time::Instant::now();
        let outcome = controller.run().await;

        assert_eq!(outcome, RunOutcome::Stopped);
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(sink.messages_at(Level::ERROR).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_helper_terminated_when_open_fails() {
        use crate::pairing::HelperCommand;

        let dir = tempfile::tempdir().unwrap();
        let config = EmulatorConfig {
            pty_a: dir.path().join("vserial.A"),
            pty_b: dir.path().join("vserial.B"),
            open_timeout: 0.3,
            pair_timeout: 5.0,
            log_file: None,
            ..EmulatorConfig::default()
        };
        let sink = MemorySink::new();
        let shared: Arc<dyn LogSink> = Arc::new(sink.clone());
        let provisioner = TransportProvisioner::new(&config, shared.clone())
            .with_opener(Arc::new(AbsentOpener))
            .with_helper(HelperCommand {
                program: "sh".into(),
                args: vec![
                    "-c".into(),
                    "ln -s /dev/null {app_side}; ln -s /dev/null {emu_side}; exec sleep 30".into(),
                ],
            });
        let mut controller = LifecycleController::new(config.clone(), shared)
            .with_provisioner(provisioner);

        let outcome = controller.run().await;

        assert_eq!(outcome, RunOutcome::Failed);
        assert!(sink.contains("TERM sh pid="));
        assert!(!config.pty_a.exists());
        assert!(std::fs::symlink_metadata(&config.pty_b).is_err());
    }

    #[test]
    fn test_fatal_diagnostic_includes_causes() {
        let err = EmulatorError::HelperSpawn {
            program: "socat".into(),
            source: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
        };
        let text = diagnostic(err);
        assert!(text.starts_with("Failed to spawn pairing helper 'socat'"));
        assert!(text.contains("Caused by:"));
        assert!(text.contains("No such file or directory"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_stops_run_and_repeat_is_absorbed() {
        use nix::sys::signal::{raise, Signal};

        async fn wait_until(cond: impl Fn() -> bool) -> bool {
            for _ in 0..200 {
                if cond() {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            false
        }

        let (emu, _app) = MemoryTransport::pair("emu", "app");
        let (mut controller, sink) =
            controller(device_config(1.0), Arc::new(MemoryOpener(emu)));
        let signals = controller.install_signal_handlers().unwrap();

        let raiser = tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            raise(Signal::SIGTERM).unwrap();
        });
        let outcome = controller.run().await;
        raiser.await.unwrap();

        assert_eq!(outcome, RunOutcome::Stopped);
        assert_eq!(sink.messages_with_prefix("SIGTERM received").len(), 1);
        assert_eq!(sink.messages_with_prefix("CLOSE serial").len(), 1);
        assert_eq!(sink.messages_with_prefix("EXIT").len(), 1);

        // A second signal, e.g. during cleanup, only raises the flag again.
        raise(Signal::SIGTERM).unwrap();
        assert!(wait_until(|| sink.messages_with_prefix("SIGTERM received").len() == 2).await);
        controller.shutdown().await;

        assert_eq!(sink.messages_with_prefix("CLOSE serial").len(), 1);
        assert_eq!(sink.messages_with_prefix("EXIT").len(), 1);
        assert!(sink.messages_at(Level::WARN).is_empty());
        assert!(sink.messages_at(Level::ERROR).is_empty());
        signals.abort();
    }
}

//! Transport provisioning.
//!
//! Turns the configured [`TransportSelection`] into an open [`Transport`]:
//!
//! - **Device**: open the given path, retrying for up to the open timeout.
//! - **Pair**: start the pairing helper, wait until both endpoints exist on the filesystem
//!   (a dangling link counts), then open the emulator side with the same retry policy. The
//!   application side is left for the software under test.
//!
//! The helper handle is stored in a caller-provided slot as soon as it is spawned, so the
//! caller can terminate it even when provisioning fails or is abandoned halfway.

use crate::config::{EmulatorConfig, TransportSelection};
use crate::error::{EmuResult, EmulatorError};
use crate::logging::LogSink;
use crate::pairing::{HelperCommand, PairingHelperHandle};
use crate::transport::{SerialOpener, Transport, TransportOpener};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Pause between open attempts.
pub const OPEN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pause between checks for the pair endpoints.
pub const ENDPOINT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Obtains the emulator's end of the link.
pub struct TransportProvisioner {
    selection: TransportSelection,
    baud: u32,
    open_timeout: Duration,
    pair_timeout: Duration,
    helper: HelperCommand,
    opener: Arc<dyn TransportOpener>,
    sink: Arc<dyn LogSink>,
}

impl TransportProvisioner {
    /// Provisioner for `config`, opening serial devices.
    pub fn new(config: &EmulatorConfig, sink: Arc<dyn LogSink>) -> Self {
        Self {
            selection: config.transport(),
            baud: config.baud,
            open_timeout: config.open_timeout(),
            pair_timeout: config.pair_timeout(),
            helper: HelperCommand::socat(config.pair_helper.clone()),
            opener: Arc::new(SerialOpener),
            sink,
        }
    }

    /// Use a different opener (an in-memory one in tests).
    pub fn with_opener(mut self, opener: Arc<dyn TransportOpener>) -> Self {
        self.opener = opener;
        self
    }

    /// Use a different helper command line.
    pub fn with_helper(mut self, helper: HelperCommand) -> Self {
        self.helper = helper;
        self
    }

    /// Acquisition mode in effect.
    pub fn selection(&self) -> &TransportSelection {
        &self.selection
    }

    /// Open the transport. A started helper is left in `helper_slot`, success or not.
    pub async fn acquire(
        &self,
        helper_slot: &mut Option<PairingHelperHandle>,
    ) -> EmuResult<Box<dyn Transport>> {
        match &self.selection {
            TransportSelection::Device(path) => {
                self.sink.info(&format!("manual port={path}"));
                open_with_retry(
                    self.opener.as_ref(),
                    path,
                    self.baud,
                    self.open_timeout,
                    self.sink.as_ref(),
                )
                .await
            }
            TransportSelection::Pair { app_side, emu_side } => {
                self.acquire_pair(app_side, emu_side, helper_slot).await
            }
        }
    }

    #[cfg(unix)]
    async fn acquire_pair(
        &self,
        app_side: &Path,
        emu_side: &Path,
        helper_slot: &mut Option<PairingHelperHandle>,
    ) -> EmuResult<Box<dyn Transport>> {
        let helper = helper_slot.insert(PairingHelperHandle::start(
            &self.helper,
            app_side,
            emu_side,
            self.sink.clone(),
        )?);

        wait_for_endpoints(helper, self.pair_timeout, self.sink.as_ref()).await?;
        self.sink.info(&format!(
            "PAIR appSide={} emuSide={}",
            app_side.display(),
            emu_side.display()
        ));

        open_with_retry(
            self.opener.as_ref(),
            &emu_side.to_string_lossy(),
            self.baud,
            self.open_timeout,
            self.sink.as_ref(),
        )
        .await
    }

    #[cfg(not(unix))]
    async fn acquire_pair(
        &self,
        _app_side: &Path,
        _emu_side: &Path,
        _helper_slot: &mut Option<PairingHelperHandle>,
    ) -> EmuResult<Box<dyn Transport>> {
        Err(EmulatorError::PairingUnsupported)
    }
}

/// Try to open `path` until it succeeds or `timeout` runs out.
///
/// Transient failures are retried every [`OPEN_POLL_INTERVAL`]. When the window closes the
/// last failure is reported as [`EmulatorError::Provisioning`].
pub async fn open_with_retry(
    opener: &dyn TransportOpener,
    path: &str,
    baud: u32,
    timeout: Duration,
    sink: &dyn LogSink,
) -> EmuResult<Box<dyn Transport>> {
    let start = Instant::now();
    let mut last_err: Option<EmulatorError> = None;

    while start.elapsed() < timeout {
        match opener.open(path, baud) {
            Ok(transport) => {
                sink.info(&format!(
                    "OPEN path={path} baud={baud} is_open={}",
                    transport.is_open()
                ));
                return Ok(transport);
            }
            Err(e) if e.is_transient() => {
                last_err = Some(e);
                tokio::time::sleep(OPEN_POLL_INTERVAL).await;
            }
            Err(e) => return Err(e),
        }
    }

    Err(EmulatorError::Provisioning {
        path: path.to_string(),
        message: last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "open retry timed out".to_string()),
    })
}

/// True if something exists at `path`, including a link whose target is gone.
pub fn endpoint_exists(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

/// Wait for both helper endpoints. Fails early if the helper quits; gives up with a warning
/// after `timeout` and lets the open retry take over.
pub async fn wait_for_endpoints(
    helper: &mut PairingHelperHandle,
    timeout: Duration,
    sink: &dyn LogSink,
) -> EmuResult<()> {
    let start = Instant::now();
    loop {
        if endpoint_exists(helper.app_side()) && endpoint_exists(helper.emu_side()) {
            return Ok(());
        }
        if let Some(status) = helper.try_exit_status()? {
            return Err(EmulatorError::HelperExited { status });
        }
        if start.elapsed() >= timeout {
            sink.warn(&format!(
                "endpoints {} / {} not present after {:?}",
                helper.app_side().display(),
                helper.emu_side().display(),
                timeout
            ));
            return Ok(());
        }
        tokio::time::sleep(ENDPOINT_POLL_INTERVAL).await;
    }
}

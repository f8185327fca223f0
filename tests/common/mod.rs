//! Shared helpers for the integration tests.
//!
//! - [`MemoryOpener`] hands the controller one end of an in-memory pair.
//! - [`emulator`] builds a controller that records into a [`MemorySink`].
//! - [`stop_after`] raises the stop flag after a delay, like a signal would.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use vserial_emu::config::EmulatorConfig;
use vserial_emu::error::EmuResult;
use vserial_emu::lifecycle::{LifecycleController, StopHandle};
use vserial_emu::logging::{LogSink, MemorySink};
use vserial_emu::provision::TransportProvisioner;
use vserial_emu::transport::{MemoryTransport, Transport, TransportOpener};

/// Opens the same in-memory transport every time.
pub struct MemoryOpener(pub MemoryTransport);

impl TransportOpener for MemoryOpener {
    fn open(&self, _path: &str, _baud: u32) -> EmuResult<Box<dyn Transport>> {
        Ok(Box::new(self.0.clone()))
    }
}

/// Device-mode configuration with short periods and no log file.
pub fn fast_config(tx_period: f64, stats_period: f64) -> EmulatorConfig {
    EmulatorConfig {
        baud: 9600,
        port: Some("mem://emulator".into()),
        tx_period,
        stats_period,
        echo: true,
        log_file: None,
        ..EmulatorConfig::default()
    }
}

/// A controller wired to `opener`, plus the sink it logs into.
pub fn emulator(
    config: EmulatorConfig,
    opener: Arc<dyn TransportOpener>,
) -> (LifecycleController, MemorySink) {
    let sink = MemorySink::new();
    let shared: Arc<dyn LogSink> = Arc::new(sink.clone());
    let provisioner = TransportProvisioner::new(&config, shared.clone()).with_opener(opener);
    (
        LifecycleController::new(config, shared).with_provisioner(provisioner),
        sink,
    )
}

/// Raise the stop flag after `after`.
pub fn stop_after(handle: StopHandle, after: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        handle.stop();
    });
}

/// Lines of `data`, without terminators.
pub fn lines(data: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(data)
        .lines()
        .map(str::to_string)
        .collect()
}

//! Serial device transport backed by the `serialport` crate.

use super::{idle_as_empty, Transport, TransportOpener};
use crate::error::EmuResult;
use serialport::{FlowControl, SerialPort};
use std::io::{self, Read, Write};
use std::time::Duration;

/// Bytes kept queued while the far end is not reading. Oldest bytes are dropped beyond this.
pub const DEFAULT_BACKLOG_LIMIT: usize = 1024 * 1024;

/// Serial port opened in non-blocking mode.
///
/// The port timeout is zero, so neither reads nor writes ever wait. Bytes the OS buffer cannot
/// take yet stay in an internal backlog and go out on later calls, so a far end that is slow
/// to read (or has not opened its side yet) never fails the link.
/// Hardware and software flow control are both disabled.
pub struct SerialTransport {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    name: String,

    /// Baud rate the port was opened with
    baud_rate: u32,

    /// `None` once closed
    port: Option<Box<dyn SerialPort>>,

    /// Written by the caller, not yet accepted by the OS
    backlog: Vec<u8>,
    backlog_limit: usize,
    dropped: u64,
}

impl SerialTransport {
    /// Open `path` at `baud_rate`.
    pub fn open(path: &str, baud_rate: u32) -> EmuResult<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::ZERO)
            .flow_control(FlowControl::None)
            .open()?;
        Ok(Self::with_port(path.to_string(), baud_rate, port))
    }

    /// Wrap a port that is already open, switching it to non-blocking I/O.
    pub fn from_port(name: impl Into<String>, mut port: Box<dyn SerialPort>) -> EmuResult<Self> {
        port.set_timeout(Duration::ZERO)?;
        let baud_rate = port.baud_rate()?;
        Ok(Self::with_port(name.into(), baud_rate, port))
    }

    fn with_port(name: String, baud_rate: u32, port: Box<dyn SerialPort>) -> Self {
        Self {
            name,
            baud_rate,
            port: Some(port),
            backlog: Vec::new(),
            backlog_limit: DEFAULT_BACKLOG_LIMIT,
            dropped: 0,
        }
    }

    /// Cap the backlog at `limit` bytes.
    pub fn with_backlog_limit(mut self, limit: usize) -> Self {
        self.backlog_limit = limit;
        self
    }

    /// Baud rate the port was opened with.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Bytes still waiting for the OS to accept them.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Bytes discarded because the backlog was full.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port is closed"))
    }

    /// Push as much of the backlog as the OS takes right now.
    fn drain_backlog(&mut self) -> io::Result<()> {
        while !self.backlog.is_empty() {
            let port = self
                .port
                .as_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port is closed"))?;
            match idle_as_empty(port.write(&self.backlog))? {
                0 => break,
                n => {
                    self.backlog.drain(..n);
                }
            }
        }
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.drain_backlog()?;
        let port = self.port()?;
        idle_as_empty(port.read(buf))
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port()?;
        self.backlog.extend_from_slice(data);
        self.drain_backlog()?;

        if self.backlog.len() > self.backlog_limit {
            let excess = self.backlog.len() - self.backlog_limit;
            self.backlog.drain(..excess);
            self.dropped += excess as u64;
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        // Dropping the handle closes the file descriptor.
        self.port.take();
        self.backlog.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Opens serial devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialOpener;

impl TransportOpener for SerialOpener {
    fn open(&self, path: &str, baud: u32) -> EmuResult<Box<dyn Transport>> {
        Ok(Box::new(SerialTransport::open(path, baud)?))
    }
}

//! Duplex byte-stream transports.
//!
//! A [`Transport`] is the emulator's end of the link. Reads never block: when nothing is
//! waiting the call returns `Ok(0)` immediately. Writes enqueue bytes for transmission.
//!
//! - [`SerialTransport`] wraps a device opened through the `serialport` crate.
//! - [`MemoryTransport`] is an in-process loopback or linked pair.

pub mod memory;
pub mod serial;

pub use memory::MemoryTransport;
pub use serial::{SerialOpener, SerialTransport};

use crate::error::EmuResult;
use std::io;

/// An open duplex byte stream.
pub trait Transport: Send {
    /// Read whatever is available, up to `buf.len()` bytes. Returns `Ok(0)` when idle.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write every byte of `data`.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Release the underlying handle. Calling it again is a no-op.
    fn close(&mut self) -> io::Result<()>;

    /// Whether the handle is still open.
    fn is_open(&self) -> bool;

    /// Human-readable name, usually the device path.
    fn name(&self) -> &str;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_available(buf)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).write_all(data)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Opens a transport by path. One attempt per call; retrying is the caller's business.
pub trait TransportOpener: Send + Sync {
    /// Try once to open `path` at `baud`.
    fn open(&self, path: &str, baud: u32) -> EmuResult<Box<dyn Transport>>;
}

/// Map "nothing to read right now" onto an empty read.
pub(crate) fn idle_as_empty(result: io::Result<usize>) -> io::Result<usize> {
    match result {
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) =>
        {
            Ok(0)
        }
        other => other,
    }
}

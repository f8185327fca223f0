//! In-process transport.
//!
//! Provides a loopback (everything written comes back on the next read) and a linked pair
//! (bytes written on one side are read on the other). Useful for running the link loop
//! without hardware or pseudo-terminals, and for failure injection in tests.

use super::Transport;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Queue {
    bytes: Mutex<VecDeque<u8>>,
}

impl Queue {
    fn push(&self, data: &[u8]) {
        self.bytes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(data.iter().copied());
    }

    fn pop_into(&self, buf: &mut [u8]) -> usize {
        let mut bytes = self.bytes.lock().unwrap_or_else(|e| e.into_inner());
        let n = buf.len().min(bytes.len());
        for (slot, byte) in buf.iter_mut().zip(bytes.drain(..n)) {
            *slot = byte;
        }
        n
    }

    fn len(&self) -> usize {
        self.bytes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// One end of an in-memory link.
///
/// # Example
///
/// ```
/// use vserial_emu::transport::{MemoryTransport, Transport};
///
/// let (mut emu, mut app) = MemoryTransport::pair("emu", "app");
/// app.write_all(b"hello\n").unwrap();
///
/// let mut buf = [0u8; 16];
/// let n = emu.read_available(&mut buf).unwrap();
/// assert_eq!(&buf[..n], b"hello\n");
/// ```
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    name: String,
    inbound: Arc<Queue>,
    outbound: Arc<Queue>,
    open: Arc<AtomicBool>,
    peer_open: Arc<AtomicBool>,
    fail_next_read: Arc<AtomicBool>,
    fail_next_write: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// A transport that reads back what it writes.
    pub fn loopback(name: impl Into<String>) -> Self {
        let queue = Arc::new(Queue::default());
        let open = Arc::new(AtomicBool::new(true));
        Self {
            name: name.into(),
            inbound: queue.clone(),
            outbound: queue,
            open: open.clone(),
            peer_open: open,
            fail_next_read: Arc::new(AtomicBool::new(false)),
            fail_next_write: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Two linked ends; what one writes, the other reads.
    pub fn pair(a: impl Into<String>, b: impl Into<String>) -> (Self, Self) {
        let a_to_b = Arc::new(Queue::default());
        let b_to_a = Arc::new(Queue::default());
        let a_open = Arc::new(AtomicBool::new(true));
        let b_open = Arc::new(AtomicBool::new(true));

        let first = Self {
            name: a.into(),
            inbound: b_to_a.clone(),
            outbound: a_to_b.clone(),
            open: a_open.clone(),
            peer_open: b_open.clone(),
            fail_next_read: Arc::new(AtomicBool::new(false)),
            fail_next_write: Arc::new(AtomicBool::new(false)),
        };
        let second = Self {
            name: b.into(),
            inbound: a_to_b,
            outbound: b_to_a,
            open: b_open,
            peer_open: a_open,
            fail_next_read: Arc::new(AtomicBool::new(false)),
            fail_next_write: Arc::new(AtomicBool::new(false)),
        };
        (first, second)
    }

    /// Make the next read fail with `BrokenPipe`.
    pub fn inject_read_failure(&self) {
        self.fail_next_read.store(true, Ordering::SeqCst);
    }

    /// Make the next write fail with `BrokenPipe`.
    pub fn inject_write_failure(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    /// Bytes waiting to be read on this end.
    pub fn pending(&self) -> usize {
        self.inbound.len()
    }

    /// Drain everything waiting on this end.
    pub fn take_all(&mut self) -> Vec<u8> {
        let mut buf = vec![0u8; self.inbound.len()];
        let n = self.inbound.pop_into(&mut buf);
        buf.truncate(n);
        buf
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("{} is closed", self.name),
            ))
        }
    }
}

impl Transport for MemoryTransport {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_open()?;
        if self.fail_next_read.swap(false, Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "injected read failure"));
        }
        Ok(self.inbound.pop_into(buf))
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.ensure_open()?;
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "injected write failure"));
        }
        if !self.peer_open.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"));
        }
        self.outbound.push(data);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_reads_back_writes() {
        let mut port = MemoryTransport::loopback("loop");
        port.write_all(b"abc").unwrap();
        assert_eq!(port.pending(), 3);

        let mut buf = [0u8; 2];
        assert_eq!(port.read_available(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"ab");
        assert_eq!(port.read_available(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'c');
        assert_eq!(port.read_available(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_pair_is_directional() {
        let (mut a, mut b) = MemoryTransport::pair("a", "b");
        a.write_all(b"to-b").unwrap();
        b.write_all(b"to-a").unwrap();

        assert_eq!(b.take_all(), b"to-b");
        assert_eq!(a.take_all(), b"to-a");
        assert!(a.take_all().is_empty());
    }

    #[test]
    fn test_peer_close_breaks_writes() {
        let (mut a, mut b) = MemoryTransport::pair("a", "b");
        b.close().unwrap();
        let err = a.write_all(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_closed_side_rejects_io_and_close_is_idempotent() {
        let mut port = MemoryTransport::loopback("loop");
        port.close().unwrap();
        port.close().unwrap();
        assert!(!port.is_open());

        let mut buf = [0u8; 4];
        assert_eq!(
            port.read_available(&mut buf).unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
    }

    #[test]
    fn test_injected_failures_fire_once() {
        let mut port = MemoryTransport::loopback("loop");
        let handle = port.clone();

        handle.inject_read_failure();
        let mut buf = [0u8; 4];
        assert!(port.read_available(&mut buf).is_err());
        assert!(port.read_available(&mut buf).is_ok());

        handle.inject_write_failure();
        assert!(port.write_all(b"x").is_err());
        assert!(port.write_all(b"x").is_ok());
    }
}

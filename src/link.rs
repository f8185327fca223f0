//! The link loop.
//!
//! [`LinkRunner`] owns the open transport and drives a cooperative poll loop. Each iteration
//! runs three steps in a fixed order:
//!
//! 1. **TX**: when the transmit deadline has passed, send `T=<wall_clock_millis> COUNT=<n>\n`
//!    and advance the deadline by exactly one period (no drift from slow iterations).
//! 2. **RX**: read whatever is available (never blocking), split complete lines off the
//!    pending buffer, log them and optionally echo them back.
//! 3. **Stats**: when the stats deadline has passed, log counters at WARN so they stand out.
//!
//! Then it sleeps for the poll interval. Any transport error ends the loop.

use crate::clock::Clock;
use crate::config::EmulatorConfig;
use crate::error::EmuResult;
use crate::logging::LogSink;
use crate::transport::Transport;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Largest single read from the transport.
pub const READ_CHUNK: usize = 65536;

/// Hex dumps show at most this many bytes.
pub const HEXDUMP_LIMIT: usize = 64;

/// Default sleep between iterations.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Loop behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSettings {
    /// Echo received lines back
    pub echo: bool,
    /// Add hex dumps to traffic records
    pub hexdump: bool,
    /// Interval between transmitted lines
    pub tx_period: Duration,
    /// Interval between statistics records
    pub stats_period: Duration,
    /// Sleep between iterations
    pub poll_interval: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            echo: true,
            hexdump: false,
            tx_period: Duration::from_secs(1),
            stats_period: Duration::from_secs(10),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl From<&EmulatorConfig> for LinkSettings {
    fn from(config: &EmulatorConfig) -> Self {
        Self {
            echo: config.echo,
            hexdump: config.hexdump,
            tx_period: config.tx_period(),
            stats_period: config.stats_period(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Snapshot of the traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Lines transmitted so far
    pub tx_lines: u64,
    /// Bytes received so far
    pub rx_bytes: u64,
    /// Received bytes not yet terminated by a newline
    pub pending: usize,
}

/// Mutable loop state. Only the loop touches it.
#[derive(Debug)]
struct LinkState {
    tx_count: u64,
    rx_bytes: u64,
    pending: Vec<u8>,
    next_tx: Instant,
    next_stats: Instant,
}

/// Drives the TX / RX / echo / stats loop over one transport.
pub struct LinkRunner<T: Transport> {
    transport: T,
    settings: LinkSettings,
    sink: Arc<dyn LogSink>,
    clock: Arc<dyn Clock>,
    state: LinkState,
    read_buf: Vec<u8>,
}

impl<T: Transport> LinkRunner<T> {
    /// Take ownership of an open transport. The first line goes out one TX period from now.
    pub fn new(
        transport: T,
        settings: LinkSettings,
        sink: Arc<dyn LogSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let start = clock.now();
        let state = LinkState {
            tx_count: 0,
            rx_bytes: 0,
            pending: Vec::new(),
            next_tx: start + settings.tx_period,
            next_stats: start + settings.stats_period,
        };
        Self {
            transport,
            settings,
            sink,
            clock,
            state,
            read_buf: vec![0u8; READ_CHUNK],
        }
    }

    /// Run until `stop` turns true (or its sender is dropped), or a transport error occurs.
    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) -> EmuResult<()> {
        loop {
            if *stop.borrow_and_update() {
                return Ok(());
            }
            self.poll_once()?;
            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One iteration of the loop, without the trailing sleep.
    pub fn poll_once(&mut self) -> EmuResult<()> {
        let now = self.clock.now();
        self.tx_step(now)?;
        self.rx_step()?;
        self.stats_step(now);
        Ok(())
    }

    /// Current counters.
    pub fn stats(&self) -> LinkStats {
        LinkStats {
            tx_lines: self.state.tx_count,
            rx_bytes: self.state.rx_bytes,
            pending: self.state.pending.len(),
        }
    }

    /// Received bytes still waiting for a newline.
    pub fn pending(&self) -> &[u8] {
        &self.state.pending
    }

    /// Borrow the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutably borrow the transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Give the transport back, e.g. to close it during shutdown.
    pub fn into_transport(self) -> T {
        self.transport
    }

    fn tx_step(&mut self, now: Instant) -> EmuResult<()> {
        if now < self.state.next_tx {
            return Ok(());
        }
        self.state.next_tx += self.settings.tx_period;

        let line = format!(
            "T={} COUNT={}\n",
            self.clock.unix_millis(),
            self.state.tx_count
        );
        self.transport.write_all(line.as_bytes())?;
        self.state.tx_count += 1;

        let mut record = format!("TX {} bytes={}", line.trim_end(), line.len());
        if self.settings.hexdump {
            let _ = write!(record, " hex={}", hexdump(line.as_bytes()));
        }
        self.sink.info(&record);
        Ok(())
    }

    fn rx_step(&mut self) -> EmuResult<()> {
        let n = self.transport.read_available(&mut self.read_buf)?;
        if n == 0 {
            return Ok(());
        }
        let data = &self.read_buf[..n];
        self.state.rx_bytes += n as u64;
        if self.settings.hexdump {
            self.sink
                .debug(&format!("RX bytes={} hex={}", n, hexdump(data)));
        }
        self.state.pending.extend_from_slice(data);

        while let Some(pos) = self.state.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.state.pending.drain(..=pos).collect();
            let text = decode_ignoring_invalid(&raw[..pos]);
            self.sink.info(&format!("RX {text:?}"));

            if self.settings.echo {
                let mut out = text.into_bytes();
                out.push(b'\n');
                self.transport.write_all(&out)?;
                if self.settings.hexdump {
                    self.sink.debug(&format!("ECHO hex={}", hexdump(&out)));
                }
            }
        }
        Ok(())
    }

    fn stats_step(&mut self, now: Instant) {
        if now < self.state.next_stats {
            return;
        }
        self.state.next_stats += self.settings.stats_period;
        self.sink.warn(&format!(
            "STATS tx_lines={} rx_bytes={} pending_buf={}",
            self.state.tx_count,
            self.state.rx_bytes,
            self.state.pending.len()
        ));
    }
}

/// Space-separated lowercase hex of the first [`HEXDUMP_LIMIT`] bytes, with ` …` when cut.
pub fn hexdump(bytes: &[u8]) -> String {
    let shown = &bytes[..bytes.len().min(HEXDUMP_LIMIT)];
    let mut out = String::with_capacity(shown.len() * 3 + 2);
    for (i, byte) in shown.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02x}");
    }
    if bytes.len() > HEXDUMP_LIMIT {
        out.push_str(" …");
    }
    out
}

/// Decode UTF-8, dropping byte sequences that are not valid.
pub fn decode_ignoring_invalid(bytes: &[u8]) -> String {
    bytes.utf8_chunks().map(|chunk| chunk.valid()).collect()
}

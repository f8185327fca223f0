//! Far-end serial device emulator.
//!
//! The emulator stands in for a device at the other end of a serial link so host software
//! can be exercised without hardware. Once a link is up it:
//!
//! - writes a `T=<unix-ms> COUNT=<n>` line every TX period,
//! - reads whatever arrives, splits it into newline-terminated lines, logs each one and
//!   optionally echoes it back,
//! - reports counters every stats period.
//!
//! The link is either an explicit device (`--port`) or, on POSIX systems, a pseudo-terminal
//! pair synthesized by an external helper (`socat`): the application under test opens one
//! endpoint and the emulator opens the other.
//!
//! ## Module layout
//!
//! - [`config`]: run configuration, layered from defaults, TOML, environment and CLI flags.
//! - [`error`]: the [`error::EmulatorError`] type shared by all modules.
//! - [`logging`]: the [`logging::LogSink`] seam and tracing setup.
//! - [`clock`]: time sources for the link loop.
//! - [`transport`]: byte transports (serial devices and in-memory pairs).
//! - [`pairing`]: the pairing helper process.
//! - [`provision`]: turning the configuration into an open transport.
//! - [`link`]: the TX/RX/stats loop.
//! - [`lifecycle`]: startup, signal handling and ordered shutdown.

pub mod clock;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod link;
pub mod logging;
pub mod pairing;
pub mod provision;
pub mod transport;

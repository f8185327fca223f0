//! Run configuration.
//!
//! The configuration is read once at startup and never changes for the lifetime of the run.
//! It is assembled with Figment from, in increasing order of precedence:
//!
//! 1. Built-in defaults ([`EmulatorConfig::default`])
//! 2. An optional TOML file passed with `--config`
//! 3. Environment variables prefixed with `VSERIAL_` (e.g. `VSERIAL_BAUD=9600`)
//! 4. Command-line flags, some of which also honour a legacy environment variable
//!    (`BAUD`, `EMU_LOG`, `EMU_LEVEL`, `PTY_A`, `PTY_B`)
//!
//! # Example
//!
//! ```no_run
//! use clap::Parser;
//! use vserial_emu::config::{Cli, EmulatorConfig};
//!
//! let cli = Cli::parse();
//! let config = EmulatorConfig::load(&cli)?;
//! println!("baud: {}", config.baud);
//! # Ok::<(), vserial_emu::config::ConfigError>(())
//! ```

use clap::{Parser, ValueEnum};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A provider could not be read or a value had the wrong type.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// Values parsed but are not usable together.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::LoadError(Box::new(err))
    }
}

/// Log verbosity names accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Hex dumps and helper diagnostics.
    #[value(name = "DEBUG")]
    #[serde(alias = "debug")]
    Debug,
    /// Traffic lines and lifecycle records.
    #[value(name = "INFO")]
    #[serde(alias = "info")]
    Info,
    /// Statistics and cleanup warnings only.
    #[value(name = "WARNING", alias = "WARN")]
    #[serde(alias = "warning", alias = "WARN", alias = "warn")]
    Warning,
    /// Failures only.
    #[value(name = "ERROR")]
    #[serde(alias = "error")]
    Error,
}

impl LogLevel {
    /// The matching `tracing` level.
    pub fn as_tracing(self) -> tracing::Level {
        match self {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// How the emulator obtains its end of the link. Exactly one mode is active per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSelection {
    /// Open an existing device directly (`/dev/ttyUSB0`, `COM11`, ...).
    Device(String),
    /// Start the pairing helper and open the emulator side of the synthesized pair.
    Pair {
        /// Endpoint intended for the application under test.
        app_side: PathBuf,
        /// Endpoint the emulator opens.
        emu_side: PathBuf,
    },
}

/// Top-level emulator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmulatorConfig {
    /// Baud rate used when opening the transport
    pub baud: u32,
    /// Seconds between transmitted lines
    pub tx_period: f64,
    /// Echo every received line back to the sender
    pub echo: bool,
    /// Add hex dumps to traffic records
    pub hexdump: bool,
    /// Seconds between statistics records
    pub stats_period: f64,
    /// Optional log file, in addition to stderr
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    /// Minimum level written to the log
    pub log_level: LogLevel,
    /// Explicit device; when absent a pseudo-terminal pair is synthesized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    /// Pair endpoint for the application under test
    pub pty_a: PathBuf,
    /// Pair endpoint opened by the emulator
    pub pty_b: PathBuf,
    /// Seconds to keep retrying the transport open
    pub open_timeout: f64,
    /// Seconds to wait for the pairing helper to create both endpoints
    pub pair_timeout: f64,
    /// Program that creates the pseudo-terminal pair
    pub pair_helper: String,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            baud: 115_200,
            tx_period: 1.0,
            echo: true,
            hexdump: false,
            stats_period: 10.0,
            log_file: Some(PathBuf::from("emulator.log")),
            log_level: LogLevel::Info,
            port: None,
            pty_a: PathBuf::from("/tmp/vserial.A"),
            pty_b: PathBuf::from("/tmp/vserial.B"),
            open_timeout: 15.0,
            pair_timeout: 15.0,
            pair_helper: "socat".to_string(),
        }
    }
}

impl EmulatorConfig {
    /// Load the layered configuration for the given command line and validate it.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(EmulatorConfig::default()));
        if let Some(path) = &cli.config {
            figment = figment.merge(Toml::file(path));
        }
        let mut config: EmulatorConfig = figment
            .merge(Env::prefixed("VSERIAL_"))
            .merge(Serialized::defaults(cli))
            .extract()?;

        if cli.no_echo {
            config.echo = false;
        }
        if cli.hex {
            config.hexdump = true;
        }
        if cli.no_log_file {
            config.log_file = None;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that values are usable together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.baud == 0 {
            return Err(ConfigError::ValidationError(
                "baud must be greater than zero".to_string(),
            ));
        }
        for (name, value) in [
            ("tx_period", self.tx_period),
            ("stats_period", self.stats_period),
            ("open_timeout", self.open_timeout),
            ("pair_timeout", self.pair_timeout),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be a positive number of seconds, got {value}"
                )));
            }
        }
        if let TransportSelection::Pair { app_side, emu_side } = self.transport() {
            if app_side == emu_side {
                return Err(ConfigError::ValidationError(format!(
                    "pair endpoints must differ, both are {}",
                    app_side.display()
                )));
            }
        }
        Ok(())
    }

    /// Resolve the transport acquisition mode for this platform.
    pub fn transport(&self) -> TransportSelection {
        if let Some(port) = &self.port {
            return TransportSelection::Device(port.clone());
        }
        default_selection(self)
    }

    /// Interval between transmitted lines.
    pub fn tx_period(&self) -> Duration {
        Duration::from_secs_f64(self.tx_period)
    }

    /// Interval between statistics records.
    pub fn stats_period(&self) -> Duration {
        Duration::from_secs_f64(self.stats_period)
    }

    /// How long to keep retrying the transport open.
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.open_timeout)
    }

    /// How long to wait for pair endpoints to appear.
    pub fn pair_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.pair_timeout)
    }
}

#[cfg(unix)]
fn default_selection(config: &EmulatorConfig) -> TransportSelection {
    TransportSelection::Pair {
        app_side: config.pty_a.clone(),
        emu_side: config.pty_b.clone(),
    }
}

// No pseudo-terminal pairing here: fall back to a com0com-style virtual port.
#[cfg(not(unix))]
fn default_selection(_config: &EmulatorConfig) -> TransportSelection {
    TransportSelection::Device(std::env::var("COM_EMU").unwrap_or_else(|_| "COM11".to_string()))
}

/// Command-line interface.
#[derive(Debug, Default, Parser, Serialize)]
#[command(
    name = "vserial-emu",
    version,
    about = "Emulates the far end of a serial link for testing host software"
)]
pub struct Cli {
    /// Optional TOML configuration file
    #[arg(long)]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Baud rate
    #[arg(long, env = "BAUD")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baud: Option<u32>,

    /// Seconds between transmitted lines
    #[arg(long = "tx-period")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_period: Option<f64>,

    /// Do not echo received lines
    #[arg(long = "no-echo")]
    #[serde(skip)]
    pub no_echo: bool,

    /// Include hex dumps in traffic records
    #[arg(long)]
    #[serde(skip)]
    pub hex: bool,

    /// Seconds between statistics records
    #[arg(long = "stats")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats_period: Option<f64>,

    /// Log file path
    #[arg(long = "log-file", env = "EMU_LOG")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,

    /// Log to stderr only
    #[arg(long = "no-log-file", conflicts_with = "log_file")]
    #[serde(skip)]
    pub no_log_file: bool,

    /// Log level
    #[arg(long = "level", env = "EMU_LEVEL", value_enum, ignore_case = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<LogLevel>,

    /// Windows: COMxx | POSIX: /dev/tty* | else auto-create a pseudo-terminal pair
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,

    /// Pair endpoint for the application under test
    #[arg(long = "pty-a", env = "PTY_A")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pty_a: Option<PathBuf>,

    /// Pair endpoint opened by the emulator
    #[arg(long = "pty-b", env = "PTY_B")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pty_b: Option<PathBuf>,

    /// Seconds to keep retrying the transport open
    #[arg(long = "open-timeout")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_timeout: Option<f64>,

    /// Seconds to wait for the pair endpoints to appear
    #[arg(long = "pair-timeout")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pair_timeout: Option<f64>,

    /// Program used to create the pseudo-terminal pair
    #[arg(long = "pair-helper")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pair_helper: Option<String>,
}

//! `vserial-emu` binary: parse flags, set up logging, run until stopped.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mimalloc::MiMalloc;
use vserial_emu::config::{Cli, EmulatorConfig};
use vserial_emu::lifecycle::LifecycleController;
use vserial_emu::logging::{init_tracing, TracingSink};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = EmulatorConfig::load(&cli).context("Failed to load configuration")?;

    // Flushes the log file on drop.
    let _guard = init_tracing(&config)?;

    let mut controller = LifecycleController::new(config, Arc::new(TracingSink));
    let _signals = controller
        .install_signal_handlers()
        .context("Failed to install signal handlers")?;
    let outcome = controller.run().await;

    Ok(outcome.exit_code())
}

//! Command-line entry point for the bus fabric. This binary owns process
//! plumbing only — machine assembly, ROM loading and the CPU itself are
//! external collaborators the fabric calls into via [`pc_fabric::CpuPort`],
//! not things this crate provides.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};

use pc_fabric::config::MachineConfig;
use pc_fabric::cpu::CpuStub;
use pc_fabric::System;

const EXIT_OK: u8 = 0;
const EXIT_NO_ROMS: u8 = 6;
const EXIT_CONFIG_ERROR: u8 = 1;

#[derive(Parser, Debug)]
#[command(name = "fabric-cli", about = "Run a PC-compatible machine's device/bus fabric")]
struct Args {
    /// Machine type to build (e.g. "ibm5150", "ibm5170").
    #[arg(long)]
    machine: String,

    /// Path to the INI-like machine configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory to search for ROM images, overriding the default search path.
    #[arg(long)]
    rom_dir: Option<PathBuf>,

    /// Run without attaching any video/audio front end.
    #[arg(long)]
    headless: bool,

    /// Request a fullscreen front end. Accepted but a no-op: no UI backend
    /// is in scope for this crate.
    #[arg(long)]
    fullscreen: bool,

    /// Per-subsystem log filter, passed straight through to `env_logger`
    /// (e.g. "pc_fabric::pic=trace,pc_fabric::pci=debug").
    #[arg(long, value_name = "SPEC")]
    log_mask: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_mask.as_deref());

    match run(&args) {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(err) => {
            error!("{err:#}");
            let code = err.downcast_ref::<CliExit>().map(|e| e.0).unwrap_or(EXIT_CONFIG_ERROR);
            ExitCode::from(code)
        }
    }
}

/// Tags an error with the specific exit code it should produce, distinct
/// from the generic "config was bad" default.
#[derive(Debug)]
struct CliExit(u8);

impl std::fmt::Display for CliExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "exit code {}", self.0)
    }
}
impl std::error::Error for CliExit {}

fn run(args: &Args) -> Result<()> {
    if args.fullscreen {
        warn!("--fullscreen accepted but ignored: no UI backend is built into this crate");
    }

    let config = match &args.config {
        Some(path) => MachineConfig::load(path)
            .with_context(|| format!("failed to load configuration {}", path.display()))?,
        None => MachineConfig::default(),
    };

    if let Some(rom_dir) = &args.rom_dir {
        if !rom_dir.is_dir() {
            return Err(anyhow::anyhow!("ROM directory {} does not exist", rom_dir.display()))
                .context(CliExit(EXIT_NO_ROMS));
        }
    }

    info!(
        "building machine '{}' ({} device sections in config)",
        args.machine,
        config.device_names().count()
    );

    let mut system = System::new();
    let mut cpu = CpuStub::new(0);

    if args.headless {
        info!("running headless; no timers registered beyond the fabric's own bookkeeping");
        system.step(0, &mut cpu);
    }

    info!("fabric ready; tsc={}", system.tsc());
    Ok(())
}

fn init_logging(mask: Option<&str>) {
    let mut builder = env_logger::Builder::new();
    match mask {
        Some(spec) => {
            builder.parse_filters(spec);
        }
        None => {
            builder.filter_level(log::LevelFilter::Info);
        }
    }
    let _ = builder.try_init();
}

//! mmorph - device listing and morphology benchmarks
//!
//! Runs the device session against synthetic images; image files are out of
//! scope for this tool.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use mmorph_compute::{DeviceClass, NdRange};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "mmorph")]
#[command(author, version, about = "Mathematical morphology on compute devices")]
#[command(long_about = "
Opens a device session, runs morphology kernels and reports timings.

Examples:
  mmorph devices                        # List usable devices
  mmorph bench                          # 20 openings of a 1024x1024 image
  mmorph bench -d cpu -n 5 --se 3x3
  mmorph bench --rows 480 --cols 640 --local 16x16
  RUST_LOG=mmorph_compute=trace mmorph bench -n 1
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// List usable devices in selection order
    #[command(visible_alias = "ls")]
    Devices,

    /// Time binarize + opening on a synthetic image
    #[command(visible_alias = "b")]
    Bench(BenchArgs),
}

#[derive(Args)]
struct BenchArgs {
    /// Device class (cpu, gpu, any)
    #[arg(short, long, default_value = "gpu")]
    device: DeviceClass,

    /// Image rows (rounded up to a multiple of 16)
    #[arg(long, default_value = "1024")]
    rows: u32,

    /// Image columns (rounded up to a multiple of 16)
    #[arg(long, default_value = "1024")]
    cols: u32,

    /// Structuring element rectangle, odd sides (e.g. 5x7)
    #[arg(long, default_value = "5x7")]
    se: String,

    /// Binarization threshold
    #[arg(short, long, default_value = "128")]
    threshold: i32,

    /// Iterations
    #[arg(short = 'n', long, default_value = "20")]
    iterations: usize,

    /// Work-group size (e.g. 64 or 16x16); ignored on CPU-class devices
    #[arg(long)]
    local: Option<NdRange>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .init();

    match cli.command {
        Commands::Devices => commands::devices::run(cli.verbose),
        Commands::Bench(args) => commands::bench::run(args, cli.verbose),
    }
}

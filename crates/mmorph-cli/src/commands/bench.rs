//! Bench command
//!
//! Opens a synthetic image, binarizes it and times repeated openings with a
//! rectangular structuring element. Per-iteration times come from the
//! device's event timestamps; the total is host wall time.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mmorph_compute::{DeviceSession, SessionConfig};
use mmorph_core::Image2d;
use tracing::{info, trace};

use crate::BenchArgs;

/// Synthetic test pattern: diagonal bands with a little high-frequency noise.
fn pattern(rows: u32, cols: u32) -> Image2d<i32> {
    Image2d::from_fn(rows, cols, |r, c| {
        let band = ((r + c) / 8) % 2 * 160;
        let noise = (r.wrapping_mul(73_856_093) ^ c.wrapping_mul(19_349_663)) % 96;
        (band + noise) as i32
    })
}

/// Device time of one opening: the sum of its two passes.
fn opening_time(erosion: Duration, dilation: Duration) -> Duration {
    erosion + dilation
}

pub fn run(args: BenchArgs, verbose: u8) -> Result<()> {
    trace!(rows = args.rows, cols = args.cols, se = %args.se, "bench::run");

    let se_window = super::parse_rect(&args.se)?;
    let mut config = SessionConfig::new(args.device).with_env();
    if let Some(local) = args.local {
        config = config.with_local_work_size(local);
    }
    let mut session = DeviceSession::with_config(config).context("Failed to open device session")?;
    println!("Device: {}", session.device_info());

    let img = pattern(args.rows, args.cols).padded(16, 16, 0);
    let se = session.load_se(&se_window)?;
    let id = session.open(&img)?;
    info!(rows = img.nrows(), cols = img.ncols(), se = %args.se, "Benchmark image opened");

    session.push_binarize(args.threshold, 1, 0)?.wait()?;

    let mut device_total = Duration::ZERO;
    let wall = Instant::now();
    for i in 0..args.iterations {
        // Opening issued pass by pass so both device times are counted.
        let erosion = session.push_naive_erosion(se)?;
        let dilation = session.push_naive_dilation(se)?;
        let elapsed = opening_time(erosion.elapsed()?, dilation.elapsed()?);
        device_total += elapsed;
        if verbose > 0 {
            println!("  [{i:>3}] opening: {:.3} ms", elapsed.as_secs_f64() * 1e3);
        }
    }
    session.finish()?;
    let wall = wall.elapsed();

    session.fetch(None)?.wait()?;
    let out = session.save(id)?;
    let foreground = out.data().iter().filter(|&&v| v != 0).count();

    let n = args.iterations.max(1) as f64;
    println!(
        "{}x{} opening ({}): {} iterations, {:.3} ms device, {:.3} ms wall per opening",
        out.nrows(),
        out.ncols(),
        args.se,
        args.iterations,
        device_total.as_secs_f64() * 1e3 / n,
        wall.as_secs_f64() * 1e3 / n,
    );
    println!("Foreground pixels: {foreground}");

    session.close(id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opening_time_counts_both_passes() {
        let t = opening_time(Duration::from_micros(300), Duration::from_micros(200));
        assert_eq!(t, Duration::from_micros(500));
    }

    #[test]
    fn test_pattern_range() {
        let img = pattern(32, 48);
        assert!(img.data().iter().all(|&v| (0..256).contains(&v)));
        assert!(img.data().iter().any(|&v| v >= 128));
        assert!(img.data().iter().any(|&v| v < 128));
    }
}

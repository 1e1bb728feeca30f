//! Subcommand implementations.

pub mod bench;
pub mod devices;

use anyhow::{Context, Result, bail};
use mmorph_core::Window;

/// Parses a `ROWSxCOLS` rectangle into a structuring element.
pub fn parse_rect(text: &str) -> Result<Window<i32>> {
    let (rows, cols) = text
        .split_once(['x', 'X'])
        .with_context(|| format!("expected ROWSxCOLS, got '{text}'"))?;
    let rows: u32 = rows.trim().parse().with_context(|| format!("invalid rows in '{text}'"))?;
    let cols: u32 = cols.trim().parse().with_context(|| format!("invalid cols in '{text}'"))?;
    if rows == 0 || cols == 0 {
        bail!("structuring element '{text}' is empty");
    }
    Ok(Window::rect(rows, cols)?)
}

//! In-process kernel implementations used by the host device.
//!
//! Each function runs the work-items of one dispatch over the global range,
//! clipped to the image, with rows spread across the rayon pool. Output
//! elements outside the range are left untouched, as on a real device.

use rayon::prelude::*;

use super::{Kernel, WORD_BITS};
use crate::Pixel;
use crate::device::NdRange;

/// Runs `kernel` reading `src` and writing `dst`.
///
/// `se` holds the structuring element triples for `naivemorph` and is empty
/// otherwise.
pub(crate) fn execute(
    kernel: &Kernel,
    src: &[Pixel],
    dst: &mut [Pixel],
    se: &[Pixel],
    nrows: usize,
    ncols: usize,
    global: NdRange,
) {
    match *kernel {
        Kernel::Unbitmap => unbitmap(src, dst, global.total()),
        Kernel::Binarize { threshold, min, max } => {
            binarize(src, dst, nrows, ncols, global, threshold, min, max)
        }
        Kernel::BitmappedBinarize {
            threshold,
            below,
            above,
            ..
        } => bitmapped_binarize(src, dst, global.total(), threshold, below, above),
        Kernel::NaiveMorph { target, .. } => naive_morph(src, dst, nrows, ncols, global, se, target),
        Kernel::BitmappedDilationH { colrad } => {
            packed_pass(src, dst, nrows, ncols, global, colrad, Axis::Row, Mode::Dilate)
        }
        Kernel::BitmappedDilationV { rowrad } => {
            packed_pass(src, dst, nrows, ncols, global, rowrad, Axis::Col, Mode::Dilate)
        }
        Kernel::BitmappedErosionH { colrad } => {
            packed_pass(src, dst, nrows, ncols, global, colrad, Axis::Row, Mode::Erode)
        }
        Kernel::BitmappedErosionV { rowrad } => {
            packed_pass(src, dst, nrows, ncols, global, rowrad, Axis::Col, Mode::Erode)
        }
    }
}

fn unbitmap(src: &[Pixel], dst: &mut [Pixel], words: usize) {
    let words = words.min(src.len()).min(dst.len() / WORD_BITS);
    dst.par_chunks_mut(WORD_BITS)
        .take(words)
        .enumerate()
        .for_each(|(w, out)| {
            let word = src[w] as u32;
            for (b, px) in out.iter_mut().enumerate() {
                *px = ((word >> b) & 1) as Pixel;
            }
        });
}

#[allow(clippy::too_many_arguments)]
fn binarize(
    src: &[Pixel],
    dst: &mut [Pixel],
    nrows: usize,
    ncols: usize,
    global: NdRange,
    threshold: Pixel,
    min: Pixel,
    max: Pixel,
) {
    let (rows, cols) = (global.y().min(nrows), global.x().min(ncols));
    dst.par_chunks_mut(ncols)
        .take(rows)
        .enumerate()
        .for_each(|(r, out)| {
            let row = &src[r * ncols..(r + 1) * ncols];
            for (px, &v) in out[..cols].iter_mut().zip(&row[..cols]) {
                *px = if v >= threshold { max } else { min };
            }
        });
}

fn bitmapped_binarize(
    src: &[Pixel],
    dst: &mut [Pixel],
    words: usize,
    threshold: Pixel,
    below: Pixel,
    above: Pixel,
) {
    let words = words.min(dst.len()).min(src.len() / WORD_BITS);
    dst[..words].par_iter_mut().enumerate().for_each(|(w, out)| {
        let pixels = &src[w * WORD_BITS..(w + 1) * WORD_BITS];
        let mut word = 0u32;
        for (b, &v) in pixels.iter().enumerate() {
            let bit = if v >= threshold { above } else { below };
            word |= ((bit & 1) as u32) << b;
        }
        *out = word as Pixel;
    });
}

fn naive_morph(
    src: &[Pixel],
    dst: &mut [Pixel],
    nrows: usize,
    ncols: usize,
    global: NdRange,
    se: &[Pixel],
    target: i32,
) {
    let (rows, cols) = (global.y().min(nrows), global.x().min(ncols));
    let points: Vec<(i64, i64, i64)> = se
        .chunks_exact(3)
        .map(|t| (t[0] as i64, t[1] as i64, t[2] as i64))
        .collect();
    let (h, w) = (nrows as i64, ncols as i64);

    dst.par_chunks_mut(ncols)
        .take(rows)
        .enumerate()
        .for_each(|(r, out)| {
            for (c, px) in out[..cols].iter_mut().enumerate() {
                let mut sum = 0i64;
                let mut hit: Option<Pixel> = None;
                for &(dr, dc, weight) in &points {
                    let (rr, cc) = (r as i64 + dr, c as i64 + dc);
                    let v = if rr >= 0 && rr < h && cc >= 0 && cc < w {
                        src[(rr * w + cc) as usize]
                    } else {
                        0
                    };
                    if v != 0 {
                        sum += weight;
                        hit = Some(hit.map_or(v, |m| m.max(v)));
                    } else {
                        sum -= weight;
                    }
                }
                *px = if sum >= target as i64 { hit.unwrap_or(1) } else { 0 };
            }
        });
}

#[derive(Clone, Copy)]
enum Axis {
    /// Along a row (horizontal pass).
    Row,
    /// Along a column (vertical pass).
    Col,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Dilate,
    Erode,
}

#[allow(clippy::too_many_arguments)]
fn packed_pass(
    src: &[Pixel],
    dst: &mut [Pixel],
    nrows: usize,
    ncols: usize,
    global: NdRange,
    radius: u32,
    axis: Axis,
    mode: Mode,
) {
    let wpr = ncols / WORD_BITS;
    if wpr == 0 {
        return;
    }
    let (rows, words) = (global.y().min(nrows), global.x().min(wpr));
    let rad = radius as i64;
    let bit = |row: usize, col: usize| ((src[row * wpr + col / WORD_BITS] as u32) >> (col % WORD_BITS)) & 1 == 1;

    dst.par_chunks_mut(wpr)
        .take(rows)
        .enumerate()
        .for_each(|(r, out)| {
            for (wx, px) in out[..words].iter_mut().enumerate() {
                let word = match axis {
                    Axis::Row => {
                        let mut word = 0u32;
                        for b in 0..WORD_BITS {
                            let col = (wx * WORD_BITS + b) as i64;
                            let in_row = |c: i64| c >= 0 && c < ncols as i64 && bit(r, c as usize);
                            let set = match mode {
                                Mode::Dilate => (-rad..=rad).any(|d| in_row(col + d)),
                                Mode::Erode => (-rad..=rad).all(|d| in_row(col + d)),
                            };
                            word |= (set as u32) << b;
                        }
                        word
                    }
                    Axis::Col => {
                        let mut word = if mode == Mode::Erode { u32::MAX } else { 0 };
                        for d in -rad..=rad {
                            let rr = r as i64 + d;
                            let w = if rr >= 0 && rr < nrows as i64 {
                                src[rr as usize * wpr + wx] as u32
                            } else {
                                0
                            };
                            match mode {
                                Mode::Dilate => word |= w,
                                Mode::Erode => word &= w,
                            }
                        }
                        word
                    }
                };
                *px = word as Pixel;
            }
        });
}

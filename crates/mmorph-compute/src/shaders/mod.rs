//! WGSL source of the morphology program.
//!
//! One module, one `@compute` entry point per [`crate::KernelName`]. Every
//! entry point binds the same group:
//!
//! | Binding | Contents |
//! |---------|----------|
//! | 0 | input image (`array<i32>`, read) |
//! | 1 | output image (`array<i32>`, read_write) |
//! | 2 | [`Params`](#params) uniform |
//! | 3 | structuring element triples (`naivemorph` only) |
//!
//! Work-group size comes from the `wg_x` / `wg_y` pipeline overrides so a
//! single module serves every local size. Scratch sizes are checked on the
//! host; the kernels read global memory directly.
//!
//! # Params
//!
//! `nrows, ncols, gx, gy` followed by four kernel arguments `a..d`:
//!
//! | Kernel | a | b | c | d |
//! |--------|---|---|---|---|
//! | binarize | threshold | min | max | - |
//! | bitmappedbinarize | threshold | bit below | bit at/above | - |
//! | naivemorph | rowrad | colrad | count | target |
//! | bitmappedmorph_* | radius | - | - | - |

/// The morphology program.
pub const MORPH_PROGRAM: &str = r#"
struct Params {
    nrows: i32,
    ncols: i32,
    gx: u32,
    gy: u32,
    a: i32,
    b: i32,
    c: i32,
    d: i32,
}

@group(0) @binding(0) var<storage, read> src: array<i32>;
@group(0) @binding(1) var<storage, read_write> dst: array<i32>;
@group(0) @binding(2) var<uniform> params: Params;
@group(0) @binding(3) var<storage, read> se: array<i32>;

override wg_x: u32 = 1u;
override wg_y: u32 = 1u;

fn in_grid(gid: vec3<u32>) -> bool {
    return gid.x < params.gx && gid.y < params.gy
        && i32(gid.x) < params.ncols && i32(gid.y) < params.nrows;
}

fn packed_bit(row: i32, col: i32) -> u32 {
    let wpr = params.ncols / 32;
    let word = bitcast<u32>(src[row * wpr + col / 32]);
    return (word >> u32(col % 32)) & 1u;
}

// Horizontal pass over one packed word: OR (dilate) or AND (erode) of the
// bits within `radius` columns. Bits outside the row count as 0.
fn packed_h(gid: vec3<u32>, erode: bool) {
    let wpr = params.ncols / 32;
    let wx = i32(gid.x);
    let row = i32(gid.y);
    if gid.x >= params.gx || gid.y >= params.gy || wx >= wpr || row >= params.nrows { return; }

    var word = 0u;
    for (var b = 0; b < 32; b = b + 1) {
        let col = wx * 32 + b;
        var acc = erode;
        for (var d = -params.a; d <= params.a; d = d + 1) {
            let c = col + d;
            var bit = 0u;
            if c >= 0 && c < params.ncols { bit = packed_bit(row, c); }
            if erode { acc = acc && bit == 1u; } else { acc = acc || bit == 1u; }
        }
        if acc { word = word | (1u << u32(b)); }
    }
    dst[row * wpr + wx] = bitcast<i32>(word);
}

// Vertical pass: whole words combine across `radius` rows.
fn packed_v(gid: vec3<u32>, erode: bool) {
    let wpr = params.ncols / 32;
    let wx = i32(gid.x);
    let row = i32(gid.y);
    if gid.x >= params.gx || gid.y >= params.gy || wx >= wpr || row >= params.nrows { return; }

    var word = select(0u, 0xffffffffu, erode);
    for (var d = -params.a; d <= params.a; d = d + 1) {
        let r = row + d;
        var w = 0u;
        if r >= 0 && r < params.nrows { w = bitcast<u32>(src[r * wpr + wx]); }
        if erode { word = word & w; } else { word = word | w; }
    }
    dst[row * wpr + wx] = bitcast<i32>(word);
}

@compute @workgroup_size(wg_x, wg_y, 1)
fn unbitmap(@builtin(global_invocation_id) gid: vec3<u32>) {
    let w = gid.x;
    if w >= params.gx { return; }

    let word = bitcast<u32>(src[w]);
    for (var b = 0u; b < 32u; b = b + 1u) {
        dst[w * 32u + b] = i32((word >> b) & 1u);
    }
}

@compute @workgroup_size(wg_x, wg_y, 1)
fn binarize(@builtin(global_invocation_id) gid: vec3<u32>) {
    if !in_grid(gid) { return; }

    let i = i32(gid.y) * params.ncols + i32(gid.x);
    dst[i] = select(params.b, params.c, src[i] >= params.a);
}

@compute @workgroup_size(wg_x, wg_y, 1)
fn bitmappedbinarize(@builtin(global_invocation_id) gid: vec3<u32>) {
    let w = gid.x;
    if w >= params.gx { return; }

    var word = 0u;
    for (var b = 0u; b < 32u; b = b + 1u) {
        let bit = select(params.b, params.c, src[w * 32u + b] >= params.a);
        word = word | ((u32(bit) & 1u) << b);
    }
    dst[w] = bitcast<i32>(word);
}

@compute @workgroup_size(wg_x, wg_y, 1)
fn naivemorph(@builtin(global_invocation_id) gid: vec3<u32>) {
    if !in_grid(gid) { return; }

    let row = i32(gid.y);
    let col = i32(gid.x);
    var sum = 0;
    var hit = 0;
    var any_hit = false;
    for (var i = 0; i < params.c; i = i + 1) {
        let rr = row + se[3 * i];
        let cc = col + se[3 * i + 1];
        let weight = se[3 * i + 2];
        var v = 0;
        if rr >= 0 && rr < params.nrows && cc >= 0 && cc < params.ncols {
            v = src[rr * params.ncols + cc];
        }
        if v != 0 {
            sum = sum + weight;
            if !any_hit || v > hit { hit = v; }
            any_hit = true;
        } else {
            sum = sum - weight;
        }
    }

    var value = 0;
    if sum >= params.d { value = select(1, hit, any_hit); }
    dst[row * params.ncols + col] = value;
}

@compute @workgroup_size(wg_x, wg_y, 1)
fn bitmappedmorph_dilation_h(@builtin(global_invocation_id) gid: vec3<u32>) {
    packed_h(gid, false);
}

@compute @workgroup_size(wg_x, wg_y, 1)
fn bitmappedmorph_dilation_v(@builtin(global_invocation_id) gid: vec3<u32>) {
    packed_v(gid, false);
}

@compute @workgroup_size(wg_x, wg_y, 1)
fn bitmappedmorph_erosion_h(@builtin(global_invocation_id) gid: vec3<u32>) {
    packed_h(gid, true);
}

@compute @workgroup_size(wg_x, wg_y, 1)
fn bitmappedmorph_erosion_v(@builtin(global_invocation_id) gid: vec3<u32>) {
    packed_v(gid, true);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KernelName;

    #[test]
    fn test_program_declares_every_entry_point() {
        for name in KernelName::ALL {
            let decl = format!("fn {}(", name.as_str());
            assert!(MORPH_PROGRAM.contains(&decl), "missing {name}");
        }
    }
}

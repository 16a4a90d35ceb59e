//! Utility functions

use crate::error::{H5Error, Result};

/// Integer division rounding up
pub fn ceil_div(value: u64, divisor: u64) -> u64 {
    if divisor == 0 {
        return 0;
    }
    value / divisor + u64::from(value % divisor != 0)
}

/// Floor of log2, with `log2_floor(0) == 0`
pub fn log2_floor(value: u64) -> u32 {
    if value == 0 {
        0
    } else {
        63 - value.leading_zeros()
    }
}

/// Row-major "down" products: `down[i] = dims[i + 1] * ... * dims[rank - 1]`
pub fn accumulate_reverse(dims: &[u64]) -> Vec<u64> {
    let mut down = vec![0u64; dims.len()];
    let mut acc = 1u64;

    for i in (0..dims.len()).rev() {
        down[i] = acc;
        acc = acc.saturating_mul(dims[i]);
    }

    down
}

/// Row-major linear index of `coords` given precomputed down products
pub fn linear_index(coords: &[u64], down: &[u64]) -> u64 {
    coords
        .iter()
        .zip(down)
        .fold(0u64, |acc, (&c, &d)| acc.wrapping_add(c.wrapping_mul(d)))
}

/// Inverse of [`linear_index`] for a shape
pub fn to_coordinates(mut index: u64, dims: &[u64]) -> Vec<u64> {
    let mut coords = vec![0u64; dims.len()];

    for i in (0..dims.len()).rev() {
        if dims[i] == 0 {
            continue;
        }
        coords[i] = index % dims[i];
        index /= dims[i];
    }

    coords
}

/// Move dimension `dim` to the front, shifting the leading dims back
pub fn swizzle(coords: &mut [u64], dim: usize) {
    if dim > 0 && dim < coords.len() {
        coords[..=dim].rotate_right(1);
    }
}

/// Reverse the bytes of every `unit_size`-wide unit in place
pub fn swap_units(data: &mut [u8], unit_size: usize) {
    if unit_size <= 1 {
        return;
    }
    for unit in data.chunks_exact_mut(unit_size) {
        unit.reverse();
    }
}

/// Fill `target` by repeating `pattern`; an empty pattern zero-fills
pub fn fill_repeating(target: &mut [u8], pattern: &[u8]) {
    if pattern.is_empty() || pattern.iter().all(|&b| b == 0) {
        target.fill(0);
        return;
    }

    for (dst, src) in target.iter_mut().zip(pattern.iter().cycle()) {
        *dst = *src;
    }
}

/// Checked conversion of a byte count to `usize`
pub fn to_usize(value: u64, what: &str) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| H5Error::OutOfBounds(format!("{} of {} does not fit in memory", what, value)))
}

/// Format byte size in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

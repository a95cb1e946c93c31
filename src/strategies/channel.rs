use rayon::prelude::*;

use super::KernelJob;
use crate::{
    colors::{triplet, Palette},
    device::DeviceBuffer,
    fractals::Grid,
};

/// Row-major triplet offset of cell `(x, y)`.
#[inline]
pub fn row_major_offset(grid: Grid, x: usize, y: usize) -> usize {
    (x * grid.width + y) * 3
}

/// Transposed triplet offset of cell `(x, y)`.
#[inline]
pub fn transposed_offset(grid: Grid, x: usize, y: usize) -> usize {
    (x + y * grid.height) * 3
}

#[inline]
fn write_triplet(buffer: &DeviceBuffer, offset: usize, words: [u32; 3]) {
    for (i, word) in words.into_iter().enumerate() {
        buffer.store(offset + i, word);
    }
}

/// One task per cell, each writing its triplet at both offsets. Cell `(x, y)`
/// and cell `(y, x)` target the same two triplets, so off the diagonal the
/// final value of each channel word depends on task scheduling.
#[tracing::instrument(level = "debug", skip_all, fields(cells = job.grid.cells()))]
pub fn run(job: &KernelJob, triplets: &DeviceBuffer) {
    let grid = job.grid;
    debug_assert!(grid.is_square());
    debug_assert_eq!(triplets.len(), grid.cells() * 3);
    (0..grid.cells()).into_par_iter().for_each(|index| {
        let (x, y) = grid.cell_coords(index);
        let words = triplet(job.shade(x, y, Palette::QuinticCubic));
        write_triplet(triplets, row_major_offset(grid, x, y), words);
        write_triplet(triplets, transposed_offset(grid, x, y), words);
    });
}

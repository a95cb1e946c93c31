use rayon::prelude::*;

use super::KernelJob;
use crate::{colors::pack, colors::Palette, device::DeviceBuffer};

/// One task per cell writing `pack(color)` at `x * height + y`. Cells are
/// disjoint, so tasks never coordinate.
#[tracing::instrument(level = "debug", skip_all, fields(cells = job.grid.cells()))]
pub fn run(job: &KernelJob, image: &DeviceBuffer) {
    let grid = job.grid;
    (0..grid.cells()).into_par_iter().for_each(|index| {
        let (x, y) = grid.cell_coords(index);
        image.store(index, pack(job.shade(x, y, Palette::Quadratic)));
    });
}

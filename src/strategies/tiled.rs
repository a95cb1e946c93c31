use std::sync::atomic::Ordering;

use super::{KernelJob, TileScatter};
use crate::{
    colors::{pack, packed_triplet, Palette},
    device::DeviceBuffer,
    fractals::Grid,
    workgroup::{self, Cohort, LaneFault},
};

/// Cell of `member` inside `tile`. Tiles are numbered column by column and
/// members run down each tile column, matching `lid.x * edge + lid.y`.
#[inline]
pub fn member_cell(grid: Grid, edge: usize, tile: usize, member: usize) -> (usize, usize) {
    let rows = grid.height / edge;
    let (tx, ty) = (tile / rows, tile % rows);
    (tx * edge + member / edge, ty * edge + member % edge)
}

#[inline]
fn write_scatter(scatter: &DeviceBuffer, grid: Grid, x: usize, y: usize, value: u32) {
    let offset = grid.cell_index(x, y) * 3;
    for (i, word) in packed_triplet(value).into_iter().enumerate() {
        scatter.store(offset + i, word);
    }
}

/// Work-group tiles of `edge * edge` cells. Each member computes its cell,
/// writes the packed image and stages its value in tile-local memory. After
/// the barrier the tile is scattered into the triplet buffer according to
/// `job.scatter`.
#[tracing::instrument(
    level = "debug",
    skip_all,
    fields(edge = job.tile_edge, scatter = ?job.scatter)
)]
pub fn run(
    job: &KernelJob,
    cohort: Cohort,
    image: &DeviceBuffer,
    scatter: &DeviceBuffer,
) -> Result<(), LaneFault> {
    let grid = job.grid;
    let edge = job.tile_edge;
    let (columns, rows) = grid.tiles(edge);
    let members = edge * edge;

    workgroup::dispatch(
        cohort,
        columns * rows,
        members,
        |tile, member, local| {
            let (x, y) = member_cell(grid, edge, tile, member);
            let value = pack(job.shade(x, y, Palette::Quadratic));
            image.store(grid.cell_index(x, y), value);
            local[member].store(value, Ordering::Relaxed);
        },
        |tile, member, local| match job.scatter {
            TileScatter::Leader => {
                if member == 0 {
                    for (m, value) in local.iter().enumerate() {
                        let (x, y) = member_cell(grid, edge, tile, m);
                        write_scatter(scatter, grid, x, y, value.load(Ordering::Relaxed));
                    }
                }
            }
            TileScatter::EveryMember => {
                let (x, y) = member_cell(grid, edge, tile, member);
                for value in local.iter() {
                    write_scatter(scatter, grid, x, y, value.load(Ordering::Relaxed));
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::Rng;

    use super::*;
    use crate::strategies::{packed, test_support::job};

    fn render(job: &KernelJob) -> (Vec<u32>, Vec<u32>) {
        let cells = job.grid.cells();
        let image = DeviceBuffer::new(cells);
        let scatter = DeviceBuffer::new(cells * 3);
        run(job, Cohort::new(4, 4), &image, &scatter).unwrap();
        let mut host_image = vec![0; cells];
        let mut host_scatter = vec![0; cells * 3];
        image.synchronize(&mut host_image);
        scatter.synchronize(&mut host_scatter);
        (host_image, host_scatter)
    }

    #[test]
    fn image_matches_packed_strategy() {
        let job = job(32, 16, 40);
        let (image, _) = render(&job);
        let reference = DeviceBuffer::new(job.grid.cells());
        packed::run(&job, &reference);
        let mut expected = vec![0; job.grid.cells()];
        reference.synchronize(&mut expected);
        assert_eq!(image, expected);
    }

    #[test]
    fn member_cells_cover_each_tile_once() {
        let grid = Grid::new(24, 16);
        let edge = 4;
        let (columns, rows) = grid.tiles(edge);
        let mut seen = HashSet::new();
        for tile in 0..columns * rows {
            for member in 0..edge * edge {
                let (x, y) = member_cell(grid, edge, tile, member);
                assert_eq!((x / edge, y / edge), (tile / rows, tile % rows));
                assert!(seen.insert((x, y)));
            }
        }
        assert_eq!(seen.len(), grid.cells());
    }

    #[test]
    fn leader_scatter_keeps_each_cells_own_value() {
        let job = job(16, 16, 25);
        let (image, scatter) = render(&job);
        for index in 0..job.grid.cells() {
            assert_eq!(
                scatter[index * 3..index * 3 + 3],
                packed_triplet(image[index])
            );
        }
    }

    #[test]
    fn every_member_scatter_repeats_the_last_tile_value() {
        let job = KernelJob {
            scatter: TileScatter::EveryMember,
            ..job(16, 16, 25)
        };
        let (image, scatter) = render(&job);
        let edge = job.tile_edge;
        let (columns, rows) = job.grid.tiles(edge);
        for tile in 0..columns * rows {
            let (lx, ly) = member_cell(job.grid, edge, tile, edge * edge - 1);
            let last = image[job.grid.cell_index(lx, ly)];
            for member in 0..edge * edge {
                let (x, y) = member_cell(job.grid, edge, tile, member);
                let offset = job.grid.cell_index(x, y) * 3;
                assert_eq!(scatter[offset..offset + 3], packed_triplet(last));
            }
        }
    }

    #[test]
    fn random_tile_edges_stay_inside_their_tile() {
        let mut rng = rand::thread_rng();
        for _ in 0..8 {
            let edge = rng.gen_range(1..=8);
            let job = KernelJob {
                tile_edge: edge,
                scatter: TileScatter::Leader,
                ..job(edge * rng.gen_range(1..=4), edge * rng.gen_range(1..=4), 12)
            };
            let (image, scatter) = render(&job);
            for index in 0..job.grid.cells() {
                assert_eq!(
                scatter[index * 3..index * 3 + 3],
                packed_triplet(image[index])
            );
            }
        }
    }
}

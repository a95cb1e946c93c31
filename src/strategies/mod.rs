//! The three compute strategies on the CPU thread-pool model.

pub mod channel;
pub mod packed;
pub mod tiled;

use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::{
    colors::{map_color, ColorBias, ColorSample, Palette},
    fractals::{map_to_complex, mandelbrot::iterate, ComputeDomain, Grid},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Packed 32-bit image, one independent write per cell.
    Packed,
    /// Flat triplet buffer written twice per cell.
    Channel,
    /// Work-group tiles with local memory, a barrier and a tile scatter.
    Tiled,
}

impl Strategy {
    pub fn slug(&self) -> &'static str {
        match self {
            Strategy::Packed => "packed",
            Strategy::Channel => "channel",
            Strategy::Tiled => "tiled",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Who writes the tile scatter after the work-group barrier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TileScatter {
    /// Member 0 writes every member's value to that member's own cell.
    #[default]
    Leader,
    /// Every member replays the whole tile into its own cell; the last tile
    /// value wins.
    EveryMember,
}

/// Inputs of one full-grid invocation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KernelJob {
    pub domain: ComputeDomain,
    pub grid: Grid,
    pub max_iterations: u32,
    pub bias: ColorBias,
    pub tile_edge: usize,
    pub scatter: TileScatter,
}

impl KernelJob {
    /// Domain mapping, escape-time iteration and colouring for one cell.
    #[inline]
    pub fn shade(&self, x: usize, y: usize, palette: Palette) -> ColorSample {
        let c = map_to_complex(&self.domain, x, y, self.grid.width, self.grid.height);
        map_color(iterate(c, self.max_iterations), self.bias, palette)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn job(width: usize, height: usize, max_iterations: u32) -> KernelJob {
        KernelJob {
            domain: ComputeDomain::new(-2.0, 1.0, 1.125, -1.125),
            grid: Grid::new(width, height),
            max_iterations,
            bias: ColorBias::new(250, 68, 32),
            tile_edge: 4,
            scatter: TileScatter::Leader,
        }
    }
}

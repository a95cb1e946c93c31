pub mod mandelbrot;

use num::Complex;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Single-precision point on the complex plane.
pub type ComplexSample = Complex<f32>;

/// Region of the complex plane covered by one invocation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComputeDomain {
    pub left: f32,
    pub right: f32,
    pub top: f32,
    pub bottom: f32,
}

impl ComputeDomain {
    pub const fn new(left: f32, right: f32, top: f32, bottom: f32) -> Self {
        ComputeDomain {
            left,
            right,
            top,
            bottom,
        }
    }
}

impl Default for ComputeDomain {
    fn default() -> Self {
        crate::config::DEFAULT_DOMAIN
    }
}

/// Sample grid resolution. Cells are addressed as `(x, y)` with
/// `x < width`, `y < height`; the packed layout stores cell `(x, y)` at
/// `x * height + y`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grid {
    pub width: usize,
    pub height: usize,
}

impl Grid {
    pub const fn new(width: usize, height: usize) -> Self {
        Grid { width, height }
    }

    pub fn cells(&self) -> usize {
        self.width * self.height
    }

    pub fn is_square(&self) -> bool {
        self.width == self.height
    }

    #[inline]
    pub fn cell_index(&self, x: usize, y: usize) -> usize {
        x * self.height + y
    }

    #[inline]
    pub fn cell_coords(&self, index: usize) -> (usize, usize) {
        (index / self.height, index % self.height)
    }

    /// Tile columns and rows for a square tile of edge `edge`.
    pub fn tiles(&self, edge: usize) -> (usize, usize) {
        (self.width / edge, self.height / edge)
    }

    pub fn check_tile_edge(&self, edge: usize) -> Result<(), EngineError> {
        if self.width == 0 || self.height == 0 {
            return Err(EngineError::InvalidGrid(format!(
                "grid {}x{} has no cells",
                self.width, self.height
            )));
        }
        if edge == 0 {
            return Err(EngineError::InvalidGrid(
                "tile edge must be positive".into(),
            ));
        }
        if self.width % edge != 0 || self.height % edge != 0 {
            return Err(EngineError::InvalidGrid(format!(
                "grid {}x{} is not divisible by tile edge {}",
                self.width, self.height, edge
            )));
        }
        Ok(())
    }

    /// The channel buffer writes every cell twice, once transposed, which only
    /// stays in bounds on a square grid.
    pub fn check_square(&self) -> Result<(), EngineError> {
        if !self.is_square() {
            return Err(EngineError::InvalidGrid(format!(
                "channel buffer needs a square grid, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

/// Maps grid cell `(grid_x, grid_y)` to its sample point. Every strategy goes
/// through here so results are bit-comparable across strategies.
#[inline]
pub fn map_to_complex(
    domain: &ComputeDomain,
    grid_x: usize,
    grid_y: usize,
    width: usize,
    height: usize,
) -> ComplexSample {
    Complex::new(
        domain.left + grid_x as f32 * (domain.right - domain.left) / width as f32,
        domain.top + grid_y as f32 * (domain.bottom - domain.top) / height as f32,
    )
}

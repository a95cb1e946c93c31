use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::fractals::{mandelbrot::IterationResult, Grid};

/// Per-channel colour bias, one byte per channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorBias {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl ColorBias {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        ColorBias { r, g, b }
    }
}

impl Default for ColorBias {
    fn default() -> Self {
        crate::config::DEFAULT_BIAS
    }
}

/// Unclamped channel words. Values above 255 are expected: channel
/// arithmetic wraps at the `u32` boundary and packing keeps whatever bits
/// survive the shift.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColorSample {
    pub r: u32,
    pub g: u32,
    pub b: u32,
}

impl ColorSample {
    pub const fn new(r: u32, g: u32, b: u32) -> Self {
        ColorSample { r, g, b }
    }
}

/// Which colour formula a strategy uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Palette {
    /// In-set keeps the bias, escaped is `count^2 * bias`.
    Quadratic,
    /// In-set is `count^3 * bias`, escaped is `count^5 * bias`.
    QuinticCubic,
}

#[inline]
fn power(count: u32, exponent: u32) -> u32 {
    count.wrapping_pow(exponent)
}

#[inline]
fn channel(result: IterationResult, bias: u8, palette: Palette) -> u32 {
    let bias = u32::from(bias);
    match (palette, result.escaped) {
        (Palette::Quadratic, false) => bias,
        (Palette::Quadratic, true) => power(result.count, 2).wrapping_mul(bias),
        (Palette::QuinticCubic, false) => power(result.count, 3).wrapping_mul(bias),
        (Palette::QuinticCubic, true) => power(result.count, 5).wrapping_mul(bias),
    }
}

#[inline]
pub fn map_color(result: IterationResult, bias: ColorBias, palette: Palette) -> ColorSample {
    ColorSample {
        r: channel(result, bias.r, palette),
        g: channel(result, bias.g, palette),
        b: channel(result, bias.b, palette),
    }
}

/// `(r << 16) | (g << 8) | b` without masking the channels first.
#[inline]
pub fn pack(color: ColorSample) -> u32 {
    (color.r << 16) | (color.g << 8) | color.b
}

#[inline]
pub fn unpack(packed: u32) -> ColorSample {
    ColorSample {
        r: (packed >> 16) & 0xFF,
        g: (packed >> 8) & 0xFF,
        b: packed & 0xFF,
    }
}

/// Channel-buffer triplet `[b, g << 8, r << 16]`.
#[inline]
pub fn triplet(color: ColorSample) -> [u32; 3] {
    [color.b, color.g << 8, color.r << 16]
}

/// Triplet written by the tile scatter for one packed value.
#[inline]
pub fn packed_triplet(packed: u32) -> [u32; 3] {
    [packed, packed << 8, packed << 16]
}

/// Unpacks a packed image into B,G,R bytes, row `y` major, ready for texture
/// upload. `out` must hold `grid.cells() * 3` bytes.
pub fn packed_to_bgr(image: &[u32], grid: Grid, out: &mut [u8]) {
    out.par_chunks_mut(grid.width * 3)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, pixel) in row.chunks_exact_mut(3).enumerate() {
                let color = unpack(image[grid.cell_index(x, y)]);
                pixel.copy_from_slice(&[color.b as u8, color.g as u8, color.r as u8]);
            }
        });
}

/// Converts a triplet buffer to B,G,R bytes in the same row order as
/// [`packed_to_bgr`], taking the low byte of each channel word.
pub fn triplets_to_bgr(triplets: &[u32], grid: Grid, out: &mut [u8]) {
    out.par_chunks_mut(grid.width * 3)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, pixel) in row.chunks_exact_mut(3).enumerate() {
                let offset = grid.cell_index(x, y) * 3;
                let words = &triplets[offset..offset + 3];
                pixel[0] = (words[0] & 0xFF) as u8;
                pixel[1] = ((words[1] >> 8) & 0xFF) as u8;
                pixel[2] = ((words[2] >> 16) & 0xFF) as u8;
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn escaped(count: u32) -> IterationResult {
        IterationResult {
            count,
            escaped: true,
        }
    }

    fn in_set(count: u32) -> IterationResult {
        IterationResult {
            count,
            escaped: false,
        }
    }

    #[test]
    fn quadratic_keeps_bias_inside_the_set() {
        let bias = ColorBias::new(250, 68, 32);
        let color = map_color(in_set(50), bias, Palette::Quadratic);
        assert_eq!(color, ColorSample::new(250, 68, 32));
    }

    #[test]
    fn quadratic_scales_escaped_points() {
        let bias = ColorBias::new(250, 68, 32);
        let color = map_color(escaped(3), bias, Palette::Quadratic);
        assert_eq!(color, ColorSample::new(9 * 250, 9 * 68, 9 * 32));
    }

    #[test]
    fn quintic_cubic_uses_both_powers() {
        let bias = ColorBias::new(2, 3, 5);
        assert_eq!(
            map_color(in_set(4), bias, Palette::QuinticCubic),
            ColorSample::new(64 * 2, 64 * 3, 64 * 5)
        );
        assert_eq!(
            map_color(escaped(4), bias, Palette::QuinticCubic),
            ColorSample::new(1024 * 2, 1024 * 3, 1024 * 5)
        );
    }

    #[test]
    fn channel_arithmetic_wraps_instead_of_saturating() {
        let bias = ColorBias::new(255, 255, 255);
        let color = map_color(escaped(1000), bias, Palette::QuinticCubic);
        let expected = 1000u32.wrapping_pow(5).wrapping_mul(255);
        assert_eq!(color.r, expected);
        assert_ne!(color.r, u32::MAX);
    }

    #[test]
    fn pack_round_trips_byte_channels() {
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let color = ColorSample::new(
                rng.gen_range(0..=255),
                rng.gen_range(0..=255),
                rng.gen_range(0..=255),
            );
            assert_eq!(unpack(pack(color)), color);
        }
    }

    #[test]
    fn pack_does_not_mask_wide_channels() {
        let color = ColorSample::new(0, 0x1FF, 0);
        assert_eq!(pack(color), 0x1FF00);
    }

    #[test]
    fn triplet_layout_is_b_g_r() {
        assert_eq!(triplet(ColorSample::new(1, 2, 3)), [3, 2 << 8, 1 << 16]);
        assert_eq!(packed_triplet(0x0A0B0C), [0x0A0B0C, 0x0A0B0C00, 0x0B0C0000]);
    }

    #[test]
    fn packed_texture_reads_column_major_cells_by_row() {
        let grid = Grid::new(2, 3);
        let mut image = vec![0u32; grid.cells()];
        image[grid.cell_index(1, 2)] = pack(ColorSample::new(10, 20, 30));
        let mut bgr = vec![0u8; grid.cells() * 3];
        packed_to_bgr(&image, grid, &mut bgr);
        let offset = (2 * grid.width + 1) * 3;
        assert_eq!(&bgr[offset..offset + 3], &[30, 20, 10]);
        assert_eq!(bgr.iter().filter(|&&b| b != 0).count(), 3);
    }

    #[test]
    fn triplet_texture_takes_low_channel_bytes() {
        let words = triplet(ColorSample::new(0x1AB, 0x2CD, 0x3EF));
        let mut bgr = [0u8; 3];
        triplets_to_bgr(&words, Grid::new(1, 1), &mut bgr);
        assert_eq!(bgr, [0xEF, 0xCD, 0xAB]);
    }
}

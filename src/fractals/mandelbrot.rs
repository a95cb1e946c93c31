use num::Complex;

use super::ComplexSample;

pub const ESCAPE_RADIUS: f32 = 2.0;

/// Outcome of the escape-time iteration for one sample.
/// `count == max_iterations` is the in-set sentinel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IterationResult {
    pub count: u32,
    pub escaped: bool,
}

/// True modulus, not the squared shortcut.
#[inline]
fn modulus(z: ComplexSample) -> f32 {
    (z.re * z.re + z.im * z.im).sqrt()
}

/// Iterates `z = z*z + c` from zero while `|z| < 2` and the cap is not hit.
/// A NaN modulus stops the loop.
#[inline]
pub fn iterate(c: ComplexSample, max_iterations: u32) -> IterationResult {
    let mut z = Complex::new(0.0, 0.0);
    let mut count = 0;
    while modulus(z) < ESCAPE_RADIUS && count < max_iterations {
        z = z * z + c;
        count += 1;
    }
    IterationResult {
        count,
        escaped: count < max_iterations,
    }
}

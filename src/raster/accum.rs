//! Per-pixel color accumulation.
//!
//! The compositing kernels are generic over the scalar the running color sum
//! is held in. Three-channel renders accumulate in `f32`; arbitrary channel
//! counts accumulate in `f16` to keep the per-pixel working set small, the
//! same trade the wide-channel path has always made. Rounding happens on
//! every add in that mode, which is part of the contract, not an accident
//! of the implementation.

use half::f16;

/// Scalar a running color sum can be held in.
pub trait AccumScalar: Copy + Default + Send + Sync {
    fn from_f32(v: f32) -> Self;
    fn to_f32(self) -> f32;
}

impl AccumScalar for f32 {
    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }
}

impl AccumScalar for f16 {
    #[inline]
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }

    #[inline]
    fn to_f32(self) -> f32 {
        self.to_f32()
    }
}

/// Flat `pixels x channels` accumulation buffer for one tile.
pub struct AccumBuffer<S: AccumScalar> {
    data: Vec<S>,
    channels: usize,
}

impl<S: AccumScalar> AccumBuffer<S> {
    pub fn new(pixels: usize, channels: usize) -> Self {
        Self {
            data: vec![S::default(); pixels * channels],
            channels,
        }
    }

    /// Add `weight * color` into one pixel's running sum.
    #[inline]
    pub fn accumulate(&mut self, pixel: usize, color: &[f32], weight: f32) {
        let base = pixel * self.channels;
        for c in 0..self.channels {
            let sum = self.data[base + c].to_f32() + weight * color[c];
            self.data[base + c] = S::from_f32(sum);
        }
    }

    /// Resolve one pixel: accumulated color plus leftover transmittance
    /// times the background.
    #[inline]
    pub fn resolve(&self, pixel: usize, t_final: f32, background: &[f32], out: &mut [f32]) {
        let base = pixel * self.channels;
        for c in 0..self.channels {
            out[c] = self.data[base + c].to_f32() + t_final * background[c];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_f32_accumulate_and_resolve() {
        let mut buf = AccumBuffer::<f32>::new(2, 3);
        buf.accumulate(1, &[1.0, 0.5, 0.0], 0.4);
        buf.accumulate(1, &[0.0, 1.0, 1.0], 0.3);

        let mut out = [0.0f32; 3];
        buf.resolve(1, 0.3, &[1.0, 1.0, 1.0], &mut out);
        assert_relative_eq!(out[0], 0.4 + 0.3, epsilon = 1e-6);
        assert_relative_eq!(out[1], 0.2 + 0.3 + 0.3, epsilon = 1e-6);
        assert_relative_eq!(out[2], 0.3 + 0.3, epsilon = 1e-6);

        // Untouched pixel resolves to pure background.
        buf.resolve(0, 1.0, &[0.25, 0.5, 0.75], &mut out);
        assert_eq!(out, [0.25, 0.5, 0.75]);
    }

    #[test]
    fn test_f16_matches_f32_within_half_precision() {
        let mut lo = AccumBuffer::<f16>::new(1, 5);
        let mut hi = AccumBuffer::<f32>::new(1, 5);
        let color = [0.9, 0.7, 0.5, 0.3, 0.1];
        for i in 0..10 {
            let w = 0.05 * (i + 1) as f32;
            lo.accumulate(0, &color, w);
            hi.accumulate(0, &color, w);
        }

        let bg = [0.0; 5];
        let mut a = [0.0f32; 5];
        let mut b = [0.0f32; 5];
        lo.resolve(0, 0.0, &bg, &mut a);
        hi.resolve(0, 0.0, &bg, &mut b);
        for c in 0..5 {
            assert_relative_eq!(a[c], b[c], epsilon = 1e-2);
        }
    }
}

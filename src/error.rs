//! Boundary-layer validation errors.
//!
//! The inner kernels assume validated inputs (index-parallel buffer lengths,
//! positive clip threshold, background length matching the channel count) and
//! are free to index without bounds ceremony. The public pipeline entry
//! points in [`crate::render`] perform all of these checks up front and
//! return one of the variants below instead of ever reaching the kernels
//! with malformed buffers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("buffer length mismatch for {name}: expected {expected}, got {got}")]
    BufferLength {
        name: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("tile size {0} out of range (expected 2..=16)")]
    TileSize(u32),

    #[error("clip threshold must be positive, got {0}")]
    ClipThreshold(f32),

    #[error("channel count must be at least 1, got {0}")]
    ChannelCount(usize),

    #[error("image dimensions must be non-zero, got {width}x{height}")]
    ImageSize { width: u32, height: u32 },

    #[error("gradient buffer length mismatch: expected {expected}, got {got}")]
    GradientLength { expected: usize, got: usize },
}

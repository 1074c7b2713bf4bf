//! Fundamental data structures: cameras, splat containers, shared math.

pub mod camera;
pub mod math;
pub mod splats;

pub use camera::Camera;
pub use math::{quat_to_rotmat, quat_to_rotmat_vjp};
pub use splats::SplatCloud;

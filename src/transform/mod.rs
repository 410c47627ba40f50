pub mod crop;
pub mod paste;
pub mod resample;

pub use crop::*;
pub use paste::*;
pub use resample::*;

use crate::volume::Point3;

pub trait Transform<T> {
    fn apply(&self, target: &T) -> T;
}

/// Mapping from physical points of a fixed (reference) space into a moving space.
/// Resampling a moving image through a spatial transform pulls values from
/// `transform_point(p)` for every fixed-space voxel position `p`.
pub trait SpatialTransform: Send + Sync {
    fn transform_point(&self, point: Point3) -> Point3;
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IdentityTransform;

impl SpatialTransform for IdentityTransform {
    fn transform_point(&self, point: Point3) -> Point3 {
        point
    }
}

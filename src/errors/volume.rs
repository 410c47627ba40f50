pub use snafu::Snafu;

use crate::volume::{Geometry, Index3, Point3};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum VolumeError {
    #[snafu(display("data shape {:?} does not match geometry size {:?}", shape, size))]
    ShapeMismatch { shape: Index3, size: Index3 },

    #[snafu(display("volume grids differ: expected {}, got {}", expected, actual))]
    GridMismatch { expected: Geometry, actual: Geometry },

    #[snafu(display(
        "region index={:?} size={:?} does not fit in a volume of size {:?}",
        index,
        size,
        bounds
    ))]
    RegionOutOfBounds {
        index: Index3,
        size: Index3,
        bounds: Index3,
    },

    #[snafu(display("cannot combine an empty list of volumes"))]
    EmptyVolumeList,

    #[snafu(display("invalid spacing {:?}, every component must be positive", spacing))]
    InvalidSpacing { spacing: Point3 },
}

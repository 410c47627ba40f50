use std::fmt;

/// Voxel index or voxel extent, ordered `[x, y, z]`
pub type Index3 = [usize; 3];

/// Physical point or vector in millimetres, ordered `[x, y, z]`
pub type Point3 = [f64; 3];

const GRID_TOLERANCE: f64 = 1e-4;

/// Sampling grid of a volume. Directions are assumed to be the identity, so the physical
/// position of voxel `i` is `origin + i * spacing` on each axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    pub size: Index3,
    pub spacing: Point3,
    pub origin: Point3,
}

impl Geometry {
    pub fn new(size: Index3, spacing: Point3, origin: Point3) -> Self {
        Self {
            size,
            spacing,
            origin,
        }
    }

    pub fn numel(&self) -> usize {
        self.size.iter().product()
    }

    pub fn is_valid(&self) -> bool {
        self.size.iter().all(|&s| s > 0) && self.spacing.iter().all(|&s| s > 0.0)
    }

    pub fn index_to_point(&self, index: Index3) -> Point3 {
        std::array::from_fn(|axis| self.origin[axis] + index[axis] as f64 * self.spacing[axis])
    }

    /// Continuous (fractional) voxel index of a physical point
    pub fn continuous_index(&self, point: Point3) -> Point3 {
        std::array::from_fn(|axis| (point[axis] - self.origin[axis]) / self.spacing[axis])
    }

    /// Physical extent covered by the voxels, edge to edge
    pub fn extent(&self) -> Point3 {
        std::array::from_fn(|axis| self.size[axis] as f64 * self.spacing[axis])
    }

    pub fn diagonal(&self) -> f64 {
        self.extent().iter().map(|e| e * e).sum::<f64>().sqrt()
    }

    pub fn voxel_volume(&self) -> f64 {
        self.spacing.iter().product()
    }

    /// Whether two grids sample the same physical positions
    pub fn matches(&self, other: &Geometry) -> bool {
        self.size == other.size
            && (0..3).all(|axis| {
                (self.spacing[axis] - other.spacing[axis]).abs() <= GRID_TOLERANCE
                    && (self.origin[axis] - other.origin[axis]).abs() <= GRID_TOLERANCE
            })
    }

    /// Geometry of the sub-grid starting at `index` with extent `size`
    pub fn region(&self, index: Index3, size: Index3) -> Geometry {
        Geometry {
            size,
            spacing: self.spacing,
            origin: self.index_to_point(index),
        }
    }

    /// Grid covering the same physical extent with a new voxel spacing
    pub fn with_spacing(&self, spacing: Point3) -> Geometry {
        let extent = self.extent();
        let size = std::array::from_fn(|axis| {
            ((extent[axis] / spacing[axis]).round() as usize).max(1)
        });
        // Keep the lower edge of the first voxel fixed
        let origin = std::array::from_fn(|axis| {
            self.origin[axis] - 0.5 * self.spacing[axis] + 0.5 * spacing[axis]
        });
        Geometry {
            size,
            spacing,
            origin,
        }
    }

    /// Grid subsampled by an integer shrink factor on every axis
    pub fn shrink(&self, factor: usize) -> Geometry {
        let factor = factor.max(1) as f64;
        self.with_spacing(std::array::from_fn(|axis| self.spacing[axis] * factor))
    }

    /// Grid with the same extent resampled to an isotropic voxel size
    pub fn isotropic(&self, voxel_size: f64) -> Geometry {
        self.with_spacing([voxel_size; 3])
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "size={:?} spacing=[{:.3}, {:.3}, {:.3}] origin=[{:.3}, {:.3}, {:.3}]",
            self.size,
            self.spacing[0],
            self.spacing[1],
            self.spacing[2],
            self.origin[0],
            self.origin[1],
            self.origin[2]
        )
    }
}

use crate::transform::{resample_to, Interpolator, SpatialTransform};
use crate::volume::{Geometry, Point3, Volume};

pub type Matrix3 = [[f64; 3]; 3];

pub const IDENTITY: Matrix3 = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

/// Affine map `p -> M (p - c) + c + t` from fixed space into moving space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearTransform {
    pub matrix: Matrix3,
    pub translation: Point3,
    pub center: Point3,
}

impl Default for LinearTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl LinearTransform {
    pub fn identity() -> Self {
        Self {
            matrix: IDENTITY,
            translation: [0.0; 3],
            center: [0.0; 3],
        }
    }
}

impl SpatialTransform for LinearTransform {
    fn transform_point(&self, point: Point3) -> Point3 {
        let offset: Point3 = std::array::from_fn(|axis| point[axis] - self.center[axis]);
        std::array::from_fn(|row| {
            let rotated: f64 = (0..3).map(|col| self.matrix[row][col] * offset[col]).sum();
            rotated + self.center[row] + self.translation[row]
        })
    }
}

/// Dense displacement field defined on the fixed grid, in millimetres.
/// A fixed point `p` maps to `p + u(p)`; points outside the field grid are not displaced.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplacementField {
    components: [Volume<f32>; 3],
}

impl DisplacementField {
    pub fn zeros(geometry: &Geometry) -> Self {
        Self {
            components: std::array::from_fn(|_| Volume::zeros(geometry)),
        }
    }

    pub fn geometry(&self) -> Geometry {
        self.components[0].geometry()
    }

    pub fn components_mut(&mut self) -> &mut [Volume<f32>; 3] {
        &mut self.components
    }

    /// Displacement at a physical point
    pub fn displacement(&self, point: Point3) -> Point3 {
        std::array::from_fn(|axis| {
            Interpolator::Linear
                .sample(&self.components[axis], point)
                .unwrap_or(0.0) as f64
        })
    }

    /// Same field sampled on another grid
    pub fn resampled(&self, geometry: &Geometry) -> Self {
        Self {
            components: std::array::from_fn(|axis| {
                resample_to(&self.components[axis], geometry, Interpolator::Linear)
            }),
        }
    }

    /// Largest displacement magnitude in millimetres
    pub fn max_magnitude(&self) -> f64 {
        let [x, y, z] = &self.components;
        x.data()
            .iter()
            .zip(y.data().iter())
            .zip(z.data().iter())
            .map(|((&a, &b), &c)| ((a * a + b * b + c * c) as f64).sqrt())
            .fold(0.0, f64::max)
    }
}

impl SpatialTransform for DisplacementField {
    fn transform_point(&self, point: Point3) -> Point3 {
        let displacement = self.displacement(point);
        std::array::from_fn(|axis| point[axis] + displacement[axis])
    }
}

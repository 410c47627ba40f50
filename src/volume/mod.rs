//! # Volumes
//!
//! A [`Volume`] couples a dense `ndarray` buffer indexed `[x, y, z]` with the physical
//! [`Geometry`] it samples. Intensity images are `Volume<f32>`, binary structure masks
//! are `Volume<u8>` holding `0` or `1`.

pub mod geometry;
pub use geometry::*;

use ndarray::{Array3, Zip};
use num::Zero;
use snafu::ensure;

use crate::errors::volume::{EmptyVolumeListSnafu, GridMismatchSnafu, ShapeMismatchSnafu};
use crate::errors::VolumeError;

#[derive(Debug, Clone, PartialEq)]
pub struct Volume<T> {
    data: Array3<T>,
    spacing: Point3,
    origin: Point3,
}

impl<T> Volume<T> {
    pub fn from_array(data: Array3<T>, spacing: Point3, origin: Point3) -> Self {
        Self {
            data,
            spacing,
            origin,
        }
    }

    /// Wrap `data` in a volume, checking it has the shape the geometry describes
    pub fn with_geometry(data: Array3<T>, geometry: &Geometry) -> Result<Self, VolumeError> {
        let (x, y, z) = data.dim();
        ensure!(
            [x, y, z] == geometry.size,
            ShapeMismatchSnafu {
                shape: [x, y, z],
                size: geometry.size,
            }
        );
        Ok(Self::from_array(data, geometry.spacing, geometry.origin))
    }

    pub fn geometry(&self) -> Geometry {
        Geometry::new(self.size(), self.spacing, self.origin)
    }

    pub fn size(&self) -> Index3 {
        let (x, y, z) = self.data.dim();
        [x, y, z]
    }

    pub fn spacing(&self) -> Point3 {
        self.spacing
    }

    pub fn origin(&self) -> Point3 {
        self.origin
    }

    pub fn data(&self) -> &Array3<T> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array3<T> {
        &mut self.data
    }

    pub fn map<U, F>(&self, f: F) -> Volume<U>
    where
        F: FnMut(&T) -> U,
    {
        Volume {
            data: self.data.map(f),
            spacing: self.spacing,
            origin: self.origin,
        }
    }

    /// Fail unless `other` lies on exactly the same grid
    pub fn ensure_same_grid<U>(&self, other: &Volume<U>) -> Result<(), VolumeError> {
        let expected = self.geometry();
        let actual = other.geometry();
        ensure!(
            expected.matches(&actual),
            GridMismatchSnafu { expected, actual }
        );
        Ok(())
    }
}

impl<T: Clone> Volume<T> {
    pub fn from_elem(geometry: &Geometry, value: T) -> Self {
        Self::from_array(
            Array3::from_elem(geometry.size, value),
            geometry.spacing,
            geometry.origin,
        )
    }
}

impl<T: Clone + Zero> Volume<T> {
    pub fn zeros(geometry: &Geometry) -> Self {
        Self::from_array(
            Array3::zeros(geometry.size),
            geometry.spacing,
            geometry.origin,
        )
    }
}

impl Volume<f32> {
    /// Binary mask of voxels strictly above `level`
    pub fn greater_than(&self, level: f32) -> Volume<u8> {
        self.map(|&v| u8::from(v > level))
    }

    /// Binary mask of voxels at or above `threshold`
    pub fn at_least(&self, threshold: f32) -> Volume<u8> {
        self.map(|&v| u8::from(v >= threshold))
    }

    /// Replace every voxel outside `mask` with `outside_value`
    pub fn masked(&self, mask: &Volume<u8>, outside_value: f32) -> Result<Volume<f32>, VolumeError> {
        self.ensure_same_grid(mask)?;
        let mut result = self.clone();
        Zip::from(&mut result.data)
            .and(&mask.data)
            .for_each(|v, &m| {
                if m == 0 {
                    *v = outside_value;
                }
            });
        Ok(result)
    }

    /// Voxel-wise mean of volumes that share one grid
    pub fn mean_of(volumes: &[&Volume<f32>]) -> Result<Volume<f32>, VolumeError> {
        let first = volumes.first().ok_or(EmptyVolumeListSnafu.build())?;
        let mut sum = first.map(|&v| v as f64);
        for volume in &volumes[1..] {
            first.ensure_same_grid(volume)?;
            Zip::from(&mut sum.data)
                .and(&volume.data)
                .for_each(|s, &v| *s += v as f64);
        }
        let count = volumes.len() as f64;
        Ok(sum.map(|&s| (s / count) as f32))
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().map(|&v| v as f64).sum()
    }
}

impl Volume<u8> {
    pub fn count_foreground(&self) -> usize {
        self.data.iter().filter(|&&v| v != 0).count()
    }

    pub fn is_empty_mask(&self) -> bool {
        self.data.iter().all(|&v| v == 0)
    }

    pub fn to_f32(&self) -> Volume<f32> {
        self.map(|&v| if v != 0 { 1.0 } else { 0.0 })
    }
}

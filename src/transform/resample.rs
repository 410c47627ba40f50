use ndarray::{Array3, Zip};
use serde::de::{self, Deserializer, Unexpected};
use serde::Deserialize;
use std::fmt;

use crate::transform::SpatialTransform;
use crate::volume::{Geometry, Point3, Volume};

/// Threshold applied to interpolated binary masks during label propagation
pub const LABEL_THRESHOLD: f32 = 0.5;

/// Interpolation of intensities between voxel centres. Settings may name it or give the
/// SimpleITK interpolator code; B-spline requests are served by trilinear interpolation.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Interpolator {
    Nearest,
    #[default]
    Linear,
}

impl fmt::Display for Interpolator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let interpolator_str = match self {
            Interpolator::Nearest => "nearest",
            Interpolator::Linear => "linear",
        };
        write!(f, "{interpolator_str}")
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum InterpolatorRepr {
    Code(u64),
    Name(String),
}

impl<'de> Deserialize<'de> for Interpolator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match InterpolatorRepr::deserialize(deserializer)? {
            InterpolatorRepr::Code(code) => Interpolator::from_code(code).ok_or_else(|| {
                de::Error::invalid_value(Unexpected::Unsigned(code), &"interpolator code 0, 1 or 3")
            }),
            InterpolatorRepr::Name(name) => Interpolator::from_name(&name).ok_or_else(|| {
                de::Error::invalid_value(Unexpected::Str(&name), &"nearest, linear or bspline")
            }),
        }
    }
}

impl Interpolator {
    /// Interpolator for a SimpleITK `sitk*` interpolator code
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Interpolator::Nearest),
            1 | 3 => Some(Interpolator::Linear),
            _ => None,
        }
    }

    /// Interpolator for a name, ignoring case and an `sitk` prefix
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.to_lowercase();
        match name.strip_prefix("sitk").unwrap_or(&name) {
            "nearest" | "nearestneighbor" => Some(Interpolator::Nearest),
            "linear" | "bspline" | "b_spline" => Some(Interpolator::Linear),
            _ => None,
        }
    }

    /// Sample `volume` at a physical point. Points further than half a voxel outside
    /// the grid return `None`.
    pub fn sample(&self, volume: &Volume<f32>, point: Point3) -> Option<f32> {
        let geometry = volume.geometry();
        let index = geometry.continuous_index(point);
        let inside = (0..3).all(|axis| {
            index[axis] >= -0.5 && index[axis] <= geometry.size[axis] as f64 - 0.5
        });
        if !inside {
            return None;
        }
        let data = volume.data();
        match self {
            Interpolator::Nearest => {
                let voxel: [usize; 3] = std::array::from_fn(|axis| {
                    (index[axis].round().max(0.0) as usize).min(geometry.size[axis] - 1)
                });
                Some(data[voxel])
            }
            Interpolator::Linear => Some(trilinear(data, &geometry, index)),
        }
    }
}

fn trilinear(data: &Array3<f32>, geometry: &Geometry, index: Point3) -> f32 {
    let mut low = [0usize; 3];
    let mut high = [0usize; 3];
    let mut frac = [0f64; 3];
    for axis in 0..3 {
        let last = (geometry.size[axis] - 1) as f64;
        let c = index[axis].clamp(0.0, last);
        let floor = c.floor();
        low[axis] = floor as usize;
        high[axis] = (low[axis] + 1).min(geometry.size[axis] - 1);
        frac[axis] = c - floor;
    }

    let mut value = 0.0f64;
    for corner in 0..8 {
        let mut weight = 1.0;
        let mut voxel = [0usize; 3];
        for axis in 0..3 {
            if corner >> axis & 1 == 1 {
                voxel[axis] = high[axis];
                weight *= frac[axis];
            } else {
                voxel[axis] = low[axis];
                weight *= 1.0 - frac[axis];
            }
        }
        if weight > 0.0 {
            value += weight * data[voxel] as f64;
        }
    }
    value as f32
}

/// Resample `moving` onto the grid of `reference` through `transform`. Fixed voxels
/// mapping outside the moving grid take `default_value`.
pub fn resample<S>(
    moving: &Volume<f32>,
    reference: &Geometry,
    transform: &S,
    interpolator: Interpolator,
    default_value: f32,
) -> Volume<f32>
where
    S: SpatialTransform + ?Sized,
{
    let mut result = Volume::from_elem(reference, default_value);
    Zip::indexed(result.data_mut()).par_for_each(|(x, y, z), value| {
        let point = transform.transform_point(reference.index_to_point([x, y, z]));
        if let Some(sampled) = interpolator.sample(moving, point) {
            *value = sampled;
        }
    });
    result
}

/// Propagate a binary label through `transform` without blurring it into fractional values
pub fn resample_labels<S>(labels: &Volume<u8>, reference: &Geometry, transform: &S) -> Volume<u8>
where
    S: SpatialTransform + ?Sized,
{
    resample(
        &labels.to_f32(),
        reference,
        transform,
        Interpolator::Linear,
        0.0,
    )
    .at_least(LABEL_THRESHOLD)
}

/// Resample onto a new grid covering the same physical space
pub fn resample_to(volume: &Volume<f32>, reference: &Geometry, interpolator: Interpolator) -> Volume<f32> {
    resample(
        volume,
        reference,
        &crate::transform::IdentityTransform,
        interpolator,
        0.0,
    )
}

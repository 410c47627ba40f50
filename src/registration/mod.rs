//! # Registration
//!
//! Collaborator contracts for aligning an atlas (moving) image onto the target (fixed)
//! image, together with the reference implementations shipped with the crate:
//! [`MeanSquaresRegistration`] for the linear stage and [`SymmetricDemons`] for the
//! deformable stage. Both return the moving image resampled onto the fixed grid and a
//! [`SpatialTransform`] that can propagate label volumes the same way.

pub mod demons;
pub mod linear;
pub mod spatial;

pub use demons::*;
pub use linear::*;
pub use spatial::*;

use serde::Deserialize;
use snafu::ensure;
use std::fmt;

use crate::errors::registration::{
    EmptyStagingSnafu, LinearStagingMismatchSnafu, StagingMismatchSnafu,
};
use crate::errors::RegistrationError;
use crate::transform::{resample_labels, Interpolator, SpatialTransform};
use crate::volume::{Geometry, Volume};

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Deserialize)]
pub enum RegistrationMethod {
    #[serde(alias = "translation")]
    Translation,
    #[serde(alias = "rigid")]
    Rigid,
    #[default]
    #[serde(alias = "similarity")]
    Similarity,
    #[serde(alias = "affine")]
    Affine,
}

impl RegistrationMethod {
    /// Whether the method estimates a scale in addition to the translation
    pub fn has_scale(&self) -> bool {
        matches!(self, RegistrationMethod::Similarity | RegistrationMethod::Affine)
    }
}

impl fmt::Display for RegistrationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let method_str = match self {
            RegistrationMethod::Translation => "translation",
            RegistrationMethod::Rigid => "rigid",
            RegistrationMethod::Similarity => "similarity",
            RegistrationMethod::Affine => "affine",
        };
        write!(f, "{method_str}")
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Optimiser {
    #[default]
    #[serde(alias = "gradient_descent_line_search")]
    GradientDescent,
    /// Stop after moment-based initialisation
    Moments,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    #[default]
    MeanSquares,
}

/// Options of the linear registration stage
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinearOptions {
    pub shrink_factors: Vec<usize>,
    pub smooth_sigmas: Vec<f64>,
    pub sampling_rate: f64,
    pub default_value: f32,
    pub optimiser: Optimiser,
    pub number_of_iterations: usize,
    pub final_interp: Interpolator,
    pub metric: Metric,
}

impl Default for LinearOptions {
    fn default() -> Self {
        Self {
            shrink_factors: vec![16, 8, 4],
            smooth_sigmas: vec![0.0, 0.0, 0.0],
            sampling_rate: 0.75,
            default_value: -1024.0,
            optimiser: Optimiser::GradientDescent,
            number_of_iterations: 50,
            final_interp: Interpolator::Linear,
            metric: Metric::MeanSquares,
        }
    }
}

impl LinearOptions {
    /// Single coarse level used to estimate the crop box
    pub fn coarse() -> Self {
        Self {
            shrink_factors: vec![16],
            smooth_sigmas: vec![0.0],
            number_of_iterations: 25,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), RegistrationError> {
        ensure!(!self.shrink_factors.is_empty(), EmptyStagingSnafu);
        ensure!(
            self.shrink_factors.len() == self.smooth_sigmas.len(),
            LinearStagingMismatchSnafu {
                shrink_factors: self.shrink_factors.len(),
                sigmas: self.smooth_sigmas.len(),
            }
        );
        Ok(())
    }
}

/// Options of the deformable (demons) stage
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DemonsOptions {
    pub isotropic_resample: bool,
    /// Voxel size in mm per stage when resampling isotropically, otherwise shrink factors
    pub resolution_staging: Vec<f64>,
    pub iteration_staging: Vec<usize>,
    /// Field smoothing per stage, in voxels of the stage grid
    pub smoothing_sigmas: Vec<f64>,
    pub ncores: usize,
}

impl Default for DemonsOptions {
    fn default() -> Self {
        Self {
            isotropic_resample: true,
            resolution_staging: vec![16.0, 8.0, 2.0],
            iteration_staging: vec![5, 5, 5],
            smoothing_sigmas: vec![0.0, 0.0, 0.0],
            ncores: 8,
        }
    }
}

impl DemonsOptions {
    pub fn validate(&self) -> Result<(), RegistrationError> {
        ensure!(!self.resolution_staging.is_empty(), EmptyStagingSnafu);
        ensure!(
            self.resolution_staging.len() == self.iteration_staging.len()
                && self.resolution_staging.len() == self.smoothing_sigmas.len(),
            StagingMismatchSnafu {
                resolutions: self.resolution_staging.len(),
                iterations: self.iteration_staging.len(),
                sigmas: self.smoothing_sigmas.len(),
            }
        );
        Ok(())
    }
}

/// Moving image resampled onto the fixed grid, and the transform that did it
#[derive(Debug, Clone)]
pub struct Registered<T> {
    pub image: Volume<f32>,
    pub transform: T,
}

pub trait LinearRegistration: Send + Sync {
    /// Align `moving` onto `fixed`. With a `guide` mask (on the moving grid) only moving
    /// voxels inside the guide contribute to the metric.
    fn register(
        &self,
        fixed: &Volume<f32>,
        moving: &Volume<f32>,
        method: RegistrationMethod,
        options: &LinearOptions,
        guide: Option<&Volume<u8>>,
    ) -> Result<Registered<LinearTransform>, RegistrationError>;
}

pub trait DeformableRegistration: Send + Sync {
    fn deform(
        &self,
        fixed: &Volume<f32>,
        moving: &Volume<f32>,
        options: &DemonsOptions,
    ) -> Result<Registered<DisplacementField>, RegistrationError>;
}

/// Carry a label volume onto the fixed grid through a registration transform,
/// keeping it binary
pub fn propagate<S>(fixed: &Geometry, labels: &Volume<u8>, transform: &S) -> Volume<u8>
where
    S: SpatialTransform + ?Sized,
{
    resample_labels(labels, fixed, transform)
}

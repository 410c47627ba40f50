use ndarray::Zip;
use snafu::{ensure, ResultExt};
use tracing::debug;

use crate::errors::registration::{InvalidResolutionSnafu, WorkerPoolSnafu};
use crate::errors::RegistrationError;
use crate::filter::gaussian_smooth_voxels;
use crate::registration::{DeformableRegistration, DemonsOptions, DisplacementField, Registered};
use crate::transform::{resample, resample_to, Interpolator};
use crate::volume::{Geometry, Volume};

/// Field smoothing applied when a stage is configured with a zero sigma
const DEFAULT_FIELD_SIGMA: f64 = 1.0;
const DENOMINATOR_EPSILON: f64 = 1e-9;

/// Multi-resolution symmetric-forces demons
#[derive(Debug, Clone, Copy, Default)]
pub struct SymmetricDemons;

/// Central-difference image gradient in intensity per millimetre, one-sided at the borders
pub fn gradient(volume: &Volume<f32>) -> [Volume<f32>; 3] {
    let size = volume.size();
    let spacing = volume.spacing();
    let data = volume.data();
    std::array::from_fn(|axis| {
        let mut result = Volume::zeros(&volume.geometry());
        if size[axis] < 2 {
            return result;
        }
        Zip::indexed(result.data_mut()).par_for_each(|(x, y, z), out| {
            let index = [x, y, z];
            let mut low = index;
            let mut high = index;
            low[axis] = index[axis].saturating_sub(1);
            high[axis] = (index[axis] + 1).min(size[axis] - 1);
            let distance = (high[axis] - low[axis]) as f64 * spacing[axis];
            *out = ((data[high] - data[low]) as f64 / distance) as f32;
        });
        result
    })
}

impl SymmetricDemons {
    fn stage_grid(
        fixed: &Geometry,
        resolution: f64,
        isotropic: bool,
    ) -> Result<Geometry, RegistrationError> {
        ensure!(
            resolution.is_finite() && resolution > 0.0,
            InvalidResolutionSnafu { resolution }
        );
        Ok(if isotropic {
            fixed.isotropic(resolution)
        } else {
            fixed.shrink(resolution.round().max(1.0) as usize)
        })
    }

    /// One additive demons update of `field` (on the grid of `fixed`)
    fn update(
        fixed: &Volume<f32>,
        fixed_gradient: &[Volume<f32>; 3],
        moving: &Volume<f32>,
        field: &mut DisplacementField,
        default_value: f32,
    ) -> f64 {
        let grid = fixed.geometry();
        let warped = resample(moving, &grid, &*field, Interpolator::Linear, default_value);
        let warped_gradient = gradient(&warped);
        let normaliser = grid.spacing.iter().map(|s| s * s).sum::<f64>() / 3.0;
        let max_step = 0.5 * grid.spacing.iter().cloned().fold(f64::MAX, f64::min);

        let [fx, fy, fz] = fixed_gradient;
        let [wx, wy, wz] = &warped_gradient;
        let (f, w) = (fixed.data(), warped.data());
        let [ux, uy, uz] = field.components_mut();
        Zip::indexed(ux.data_mut())
            .and(uy.data_mut())
            .and(uz.data_mut())
            .par_for_each(|(x, y, z), ux, uy, uz| {
                let index = [x, y, z];
                let difference = (f[index] - w[index]) as f64;
                let g = [
                    0.5 * (fx.data()[index] + wx.data()[index]) as f64,
                    0.5 * (fy.data()[index] + wy.data()[index]) as f64,
                    0.5 * (fz.data()[index] + wz.data()[index]) as f64,
                ];
                let denominator =
                    g.iter().map(|v| v * v).sum::<f64>() + difference * difference / normaliser;
                if denominator < DENOMINATOR_EPSILON {
                    return;
                }
                let mut step = g.map(|v| difference * v / denominator);
                let length = step.iter().map(|v| v * v).sum::<f64>().sqrt();
                if length > max_step {
                    step = step.map(|v| v * max_step / length);
                }
                *ux += step[0] as f32;
                *uy += step[1] as f32;
                *uz += step[2] as f32;
            });

        let squared_error: f64 = f
            .iter()
            .zip(w.iter())
            .map(|(&a, &b)| ((a - b) as f64).powi(2))
            .sum();
        squared_error / grid.numel() as f64
    }

    fn run(
        &self,
        fixed: &Volume<f32>,
        moving: &Volume<f32>,
        options: &DemonsOptions,
    ) -> Result<Registered<DisplacementField>, RegistrationError> {
        options.validate()?;
        let default_value = moving.data().iter().cloned().fold(f32::MAX, f32::min);
        let mut field: Option<DisplacementField> = None;

        let stages = options
            .resolution_staging
            .iter()
            .zip(&options.iteration_staging)
            .zip(&options.smoothing_sigmas);
        for ((&resolution, &iterations), &sigma) in stages {
            let grid = Self::stage_grid(&fixed.geometry(), resolution, options.isotropic_resample)?;
            let stage_fixed = resample_to(fixed, &grid, Interpolator::Linear);
            let stage_moving = resample_to(moving, &grid, Interpolator::Linear);
            let fixed_gradient = gradient(&stage_fixed);
            let sigma = if sigma > 0.0 { sigma } else { DEFAULT_FIELD_SIGMA };

            let mut stage_field = match &field {
                Some(previous) => previous.resampled(&grid),
                None => DisplacementField::zeros(&grid),
            };
            for iteration in 0..iterations {
                let error = Self::update(
                    &stage_fixed,
                    &fixed_gradient,
                    &stage_moving,
                    &mut stage_field,
                    default_value,
                );
                for component in stage_field.components_mut().iter_mut() {
                    *component = gaussian_smooth_voxels(component, sigma);
                }
                debug!(
                    "Demons stage {} iteration {}: mean squared error {:.3}",
                    resolution, iteration, error
                );
            }
            field = Some(stage_field);
        }

        let field = match field {
            Some(field) => field.resampled(&fixed.geometry()),
            None => DisplacementField::zeros(&fixed.geometry()),
        };
        let image = resample(
            moving,
            &fixed.geometry(),
            &field,
            Interpolator::Linear,
            default_value,
        );
        Ok(Registered {
            image,
            transform: field,
        })
    }
}

impl DeformableRegistration for SymmetricDemons {
    /// Runs in the calling rayon pool, or in a dedicated pool of `ncores` workers when
    /// called from outside any pool
    fn deform(
        &self,
        fixed: &Volume<f32>,
        moving: &Volume<f32>,
        options: &DemonsOptions,
    ) -> Result<Registered<DisplacementField>, RegistrationError> {
        if rayon::current_thread_index().is_some() || options.ncores == 0 {
            return self.run(fixed, moving, options);
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.ncores)
            .build()
            .context(WorkerPoolSnafu)?;
        pool.install(|| self.run(fixed, moving, options))
    }
}

use rayon::prelude::*;
use snafu::ensure;
use std::f64::consts::PI;
use tracing::debug;

use crate::errors::registration::{NoForegroundSnafu, NoOverlapSnafu, NonFiniteMetricSnafu};
use crate::errors::RegistrationError;
use crate::filter::gaussian_smooth;
use crate::registration::{
    LinearOptions, LinearRegistration, LinearTransform, Matrix3, Optimiser, RegistrationMethod,
    Registered, IDENTITY,
};
use crate::transform::{resample, resample_to, Interpolator, SpatialTransform};
use crate::volume::{Point3, Volume};

/// Intensities more than this above the default value count as foreground
const FOREGROUND_OFFSET: f32 = 24.0;
const SCALE_RANGE: (f64, f64) = (0.5, 2.0);
const GOLDEN_RATIO_CONJUGATE: f64 = 0.618_033_988_749_895;

/// Moment-initialised linear registration refined by regular-step gradient descent on
/// the mean squared intensity difference
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanSquaresRegistration;

/// Physical centre of mass and foreground volume (mm³) of voxels above `threshold`,
/// restricted to `mask` when one is given
fn moments(
    volume: &Volume<f32>,
    threshold: f32,
    mask: Option<&Volume<u8>>,
) -> Option<(Point3, f64)> {
    let geometry = volume.geometry();
    let mut sum = [0.0f64; 3];
    let mut count = 0usize;
    for ((x, y, z), &value) in volume.data().indexed_iter() {
        let in_mask = mask.map_or(true, |m| m.data()[[x, y, z]] != 0);
        if value > threshold && in_mask {
            let point = geometry.index_to_point([x, y, z]);
            for axis in 0..3 {
                sum[axis] += point[axis];
            }
            count += 1;
        }
    }
    (count > 0).then(|| {
        (
            sum.map(|s| s / count as f64),
            count as f64 * geometry.voxel_volume(),
        )
    })
}

/// Deterministic quasi-random subset of `round(n * rate)` sample indices, in ascending order
fn sample_indices(n: usize, rate: f64) -> Vec<usize> {
    if rate >= 1.0 {
        return (0..n).collect();
    }
    let count = ((n as f64 * rate.max(0.0)).round() as usize).clamp(n.min(1), n);
    let rank = |i: usize| (i as f64 * GOLDEN_RATIO_CONJUGATE).fract();
    let mut indices: Vec<usize> = (0..n).collect();
    indices.sort_by(|&a, &b| rank(a).total_cmp(&rank(b)));
    indices.truncate(count);
    indices.sort_unstable();
    indices
}

struct LevelMetric<'a> {
    points: Vec<(Point3, f32)>,
    moving: &'a Volume<f32>,
    guide: Option<&'a Volume<f32>>,
}

impl LevelMetric<'_> {
    /// Mean squared difference over the sample points mapping inside the moving image,
    /// or `None` when no point does
    fn evaluate(&self, transform: &LinearTransform) -> Option<f64> {
        let (sum, count) = self
            .points
            .par_iter()
            .filter_map(|&(point, fixed_value)| {
                let mapped = transform.transform_point(point);
                if let Some(guide) = self.guide {
                    if Interpolator::Linear.sample(guide, mapped)? < 0.5 {
                        return None;
                    }
                }
                let moving_value = Interpolator::Linear.sample(self.moving, mapped)?;
                let difference = (fixed_value - moving_value) as f64;
                Some((difference * difference, 1usize))
            })
            .reduce(|| (0.0, 0), |a, b| (a.0 + b.0, a.1 + b.1));
        (count > 0).then(|| sum / count as f64)
    }
}

/// Optimised parameters of each registration method. Translations are in millimetres;
/// rotation angles, log scale and matrix offsets are multiplied by a characteristic
/// radius so a unit step moves the foreground by about a millimetre.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Parameterisation {
    method: RegistrationMethod,
    center: Point3,
    radius: f64,
}

impl Parameterisation {
    fn len(&self) -> usize {
        match self.method {
            RegistrationMethod::Translation => 3,
            RegistrationMethod::Rigid => 6,
            RegistrationMethod::Similarity => 7,
            RegistrationMethod::Affine => 12,
        }
    }

    /// Parameters of an isotropic scale about the centre followed by a translation
    fn initial(&self, scale: f64, translation: Point3) -> Vec<f64> {
        let mut parameters = vec![0.0; self.len()];
        parameters[..3].copy_from_slice(&translation);
        match self.method {
            RegistrationMethod::Similarity => parameters[6] = scale.ln() * self.radius,
            RegistrationMethod::Affine => {
                for axis in 0..3 {
                    parameters[3 + 4 * axis] = (scale - 1.0) * self.radius;
                }
            }
            RegistrationMethod::Translation | RegistrationMethod::Rigid => {}
        }
        parameters
    }

    fn transform(&self, parameters: &[f64]) -> LinearTransform {
        let translation = [parameters[0], parameters[1], parameters[2]];
        let matrix = match self.method {
            RegistrationMethod::Translation => IDENTITY,
            RegistrationMethod::Rigid => rotation(self.angles(parameters)),
            RegistrationMethod::Similarity => {
                let scale = (parameters[6] / self.radius).exp();
                rotation(self.angles(parameters)).map(|row| row.map(|v| v * scale))
            }
            RegistrationMethod::Affine => std::array::from_fn(|row| {
                std::array::from_fn(|col| {
                    IDENTITY[row][col] + parameters[3 + 3 * row + col] / self.radius
                })
            }),
        };
        LinearTransform {
            matrix,
            translation,
            center: self.center,
        }
    }

    fn angles(&self, parameters: &[f64]) -> Point3 {
        [parameters[3], parameters[4], parameters[5]].map(|p| p / self.radius)
    }
}

/// Rotation `Rz Ry Rx` for angles in radians about x, y and z
fn rotation(angles: Point3) -> Matrix3 {
    let [(sx, cx), (sy, cy), (sz, cz)] = angles.map(f64::sin_cos);
    [
        [cy * cz, sx * sy * cz - cx * sz, cx * sy * cz + sx * sz],
        [cy * sz, sx * sy * sz + cx * cz, cx * sy * sz - sx * cz],
        [-sy, sx * cy, cx * cy],
    ]
}

/// Radius (mm) of the sphere with the same volume as the foreground
fn characteristic_radius(volume: f64, spacing: Point3) -> f64 {
    let min_spacing = spacing.iter().cloned().fold(f64::MAX, f64::min);
    (3.0 * volume / (4.0 * PI)).cbrt().max(min_spacing)
}

impl MeanSquaresRegistration {
    fn initialise(
        &self,
        fixed: &Volume<f32>,
        moving: &Volume<f32>,
        method: RegistrationMethod,
        options: &LinearOptions,
        guide: Option<&Volume<u8>>,
    ) -> Result<(Parameterisation, Vec<f64>), RegistrationError> {
        let threshold = options.default_value + FOREGROUND_OFFSET;
        let (fixed_center, fixed_volume) = moments(fixed, threshold, None).ok_or(
            NoForegroundSnafu {
                role: "fixed",
                threshold,
            }
            .build(),
        )?;
        let (moving_center, moving_volume) = moments(moving, threshold, guide).ok_or(
            NoForegroundSnafu {
                role: "moving",
                threshold,
            }
            .build(),
        )?;

        let scale = if method.has_scale() && guide.is_none() {
            (moving_volume / fixed_volume)
                .cbrt()
                .clamp(SCALE_RANGE.0, SCALE_RANGE.1)
        } else {
            1.0
        };
        let translation = std::array::from_fn(|axis| moving_center[axis] - fixed_center[axis]);
        debug!(
            "Moment initialisation: translation={:?} scale={:.3}",
            translation, scale
        );
        let parameterisation = Parameterisation {
            method,
            center: fixed_center,
            radius: characteristic_radius(fixed_volume, fixed.spacing()),
        };
        let parameters = parameterisation.initial(scale, translation);
        Ok((parameterisation, parameters))
    }

    fn optimise_level(
        &self,
        metric: &LevelMetric,
        parameterisation: &Parameterisation,
        initial: Vec<f64>,
        step: f64,
        iterations: usize,
        factor: usize,
    ) -> Result<Vec<f64>, RegistrationError> {
        let evaluate =
            |parameters: &[f64]| metric.evaluate(&parameterisation.transform(parameters));
        let mut parameters = initial;
        let mut current = evaluate(parameters.as_slice())
            .ok_or(NoOverlapSnafu { factor }.build())?;
        ensure!(current.is_finite(), NonFiniteMetricSnafu { value: current });

        let mut step = step;
        let min_step = step * 1e-2;
        for _ in 0..iterations {
            let delta = 0.5 * step;
            let gradient: Vec<f64> = (0..parameters.len())
                .map(|i| {
                    let mut forward = parameters.clone();
                    let mut backward = parameters.clone();
                    forward[i] += delta;
                    backward[i] -= delta;
                    match (evaluate(forward.as_slice()), evaluate(backward.as_slice())) {
                        (Some(f), Some(b)) => (f - b) / (2.0 * delta),
                        _ => 0.0,
                    }
                })
                .collect();
            let norm = gradient.iter().map(|g| g * g).sum::<f64>().sqrt();
            if norm == 0.0 || !norm.is_finite() {
                break;
            }
            let candidate: Vec<f64> = parameters
                .iter()
                .zip(&gradient)
                .map(|(p, g)| p - step * g / norm)
                .collect();
            match evaluate(candidate.as_slice()) {
                Some(value) if value < current => {
                    parameters = candidate;
                    current = value;
                }
                _ => {
                    step *= 0.5;
                    if step < min_step {
                        break;
                    }
                }
            }
        }
        ensure!(current.is_finite(), NonFiniteMetricSnafu { value: current });
        debug!("Level {} finished with metric {:.4}", factor, current);
        Ok(parameters)
    }
}

impl LinearRegistration for MeanSquaresRegistration {
    fn register(
        &self,
        fixed: &Volume<f32>,
        moving: &Volume<f32>,
        method: RegistrationMethod,
        options: &LinearOptions,
        guide: Option<&Volume<u8>>,
    ) -> Result<Registered<LinearTransform>, RegistrationError> {
        options.validate()?;
        if let Some(guide) = guide {
            moving.ensure_same_grid(guide)?;
        }
        let (parameterisation, mut parameters) =
            self.initialise(fixed, moving, method, options, guide)?;

        if options.optimiser == Optimiser::GradientDescent {
            let guide = guide.map(Volume::to_f32);
            for (&factor, &sigma) in options.shrink_factors.iter().zip(&options.smooth_sigmas) {
                let (fixed_level, moving_level) = if sigma > 0.0 {
                    (gaussian_smooth(fixed, sigma), gaussian_smooth(moving, sigma))
                } else {
                    (fixed.clone(), moving.clone())
                };
                let grid = fixed.geometry().shrink(factor);
                let fixed_level = resample_to(&fixed_level, &grid, Interpolator::Linear);
                let values: Vec<(Point3, f32)> = fixed_level
                    .data()
                    .indexed_iter()
                    .map(|((x, y, z), &v)| (grid.index_to_point([x, y, z]), v))
                    .collect();
                let points = sample_indices(values.len(), options.sampling_rate)
                    .into_iter()
                    .map(|i| values[i])
                    .collect();
                let metric = LevelMetric {
                    points,
                    moving: &moving_level,
                    guide: guide.as_ref(),
                };
                let step = grid.spacing.iter().cloned().fold(f64::MIN, f64::max);
                parameters = self.optimise_level(
                    &metric,
                    &parameterisation,
                    parameters,
                    step,
                    options.number_of_iterations,
                    factor,
                )?;
            }
        }

        let transform = parameterisation.transform(&parameters);
        debug!("{} registration finished: {:?}", method, transform);
        let image = resample(
            moving,
            &fixed.geometry(),
            &transform,
            options.final_interp,
            options.default_value,
        );
        Ok(Registered { image, transform })
    }
}

//! Weighted label fusion of the registered atlases.

use ndarray::Zip;
use rayon::prelude::*;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

use crate::errors::{SegmentationError, VolumeError};
use crate::filter::{fill_holes, gaussian_smooth, largest_component};
use crate::segmentation::atlas::{structure_label, AtlasSet, WeightMaps};
use crate::volume::Volume;

/// Probabilities below this are treated as zero
pub const PROBABILITY_FLOOR: f32 = 1e-4;

const DEFAULT_SIGMA: f64 = 2.0;
const DEFAULT_EPSILON: f64 = 1e-5;
const DEFAULT_FACTOR: f64 = 1e12;

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteType {
    #[default]
    Unweighted,
    Majority,
    Global,
    Local,
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vote_str = match self {
            VoteType::Unweighted => "unweighted",
            VoteType::Majority => "majority",
            VoteType::Global => "global",
            VoteType::Local => "local",
        };
        write!(f, "{vote_str}")
    }
}

/// Optional parameters of the weighted voting schemes
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct VoteParams {
    /// Smoothing of the local difference image, in millimetres
    pub sigma: Option<f64>,
    pub epsilon: Option<f64>,
    /// Numerator of the global weight
    pub factor: Option<f64>,
}

/// Per-voxel vote weight of a registered atlas image against the target
pub fn compute_weight_map(
    target: &Volume<f32>,
    atlas_image: &Volume<f32>,
    vote_type: VoteType,
    params: &VoteParams,
) -> Result<Volume<f32>, VolumeError> {
    target.ensure_same_grid(atlas_image)?;
    let weights = match vote_type {
        VoteType::Unweighted | VoteType::Majority => Volume::from_elem(&target.geometry(), 1.0),
        VoteType::Global => {
            let factor = params.factor.unwrap_or(DEFAULT_FACTOR);
            let squared: f64 = target
                .data()
                .iter()
                .zip(atlas_image.data().iter())
                .map(|(&t, &a)| ((t - a) as f64).powi(2))
                .sum();
            let weight = factor / squared.max(f64::MIN_POSITIVE);
            Volume::from_elem(&target.geometry(), weight as f32)
        }
        VoteType::Local => {
            let sigma = params.sigma.unwrap_or(DEFAULT_SIGMA);
            let epsilon = params.epsilon.unwrap_or(DEFAULT_EPSILON);
            let mut difference = target.clone();
            Zip::from(difference.data_mut())
                .and(atlas_image.data())
                .for_each(|d, &a| *d = (*d - a).abs());
            gaussian_smooth(&difference, sigma)
                .map(|&d| (1.0 / (epsilon + (d as f64).powi(2))) as f32)
        }
    };
    Ok(weights)
}

/// Weight maps of every atlas in the set, computed in parallel
pub fn compute_weight_maps(
    target: &Volume<f32>,
    atlases: &AtlasSet,
    vote_type: VoteType,
    params: &VoteParams,
) -> Result<WeightMaps, SegmentationError> {
    atlases
        .par_iter()
        .map(|(atlas_id, record)| {
            let weights = compute_weight_map(target, &record.deformable.image, vote_type, params)?;
            Ok::<_, SegmentationError>((atlas_id.clone(), weights))
        })
        .collect()
}

/// Weighted vote of the deformable-stage labels of one structure
pub fn combine_structure(
    atlases: &AtlasSet,
    weights: &WeightMaps,
    structure: &str,
) -> Result<Option<Volume<f32>>, SegmentationError> {
    let mut numerator: Option<Volume<f32>> = None;
    let mut denominator: Option<Volume<f32>> = None;
    for (atlas_id, record) in atlases {
        let label = structure_label(&record.deformable.labels, atlas_id, structure)?;
        let weight = weights
            .get(atlas_id)
            .ok_or_else(|| SegmentationError::MissingWeightMap {
                atlas_id: atlas_id.clone(),
            })?;
        label.ensure_same_grid(weight)?;

        let numerator = numerator.get_or_insert_with(|| Volume::zeros(&label.geometry()));
        let denominator = denominator.get_or_insert_with(|| Volume::zeros(&label.geometry()));
        numerator.ensure_same_grid(label)?;
        Zip::from(numerator.data_mut())
            .and(denominator.data_mut())
            .and(label.data())
            .and(weight.data())
            .for_each(|n, d, &l, &w| {
                let w = w.max(0.0);
                *d += w;
                if l != 0 {
                    *n += w;
                }
            });
    }

    Ok(numerator.zip(denominator).map(|(mut numerator, denominator)| {
        Zip::from(numerator.data_mut())
            .and(denominator.data())
            .for_each(|n, &d| {
                let p = if d > 0.0 { (*n / d).clamp(0.0, 1.0) } else { 0.0 };
                *n = if p < PROBABILITY_FLOOR { 0.0 } else { p };
            });
        numerator
    }))
}

/// Probability volume of every structure, fused over all atlases of the set
pub fn combine_labels(
    atlases: &AtlasSet,
    weights: &WeightMaps,
    structures: &[String],
) -> Result<BTreeMap<String, Volume<f32>>, SegmentationError> {
    let mut combined = BTreeMap::new();
    for structure in structures {
        let Some(probability) = combine_structure(atlases, weights, structure)? else {
            continue;
        };
        if probability.sum() == 0.0 {
            warn!("Fused probability of {} is empty", structure);
        }
        combined.insert(structure.clone(), probability);
    }
    Ok(combined)
}

/// Voxels with probability at or above `threshold`
pub fn threshold(probability: &Volume<f32>, threshold: f64) -> Volume<u8> {
    probability.at_least(threshold as f32)
}

/// Threshold a probability volume and optionally keep its hole-filled largest component
pub fn process_probability(probability: &Volume<f32>, level: f64, post_process: bool) -> Volume<u8> {
    let binary = threshold(probability, level);
    if post_process && !binary.is_empty_mask() {
        fill_holes(&largest_component(&binary))
    } else {
        binary
    }
}

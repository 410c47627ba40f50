//! # Iterative atlas removal
//!
//! Atlases whose deformed reference structure disagrees with the consensus of the others
//! are removed, one round at a time, until no atlas is an outlier or a further removal
//! would leave fewer than `minBestAtlases`.
//!
//! The per-atlas disagreement is a [`ConsistencyStatistic`]. The default,
//! [`LeaveOneOutZScore`], samples every atlas's signed distance map on the surface of the
//! consensus structure and scores each atlas by its mean absolute z-score against the
//! remaining atlases.

use itertools::Itertools;
use rayon::prelude::*;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fmt;
use tracing::{debug, info, warn};

use crate::errors::SegmentationError;
use crate::filter::{boundary_voxels, centroid, gaussian_smooth, signed_distance_map};
use crate::segmentation::atlas::{structure_label, AtlasSet, AtlasStage, DroppedAtlas, WeightMaps};
use crate::segmentation::fusion::combine_structure;
use crate::settings::IarSettings;
use crate::volume::{Index3, Point3, Volume};

const CONSENSUS_LEVEL: f32 = 0.95;
const CONSENSUS_FALLBACK_LEVEL: f32 = 0.5;
const MAD_TO_STD: f64 = 1.4826;
const SCALE_FLOOR: f64 = 1e-3;
const MIN_ATLASES: usize = 3;
const POLAR_BINS: usize = 18;
const AZIMUTH_BINS: usize = 36;

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ZScoreStatistic {
    /// Median and scaled median absolute deviation
    #[default]
    #[serde(rename = "MAD", alias = "mad")]
    Mad,
    /// Mean and standard deviation
    #[serde(rename = "STD", alias = "std")]
    Std,
}

impl fmt::Display for ZScoreStatistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let statistic_str = match self {
            ZScoreStatistic::Mad => "MAD",
            ZScoreStatistic::Std => "STD",
        };
        write!(f, "{statistic_str}")
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum OutlierMethod {
    /// Above Q3 + factor * IQR
    #[default]
    #[serde(rename = "IQR", alias = "iqr")]
    Iqr,
    /// Above mean + factor * standard deviation
    #[serde(rename = "STD", alias = "std")]
    Std,
}

impl fmt::Display for OutlierMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let method_str = match self {
            OutlierMethod::Iqr => "IQR",
            OutlierMethod::Std => "STD",
        };
        write!(f, "{method_str}")
    }
}

/// Percentile `p` in [0, 1] of sorted values, interpolating linearly between order statistics
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let position = p.clamp(0.0, 1.0) * (n - 1) as f64;
            let low = position.floor() as usize;
            let high = (low + 1).min(n - 1);
            let fraction = position - low as f64;
            sorted[low] + fraction * (sorted[high] - sorted[low])
        }
    }
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut values = values.to_vec();
    values.sort_by(|a, b| a.total_cmp(b));
    values
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64]) -> f64 {
    let mu = mean(values);
    (values.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

impl ZScoreStatistic {
    /// Centre and spread of a sample
    pub fn centre_and_scale(&self, values: &[f64]) -> (f64, f64) {
        match self {
            ZScoreStatistic::Mad => {
                let median = percentile(&sorted(values), 0.5);
                let deviations: Vec<f64> = values.iter().map(|v| (v - median).abs()).collect();
                (median, MAD_TO_STD * percentile(&sorted(&deviations), 0.5))
            }
            ZScoreStatistic::Std => (mean(values), std_dev(values)),
        }
    }
}

impl OutlierMethod {
    /// Statistic value above which an atlas is an outlier
    pub fn threshold(&self, values: &[f64], factor: f64) -> f64 {
        match self {
            OutlierMethod::Iqr => {
                let sorted = sorted(values);
                let q1 = percentile(&sorted, 0.25);
                let q3 = percentile(&sorted, 0.75);
                q3 + factor * (q3 - q1)
            }
            OutlierMethod::Std => mean(values) + factor * std_dev(values),
        }
    }
}

/// Scores every atlas by how much its reference structure disagrees with the others.
/// Larger is worse. An empty result means the set cannot be scored and nothing is removed.
pub trait ConsistencyStatistic: Send + Sync {
    fn evaluate(
        &self,
        atlases: &AtlasSet,
        weights: &WeightMaps,
        settings: &IarSettings,
    ) -> Result<BTreeMap<String, f64>, SegmentationError>;
}

/// Mean absolute leave-one-out z-score of the atlas distance maps sampled on the
/// consensus surface
#[derive(Debug, Clone, Copy, Default)]
pub struct LeaveOneOutZScore;

impl LeaveOneOutZScore {
    /// Consensus mask of the reference structure, relaxing the vote level if nothing passes
    fn consensus(
        atlases: &AtlasSet,
        weights: &WeightMaps,
        structure: &str,
    ) -> Result<Option<Volume<u8>>, SegmentationError> {
        let Some(probability) = combine_structure(atlases, weights, structure)? else {
            return Ok(None);
        };
        let strict = probability.at_least(CONSENSUS_LEVEL);
        if !strict.is_empty_mask() {
            return Ok(Some(strict));
        }
        let relaxed = probability.at_least(CONSENSUS_FALLBACK_LEVEL);
        Ok((!relaxed.is_empty_mask()).then_some(relaxed))
    }

    /// Average samples within (polar, azimuth) bins around the consensus centroid and
    /// normalise them by the mean consensus radius
    fn project_on_sphere(
        consensus: &Volume<u8>,
        surface: &[Index3],
        samples: &BTreeMap<String, Vec<f64>>,
    ) -> BTreeMap<String, Vec<f64>> {
        let geometry = consensus.geometry();
        let center_index = centroid(consensus).unwrap_or([0.0; 3]);
        let center: Point3 = std::array::from_fn(|axis| {
            geometry.origin[axis] + center_index[axis] * geometry.spacing[axis]
        });

        let mut bins = vec![Vec::new(); POLAR_BINS * AZIMUTH_BINS];
        let mut radius_sum = 0.0;
        for (k, &voxel) in surface.iter().enumerate() {
            let point = geometry.index_to_point(voxel);
            let d: Point3 = std::array::from_fn(|axis| point[axis] - center[axis]);
            let r = d.iter().map(|v| v * v).sum::<f64>().sqrt();
            radius_sum += r;
            let polar = if r > 0.0 { (d[2] / r).clamp(-1.0, 1.0).acos() } else { 0.0 };
            let azimuth = d[1].atan2(d[0]) + PI;
            let i = ((polar / PI * POLAR_BINS as f64) as usize).min(POLAR_BINS - 1);
            let j = ((azimuth / (2.0 * PI) * AZIMUTH_BINS as f64) as usize).min(AZIMUTH_BINS - 1);
            bins[i * AZIMUTH_BINS + j].push(k);
        }
        let mean_radius = (radius_sum / surface.len() as f64).max(SCALE_FLOOR);

        samples
            .iter()
            .map(|(atlas_id, values)| {
                let projected = bins
                    .iter()
                    .filter(|bin| !bin.is_empty())
                    .map(|bin| bin.iter().map(|&k| values[k]).sum::<f64>() / bin.len() as f64 / mean_radius)
                    .collect();
                (atlas_id.clone(), projected)
            })
            .collect()
    }
}

impl ConsistencyStatistic for LeaveOneOutZScore {
    fn evaluate(
        &self,
        atlases: &AtlasSet,
        weights: &WeightMaps,
        settings: &IarSettings,
    ) -> Result<BTreeMap<String, f64>, SegmentationError> {
        if atlases.len() < MIN_ATLASES {
            return Ok(BTreeMap::new());
        }
        let structure = &settings.reference_structure;
        let Some(consensus) = Self::consensus(atlases, weights, structure)? else {
            warn!("Consensus of {} is empty, no atlas can be scored", structure);
            return Ok(BTreeMap::new());
        };
        let surface = boundary_voxels(&consensus);
        if surface.is_empty() {
            return Ok(BTreeMap::new());
        }

        let samples: BTreeMap<String, Vec<f64>> = atlases
            .par_iter()
            .map(|(atlas_id, record)| {
                let label = structure_label(&record.deformable.labels, atlas_id, structure)?;
                let mut distance = signed_distance_map(label);
                if settings.smooth_distance_maps && settings.smooth_sigma > 0.0 {
                    distance = gaussian_smooth(&distance, settings.smooth_sigma);
                }
                let values = surface.iter().map(|&v| distance.data()[v] as f64).collect();
                Ok::<_, SegmentationError>((atlas_id.clone(), values))
            })
            .collect::<Result<_, _>>()?;

        let samples = if settings.project_on_sphere {
            Self::project_on_sphere(&consensus, &surface, &samples)
        } else {
            samples
        };

        let ids: Vec<&String> = samples.keys().collect();
        let columns: Vec<&Vec<f64>> = samples.values().collect();
        let sample_count = columns.first().map_or(0, |c| c.len());
        let mut scores = BTreeMap::new();
        for (a, atlas_id) in ids.iter().enumerate() {
            let mut total = 0.0;
            let mut others = Vec::with_capacity(columns.len() - 1);
            for k in 0..sample_count {
                others.clear();
                others.extend(
                    columns
                        .iter()
                        .enumerate()
                        .filter(|&(b, _)| b != a)
                        .map(|(_, column)| column[k]),
                );
                let (centre, scale) = settings.z_score_statistic.centre_and_scale(&others);
                total += ((columns[a][k] - centre) / scale.max(SCALE_FLOOR)).abs();
            }
            let score = if sample_count > 0 { total / sample_count as f64 } else { 0.0 };
            scores.insert((*atlas_id).clone(), score);
        }
        Ok(scores)
    }
}

/// Atlases that survived removal, and the ones removed
#[derive(Debug)]
pub struct IarOutcome {
    pub atlases: AtlasSet,
    pub removed: Vec<DroppedAtlas>,
}

/// Remove inconsistent atlases until convergence, never going below `min_best_atlases`
pub fn run_iar(
    atlases: AtlasSet,
    weights: &WeightMaps,
    settings: &IarSettings,
    statistic: &dyn ConsistencyStatistic,
) -> Result<IarOutcome, SegmentationError> {
    let mut atlases = atlases;
    let mut removed = Vec::new();
    let mut iteration = 0;

    loop {
        if atlases.len() <= settings.min_best_atlases {
            debug!(
                "IAR stopping with {} atlases, at or below the minimum of {}",
                atlases.len(),
                settings.min_best_atlases
            );
            break;
        }
        let scores: BTreeMap<String, f64> = statistic
            .evaluate(&atlases, weights, settings)?
            .into_iter()
            .filter(|(atlas_id, _)| atlases.contains_key(atlas_id))
            .collect();
        if scores.is_empty() {
            break;
        }
        let values: Vec<f64> = scores.values().copied().collect();
        let threshold = settings
            .outlier_method
            .threshold(&values, settings.outlier_factor);
        info!("IAR iteration {}: outlier threshold {:.4}", iteration, threshold);
        debug!(
            "IAR statistics: {}",
            scores
                .iter()
                .map(|(atlas_id, score)| format!("{atlas_id}={score:.4}"))
                .join(", ")
        );

        let flagged: Vec<(String, f64)> = scores
            .into_iter()
            .filter(|&(_, score)| score > threshold)
            .collect();
        if flagged.is_empty() {
            info!("IAR converged with {} atlases", atlases.len());
            break;
        }
        if atlases.len() - flagged.len() < settings.min_best_atlases {
            info!(
                "IAR stopping: removing {} atlases would leave fewer than {}",
                flagged.len(),
                settings.min_best_atlases
            );
            break;
        }

        for (atlas_id, score) in flagged {
            info!("IAR removing atlas {} (statistic {:.4})", atlas_id, score);
            atlases.remove(&atlas_id);
            removed.push(DroppedAtlas {
                atlas_id,
                stage: AtlasStage::Iar,
                reason: format!(
                    "statistic {:.4} above {} threshold {:.4}",
                    score, settings.outlier_method, threshold
                ),
            });
        }
        iteration += 1;
        if settings.single_step {
            break;
        }
    }

    Ok(IarOutcome { atlases, removed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmentation::fusion::tests::record;
    use crate::volume::Geometry;
    use rstest::rstest;

    const REFERENCE: &str = "Heart";

    fn sphere(center: Point3, radius: f64) -> Volume<u8> {
        let geometry = Geometry::new([20, 20, 20], [1.0; 3], [0.0; 3]);
        let data = ndarray::Array3::from_shape_fn(geometry.size, |(x, y, z)| {
            let d2 = (x as f64 - center[0]).powi(2)
                + (y as f64 - center[1]).powi(2)
                + (z as f64 - center[2]).powi(2);
            u8::from(d2 <= radius * radius)
        });
        Volume::with_geometry(data, &geometry).unwrap()
    }

    fn atlas_set(labels: Vec<(&str, Volume<u8>)>) -> (AtlasSet, WeightMaps) {
        let mut atlases = AtlasSet::new();
        let mut weights = WeightMaps::new();
        for (id, label) in labels {
            let image = Volume::from_elem(&label.geometry(), 0.0f32);
            weights.insert(id.to_string(), Volume::from_elem(&label.geometry(), 1.0f32));
            atlases.insert(id.to_string(), record(image, vec![(REFERENCE, label)]));
        }
        (atlases, weights)
    }

    fn six_with_outlier() -> (AtlasSet, WeightMaps) {
        let good = sphere([10.0, 10.0, 10.0], 5.0);
        atlas_set(vec![
            ("002", good.clone()),
            ("003", good.clone()),
            ("005", sphere([15.0, 10.0, 10.0], 3.0)),
            ("006", good.clone()),
            ("007", good.clone()),
            ("008", good),
        ])
    }

    fn settings(min_best_atlases: usize) -> IarSettings {
        IarSettings {
            min_best_atlases,
            ..IarSettings::default()
        }
    }

    /// Scores atlases by a fixed table
    struct FixedScores(Vec<(&'static str, f64)>);

    impl ConsistencyStatistic for FixedScores {
        fn evaluate(
            &self,
            atlases: &AtlasSet,
            _weights: &WeightMaps,
            _settings: &IarSettings,
        ) -> Result<BTreeMap<String, f64>, SegmentationError> {
            Ok(self
                .0
                .iter()
                .filter(|(id, _)| atlases.contains_key(*id))
                .map(|(id, score)| (id.to_string(), *score))
                .collect())
        }
    }

    #[rstest]
    #[case(&[1.0, 2.0, 3.0, 4.0], 0.5, 2.5)]
    #[case(&[1.0, 2.0, 3.0, 4.0], 0.25, 1.75)]
    #[case(&[1.0, 2.0, 3.0, 4.0], 1.0, 4.0)]
    #[case(&[7.0], 0.75, 7.0)]
    fn test_percentile(#[case] values: &[f64], #[case] p: f64, #[case] expected: f64) {
        assert!((percentile(values, p) - expected).abs() < 1e-12);
    }

    #[rstest]
    #[case(ZScoreStatistic::Mad, &[1.0, 2.0, 3.0, 4.0, 100.0], 3.0, MAD_TO_STD)]
    #[case(ZScoreStatistic::Std, &[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0], 5.0, 2.0)]
    fn test_centre_and_scale(
        #[case] statistic: ZScoreStatistic,
        #[case] values: &[f64],
        #[case] centre: f64,
        #[case] scale: f64,
    ) {
        let (c, s) = statistic.centre_and_scale(values);
        assert!((c - centre).abs() < 1e-12);
        assert!((s - scale).abs() < 1e-12);
    }

    #[rstest]
    #[case(OutlierMethod::Iqr, &[1.0, 2.0, 3.0, 4.0, 5.0], 1.5, 7.0)]
    #[case(OutlierMethod::Std, &[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0], 1.0, 7.0)]
    fn test_outlier_threshold(
        #[case] method: OutlierMethod,
        #[case] values: &[f64],
        #[case] factor: f64,
        #[case] expected: f64,
    ) {
        assert!((method.threshold(values, factor) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_leave_one_out_scores_outlier_highest() {
        let (atlases, weights) = six_with_outlier();
        let scores = LeaveOneOutZScore
            .evaluate(&atlases, &weights, &settings(5))
            .unwrap();
        assert_eq!(scores.len(), 6);
        let (worst, _) = scores
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap();
        assert_eq!(worst, "005");
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn test_six_atlases_one_outlier(#[case] project_on_sphere: bool) {
        let (atlases, weights) = six_with_outlier();
        let settings = IarSettings {
            project_on_sphere,
            ..settings(5)
        };
        let outcome = run_iar(atlases, &weights, &settings, &LeaveOneOutZScore).unwrap();
        assert_eq!(outcome.atlases.len(), 5);
        assert!(!outcome.atlases.contains_key("005"));
        assert_eq!(outcome.removed.len(), 1);
        assert_eq!(outcome.removed[0].atlas_id, "005");
        assert_eq!(outcome.removed[0].stage, AtlasStage::Iar);
    }

    #[test]
    fn test_iar_idempotent_at_convergence() {
        let (atlases, weights) = six_with_outlier();
        let settings = settings(3);
        let first = run_iar(atlases, &weights, &settings, &LeaveOneOutZScore).unwrap();
        let survivors: Vec<String> = first.atlases.keys().cloned().collect();
        let second = run_iar(first.atlases, &weights, &settings, &LeaveOneOutZScore).unwrap();
        assert!(second.removed.is_empty());
        assert_eq!(second.atlases.keys().cloned().collect::<Vec<_>>(), survivors);
    }

    fn eight_with_two_outliers() -> (AtlasSet, WeightMaps) {
        let good = sphere([10.0, 10.0, 10.0], 5.0);
        atlas_set(
            ["a1", "a2", "a3", "a4", "a5", "a6", "a7", "a8"]
                .into_iter()
                .map(|id| (id, good.clone()))
                .collect(),
        )
    }

    fn two_outlier_scores() -> FixedScores {
        FixedScores(vec![
            ("a1", 0.9),
            ("a2", 1.0),
            ("a3", 1.0),
            ("a4", 1.0),
            ("a5", 1.05),
            ("a6", 1.05),
            ("a7", 40.0),
            ("a8", 50.0),
        ])
    }

    #[rstest]
    #[case(9, 0)]
    #[case(8, 0)]
    #[case(7, 0)]
    #[case(6, 2)]
    #[case(1, 2)]
    fn test_iar_floor(#[case] min_best_atlases: usize, #[case] expected_removed: usize) {
        let (atlases, weights) = eight_with_two_outliers();
        let outcome = run_iar(
            atlases,
            &weights,
            &settings(min_best_atlases),
            &two_outlier_scores(),
        )
        .unwrap();
        assert_eq!(outcome.removed.len(), expected_removed);
        assert_eq!(outcome.atlases.len(), 8 - expected_removed);
        assert!(outcome.atlases.len() >= min_best_atlases.min(8));
        let removed: Vec<&str> = outcome.removed.iter().map(|d| d.atlas_id.as_str()).collect();
        if expected_removed > 0 {
            assert_eq!(removed, vec!["a7", "a8"]);
        }
    }

    #[test]
    fn test_iar_stops_when_removal_would_break_floor() {
        let (atlases, weights) = eight_with_two_outliers();
        let scores = two_outlier_scores();
        let values: Vec<f64> = scores.0.iter().map(|(_, score)| *score).collect();
        let threshold = OutlierMethod::Iqr.threshold(&values, 1.5);
        assert_eq!(values.iter().filter(|&&v| v > threshold).count(), 2);

        let outcome = run_iar(atlases, &weights, &settings(7), &scores).unwrap();
        assert!(outcome.removed.is_empty());
        assert!(outcome.atlases.contains_key("a7"));
        assert!(outcome.atlases.contains_key("a8"));
    }

    /// Scores every atlas in its table whether or not it is still retained
    struct UnfilteredScores(Vec<(&'static str, f64)>);

    impl ConsistencyStatistic for UnfilteredScores {
        fn evaluate(
            &self,
            _atlases: &AtlasSet,
            _weights: &WeightMaps,
            _settings: &IarSettings,
        ) -> Result<BTreeMap<String, f64>, SegmentationError> {
            Ok(self
                .0
                .iter()
                .map(|(id, score)| (id.to_string(), *score))
                .collect())
        }
    }

    #[test]
    fn test_scores_for_unknown_atlases_are_ignored() {
        let (atlases, weights) = six_with_outlier();
        let statistic = UnfilteredScores(vec![
            ("002", 1.0),
            ("003", 1.0),
            ("005", 50.0),
            ("006", 1.0),
            ("007", 1.0),
            ("008", 1.0),
            ("901", 1000.0),
            ("902", 2000.0),
        ]);
        let outcome = run_iar(atlases, &weights, &settings(5), &statistic).unwrap();
        let removed: Vec<&str> = outcome.removed.iter().map(|d| d.atlas_id.as_str()).collect();
        assert_eq!(removed, vec!["005"]);
        assert_eq!(outcome.atlases.len(), 5);
    }

    #[test]
    fn test_single_step() {
        let (atlases, weights) = six_with_outlier();
        let statistic = FixedScores(vec![
            ("002", 1.0),
            ("003", 1.0),
            ("005", 100.0),
            ("006", 1.0),
            ("007", 1.0),
            ("008", 2.0),
        ]);
        let settings = IarSettings {
            single_step: true,
            ..settings(1)
        };
        let outcome = run_iar(atlases, &weights, &settings, &statistic).unwrap();
        assert_eq!(outcome.atlases.len(), 5);
    }

    #[test]
    fn test_too_few_atlases_not_scored() {
        let good = sphere([10.0, 10.0, 10.0], 5.0);
        let (atlases, weights) = atlas_set(vec![("a", good.clone()), ("b", good)]);
        let scores = LeaveOneOutZScore
            .evaluate(&atlases, &weights, &settings(1))
            .unwrap();
        assert!(scores.is_empty());
    }
}

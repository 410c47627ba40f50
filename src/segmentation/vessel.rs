//! Tubular structures (e.g. the spinal cord) rebuilt as a smooth spline of disks through
//! the slice-wise centroids of the atlas labels.

use ndarray::{Axis, Zip};
use serde::Deserialize;
use snafu::{OptionExt, ResultExt, Snafu};
use std::fmt;
use tracing::{debug, warn};

use crate::errors::VolumeError;
use crate::segmentation::atlas::{AtlasSet, StructureMap};
use crate::settings::{MissingVesselParameterSnafu, SettingsError, VesselSettings};
use crate::volume::Volume;

/// Approximate distance between spline knots along the splining axis, in millimetres
const KNOT_SPACING_MM: f64 = 10.0;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum VesselError {
    #[snafu(display("atlas {} has no label for vessel {}", atlas_id, vessel))]
    MissingLabel { atlas_id: String, vessel: String },

    #[snafu(display("label of vessel {} in atlas {} is off the target grid: {}", vessel, atlas_id, source))]
    LabelGrid {
        atlas_id: String,
        vessel: String,
        #[snafu(source(from(VolumeError, Box::new)))]
        source: Box<VolumeError>,
    },
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpliningAxis {
    X,
    Y,
    #[default]
    Z,
}

impl SpliningAxis {
    pub fn index(&self) -> usize {
        match self {
            SpliningAxis::X => 0,
            SpliningAxis::Y => 1,
            SpliningAxis::Z => 2,
        }
    }
}

impl fmt::Display for SpliningAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let axis_str = match self {
            SpliningAxis::X => "x",
            SpliningAxis::Y => "y",
            SpliningAxis::Z => "z",
        };
        write!(f, "{axis_str}")
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopCondition {
    /// Number of atlases labelling the slice
    #[default]
    Count,
    /// Mean labelled area of the slice over all atlases, in mm²
    Area,
}

/// Splining parameters of one vessel
#[derive(Debug, Clone, PartialEq)]
pub struct VesselParameters {
    pub name: String,
    pub radius_mm: f64,
    pub axis: SpliningAxis,
    pub stop_condition: StopCondition,
    pub stop_value: f64,
}

impl VesselParameters {
    pub fn from_settings(settings: &VesselSettings) -> Result<Vec<Self>, SettingsError> {
        settings
            .vessel_name_list
            .iter()
            .map(|vessel| {
                let missing = |parameter: &'static str| {
                    MissingVesselParameterSnafu { vessel, parameter }.build()
                };
                Ok(VesselParameters {
                    name: vessel.clone(),
                    radius_mm: *settings
                        .vessel_radius_mm
                        .get(vessel)
                        .ok_or_else(|| missing("vesselRadius_mm"))?,
                    axis: *settings
                        .splining_direction
                        .get(vessel)
                        .ok_or_else(|| missing("spliningDirection"))?,
                    stop_condition: *settings
                        .stop_condition
                        .get(vessel)
                        .ok_or_else(|| missing("stopCondition"))?,
                    stop_value: *settings
                        .stop_condition_value
                        .get(vessel)
                        .ok_or_else(|| missing("stopConditionValue"))?,
                })
            })
            .collect()
    }
}

pub trait VesselSplining: Send + Sync {
    /// One binary volume per vessel on the grid of `target`
    fn spline_vessels(
        &self,
        target: &Volume<f32>,
        atlases: &AtlasSet,
        vessels: &[VesselParameters],
    ) -> Result<StructureMap, VesselError>;
}

/// Natural cubic spline through a set of knots
#[derive(Debug, Clone, PartialEq)]
pub struct NaturalCubicSpline {
    x: Vec<f64>,
    y: Vec<f64>,
    second_derivatives: Vec<f64>,
}

impl NaturalCubicSpline {
    /// Fit through knots with strictly increasing `x`. Returns `None` without knots.
    pub fn fit(x: Vec<f64>, y: Vec<f64>) -> Option<Self> {
        if x.is_empty() || x.len() != y.len() {
            return None;
        }
        let n = x.len();
        let mut second_derivatives = vec![0.0; n];
        if n > 2 {
            // Tridiagonal system for the interior second derivatives (Thomas algorithm)
            let mut diagonal = vec![0.0; n];
            let mut rhs = vec![0.0; n];
            let mut upper = vec![0.0; n];
            for i in 1..n - 1 {
                let h0 = x[i] - x[i - 1];
                let h1 = x[i + 1] - x[i];
                diagonal[i] = 2.0 * (h0 + h1);
                upper[i] = h1;
                rhs[i] = 6.0 * ((y[i + 1] - y[i]) / h1 - (y[i] - y[i - 1]) / h0);
            }
            for i in 2..n - 1 {
                let lower = x[i] - x[i - 1];
                let w = lower / diagonal[i - 1];
                diagonal[i] -= w * upper[i - 1];
                rhs[i] -= w * rhs[i - 1];
            }
            for i in (1..n - 1).rev() {
                let next = second_derivatives[i + 1];
                second_derivatives[i] = (rhs[i] - upper[i] * next) / diagonal[i];
            }
        }
        Some(Self {
            x,
            y,
            second_derivatives,
        })
    }

    /// Value at `t`, clamped to the knot range
    pub fn evaluate(&self, t: f64) -> f64 {
        let n = self.x.len();
        if n == 1 {
            return self.y[0];
        }
        let t = t.clamp(self.x[0], self.x[n - 1]);
        let i = self.x[1..].partition_point(|&knot| knot < t).min(n - 2);
        let (x0, x1) = (self.x[i], self.x[i + 1]);
        let (y0, y1) = (self.y[i], self.y[i + 1]);
        let (m0, m1) = (self.second_derivatives[i], self.second_derivatives[i + 1]);
        let h = x1 - x0;
        let a = (x1 - t) / h;
        let b = (t - x0) / h;
        a * y0 + b * y1 + ((a.powi(3) - a) * m0 + (b.powi(3) - b) * m1) * h * h / 6.0
    }
}

/// Splines the slice-wise centroids of the atlas vessel labels and rasterises a disk of
/// the vessel radius on every slice between the first and last accepted slice
#[derive(Debug, Clone, Copy, Default)]
pub struct CentroidSplineVessels;

struct SliceSummary {
    /// Mean in-slice voxel centroid of the atlases labelling the slice
    centroid: [f64; 2],
    count: usize,
    mean_area: f64,
}

impl CentroidSplineVessels {
    fn summarise(labels: &[&Volume<u8>], axis: usize, slice: usize) -> SliceSummary {
        let spacing = labels[0].spacing();
        let in_plane: Vec<usize> = (0..3).filter(|&a| a != axis).collect();
        let pixel_area = spacing[in_plane[0]] * spacing[in_plane[1]];

        let mut centroid_sum = [0.0f64; 2];
        let mut count = 0;
        let mut area_sum = 0.0;
        for label in labels {
            let view = label.data().index_axis(Axis(axis), slice);
            let mut sum = [0.0f64; 2];
            let mut pixels = 0usize;
            for ((u, v), &value) in view.indexed_iter() {
                if value != 0 {
                    sum[0] += u as f64;
                    sum[1] += v as f64;
                    pixels += 1;
                }
            }
            if pixels > 0 {
                centroid_sum[0] += sum[0] / pixels as f64;
                centroid_sum[1] += sum[1] / pixels as f64;
                count += 1;
                area_sum += pixels as f64 * pixel_area;
            }
        }
        SliceSummary {
            centroid: if count > 0 {
                centroid_sum.map(|s| s / count as f64)
            } else {
                [0.0; 2]
            },
            count,
            mean_area: area_sum / labels.len() as f64,
        }
    }

    fn spline_vessel(
        &self,
        target: &Volume<f32>,
        labels: &[&Volume<u8>],
        vessel: &VesselParameters,
    ) -> Volume<u8> {
        let geometry = target.geometry();
        let mut mask = Volume::<u8>::zeros(&geometry);
        let axis = vessel.axis.index();

        let accepted: Vec<(usize, [f64; 2])> = (0..geometry.size[axis])
            .filter_map(|slice| {
                let summary = Self::summarise(labels, axis, slice);
                let passes = match vessel.stop_condition {
                    StopCondition::Count => summary.count as f64 >= vessel.stop_value,
                    StopCondition::Area => summary.mean_area >= vessel.stop_value,
                };
                (passes && summary.count > 0).then_some((slice, summary.centroid))
            })
            .collect();
        let (Some(&(first, _)), Some(&(last, _))) = (accepted.first(), accepted.last()) else {
            warn!("No slices pass the stop condition for vessel {}", vessel.name);
            return mask;
        };

        let step = ((KNOT_SPACING_MM / geometry.spacing[axis]).round() as usize).max(1);
        let mut knots: Vec<&(usize, [f64; 2])> = accepted.iter().step_by(step).collect();
        if knots.last().map(|k| k.0) != Some(last) {
            knots.push(&accepted[accepted.len() - 1]);
        }
        let positions: Vec<f64> = knots.iter().map(|k| k.0 as f64).collect();
        let splines = [0, 1].map(|c| {
            NaturalCubicSpline::fit(positions.clone(), knots.iter().map(|k| k.1[c]).collect())
        });
        let [Some(spline_u), Some(spline_v)] = splines else {
            return mask;
        };
        debug!(
            "Vessel {} spans slices {}..={} with {} knots",
            vessel.name,
            first,
            last,
            positions.len()
        );

        let in_plane: Vec<usize> = (0..3).filter(|&a| a != axis).collect();
        let (su, sv) = (geometry.spacing[in_plane[0]], geometry.spacing[in_plane[1]]);
        let radius_squared = vessel.radius_mm * vessel.radius_mm;
        for slice in first..=last {
            let cu = spline_u.evaluate(slice as f64);
            let cv = spline_v.evaluate(slice as f64);
            let view = mask.data_mut().index_axis_mut(Axis(axis), slice);
            Zip::indexed(view).for_each(|(u, v), value| {
                let du = (u as f64 - cu) * su;
                let dv = (v as f64 - cv) * sv;
                if du * du + dv * dv <= radius_squared {
                    *value = 1;
                }
            });
        }
        mask
    }
}

impl VesselSplining for CentroidSplineVessels {
    fn spline_vessels(
        &self,
        target: &Volume<f32>,
        atlases: &AtlasSet,
        vessels: &[VesselParameters],
    ) -> Result<StructureMap, VesselError> {
        let mut result = StructureMap::new();
        for vessel in vessels {
            let labels = atlases
                .iter()
                .map(|(atlas_id, record)| {
                    let label = record.deformable.labels.get(&vessel.name).context(
                        MissingLabelSnafu {
                            atlas_id,
                            vessel: &vessel.name,
                        },
                    )?;
                    target.ensure_same_grid(label).context(LabelGridSnafu {
                        atlas_id,
                        vessel: &vessel.name,
                    })?;
                    Ok(label)
                })
                .collect::<Result<Vec<_>, VesselError>>()?;
            if labels.is_empty() {
                result.insert(vessel.name.clone(), Volume::zeros(&target.geometry()));
                continue;
            }
            result.insert(vessel.name.clone(), self.spline_vessel(target, &labels, vessel));
        }
        Ok(result)
    }
}

//! # Settings
//!
//! Run configuration, read from JSON with the same layout as the cardiac atlas settings
//! files (`atlasSettings`, `intialRegSettings`, `IARSettings`, ...). Every group has
//! defaults, so a settings file only needs to name what it changes.

use serde::{Deserialize, Deserializer};
use snafu::{ensure, ResultExt, Snafu};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::RegistrationError;
use crate::registration::{DemonsOptions, LinearOptions, RegistrationMethod};
use crate::segmentation::fusion::{VoteParams, VoteType};
use crate::segmentation::iar::{OutlierMethod, ZScoreStatistic};
use crate::segmentation::vessel::{SpliningAxis, StopCondition};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SettingsError {
    #[snafu(display("failed to read settings {}: {}", path.display(), source))]
    ReadSettings {
        path: PathBuf,
        #[snafu(source(from(std::io::Error, Box::new)))]
        source: Box<std::io::Error>,
    },

    #[snafu(display("failed to parse settings {}: {}", path.display(), source))]
    ParseSettings {
        path: PathBuf,
        #[snafu(source(from(serde_json::Error, Box::new)))]
        source: Box<serde_json::Error>,
    },

    #[snafu(display("atlas id list is empty"))]
    EmptyAtlasList,

    #[snafu(display("invalid {} staging: {}", stage, source))]
    Staging {
        stage: &'static str,
        #[snafu(source(from(RegistrationError, Box::new)))]
        source: Box<RegistrationError>,
    },

    #[snafu(display("minBestAtlases must be at least 1"))]
    ZeroMinBestAtlases,

    #[snafu(display("{} structure {} is not one of the atlas structures", role, structure))]
    UnknownStructure {
        role: &'static str,
        structure: String,
    },

    #[snafu(display("threshold {} for {} is outside (0, 1]", threshold, structure))]
    InvalidThreshold { structure: String, threshold: f64 },

    #[snafu(display("vessel {} has no {} configured", vessel, parameter))]
    MissingVesselParameter {
        vessel: String,
        parameter: &'static str,
    },

    #[snafu(display("vessel {} has non-positive radius {}", vessel, radius))]
    InvalidRadius { vessel: String, radius: f64 },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AtlasSettings {
    pub atlas_id_list: Vec<String>,
    pub atlas_structures: Vec<String>,
    pub atlas_path: PathBuf,
    pub atlas_image_format: String,
    pub atlas_label_format: String,
}

impl Default for AtlasSettings {
    fn default() -> Self {
        Self {
            atlas_id_list: ["002", "003", "005", "006", "007", "008"]
                .map(String::from)
                .to_vec(),
            atlas_structures: ["Heart", "Lung-Left", "Lung-Right", "Esophagus", "Spinal-Cord"]
                .map(String::from)
                .to_vec(),
            atlas_path: PathBuf::from("../data/NIFTI_CONVERTED"),
            atlas_image_format: "Study_{0}/Study_{0}.nii.gz".into(),
            atlas_label_format: "Study_{0}/Study_{0}_{1}.nii.gz".into(),
        }
    }
}

/// Substitute `{0}` with the atlas id and `{1}` with the structure name
pub fn format_template(template: &str, atlas_id: &str, structure: &str) -> String {
    template.replace("{0}", atlas_id).replace("{1}", structure)
}

impl AtlasSettings {
    pub fn image_path(&self, atlas_id: &str) -> PathBuf {
        self.atlas_path
            .join(format_template(&self.atlas_image_format, atlas_id, ""))
    }

    pub fn label_path(&self, atlas_id: &str, structure: &str) -> PathBuf {
        self.atlas_path
            .join(format_template(&self.atlas_label_format, atlas_id, structure))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AutoCropSettings {
    /// Margin added around the crop box on every axis, in millimetres
    pub expansion: [f64; 3],
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitialRegSettings {
    pub initial_reg: RegistrationMethod,
    pub options: LinearOptions,
    #[serde(deserialize_with = "optional_structure")]
    pub guide_structure: Option<String>,
}

/// `false`, `null` and `""` disable the guide structure, a string names it
fn optional_structure<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    #[allow(dead_code)]
    enum Repr {
        Flag(bool),
        Name(String),
        Null(()),
    }
    Ok(match Repr::deserialize(deserializer)? {
        Repr::Name(name) if !name.is_empty() => Some(name),
        _ => None,
    })
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IarSettings {
    pub reference_structure: String,
    pub smooth_distance_maps: bool,
    /// Gaussian sigma for distance map smoothing, in millimetres
    pub smooth_sigma: f64,
    pub z_score_statistic: ZScoreStatistic,
    pub outlier_method: OutlierMethod,
    pub outlier_factor: f64,
    pub min_best_atlases: usize,
    #[serde(rename = "project_on_sphere", alias = "projectOnSphere")]
    pub project_on_sphere: bool,
    pub single_step: bool,
}

impl Default for IarSettings {
    fn default() -> Self {
        Self {
            reference_structure: "Heart".into(),
            smooth_distance_maps: true,
            smooth_sigma: 1.0,
            z_score_statistic: ZScoreStatistic::Mad,
            outlier_method: OutlierMethod::Iqr,
            outlier_factor: 1.5,
            min_best_atlases: 5,
            project_on_sphere: false,
            single_step: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelFusionSettings {
    pub vote_type: VoteType,
    pub vote_params: VoteParams,
    pub optimal_threshold: BTreeMap<String, f64>,
    /// Keep the hole-filled largest component of every thresholded structure
    pub post_process: bool,
}

impl Default for LabelFusionSettings {
    fn default() -> Self {
        Self {
            vote_type: VoteType::Unweighted,
            vote_params: VoteParams::default(),
            optimal_threshold: ["Heart", "Lung-Left", "Lung-Right", "Esophagus"]
                .into_iter()
                .map(|s| (s.to_string(), 0.5))
                .collect(),
            post_process: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VesselSettings {
    pub vessel_name_list: Vec<String>,
    #[serde(rename = "vesselRadius_mm", alias = "vesselRadiusMm")]
    pub vessel_radius_mm: BTreeMap<String, f64>,
    pub splining_direction: BTreeMap<String, SpliningAxis>,
    pub stop_condition: BTreeMap<String, StopCondition>,
    pub stop_condition_value: BTreeMap<String, f64>,
}

impl Default for VesselSettings {
    fn default() -> Self {
        let vessel = "Spinal-Cord".to_string();
        Self {
            vessel_name_list: vec![vessel.clone()],
            vessel_radius_mm: BTreeMap::from([(vessel.clone(), 6.0)]),
            splining_direction: BTreeMap::from([(vessel.clone(), SpliningAxis::Z)]),
            stop_condition: BTreeMap::from([(vessel.clone(), StopCondition::Count)]),
            stop_condition_value: BTreeMap::from([(vessel, 2.0)]),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(rename = "atlasSettings")]
    pub atlas: AtlasSettings,
    #[serde(rename = "autoCropSettings")]
    pub auto_crop: AutoCropSettings,
    #[serde(rename = "intialRegSettings", alias = "initialRegSettings")]
    pub initial_reg: InitialRegSettings,
    #[serde(rename = "deformableSettings")]
    pub deformable: DemonsOptions,
    #[serde(rename = "IARSettings")]
    pub iar: IarSettings,
    #[serde(rename = "labelFusionSettings")]
    pub label_fusion: LabelFusionSettings,
    #[serde(rename = "vesselSpliningSettings")]
    pub vessel_splining: VesselSettings,
}

impl Settings {
    pub fn from_json_str(contents: &str, path: &Path) -> Result<Self, SettingsError> {
        serde_json::from_str(contents).context(ParseSettingsSnafu { path })
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).context(ReadSettingsSnafu { path })?;
        Self::from_json_str(&contents, path)
    }

    fn ensure_structure(&self, role: &'static str, structure: &str) -> Result<(), SettingsError> {
        ensure!(
            self.atlas.atlas_structures.iter().any(|s| s == structure),
            UnknownStructureSnafu { role, structure }
        );
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        ensure!(!self.atlas.atlas_id_list.is_empty(), EmptyAtlasListSnafu);
        self.initial_reg
            .options
            .validate()
            .context(StagingSnafu { stage: "initial registration" })?;
        self.deformable
            .validate()
            .context(StagingSnafu { stage: "deformable" })?;
        ensure!(self.iar.min_best_atlases > 0, ZeroMinBestAtlasesSnafu);

        self.ensure_structure("reference", &self.iar.reference_structure)?;
        if let Some(guide) = &self.initial_reg.guide_structure {
            self.ensure_structure("guide", guide)?;
        }
        for (structure, &threshold) in &self.label_fusion.optimal_threshold {
            self.ensure_structure("threshold", structure)?;
            ensure!(
                threshold > 0.0 && threshold <= 1.0,
                InvalidThresholdSnafu {
                    structure,
                    threshold
                }
            );
        }

        let vessels = &self.vessel_splining;
        for vessel in &vessels.vessel_name_list {
            self.ensure_structure("vessel", vessel)?;
            let radius = *vessels.vessel_radius_mm.get(vessel).ok_or(
                MissingVesselParameterSnafu {
                    vessel,
                    parameter: "vesselRadius_mm",
                }
                .build(),
            )?;
            ensure!(radius > 0.0, InvalidRadiusSnafu { vessel, radius });
            ensure!(
                vessels.splining_direction.contains_key(vessel),
                MissingVesselParameterSnafu {
                    vessel,
                    parameter: "spliningDirection",
                }
            );
            ensure!(
                vessels.stop_condition.contains_key(vessel),
                MissingVesselParameterSnafu {
                    vessel,
                    parameter: "stopCondition",
                }
            );
            ensure!(
                vessels.stop_condition_value.contains_key(vessel),
                MissingVesselParameterSnafu {
                    vessel,
                    parameter: "stopConditionValue",
                }
            );
        }
        Ok(())
    }
}

//! Multi-atlas segmentation pipeline.
//!
//! A target volume is cropped to the region covered by coarsely registered atlases, every
//! atlas is registered onto the crop (linear, then demons), inconsistent atlases are removed
//! by iterative atlas removal, and the remaining labels are fused into probability volumes.
//! Thresholded structures and splined vessels are pasted back into the original geometry.

pub mod assemble;
pub mod atlas;
pub mod autocrop;
pub mod fusion;
pub mod iar;
pub mod register;
pub mod vessel;

pub use assemble::*;
pub use atlas::*;
pub use autocrop::*;
pub use fusion::*;
pub use iar::*;
pub use register::*;
pub use vessel::*;

use itertools::Itertools;
use snafu::ResultExt;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::errors::segmentation::{InvalidSettingsSnafu, VesselSpliningSnafu, WorkerPoolSnafu};
use crate::errors::SegmentationError;
use crate::registration::{
    DeformableRegistration, LinearRegistration, MeanSquaresRegistration, SymmetricDemons,
};
use crate::settings::Settings;
use crate::transform::{CropBox, Transform};
use crate::volume::Volume;

/// Pluggable collaborators of the pipeline
pub struct Collaborators {
    pub linear: Box<dyn LinearRegistration>,
    pub deformable: Box<dyn DeformableRegistration>,
    pub vessels: Box<dyn VesselSplining>,
    pub statistic: Box<dyn ConsistencyStatistic>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            linear: Box::new(MeanSquaresRegistration),
            deformable: Box::new(SymmetricDemons),
            vessels: Box::new(CentroidSplineVessels),
            statistic: Box::new(LeaveOneOutZScore),
        }
    }
}

/// Result of a segmentation run, in the geometry of the target image
#[derive(Debug, Clone)]
pub struct Segmentation {
    /// Binary volume of every thresholded or splined structure
    pub binary: StructureMap,
    /// Fused probability of every structure
    pub probability: BTreeMap<String, Volume<f32>>,
    pub crop_box: CropBox,
    /// Atlases that contributed to the fusion
    pub atlases: Vec<String>,
    pub dropped: Vec<DroppedAtlas>,
}

pub struct CardiacSegmenter {
    settings: Settings,
    collaborators: Collaborators,
}

impl CardiacSegmenter {
    pub fn new(settings: Settings) -> Result<Self, SegmentationError> {
        Self::with_collaborators(settings, Collaborators::default())
    }

    pub fn with_collaborators(
        settings: Settings,
        collaborators: Collaborators,
    ) -> Result<Self, SegmentationError> {
        settings.validate().context(InvalidSettingsSnafu)?;
        Ok(Self {
            settings,
            collaborators,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Segment `target` with the atlases of `library` listed in the atlas settings.
    /// Every parallel stage runs in one pool of `deformableSettings.ncores` workers.
    pub fn segment(
        &self,
        target: &Volume<f32>,
        library: AtlasLibrary,
    ) -> Result<Segmentation, SegmentationError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.deformable.ncores)
            .build()
            .context(WorkerPoolSnafu)?;
        pool.install(|| self.run(target, library))
    }

    fn run(
        &self,
        target: &Volume<f32>,
        mut library: AtlasLibrary,
    ) -> Result<Segmentation, SegmentationError> {
        let settings = &self.settings;
        let atlas_ids = &settings.atlas.atlas_id_list;
        let structures = &settings.atlas.atlas_structures;

        library.retain(|atlas_id, _| atlas_ids.contains(atlas_id));
        for atlas_id in atlas_ids.iter().filter(|id| !library.contains_key(*id)) {
            warn!("Atlas {} is not in the library", atlas_id);
        }

        let crop_box = estimate_crop_box(
            target,
            &library,
            atlas_ids,
            settings.auto_crop.expansion,
            self.collaborators.linear.as_ref(),
        )?;
        let cropped = crop_box.apply(target);

        let registration = register_atlases(
            &cropped,
            library,
            structures,
            &settings.initial_reg,
            &settings.deformable,
            self.collaborators.linear.as_ref(),
            self.collaborators.deformable.as_ref(),
        )?;
        let mut dropped = registration.dropped;

        let consensus_weights = compute_weight_maps(
            &cropped,
            &registration.atlases,
            VoteType::Unweighted,
            &VoteParams::default(),
        )?;
        let iar = run_iar(
            registration.atlases,
            &consensus_weights,
            &settings.iar,
            self.collaborators.statistic.as_ref(),
        )?;
        dropped.extend(iar.removed);
        let atlases = iar.atlases;
        if atlases.is_empty() {
            return Err(SegmentationError::NoAtlasesRemaining { stage: "iar" });
        }
        info!(
            "Fusing {} atlases: {}",
            atlases.len(),
            atlases.keys().join(", ")
        );

        let vessel_parameters =
            VesselParameters::from_settings(&settings.vessel_splining).context(InvalidSettingsSnafu)?;
        let vessels = if vessel_parameters.is_empty() {
            StructureMap::new()
        } else {
            let vessels = self
                .collaborators
                .vessels
                .spline_vessels(&cropped, &atlases, &vessel_parameters)
                .context(VesselSpliningSnafu)?;
            if let Some(missing) = vessel_parameters
                .iter()
                .find(|vessel| !vessels.contains_key(&vessel.name))
            {
                return Err(SegmentationError::MissingVessel {
                    name: missing.name.clone(),
                });
            }
            vessels
        };

        let fusion = &settings.label_fusion;
        let fusion_weights =
            compute_weight_maps(&cropped, &atlases, fusion.vote_type, &fusion.vote_params)?;
        let probabilities = combine_labels(&atlases, &fusion_weights, structures)?;
        let thresholded: StructureMap = fusion
            .optimal_threshold
            .iter()
            .filter_map(|(structure, &level)| {
                let probability = probabilities.get(structure)?;
                Some((
                    structure.clone(),
                    process_probability(probability, level, fusion.post_process),
                ))
            })
            .collect();

        let assembled = assemble(
            &target.geometry(),
            crop_box,
            &thresholded,
            &vessels,
            &probabilities,
        )?;
        for (name, mask) in &assembled.binary {
            info!("Structure {}: {} voxels", name, mask.count_foreground());
        }
        Ok(Segmentation {
            binary: assembled.binary,
            probability: assembled.probability,
            crop_box,
            atlases: atlases.into_keys().collect(),
            dropped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::DemonsOptions;
    use crate::segmentation::register::tests::{InPlace, StillField};
    use crate::settings::{AtlasSettings, IarSettings, LabelFusionSettings, VesselSettings};
    use crate::volume::Geometry;
    use ndarray::{s, Array3};
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const SIZE: usize = 20;

    fn geometry() -> Geometry {
        Geometry::new([SIZE; 3], [1.0; 3], [0.0; 3])
    }

    fn sphere(center: [f64; 3], radius: f64) -> Volume<u8> {
        let data = Array3::from_shape_fn((SIZE, SIZE, SIZE), |(x, y, z)| {
            let d2 = (x as f64 - center[0]).powi(2)
                + (y as f64 - center[1]).powi(2)
                + (z as f64 - center[2]).powi(2);
            u8::from(d2 <= radius * radius)
        });
        Volume::from_array(data, [1.0; 3], [0.0; 3])
    }

    fn atlas(heart_center: [f64; 3], heart_radius: f64) -> OriginalAtlas {
        let mut image = Volume::from_elem(&geometry(), -1024.0f32);
        image.data_mut().slice_mut(s![2..18, 2..18, 2..18]).fill(40.0);
        let mut esophagus = Volume::zeros(&geometry());
        esophagus.data_mut().slice_mut(s![9..11, 13..15, 4..16]).fill(1);
        let mut cord = Volume::zeros(&geometry());
        cord.data_mut().slice_mut(s![9..12, 3..6, 4..16]).fill(1);
        OriginalAtlas {
            image,
            labels: StructureMap::from([
                ("Heart".to_string(), sphere(heart_center, heart_radius)),
                ("Esophagus".to_string(), esophagus),
                ("Spinal-Cord".to_string(), cord),
            ]),
        }
    }

    /// Six atlases, "005" with a displaced and shrunken heart
    fn library() -> AtlasLibrary {
        ["002", "003", "005", "006", "007", "008"]
            .into_iter()
            .map(|id| {
                let atlas = if id == "005" {
                    atlas([13.0, 10.0, 10.0], 3.0)
                } else {
                    atlas([10.0, 10.0, 10.0], 4.0)
                };
                (id.to_string(), atlas)
            })
            .collect()
    }

    fn settings(vessels: bool) -> Settings {
        Settings {
            atlas: AtlasSettings {
                atlas_structures: vec!["Heart".into(), "Esophagus".into(), "Spinal-Cord".into()],
                ..AtlasSettings::default()
            },
            deformable: DemonsOptions {
                ncores: 2,
                ..DemonsOptions::default()
            },
            iar: IarSettings {
                min_best_atlases: 5,
                ..IarSettings::default()
            },
            label_fusion: LabelFusionSettings {
                optimal_threshold: BTreeMap::from([("Heart".to_string(), 0.5)]),
                ..LabelFusionSettings::default()
            },
            vessel_splining: if vessels {
                VesselSettings::default()
            } else {
                VesselSettings {
                    vessel_name_list: Vec::new(),
                    ..VesselSettings::default()
                }
            },
            ..Settings::default()
        }
    }

    /// Records its invocations and returns an empty mask for every vessel, or nothing
    struct CountingVessels {
        calls: Arc<AtomicUsize>,
        omit: bool,
    }

    impl VesselSplining for CountingVessels {
        fn spline_vessels(
            &self,
            target: &Volume<f32>,
            _atlases: &AtlasSet,
            vessels: &[VesselParameters],
        ) -> Result<StructureMap, VesselError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.omit {
                return Ok(StructureMap::new());
            }
            Ok(vessels
                .iter()
                .map(|v| (v.name.clone(), Volume::zeros(&target.geometry())))
                .collect())
        }
    }

    fn segmenter(settings: Settings, vessels: Box<dyn VesselSplining>) -> CardiacSegmenter {
        CardiacSegmenter::with_collaborators(
            settings,
            Collaborators {
                linear: Box::new(InPlace {
                    require_guide: false,
                }),
                deformable: Box::new(StillField),
                vessels,
                statistic: Box::new(LeaveOneOutZScore),
            },
        )
        .unwrap()
    }

    fn target() -> Volume<f32> {
        Volume::from_elem(&geometry(), 0.0)
    }

    #[test]
    fn test_segment_removes_outlier() {
        let segmenter = segmenter(settings(true), Box::new(CentroidSplineVessels));
        let result = segmenter.segment(&target(), library()).unwrap();

        assert_eq!(result.crop_box, CropBox::new([2, 2, 2], [16, 16, 16]));
        assert_eq!(result.atlases, vec!["002", "003", "006", "007", "008"]);
        assert_eq!(result.dropped.len(), 1);
        assert_eq!(result.dropped[0].atlas_id, "005");
        assert_eq!(result.dropped[0].stage, AtlasStage::Iar);

        assert_eq!(
            result.binary.keys().collect::<Vec<_>>(),
            vec!["Heart", "Spinal-Cord"]
        );
        let heart = &result.binary["Heart"];
        assert_eq!(heart.geometry(), geometry());
        assert_eq!(heart.data(), sphere([10.0, 10.0, 10.0], 4.0).data());
        let cord = &result.binary["Spinal-Cord"];
        assert_eq!(cord.data()[[10, 4, 10]], 1);
        assert_eq!(cord.data()[[10, 4, 2]], 0);

        assert_eq!(result.probability.len(), 3);
        for probability in result.probability.values() {
            assert_eq!(probability.geometry(), geometry());
            assert!(probability.data().iter().all(|&p| (0.0..=1.0).contains(&p)));
        }
    }

    #[rstest]
    #[case(false, false, 0)]
    #[case(true, false, 1)]
    fn test_segment_vessel_invocation(
        #[case] with_vessels: bool,
        #[case] omit: bool,
        #[case] expected_calls: usize,
    ) {
        let calls = Arc::new(AtomicUsize::new(0));
        let vessels = CountingVessels {
            calls: calls.clone(),
            omit,
        };
        let result = segmenter(settings(with_vessels), Box::new(vessels))
            .segment(&target(), library())
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), expected_calls);
        assert_eq!(result.binary.contains_key("Spinal-Cord"), with_vessels);
        // Esophagus has no threshold, so it is only fused
        assert!(!result.binary.contains_key("Esophagus"));
        assert!(result.probability.contains_key("Esophagus"));
    }

    #[test]
    fn test_segment_missing_vessel() {
        let vessels = CountingVessels {
            calls: Arc::new(AtomicUsize::new(0)),
            omit: true,
        };
        let result = segmenter(settings(true), Box::new(vessels)).segment(&target(), library());
        assert!(matches!(
            result,
            Err(SegmentationError::MissingVessel { ref name }) if name == "Spinal-Cord"
        ));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut settings = settings(false);
        settings.iar.reference_structure = "Liver".into();
        assert!(matches!(
            CardiacSegmenter::new(settings),
            Err(SegmentationError::InvalidSettings { .. })
        ));
    }
}

//! Two-stage registration of every atlas onto the cropped target.

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::errors::{RegistrationError, SegmentationError};
use crate::registration::{
    propagate, DeformableRegistration, DemonsOptions, LinearRegistration,
};
use crate::segmentation::atlas::{
    structure_label, AtlasLibrary, AtlasRecord, AtlasSet, AtlasStage, DeformableStage,
    DroppedAtlas, OriginalAtlas, RigidStage, StructureMap,
};
use crate::settings::InitialRegSettings;
use crate::transform::SpatialTransform;
use crate::volume::{Geometry, Volume};

/// Registered atlases and the atlases whose registration failed
#[derive(Debug)]
pub struct RegistrationOutcome {
    pub atlases: AtlasSet,
    pub dropped: Vec<DroppedAtlas>,
}

fn propagate_all<S>(geometry: &Geometry, labels: &StructureMap, transform: &S) -> StructureMap
where
    S: SpatialTransform,
{
    labels
        .iter()
        .map(|(name, label)| (name.clone(), propagate(geometry, label, transform)))
        .collect()
}

fn register_atlas(
    target: &Volume<f32>,
    atlas_id: &str,
    original: OriginalAtlas,
    initial: &InitialRegSettings,
    demons: &DemonsOptions,
    linear: &dyn LinearRegistration,
    deformable: &dyn DeformableRegistration,
) -> Result<AtlasRecord, (AtlasStage, RegistrationError)> {
    let geometry = target.geometry();

    let guide = initial
        .guide_structure
        .as_deref()
        .and_then(|structure| original.labels.get(structure));
    let rigid = linear
        .register(
            target,
            &original.image,
            initial.initial_reg,
            &initial.options,
            guide,
        )
        .map_err(|e| (AtlasStage::Rigid, e))?;
    let rigid_labels = propagate_all(&geometry, &original.labels, &rigid.transform);
    debug!("Atlas {}: {} registration done", atlas_id, initial.initial_reg);

    // Only voxels covered by the rigidly registered atlas drive the demons
    let default_value = initial.options.default_value;
    let coverage = rigid.image.greater_than(default_value + 1.0);
    let masked_target = target
        .masked(&coverage, default_value)
        .map_err(|e| (AtlasStage::Deformable, RegistrationError::from(e)))?;
    let deformed = deformable
        .deform(&masked_target, &rigid.image, demons)
        .map_err(|e| (AtlasStage::Deformable, e))?;
    let deformed_labels = propagate_all(&geometry, &rigid_labels, &deformed.transform);
    debug!(
        "Atlas {}: deformable registration done, max displacement {:.2} mm",
        atlas_id,
        deformed.transform.max_magnitude()
    );

    Ok(AtlasRecord {
        original,
        rigid: RigidStage {
            image: rigid.image,
            transform: rigid.transform,
            labels: rigid_labels,
        },
        deformable: DeformableStage {
            image: deformed.image,
            field: deformed.transform,
            labels: deformed_labels,
        },
    })
}

/// Register every atlas of `library` onto the cropped `target`, rigidly then with demons.
///
/// Every atlas must carry a label for each of `structures`. An atlas whose registration
/// fails is dropped and reported in the outcome; the run fails only when none survive.
pub fn register_atlases(
    target: &Volume<f32>,
    library: AtlasLibrary,
    structures: &[String],
    initial: &InitialRegSettings,
    demons: &DemonsOptions,
    linear: &dyn LinearRegistration,
    deformable: &dyn DeformableRegistration,
) -> Result<RegistrationOutcome, SegmentationError> {
    for (atlas_id, atlas) in library.iter() {
        for structure in structures {
            structure_label(&atlas.labels, atlas_id, structure)?;
        }
    }

    info!("Registering {} atlases", library.len());
    let results: Vec<(String, Result<AtlasRecord, (AtlasStage, RegistrationError)>)> = library
        .into_par_iter()
        .map(|(atlas_id, mut original)| {
            original
                .labels
                .retain(|name, _| structures.iter().any(|s| s == name));
            let record = register_atlas(
                target, &atlas_id, original, initial, demons, linear, deformable,
            );
            (atlas_id, record)
        })
        .collect();

    let mut atlases = AtlasSet::new();
    let mut dropped = Vec::new();
    for (atlas_id, result) in results {
        match result {
            Ok(record) => {
                atlases.insert(atlas_id, record);
            }
            Err((stage, e)) => {
                warn!("Dropping atlas {} after failed {}: {}", atlas_id, stage, e);
                dropped.push(DroppedAtlas {
                    atlas_id,
                    stage,
                    reason: e.to_string(),
                });
            }
        }
    }
    if atlases.is_empty() {
        return Err(SegmentationError::NoAtlasesRemaining {
            stage: "registration",
        });
    }
    info!(
        "{} atlases registered, {} dropped",
        atlases.len(),
        dropped.len()
    );
    Ok(RegistrationOutcome { atlases, dropped })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::errors::registration::{NoForegroundSnafu, NonFiniteMetricSnafu};
    use crate::registration::{
        DisplacementField, LinearOptions, LinearTransform, Registered, RegistrationMethod,
    };
    use crate::transform::{resample, IdentityTransform, Interpolator};
    use ndarray::s;
    use rstest::rstest;
    use std::collections::BTreeMap;

    /// Atlas images whose maximum is below this fail deformable registration in the mocks
    pub(crate) const BROKEN_INTENSITY: f32 = -500.0;

    /// Linear registration that leaves the moving image where it is
    pub(crate) struct InPlace {
        pub require_guide: bool,
    }

    impl LinearRegistration for InPlace {
        fn register(
            &self,
            fixed: &Volume<f32>,
            moving: &Volume<f32>,
            _method: RegistrationMethod,
            options: &LinearOptions,
            guide: Option<&Volume<u8>>,
        ) -> Result<Registered<LinearTransform>, RegistrationError> {
            if self.require_guide && guide.is_none() {
                return NoForegroundSnafu {
                    role: "guide",
                    threshold: 0.0f32,
                }
                .fail();
            }
            Ok(Registered {
                image: resample(
                    moving,
                    &fixed.geometry(),
                    &IdentityTransform,
                    Interpolator::Linear,
                    options.default_value,
                ),
                transform: LinearTransform::identity(),
            })
        }
    }

    /// Deformable registration returning a zero field
    pub(crate) struct StillField;

    impl DeformableRegistration for StillField {
        fn deform(
            &self,
            fixed: &Volume<f32>,
            moving: &Volume<f32>,
            _options: &DemonsOptions,
        ) -> Result<Registered<DisplacementField>, RegistrationError> {
            let peak = moving.data().iter().cloned().fold(f32::MIN, f32::max);
            if peak < BROKEN_INTENSITY {
                return NonFiniteMetricSnafu { value: f64::NAN }.fail();
            }
            Ok(Registered {
                image: moving.clone(),
                transform: DisplacementField::zeros(&fixed.geometry()),
            })
        }
    }

    fn geometry() -> Geometry {
        Geometry::new([12, 12, 12], [1.0; 3], [0.0; 3])
    }

    fn atlas(intensity: f32, structures: &[&str]) -> OriginalAtlas {
        let mut image = Volume::from_elem(&geometry(), -1024.0f32);
        image.data_mut().slice_mut(s![3..9, 3..9, 3..9]).fill(intensity);
        let labels = structures
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let mut label = Volume::zeros(&geometry());
                label.data_mut().slice_mut(s![3..5 + i, 3..9, 3..9]).fill(1);
                (name.to_string(), label)
            })
            .collect();
        OriginalAtlas { image, labels }
    }

    fn structures() -> Vec<String> {
        vec!["Heart".into(), "Lung-Left".into()]
    }

    fn target() -> Volume<f32> {
        Volume::from_elem(&geometry(), 0.0)
    }

    fn register(
        library: AtlasLibrary,
        guide: Option<&str>,
    ) -> Result<RegistrationOutcome, SegmentationError> {
        let initial = InitialRegSettings {
            guide_structure: guide.map(String::from),
            ..InitialRegSettings::default()
        };
        register_atlases(
            &target(),
            library,
            &structures(),
            &initial,
            &DemonsOptions::default(),
            &InPlace {
                require_guide: guide.is_some(),
            },
            &StillField,
        )
    }

    #[rstest]
    #[case(None)]
    #[case(Some("Heart"))]
    fn test_register_atlases(#[case] guide: Option<&str>) {
        let library: AtlasLibrary = ["002", "003"]
            .into_iter()
            .map(|id| (id.to_string(), atlas(40.0, &["Heart", "Lung-Left", "Extra"])))
            .collect();
        let outcome = register(library, guide).unwrap();
        assert!(outcome.dropped.is_empty());
        assert_eq!(outcome.atlases.len(), 2);
        for record in outcome.atlases.values() {
            assert_eq!(
                record.deformable.labels.keys().collect::<Vec<_>>(),
                vec!["Heart", "Lung-Left"]
            );
            for (name, label) in &record.deformable.labels {
                assert_eq!(label.data(), record.original.labels[name].data());
                assert_eq!(label.data(), record.rigid.labels[name].data());
            }
            assert_eq!(record.deformable.image.size(), [12, 12, 12]);
        }
    }

    #[test]
    fn test_failed_atlas_is_dropped() {
        let library: AtlasLibrary = [
            ("002".to_string(), atlas(40.0, &["Heart", "Lung-Left"])),
            ("003".to_string(), atlas(-900.0, &["Heart", "Lung-Left"])),
        ]
        .into_iter()
        .collect();
        let outcome = register(library, None).unwrap();
        assert_eq!(outcome.atlases.keys().collect::<Vec<_>>(), vec!["002"]);
        assert_eq!(outcome.dropped.len(), 1);
        assert_eq!(outcome.dropped[0].atlas_id, "003");
        assert_eq!(outcome.dropped[0].stage, AtlasStage::Deformable);
    }

    /// Linear registration that fails for atlases with no intensity above the foreground level
    struct RequireForeground;

    impl LinearRegistration for RequireForeground {
        fn register(
            &self,
            fixed: &Volume<f32>,
            moving: &Volume<f32>,
            method: RegistrationMethod,
            options: &LinearOptions,
            guide: Option<&Volume<u8>>,
        ) -> Result<Registered<LinearTransform>, RegistrationError> {
            let threshold = options.default_value + 24.0;
            let peak = moving.data().iter().cloned().fold(f32::MIN, f32::max);
            if peak <= threshold {
                return NoForegroundSnafu {
                    role: "moving",
                    threshold,
                }
                .fail();
            }
            InPlace {
                require_guide: false,
            }
            .register(fixed, moving, method, options, guide)
        }
    }

    #[test]
    fn test_atlases_dropped_at_each_stage() {
        let library: AtlasLibrary = [
            ("002".to_string(), atlas(40.0, &["Heart", "Lung-Left"])),
            ("003".to_string(), atlas(-900.0, &["Heart", "Lung-Left"])),
            ("004".to_string(), atlas(-1024.0, &["Heart", "Lung-Left"])),
        ]
        .into_iter()
        .collect();
        let outcome = register_atlases(
            &target(),
            library,
            &structures(),
            &InitialRegSettings::default(),
            &DemonsOptions::default(),
            &RequireForeground,
            &StillField,
        )
        .unwrap();
        assert_eq!(outcome.atlases.keys().collect::<Vec<_>>(), vec!["002"]);

        let stages: BTreeMap<&str, AtlasStage> = outcome
            .dropped
            .iter()
            .map(|dropped| (dropped.atlas_id.as_str(), dropped.stage))
            .collect();
        assert_eq!(
            stages,
            BTreeMap::from([("003", AtlasStage::Deformable), ("004", AtlasStage::Rigid)])
        );
        let rigid = outcome
            .dropped
            .iter()
            .find(|dropped| dropped.atlas_id == "004")
            .unwrap();
        assert!(rigid.reason.contains("moving"), "{}", rigid.reason);
    }

    #[test]
    fn test_all_atlases_fail() {
        let library: AtlasLibrary = [("002".to_string(), atlas(-900.0, &["Heart", "Lung-Left"]))]
            .into_iter()
            .collect();
        assert!(matches!(
            register(library, None),
            Err(SegmentationError::NoAtlasesRemaining {
                stage: "registration"
            })
        ));
    }

    #[test]
    fn test_missing_structure_is_fatal() {
        let library: AtlasLibrary = [
            ("002".to_string(), atlas(40.0, &["Heart", "Lung-Left"])),
            ("003".to_string(), atlas(40.0, &["Heart"])),
        ]
        .into_iter()
        .collect();
        let result = register(library, None);
        assert!(matches!(
            result,
            Err(SegmentationError::MissingStructure { ref atlas_id, ref structure })
                if atlas_id == "003" && structure == "Lung-Left"
        ));
    }
}

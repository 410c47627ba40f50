use std::collections::BTreeMap;
use std::fmt;

use crate::errors::SegmentationError;
use crate::registration::{DisplacementField, LinearTransform};
use crate::volume::Volume;

/// Binary label volume per structure name
pub type StructureMap = BTreeMap<String, Volume<u8>>;

/// Per-atlas weight volume, keyed by atlas id
pub type WeightMaps = BTreeMap<String, Volume<f32>>;

/// Atlas as loaded from disk
#[derive(Debug, Clone)]
pub struct OriginalAtlas {
    pub image: Volume<f32>,
    pub labels: StructureMap,
}

/// Atlas after linear registration onto the cropped target
#[derive(Debug, Clone)]
pub struct RigidStage {
    pub image: Volume<f32>,
    pub transform: LinearTransform,
    pub labels: StructureMap,
}

/// Atlas after deformable registration onto the cropped target
#[derive(Debug, Clone)]
pub struct DeformableStage {
    pub image: Volume<f32>,
    pub field: DisplacementField,
    pub labels: StructureMap,
}

#[derive(Debug, Clone)]
pub struct AtlasRecord {
    pub original: OriginalAtlas,
    pub rigid: RigidStage,
    pub deformable: DeformableStage,
}

/// Loaded atlases before registration, keyed by atlas id
pub type AtlasLibrary = BTreeMap<String, OriginalAtlas>;

/// Registered atlases, keyed by atlas id
pub type AtlasSet = BTreeMap<String, AtlasRecord>;

/// Look up a structure label, failing with the atlas id if it is absent
pub fn structure_label<'a>(
    labels: &'a StructureMap,
    atlas_id: &str,
    structure: &str,
) -> Result<&'a Volume<u8>, SegmentationError> {
    labels
        .get(structure)
        .ok_or_else(|| SegmentationError::MissingStructure {
            atlas_id: atlas_id.to_string(),
            structure: structure.to_string(),
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtlasStage {
    Rigid,
    Deformable,
    Iar,
}

impl fmt::Display for AtlasStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage_str = match self {
            AtlasStage::Rigid => "rigid registration",
            AtlasStage::Deformable => "deformable registration",
            AtlasStage::Iar => "iterative atlas removal",
        };
        write!(f, "{stage_str}")
    }
}

/// Atlas excluded from fusion, with the stage that excluded it
#[derive(Debug, Clone, PartialEq)]
pub struct DroppedAtlas {
    pub atlas_id: String,
    pub stage: AtlasStage,
    pub reason: String,
}

impl fmt::Display for DroppedAtlas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.atlas_id, self.stage, self.reason)
    }
}

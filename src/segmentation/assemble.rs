use std::collections::BTreeMap;

use crate::errors::VolumeError;
use crate::segmentation::atlas::StructureMap;
use crate::transform::{CropBox, Paste};
use crate::volume::{Geometry, Volume};

/// Cropped results pasted back into the geometry of the original image
#[derive(Debug, Clone, Default)]
pub struct Assembled {
    pub binary: StructureMap,
    pub probability: BTreeMap<String, Volume<f32>>,
}

/// Paste every thresholded structure, every vessel and every probability volume at the
/// crop box index of a zero-filled volume of the original geometry. A vessel replaces a
/// thresholded structure of the same name.
pub fn assemble(
    original: &Geometry,
    crop_box: CropBox,
    thresholded: &StructureMap,
    vessels: &StructureMap,
    probabilities: &BTreeMap<String, Volume<f32>>,
) -> Result<Assembled, VolumeError> {
    let paste = Paste::new(crop_box, *original)?;
    let binary = thresholded
        .iter()
        .chain(vessels.iter())
        .map(|(name, mask)| Ok((name.clone(), paste.try_apply(mask)?)))
        .collect::<Result<StructureMap, VolumeError>>()?;
    let probability = probabilities
        .iter()
        .map(|(name, volume)| Ok((name.clone(), paste.try_apply(volume)?)))
        .collect::<Result<_, VolumeError>>()?;
    Ok(Assembled {
        binary,
        probability,
    })
}

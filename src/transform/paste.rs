use ndarray::s;
use num::Zero;
use snafu::ensure;

use crate::errors::volume::RegionOutOfBoundsSnafu;
use crate::errors::VolumeError;
use crate::transform::{CropBox, Transform};
use crate::volume::{Geometry, Volume};

/// Places a cropped volume back into a zero-filled volume of the original geometry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Paste {
    crop_box: CropBox,
    geometry: Geometry,
}

impl Paste {
    pub fn new(crop_box: CropBox, geometry: Geometry) -> Result<Self, VolumeError> {
        ensure!(
            crop_box.fits(geometry.size),
            RegionOutOfBoundsSnafu {
                index: crop_box.index,
                size: crop_box.size,
                bounds: geometry.size,
            }
        );
        Ok(Self { crop_box, geometry })
    }

    /// Paste `volume` at the crop box index, failing if its size differs from the box
    pub fn try_apply<T: Clone + Zero>(&self, volume: &Volume<T>) -> Result<Volume<T>, VolumeError> {
        let expected = self.crop_box.geometry(&self.geometry);
        ensure!(
            volume.size() == expected.size,
            RegionOutOfBoundsSnafu {
                index: self.crop_box.index,
                size: volume.size(),
                bounds: self.geometry.size,
            }
        );
        Ok(self.apply(volume))
    }
}

impl<T: Clone + Zero> Transform<Volume<T>> for Paste {
    /// Paste a volume at the crop box index. Voxels of the volume beyond the box are dropped.
    fn apply(&self, volume: &Volume<T>) -> Volume<T> {
        let mut result = Volume::zeros(&self.geometry);
        let [x0, y0, z0] = self.crop_box.index;
        let size = volume.size();
        let [w, h, d]: [usize; 3] = std::array::from_fn(|axis| size[axis].min(self.crop_box.size[axis]));
        result
            .data_mut()
            .slice_mut(s![x0..x0 + w, y0..y0 + h, z0..z0 + d])
            .assign(&volume.data().slice(s![..w, ..h, ..d]));
        result
    }
}

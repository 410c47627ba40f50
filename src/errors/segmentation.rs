pub use snafu::Snafu;

use crate::errors::VolumeError;
use crate::segmentation::vessel::VesselError;
use crate::settings::SettingsError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SegmentationError {
    #[snafu(display("invalid settings: {}", source))]
    InvalidSettings {
        #[snafu(source(from(SettingsError, Box::new)))]
        source: Box<SettingsError>,
    },

    #[snafu(display("atlas {} has no label for structure {}", atlas_id, structure))]
    MissingStructure { atlas_id: String, structure: String },

    #[snafu(display("atlas {} has no weight map", atlas_id))]
    MissingWeightMap { atlas_id: String },

    #[snafu(display("degenerate crop box: index={:?} size={:?}", index, size))]
    InvalidCropBox { index: [i64; 3], size: [i64; 3] },

    #[snafu(display("no atlases remaining after the {} stage", stage))]
    NoAtlasesRemaining { stage: &'static str },

    #[snafu(display("vessel splining returned no volume for {}", name))]
    MissingVessel { name: String },

    #[snafu(display("vessel splining failed: {}", source))]
    VesselSplining {
        #[snafu(source(from(VesselError, Box::new)))]
        source: Box<VesselError>,
    },

    #[snafu(display("could not build worker pool: {}", source))]
    WorkerPool {
        #[snafu(source(from(rayon::ThreadPoolBuildError, Box::new)))]
        source: Box<rayon::ThreadPoolBuildError>,
    },

    #[snafu(display("volume error: {}", source))]
    Volume {
        #[snafu(source(from(VolumeError, Box::new)))]
        source: Box<VolumeError>,
    },
}

impl From<VolumeError> for SegmentationError {
    fn from(source: VolumeError) -> Self {
        Self::Volume {
            source: Box::new(source),
        }
    }
}

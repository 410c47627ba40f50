pub use snafu::Snafu;
use std::path::PathBuf;

use crate::errors::VolumeError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum VolumeIoError {
    #[snafu(display("volume file not found: {}", path.display()))]
    MissingFile { path: PathBuf },

    #[snafu(display("error reading NIfTI file {}: {}", path.display(), source))]
    ReadNifti {
        path: PathBuf,
        #[snafu(source(from(nifti::NiftiError, Box::new)))]
        source: Box<nifti::NiftiError>,
    },

    #[snafu(display("error writing NIfTI file {}: {}", path.display(), source))]
    WriteNifti {
        path: PathBuf,
        #[snafu(source(from(nifti::NiftiError, Box::new)))]
        source: Box<nifti::NiftiError>,
    },

    #[snafu(display("expected a 3D volume in {}, found shape {:?}", path.display(), shape))]
    Dimensionality { path: PathBuf, shape: Vec<usize> },

    #[snafu(display("invalid geometry in {}: {}", path.display(), source))]
    InvalidGeometry {
        path: PathBuf,
        #[snafu(source(from(VolumeError, Box::new)))]
        source: Box<VolumeError>,
    },

    #[snafu(display("failed to create directory: {}", path.display()))]
    CreateDir {
        path: PathBuf,
        #[snafu(source(from(std::io::Error, Box::new)))]
        source: Box<std::io::Error>,
    },

    #[snafu(display("atlas {} is missing structure {}", atlas_id, structure))]
    AtlasStructure {
        atlas_id: String,
        structure: String,
        #[snafu(source(from(VolumeIoError, Box::new)))]
        source: Box<VolumeIoError>,
    },
}

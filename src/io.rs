//! NIfTI reading and writing of volumes, atlases and segmentation results.

use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use ndarray::{Array3, Ix3};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiError, NiftiHeader, NiftiObject, ReaderOptions};
use rayon::prelude::*;
use snafu::{ensure, ResultExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::errors::io::{
    AtlasStructureSnafu, CreateDirSnafu, DimensionalitySnafu, InvalidGeometrySnafu,
    MissingFileSnafu, ReadNiftiSnafu, WriteNiftiSnafu,
};
use crate::errors::volume::InvalidSpacingSnafu;
use crate::errors::VolumeIoError;
use crate::segmentation::{AtlasLibrary, OriginalAtlas, Segmentation, StructureMap};
use crate::settings::AtlasSettings;
use crate::transform::LABEL_THRESHOLD;
use crate::volume::{Geometry, Volume};

pub const NIFTI_EXTENSION: &str = "nii.gz";

pub fn default_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{msg} {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta} @ {per_sec})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb
}

/// Geometry described by a NIfTI header. The origin comes from the sform when present,
/// otherwise from the qform offsets.
pub fn header_geometry(header: &NiftiHeader, size: [usize; 3]) -> Geometry {
    let spacing = std::array::from_fn(|axis| header.pixdim[axis + 1].abs() as f64);
    let origin = if header.sform_code > 0 {
        [header.srow_x[3], header.srow_y[3], header.srow_z[3]].map(|v| v as f64)
    } else {
        [header.quatern_x, header.quatern_y, header.quatern_z].map(|v| v as f64)
    };
    Geometry::new(size, spacing, origin)
}

/// NIfTI header describing `geometry` with an axis-aligned sform
pub fn geometry_header(geometry: &Geometry) -> NiftiHeader {
    let [sx, sy, sz] = geometry.spacing.map(|s| s as f32);
    let [ox, oy, oz] = geometry.origin.map(|o| o as f32);
    NiftiHeader {
        pixdim: [1.0, sx, sy, sz, 0.0, 0.0, 0.0, 0.0],
        sform_code: 1,
        qform_code: 1,
        srow_x: [sx, 0.0, 0.0, ox],
        srow_y: [0.0, sy, 0.0, oy],
        srow_z: [0.0, 0.0, sz, oz],
        quatern_x: ox,
        quatern_y: oy,
        quatern_z: oz,
        ..NiftiHeader::default()
    }
}

/// Read a 3D NIfTI volume as `f32`, with the slope and intercept of the file applied
pub fn read_volume<P: AsRef<Path>>(path: P) -> Result<Volume<f32>, VolumeIoError> {
    let path = path.as_ref();
    ensure!(path.is_file(), MissingFileSnafu { path });
    let object = ReaderOptions::new()
        .read_file(path)
        .context(ReadNiftiSnafu { path })?;
    let header = object.header().clone();
    let data = object
        .into_volume()
        .into_ndarray::<f32>()
        .context(ReadNiftiSnafu { path })?;
    let shape = data.shape().to_vec();
    let data: Array3<f32> = data
        .into_dimensionality::<Ix3>()
        .map_err(|_| DimensionalitySnafu { path, shape }.build())?;

    let (x, y, z) = data.dim();
    let geometry = header_geometry(&header, [x, y, z]);
    if !geometry.is_valid() {
        let source = InvalidSpacingSnafu {
            spacing: geometry.spacing,
        }
        .build();
        return Err(source).context(InvalidGeometrySnafu { path });
    }
    debug!("Read {} with geometry {}", path.display(), geometry);
    Volume::with_geometry(data, &geometry).context(InvalidGeometrySnafu { path })
}

/// Read a structure label, binarised at one half
pub fn read_labels<P: AsRef<Path>>(path: P) -> Result<Volume<u8>, VolumeIoError> {
    Ok(read_volume(path)?.at_least(LABEL_THRESHOLD))
}

/// Voxel types stored in NIfTI files
pub trait NiftiVoxel: Sized {
    fn write_nifti(options: &WriterOptions<'_>, data: &Array3<Self>) -> Result<(), NiftiError>;
}

impl NiftiVoxel for f32 {
    fn write_nifti(options: &WriterOptions<'_>, data: &Array3<Self>) -> Result<(), NiftiError> {
        options.write_nifti(data)
    }
}

impl NiftiVoxel for u8 {
    fn write_nifti(options: &WriterOptions<'_>, data: &Array3<Self>) -> Result<(), NiftiError> {
        options.write_nifti(data)
    }
}

/// Write a volume to `path` with a header describing its geometry
pub fn write_volume<T, P>(path: P, volume: &Volume<T>) -> Result<(), VolumeIoError>
where
    T: NiftiVoxel,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let header = geometry_header(&volume.geometry());
    let options = WriterOptions::new(path).reference_header(&header);
    T::write_nifti(&options, volume.data()).context(WriteNiftiSnafu { path })
}

pub fn load_atlas(settings: &AtlasSettings, atlas_id: &str) -> Result<OriginalAtlas, VolumeIoError> {
    let image = read_volume(settings.image_path(atlas_id))?;
    let labels = settings
        .atlas_structures
        .iter()
        .map(|structure| {
            let label = read_labels(settings.label_path(atlas_id, structure)).context(
                AtlasStructureSnafu {
                    atlas_id,
                    structure,
                },
            )?;
            Ok((structure.clone(), label))
        })
        .collect::<Result<StructureMap, VolumeIoError>>()?;
    Ok(OriginalAtlas { image, labels })
}

/// Load every atlas of the settings in parallel
pub fn load_atlas_library(
    settings: &AtlasSettings,
    progress: bool,
) -> Result<AtlasLibrary, VolumeIoError> {
    let pb = if progress {
        default_bar(settings.atlas_id_list.len() as u64)
    } else {
        ProgressBar::hidden()
    };
    pb.set_message("Loading atlases");
    let library = settings
        .atlas_id_list
        .par_iter()
        .progress_with(pb)
        .map(|atlas_id| Ok((atlas_id.clone(), load_atlas(settings, atlas_id)?)))
        .collect::<Result<AtlasLibrary, VolumeIoError>>()?;
    info!("Loaded {} atlases", library.len());
    Ok(library)
}

/// Write `{structure}.nii.gz` for every binary structure and, with `probabilities`,
/// `{structure}_probability.nii.gz` for every fused structure. Returns the written paths.
pub fn write_segmentation<P: AsRef<Path>>(
    output_dir: P,
    segmentation: &Segmentation,
    probabilities: bool,
) -> Result<Vec<PathBuf>, VolumeIoError> {
    let output_dir = output_dir.as_ref();
    std::fs::create_dir_all(output_dir).context(CreateDirSnafu { path: output_dir })?;

    let mut written = Vec::new();
    for (structure, mask) in &segmentation.binary {
        let path = output_dir.join(format!("{structure}.{NIFTI_EXTENSION}"));
        write_volume(&path, mask)?;
        written.push(path);
    }
    if probabilities {
        for (structure, probability) in &segmentation.probability {
            let path = output_dir.join(format!("{structure}_probability.{NIFTI_EXTENSION}"));
            write_volume(&path, probability)?;
            written.push(path);
        }
    }
    info!("Wrote {} volumes to {}", written.len(), output_dir.display());
    Ok(written)
}

//! Region of interest estimated from coarsely registered atlases.

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::errors::SegmentationError;
use crate::registration::{LinearOptions, LinearRegistration, RegistrationMethod};
use crate::segmentation::atlas::AtlasLibrary;
use crate::transform::CropBox;
use crate::volume::{Geometry, Volume};

/// Number of atlases registered to estimate the crop box
pub const CROP_ATLAS_COUNT: usize = 8;

/// Mean registered intensity above which a voxel belongs to the body extent
const EXTENT_THRESHOLD: f32 = -1000.0;

/// Grow a bounding box by a margin in millimetres and clamp it to `geometry`
pub fn expand_crop_box(
    bounding_box: CropBox,
    geometry: &Geometry,
    expansion_mm: [f64; 3],
) -> Result<CropBox, SegmentationError> {
    let mut index = [0i64; 3];
    let mut size = [0i64; 3];
    for axis in 0..3 {
        let expansion = (expansion_mm[axis] / geometry.spacing[axis]).ceil() as i64;
        index[axis] = (bounding_box.index[axis] as i64 - expansion).max(0);
        let wanted = (bounding_box.size[axis] as i64 + 2 * expansion).max(1);
        let available = geometry.size[axis] as i64 - index[axis];
        size[axis] = wanted.min(available);
    }
    if size.iter().any(|&s| s <= 0) {
        return Err(SegmentationError::InvalidCropBox { index, size });
    }
    Ok(CropBox::new(
        index.map(|i| i as usize),
        size.map(|s| s as usize),
    ))
}

/// Estimate the crop box of `target` from the first atlases of `atlas_ids`
pub fn estimate_crop_box(
    target: &Volume<f32>,
    library: &AtlasLibrary,
    atlas_ids: &[String],
    expansion_mm: [f64; 3],
    linear: &dyn LinearRegistration,
) -> Result<CropBox, SegmentationError> {
    let geometry = target.geometry();
    let options = LinearOptions::coarse();
    let sampled: Vec<&String> = atlas_ids
        .iter()
        .filter(|atlas_id| library.contains_key(atlas_id.as_str()))
        .take(CROP_ATLAS_COUNT)
        .collect();

    let registered: Vec<Volume<f32>> = sampled
        .par_iter()
        .filter_map(|&atlas_id| {
            let atlas = &library[atlas_id];
            match linear.register(
                target,
                &atlas.image,
                RegistrationMethod::Similarity,
                &options,
                None,
            ) {
                Ok(registered) => {
                    debug!("Coarse registration of atlas {} done", atlas_id);
                    Some(registered.image)
                }
                Err(e) => {
                    warn!("Coarse registration of atlas {} failed: {}", atlas_id, e);
                    None
                }
            }
        })
        .collect();

    let bounding_box = if registered.is_empty() {
        warn!("No atlas could be coarsely registered, using the full volume");
        CropBox::full(geometry.size)
    } else {
        let volumes: Vec<&Volume<f32>> = registered.iter().collect();
        let extent = Volume::mean_of(&volumes)?.greater_than(EXTENT_THRESHOLD);
        CropBox::from_mask(&extent).unwrap_or_else(|| {
            warn!("Registered atlases cover no foreground, using the full volume");
            CropBox::full(geometry.size)
        })
    };

    let crop_box = expand_crop_box(bounding_box, &geometry, expansion_mm)?;
    info!(
        "Crop box index={:?} size={:?}, volume reduced by a factor of {:.2}",
        crop_box.index,
        crop_box.size,
        crop_box.reduction_factor(geometry.size)
    );
    Ok(crop_box)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::registration::NoForegroundSnafu;
    use crate::errors::RegistrationError;
    use crate::registration::{LinearTransform, Registered};
    use crate::segmentation::atlas::{OriginalAtlas, StructureMap};
    use crate::segmentation::register::tests::InPlace;
    use ndarray::{s, Array3};
    use rand::Rng;
    use rstest::rstest;

    const IN_PLACE: InPlace = InPlace {
        require_guide: false,
    };

    struct Failing;

    impl LinearRegistration for Failing {
        fn register(
            &self,
            _fixed: &Volume<f32>,
            _moving: &Volume<f32>,
            _method: RegistrationMethod,
            _options: &LinearOptions,
            _guide: Option<&Volume<u8>>,
        ) -> Result<Registered<LinearTransform>, RegistrationError> {
            NoForegroundSnafu {
                role: "moving",
                threshold: -1000.0f32,
            }
            .fail()
        }
    }

    fn body(low: [usize; 3], high: [usize; 3]) -> OriginalAtlas {
        let mut data = Array3::from_elem((20, 20, 20), -1024.0f32);
        data.slice_mut(s![low[0]..high[0], low[1]..high[1], low[2]..high[2]])
            .fill(40.0);
        OriginalAtlas {
            image: Volume::from_array(data, [1.0; 3], [0.0; 3]),
            labels: StructureMap::new(),
        }
    }

    fn target() -> Volume<f32> {
        Volume::from_array(Array3::zeros((20, 20, 20)), [1.0; 3], [0.0; 3])
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{i:03}")).collect()
    }

    #[rstest]
    #[case([5, 5, 5], [4, 4, 4], [1.0, 1.0, 1.0], [4, 4, 4], [6, 6, 6])]
    #[case([1, 5, 5], [4, 4, 4], [3.0, 0.0, 0.5], [0, 5, 4], [10, 4, 6])]
    #[case([15, 0, 0], [5, 20, 20], [2.0, 2.0, 2.0], [13, 0, 0], [7, 20, 20])]
    #[case([5, 5, 5], [4, 4, 4], [-2.5, 0.0, 0.0], [7, 5, 5], [1, 4, 4])]
    fn test_expand_crop_box(
        #[case] index: [usize; 3],
        #[case] size: [usize; 3],
        #[case] expansion: [f64; 3],
        #[case] expected_index: [usize; 3],
        #[case] expected_size: [usize; 3],
    ) {
        let geometry = Geometry::new([20, 20, 20], [1.0, 1.0, 2.0], [0.0; 3]);
        let expanded = expand_crop_box(CropBox::new(index, size), &geometry, expansion).unwrap();
        assert_eq!(expanded, CropBox::new(expected_index, expected_size));
    }

    #[test]
    fn test_expand_crop_box_degenerate() {
        let geometry = Geometry::new([10, 10, 10], [1.0; 3], [0.0; 3]);
        let result = expand_crop_box(
            CropBox::new([9, 0, 0], [1, 10, 10]),
            &geometry,
            [-5.0, 0.0, 0.0],
        );
        assert!(matches!(
            result,
            Err(SegmentationError::InvalidCropBox { index: [14, 0, 0], .. })
        ));
    }

    #[test]
    fn test_expand_crop_box_within_bounds() {
        let mut rng = rand::thread_rng();
        let geometry = Geometry::new([30, 25, 12], [0.8, 1.2, 2.5], [0.0; 3]);
        for _ in 0..200 {
            let index: [usize; 3] = std::array::from_fn(|axis| rng.gen_range(0..geometry.size[axis]));
            let size: [usize; 3] =
                std::array::from_fn(|axis| rng.gen_range(1..=geometry.size[axis] - index[axis]));
            let expansion: [f64; 3] = std::array::from_fn(|_| rng.gen_range(0.0..20.0));
            let expanded =
                expand_crop_box(CropBox::new(index, size), &geometry, expansion).unwrap();
            assert!(expanded.fits(geometry.size), "{expanded:?}");
        }
    }

    #[test]
    fn test_estimate_crop_box_union_of_atlases() {
        let library: AtlasLibrary = [
            ("000".to_string(), body([4, 5, 6], [10, 12, 14])),
            ("001".to_string(), body([6, 3, 6], [14, 10, 12])),
        ]
        .into_iter()
        .collect();
        let crop_box =
            estimate_crop_box(&target(), &library, &ids(2), [1.0, 0.0, 0.0], &IN_PLACE).unwrap();
        assert_eq!(crop_box, CropBox::new([3, 3, 6], [12, 9, 8]));
    }

    #[test]
    fn test_estimate_crop_box_uses_first_atlases() {
        let mut library: AtlasLibrary = ids(CROP_ATLAS_COUNT)
            .into_iter()
            .map(|id| (id, body([8, 8, 8], [12, 12, 12])))
            .collect();
        library.insert("999".into(), body([0, 0, 0], [20, 20, 20]));
        let mut atlas_ids = ids(CROP_ATLAS_COUNT);
        atlas_ids.push("999".into());
        let crop_box =
            estimate_crop_box(&target(), &library, &atlas_ids, [0.0; 3], &IN_PLACE).unwrap();
        assert_eq!(crop_box, CropBox::new([8, 8, 8], [4, 4, 4]));
    }

    #[rstest]
    #[case::registration_fails(body([4, 4, 4], [8, 8, 8]), true)]
    #[case::no_foreground(body([0, 0, 0], [0, 0, 0]), false)]
    fn test_estimate_crop_box_full_volume(#[case] atlas: OriginalAtlas, #[case] failing: bool) {
        let library: AtlasLibrary = [("000".to_string(), atlas)].into_iter().collect();
        let linear: &dyn LinearRegistration = if failing { &Failing } else { &IN_PLACE };
        let crop_box = estimate_crop_box(&target(), &library, &ids(1), [5.0; 3], linear).unwrap();
        assert_eq!(crop_box, CropBox::full([20, 20, 20]));
    }
}

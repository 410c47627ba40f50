use ndarray::s;

use crate::transform::Transform;
use crate::volume::{Geometry, Index3, Volume};

/// Axis-aligned region of a volume, in voxels of the volume it was computed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropBox {
    pub index: Index3,
    pub size: Index3,
}

impl CropBox {
    pub fn new(index: Index3, size: Index3) -> Self {
        Self { index, size }
    }

    /// Box covering an entire grid
    pub fn full(size: Index3) -> Self {
        Self {
            index: [0, 0, 0],
            size,
        }
    }

    /// Smallest box enclosing the non-zero voxels of `mask`, or `None` for an empty mask
    pub fn from_mask(mask: &Volume<u8>) -> Option<Self> {
        let bounds = mask
            .data()
            .indexed_iter()
            .filter(|&(_, &v)| v != 0)
            .fold(None, |bounds: Option<(Index3, Index3)>, ((x, y, z), _)| {
                let voxel = [x, y, z];
                Some(match bounds {
                    None => (voxel, voxel),
                    Some((low, high)) => (
                        std::array::from_fn(|axis| low[axis].min(voxel[axis])),
                        std::array::from_fn(|axis| high[axis].max(voxel[axis])),
                    ),
                })
            })?;
        let (low, high) = bounds;
        Some(CropBox {
            index: low,
            size: std::array::from_fn(|axis| high[axis] - low[axis] + 1),
        })
    }

    /// Exclusive end index on every axis
    pub fn end(&self) -> Index3 {
        std::array::from_fn(|axis| self.index[axis] + self.size[axis])
    }

    pub fn numel(&self) -> usize {
        self.size.iter().product()
    }

    /// Whether the box lies inside a grid of extent `bounds`
    pub fn fits(&self, bounds: Index3) -> bool {
        let end = self.end();
        (0..3).all(|axis| self.size[axis] > 0 && end[axis] <= bounds[axis])
    }

    /// Ratio of the number of voxels in a grid of extent `bounds` to the voxels in the box
    pub fn reduction_factor(&self, bounds: Index3) -> f64 {
        let total: usize = bounds.iter().product();
        total as f64 / self.numel().max(1) as f64
    }

    /// Geometry of the cropped grid, given the geometry of the grid it was cut from
    pub fn geometry(&self, original: &Geometry) -> Geometry {
        original.region(self.index, self.size)
    }

    /// Overlap of two boxes. Disjoint boxes give a zero-sized box.
    pub fn intersection(&self, other: &CropBox) -> CropBox {
        let (end, other_end) = (self.end(), other.end());
        let index = std::array::from_fn(|axis| self.index[axis].max(other.index[axis]));
        CropBox {
            index,
            size: std::array::from_fn(|axis| {
                end[axis].min(other_end[axis]).saturating_sub(index[axis])
            }),
        }
    }
}

impl<T: Clone> Transform<Volume<T>> for CropBox {
    /// Cut the box out of a volume. Parts of the box outside the volume are dropped.
    fn apply(&self, volume: &Volume<T>) -> Volume<T> {
        let region = self.intersection(&CropBox::full(volume.size()));
        let [x0, y0, z0] = region.index;
        let [x1, y1, z1] = region.end();
        let data = volume.data().slice(s![x0..x1, y0..y1, z0..z1]).to_owned();
        let origin = volume.geometry().index_to_point(region.index);
        Volume::from_array(data, volume.spacing(), origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use rstest::rstest;

    fn mask_from(size: Index3, foreground: &[Index3]) -> Volume<u8> {
        let mut data = Array3::<u8>::zeros(size);
        for &voxel in foreground {
            data[voxel] = 1;
        }
        Volume::from_array(data, [1.0, 1.0, 1.0], [0.0, 0.0, 0.0])
    }

    #[rstest]
    #[case(vec![[1, 1, 1], [2, 2, 2]], Some(((1, 1, 1), (2, 2, 2))))]
    #[case(vec![[0, 3, 1]], Some(((0, 3, 1), (1, 1, 1))))]
    #[case(vec![[0, 0, 0], [3, 3, 3]], Some(((0, 0, 0), (4, 4, 4))))]
    #[case(vec![], None)]
    fn test_from_mask(
        #[case] foreground: Vec<Index3>,
        #[case] expected: Option<((usize, usize, usize), (usize, usize, usize))>,
    ) {
        let mask = mask_from([4, 4, 4], &foreground);
        let expected = expected.map(|((x, y, z), (w, h, d))| CropBox::new([x, y, z], [w, h, d]));
        assert_eq!(CropBox::from_mask(&mask), expected);
    }

    #[rstest]
    #[case(CropBox::new([1, 1, 1], [2, 2, 2]), [3, 3, 3])]
    #[case(CropBox::new([0, 0, 0], [4, 4, 4]), [4, 4, 4])]
    #[case(CropBox::new([2, 0, 5], [1, 3, 1]), [3, 3, 6])]
    fn test_end(#[case] crop: CropBox, #[case] expected: Index3) {
        assert_eq!(crop.end(), expected);
    }

    #[rstest]
    #[case(
        CropBox::new([1, 1, 1], [2, 2, 2]),
        CropBox::new([2, 2, 2], [2, 2, 2]),
        CropBox::new([2, 2, 2], [1, 1, 1])
    )]
    #[case(
        CropBox::new([0, 0, 0], [2, 2, 2]),
        CropBox::new([3, 3, 3], [2, 2, 2]),
        CropBox::new([3, 3, 3], [0, 0, 0])
    )]
    fn test_intersection(#[case] a: CropBox, #[case] b: CropBox, #[case] expected: CropBox) {
        assert_eq!(a.intersection(&b), expected);
    }

    #[rstest]
    #[case(CropBox::new([0, 0, 0], [4, 4, 4]), [4, 4, 4], true)]
    #[case(CropBox::new([1, 0, 0], [4, 4, 4]), [4, 4, 4], false)]
    #[case(CropBox::new([1, 1, 1], [0, 2, 2]), [4, 4, 4], false)]
    fn test_fits(#[case] crop: CropBox, #[case] bounds: Index3, #[case] expected: bool) {
        assert_eq!(crop.fits(bounds), expected);
    }

    #[test]
    fn test_crop_volume() {
        let data = Array3::from_shape_fn((4, 5, 6), |(x, y, z)| (x * 100 + y * 10 + z) as f32);
        let volume = Volume::from_array(data, [0.5, 1.0, 2.0], [10.0, 20.0, 30.0]);
        let crop = CropBox::new([1, 2, 3], [2, 2, 2]);
        let cropped = crop.apply(&volume);

        assert_eq!(cropped.size(), [2, 2, 2]);
        assert_eq!(cropped.origin(), [10.5, 22.0, 36.0]);
        assert_eq!(cropped.data()[[0, 0, 0]], 123.0);
        assert_eq!(cropped.data()[[1, 1, 1]], 234.0);
    }

    #[test]
    fn test_crop_volume_clamps_to_bounds() {
        let volume = Volume::from_elem(&Geometry::new([3, 3, 3], [1.0; 3], [0.0; 3]), 1u8);
        let cropped = CropBox::new([2, 2, 2], [5, 5, 5]).apply(&volume);
        assert_eq!(cropped.size(), [1, 1, 1]);
    }
}

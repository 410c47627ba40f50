use ndarray::{Array1, Axis, Zip};

use crate::volume::{Point3, Volume};

/// Kernels are truncated at this many standard deviations
const TRUNCATE: f64 = 3.0;

fn kernel(sigma_voxels: f64) -> Vec<f64> {
    let radius = (TRUNCATE * sigma_voxels).ceil() as isize;
    let weights: Vec<f64> = (-radius..=radius)
        .map(|i| (-(i * i) as f64 / (2.0 * sigma_voxels * sigma_voxels)).exp())
        .collect();
    let total: f64 = weights.iter().sum();
    weights.into_iter().map(|w| w / total).collect()
}

/// Separable Gaussian smoothing with a standard deviation given in millimetres per axis.
/// Edges are handled by clamping to the border voxel. A non-positive sigma leaves that
/// axis untouched.
pub fn gaussian_smooth_anisotropic(volume: &Volume<f32>, sigma_mm: Point3) -> Volume<f32> {
    let spacing = volume.spacing();
    let mut result = volume.clone();
    for axis in 0..3 {
        let sigma = sigma_mm[axis] / spacing[axis];
        if sigma <= 0.0 || volume.size()[axis] < 2 {
            continue;
        }
        let weights = kernel(sigma);
        let radius = (weights.len() / 2) as isize;
        Zip::from(result.data_mut().lanes_mut(Axis(axis))).par_for_each(|mut lane| {
            let source: Array1<f32> = lane.to_owned();
            let last = source.len() as isize - 1;
            for (i, out) in lane.iter_mut().enumerate() {
                let value: f64 = weights
                    .iter()
                    .enumerate()
                    .map(|(k, w)| {
                        let j = (i as isize + k as isize - radius).clamp(0, last) as usize;
                        w * source[j] as f64
                    })
                    .sum();
                *out = value as f32;
            }
        });
    }
    result
}

/// Isotropic Gaussian smoothing, sigma in millimetres
pub fn gaussian_smooth(volume: &Volume<f32>, sigma_mm: f64) -> Volume<f32> {
    gaussian_smooth_anisotropic(volume, [sigma_mm; 3])
}

/// Gaussian smoothing with sigma given in voxels of the volume's own grid
pub fn gaussian_smooth_voxels(volume: &Volume<f32>, sigma_voxels: f64) -> Volume<f32> {
    let spacing = volume.spacing();
    gaussian_smooth_anisotropic(volume, std::array::from_fn(|axis| sigma_voxels * spacing[axis]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Geometry;
    use rstest::rstest;

    #[rstest]
    #[case(0.5)]
    #[case(1.0)]
    #[case(2.5)]
    fn test_kernel_normalised(#[case] sigma: f64) {
        let weights = kernel(sigma);
        assert_eq!(weights.len() % 2, 1);
        assert!((weights.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_constant_volume_unchanged() {
        let volume = Volume::from_elem(&Geometry::new([8, 6, 4], [1.0, 2.0, 3.0], [0.0; 3]), 7.0f32);
        let smoothed = gaussian_smooth(&volume, 2.0);
        assert!(smoothed.data().iter().all(|&v| (v - 7.0).abs() < 1e-4));
    }

    #[test]
    fn test_impulse_preserves_mass() {
        let mut volume = Volume::<f32>::zeros(&Geometry::new([21, 21, 21], [1.0; 3], [0.0; 3]));
        volume.data_mut()[[10, 10, 10]] = 1.0;
        let smoothed = gaussian_smooth(&volume, 1.5);
        assert!((smoothed.sum() - 1.0).abs() < 1e-4);
        assert!(smoothed.data()[[10, 10, 10]] < 1.0);
        assert!(smoothed.data()[[11, 10, 10]] > 0.0);
    }

    #[test]
    fn test_zero_sigma_is_identity() {
        let mut volume = Volume::<f32>::zeros(&Geometry::new([5, 5, 5], [1.0; 3], [0.0; 3]));
        volume.data_mut()[[2, 2, 2]] = 3.0;
        assert_eq!(gaussian_smooth(&volume, 0.0), volume);
    }
}

pub use snafu::Snafu;

use crate::errors::VolumeError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RegistrationError {
    #[snafu(display("no foreground voxels above {} in the {} image", threshold, role))]
    NoForeground { role: &'static str, threshold: f32 },

    #[snafu(display("fixed and moving images do not overlap at shrink factor {}", factor))]
    NoOverlap { factor: usize },

    #[snafu(display("registration diverged: metric value {} is not finite", value))]
    NonFiniteMetric { value: f64 },

    #[snafu(display("no registration stages configured"))]
    EmptyStaging,

    #[snafu(display(
        "staging lengths differ: {} resolutions, {} iteration counts, {} smoothing sigmas",
        resolutions,
        iterations,
        sigmas
    ))]
    StagingMismatch {
        resolutions: usize,
        iterations: usize,
        sigmas: usize,
    },

    #[snafu(display(
        "linear staging lengths differ: {} shrink factors, {} smoothing sigmas",
        shrink_factors,
        sigmas
    ))]
    LinearStagingMismatch { shrink_factors: usize, sigmas: usize },

    #[snafu(display("invalid stage resolution {}", resolution))]
    InvalidResolution { resolution: f64 },

    #[snafu(display("volume error during registration: {}", source))]
    Volume {
        #[snafu(source(from(VolumeError, Box::new)))]
        source: Box<VolumeError>,
    },

    #[snafu(display("could not build registration worker pool: {}", source))]
    WorkerPool {
        #[snafu(source(from(rayon::ThreadPoolBuildError, Box::new)))]
        source: Box<rayon::ThreadPoolBuildError>,
    },
}

impl From<VolumeError> for RegistrationError {
    fn from(source: VolumeError) -> Self {
        Self::Volume {
            source: Box::new(source),
        }
    }
}

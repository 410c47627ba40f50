pub mod io;
pub mod registration;
pub mod segmentation;
pub mod volume;

pub use io::VolumeIoError;
pub use registration::RegistrationError;
pub use segmentation::SegmentationError;
pub use volume::VolumeError;

pub mod errors;
pub mod filter;
pub mod io;
pub mod registration;
pub mod segmentation;
pub mod settings;
pub mod transform;
pub mod volume;

pub use segmentation::{CardiacSegmenter, Collaborators, Segmentation};
pub use settings::Settings;
pub use volume::{Geometry, Volume};

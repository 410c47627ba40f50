pub mod distance;
pub mod gaussian;
pub mod morphology;

pub use distance::*;
pub use gaussian::*;
pub use morphology::*;

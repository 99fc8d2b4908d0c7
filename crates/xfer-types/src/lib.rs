pub mod errors;
pub mod ids;

pub use errors::*;
pub use ids::*;

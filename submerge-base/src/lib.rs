mod error;
mod ids;

pub use error::{err, fatal, Error, Result};
pub use ids::{Hash128, LogicalTime};

pub mod line_protocol;
pub mod point;
pub mod prometheus;

pub use point::{FieldValue, Point, Precision};

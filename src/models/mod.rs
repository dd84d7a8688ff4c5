pub mod entity;
pub mod reading;

pub use entity::{EntityState, Freshness, TrailPoint};
pub use reading::{GeoPoint, QueuedItem, Reading};

pub mod controller;
pub mod data;
pub mod diff;
pub mod models;

pub use controller::{BomChangeController, BOM_KIND};

pub mod model;
pub mod tracker;

pub mod core;
pub mod guide;
pub mod job;
pub mod stats_models;

// src/lib.rs
pub mod error;
pub mod guides;
pub mod jobs;
pub mod matching;
pub mod models;
pub mod reconciliation;
pub mod resolution;
pub mod store;
pub mod utils;

pub use error::{ReconcileError, Result};

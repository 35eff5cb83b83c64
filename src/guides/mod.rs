pub mod client;
pub mod normalizer;

pub use client::{BillingApiClient, GuideSource};

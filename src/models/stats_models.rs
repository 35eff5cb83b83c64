// src/models/stats_models.rs
use chrono::NaiveDate;
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::core::EntityKind;
use crate::models::job::JobCounters;

/// Summary of one reconciliation run, returned to the caller and logged by the binary.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub job_id: Uuid,
    pub group_id: Uuid,
    pub window_start: Option<NaiveDate>,
    pub window_end: Option<NaiveDate>,
    pub guides_fetched: usize,
    pub guides_without_claim_id: usize,
    pub duplicate_claims: usize,
    pub skipped_by_cap: usize,
    pub counters: JobCounters,
    pub procedures_created: usize,
    pub procedures_updated: usize,
    pub unlinked_records_created: usize,
    pub entities_created: HashMap<EntityKind, usize>,
    pub batches_flushed: usize,
    pub billing_conflicts_merged: usize,
    /// Claim ids fetched but never classified. Should always be empty.
    pub unclassified_claim_ids: Vec<String>,
    pub elapsed_secs: f64,
}

impl RunReport {
    pub fn total_entities_created(&self) -> usize {
        self.entities_created.values().sum()
    }
}

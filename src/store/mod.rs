// src/store/mod.rs
//
// Storage seams for the reconciliation run and the job tracker. `PgStore` is the production
// implementation; tests use the in-memory store.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use uuid::Uuid;

use crate::models::core::{BillingRecord, EntityKind, NamedEntity, Procedure, Tenant};
use crate::models::job::{JobCounters, JobStatus, JobSummary, ReconciliationJob};

#[cfg(test)]
pub mod memory;
pub mod postgres;

pub use postgres::PgStore;

/// Oldest dates among billing records still pending at the payer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingClaimDates {
    pub oldest_procedure_date: Option<NaiveDate>,
    pub oldest_api_surgery_date: Option<NaiveDate>,
}

/// Result of a billing insert batch. `merged` counts rows that hit the
/// (procedure_id, claim_id) constraint and were folded into the existing row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub merged: usize,
}

#[async_trait]
pub trait ReconcileStore: Send + Sync {
    async fn load_tenant(&self, group_id: Uuid) -> Result<Option<Tenant>>;

    async fn load_entities(&self, group_id: Uuid, kind: EntityKind) -> Result<Vec<NamedEntity>>;

    async fn insert_entity(&self, entity: &NamedEntity) -> Result<()>;

    /// Procedures scheduled on or after `since`, ordered by (created_at, id).
    async fn load_candidate_procedures(
        &self,
        group_id: Uuid,
        since: NaiveDate,
    ) -> Result<Vec<Procedure>>;

    /// All of the tenant's billing records carrying one of `claim_ids`.
    async fn load_billing_records(
        &self,
        group_id: Uuid,
        claim_ids: &[String],
    ) -> Result<Vec<BillingRecord>>;

    async fn pending_claim_dates(&self, group_id: Uuid) -> Result<PendingClaimDates>;

    async fn insert_procedures(&self, procedures: &[Procedure]) -> Result<()>;

    async fn update_procedures(&self, procedures: &[Procedure]) -> Result<()>;

    async fn insert_billing_records(&self, records: &[BillingRecord]) -> Result<BatchOutcome>;

    async fn update_billing_records(&self, records: &[BillingRecord]) -> Result<()>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a new job row. Returns false when the tenant already has an active job.
    async fn insert_job(&self, job: &ReconciliationJob) -> Result<bool>;

    async fn find_active_job(&self, group_id: Uuid) -> Result<Option<ReconciliationJob>>;

    /// Moves a pending job to running.
    async fn mark_job_running(&self, job_id: Uuid) -> Result<bool>;

    /// Updates counters and step only while the job is running.
    async fn update_job_progress(
        &self,
        job_id: Uuid,
        counters: &JobCounters,
        step: &str,
    ) -> Result<bool>;

    /// Moves a running job to a terminal status.
    async fn finish_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        counters: &JobCounters,
        error_message: Option<&str>,
        completed_at: NaiveDateTime,
    ) -> Result<bool>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ReconciliationJob>>;

    async fn latest_completed_job(&self, group_id: Uuid) -> Result<Option<ReconciliationJob>>;

    /// Newest first, joined with tenant names, optionally filtered by a name substring.
    async fn list_jobs(&self, name_filter: Option<&str>, limit: usize) -> Result<Vec<JobSummary>>;

    /// Forces an active job to failed. Returns false if it was not active.
    async fn reset_job(
        &self,
        job_id: Uuid,
        message: &str,
        completed_at: NaiveDateTime,
    ) -> Result<bool>;

    /// Forces every running job (of one tenant, or all) to failed.
    async fn reset_running_jobs(
        &self,
        group_id: Option<Uuid>,
        message: &str,
        completed_at: NaiveDateTime,
    ) -> Result<usize>;
}

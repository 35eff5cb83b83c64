// src/store/memory.rs
//
// In-memory store used by the unit tests. Counts every row written so tests can assert
// that an unchanged re-run writes nothing.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{BatchOutcome, JobStore, PendingClaimDates, ReconcileStore};
use crate::models::core::{BillingRecord, EntityKind, NamedEntity, Procedure, Tenant};
use crate::models::job::{JobCounters, JobStatus, JobSummary, ReconciliationJob};

#[derive(Default)]
struct MemoryState {
    tenants: HashMap<Uuid, Tenant>,
    entities: Vec<NamedEntity>,
    procedures: Vec<Procedure>,
    billing_records: Vec<BillingRecord>,
    jobs: Vec<ReconciliationJob>,
    writes: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_billing_inserts: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }

    pub fn add_tenant(&self, tenant: Tenant) {
        self.state().tenants.insert(tenant.id, tenant);
    }

    pub fn add_entity(&self, entity: NamedEntity) {
        self.state().entities.push(entity);
    }

    pub fn add_procedure(&self, procedure: Procedure) {
        self.state().procedures.push(procedure);
    }

    pub fn add_billing_record(&self, record: BillingRecord) {
        self.state().billing_records.push(record);
    }

    pub fn add_job(&self, job: ReconciliationJob) {
        self.state().jobs.push(job);
    }

    pub fn procedures(&self) -> Vec<Procedure> {
        self.state().procedures.clone()
    }

    pub fn billing_records(&self) -> Vec<BillingRecord> {
        self.state().billing_records.clone()
    }

    pub fn entities(&self, kind: EntityKind) -> Vec<NamedEntity> {
        self.state()
            .entities
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    pub fn jobs(&self) -> Vec<ReconciliationJob> {
        self.state().jobs.clone()
    }

    /// Rows inserted or updated since the store was created.
    pub fn writes(&self) -> usize {
        self.state().writes
    }

    pub fn fail_billing_inserts(&self, fail: bool) {
        self.fail_billing_inserts.store(fail, Ordering::SeqCst);
    }
}

fn merge_opt<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
    if value.is_some() {
        *slot = value.clone();
    }
}

#[async_trait]
impl ReconcileStore for MemoryStore {
    async fn load_tenant(&self, group_id: Uuid) -> Result<Option<Tenant>> {
        Ok(self.state().tenants.get(&group_id).cloned())
    }

    async fn load_entities(&self, group_id: Uuid, kind: EntityKind) -> Result<Vec<NamedEntity>> {
        Ok(self
            .state()
            .entities
            .iter()
            .filter(|e| e.group_id == group_id && e.kind == kind)
            .cloned()
            .collect())
    }

    async fn insert_entity(&self, entity: &NamedEntity) -> Result<()> {
        let mut state = self.state();
        state.entities.push(entity.clone());
        state.writes += 1;
        Ok(())
    }

    async fn load_candidate_procedures(
        &self,
        group_id: Uuid,
        since: NaiveDate,
    ) -> Result<Vec<Procedure>> {
        let mut procedures: Vec<Procedure> = self
            .state()
            .procedures
            .iter()
            .filter(|p| p.group_id == group_id && p.scheduled_start.date() >= since)
            .cloned()
            .collect();
        procedures.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(procedures)
    }

    async fn load_billing_records(
        &self,
        group_id: Uuid,
        claim_ids: &[String],
    ) -> Result<Vec<BillingRecord>> {
        Ok(self
            .state()
            .billing_records
            .iter()
            .filter(|r| {
                r.group_id == group_id
                    && r.claim_id
                        .as_ref()
                        .map_or(false, |claim| claim_ids.contains(claim))
            })
            .cloned()
            .collect())
    }

    async fn pending_claim_dates(&self, group_id: Uuid) -> Result<PendingClaimDates> {
        let state = self.state();
        let pending = state
            .billing_records
            .iter()
            .filter(|r| r.group_id == group_id && r.payment_status.is_pending());

        let mut dates = PendingClaimDates::default();
        for record in pending {
            let procedure_date = record.procedure_id.and_then(|pid| {
                state
                    .procedures
                    .iter()
                    .find(|p| p.id == pid)
                    .map(|p| p.scheduled_start.date())
            });
            dates.oldest_procedure_date = min_opt(dates.oldest_procedure_date, procedure_date);
            dates.oldest_api_surgery_date =
                min_opt(dates.oldest_api_surgery_date, record.api_surgery_date);
        }
        Ok(dates)
    }

    async fn insert_procedures(&self, procedures: &[Procedure]) -> Result<()> {
        let mut state = self.state();
        state.procedures.extend_from_slice(procedures);
        state.writes += procedures.len();
        Ok(())
    }

    async fn update_procedures(&self, procedures: &[Procedure]) -> Result<()> {
        let mut state = self.state();
        for updated in procedures {
            match state.procedures.iter_mut().find(|p| p.id == updated.id) {
                Some(stored) => *stored = updated.clone(),
                None => bail!("procedure {} does not exist", updated.id),
            }
        }
        state.writes += procedures.len();
        Ok(())
    }

    async fn insert_billing_records(&self, records: &[BillingRecord]) -> Result<BatchOutcome> {
        if self.fail_billing_inserts.load(Ordering::SeqCst) {
            bail!("simulated billing insert failure");
        }
        let mut guard = self.state();
        let state = &mut *guard;
        let mut outcome = BatchOutcome::default();
        for record in records {
            if let Some(pid) = record.procedure_id {
                if !state.procedures.iter().any(|p| p.id == pid) {
                    bail!("billing record {} references missing procedure {}", record.id, pid);
                }
            }
            let conflict = state.billing_records.iter_mut().find(|r| {
                record.procedure_id.is_some()
                    && record.claim_id.is_some()
                    && r.procedure_id == record.procedure_id
                    && r.claim_id == record.claim_id
            });
            match conflict {
                Some(existing) => {
                    merge_opt(&mut existing.billed_amount, &record.billed_amount);
                    merge_opt(&mut existing.received_amount, &record.received_amount);
                    merge_opt(&mut existing.recovered_amount, &record.recovered_amount);
                    merge_opt(&mut existing.accepted_amount, &record.accepted_amount);
                    merge_opt(&mut existing.payment_date, &record.payment_date);
                    existing.payment_status = record.payment_status;
                    outcome.merged += 1;
                }
                None => {
                    state.billing_records.push(record.clone());
                    outcome.inserted += 1;
                }
            }
        }
        state.writes += records.len();
        Ok(outcome)
    }

    async fn update_billing_records(&self, records: &[BillingRecord]) -> Result<()> {
        let mut guard = self.state();
        let state = &mut *guard;
        for updated in records {
            if let Some(pid) = updated.procedure_id {
                if !state.procedures.iter().any(|p| p.id == pid) {
                    bail!("billing record {} references missing procedure {}", updated.id, pid);
                }
            }
            match state.billing_records.iter_mut().find(|r| r.id == updated.id) {
                Some(stored) => *stored = updated.clone(),
                None => bail!("billing record {} does not exist", updated.id),
            }
        }
        state.writes += records.len();
        Ok(())
    }
}

fn min_opt(a: Option<NaiveDate>, b: Option<NaiveDate>) -> Option<NaiveDate> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: &ReconciliationJob) -> Result<bool> {
        let mut state = self.state();
        if state
            .jobs
            .iter()
            .any(|j| j.group_id == job.group_id && j.status.is_active())
        {
            return Ok(false);
        }
        state.jobs.push(job.clone());
        Ok(true)
    }

    async fn find_active_job(&self, group_id: Uuid) -> Result<Option<ReconciliationJob>> {
        Ok(self
            .state()
            .jobs
            .iter()
            .find(|j| j.group_id == group_id && j.status.is_active())
            .cloned())
    }

    async fn mark_job_running(&self, job_id: Uuid) -> Result<bool> {
        let mut state = self.state();
        match state
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id && j.status == JobStatus::Pending)
        {
            Some(job) => {
                job.status = JobStatus::Running;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_job_progress(
        &self,
        job_id: Uuid,
        counters: &JobCounters,
        step: &str,
    ) -> Result<bool> {
        let mut state = self.state();
        match state
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id && j.status == JobStatus::Running)
        {
            Some(job) => {
                job.counters = *counters;
                job.current_step = Some(step.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn finish_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        counters: &JobCounters,
        error_message: Option<&str>,
        completed_at: NaiveDateTime,
    ) -> Result<bool> {
        let mut state = self.state();
        match state
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id && j.status == JobStatus::Running)
        {
            Some(job) => {
                job.status = status;
                job.counters = *counters;
                job.error_message = error_message.map(str::to_string);
                job.completed_at = Some(completed_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ReconciliationJob>> {
        Ok(self.state().jobs.iter().find(|j| j.id == job_id).cloned())
    }

    async fn latest_completed_job(&self, group_id: Uuid) -> Result<Option<ReconciliationJob>> {
        Ok(self
            .state()
            .jobs
            .iter()
            .filter(|j| j.group_id == group_id && j.status == JobStatus::Completed)
            .max_by_key(|j| j.completed_at)
            .cloned())
    }

    async fn list_jobs(&self, name_filter: Option<&str>, limit: usize) -> Result<Vec<JobSummary>> {
        let state = self.state();
        let filter = name_filter.map(str::to_lowercase);
        let mut summaries: Vec<JobSummary> = state
            .jobs
            .iter()
            .filter_map(|job| {
                let tenant_name = state.tenants.get(&job.group_id)?.name.clone();
                let keep = filter
                    .as_ref()
                    .map_or(true, |f| tenant_name.to_lowercase().contains(f));
                keep.then(|| JobSummary {
                    job: job.clone(),
                    tenant_name,
                })
            })
            .collect();
        summaries.sort_by(|a, b| b.job.started_at.cmp(&a.job.started_at));
        summaries.truncate(limit);
        Ok(summaries)
    }

    async fn reset_job(
        &self,
        job_id: Uuid,
        message: &str,
        completed_at: NaiveDateTime,
    ) -> Result<bool> {
        let mut state = self.state();
        match state
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id && j.status.is_active())
        {
            Some(job) => {
                job.status = JobStatus::Failed;
                job.error_message = Some(message.to_string());
                job.completed_at = Some(completed_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reset_running_jobs(
        &self,
        group_id: Option<Uuid>,
        message: &str,
        completed_at: NaiveDateTime,
    ) -> Result<usize> {
        let mut state = self.state();
        let mut reset = 0;
        for job in state.jobs.iter_mut().filter(|j| {
            j.status == JobStatus::Running && group_id.map_or(true, |g| j.group_id == g)
        }) {
            job.status = JobStatus::Failed;
            job.error_message = Some(message.to_string());
            job.completed_at = Some(completed_at);
            reset += 1;
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::core::{ChargeType, ClinicType, PaymentStatus};
    use rust_decimal::Decimal;

    fn record(procedure_id: Uuid, billed: Option<i64>, status: PaymentStatus) -> BillingRecord {
        BillingRecord {
            id: Uuid::new_v4(),
            group_id: Uuid::nil(),
            procedure_id: Some(procedure_id),
            charge_type: ChargeType::Cooperative,
            billed_amount: billed.map(Decimal::from),
            received_amount: None,
            recovered_amount: None,
            accepted_amount: None,
            payment_status: status,
            payment_date: None,
            claim_id: Some("100200".to_string()),
            api_patient_name: None,
            api_surgery_date: None,
            api_hospital_name: None,
            api_clinician_name: None,
        }
    }

    #[tokio::test]
    async fn test_duplicate_procedure_claim_is_merged() {
        let store = MemoryStore::new();
        let procedure = Procedure {
            id: Uuid::new_v4(),
            group_id: Uuid::nil(),
            patient_name: "Maria Silva".to_string(),
            patient_birth_date: None,
            patient_national_id: None,
            scheduled_start: NaiveDate::from_ymd_opt(2025, 3, 10)
                .unwrap()
                .and_hms_opt(8, 0, 0)
                .unwrap(),
            scheduled_end: None,
            surgeon_id: None,
            hospital_id: None,
            cooperating_clinician_id: None,
            responsible_clinician_ids: Vec::new(),
            principal_procedure_id: None,
            clinic_type: ClinicType::Unspecified,
            accommodation: None,
            created_at: NaiveDate::from_ymd_opt(2025, 3, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
        };
        store.insert_procedures(&[procedure.clone()]).await.unwrap();

        let first = store
            .insert_billing_records(&[record(procedure.id, Some(1500), PaymentStatus::Processing)])
            .await
            .unwrap();
        assert_eq!(first, BatchOutcome { inserted: 1, merged: 0 });

        let second = store
            .insert_billing_records(&[record(procedure.id, None, PaymentStatus::Finalized)])
            .await
            .unwrap();
        assert_eq!(second, BatchOutcome { inserted: 0, merged: 1 });

        let rows = store.billing_records();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].billed_amount, Some(Decimal::from(1500)));
        assert_eq!(rows[0].payment_status, PaymentStatus::Finalized);
    }

    #[tokio::test]
    async fn test_billing_insert_rejects_unknown_procedure() {
        let store = MemoryStore::new();
        let result = store
            .insert_billing_records(&[record(Uuid::new_v4(), Some(10), PaymentStatus::Processing)])
            .await;
        assert!(result.is_err());
        assert!(store.billing_records().is_empty());
    }
}

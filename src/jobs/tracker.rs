// src/jobs/tracker.rs
use chrono::{NaiveDateTime, Utc};
use log::{info, warn};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{ReconcileError, Result};
use crate::models::job::{JobCounters, JobStatus, JobSummary, ReconciliationJob, RunStep};
use crate::store::JobStore;

pub const RESET_MESSAGE: &str = "Reset by administrator: job was stuck";

/// Durable state machine for reconciliation runs:
/// pending -> running -> completed | failed. Every progress write is guarded by
/// `status = 'running'`, so a run whose job was reset underneath it stops at the next write.
#[derive(Clone)]
pub struct JobTracker {
    store: Arc<dyn JobStore>,
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

impl JobTracker {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Opens a job for the tenant, rejecting the call if one is already active.
    pub async fn open(&self, group_id: Uuid) -> Result<Uuid> {
        if let Some(active) = self.store.find_active_job(group_id).await? {
            return Err(ReconcileError::AlreadyRunning {
                group_id,
                job_id: active.id,
            });
        }

        let job = ReconciliationJob {
            id: Uuid::new_v4(),
            group_id,
            status: JobStatus::Pending,
            started_at: now(),
            completed_at: None,
            counters: JobCounters::default(),
            current_step: None,
            error_message: None,
        };
        if !self.store.insert_job(&job).await? {
            // Lost a race with another process; report whoever holds the slot.
            let holder = self
                .store
                .find_active_job(group_id)
                .await?
                .map_or(Uuid::nil(), |j| j.id);
            return Err(ReconcileError::AlreadyRunning {
                group_id,
                job_id: holder,
            });
        }
        if !self.store.mark_job_running(job.id).await? {
            return Err(ReconcileError::JobNoLongerRunning(job.id));
        }
        info!("Opened reconciliation job {} for group {}", job.id, group_id);
        Ok(job.id)
    }

    pub async fn set_total(
        &self,
        job_id: Uuid,
        counters: &mut JobCounters,
        total: usize,
    ) -> Result<()> {
        counters.total_items = total;
        self.advance(job_id, counters, RunStep::Classifying).await
    }

    pub async fn advance(&self, job_id: Uuid, counters: &JobCounters, step: RunStep) -> Result<()> {
        let updated = self
            .store
            .update_job_progress(job_id, counters, step.description())
            .await?;
        if updated {
            Ok(())
        } else {
            Err(ReconcileError::JobNoLongerRunning(job_id))
        }
    }

    pub async fn complete(&self, job_id: Uuid, counters: &JobCounters) -> Result<()> {
        let updated = self
            .store
            .finish_job(job_id, JobStatus::Completed, counters, None, now())
            .await?;
        if updated {
            Ok(())
        } else {
            Err(ReconcileError::JobNoLongerRunning(job_id))
        }
    }

    /// Marks the job failed. A job that is no longer running keeps whatever state it has.
    pub async fn fail(&self, job_id: Uuid, counters: &JobCounters, error: &str) -> Result<()> {
        let updated = self
            .store
            .finish_job(job_id, JobStatus::Failed, counters, Some(error), now())
            .await?;
        if !updated {
            warn!(
                "Job {} was no longer running when marking it failed ({})",
                job_id, error
            );
        }
        Ok(())
    }

    /// Administrative reset of one job. Returns whether anything changed.
    pub async fn reset(&self, job_id: Uuid) -> Result<bool> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(ReconcileError::JobNotFound(job_id))?;
        if !job.status.is_active() {
            return Ok(false);
        }
        let changed = self.store.reset_job(job_id, RESET_MESSAGE, now()).await?;
        if changed {
            info!("Reset job {} (was {})", job_id, job.status);
        }
        Ok(changed)
    }

    pub async fn reset_running(&self, group_id: Option<Uuid>) -> Result<usize> {
        let count = self
            .store
            .reset_running_jobs(group_id, RESET_MESSAGE, now())
            .await?;
        info!("Reset {} running job(s)", count);
        Ok(count)
    }

    pub async fn list_recent(
        &self,
        name_filter: Option<&str>,
        limit: usize,
    ) -> Result<Vec<JobSummary>> {
        Ok(self.store.list_jobs(name_filter, limit).await?)
    }

    pub async fn latest_completed(&self, group_id: Uuid) -> Result<Option<ReconciliationJob>> {
        Ok(self.store.latest_completed_job(group_id).await?)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<ReconciliationJob>> {
        Ok(self.store.get_job(job_id).await?)
    }
}

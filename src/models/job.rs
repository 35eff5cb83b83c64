// src/models/job.rs
use chrono::NaiveDateTime;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            JobStatus::Pending => "⏳",
            JobStatus::Running => "▶️",
            JobStatus::Completed => "✅",
            JobStatus::Failed => "❌",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The stages of one run, in order. The description is what monitors see as `current_step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStep {
    ComputingWindow,
    Fetching,
    Classifying,
    Batching,
    Finalizing,
}

impl RunStep {
    pub fn description(&self) -> &'static str {
        match self {
            RunStep::ComputingWindow => "Computing reconciliation window",
            RunStep::Fetching => "Fetching guides from billing API",
            RunStep::Classifying => "Classifying guides",
            RunStep::Batching => "Writing batch",
            RunStep::Finalizing => "Finalizing",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounters {
    pub total_items: usize,
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub linked: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationJob {
    pub id: Uuid,
    pub group_id: Uuid,
    pub status: JobStatus,
    pub started_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
    pub counters: JobCounters,
    pub current_step: Option<String>,
    pub error_message: Option<String>,
}

impl ReconciliationJob {
    pub fn progress_label(&self) -> String {
        format!("{}/{}", self.counters.processed, self.counters.total_items)
    }
}

/// A job row joined with its tenant's name, for the monitoring CLI.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    #[serde(flatten)]
    pub job: ReconciliationJob,
    pub tenant_name: String,
}

// src/error.rs
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Tenant {0} not found")]
    TenantNotFound(Uuid),

    #[error("Tenant {0} has no billing API credential configured")]
    MissingCredential(String),

    #[error("Tenant {group_id} already has an active reconciliation job ({job_id})")]
    AlreadyRunning { group_id: Uuid, job_id: Uuid },

    #[error("Reconciliation job {0} not found")]
    JobNotFound(Uuid),

    #[error("Reconciliation job {0} is no longer running (reset by an administrator?)")]
    JobNoLongerRunning(Uuid),

    #[error("Billing API request failed: {0}")]
    Api(String),

    #[error("Billing API returned result code {code}: {message}")]
    ApiResult { code: String, message: String },

    #[error("Malformed billing API response: {0}")]
    MalformedResponse(String),

    #[error("Persistence error: {0:#}")]
    Persistence(#[from] anyhow::Error),

    #[error("Reconciliation cancelled")]
    Cancelled,
}

impl ReconcileError {
    /// Configuration errors are raised before a job exists and never mark one as failed.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ReconcileError::TenantNotFound(_) | ReconcileError::MissingCredential(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

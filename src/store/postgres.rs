// src/store/postgres.rs
//
// PostgreSQL implementation of the storage seams. Every batch write runs in its own
// transaction: a failed batch rolls back alone and earlier batches stay committed.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use log::{debug, error, info};
use postgres_types::ToSql;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Row, Transaction};
use uuid::Uuid;

use super::{BatchOutcome, JobStore, PendingClaimDates, ReconcileStore};
use crate::models::core::{
    midnight, BillingRecord, ChargeType, ClinicType, EntityKind, NamedEntity, PaymentStatus,
    Procedure, Tenant,
};
use crate::models::job::{JobCounters, JobStatus, JobSummary, ReconciliationJob};
use crate::utils::db_connect::PgPool;

const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");

const PROCEDURE_SELECT: &str = "
    SELECT p.id, p.group_id, p.patient_name, p.patient_birth_date, p.patient_national_id,
           p.scheduled_start, p.scheduled_end, p.surgeon_id, p.hospital_id,
           p.cooperating_clinician_id, p.principal_procedure_id, p.clinic_type,
           p.accommodation, p.created_at,
           COALESCE(
               array_agg(pc.anesthesiologist_id ORDER BY pc.position)
                   FILTER (WHERE pc.anesthesiologist_id IS NOT NULL),
               '{}'::uuid[]
           ) AS responsible_clinician_ids
    FROM reconciliation.procedure p
    LEFT JOIN reconciliation.procedure_clinician pc ON pc.procedure_id = p.id";

const BILLING_COLUMNS: &str = "id, group_id, procedure_id, charge_type, billed_amount, \
     received_amount, recovered_amount, accepted_amount, payment_status, payment_date, \
     claim_id, api_patient_name, api_surgery_date, api_hospital_name, api_clinician_name";

const JOB_COLUMNS: &str = "j.id, j.group_id, j.status, j.started_at, j.completed_at, \
     j.total_items, j.processed_items, j.created_items, j.updated_items, j.linked_items, \
     j.current_step, j.error_message";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the reconciliation schema if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for schema setup")?;
        conn.batch_execute(SCHEMA_SQL)
            .await
            .context("Failed to apply reconciliation schema")?;
        info!("Reconciliation schema is in place");
        Ok(())
    }
}

/// "($n, $n+1, ...)" for one VALUES row.
fn placeholders(first: usize, count: usize) -> String {
    let parts: Vec<String> = (first..first + count).map(|i| format!("${}", i)).collect();
    format!("({})", parts.join(", "))
}

fn as_params(params: &[Box<dyn ToSql + Sync + Send>]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

fn to_db_count(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db_count(row: &Row, column: &str) -> usize {
    usize::try_from(row.get::<_, i64>(column)).unwrap_or(0)
}

fn procedure_from_row(row: &Row) -> Procedure {
    let clinic_type: String = row.get("clinic_type");
    Procedure {
        id: row.get("id"),
        group_id: row.get("group_id"),
        patient_name: row.get("patient_name"),
        patient_birth_date: row.get("patient_birth_date"),
        patient_national_id: row.get("patient_national_id"),
        scheduled_start: row.get("scheduled_start"),
        scheduled_end: row.get("scheduled_end"),
        surgeon_id: row.get("surgeon_id"),
        hospital_id: row.get("hospital_id"),
        cooperating_clinician_id: row.get("cooperating_clinician_id"),
        responsible_clinician_ids: row.get("responsible_clinician_ids"),
        principal_procedure_id: row.get("principal_procedure_id"),
        clinic_type: ClinicType::from_db(&clinic_type),
        accommodation: row.get("accommodation"),
        created_at: row.get("created_at"),
    }
}

fn billing_record_from_row(row: &Row) -> Result<BillingRecord> {
    let charge_type: String = row.get("charge_type");
    let payment_status: String = row.get("payment_status");
    Ok(BillingRecord {
        id: row.get("id"),
        group_id: row.get("group_id"),
        procedure_id: row.get("procedure_id"),
        charge_type: ChargeType::from_db(&charge_type)
            .ok_or_else(|| anyhow!("Unknown charge type '{}'", charge_type))?,
        billed_amount: row.get("billed_amount"),
        received_amount: row.get("received_amount"),
        recovered_amount: row.get("recovered_amount"),
        accepted_amount: row.get("accepted_amount"),
        payment_status: PaymentStatus::from_db(&payment_status)
            .ok_or_else(|| anyhow!("Unknown payment status '{}'", payment_status))?,
        payment_date: row.get("payment_date"),
        claim_id: row.get("claim_id"),
        api_patient_name: row.get("api_patient_name"),
        api_surgery_date: row.get("api_surgery_date"),
        api_hospital_name: row.get("api_hospital_name"),
        api_clinician_name: row.get("api_clinician_name"),
    })
}

fn job_from_row(row: &Row) -> Result<ReconciliationJob> {
    let status: String = row.get("status");
    Ok(ReconciliationJob {
        id: row.get("id"),
        group_id: row.get("group_id"),
        status: JobStatus::from_db(&status)
            .ok_or_else(|| anyhow!("Unknown job status '{}'", status))?,
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        counters: JobCounters {
            total_items: from_db_count(row, "total_items"),
            processed: from_db_count(row, "processed_items"),
            created: from_db_count(row, "created_items"),
            updated: from_db_count(row, "updated_items"),
            linked: from_db_count(row, "linked_items"),
        },
        current_step: row.get("current_step"),
        error_message: row.get("error_message"),
    })
}

/// Rewrites the responsible-clinician links of `procedures` inside the batch transaction.
async fn replace_clinicians(tx: &Transaction<'_>, procedures: &[Procedure]) -> Result<()> {
    let ids: Vec<Uuid> = procedures.iter().map(|p| p.id).collect();
    tx.execute(
        "DELETE FROM reconciliation.procedure_clinician WHERE procedure_id = ANY($1)",
        &[&ids],
    )
    .await
    .context("Failed to clear procedure clinician links")?;

    let mut procedure_ids: Vec<Uuid> = Vec::new();
    let mut clinician_ids: Vec<Uuid> = Vec::new();
    let mut positions: Vec<i32> = Vec::new();
    for procedure in procedures {
        for (position, clinician) in procedure.responsible_clinician_ids.iter().enumerate() {
            procedure_ids.push(procedure.id);
            clinician_ids.push(*clinician);
            positions.push(i32::try_from(position).unwrap_or(i32::MAX));
        }
    }
    if procedure_ids.is_empty() {
        return Ok(());
    }

    tx.execute(
        "INSERT INTO reconciliation.procedure_clinician (procedure_id, anesthesiologist_id, position)
         SELECT * FROM UNNEST($1::uuid[], $2::uuid[], $3::int4[])",
        &[&procedure_ids, &clinician_ids, &positions],
    )
    .await
    .context("Failed to insert procedure clinician links")?;
    Ok(())
}

#[async_trait]
impl ReconcileStore for PgStore {
    async fn load_tenant(&self, group_id: Uuid) -> Result<Option<Tenant>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for load_tenant")?;
        let row = conn
            .query_opt(
                "SELECT id, name, api_credential FROM reconciliation.tenant WHERE id = $1",
                &[&group_id],
            )
            .await
            .context("Failed to query tenant")?;
        Ok(row.map(|row| Tenant {
            id: row.get("id"),
            name: row.get("name"),
            api_credential: row.get("api_credential"),
        }))
    }

    async fn load_entities(&self, group_id: Uuid, kind: EntityKind) -> Result<Vec<NamedEntity>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for load_entities")?;
        let sql = format!(
            "SELECT id, group_id, name, secondary_key FROM {} WHERE group_id = $1 ORDER BY created_at, id",
            kind.table_name()
        );
        let rows = conn
            .query(sql.as_str(), &[&group_id])
            .await
            .with_context(|| format!("Failed to query {} rows", kind.label()))?;
        Ok(rows
            .iter()
            .map(|row| NamedEntity {
                id: row.get("id"),
                group_id: row.get("group_id"),
                kind,
                name: row.get("name"),
                secondary_key: row.get("secondary_key"),
            })
            .collect())
    }

    async fn insert_entity(&self, entity: &NamedEntity) -> Result<()> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for insert_entity")?;
        let sql = format!(
            "INSERT INTO {} (id, group_id, name, secondary_key) VALUES ($1, $2, $3, $4)",
            entity.kind.table_name()
        );
        conn.execute(
            sql.as_str(),
            &[
                &entity.id,
                &entity.group_id,
                &entity.name,
                &entity.secondary_key,
            ],
        )
        .await
        .with_context(|| format!("Failed to insert {} '{}'", entity.kind.label(), entity.name))?;
        Ok(())
    }

    async fn load_candidate_procedures(
        &self,
        group_id: Uuid,
        since: NaiveDate,
    ) -> Result<Vec<Procedure>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for load_candidate_procedures")?;
        let since_ts: NaiveDateTime = since.and_time(midnight());
        let sql = format!(
            "{} WHERE p.group_id = $1 AND p.scheduled_start >= $2
             GROUP BY p.id
             ORDER BY p.created_at, p.id",
            PROCEDURE_SELECT
        );
        let rows = conn
            .query(sql.as_str(), &[&group_id, &since_ts])
            .await
            .context("Failed to query candidate procedures")?;
        Ok(rows.iter().map(procedure_from_row).collect())
    }

    async fn load_billing_records(
        &self,
        group_id: Uuid,
        claim_ids: &[String],
    ) -> Result<Vec<BillingRecord>> {
        if claim_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for load_billing_records")?;
        let sql = format!(
            "SELECT {} FROM reconciliation.billing_record
             WHERE group_id = $1 AND claim_id = ANY($2)
             ORDER BY created_at, id",
            BILLING_COLUMNS
        );
        let rows = conn
            .query(sql.as_str(), &[&group_id, &claim_ids])
            .await
            .context("Failed to query billing records by claim")?;
        rows.iter().map(billing_record_from_row).collect()
    }

    async fn pending_claim_dates(&self, group_id: Uuid) -> Result<PendingClaimDates> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for pending_claim_dates")?;
        let pending: Vec<&str> = PaymentStatus::PENDING.iter().map(|s| s.as_str()).collect();
        let row = conn
            .query_one(
                "SELECT MIN(p.scheduled_start)::date AS oldest_procedure_date,
                        MIN(b.api_surgery_date) AS oldest_api_surgery_date
                 FROM reconciliation.billing_record b
                 LEFT JOIN reconciliation.procedure p ON p.id = b.procedure_id
                 WHERE b.group_id = $1 AND b.payment_status = ANY($2)",
                &[&group_id, &pending],
            )
            .await
            .context("Failed to query pending claim dates")?;
        Ok(PendingClaimDates {
            oldest_procedure_date: row.get("oldest_procedure_date"),
            oldest_api_surgery_date: row.get("oldest_api_surgery_date"),
        })
    }

    async fn insert_procedures(&self, procedures: &[Procedure]) -> Result<()> {
        if procedures.is_empty() {
            return Ok(());
        }
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for insert_procedures")?;
        let tx = conn
            .transaction()
            .await
            .context("Failed to start transaction for procedure batch")?;

        const COLUMNS: usize = 14;
        let mut values_clause_parts = Vec::with_capacity(procedures.len());
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> =
            Vec::with_capacity(procedures.len() * COLUMNS);
        for (i, p) in procedures.iter().enumerate() {
            values_clause_parts.push(placeholders(i * COLUMNS + 1, COLUMNS));
            params.push(Box::new(p.id));
            params.push(Box::new(p.group_id));
            params.push(Box::new(p.patient_name.clone()));
            params.push(Box::new(p.patient_birth_date));
            params.push(Box::new(p.patient_national_id.clone()));
            params.push(Box::new(p.scheduled_start));
            params.push(Box::new(p.scheduled_end));
            params.push(Box::new(p.surgeon_id));
            params.push(Box::new(p.hospital_id));
            params.push(Box::new(p.cooperating_clinician_id));
            params.push(Box::new(p.principal_procedure_id));
            params.push(Box::new(p.clinic_type.as_str()));
            params.push(Box::new(p.accommodation.clone()));
            params.push(Box::new(p.created_at));
        }

        let insert_sql = format!(
            "INSERT INTO reconciliation.procedure (
                id, group_id, patient_name, patient_birth_date, patient_national_id,
                scheduled_start, scheduled_end, surgeon_id, hospital_id,
                cooperating_clinician_id, principal_procedure_id, clinic_type,
                accommodation, created_at
             ) VALUES {}",
            values_clause_parts.join(", ")
        );
        let params_slice = as_params(&params);
        debug!("Inserting {} procedures ({} parameters)", procedures.len(), params_slice.len());

        tx.execute(insert_sql.as_str(), params_slice.as_slice())
            .await
            .map_err(|e| {
                error!("Procedure batch insert SQL error: {}", e);
                e
            })
            .context("Failed to execute procedure batch insert")?;
        replace_clinicians(&tx, procedures).await?;

        tx.commit()
            .await
            .context("Failed to commit procedure batch")?;
        Ok(())
    }

    async fn update_procedures(&self, procedures: &[Procedure]) -> Result<()> {
        if procedures.is_empty() {
            return Ok(());
        }
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for update_procedures")?;
        let tx = conn
            .transaction()
            .await
            .context("Failed to start transaction for procedure updates")?;

        let stmt = tx
            .prepare(
                "UPDATE reconciliation.procedure SET
                    patient_birth_date = $2, patient_national_id = $3,
                    scheduled_start = $4, scheduled_end = $5,
                    surgeon_id = $6, hospital_id = $7, cooperating_clinician_id = $8,
                    principal_procedure_id = $9, clinic_type = $10, accommodation = $11,
                    updated_at = now()
                 WHERE id = $1",
            )
            .await
            .context("Failed to prepare procedure update")?;

        for p in procedures {
            tx.execute(
                &stmt,
                &[
                    &p.id,
                    &p.patient_birth_date,
                    &p.patient_national_id,
                    &p.scheduled_start,
                    &p.scheduled_end,
                    &p.surgeon_id,
                    &p.hospital_id,
                    &p.cooperating_clinician_id,
                    &p.principal_procedure_id,
                    &p.clinic_type.as_str(),
                    &p.accommodation,
                ],
            )
            .await
            .with_context(|| format!("Failed to update procedure {}", p.id))?;
        }
        replace_clinicians(&tx, procedures).await?;

        tx.commit()
            .await
            .context("Failed to commit procedure updates")?;
        Ok(())
    }

    async fn insert_billing_records(&self, records: &[BillingRecord]) -> Result<BatchOutcome> {
        if records.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for insert_billing_records")?;
        let tx = conn
            .transaction()
            .await
            .context("Failed to start transaction for billing batch")?;

        const COLUMNS: usize = 15;
        let mut values_clause_parts = Vec::with_capacity(records.len());
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> =
            Vec::with_capacity(records.len() * COLUMNS);
        for (i, r) in records.iter().enumerate() {
            values_clause_parts.push(placeholders(i * COLUMNS + 1, COLUMNS));
            params.push(Box::new(r.id));
            params.push(Box::new(r.group_id));
            params.push(Box::new(r.procedure_id));
            params.push(Box::new(r.charge_type.as_str()));
            params.push(Box::new(r.billed_amount));
            params.push(Box::new(r.received_amount));
            params.push(Box::new(r.recovered_amount));
            params.push(Box::new(r.accepted_amount));
            params.push(Box::new(r.payment_status.as_str()));
            params.push(Box::new(r.payment_date));
            params.push(Box::new(r.claim_id.clone()));
            params.push(Box::new(r.api_patient_name.clone()));
            params.push(Box::new(r.api_surgery_date));
            params.push(Box::new(r.api_hospital_name.clone()));
            params.push(Box::new(r.api_clinician_name.clone()));
        }

        // A row colliding on (procedure_id, claim_id) is folded into the existing one:
        // amounts fill in where the new row has them, status always follows the new row.
        let upsert_sql = format!(
            "INSERT INTO reconciliation.billing_record ({}) VALUES {}
             ON CONFLICT (procedure_id, claim_id) DO UPDATE SET
                billed_amount = COALESCE(EXCLUDED.billed_amount, billing_record.billed_amount),
                received_amount = COALESCE(EXCLUDED.received_amount, billing_record.received_amount),
                recovered_amount = COALESCE(EXCLUDED.recovered_amount, billing_record.recovered_amount),
                accepted_amount = COALESCE(EXCLUDED.accepted_amount, billing_record.accepted_amount),
                payment_date = COALESCE(EXCLUDED.payment_date, billing_record.payment_date),
                payment_status = EXCLUDED.payment_status,
                updated_at = now()
             RETURNING (xmax = 0) AS was_inserted",
            BILLING_COLUMNS,
            values_clause_parts.join(", ")
        );
        let params_slice = as_params(&params);
        debug!("Upserting {} billing records ({} parameters)", records.len(), params_slice.len());

        let rows = tx
            .query(upsert_sql.as_str(), params_slice.as_slice())
            .await
            .map_err(|e| {
                error!("Billing batch upsert SQL error: {}", e);
                e
            })
            .context("Failed to execute billing record batch upsert")?;

        let mut outcome = BatchOutcome::default();
        for row in rows {
            if row.get::<_, bool>("was_inserted") {
                outcome.inserted += 1;
            } else {
                outcome.merged += 1;
            }
        }

        tx.commit()
            .await
            .context("Failed to commit billing record batch")?;
        Ok(outcome)
    }

    async fn update_billing_records(&self, records: &[BillingRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for update_billing_records")?;
        let tx = conn
            .transaction()
            .await
            .context("Failed to start transaction for billing updates")?;

        let stmt = tx
            .prepare(
                "UPDATE reconciliation.billing_record SET
                    procedure_id = $2, billed_amount = $3, received_amount = $4,
                    recovered_amount = $5, accepted_amount = $6, payment_status = $7,
                    payment_date = $8, api_patient_name = $9, api_surgery_date = $10,
                    api_hospital_name = $11, api_clinician_name = $12, updated_at = now()
                 WHERE id = $1",
            )
            .await
            .context("Failed to prepare billing record update")?;

        for r in records {
            tx.execute(
                &stmt,
                &[
                    &r.id,
                    &r.procedure_id,
                    &r.billed_amount,
                    &r.received_amount,
                    &r.recovered_amount,
                    &r.accepted_amount,
                    &r.payment_status.as_str(),
                    &r.payment_date,
                    &r.api_patient_name,
                    &r.api_surgery_date,
                    &r.api_hospital_name,
                    &r.api_clinician_name,
                ],
            )
            .await
            .with_context(|| format!("Failed to update billing record {}", r.id))?;
        }

        tx.commit()
            .await
            .context("Failed to commit billing record updates")?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn insert_job(&self, job: &ReconciliationJob) -> Result<bool> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for insert_job")?;
        let result = conn
            .execute(
                "INSERT INTO reconciliation.reconciliation_job (id, group_id, status, started_at)
                 VALUES ($1, $2, $3, $4)",
                &[&job.id, &job.group_id, &job.status.as_str(), &job.started_at],
            )
            .await;
        match result {
            Ok(_) => Ok(true),
            // The partial unique index allows one active job per tenant.
            Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => Ok(false),
            Err(e) => Err(e).context("Failed to insert reconciliation job"),
        }
    }

    async fn find_active_job(&self, group_id: Uuid) -> Result<Option<ReconciliationJob>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for find_active_job")?;
        let sql = format!(
            "SELECT {} FROM reconciliation.reconciliation_job j
             WHERE j.group_id = $1 AND j.status IN ('pending', 'running')
             ORDER BY j.started_at DESC LIMIT 1",
            JOB_COLUMNS
        );
        let row = conn
            .query_opt(sql.as_str(), &[&group_id])
            .await
            .context("Failed to query active job")?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn mark_job_running(&self, job_id: Uuid) -> Result<bool> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for mark_job_running")?;
        let updated = conn
            .execute(
                "UPDATE reconciliation.reconciliation_job SET status = 'running'
                 WHERE id = $1 AND status = 'pending'",
                &[&job_id],
            )
            .await
            .context("Failed to mark job running")?;
        Ok(updated > 0)
    }

    async fn update_job_progress(
        &self,
        job_id: Uuid,
        counters: &JobCounters,
        step: &str,
    ) -> Result<bool> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for update_job_progress")?;
        let updated = conn
            .execute(
                "UPDATE reconciliation.reconciliation_job SET
                    total_items = $2, processed_items = $3, created_items = $4,
                    updated_items = $5, linked_items = $6, current_step = $7
                 WHERE id = $1 AND status = 'running'",
                &[
                    &job_id,
                    &to_db_count(counters.total_items),
                    &to_db_count(counters.processed),
                    &to_db_count(counters.created),
                    &to_db_count(counters.updated),
                    &to_db_count(counters.linked),
                    &step,
                ],
            )
            .await
            .context("Failed to update job progress")?;
        Ok(updated > 0)
    }

    async fn finish_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        counters: &JobCounters,
        error_message: Option<&str>,
        completed_at: NaiveDateTime,
    ) -> Result<bool> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for finish_job")?;
        let updated = conn
            .execute(
                "UPDATE reconciliation.reconciliation_job SET
                    status = $2, total_items = $3, processed_items = $4, created_items = $5,
                    updated_items = $6, linked_items = $7, error_message = $8,
                    completed_at = $9, current_step = NULL
                 WHERE id = $1 AND status = 'running'",
                &[
                    &job_id,
                    &status.as_str(),
                    &to_db_count(counters.total_items),
                    &to_db_count(counters.processed),
                    &to_db_count(counters.created),
                    &to_db_count(counters.updated),
                    &to_db_count(counters.linked),
                    &error_message,
                    &completed_at,
                ],
            )
            .await
            .context("Failed to finish job")?;
        Ok(updated > 0)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ReconciliationJob>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for get_job")?;
        let sql = format!(
            "SELECT {} FROM reconciliation.reconciliation_job j WHERE j.id = $1",
            JOB_COLUMNS
        );
        let row = conn
            .query_opt(sql.as_str(), &[&job_id])
            .await
            .context("Failed to query job")?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn latest_completed_job(&self, group_id: Uuid) -> Result<Option<ReconciliationJob>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for latest_completed_job")?;
        let sql = format!(
            "SELECT {} FROM reconciliation.reconciliation_job j
             WHERE j.group_id = $1 AND j.status = 'completed'
             ORDER BY j.completed_at DESC NULLS LAST LIMIT 1",
            JOB_COLUMNS
        );
        let row = conn
            .query_opt(sql.as_str(), &[&group_id])
            .await
            .context("Failed to query latest completed job")?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self, name_filter: Option<&str>, limit: usize) -> Result<Vec<JobSummary>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for list_jobs")?;
        let sql = format!(
            "SELECT {}, t.name AS tenant_name
             FROM reconciliation.reconciliation_job j
             JOIN reconciliation.tenant t ON t.id = j.group_id
             WHERE $1::text IS NULL OR t.name ILIKE '%' || $1::text || '%'
             ORDER BY j.started_at DESC
             LIMIT $2",
            JOB_COLUMNS
        );
        let rows = conn
            .query(sql.as_str(), &[&name_filter, &to_db_count(limit)])
            .await
            .context("Failed to list reconciliation jobs")?;
        rows.iter()
            .map(|row| {
                Ok(JobSummary {
                    job: job_from_row(row)?,
                    tenant_name: row.get("tenant_name"),
                })
            })
            .collect()
    }

    async fn reset_job(
        &self,
        job_id: Uuid,
        message: &str,
        completed_at: NaiveDateTime,
    ) -> Result<bool> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for reset_job")?;
        let updated = conn
            .execute(
                "UPDATE reconciliation.reconciliation_job
                 SET status = 'failed', error_message = $2, completed_at = $3, current_step = NULL
                 WHERE id = $1 AND status IN ('pending', 'running')",
                &[&job_id, &message, &completed_at],
            )
            .await
            .context("Failed to reset job")?;
        Ok(updated > 0)
    }

    async fn reset_running_jobs(
        &self,
        group_id: Option<Uuid>,
        message: &str,
        completed_at: NaiveDateTime,
    ) -> Result<usize> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for reset_running_jobs")?;
        let updated = conn
            .execute(
                "UPDATE reconciliation.reconciliation_job
                 SET status = 'failed', error_message = $2, completed_at = $3, current_step = NULL
                 WHERE status = 'running' AND ($1::uuid IS NULL OR group_id = $1::uuid)",
                &[&group_id, &message, &completed_at],
            )
            .await
            .context("Failed to reset running jobs")?;
        Ok(usize::try_from(updated).unwrap_or(usize::MAX))
    }
}

// src/reconciliation/orchestrator.rs
//
// Drives one reconciliation run for one tenant:
// window -> fetch -> classify (newest first) -> batched writes -> finalize.
// A run is sequential; the binary runs several tenants side by side.

use anyhow::Context;
use chrono::{Duration, NaiveDate, NaiveDateTime, Utc};
use indicatif::ProgressBar;
use log::{debug, warn};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::error::{ReconcileError, Result};
use crate::guides::client::GuideSource;
use crate::guides::normalizer::{normalize_guide, sort_guides_newest_first};
use crate::jobs::tracker::JobTracker;
use crate::matching::procedure::{find_best_match, MatchCandidate, MatchMode, MAX_DAY_DIFFERENCE};
use crate::models::core::{BillingRecord, EntityKind, EntityRefs, Procedure};
use crate::models::guide::Guide;
use crate::models::job::{JobCounters, RunStep};
use crate::models::stats_models::RunReport;
use crate::reconciliation::batch::{BatchKind, MutationBatches};
use crate::reconciliation::window::{compute_window, ReconciliationWindow, WindowAnchors};
use crate::resolution::EntityResolver;
use crate::store::ReconcileStore;
use crate::utils::config::ReconcileConfig;
use crate::utils::logging::RunLogger;

/// Shared stop signal. Checked between guides and after every batch flush.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub full_rescan: bool,
    pub max_guides: Option<usize>,
    pub batch_size: usize,
    pub epoch: NaiveDate,
    pub safety_buffer_days: i64,
    pub today: NaiveDate,
}

impl RunOptions {
    pub fn from_config(config: &ReconcileConfig, today: NaiveDate) -> Self {
        Self {
            full_rescan: false,
            max_guides: config.max_guides,
            batch_size: config.batch_size,
            epoch: config.epoch,
            safety_buffer_days: config.safety_buffer_days,
            today,
        }
    }
}

/// Earliest scheduled date a candidate procedure needs to match any fetched guide.
/// The API filters on its own date, so a guide can carry a surgery date older than the window.
fn candidate_floor(window: &ReconciliationWindow, guides: &[Guide]) -> NaiveDate {
    let earliest = guides
        .iter()
        .filter_map(|g| g.surgery_date)
        .fold(window.start, NaiveDate::min);
    earliest - Duration::days(MAX_DAY_DIFFERENCE)
}

pub struct Reconciler {
    store: Arc<dyn ReconcileStore>,
    tracker: JobTracker,
    source: Arc<dyn GuideSource>,
    options: RunOptions,
    cancel: CancellationFlag,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ReconcileStore>,
        tracker: JobTracker,
        source: Arc<dyn GuideSource>,
        options: RunOptions,
    ) -> Self {
        Self {
            store,
            tracker,
            source,
            options,
            cancel: CancellationFlag::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Reconciles one tenant. Configuration problems are reported before any job exists;
    /// anything after the job is opened marks it failed.
    pub async fn run(&self, group_id: Uuid, progress: Option<ProgressBar>) -> Result<RunReport> {
        let tenant = self
            .store
            .load_tenant(group_id)
            .await?
            .ok_or(ReconcileError::TenantNotFound(group_id))?;
        let credential = tenant
            .credential()
            .ok_or_else(|| ReconcileError::MissingCredential(tenant.name.clone()))?
            .to_string();

        let job_id = self.tracker.open(group_id).await?;
        let logger = RunLogger::new(&tenant.name);
        logger.log_start(&job_id.to_string(), self.options.full_rescan);

        let mut run = Run {
            store: self.store.as_ref(),
            tracker: &self.tracker,
            source: self.source.as_ref(),
            options: &self.options,
            cancel: &self.cancel,
            logger: &logger,
            progress,
            group_id,
            job_id,
            started: Instant::now(),
            counters: JobCounters::default(),
            report: RunReport {
                job_id,
                group_id,
                ..RunReport::default()
            },
        };

        let outcome = match run.execute(&credential).await {
            Ok(()) => self.tracker.complete(job_id, &run.counters).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                let report = run.into_report();
                logger.log_completion(&report);
                Ok(report)
            }
            Err(e) => {
                logger.log_error(&format!("Reconciliation failed: {}", e));
                if !matches!(e, ReconcileError::JobNoLongerRunning(_)) {
                    if let Err(fail_err) = self.tracker.fail(job_id, &run.counters, &e.to_string()).await {
                        logger.log_error(&format!("Could not mark job {} failed: {}", job_id, fail_err));
                    }
                }
                if let Some(pb) = &run.progress {
                    pb.abandon_with_message(format!("Failed: {}", e));
                }
                Err(e)
            }
        }
    }
}

/// Everything loaded for the classification phase.
struct RunState {
    resolver: EntityResolver,
    procedures: Vec<Procedure>,
    /// Parallel to `procedures`, kept in (created_at, id) order.
    candidates: Vec<MatchCandidate>,
    procedure_index: HashMap<Uuid, usize>,
    records: Vec<BillingRecord>,
    record_index: HashMap<Uuid, usize>,
    records_by_claim: HashMap<String, Vec<usize>>,
    batches: MutationBatches,
}

impl RunState {
    fn new(
        resolver: EntityResolver,
        procedures: Vec<Procedure>,
        records: Vec<BillingRecord>,
        batch_size: usize,
    ) -> Self {
        let mut state = Self {
            resolver,
            procedures: Vec::with_capacity(procedures.len()),
            candidates: Vec::with_capacity(procedures.len()),
            procedure_index: HashMap::new(),
            records: Vec::with_capacity(records.len()),
            record_index: HashMap::new(),
            records_by_claim: HashMap::new(),
            batches: MutationBatches::new(batch_size),
        };
        for procedure in procedures {
            state.add_procedure(procedure);
        }
        for record in records {
            state.add_record(record);
        }
        state
    }

    fn add_procedure(&mut self, procedure: Procedure) -> usize {
        let idx = self.procedures.len();
        self.candidates.push(candidate_for(&procedure, &self.resolver));
        self.procedure_index.insert(procedure.id, idx);
        self.procedures.push(procedure);
        idx
    }

    fn refresh_candidate(&mut self, idx: usize) {
        self.candidates[idx] = candidate_for(&self.procedures[idx], &self.resolver);
    }

    fn add_record(&mut self, record: BillingRecord) -> usize {
        let idx = self.records.len();
        self.record_index.insert(record.id, idx);
        if let Some(claim) = &record.claim_id {
            self.records_by_claim.entry(claim.clone()).or_default().push(idx);
        }
        self.records.push(record);
        idx
    }

    /// Whether some billing record already ties `claim_id` to this procedure.
    fn claim_linked_to(&self, procedure_id: Uuid, claim_id: &str) -> bool {
        self.records_by_claim.get(claim_id).map_or(false, |indices| {
            indices
                .iter()
                .any(|idx| self.records[*idx].procedure_id == Some(procedure_id))
        })
    }

    fn procedures_by_id(&self, ids: &[Uuid]) -> Vec<Procedure> {
        ids.iter()
            .filter_map(|id| self.procedure_index.get(id))
            .map(|idx| self.procedures[*idx].clone())
            .collect()
    }

    fn records_by_id(&self, ids: &[Uuid]) -> Vec<BillingRecord> {
        ids.iter()
            .filter_map(|id| self.record_index.get(id))
            .map(|idx| self.records[*idx].clone())
            .collect()
    }
}

fn candidate_for(procedure: &Procedure, resolver: &EntityResolver) -> MatchCandidate {
    let hospital_name = procedure
        .hospital_id
        .and_then(|id| resolver.name_of(EntityKind::Hospital, &id))
        .map(str::to_string);

    let mut clinician_ids: Vec<Uuid> = procedure.responsible_clinician_ids.clone();
    if let Some(cooperating) = procedure.cooperating_clinician_id {
        if !clinician_ids.contains(&cooperating) {
            clinician_ids.push(cooperating);
        }
    }
    let clinician_names = clinician_ids
        .iter()
        .filter_map(|id| resolver.name_of(EntityKind::Anesthesiologist, id))
        .map(str::to_string)
        .collect();

    MatchCandidate {
        procedure_id: procedure.id,
        patient_name: procedure.patient_name.clone(),
        scheduled_start: procedure.scheduled_start,
        hospital_name,
        clinician_names,
    }
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

struct Run<'a> {
    store: &'a dyn ReconcileStore,
    tracker: &'a JobTracker,
    source: &'a dyn GuideSource,
    options: &'a RunOptions,
    cancel: &'a CancellationFlag,
    logger: &'a RunLogger,
    progress: Option<ProgressBar>,
    group_id: Uuid,
    job_id: Uuid,
    started: Instant,
    counters: JobCounters,
    report: RunReport,
}

impl<'a> Run<'a> {
    async fn execute(&mut self, credential: &str) -> Result<()> {
        self.enter(RunStep::ComputingWindow).await?;
        let window = self.compute_window().await?;
        self.report.window_start = Some(window.start);
        self.report.window_end = Some(window.end);
        self.logger.log_window(&window, self.options.full_rescan);

        self.enter(RunStep::Fetching).await?;
        let raw = self.source.fetch_guides(credential, &window).await?;
        let guides = self.prepare_guides(raw);
        self.check_cancelled()?;

        self.tracker
            .set_total(self.job_id, &mut self.counters, guides.len())
            .await?;
        if let Some(pb) = &self.progress {
            pb.set_length(guides.len() as u64);
            pb.set_message(RunStep::Classifying.description());
        }

        let mut state = self.load_state(&window, &guides).await?;

        let mut classified: HashSet<&str> = HashSet::with_capacity(guides.len());
        for guide in &guides {
            self.check_cancelled()?;
            self.classify(&mut state, guide).await?;
            classified.insert(guide.claim_id.as_str());
            self.counters.processed += 1;
            if let Some(pb) = &self.progress {
                pb.inc(1);
            }
            self.flush(&mut state, false).await?;
        }
        self.flush(&mut state, true).await?;

        self.report.unclassified_claim_ids = guides
            .iter()
            .filter(|g| !classified.contains(g.claim_id.as_str()))
            .map(|g| g.claim_id.clone())
            .collect();
        self.report.entities_created = state.resolver.created_counts().clone();

        self.enter(RunStep::Finalizing).await?;
        Ok(())
    }

    async fn enter(&mut self, step: RunStep) -> Result<()> {
        self.logger.log_phase(step.description(), None);
        if let Some(pb) = &self.progress {
            pb.set_message(step.description());
        }
        self.tracker.advance(self.job_id, &self.counters, step).await
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(ReconcileError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn compute_window(&self) -> Result<ReconciliationWindow> {
        let anchors = if self.options.full_rescan {
            WindowAnchors::default()
        } else {
            let last_completed_run = self
                .tracker
                .latest_completed(self.group_id)
                .await?
                .and_then(|job| job.completed_at)
                .map(|at| at.date());
            let pending = self
                .store
                .pending_claim_dates(self.group_id)
                .await
                .context("Failed to load pending claim dates")?;
            WindowAnchors {
                last_completed_run,
                oldest_pending_procedure: pending.oldest_procedure_date,
                oldest_pending_api_surgery: pending.oldest_api_surgery_date,
            }
        };
        Ok(compute_window(
            &anchors,
            self.options.epoch,
            self.options.safety_buffer_days,
            self.options.full_rescan,
            self.options.today,
        ))
    }

    /// Normalizes, de-duplicates (first occurrence wins), sorts newest first and applies
    /// the guide cap.
    fn prepare_guides(&mut self, raw: Vec<Value>) -> Vec<Guide> {
        self.report.guides_fetched = raw.len();
        let mut seen: HashSet<String> = HashSet::with_capacity(raw.len());
        let mut guides = Vec::with_capacity(raw.len());

        for record in &raw {
            let Some(guide) = normalize_guide(record) else {
                self.report.guides_without_claim_id += 1;
                continue;
            };
            if seen.insert(guide.claim_id.clone()) {
                guides.push(guide);
            } else {
                self.report.duplicate_claims += 1;
                self.logger.log_debug(&format!(
                    "Duplicate claim {} in fetch, keeping the first occurrence",
                    guide.claim_id
                ));
            }
        }
        if self.report.guides_without_claim_id > 0 {
            self.logger.log_warning(&format!(
                "{} guide records had no claim id and were dropped",
                self.report.guides_without_claim_id
            ));
        }

        sort_guides_newest_first(&mut guides);
        if let Some(cap) = self.options.max_guides {
            if guides.len() > cap {
                self.report.skipped_by_cap = guides.len() - cap;
                guides.truncate(cap);
            }
        }

        self.logger.log_fetch(
            self.report.guides_fetched,
            guides.len(),
            self.report.duplicate_claims,
            self.report.skipped_by_cap,
        );
        guides
    }

    async fn load_state(
        &self,
        window: &ReconciliationWindow,
        guides: &[Guide],
    ) -> Result<RunState> {
        let resolver = EntityResolver::load(self.store, self.group_id).await?;

        let since = candidate_floor(window, guides);
        let procedures = self
            .store
            .load_candidate_procedures(self.group_id, since)
            .await
            .context("Failed to load candidate procedures")?;
        self.logger.log_data_loaded(procedures.len(), "candidate procedures");

        let claim_ids: Vec<String> = guides.iter().map(|g| g.claim_id.clone()).collect();
        let records = self
            .store
            .load_billing_records(self.group_id, &claim_ids)
            .await
            .context("Failed to load billing records")?;
        self.logger.log_data_loaded(records.len(), "billing records with fetched claims");

        Ok(RunState::new(
            resolver,
            procedures,
            records,
            self.options.batch_size,
        ))
    }

    async fn classify(&mut self, state: &mut RunState, guide: &Guide) -> Result<()> {
        match state.records_by_claim.get(&guide.claim_id).cloned() {
            Some(indices) if !indices.is_empty() => {
                self.classify_existing(state, guide, &indices).await
            }
            _ => self.classify_new(state, guide).await,
        }
    }

    /// Refreshes every record already carrying the claim and links unlinked ones.
    async fn classify_existing(
        &mut self,
        state: &mut RunState,
        guide: &Guide,
        indices: &[usize],
    ) -> Result<()> {
        for &idx in indices {
            let mut changed = state.records[idx].refresh_from_guide(guide);

            let record = &state.records[idx];
            if record.charge_type.requires_procedure_link() && !record.is_linked() {
                if let Some(found) = find_best_match(guide, &state.candidates, MatchMode::Link) {
                    if !state.claim_linked_to(found.procedure_id, &guide.claim_id) {
                        self.enrich_procedure(state, found.index, guide).await?;
                        state.records[idx].procedure_id = Some(found.procedure_id);
                        self.counters.linked += 1;
                        changed = true;
                        debug!(
                            "Linked billing record {} (claim {}) to procedure {}",
                            state.records[idx].id, guide.claim_id, found.procedure_id
                        );
                    }
                }
            }

            if changed {
                self.counters.updated += 1;
                let id = state.records[idx].id;
                state.batches.record_updated_billing_record(id);
            }
        }
        Ok(())
    }

    async fn classify_new(&mut self, state: &mut RunState, guide: &Guide) -> Result<()> {
        let procedure_id = match find_best_match(guide, &state.candidates, MatchMode::Strict) {
            Some(found) => {
                self.enrich_procedure(state, found.index, guide).await?;
                self.counters.linked += 1;
                Some(found.procedure_id)
            }
            None => self.create_procedure(state, guide).await?,
        };

        if procedure_id.is_none() {
            self.report.unlinked_records_created += 1;
        }
        let record = BillingRecord::from_guide(self.group_id, procedure_id, guide);
        state.batches.record_new_billing_record(record.id);
        state.add_record(record);
        self.counters.created += 1;
        Ok(())
    }

    /// New procedure from the guide, if it carries a patient name and a surgery date.
    async fn create_procedure(
        &mut self,
        state: &mut RunState,
        guide: &Guide,
    ) -> Result<Option<Uuid>> {
        if guide.patient_name.is_none() || guide.surgery_date.is_none() {
            return Ok(None);
        }
        let refs = state
            .resolver
            .resolve_guide(self.store, guide, |_| true)
            .await?;
        let Some(procedure) = Procedure::from_guide(self.group_id, guide, &refs, now()) else {
            return Ok(None);
        };

        let id = procedure.id;
        state.batches.record_new_procedure(id);
        state.add_procedure(procedure);
        self.report.procedures_created += 1;
        Ok(Some(id))
    }

    /// Fills the matched procedure's blanks from the guide, resolving only the entity
    /// kinds it still lacks.
    async fn enrich_procedure(
        &mut self,
        state: &mut RunState,
        idx: usize,
        guide: &Guide,
    ) -> Result<()> {
        let needed: Vec<EntityKind> = EntityKind::ALL
            .into_iter()
            .filter(|kind| state.procedures[idx].needs(*kind))
            .collect();
        let refs = if needed.is_empty() {
            EntityRefs::default()
        } else {
            state
                .resolver
                .resolve_guide(self.store, guide, |kind| needed.contains(&kind))
                .await?
        };

        if state.procedures[idx].fill_from_guide(guide, &refs) {
            let id = state.procedures[idx].id;
            state.batches.record_updated_procedure(id);
            state.refresh_candidate(idx);
            self.report.procedures_updated += 1;
        }
        Ok(())
    }

    async fn flush(&mut self, state: &mut RunState, force: bool) -> Result<()> {
        for kind in state.batches.due(force) {
            let ids = state.batches.take(kind);
            if ids.is_empty() {
                continue;
            }
            self.write_batch(state, kind, &ids).await?;
            self.report.batches_flushed += 1;
            self.tracker
                .advance(self.job_id, &self.counters, RunStep::Batching)
                .await?;
            self.check_cancelled()?;
        }
        Ok(())
    }

    async fn write_batch(&mut self, state: &RunState, kind: BatchKind, ids: &[Uuid]) -> Result<()> {
        match kind {
            BatchKind::NewProcedures => {
                let rows = state.procedures_by_id(ids);
                self.store
                    .insert_procedures(&rows)
                    .await
                    .context("Failed to insert procedure batch")?;
                self.logger.log_batch(kind, rows.len(), 0);
            }
            BatchKind::UpdatedProcedures => {
                let rows = state.procedures_by_id(ids);
                self.store
                    .update_procedures(&rows)
                    .await
                    .context("Failed to update procedure batch")?;
                self.logger.log_batch(kind, rows.len(), 0);
            }
            BatchKind::NewBillingRecords => {
                let rows = state.records_by_id(ids);
                let outcome = self
                    .store
                    .insert_billing_records(&rows)
                    .await
                    .context("Failed to insert billing record batch")?;
                if outcome.merged > 0 {
                    warn!(
                        "{} billing rows collided on (procedure, claim) and were merged",
                        outcome.merged
                    );
                }
                self.report.billing_conflicts_merged += outcome.merged;
                self.logger.log_batch(kind, rows.len(), outcome.merged);
            }
            BatchKind::UpdatedBillingRecords => {
                let rows = state.records_by_id(ids);
                self.store
                    .update_billing_records(&rows)
                    .await
                    .context("Failed to update billing record batch")?;
                self.logger.log_batch(kind, rows.len(), 0);
            }
        }
        Ok(())
    }

    fn into_report(self) -> RunReport {
        if let Some(pb) = &self.progress {
            pb.finish_with_message(format!(
                "Done: {} created, {} updated, {} linked",
                self.counters.created, self.counters.updated, self.counters.linked
            ));
        }
        RunReport {
            counters: self.counters,
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            ..self.report
        }
    }
}

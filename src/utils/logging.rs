// src/utils/logging.rs - Logging helpers for reconciliation runs
use log::{debug, error, info, warn};
use std::time::Instant;

use crate::models::stats_models::RunReport;
use crate::reconciliation::batch::BatchKind;
use crate::reconciliation::window::ReconciliationWindow;

/// Prefixes every line of one tenant's run with the tenant name so concurrent runs stay
/// readable in a shared log.
#[derive(Clone)]
pub struct RunLogger {
    tenant: String,
    start_time: Instant,
}

impl RunLogger {
    pub fn new(tenant: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            start_time: Instant::now(),
        }
    }

    pub fn log_start(&self, job_id: &str, full_rescan: bool) {
        info!(
            "[{}] 🚀 Starting reconciliation (job ID: {}){}",
            self.tenant,
            job_id,
            if full_rescan { " with full rescan" } else { "" }
        );
    }

    pub fn log_phase(&self, phase: &str, details: Option<&str>) {
        let elapsed = self.start_time.elapsed();
        match details {
            Some(details) => info!(
                "[{}] 🔄 Phase: {} - {} [+{:.1}s]",
                self.tenant,
                phase,
                details,
                elapsed.as_secs_f32()
            ),
            None => info!(
                "[{}] 🔄 Phase: {} [+{:.1}s]",
                self.tenant,
                phase,
                elapsed.as_secs_f32()
            ),
        }
    }

    pub fn log_window(&self, window: &ReconciliationWindow, full_rescan: bool) {
        info!(
            "[{}] 📅 Window: {} → {}{}",
            self.tenant,
            window.start,
            window.end,
            if full_rescan { " (forced from epoch)" } else { "" }
        );
    }

    pub fn log_fetch(&self, fetched: usize, usable: usize, duplicates: usize, capped: usize) {
        info!(
            "[{}] 📥 Fetched {} guide records, {} usable",
            self.tenant, fetched, usable
        );
        if duplicates > 0 {
            warn!(
                "[{}] ⚠️  {} duplicate claim ids in this fetch (kept first occurrence)",
                self.tenant, duplicates
            );
        }
        if capped > 0 {
            info!(
                "[{}] ⏭️  Guide cap reached: {} older guides skipped this run",
                self.tenant, capped
            );
        }
    }

    pub fn log_data_loaded(&self, count: usize, data_type: &str) {
        info!(
            "[{}] 📊 Loaded {} {} from database",
            self.tenant, count, data_type
        );
    }

    pub fn log_batch(&self, kind: BatchKind, rows: usize, merged: usize) {
        if merged > 0 {
            info!(
                "[{}] 📦 Flushed {} {} ({} merged into existing rows)",
                self.tenant,
                rows,
                kind.label(),
                merged
            );
        } else {
            info!("[{}] 📦 Flushed {} {}", self.tenant, rows, kind.label());
        }
    }

    pub fn log_completion(&self, report: &RunReport) {
        let duration = self.start_time.elapsed();
        let c = &report.counters;
        info!(
            "[{}] 🎉 COMPLETED in {:.2?}: {}/{} guides processed",
            self.tenant, duration, c.processed, c.total_items
        );
        info!(
            "[{}] 📊 Results: {} created, {} updated, {} linked, {} procedures created, {} procedures enriched",
            self.tenant,
            c.created,
            c.updated,
            c.linked,
            report.procedures_created,
            report.procedures_updated
        );
        if report.total_entities_created() > 0 {
            info!(
                "[{}] 🏷️  {} new named entities created",
                self.tenant,
                report.total_entities_created()
            );
        }
        if report.unlinked_records_created > 0 {
            warn!(
                "[{}] ⚠️  {} billing records created without a procedure (missing patient or date)",
                self.tenant, report.unlinked_records_created
            );
        }
        if !report.unclassified_claim_ids.is_empty() {
            warn!(
                "[{}] ⚠️  {} fetched claims were never classified: {:?}",
                self.tenant,
                report.unclassified_claim_ids.len(),
                report.unclassified_claim_ids
            );
        }
    }

    pub fn log_warning(&self, message: &str) {
        warn!("[{}] ⚠️  {}", self.tenant, message);
    }

    pub fn log_error(&self, message: &str) {
        error!("[{}] ❌ {}", self.tenant, message);
    }

    pub fn log_debug(&self, message: &str) {
        debug!("[{}] {}", self.tenant, message);
    }
}

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use futures::future::join_all;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use reconcile_lib::guides::BillingApiClient;
use reconcile_lib::jobs::JobTracker;
use reconcile_lib::reconciliation::{CancellationFlag, Reconciler, RunOptions};
use reconcile_lib::store::PgStore;
use reconcile_lib::utils::config::{clamp_batch_size, ReconcileConfig};
use reconcile_lib::utils::db_connect::{connect, get_pool_status};
use reconcile_lib::utils::env::load_env;
use reconcile_lib::utils::get_memory_usage;
use reconcile_lib::utils::progress_config::{tenant_progress_bar, ProgressConfig};
use reconcile_lib::ReconcileError;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct ReconcileArgs {
    /// Tenant (group) ids to reconcile; each runs concurrently with the others
    #[arg(long = "group", required = true, num_args = 1..)]
    groups: Vec<Uuid>,

    /// Ignore the incremental window and fetch everything since the epoch
    #[arg(long)]
    full_rescan: bool,

    /// Only classify the newest N guides per tenant
    #[arg(long)]
    max_guides: Option<usize>,

    /// Rows per write batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Create the reconciliation schema before running
    #[arg(long)]
    init_schema: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging and environment
    env_logger::init();
    info!("Starting guide reconciliation");
    load_env();
    let args = ReconcileArgs::parse();

    let mut config =
        ReconcileConfig::from_env().context("Failed to load reconciliation configuration")?;
    if let Some(cap) = args.max_guides {
        config.max_guides = Some(cap);
    }
    if let Some(size) = args.batch_size {
        config.batch_size = clamp_batch_size(size);
        if config.batch_size != size {
            warn!("--batch-size {} adjusted to {}", size, config.batch_size);
        }
    }
    config.log_config();

    let progress_config = ProgressConfig::from_env();
    info!(
        "Progress tracking: enabled={}, show_memory={}",
        progress_config.enabled, progress_config.show_memory
    );
    let multi_progress = progress_config.create_multi_progress();

    let pool_size = u32::try_from(args.groups.len() + 2).unwrap_or(u32::MAX).max(4);
    let pool = connect("guide_reconciliation", pool_size)
        .await
        .context("Failed to connect to database")?;
    info!("Successfully connected to the database");

    let store = Arc::new(PgStore::new(pool.clone()));
    if args.init_schema {
        store
            .ensure_schema()
            .await
            .context("Failed to initialize schema")?;
    }

    let client = BillingApiClient::new(&config.api_url, config.api_timeout, &config.status_filter)
        .context("Failed to build billing API client")?;
    let tracker = JobTracker::new(store.clone());

    let mut options = RunOptions::from_config(&config, Utc::now().date_naive());
    options.full_rescan = args.full_rescan;

    let cancel = CancellationFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received; runs stop after the current guide or batch");
                cancel.cancel();
            }
        });
    }

    let reconciler = Reconciler::new(store.clone(), tracker, Arc::new(client), options)
        .with_cancellation(cancel);

    let start = Instant::now();
    let runs = args.groups.iter().map(|group_id| {
        let label: String = group_id.to_string().chars().take(8).collect();
        let pb = multi_progress
            .as_ref()
            .map(|mp| tenant_progress_bar(mp, &label));
        let reconciler = &reconciler;
        async move { (*group_id, reconciler.run(*group_id, pb).await) }
    });
    let results = join_all(runs).await;

    let mut succeeded = 0;
    let mut failed = 0;
    for (group_id, result) in &results {
        match result {
            Ok(report) => {
                succeeded += 1;
                info!(
                    "✅ Group {}: {}/{} guides, {} created, {} updated, {} linked in {:.1}s",
                    group_id,
                    report.counters.processed,
                    report.counters.total_items,
                    report.counters.created,
                    report.counters.updated,
                    report.counters.linked,
                    report.elapsed_secs
                );
            }
            Err(e) if e.is_configuration() || matches!(e, ReconcileError::AlreadyRunning { .. }) => {
                warn!("⏭️  Group {} skipped: {}", group_id, e);
            }
            Err(e) => {
                failed += 1;
                error!("❌ Group {} failed: {}", group_id, e);
            }
        }
    }

    let (connections, idle) = get_pool_status(&pool);
    info!("DB pool at shutdown: {} connections, {} idle", connections, idle);
    if progress_config.should_show_memory() {
        info!("Memory usage: {} MB", get_memory_usage().await);
    }
    info!(
        "Reconciliation finished in {:.2?}: {} succeeded, {} failed, {} skipped",
        start.elapsed(),
        succeeded,
        failed,
        results.len() - succeeded - failed
    );

    if failed > 0 {
        bail!("{} tenant run(s) failed", failed);
    }
    Ok(())
}

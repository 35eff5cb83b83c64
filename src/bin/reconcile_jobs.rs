// src/bin/reconcile_jobs.rs
//
// Monitoring and manual recovery for reconciliation jobs.
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::sync::Arc;
use uuid::Uuid;

use reconcile_lib::jobs::JobTracker;
use reconcile_lib::models::job::JobSummary;
use reconcile_lib::store::PgStore;
use reconcile_lib::utils::db_connect::connect;
use reconcile_lib::utils::env::load_env;

#[derive(Parser)]
#[command(author, version, about = "Inspect and reset reconciliation jobs", long_about = None)]
struct JobsArgs {
    #[command(subcommand)]
    command: JobsCommand,
}

#[derive(Subcommand)]
enum JobsCommand {
    /// List recent jobs, newest first
    List {
        /// Only tenants whose name contains this text (case-insensitive)
        #[arg(long)]
        tenant: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Print the jobs as JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Force a stuck pending or running job to failed
    Reset { job_id: Uuid },
    /// Force every running job to failed, optionally for one tenant only
    ResetRunning {
        #[arg(long)]
        group: Option<Uuid>,
    },
}

fn print_jobs(jobs: &[JobSummary]) {
    if jobs.is_empty() {
        println!("No reconciliation jobs found.");
        return;
    }
    println!(
        "{:<36}  {:<24}  {:<11}  {:<19}  {:>11}  {}",
        "JOB", "TENANT", "STATUS", "STARTED", "PROGRESS", "STEP / ERROR"
    );
    for summary in jobs {
        let job = &summary.job;
        let detail = job
            .error_message
            .as_deref()
            .or(job.current_step.as_deref())
            .unwrap_or("-");
        let tenant: String = summary.tenant_name.chars().take(24).collect();
        println!(
            "{:<36}  {:<24}  {} {:<8}  {:<19}  {:>11}  {}",
            job.id,
            tenant,
            job.status.emoji(),
            job.status,
            job.started_at.format("%Y-%m-%d %H:%M:%S"),
            job.progress_label(),
            detail
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    load_env();
    let args = JobsArgs::parse();

    let pool = connect("guide_reconciliation_jobs", 2)
        .await
        .context("Failed to connect to database")?;
    let tracker = JobTracker::new(Arc::new(PgStore::new(pool)));

    match args.command {
        JobsCommand::List {
            tenant,
            limit,
            json,
        } => {
            let jobs = tracker
                .list_recent(tenant.as_deref(), limit)
                .await
                .context("Failed to list jobs")?;
            if json {
                let rendered =
                    serde_json::to_string_pretty(&jobs).context("Failed to serialize jobs")?;
                println!("{}", rendered);
            } else {
                print_jobs(&jobs);
            }
        }
        JobsCommand::Reset { job_id } => {
            if tracker.reset(job_id).await.context("Failed to reset job")? {
                println!("Job {} reset to failed.", job_id);
            } else {
                println!("Job {} is not pending or running; nothing to reset.", job_id);
            }
        }
        JobsCommand::ResetRunning { group } => {
            let count = tracker
                .reset_running(group)
                .await
                .context("Failed to reset running jobs")?;
            match group {
                Some(group_id) => info!("Scoped reset to group {}", group_id),
                None => info!("Global reset across all tenants"),
            }
            println!("{} running job(s) reset to failed.", count);
        }
    }
    Ok(())
}

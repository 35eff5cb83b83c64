// src/utils/config.rs
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use log::{info, warn};
use std::env;
use std::time::Duration;

pub const DEFAULT_API_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_STATUS_FILTER: &str = "todos";
pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_SAFETY_BUFFER_DAYS: i64 = 7;

/// PostgreSQL binds at most 65535 parameters per statement and a billing row binds 15.
pub const MAX_BATCH_SIZE: usize = 65535 / 15;

pub fn clamp_batch_size(size: usize) -> usize {
    size.clamp(1, MAX_BATCH_SIZE)
}

pub fn default_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or(NaiveDate::MIN)
}

/// Settings for the reconcile binary. CLI flags override these after loading.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileConfig {
    pub api_url: String,
    pub api_timeout: Duration,
    pub status_filter: String,
    pub batch_size: usize,
    pub max_guides: Option<usize>,
    pub epoch: NaiveDate,
    pub safety_buffer_days: i64,
}

impl ReconcileConfig {
    pub fn from_env() -> Result<Self> {
        let api_url = env::var("BILLING_API_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow!("BILLING_API_URL must be set"))?;

        let api_timeout_secs: u64 = env::var("BILLING_API_TIMEOUT_SECS")
            .unwrap_or_else(|_| DEFAULT_API_TIMEOUT_SECS.to_string())
            .parse()
            .unwrap_or(DEFAULT_API_TIMEOUT_SECS);

        let requested_batch_size = env::var("RECONCILE_BATCH_SIZE")
            .unwrap_or_else(|_| DEFAULT_BATCH_SIZE.to_string())
            .parse::<usize>()
            .unwrap_or(DEFAULT_BATCH_SIZE);
        let batch_size = clamp_batch_size(requested_batch_size);
        if batch_size < requested_batch_size {
            warn!(
                "RECONCILE_BATCH_SIZE {} exceeds the statement parameter limit, using {}",
                requested_batch_size, batch_size
            );
        }

        let max_guides = match env::var("RECONCILE_MAX_GUIDES") {
            Ok(raw) if !raw.trim().is_empty() => Some(
                raw.trim()
                    .parse::<usize>()
                    .with_context(|| format!("Invalid RECONCILE_MAX_GUIDES '{}'", raw))?,
            ),
            _ => None,
        };

        let epoch = match env::var("RECONCILE_EPOCH") {
            Ok(raw) if !raw.trim().is_empty() => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                .with_context(|| format!("Invalid RECONCILE_EPOCH '{}', expected YYYY-MM-DD", raw))?,
            _ => default_epoch(),
        };

        Ok(Self {
            api_url,
            api_timeout: Duration::from_secs(api_timeout_secs),
            status_filter: env::var("BILLING_API_STATUS_FILTER")
                .unwrap_or_else(|_| DEFAULT_STATUS_FILTER.to_string()),
            batch_size,
            max_guides,
            epoch,
            safety_buffer_days: env::var("RECONCILE_SAFETY_BUFFER_DAYS")
                .unwrap_or_else(|_| DEFAULT_SAFETY_BUFFER_DAYS.to_string())
                .parse()
                .unwrap_or(DEFAULT_SAFETY_BUFFER_DAYS),
        })
    }

    pub fn log_config(&self) {
        info!("⚙️  Reconciliation configuration:");
        info!("   • Billing API timeout: {}s", self.api_timeout.as_secs());
        info!("   • Status filter: {}", self.status_filter);
        info!("   • Batch size: {}", self.batch_size);
        match self.max_guides {
            Some(cap) => info!("   • Guide cap: newest {} per run", cap),
            None => info!("   • Guide cap: none"),
        }
        info!(
            "   • Window epoch: {}, safety buffer: {} days",
            self.epoch, self.safety_buffer_days
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 7] = [
        "BILLING_API_URL",
        "BILLING_API_TIMEOUT_SECS",
        "BILLING_API_STATUS_FILTER",
        "RECONCILE_BATCH_SIZE",
        "RECONCILE_MAX_GUIDES",
        "RECONCILE_EPOCH",
        "RECONCILE_SAFETY_BUFFER_DAYS",
    ];

    #[test]
    fn test_clamp_batch_size() {
        assert_eq!(clamp_batch_size(0), 1);
        assert_eq!(clamp_batch_size(500), 500);
        assert_eq!(clamp_batch_size(5000), MAX_BATCH_SIZE);
        assert!(MAX_BATCH_SIZE * 15 <= 65535);
    }

    // One test touches the environment so parallel test threads never race on it.
    #[test]
    fn test_env_config() {
        for var in VARS {
            env::remove_var(var);
        }
        assert!(ReconcileConfig::from_env().is_err());

        env::set_var("BILLING_API_URL", "https://billing.example.org/guias");
        let config = ReconcileConfig::from_env().unwrap();
        assert_eq!(config.api_timeout, Duration::from_secs(60));
        assert_eq!(config.status_filter, "todos");
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.max_guides, None);
        assert_eq!(config.epoch, default_epoch());
        assert_eq!(config.safety_buffer_days, 7);

        env::set_var("BILLING_API_TIMEOUT_SECS", "15");
        env::set_var("RECONCILE_BATCH_SIZE", "0");
        env::set_var("RECONCILE_MAX_GUIDES", "250");
        env::set_var("RECONCILE_EPOCH", "2023-07-01");
        env::set_var("RECONCILE_SAFETY_BUFFER_DAYS", "3");
        let config = ReconcileConfig::from_env().unwrap();
        assert_eq!(config.api_timeout, Duration::from_secs(15));
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_guides, Some(250));
        assert_eq!(config.epoch, NaiveDate::from_ymd_opt(2023, 7, 1).unwrap());
        assert_eq!(config.safety_buffer_days, 3);

        env::set_var("RECONCILE_BATCH_SIZE", "5000");
        let config = ReconcileConfig::from_env().unwrap();
        assert_eq!(config.batch_size, MAX_BATCH_SIZE);

        env::set_var("RECONCILE_EPOCH", "01/07/2023");
        assert!(ReconcileConfig::from_env().is_err());

        // Clean up
        for var in VARS {
            env::remove_var(var);
        }
    }
}

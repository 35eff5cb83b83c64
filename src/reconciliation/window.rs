// src/reconciliation/window.rs
use chrono::{Duration, NaiveDate};

/// Inclusive date range of guides requested from the billing API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconciliationWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Dates that pull the window start backwards. Any of them may be unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowAnchors {
    pub last_completed_run: Option<NaiveDate>,
    /// Oldest procedure date among billing records still pending at the payer.
    pub oldest_pending_procedure: Option<NaiveDate>,
    /// Oldest API surgery date among billing records still pending at the payer.
    pub oldest_pending_api_surgery: Option<NaiveDate>,
}

pub fn compute_window_start(
    anchors: &WindowAnchors,
    epoch: NaiveDate,
    buffer_days: i64,
    full_rescan: bool,
) -> NaiveDate {
    if full_rescan {
        return epoch;
    }
    let buffer = Duration::days(buffer_days);
    [
        anchors.last_completed_run,
        anchors.oldest_pending_procedure,
        anchors.oldest_pending_api_surgery,
    ]
    .into_iter()
    .flatten()
    .map(|anchor| anchor - buffer)
    .min()
    .map_or(epoch, |earliest| earliest.max(epoch))
}

/// Window ending `today`. The start never passes the end.
pub fn compute_window(
    anchors: &WindowAnchors,
    epoch: NaiveDate,
    buffer_days: i64,
    full_rescan: bool,
    today: NaiveDate,
) -> ReconciliationWindow {
    let start = compute_window_start(anchors, epoch, buffer_days, full_rescan);
    ReconciliationWindow {
        start: start.min(today),
        end: today,
    }
}

// src/matching/procedure.rs
//
// Decides whether a guide corresponds to a procedure the tenant already has. Each factor is
// scored only when both sides carry the datum; the final score is the weighted average over
// the factors that were admitted, so missing data neither helps nor hurts.

use chrono::{NaiveDateTime, NaiveTime, Timelike};
use log::debug;
use uuid::Uuid;

use crate::matching::similarity::similarity;
use crate::models::core::midnight;
use crate::models::guide::Guide;

pub const PATIENT_NAME_WEIGHT: f64 = 0.40;
pub const MIN_PATIENT_NAME_SIMILARITY: f64 = 0.8;

pub const DATE_WEIGHT: f64 = 0.25;
pub const MAX_DAY_DIFFERENCE: i64 = 1;
const SAME_DAY_SCORE: f64 = 1.0;
const ADJACENT_DAY_SCORE: f64 = 0.7;

pub const TIME_WEIGHT: f64 = 0.15;
pub const MAX_TIME_DIFFERENCE_MINUTES: i64 = 240;
const CLOSE_TIME_MINUTES: i64 = 30;
const EXACT_TIME_SCORE: f64 = 1.0;
const CLOSE_TIME_SCORE: f64 = 0.8;
const LOOSE_TIME_SCORE: f64 = 0.5;

pub const HOSPITAL_WEIGHT: f64 = 0.10;
pub const MIN_HOSPITAL_SIMILARITY: f64 = 0.7;

pub const CLINICIAN_WEIGHT: f64 = 0.10;
pub const MIN_CLINICIAN_SIMILARITY: f64 = 0.8;

/// A candidate is accepted only strictly above this score.
pub const MIN_MATCH_SCORE: f64 = 0.85;

const MINUTES_PER_DAY: i64 = 24 * 60;

/// What the matcher needs to know about a stored procedure, with references already
/// resolved to names.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    pub procedure_id: Uuid,
    pub patient_name: String,
    pub scheduled_start: NaiveDateTime,
    pub hospital_name: Option<String>,
    /// Responsible anesthesiologists plus the cooperating clinician.
    pub clinician_names: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Lighter check used to link an existing, unlinked billing record.
    Link,
    /// Whole-record check used before attaching a brand new claim to an existing surgery:
    /// the date must be known, and hospital or clinician data present on both sides must agree.
    Strict,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreBreakdown {
    pub patient_name: f64,
    pub date: Option<f64>,
    pub time: Option<f64>,
    pub hospital: Option<f64>,
    pub clinician: Option<f64>,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureMatch {
    pub index: usize,
    pub procedure_id: Uuid,
    pub score: f64,
}

/// Scores one candidate, or returns `None` if any hard gate rejects it.
pub fn score_candidate(
    guide: &Guide,
    candidate: &MatchCandidate,
    mode: MatchMode,
) -> Option<ScoreBreakdown> {
    // Patient name is mandatory and never overridden by other factors.
    let guide_patient = guide.patient_name.as_deref()?;
    let name_score = similarity(guide_patient, &candidate.patient_name);
    if name_score < MIN_PATIENT_NAME_SIMILARITY {
        return None;
    }

    let mut breakdown = ScoreBreakdown {
        patient_name: name_score,
        ..ScoreBreakdown::default()
    };
    let mut weighted_sum = PATIENT_NAME_WEIGHT * name_score;
    let mut weight_total = PATIENT_NAME_WEIGHT;

    match guide.surgery_date {
        Some(date) => {
            let day_diff = (date - candidate.scheduled_start.date()).num_days().abs();
            if day_diff > MAX_DAY_DIFFERENCE {
                return None;
            }
            let date_score = if day_diff == 0 {
                SAME_DAY_SCORE
            } else {
                ADJACENT_DAY_SCORE
            };
            breakdown.date = Some(date_score);
            weighted_sum += DATE_WEIGHT * date_score;
            weight_total += DATE_WEIGHT;
        }
        None if mode == MatchMode::Strict => return None,
        None => {}
    }

    let stored_time = candidate.scheduled_start.time();
    if let Some(guide_time) = guide.start_time {
        if stored_time != midnight() {
            let minutes = minutes_between(guide_time, stored_time);
            if minutes > MAX_TIME_DIFFERENCE_MINUTES {
                return None;
            }
            let time_score = if minutes == 0 {
                EXACT_TIME_SCORE
            } else if minutes <= CLOSE_TIME_MINUTES {
                CLOSE_TIME_SCORE
            } else {
                LOOSE_TIME_SCORE
            };
            breakdown.time = Some(time_score);
            weighted_sum += TIME_WEIGHT * time_score;
            weight_total += TIME_WEIGHT;
        }
    }

    if let (Some(guide_hospital), Some(stored_hospital)) =
        (guide.hospital_name.as_deref(), candidate.hospital_name.as_deref())
    {
        let hospital_score = similarity(guide_hospital, stored_hospital);
        if hospital_score > MIN_HOSPITAL_SIMILARITY {
            breakdown.hospital = Some(hospital_score);
            weighted_sum += HOSPITAL_WEIGHT * hospital_score;
            weight_total += HOSPITAL_WEIGHT;
        } else if mode == MatchMode::Strict {
            return None;
        }
    }

    if let Some(guide_clinician) = guide.cooperating_clinician_name.as_deref() {
        if !candidate.clinician_names.is_empty() {
            let best = candidate
                .clinician_names
                .iter()
                .map(|name| similarity(guide_clinician, name))
                .fold(0.0_f64, f64::max);
            if best > MIN_CLINICIAN_SIMILARITY {
                breakdown.clinician = Some(best);
                weighted_sum += CLINICIAN_WEIGHT * best;
                weight_total += CLINICIAN_WEIGHT;
            } else if mode == MatchMode::Strict {
                return None;
            }
        }
    }

    breakdown.score = weighted_sum / weight_total;
    Some(breakdown)
}

/// Returns the best candidate scoring strictly above `MIN_MATCH_SCORE`.
///
/// Ties keep the first candidate seen; callers keep candidates ordered by creation time so
/// the earliest-created procedure wins.
pub fn find_best_match(
    guide: &Guide,
    candidates: &[MatchCandidate],
    mode: MatchMode,
) -> Option<ProcedureMatch> {
    let mut best: Option<ProcedureMatch> = None;

    for (index, candidate) in candidates.iter().enumerate() {
        let Some(breakdown) = score_candidate(guide, candidate, mode) else {
            continue;
        };
        if breakdown.score <= MIN_MATCH_SCORE {
            continue;
        }
        let is_better = best
            .as_ref()
            .map_or(true, |current| breakdown.score > current.score);
        if is_better {
            best = Some(ProcedureMatch {
                index,
                procedure_id: candidate.procedure_id,
                score: breakdown.score,
            });
        }
    }

    if let Some(found) = &best {
        debug!(
            "[{:?}] Guide {} matched procedure {} with score {:.3}",
            mode, guide.claim_id, found.procedure_id, found.score
        );
    }
    best
}

/// Time-of-day distance in minutes, wrapping around midnight.
fn minutes_between(a: NaiveTime, b: NaiveTime) -> i64 {
    let a = i64::from(a.num_seconds_from_midnight() / 60);
    let b = i64::from(b.num_seconds_from_midnight() / 60);
    let diff = (a - b).abs();
    diff.min(MINUTES_PER_DAY - diff)
}

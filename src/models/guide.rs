// src/models/guide.rs
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;

use crate::models::core::{midnight, PaymentStatus};

/// One external billing record ("guia") for a single surgery episode, already normalized.
/// Lives only for the duration of one reconciliation run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Guide {
    pub claim_id: String,
    pub patient_name: Option<String>,
    pub patient_national_id: Option<String>,
    pub patient_birth_date: Option<NaiveDate>,
    pub surgery_date: Option<NaiveDate>,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub surgeon_name: Option<String>,
    pub surgeon_license: Option<String>,
    pub hospital_name: Option<String>,
    pub cooperating_clinician_name: Option<String>,
    pub accommodation: Option<String>,
    pub procedure_code: Option<String>,
    pub procedure_description: Option<String>,
    pub billed_amount: Option<Decimal>,
    pub received_amount: Option<Decimal>,
    pub recovered_amount: Option<Decimal>,
    pub accepted_amount: Option<Decimal>,
    pub payment_date: Option<NaiveDate>,
    pub raw_status: Option<String>,
    pub status: PaymentStatus,
    pub classification: Option<String>,
}

impl Guide {
    /// Sort key used to process the most recent claims first.
    pub fn recency_key(&self) -> NaiveDateTime {
        self.surgery_date
            .unwrap_or(NaiveDate::MIN)
            .and_time(self.start_time.unwrap_or_else(midnight))
    }

    /// Name used to resolve the principal procedure: the catalog description, falling back to
    /// the code when the API sent no description.
    pub fn procedure_name(&self) -> Option<&str> {
        self.procedure_description
            .as_deref()
            .or(self.procedure_code.as_deref())
    }
}

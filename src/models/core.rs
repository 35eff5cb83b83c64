// src/models/core.rs
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use std::fmt;
use uuid::Uuid;

use crate::models::guide::Guide;

/// A tenant ("group"). Every other entity is scoped to exactly one.
#[derive(Debug, Clone)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub api_credential: Option<String>,
}

impl Tenant {
    /// The credential, if one is configured and not blank.
    pub fn credential(&self) -> Option<&str> {
        self.api_credential
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PaymentStatus {
    #[default]
    Processing,
    AwaitingPayment,
    UnderAppeal,
    Finalized,
    Cancelled,
}

impl PaymentStatus {
    pub const PENDING: [PaymentStatus; 3] = [
        PaymentStatus::Processing,
        PaymentStatus::AwaitingPayment,
        PaymentStatus::UnderAppeal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Processing => "processing",
            PaymentStatus::AwaitingPayment => "awaiting_payment",
            PaymentStatus::UnderAppeal => "under_appeal",
            PaymentStatus::Finalized => "finalized",
            PaymentStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "processing" => Some(PaymentStatus::Processing),
            "awaiting_payment" => Some(PaymentStatus::AwaitingPayment),
            "under_appeal" => Some(PaymentStatus::UnderAppeal),
            "finalized" => Some(PaymentStatus::Finalized),
            "cancelled" => Some(PaymentStatus::Cancelled),
            _ => None,
        }
    }

    /// Claims still "in flight" at the payer; these drive the reconciliation window.
    pub fn is_pending(&self) -> bool {
        Self::PENDING.contains(self)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChargeType {
    /// Billed through the cooperative's insurance channel, i.e. the guides API.
    Cooperative,
    Hospital,
    Private,
}

impl ChargeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeType::Cooperative => "cooperative",
            ChargeType::Hospital => "hospital",
            ChargeType::Private => "private",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "cooperative" => Some(ChargeType::Cooperative),
            "hospital" => Some(ChargeType::Hospital),
            "private" => Some(ChargeType::Private),
            _ => None,
        }
    }

    pub fn requires_procedure_link(&self) -> bool {
        matches!(self, ChargeType::Cooperative)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClinicType {
    Elective,
    Shift,
    Unspecified,
}

impl ClinicType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClinicType::Elective => "elective",
            ClinicType::Shift => "shift",
            ClinicType::Unspecified => "unspecified",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "elective" => ClinicType::Elective,
            "shift" => ClinicType::Shift,
            _ => ClinicType::Unspecified,
        }
    }

    /// Maps the API's free-text `classificacao` tag ("Plantão", "Eletiva", "Urgência", ...).
    pub fn from_classification(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return ClinicType::Unspecified;
        };
        let lowered = raw.trim().to_lowercase();
        if lowered.contains("plant") || lowered.contains("urg") {
            ClinicType::Shift
        } else if lowered.contains("elet") || lowered.contains("elect") {
            ClinicType::Elective
        } else {
            ClinicType::Unspecified
        }
    }
}

/// The catalog-like entities a guide refers to by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Surgeon,
    Hospital,
    Anesthesiologist,
    ProcedureDetail,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Surgeon,
        EntityKind::Hospital,
        EntityKind::Anesthesiologist,
        EntityKind::ProcedureDetail,
    ];

    pub fn table_name(&self) -> &'static str {
        match self {
            EntityKind::Surgeon => "reconciliation.surgeon",
            EntityKind::Hospital => "reconciliation.hospital",
            EntityKind::Anesthesiologist => "reconciliation.anesthesiologist",
            EntityKind::ProcedureDetail => "reconciliation.procedure_detail",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EntityKind::Surgeon => "surgeon",
            EntityKind::Hospital => "hospital",
            EntityKind::Anesthesiologist => "anesthesiologist",
            EntityKind::ProcedureDetail => "procedure detail",
        }
    }
}

/// Uniform shape for surgeons, hospitals, anesthesiologists and catalog procedures.
/// `secondary_key` is the CRM license for surgeons and the catalog code for procedure details.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedEntity {
    pub id: Uuid,
    pub group_id: Uuid,
    pub kind: EntityKind,
    pub name: String,
    pub secondary_key: Option<String>,
}

/// Entity references resolved for one guide.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityRefs {
    pub surgeon: Option<Uuid>,
    pub hospital: Option<Uuid>,
    pub cooperating_clinician: Option<Uuid>,
    pub principal_procedure: Option<Uuid>,
}

pub fn midnight() -> NaiveTime {
    NaiveTime::MIN
}

#[derive(Debug, Clone, PartialEq)]
pub struct Procedure {
    pub id: Uuid,
    pub group_id: Uuid,
    pub patient_name: String,
    pub patient_birth_date: Option<NaiveDate>,
    pub patient_national_id: Option<String>,
    pub scheduled_start: NaiveDateTime,
    pub scheduled_end: Option<NaiveDateTime>,
    pub surgeon_id: Option<Uuid>,
    pub hospital_id: Option<Uuid>,
    pub cooperating_clinician_id: Option<Uuid>,
    pub responsible_clinician_ids: Vec<Uuid>,
    pub principal_procedure_id: Option<Uuid>,
    pub clinic_type: ClinicType,
    pub accommodation: Option<String>,
    pub created_at: NaiveDateTime,
}

impl Procedure {
    /// Builds a new procedure from a guide. Requires a patient name and a surgery date;
    /// without both there is nothing clinical to anchor the procedure on.
    pub fn from_guide(
        group_id: Uuid,
        guide: &Guide,
        refs: &EntityRefs,
        now: NaiveDateTime,
    ) -> Option<Self> {
        let patient_name = guide.patient_name.clone()?;
        let date = guide.surgery_date?;
        let scheduled_start = date.and_time(guide.start_time.unwrap_or_else(midnight));
        let scheduled_end = guide
            .end_time
            .map(|end| end_after_start(scheduled_start, end));

        Some(Self {
            id: Uuid::new_v4(),
            group_id,
            patient_name,
            patient_birth_date: guide.patient_birth_date,
            patient_national_id: guide.patient_national_id.clone(),
            scheduled_start,
            scheduled_end,
            surgeon_id: refs.surgeon,
            hospital_id: refs.hospital,
            cooperating_clinician_id: refs.cooperating_clinician,
            responsible_clinician_ids: refs.cooperating_clinician.into_iter().collect(),
            principal_procedure_id: refs.principal_procedure,
            clinic_type: ClinicType::from_classification(guide.classification.as_deref()),
            accommodation: guide.accommodation.clone(),
            created_at: now,
        })
    }

    pub fn has_default_time(&self) -> bool {
        self.scheduled_start.time() == midnight()
    }

    /// Whether the reference of `kind` is still blank and worth resolving.
    pub fn needs(&self, kind: EntityKind) -> bool {
        match kind {
            EntityKind::Surgeon => self.surgeon_id.is_none(),
            EntityKind::Hospital => self.hospital_id.is_none(),
            EntityKind::Anesthesiologist => {
                self.cooperating_clinician_id.is_none() || self.responsible_clinician_ids.is_empty()
            }
            EntityKind::ProcedureDetail => self.principal_procedure_id.is_none(),
        }
    }

    /// Fills blank fields from the guide. Populated fields are never overwritten, except the
    /// start time when it still holds the midnight default. Returns true if anything changed.
    pub fn fill_from_guide(&mut self, guide: &Guide, refs: &EntityRefs) -> bool {
        let mut changed = false;
        changed |= fill_blank(&mut self.patient_national_id, guide.patient_national_id.clone());
        changed |= fill_blank(&mut self.patient_birth_date, guide.patient_birth_date);
        changed |= fill_blank(&mut self.surgeon_id, refs.surgeon);
        changed |= fill_blank(&mut self.hospital_id, refs.hospital);
        changed |= fill_blank(&mut self.cooperating_clinician_id, refs.cooperating_clinician);
        changed |= fill_blank(&mut self.principal_procedure_id, refs.principal_procedure);
        changed |= fill_blank(&mut self.accommodation, guide.accommodation.clone());

        if self.responsible_clinician_ids.is_empty() {
            if let Some(clinician) = refs.cooperating_clinician {
                self.responsible_clinician_ids.push(clinician);
                changed = true;
            }
        }

        if self.clinic_type == ClinicType::Unspecified {
            let classified = ClinicType::from_classification(guide.classification.as_deref());
            if classified != ClinicType::Unspecified {
                self.clinic_type = classified;
                changed = true;
            }
        }

        if self.has_default_time() {
            if let Some(start) = guide.start_time.filter(|t| *t != midnight()) {
                self.scheduled_start = self.scheduled_start.date().and_time(start);
                changed = true;
            }
        }

        if let Some(end) = guide.end_time {
            let end_is_default = self
                .scheduled_end
                .map_or(true, |stored| stored.time() == midnight());
            if end_is_default {
                let corrected = Some(end_after_start(self.scheduled_start, end));
                if corrected != self.scheduled_end {
                    self.scheduled_end = corrected;
                    changed = true;
                }
            }
        }

        changed
    }
}

/// End timestamp on the start's date, rolled to the next day when the end time is earlier.
fn end_after_start(start: NaiveDateTime, end: NaiveTime) -> NaiveDateTime {
    let same_day = start.date().and_time(end);
    if same_day < start {
        same_day + Duration::days(1)
    } else {
        same_day
    }
}

fn fill_blank<T>(slot: &mut Option<T>, value: Option<T>) -> bool {
    if slot.is_none() && value.is_some() {
        *slot = value;
        true
    } else {
        false
    }
}

fn refresh<T: PartialEq>(slot: &mut Option<T>, value: Option<T>) -> bool {
    match value {
        Some(v) if slot.as_ref() != Some(&v) => {
            *slot = Some(v);
            true
        }
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BillingRecord {
    pub id: Uuid,
    pub group_id: Uuid,
    pub procedure_id: Option<Uuid>,
    pub charge_type: ChargeType,
    pub billed_amount: Option<Decimal>,
    pub received_amount: Option<Decimal>,
    pub recovered_amount: Option<Decimal>,
    pub accepted_amount: Option<Decimal>,
    pub payment_status: PaymentStatus,
    pub payment_date: Option<NaiveDate>,
    pub claim_id: Option<String>,
    pub api_patient_name: Option<String>,
    pub api_surgery_date: Option<NaiveDate>,
    pub api_hospital_name: Option<String>,
    pub api_clinician_name: Option<String>,
}

impl BillingRecord {
    pub fn from_guide(group_id: Uuid, procedure_id: Option<Uuid>, guide: &Guide) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id,
            procedure_id,
            charge_type: ChargeType::Cooperative,
            billed_amount: guide.billed_amount,
            received_amount: guide.received_amount,
            recovered_amount: guide.recovered_amount,
            accepted_amount: guide.accepted_amount,
            payment_status: guide.status,
            payment_date: guide.payment_date,
            claim_id: Some(guide.claim_id.clone()),
            api_patient_name: guide.patient_name.clone(),
            api_surgery_date: guide.surgery_date,
            api_hospital_name: guide.hospital_name.clone(),
            api_clinician_name: guide.cooperating_clinician_name.clone(),
        }
    }

    /// Refreshes amounts, status, payment date and the raw snapshot from a newer guide.
    /// Absent guide values never erase stored ones, and the status only moves when the guide
    /// actually carried one. Returns true if anything changed.
    pub fn refresh_from_guide(&mut self, guide: &Guide) -> bool {
        let mut changed = false;
        changed |= refresh(&mut self.billed_amount, guide.billed_amount);
        changed |= refresh(&mut self.received_amount, guide.received_amount);
        changed |= refresh(&mut self.recovered_amount, guide.recovered_amount);
        changed |= refresh(&mut self.accepted_amount, guide.accepted_amount);
        changed |= refresh(&mut self.payment_date, guide.payment_date);
        changed |= refresh(&mut self.api_patient_name, guide.patient_name.clone());
        changed |= refresh(&mut self.api_surgery_date, guide.surgery_date);
        changed |= refresh(&mut self.api_hospital_name, guide.hospital_name.clone());
        changed |= refresh(
            &mut self.api_clinician_name,
            guide.cooperating_clinician_name.clone(),
        );

        if guide.raw_status.is_some() && self.payment_status != guide.status {
            self.payment_status = guide.status;
            changed = true;
        }
        changed
    }

    pub fn is_linked(&self) -> bool {
        self.procedure_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn guide() -> Guide {
        Guide {
            claim_id: "CPSA-1".to_string(),
            patient_name: Some("Maria Silva".to_string()),
            surgery_date: NaiveDate::from_ymd_opt(2025, 3, 10),
            start_time: NaiveTime::from_hms_opt(8, 0, 0),
            end_time: NaiveTime::from_hms_opt(10, 30, 0),
            hospital_name: Some("Hospital Santa Clara".to_string()),
            billed_amount: Decimal::from_str("1500.00").ok(),
            raw_status: Some("Processo Finalizado".to_string()),
            status: PaymentStatus::Finalized,
            classification: Some("Eletiva".to_string()),
            ..Guide::default()
        }
    }

    #[test]
    fn test_procedure_from_guide_requires_name_and_date() {
        let now = NaiveDate::from_ymd_opt(2025, 3, 11).unwrap().and_time(midnight());
        let group = Uuid::new_v4();
        let refs = EntityRefs::default();

        let proc = Procedure::from_guide(group, &guide(), &refs, now).unwrap();
        assert_eq!(proc.scheduled_start.time(), NaiveTime::from_hms_opt(8, 0, 0).unwrap());
        assert_eq!(
            proc.scheduled_end.unwrap().time(),
            NaiveTime::from_hms_opt(10, 30, 0).unwrap()
        );
        assert_eq!(proc.clinic_type, ClinicType::Elective);

        let mut nameless = guide();
        nameless.patient_name = None;
        assert!(Procedure::from_guide(group, &nameless, &refs, now).is_none());

        let mut undated = guide();
        undated.surgery_date = None;
        assert!(Procedure::from_guide(group, &undated, &refs, now).is_none());
    }

    #[test]
    fn test_end_time_rolls_over_midnight() {
        let start = NaiveDate::from_ymd_opt(2025, 3, 10)
            .unwrap()
            .and_hms_opt(22, 0, 0)
            .unwrap();
        let end = end_after_start(start, NaiveTime::from_hms_opt(1, 15, 0).unwrap());
        assert_eq!(end.date(), NaiveDate::from_ymd_opt(2025, 3, 11).unwrap());
    }

    #[test]
    fn test_fill_from_guide_only_fills_blanks_and_midnight_time() {
        let now = NaiveDate::from_ymd_opt(2025, 3, 11).unwrap().and_time(midnight());
        let hospital = Uuid::new_v4();
        let mut proc = Procedure {
            id: Uuid::new_v4(),
            group_id: Uuid::new_v4(),
            patient_name: "Maria Silva".to_string(),
            patient_birth_date: None,
            patient_national_id: Some("111".to_string()),
            scheduled_start: NaiveDate::from_ymd_opt(2025, 3, 10).unwrap().and_time(midnight()),
            scheduled_end: None,
            surgeon_id: None,
            hospital_id: Some(hospital),
            cooperating_clinician_id: None,
            responsible_clinician_ids: Vec::new(),
            principal_procedure_id: None,
            clinic_type: ClinicType::Unspecified,
            accommodation: None,
            created_at: now,
        };

        let mut g = guide();
        g.patient_national_id = Some("222".to_string());
        let refs = EntityRefs {
            hospital: Some(Uuid::new_v4()),
            cooperating_clinician: Some(Uuid::new_v4()),
            ..EntityRefs::default()
        };

        assert!(proc.fill_from_guide(&g, &refs));
        assert_eq!(proc.patient_national_id.as_deref(), Some("111"));
        assert_eq!(proc.hospital_id, Some(hospital));
        assert_eq!(proc.responsible_clinician_ids.len(), 1);
        assert_eq!(proc.scheduled_start.time(), NaiveTime::from_hms_opt(8, 0, 0).unwrap());
        assert_eq!(proc.clinic_type, ClinicType::Elective);

        // Second application is a no-op.
        assert!(!proc.fill_from_guide(&g, &refs));
    }

    #[test]
    fn test_billing_refresh_skips_unchanged_and_absent_values() {
        let g = guide();
        let mut record = BillingRecord::from_guide(Uuid::new_v4(), None, &g);
        assert!(!record.refresh_from_guide(&g));

        let mut newer = g.clone();
        newer.received_amount = Decimal::from_str("1200.00").ok();
        newer.billed_amount = None;
        assert!(record.refresh_from_guide(&newer));
        assert_eq!(record.billed_amount, Decimal::from_str("1500.00").ok());
        assert_eq!(record.received_amount, Decimal::from_str("1200").ok());

        // A guide without a raw status keeps the stored status.
        let mut silent = newer.clone();
        silent.raw_status = None;
        silent.status = PaymentStatus::Processing;
        assert!(!record.refresh_from_guide(&silent));
        assert_eq!(record.payment_status, PaymentStatus::Finalized);
    }

    #[test]
    fn test_status_helpers() {
        assert!(PaymentStatus::UnderAppeal.is_pending());
        assert!(!PaymentStatus::Finalized.is_pending());
        assert_eq!(
            PaymentStatus::from_db(PaymentStatus::AwaitingPayment.as_str()),
            Some(PaymentStatus::AwaitingPayment)
        );
        assert!(ChargeType::Cooperative.requires_procedure_link());
        assert!(!ChargeType::Private.requires_procedure_link());
        assert_eq!(ClinicType::from_classification(Some("PLANTÃO")), ClinicType::Shift);
        assert_eq!(ClinicType::from_classification(None), ClinicType::Unspecified);
    }
}

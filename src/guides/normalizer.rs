// src/guides/normalizer.rs
//
// Turns raw billing API records into typed `Guide` values. The API is inconsistent about
// field names, so every logical field is read through an ordered alias list; the first
// non-null, non-blank value wins. Unparseable values are logged and treated as absent.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;

use crate::models::core::PaymentStatus;
use crate::models::guide::Guide;

/// Field alias lists, in priority order.
pub mod aliases {
    pub const CLAIM_ID: &[&str] = &["cpsa", "nr_cpsa", "CPSA"];
    pub const SURGERY_DATE: &[&str] = &["dt_cirurg", "dt_cpsa"];
    pub const START_TIME: &[&str] = &["hora_inicial"];
    pub const END_TIME: &[&str] = &["hora_final"];
    pub const BILLED_AMOUNT: &[&str] = &["valor_faturado"];
    pub const RECEIVED_AMOUNT: &[&str] = &["valor_recebido"];
    // "valor_receuperado" is a misspelling the API actually sends.
    pub const RECOVERED_AMOUNT: &[&str] = &["valor_recuperado", "valor_receuperado"];
    pub const ACCEPTED_AMOUNT: &[&str] = &["valor_acatado"];
    pub const STATUS: &[&str] = &["STATUS", "status"];
    pub const PATIENT_NAME: &[&str] = &["paciente"];
    pub const PATIENT_NATIONAL_ID: &[&str] = &["cpf", "nr_cpf"];
    pub const PATIENT_BIRTH_DATE: &[&str] = &["data_nascimento"];
    pub const SURGEON_NAME: &[&str] = &["cirurgiao"];
    pub const SURGEON_LICENSE: &[&str] = &["crm_cirurgiao"];
    pub const COOPERATING_CLINICIAN: &[&str] = &["cooperado"];
    pub const HOSPITAL: &[&str] = &["hospital"];
    pub const ACCOMMODATION: &[&str] = &["tip_acomod"];
    pub const CLASSIFICATION: &[&str] = &["classificacao"];
    pub const PAYMENT_DATE: &[&str] = &["dt_pagamento", "data_pagamento"];
    pub const PROCEDURES: &str = "procedimentos";
    pub const PROCEDURE_CODE: &[&str] = &["codigo"];
    pub const PROCEDURE_DESCRIPTION: &[&str] = &["descricao"];
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y"];
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
];

// HH:MM, HH:MM:SS, a bare hour, or HHhMM.
static TIME_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^(\d{1,2})(?:(?::|[hH])(\d{2})?(?::(\d{2}))?)?$").ok()
});

// Dots used only as thousands separators: "1.500", "12.345.678".
static THOUSANDS_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^-?\d{1,3}(\.\d{3})+$").ok());

static STATUS_TABLE: Lazy<HashMap<&'static str, PaymentStatus>> = Lazy::new(|| {
    let mut table = HashMap::new();
    for raw in ["em processamento", "processamento", "em análise", "em analise"] {
        table.insert(raw, PaymentStatus::Processing);
    }
    for raw in ["aguardando pagamento", "a receber", "liberado para pagamento"] {
        table.insert(raw, PaymentStatus::AwaitingPayment);
    }
    for raw in ["em recurso", "recurso", "recurso de glosa"] {
        table.insert(raw, PaymentStatus::UnderAppeal);
    }
    for raw in [
        "processo finalizado",
        "finalizado",
        "pago",
        "pagamento efetuado",
    ] {
        table.insert(raw, PaymentStatus::Finalized);
    }
    for raw in ["cancelado", "cancelada", "processo cancelado"] {
        table.insert(raw, PaymentStatus::Cancelled);
    }
    table
});

/// First value under any of `names` that is neither null nor a blank string.
pub fn lookup<'a>(record: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| {
        record.get(*name).filter(|value| match value {
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            _ => true,
        })
    })
}

/// Text form of a looked-up value. Numbers are accepted since the API sometimes sends
/// claim ids and codes unquoted.
pub fn lookup_text(record: &Value, names: &[&str]) -> Option<String> {
    match lookup(record, names)? {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
        .or_else(|| parse_datetime(raw).map(|dt| dt.date()))
}

pub fn parse_time(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Some(dt) = parse_datetime(raw) {
        return Some(dt.time());
    }

    let pattern = TIME_PATTERN.as_ref()?;
    let captures = pattern.captures(raw)?;
    let field = |idx: usize| -> Option<u32> {
        captures
            .get(idx)
            .map_or(Some(0), |m| m.as_str().parse().ok())
    };
    NaiveTime::from_hms_opt(field(1)?, field(2)?, field(3)?)
}

/// Accepts JSON numbers, `1234.56` and the Brazilian `1.234,56` (optionally prefixed "R$").
/// Without a comma, dots grouping exactly three digits are thousands separators.
pub fn parse_amount(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        Value::String(s) => parse_amount_text(s),
        _ => None,
    }
}

fn parse_amount_text(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches("R$")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let normalized = if cleaned.contains(',') {
        cleaned.replace('.', "").replace(',', ".")
    } else if THOUSANDS_PATTERN
        .as_ref()
        .is_some_and(|re| re.is_match(&cleaned))
    {
        cleaned.replace('.', "")
    } else {
        cleaned
    };
    Decimal::from_str(&normalized).ok()
}

fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
}

/// Exact, case-insensitive lookup of the API's status text. Unknown or missing input maps
/// to `Processing`.
pub fn map_status(raw: Option<&str>) -> PaymentStatus {
    let Some(raw) = raw else {
        return PaymentStatus::Processing;
    };
    let key = raw.trim().to_lowercase();
    match STATUS_TABLE.get(key.as_str()) {
        Some(status) => *status,
        None => {
            debug!("Unknown guide status '{}', defaulting to processing", raw);
            PaymentStatus::Processing
        }
    }
}

/// Reads typed fields off one record, warning once per unparseable value.
struct FieldReader<'a> {
    record: &'a Value,
    claim_id: &'a str,
}

impl<'a> FieldReader<'a> {
    fn text(&self, names: &[&str]) -> Option<String> {
        lookup_text(self.record, names)
    }

    fn date(&self, label: &str, names: &[&str]) -> Option<NaiveDate> {
        let raw = self.text(names)?;
        let parsed = parse_date(&raw);
        if parsed.is_none() {
            warn!(
                "Guide {}: could not parse {} '{}', ignoring it",
                self.claim_id, label, raw
            );
        }
        parsed
    }

    fn time(&self, label: &str, names: &[&str]) -> Option<NaiveTime> {
        let raw = self.text(names)?;
        let parsed = parse_time(&raw);
        if parsed.is_none() {
            warn!(
                "Guide {}: could not parse {} '{}', ignoring it",
                self.claim_id, label, raw
            );
        }
        parsed
    }

    fn amount(&self, label: &str, names: &[&str]) -> Option<Decimal> {
        let value = lookup(self.record, names)?;
        let parsed = parse_amount(value);
        if parsed.is_none() {
            warn!(
                "Guide {}: could not parse {} {}, ignoring it",
                self.claim_id, label, value
            );
        }
        parsed
    }
}

/// Normalizes one raw record. Returns `None` only when the record carries no claim id.
pub fn normalize_guide(record: &Value) -> Option<Guide> {
    let claim_id = lookup_text(record, aliases::CLAIM_ID)?;
    let fields = FieldReader {
        record,
        claim_id: &claim_id,
    };

    let principal_procedure = record
        .get(aliases::PROCEDURES)
        .and_then(Value::as_array)
        .and_then(|procedures| procedures.first());
    let procedure_code =
        principal_procedure.and_then(|p| lookup_text(p, aliases::PROCEDURE_CODE));
    let procedure_description =
        principal_procedure.and_then(|p| lookup_text(p, aliases::PROCEDURE_DESCRIPTION));

    let raw_status = fields.text(aliases::STATUS);
    let status = map_status(raw_status.as_deref());

    Some(Guide {
        patient_name: fields.text(aliases::PATIENT_NAME),
        patient_national_id: fields.text(aliases::PATIENT_NATIONAL_ID),
        patient_birth_date: fields.date("birth date", aliases::PATIENT_BIRTH_DATE),
        surgery_date: fields.date("surgery date", aliases::SURGERY_DATE),
        start_time: fields.time("start time", aliases::START_TIME),
        end_time: fields.time("end time", aliases::END_TIME),
        surgeon_name: fields.text(aliases::SURGEON_NAME),
        surgeon_license: fields.text(aliases::SURGEON_LICENSE),
        hospital_name: fields.text(aliases::HOSPITAL),
        cooperating_clinician_name: fields.text(aliases::COOPERATING_CLINICIAN),
        accommodation: fields.text(aliases::ACCOMMODATION),
        procedure_code,
        procedure_description,
        billed_amount: fields.amount("billed amount", aliases::BILLED_AMOUNT),
        received_amount: fields.amount("received amount", aliases::RECEIVED_AMOUNT),
        recovered_amount: fields.amount("recovered amount", aliases::RECOVERED_AMOUNT),
        accepted_amount: fields.amount("accepted amount", aliases::ACCEPTED_AMOUNT),
        payment_date: fields.date("payment date", aliases::PAYMENT_DATE),
        raw_status,
        status,
        classification: fields.text(aliases::CLASSIFICATION),
        claim_id,
    })
}

/// Most recent surgery first; guides without a date or time sort last. Stable.
pub fn sort_guides_newest_first(guides: &mut [Guide]) {
    guides.sort_by(|a, b| b.recency_key().cmp(&a.recency_key()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2025, 3, 10);
        assert_eq!(parse_date("2025-03-10"), expected);
        assert_eq!(parse_date("10/03/2025"), expected);
        assert_eq!(parse_date("2025-03-10T08:15:00"), expected);
        assert_eq!(parse_date("2025-03-10 08:15:00"), expected);
        assert_eq!(parse_date("10-03-2025"), None);
        assert_eq!(parse_date("  "), None);
    }

    #[test]
    fn test_parse_time_formats() {
        let eight = NaiveTime::from_hms_opt(8, 0, 0);
        assert_eq!(parse_time("08:00"), eight);
        assert_eq!(parse_time("8"), eight);
        assert_eq!(parse_time("08"), eight);
        assert_eq!(parse_time("08:00:00"), eight);
        assert_eq!(parse_time("08h30"), NaiveTime::from_hms_opt(8, 30, 0));
        assert_eq!(parse_time("14:05:30"), NaiveTime::from_hms_opt(14, 5, 30));
        assert_eq!(parse_time("25:00"), None);
        assert_eq!(parse_time("morning"), None);
    }

    #[test]
    fn test_parse_amount_formats() {
        assert_eq!(parse_amount(&json!(1500)), Decimal::from_str("1500").ok());
        assert_eq!(parse_amount(&json!(1234.56)), Decimal::from_str("1234.56").ok());
        assert_eq!(parse_amount(&json!("1234.56")), Decimal::from_str("1234.56").ok());
        assert_eq!(parse_amount(&json!("1.234,56")), Decimal::from_str("1234.56").ok());
        assert_eq!(parse_amount(&json!("R$ 980,00")), Decimal::from_str("980.00").ok());
        assert_eq!(parse_amount(&json!("1.500")), Decimal::from_str("1500").ok());
        assert_eq!(parse_amount(&json!("R$ 12.345.678")), Decimal::from_str("12345678").ok());
        assert_eq!(parse_amount(&json!("1.5")), Decimal::from_str("1.5").ok());
        assert_eq!(parse_amount(&json!("abc")), None);
        assert_eq!(parse_amount(&json!(null)), None);
    }

    #[test]
    fn test_map_status() {
        assert_eq!(
            map_status(Some("Processo Finalizado")),
            PaymentStatus::Finalized
        );
        assert_eq!(
            map_status(Some("  AGUARDANDO PAGAMENTO ")),
            PaymentStatus::AwaitingPayment
        );
        assert_eq!(map_status(Some("Em Recurso")), PaymentStatus::UnderAppeal);
        assert_eq!(map_status(Some("Cancelado")), PaymentStatus::Cancelled);
        assert_eq!(map_status(None), PaymentStatus::Processing);
        assert_eq!(map_status(Some("gibberish")), PaymentStatus::Processing);
    }

    #[test]
    fn test_lookup_skips_null_and_blank_aliases() {
        let record = json!({ "cpsa": "  ", "nr_cpsa": null, "CPSA": 778899 });
        assert_eq!(
            lookup_text(&record, aliases::CLAIM_ID).as_deref(),
            Some("778899")
        );
    }

    #[test]
    fn test_normalize_guide_reads_aliases() {
        let record = json!({
            "nr_cpsa": "100200",
            "paciente": " Maria Silva ",
            "dt_cpsa": "10/03/2025",
            "hora_inicial": "08:00",
            "hora_final": "10h30",
            "hospital": "Hospital São Lucas",
            "cooperado": "Dr. Paulo Mendes",
            "valor_faturado": "1.500,00",
            "valor_receuperado": 120,
            "status": "Aguardando Pagamento",
            "classificacao": "Eletiva",
            "data_pagamento": "2025-04-02",
            "procedimentos": [
                { "codigo": "30602076", "descricao": "Colecistectomia" },
                { "codigo": "999", "descricao": "Secundario" }
            ]
        });

        let guide = normalize_guide(&record).unwrap();
        assert_eq!(guide.claim_id, "100200");
        assert_eq!(guide.patient_name.as_deref(), Some("Maria Silva"));
        assert_eq!(guide.surgery_date, NaiveDate::from_ymd_opt(2025, 3, 10));
        assert_eq!(guide.end_time, NaiveTime::from_hms_opt(10, 30, 0));
        assert_eq!(guide.billed_amount, Decimal::from_str("1500.00").ok());
        assert_eq!(guide.recovered_amount, Decimal::from_str("120").ok());
        assert_eq!(guide.status, PaymentStatus::AwaitingPayment);
        assert_eq!(guide.payment_date, NaiveDate::from_ymd_opt(2025, 4, 2));
        assert_eq!(guide.procedure_code.as_deref(), Some("30602076"));
        assert_eq!(guide.procedure_name(), Some("Colecistectomia"));
    }

    #[test]
    fn test_normalize_guide_tolerates_bad_fields() {
        let record = json!({ "cpsa": "1", "dt_cirurg": "not a date", "valor_faturado": "n/a" });
        let guide = normalize_guide(&record).unwrap();
        assert_eq!(guide.surgery_date, None);
        assert_eq!(guide.billed_amount, None);
        assert_eq!(guide.raw_status, None);
        assert_eq!(guide.status, PaymentStatus::Processing);

        assert!(normalize_guide(&json!({ "paciente": "Sem CPSA" })).is_none());
    }

    #[test]
    fn test_sort_newest_first_is_stable() {
        let make = |claim: &str, date: Option<(i32, u32, u32)>, hour: Option<u32>| Guide {
            claim_id: claim.to_string(),
            surgery_date: date.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
            start_time: hour.and_then(|h| NaiveTime::from_hms_opt(h, 0, 0)),
            ..Guide::default()
        };
        let mut guides = vec![
            make("undated", None, None),
            make("march-morning", Some((2025, 3, 10)), Some(8)),
            make("april", Some((2025, 4, 1)), None),
            make("march-evening", Some((2025, 3, 10)), Some(19)),
            make("undated-2", None, None),
        ];
        sort_guides_newest_first(&mut guides);
        let order: Vec<_> = guides.iter().map(|g| g.claim_id.as_str()).collect();
        assert_eq!(
            order,
            vec!["april", "march-evening", "march-morning", "undated", "undated-2"]
        );
    }
}

// src/guides/client.rs
use async_trait::async_trait;
use log::{debug, info};
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

use crate::error::{ReconcileError, Result};
use crate::reconciliation::window::ReconciliationWindow;

const RESULT_CODE_KEYS: &[&str] = &["resultado", "codigo", "result"];
const MESSAGE_KEYS: &[&str] = &["mensagem", "message"];
const GUIDE_LIST_KEYS: &[&str] = &["guias", "dados"];
const SUCCESS_CODES: &[&str] = &["0", "ok", "sucesso"];
const API_DATE_FORMAT: &str = "%Y-%m-%d";

/// Anything that can list a tenant's guides for a date window. Records are returned raw;
/// normalization happens in the orchestrator so every source goes through the same rules.
#[async_trait]
pub trait GuideSource: Send + Sync {
    async fn fetch_guides(
        &self,
        credential: &str,
        window: &ReconciliationWindow,
    ) -> Result<Vec<Value>>;
}

/// HTTP client for the external billing system.
#[derive(Debug, Clone)]
pub struct BillingApiClient {
    http: reqwest::Client,
    endpoint: Url,
    status_filter: String,
    timeout: Duration,
}

impl BillingApiClient {
    pub fn new(endpoint: &str, timeout: Duration, status_filter: &str) -> anyhow::Result<Self> {
        use anyhow::Context;

        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("Invalid billing API URL '{}'", endpoint))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build billing API HTTP client")?;
        Ok(Self {
            http,
            endpoint,
            status_filter: status_filter.to_string(),
            timeout,
        })
    }

    fn request_body(&self, credential: &str, window: &ReconciliationWindow) -> Value {
        json!({
            "token": credential,
            "data_inicial": window.start.format(API_DATE_FORMAT).to_string(),
            "data_final": window.end.format(API_DATE_FORMAT).to_string(),
            "status": self.status_filter,
        })
    }
}

#[async_trait]
impl GuideSource for BillingApiClient {
    async fn fetch_guides(
        &self,
        credential: &str,
        window: &ReconciliationWindow,
    ) -> Result<Vec<Value>> {
        info!(
            "Requesting guides from {} for {} to {}",
            self.endpoint.host_str().unwrap_or("billing API"),
            window.start,
            window.end
        );

        let response = self
            .http
            .post(self.endpoint.clone())
            .json(&self.request_body(credential, window))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ReconcileError::Api(format!(
                        "request timed out after {}s",
                        self.timeout.as_secs()
                    ))
                } else {
                    ReconcileError::Api(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReconcileError::Api(format!("HTTP status {}", status)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ReconcileError::MalformedResponse(e.to_string()))?;
        let guides = parse_envelope(body)?;
        debug!("Billing API returned {} guide records", guides.len());
        Ok(guides)
    }
}

/// Whether the envelope's result code means success: `0`, `"0"`, `"ok"` or `"sucesso"`.
pub fn result_code_is_success(code: &Value) -> bool {
    match code {
        Value::Number(n) => n.as_i64() == Some(0) || n.as_f64() == Some(0.0),
        Value::String(s) => {
            let lowered = s.trim().to_lowercase();
            SUCCESS_CODES.contains(&lowered.as_str())
        }
        _ => false,
    }
}

/// Unwraps `{resultado, mensagem, guias}` (or its aliases) into the raw guide records.
/// A missing result code is accepted as long as the guide list is present.
pub fn parse_envelope(body: Value) -> Result<Vec<Value>> {
    let Value::Object(mut envelope) = body else {
        return Err(ReconcileError::MalformedResponse(
            "response body is not a JSON object".to_string(),
        ));
    };

    if let Some(code) = RESULT_CODE_KEYS.iter().find_map(|k| envelope.get(*k)) {
        if !result_code_is_success(code) {
            let message = MESSAGE_KEYS
                .iter()
                .find_map(|k| envelope.get(*k))
                .map(|m| match m {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| "no message".to_string());
            let code = match code {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Err(ReconcileError::ApiResult { code, message });
        }
    }

    let key = GUIDE_LIST_KEYS
        .iter()
        .find(|k| envelope.contains_key(**k))
        .ok_or_else(|| ReconcileError::MalformedResponse("no guide list in response".to_string()))?;
    match envelope.remove(*key) {
        Some(Value::Array(guides)) => Ok(guides),
        Some(Value::Null) => Ok(Vec::new()),
        _ => Err(ReconcileError::MalformedResponse(format!(
            "'{}' is not a list",
            key
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_success_codes() {
        assert!(result_code_is_success(&json!(0)));
        assert!(result_code_is_success(&json!("0")));
        assert!(result_code_is_success(&json!("OK")));
        assert!(result_code_is_success(&json!("Sucesso")));
        assert!(!result_code_is_success(&json!(1)));
        assert!(!result_code_is_success(&json!("erro")));
        assert!(!result_code_is_success(&json!(null)));
    }

    #[test]
    fn test_parse_envelope_success_and_aliases() {
        let guides = parse_envelope(json!({
            "resultado": 0,
            "mensagem": "",
            "guias": [{ "cpsa": "1" }, { "cpsa": "2" }]
        }))
        .unwrap();
        assert_eq!(guides.len(), 2);

        let guides = parse_envelope(json!({ "codigo": "ok", "dados": [{ "cpsa": "9" }] })).unwrap();
        assert_eq!(guides.len(), 1);

        let guides = parse_envelope(json!({ "result": "sucesso", "guias": null })).unwrap();
        assert!(guides.is_empty());
    }

    #[test]
    fn test_parse_envelope_error_code_carries_message() {
        let err = parse_envelope(json!({
            "resultado": 3,
            "mensagem": "Token inválido",
            "guias": []
        }))
        .unwrap_err();
        match err {
            ReconcileError::ApiResult { code, message } => {
                assert_eq!(code, "3");
                assert_eq!(message, "Token inválido");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parse_envelope_rejects_malformed_bodies() {
        assert!(matches!(
            parse_envelope(json!([1, 2])),
            Err(ReconcileError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_envelope(json!({ "resultado": 0 })),
            Err(ReconcileError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_envelope(json!({ "resultado": 0, "guias": "none" })),
            Err(ReconcileError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_request_body_shape() {
        let client =
            BillingApiClient::new("https://billing.example.org/api/guias", Duration::from_secs(5), "todos")
                .unwrap();
        let window = ReconciliationWindow {
            start: NaiveDate::from_ymd_opt(2025, 1, 3).unwrap(),
            end: NaiveDate::from_ymd_opt(2025, 6, 30).unwrap(),
        };
        let body = client.request_body("secret", &window);
        assert_eq!(
            body,
            json!({
                "token": "secret",
                "data_inicial": "2025-01-03",
                "data_final": "2025-06-30",
                "status": "todos"
            })
        );
        assert!(BillingApiClient::new("not a url", Duration::from_secs(5), "todos").is_err());
    }
}

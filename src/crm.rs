//! Pushes analysed oficios into the CRM as legal document requests.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};
use crate::intake::NOT_SPECIFIED;
use crate::ocr::{AutoRecord, OcrResult, Persona};

const CRM_TIMEOUT: Duration = Duration::from_secs(30);
const FULL_TEXT_LIMIT: usize = 4000;
const HIGH_AMOUNT: f64 = 50_000.0;

const URGENT_KEYWORDS: &[&str] = &[
    "embargo",
    "secuestro",
    "allanamiento",
    "aprehensión",
    "citación",
    "urgente",
    "inmediato",
];

const DATE_FORMATS: &[&str] = &["%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%Y-%m-%d", "%d/%m/%y", "%d-%m-%y"];

static NON_DATE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\d/.\-]").expect("valid date filter regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    High,
    Medium,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CrmPerson {
    pub full_name: String,
    pub identification: String,
    pub person_type: String,
    pub role: String,
    pub amount: f64,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CrmAuto {
    pub auto_date: Option<String>,
    pub auto_number: String,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CrmPayload {
    pub document_id: String,
    pub batch_id: String,
    pub document_type: String,
    pub oficio_number: String,
    pub authority: String,
    pub issue_date: Option<String>,
    pub received_date: Option<String>,
    pub client_target: String,
    pub client_identification: String,
    pub expedient_number: String,
    pub auto_number: String,
    pub auto_date: Option<String>,
    pub amount: f64,
    pub branch_received: String,
    pub folder: String,
    pub due_date: Option<String>,
    pub company: String,
    pub document_classification: String,
    pub confidence_level: String,
    pub keywords_found: String,
    pub processed_at: String,
    pub processing_source: String,
    pub full_text: String,
    pub observations: String,
    pub status: String,
    pub priority: Priority,
    pub requires_urgent_action: bool,
    pub requires_review: bool,
    pub persons_count: usize,
    pub total_amount: f64,
    pub involved_persons: Vec<CrmPerson>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_autos: Vec<CrmAuto>,
}

/// Normalises the date formats seen in oficios to `YYYY-MM-DD`.
pub fn parse_date(raw: Option<&str>) -> Option<String> {
    let raw = raw?.trim();
    if raw.is_empty() || raw == NOT_SPECIFIED || raw == "null" {
        return None;
    }
    let clean = NON_DATE_CHARS.replace_all(raw, "");

    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(&clean, fmt) {
            // %Y happily reads "24" as the year 24
            if fmt.contains("%Y") && date.year() < 1000 {
                continue;
            }
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }
    tracing::warn!("Could not parse date: {}", raw);
    None
}

pub fn parse_amount(raw: Option<&str>) -> f64 {
    let Some(raw) = raw else {
        return 0.0;
    };
    if raw == NOT_SPECIFIED || raw == "null" {
        return 0.0;
    }
    raw.replace("B/.", "")
        .replace('$', "")
        .replace(',', "")
        .trim()
        .parse()
        .unwrap_or(0.0)
}

fn has_urgent_keyword(keywords: &[String]) -> bool {
    keywords
        .iter()
        .map(|k| k.to_lowercase())
        .any(|k| URGENT_KEYWORDS.contains(&k.as_str()))
}

pub fn priority(result: &OcrResult) -> Priority {
    let info = &result.analysis.informacion_extraida;
    let has_due_date = info
        .vencimiento
        .as_deref()
        .is_some_and(|v| !v.is_empty() && v != NOT_SPECIFIED);

    if has_due_date
        || has_urgent_keyword(&result.analysis.palabras_clave_encontradas)
        || parse_amount(info.monto.as_deref()) > HIGH_AMOUNT
    {
        Priority::High
    } else {
        Priority::Medium
    }
}

pub fn requires_urgent_action(result: &OcrResult) -> bool {
    has_urgent_keyword(&result.analysis.palabras_clave_encontradas)
}

fn format_person(idx: usize, p: &Persona) -> CrmPerson {
    CrmPerson {
        full_name: p.nombre.clone(),
        identification: p.identificacion.clone().unwrap_or_default(),
        person_type: p.tipo.clone().unwrap_or_default(),
        role: p.rol.clone().unwrap_or_default(),
        amount: p.monto.unwrap_or(0.0),
        sequence: idx as u32 + 1,
    }
}

fn format_auto(auto: &AutoRecord) -> CrmAuto {
    CrmAuto {
        auto_date: parse_date(auto.fecha_auto.as_deref()),
        auto_number: auto.numero_auto_placa.clone().unwrap_or_default(),
        amount: parse_amount(auto.monto_auto.as_deref()),
    }
}

pub fn map_to_crm(result: &OcrResult, job_id: &str, batch_id: &str, now: DateTime<Utc>) -> CrmPayload {
    let info = &result.analysis.informacion_extraida;
    let text = |v: &Option<String>| v.clone().unwrap_or_default();
    let persons = &result.lista_personas.listado;

    CrmPayload {
        document_id: job_id.to_string(),
        batch_id: batch_id.to_string(),
        document_type: "Oficio Legal".to_string(),
        oficio_number: text(&info.numero_oficio),
        authority: text(&info.autoridad),
        issue_date: parse_date(info.fecha_emision.as_deref()),
        received_date: parse_date(info.fecha_recibido.as_deref()),
        client_target: text(&info.oficiado_cliente),
        client_identification: text(&info.numero_identificacion),
        expedient_number: text(&info.expediente),
        auto_number: text(&info.numero_auto),
        auto_date: parse_date(info.fecha_auto.as_deref()),
        amount: parse_amount(info.monto.as_deref()),
        branch_received: text(&info.sucursal_recibido),
        folder: text(&info.carpeta),
        due_date: parse_date(info.vencimiento.as_deref()),
        company: result.metadata.empresa.clone(),
        document_classification: result.analysis.tipo_oficio_detectado.clone(),
        confidence_level: result.analysis.nivel_confianza.clone(),
        keywords_found: result.analysis.palabras_clave_encontradas.join(", "),
        processed_at: now.to_rfc3339(),
        processing_source: "Automated OCR".to_string(),
        full_text: result.texto_completo.chars().take(FULL_TEXT_LIMIT).collect(),
        observations: result.observaciones.clone(),
        status: "Pending Review".to_string(),
        priority: priority(result),
        requires_urgent_action: requires_urgent_action(result),
        requires_review: result.requires_review,
        persons_count: persons.len(),
        total_amount: result.lista_personas.monto_total,
        involved_persons: persons.iter().enumerate().map(|(i, p)| format_person(i, p)).collect(),
        related_autos: result.analysis.lista_autos.iter().map(format_auto).collect(),
    }
}

#[async_trait]
pub trait CrmSink: Send + Sync {
    /// Creates the request and returns the CRM record id.
    async fn create_request(&self, payload: &CrmPayload) -> PipelineResult<String>;
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct InsertRequest<'a> {
    root_schema_name: &'a str,
    operation_type: u8,
    column_values: &'a CrmPayload,
}

pub struct HttpCrm {
    client: Client,
    endpoint: String,
    api_key: String,
    root_schema: String,
}

impl HttpCrm {
    pub fn new(endpoint: &str, api_key: &str, root_schema: &str) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            root_schema: root_schema.to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Option<Self> {
        let endpoint = config.crm_endpoint.as_deref()?;
        let key = config.crm_api_key.as_deref()?;
        Some(Self::new(endpoint, key, &config.crm_root_schema))
    }
}

/// Record id from an insert reply.
fn record_id(body: &serde_json::Value) -> String {
    ["id", "Id"]
        .iter()
        .find_map(|k| match body.get(*k) {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| "unknown".to_string())
}

#[async_trait]
impl CrmSink for HttpCrm {
    async fn create_request(&self, payload: &CrmPayload) -> PipelineResult<String> {
        let url = format!("{}/0/dataservice/json/SyncReply/SelectQuery", self.endpoint);
        let req = InsertRequest {
            root_schema_name: &self.root_schema,
            operation_type: 0,
            column_values: payload,
        };

        tracing::info!("Creating CRM request for {}", payload.document_id);
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Accept", "application/json")
            .timeout(CRM_TIMEOUT)
            .json(&req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PipelineError::Crm("CRM API timeout".to_string())
                } else {
                    PipelineError::Crm(format!("CRM connection error: {}", e))
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Crm(format!("HTTP {}: {}", status, err_text)));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| PipelineError::Crm(format!("Invalid CRM response: {}", e)))?;
        let id = record_id(&body);
        tracing::info!("CRM request created with id {}", id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::{ExtractedInfo, OcrOutputSummary, OficioAnalysis, PersonList, PersonsCheck};

    fn result_with(info: ExtractedInfo, keywords: &[&str]) -> OcrResult {
        OcrResult {
            job_id: "B_oficio_001".to_string(),
            batch_id: "B".to_string(),
            texto_completo: "x".repeat(5000),
            analysis: OficioAnalysis {
                palabras_clave_encontradas: keywords.iter().map(|s| s.to_string()).collect(),
                tipo_oficio_detectado: "Embargo".to_string(),
                nivel_confianza: "alto".to_string(),
                informacion_extraida: info,
                lista_autos: Vec::new(),
            },
            ocr: OcrOutputSummary {
                engine: "text_layer".to_string(),
                model: "pdf-text".to_string(),
                pages: 1,
                chars: 5000,
                confidence: None,
            },
            lista_personas: PersonList {
                listado: vec![Persona {
                    nombre: "JUAN PEREZ".to_string(),
                    identificacion: Some("8-123-456".to_string()),
                    monto: Some(1200.0),
                    ..Persona::default()
                }],
                monto_total: 1200.0,
            },
            persons_check: PersonsCheck::default(),
            observaciones: "Procesado automáticamente".to_string(),
            requires_review: false,
            metadata: Default::default(),
            processed_at: Utc::now(),
        }
    }

    #[test]
    fn dates_normalise_across_formats() {
        assert_eq!(parse_date(Some("05/03/2024")).as_deref(), Some("2024-03-05"));
        assert_eq!(parse_date(Some("5-3-2024")).as_deref(), Some("2024-03-05"));
        assert_eq!(parse_date(Some("05.03.2024")).as_deref(), Some("2024-03-05"));
        assert_eq!(parse_date(Some("2024-03-05")).as_deref(), Some("2024-03-05"));
        assert_eq!(parse_date(Some("05/03/24")).as_deref(), Some("2024-03-05"));
        assert_eq!(parse_date(Some("Panamá, 05/03/2024.")).as_deref(), None);
        assert_eq!(parse_date(Some("Panamá, 05/03/2024")).as_deref(), Some("2024-03-05"));
        assert_eq!(parse_date(Some(NOT_SPECIFIED)), None);
        assert_eq!(parse_date(None), None);
    }

    #[test]
    fn amounts_drop_currency_marks() {
        assert_eq!(parse_amount(Some("B/. 1,500.75")), 1500.75);
        assert_eq!(parse_amount(Some("$60,000")), 60000.0);
        assert_eq!(parse_amount(Some("mil balboas")), 0.0);
        assert_eq!(parse_amount(None), 0.0);
    }

    #[test]
    fn priority_rules() {
        let plain = result_with(ExtractedInfo::default(), &["oficio"]);
        assert_eq!(priority(&plain), Priority::Medium);
        assert!(!requires_urgent_action(&plain));

        let urgent = result_with(ExtractedInfo::default(), &["Embargo"]);
        assert_eq!(priority(&urgent), Priority::High);
        assert!(requires_urgent_action(&urgent));

        let due = result_with(
            ExtractedInfo {
                vencimiento: Some("10/04/2024".to_string()),
                ..Default::default()
            },
            &[],
        );
        assert_eq!(priority(&due), Priority::High);

        let large = result_with(
            ExtractedInfo {
                monto: Some("B/. 75,000.00".to_string()),
                ..Default::default()
            },
            &[],
        );
        assert_eq!(priority(&large), Priority::High);
    }

    #[test]
    fn payload_maps_fields_and_truncates_text() {
        let result = result_with(
            ExtractedInfo {
                numero_oficio: Some("1234".to_string()),
                fecha_emision: Some("05/03/2024".to_string()),
                monto: Some("$1,200.00".to_string()),
                ..Default::default()
            },
            &["embargo"],
        );
        let payload = map_to_crm(&result, "B_oficio_001", "B", Utc::now());
        assert_eq!(payload.oficio_number, "1234");
        assert_eq!(payload.issue_date.as_deref(), Some("2024-03-05"));
        assert_eq!(payload.amount, 1200.0);
        assert_eq!(payload.full_text.chars().count(), FULL_TEXT_LIMIT);
        assert_eq!(payload.persons_count, 1);
        assert_eq!(payload.involved_persons[0].sequence, 1);

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["OficioNumber"], "1234");
        assert_eq!(json["Priority"], "High");
        assert_eq!(json["InvolvedPersons"][0]["FullName"], "JUAN PEREZ");
    }

    #[test]
    fn autos_are_mapped_with_normalised_dates_and_amounts() {
        let mut result = result_with(ExtractedInfo::default(), &[]);
        let json = serde_json::to_value(map_to_crm(&result, "B_oficio_001", "B", Utc::now())).unwrap();
        assert!(json.get("RelatedAutos").is_none());

        result.analysis.lista_autos = vec![
            AutoRecord {
                fecha_auto: Some("12/02/2024".to_string()),
                numero_auto_placa: Some("Auto 45".to_string()),
                monto_auto: Some("B/. 1,800.50".to_string()),
            },
            AutoRecord {
                numero_auto_placa: Some("AB-1234".to_string()),
                ..AutoRecord::default()
            },
        ];
        let payload = map_to_crm(&result, "B_oficio_001", "B", Utc::now());
        assert_eq!(payload.related_autos.len(), 2);
        assert_eq!(payload.related_autos[0].auto_date.as_deref(), Some("2024-02-12"));
        assert_eq!(payload.related_autos[0].amount, 1800.5);
        assert_eq!(payload.related_autos[1].auto_date, None);
        assert_eq!(payload.related_autos[1].amount, 0.0);

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["RelatedAutos"][0]["AutoNumber"], "Auto 45");
        assert_eq!(json["RelatedAutos"][0]["AutoDate"], "2024-02-12");
    }

    #[test]
    fn record_id_falls_back_to_unknown() {
        assert_eq!(record_id(&serde_json::json!({"id": "abc"})), "abc");
        assert_eq!(record_id(&serde_json::json!({"Id": 42})), "42");
        assert_eq!(record_id(&serde_json::json!({"rows": []})), "unknown");
    }
}

//! Text extraction and structured analysis of a single oficio.

pub mod format;
pub mod mistral;
pub mod post_validate;
pub mod text_layer;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::PipelineResult;
use crate::intake::BatchMetadata;

pub const UNIDENTIFIED: &str = "No identificado";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrOutput {
    pub text: String,
    pub pages: u32,
    pub engine: String,
    pub model: String,
    pub confidence: Option<f64>,
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn extract(&self, pdf: &[u8]) -> PipelineResult<OcrOutput>;
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, text: &str, job_id: &str) -> PipelineResult<OficioAnalysis>;
}

/// Accepts strings, numbers or null for fields a language model fills in loosely.
fn loose_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => {
            let s = s.trim();
            (!s.is_empty() && !s.eq_ignore_ascii_case("null")).then(|| s.to_string())
        }
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(serde_json::Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

fn loose_people<'de, D>(deserializer: D) -> Result<Vec<Persona>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    let items = match value {
        Some(serde_json::Value::Array(items)) => items,
        _ => return Ok(Vec::new()),
    };
    Ok(items
        .into_iter()
        .filter_map(|item| match item {
            serde_json::Value::String(nombre) => Some(Persona {
                nombre,
                tipo: Some("Persona".to_string()),
                ..Persona::default()
            }),
            other => serde_json::from_value(other).ok(),
        })
        .filter(|p: &Persona| !p.nombre.trim().is_empty())
        .collect())
}

fn loose_autos<'de, D>(deserializer: D) -> Result<Vec<AutoRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    let items = match value {
        Some(serde_json::Value::Array(items)) => items,
        _ => return Ok(Vec::new()),
    };
    Ok(items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<AutoRecord>(item).ok())
        .filter(|a| a.fecha_auto.is_some() || a.numero_auto_placa.is_some() || a.monto_auto.is_some())
        .collect())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    #[serde(default, alias = "nombre_completo")]
    pub nombre: String,
    #[serde(default, alias = "tipo_persona", deserialize_with = "loose_string")]
    pub tipo: Option<String>,
    #[serde(default, alias = "numero_identificacion", deserialize_with = "loose_string")]
    pub identificacion: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub rol: Option<String>,
    #[serde(default)]
    pub monto: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedInfo {
    #[serde(default, deserialize_with = "loose_string")]
    pub numero_oficio: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub autoridad: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub fecha_emision: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub fecha_recibido: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub oficiado_cliente: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub numero_identificacion: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub expediente: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub fecha_auto: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub numero_auto: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub monto: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub sucursal_recibido: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub carpeta: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub vencimiento: Option<String>,
    #[serde(default, deserialize_with = "loose_people")]
    pub personas: Vec<Persona>,
}

/// A court order (auto) listed in the oficio, usually one row per plate or account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoRecord {
    #[serde(default, deserialize_with = "loose_string")]
    pub fecha_auto: Option<String>,
    #[serde(default, alias = "numero_auto", deserialize_with = "loose_string")]
    pub numero_auto_placa: Option<String>,
    #[serde(default, alias = "monto", deserialize_with = "loose_string")]
    pub monto_auto: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OficioAnalysis {
    #[serde(default)]
    pub palabras_clave_encontradas: Vec<String>,
    #[serde(default = "unidentified")]
    pub tipo_oficio_detectado: String,
    #[serde(default = "low_confidence")]
    pub nivel_confianza: String,
    pub informacion_extraida: ExtractedInfo,
    #[serde(default, deserialize_with = "loose_autos")]
    pub lista_autos: Vec<AutoRecord>,
}

fn unidentified() -> String {
    UNIDENTIFIED.to_string()
}

fn low_confidence() -> String {
    "bajo".to_string()
}

impl OficioAnalysis {
    /// Used when the model reply cannot be understood.
    pub fn fallback() -> Self {
        Self {
            palabras_clave_encontradas: Vec::new(),
            tipo_oficio_detectado: unidentified(),
            nivel_confianza: low_confidence(),
            informacion_extraida: ExtractedInfo::default(),
            lista_autos: Vec::new(),
        }
    }
}

/// Parses the JSON object embedded in a model reply, from the first `{` to the last `}`.
pub fn parse_analysis_reply(reply: &str) -> OficioAnalysis {
    let (Some(start), Some(end)) = (reply.find('{'), reply.rfind('}')) else {
        tracing::warn!("Analysis reply contains no JSON object, using fallback");
        return OficioAnalysis::fallback();
    };
    if end <= start {
        return OficioAnalysis::fallback();
    }

    match serde_json::from_str::<OficioAnalysis>(&reply[start..=end]) {
        Ok(analysis) => analysis,
        Err(e) => {
            tracing::warn!("Could not parse analysis reply ({}), using fallback", e);
            OficioAnalysis::fallback()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonList {
    pub listado: Vec<Persona>,
    pub monto_total: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonsCheck {
    pub personas_count: usize,
    pub should_have_persons: bool,
    pub validation_passed: bool,
    pub warnings: Vec<String>,
    pub extracted_from_text: usize,
}

/// Everything learned about one oficio; stored as `jobs/<job>/result.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
    pub job_id: String,
    pub batch_id: String,
    pub texto_completo: String,
    pub analysis: OficioAnalysis,
    pub ocr: OcrOutputSummary,
    pub lista_personas: PersonList,
    pub persons_check: PersonsCheck,
    pub observaciones: String,
    pub requires_review: bool,
    pub metadata: BatchMetadata,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrOutputSummary {
    pub engine: String,
    pub model: String,
    pub pages: u32,
    pub chars: usize,
    pub confidence: Option<f64>,
}

impl From<&OcrOutput> for OcrOutputSummary {
    fn from(out: &OcrOutput) -> Self {
        Self {
            engine: out.engine.clone(),
            model: out.model.clone(),
            pages: out.pages,
            chars: out.text.chars().count(),
            confidence: out.confidence,
        }
    }
}

/// Keyword-only analysis for when no language model is configured.
pub struct KeywordAnalyzer;

const KNOWN_KEYWORDS: &[&str] = &[
    "embargo",
    "secuestro",
    "retención",
    "allanamiento",
    "aprehensión",
    "citación",
    "levantamiento",
    "desbloqueo",
    "investigación",
    "urgente",
    "inmediato",
];

#[async_trait]
impl Analyzer for KeywordAnalyzer {
    async fn analyze(&self, text: &str, job_id: &str) -> PipelineResult<OficioAnalysis> {
        let lower = text.to_lowercase();
        let keywords: Vec<String> = KNOWN_KEYWORDS
            .iter()
            .filter(|kw| lower.contains(*kw))
            .map(|kw| kw.to_string())
            .collect();
        let kind = crate::split::classify_document(text);
        tracing::debug!("Keyword analysis for {}: {} keywords, type {}", job_id, keywords.len(), kind);

        Ok(OficioAnalysis {
            palabras_clave_encontradas: keywords,
            tipo_oficio_detectado: kind.to_string(),
            nivel_confianza: low_confidence(),
            informacion_extraida: ExtractedInfo::default(),
            lista_autos: Vec::new(),
        })
    }
}

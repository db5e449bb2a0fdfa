use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::{parse_analysis_reply, Analyzer, OcrEngine, OcrOutput, OficioAnalysis};
use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};

const OCR_TIMEOUT: Duration = Duration::from_secs(600);
const CHAT_TIMEOUT: Duration = Duration::from_secs(120);
const CHAT_ATTEMPTS: u32 = 3;
/// Prompts are capped so a huge oficio does not blow the context window.
const MAX_PROMPT_CHARS: usize = 60_000;

/// Client for the hosted OCR and chat endpoints.
#[derive(Clone)]
pub struct MistralClient {
    client: Client,
    base_url: String,
    api_key: String,
    pub ocr_model: String,
    pub chat_model: String,
    rate_limit_wait: Duration,
}

#[derive(Serialize)]
struct OcrRequest<'a> {
    model: &'a str,
    document: OcrDocument,
    include_image_base64: bool,
}

#[derive(Serialize)]
struct OcrDocument {
    #[serde(rename = "type")]
    kind: &'static str,
    document_url: String,
}

#[derive(Deserialize)]
struct OcrResponse {
    #[serde(default)]
    pages: Vec<OcrPage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct OcrPage {
    #[serde(default)]
    markdown: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

impl MistralClient {
    pub fn new(base_url: &str, api_key: &str, ocr_model: &str, chat_model: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            ocr_model: ocr_model.to_string(),
            chat_model: chat_model.to_string(),
            rate_limit_wait: Duration::from_secs(10),
        }
    }

    /// `None` when no API key is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        let key = config.mistral_api_key.as_deref()?;
        Some(Self::new(&config.mistral_base_url, key, &config.ocr_model, &config.chat_model))
    }

    async fn chat_once(&self, prompt: &str) -> Result<String, ChatFailure> {
        let url = format!("{}/chat/completions", self.base_url);
        let req = ChatRequest {
            model: &self.chat_model,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: 0.1,
            max_tokens: 2000,
            top_p: 0.9,
        };

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(CHAT_TIMEOUT)
            .json(&req)
            .send()
            .await
            .map_err(|e| ChatFailure::Transport(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ChatFailure::RateLimited);
        }
        if !status.is_success() {
            let err_text = resp.text().await.unwrap_or_default();
            return Err(ChatFailure::Status(status, err_text));
        }

        let body: ChatResponse = resp
            .json()
            .await
            .map_err(|e| ChatFailure::Transport(e.to_string()))?;
        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or(ChatFailure::Empty)
    }
}

enum ChatFailure {
    RateLimited,
    Status(StatusCode, String),
    Transport(String),
    Empty,
}

#[async_trait]
impl OcrEngine for MistralClient {
    async fn extract(&self, pdf: &[u8]) -> PipelineResult<OcrOutput> {
        let url = format!("{}/ocr", self.base_url);
        let encoded = base64::engine::general_purpose::STANDARD.encode(pdf);
        let req = OcrRequest {
            model: &self.ocr_model,
            document: OcrDocument {
                kind: "document_url",
                document_url: format!("data:application/pdf;base64,{}", encoded),
            },
            include_image_base64: false,
        };

        tracing::info!("Sending {} bytes to OCR model {}", pdf.len(), self.ocr_model);
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(OCR_TIMEOUT)
            .json(&req)
            .send()
            .await
            .map_err(|e| PipelineError::Ocr(format!("OCR request failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let err_text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Ocr(format!("OCR API error {}: {}", status, err_text)));
        }

        let body: OcrResponse = resp
            .json()
            .await
            .map_err(|e| PipelineError::Ocr(format!("Invalid OCR response: {}", e)))?;

        let text = body
            .pages
            .iter()
            .map(|p| p.markdown.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        if text.is_empty() {
            return Err(PipelineError::Ocr("OCR returned no text".to_string()));
        }

        Ok(OcrOutput {
            text,
            pages: body.pages.len() as u32,
            engine: "mistral".to_string(),
            model: body.model.unwrap_or_else(|| self.ocr_model.clone()),
            confidence: None,
        })
    }
}

#[async_trait]
impl Analyzer for MistralClient {
    async fn analyze(&self, text: &str, job_id: &str) -> PipelineResult<OficioAnalysis> {
        let prompt = analysis_prompt(text);

        for attempt in 0..CHAT_ATTEMPTS {
            match self.chat_once(&prompt).await {
                Ok(reply) => {
                    tracing::info!("Analysis for {} answered on attempt {}", job_id, attempt + 1);
                    return Ok(parse_analysis_reply(&reply));
                }
                Err(ChatFailure::RateLimited) => {
                    let wait = self.rate_limit_wait * (attempt + 1);
                    tracing::warn!("Rate limited analysing {}, waiting {:?}", job_id, wait);
                    tokio::time::sleep(wait).await;
                }
                Err(ChatFailure::Status(status, body)) => {
                    tracing::warn!("Analysis for {} failed with {}: {}", job_id, status, body);
                }
                Err(ChatFailure::Transport(e)) => {
                    tracing::warn!("Analysis request for {} failed: {}", job_id, e);
                }
                Err(ChatFailure::Empty) => {
                    tracing::warn!("Analysis for {} returned no choices", job_id);
                }
            }
        }

        Err(PipelineError::Analysis(format!(
            "No response from analysis model after {} attempts",
            CHAT_ATTEMPTS
        )))
    }
}

fn analysis_prompt(text: &str) -> String {
    let body: String = text.chars().take(MAX_PROMPT_CHARS).collect();
    format!(
        r#"Eres un experto en análisis de oficios legales panameños dirigidos a entidades bancarias.

Analiza el siguiente documento y responde ÚNICAMENTE con un objeto JSON con esta estructura:

{{
  "palabras_clave_encontradas": ["lista de palabras clave legales encontradas"],
  "tipo_oficio_detectado": "tipo de oficio (embargo, secuestro, levantamiento, citación, investigación u otro)",
  "nivel_confianza": "alto | medio | bajo",
  "informacion_extraida": {{
    "numero_oficio": "número del oficio",
    "autoridad": "autoridad que emite el oficio",
    "fecha_emision": "fecha de emisión",
    "fecha_recibido": "fecha de recibido",
    "oficiado_cliente": "cliente o entidad oficiada",
    "numero_identificacion": "cédula o RUC principal",
    "expediente": "número de expediente",
    "fecha_auto": "fecha del auto",
    "numero_auto": "número del auto",
    "monto": "monto indicado",
    "sucursal_recibido": "sucursal que recibió el oficio",
    "carpeta": "carpeta o referencia interna",
    "vencimiento": "fecha de vencimiento o plazo",
    "personas": [
      {{
        "nombre": "nombre completo",
        "tipo": "Deudor | Fiador | Testigo | Abogado | Otro",
        "identificacion": "cédula o documento",
        "rol": "rol en el proceso"
      }}
    ]
  }},
  "lista_autos": [
    {{
      "fecha_auto": "fecha del auto",
      "numero_auto_placa": "número del auto o placa",
      "monto_auto": "monto del auto"
    }}
  ]
}}

Usa null para los campos que no aparezcan en el documento.

DOCUMENTO:
{}"#,
        body
    )
}

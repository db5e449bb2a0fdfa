use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::intake::BatchMetadata;

pub const MAX_PDF_BYTES: usize = 50 * 1024 * 1024;
pub const MIN_PDF_BYTES: usize = 1024;
const MAX_REASONABLE_COUNT: u32 = 1000;

/// How a count difference between declared and extracted oficios is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountPolicy {
    /// Any non-zero extraction proceeds, differences only warn.
    #[default]
    Lenient,
    /// Differences above 10% of the declared count (minimum 1) halt the batch.
    Tolerance,
}

impl std::str::FromStr for CountPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lenient" => Ok(CountPolicy::Lenient),
            "tolerance" => Ok(CountPolicy::Tolerance),
            other => anyhow::bail!("Unknown count policy: {} (expected lenient or tolerance)", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantityStatus {
    Exact,
    Partial,
    Mismatch,
    NoDeclaration,
}

impl QuantityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuantityStatus::Exact => "exact_match",
            QuantityStatus::Partial => "partial_match",
            QuantityStatus::Mismatch => "mismatch",
            QuantityStatus::NoDeclaration => "no_declaration_proceeding",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Proceed,
    ProceedWithWarning,
    HaltAndNotify,
}

impl Action {
    pub fn proceeds(&self) -> bool {
        !matches!(self, Action::HaltAndNotify)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantityReport {
    pub declared: u32,
    pub extracted: u32,
    pub difference: u32,
    pub tolerance: u32,
    pub status: QuantityStatus,
    pub action: Action,
    pub message: String,
}

/// 10% of the declared count, at least 1.
pub fn tolerance_for(declared: u32) -> u32 {
    (declared / 10).max(1)
}

/// Classifies the extracted count against the declared one and picks the action.
pub fn validate_quantity(declared: u32, extracted: u32, policy: CountPolicy) -> QuantityReport {
    let difference = declared.abs_diff(extracted);
    let tolerance = tolerance_for(declared);

    let (status, action, message) = if extracted == 0 {
        let message = if declared == 0 {
            "No se pudieron extraer oficios del PDF. Verifique el formato del archivo.".to_string()
        } else {
            format!(
                "No se encontraron oficios. Se declararon {} pero no se pudieron extraer.",
                declared
            )
        };
        (QuantityStatus::Mismatch, Action::HaltAndNotify, message)
    } else if declared == 0 {
        (
            QuantityStatus::NoDeclaration,
            Action::ProceedWithWarning,
            format!("No se declaró cantidad, procesando {} oficios encontrados", extracted),
        )
    } else if declared == extracted {
        (
            QuantityStatus::Exact,
            Action::Proceed,
            format!("Cantidad declarada coincide: {} oficios", extracted),
        )
    } else if policy == CountPolicy::Tolerance && difference > tolerance {
        (
            QuantityStatus::Mismatch,
            Action::HaltAndNotify,
            format!(
                "Diferencia excede tolerancia: declarados {}, extraídos {} (diferencia: {}, tolerancia: {})",
                declared, extracted, difference, tolerance
            ),
        )
    } else {
        (
            QuantityStatus::Partial,
            Action::ProceedWithWarning,
            format!("Procesando {} oficios de {} declarados", extracted, declared),
        )
    };

    match action {
        Action::Proceed => tracing::info!("Quantity check: {}", message),
        Action::ProceedWithWarning => tracing::warn!("Quantity check: {}", message),
        Action::HaltAndNotify => tracing::error!("Quantity check: {}", message),
    }

    QuantityReport {
        declared,
        extracted,
        difference,
        tolerance,
        status,
        action,
        message,
    }
}

/// Size and structure checks on raw PDF bytes.
pub fn validate_pdf_bytes(bytes: &[u8]) -> PipelineResult<()> {
    if bytes.len() > MAX_PDF_BYTES {
        return Err(PipelineError::Validation(format!(
            "PDF too large: {} bytes (max: {})",
            bytes.len(),
            MAX_PDF_BYTES
        )));
    }
    if bytes.len() < MIN_PDF_BYTES {
        return Err(PipelineError::Validation(format!(
            "PDF too small: {} bytes (min: {})",
            bytes.len(),
            MIN_PDF_BYTES
        )));
    }
    if !bytes.starts_with(b"%PDF-") {
        return Err(PipelineError::Validation(
            "Invalid PDF file: missing PDF header".to_string(),
        ));
    }
    if !bytes.windows(5).any(|w| w == b"%%EOF") {
        return Err(PipelineError::Validation(
            "Invalid PDF file: missing EOF marker".to_string(),
        ));
    }
    Ok(())
}

/// Required fields must be present; returns warnings for values that look wrong.
pub fn validate_metadata(metadata: &BatchMetadata) -> PipelineResult<Vec<String>> {
    let empresa = metadata.empresa.trim();
    if empresa.is_empty() || empresa == crate::intake::NOT_SPECIFIED {
        return Err(PipelineError::Metadata(
            "Campos requeridos faltantes: empresa".to_string(),
        ));
    }

    let mut warnings = Vec::new();
    if metadata.declared_count > MAX_REASONABLE_COUNT {
        warnings.push(format!("Cantidad de oficios inusual: {}", metadata.declared_count));
    }
    if empresa.chars().count() < 3 {
        warnings.push("Nombre de empresa muy corto".to_string());
    }
    for w in &warnings {
        tracing::warn!("Metadata warning: {}", w);
    }
    Ok(warnings)
}

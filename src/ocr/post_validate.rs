//! Second look at the OCR text when the analysis found nobody but the
//! document clearly lists people (tables of names, IDs and amounts).

use once_cell::sync::Lazy;
use regex::Regex;

use super::{OcrResult, PersonList, Persona, PersonsCheck};

pub const FALLBACK_WARNING: &str =
    "\nADVERTENCIA: Personas extraídas mediante fallback desde texto. Validar manualmente.";

static TABLE_INDICATORS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"agente\s+econ[oó]mico",
        r"empleador",
        r"n[°º]\s*exp",
        r"\br\.?u\.?c\b",
        r"\bc\.?i\.?p\b",
        r"monto\s+b/",
        r"\|\s*nombre",
        r"tabla.*persona",
        r"listado.*cliente",
        r"\d+-\d+-\d+.*\d+[,.]\d+",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){}", p)).expect("valid table indicator"))
    .collect()
});

/// Name, then an ID like `8-947-865`, then an amount closing the line.
static PERSON_ROW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)([A-ZÁ-ÚÑ][A-ZÁ-ÚÑ \t.,/]+)[ \t]*\|?[ \t]*(\d+-\d+-\d+[^|\n]*?)[ \t]*\|?[ \t]*([\d,]+\.?\d*)[ \t]*$",
    )
    .expect("valid person row regex")
});

pub fn should_have_persons(text: &str) -> bool {
    TABLE_INDICATORS.iter().any(|re| {
        let hit = re.is_match(text);
        if hit {
            tracing::debug!("Person table indicator matched: {}", re.as_str());
        }
        hit
    })
}

pub fn extract_persons_from_text(text: &str) -> Vec<Persona> {
    PERSON_ROW
        .captures_iter(text)
        .map(|caps| {
            let amount = caps[3].replace(',', "");
            Persona {
                nombre: caps[1].trim().to_string(),
                tipo: Some("Extraído del texto".to_string()),
                identificacion: Some(caps[2].trim().to_string()),
                rol: None,
                monto: Some(amount.parse::<f64>().unwrap_or(0.0)),
            }
        })
        .collect()
}

pub fn check_persons(text: &str, persons: &[Persona]) -> (PersonsCheck, Vec<Persona>) {
    let mut check = PersonsCheck {
        personas_count: persons.len(),
        should_have_persons: should_have_persons(text),
        validation_passed: true,
        warnings: Vec::new(),
        extracted_from_text: 0,
    };

    if !check.should_have_persons || !persons.is_empty() {
        return (check, Vec::new());
    }

    tracing::warn!("Document appears to list persons but none were extracted");
    check.validation_passed = false;
    check
        .warnings
        .push("Documento contiene tabla de personas pero no se extrajeron".to_string());

    let extracted = extract_persons_from_text(text);
    if !extracted.is_empty() {
        check.extracted_from_text = extracted.len();
        check.warnings.push(format!(
            "Se detectaron {} personas en el texto que no fueron extraídas",
            extracted.len()
        ));
    }
    (check, extracted)
}

/// Fills `lista_personas` and, when the analysis missed a person table, falls
/// back to rows read straight from the text and flags the result for review.
pub fn enrich(result: &mut OcrResult) {
    let (check, extracted) = check_persons(&result.texto_completo, &result.analysis.informacion_extraida.personas);

    let listado = if extracted.is_empty() {
        result.analysis.informacion_extraida.personas.clone()
    } else {
        tracing::info!("Using {} persons read from text for {}", extracted.len(), result.job_id);
        result.observaciones.push_str(FALLBACK_WARNING);
        result.requires_review = true;
        extracted
    };

    let monto_total = listado.iter().filter_map(|p| p.monto).sum();
    result.lista_personas = PersonList { listado, monto_total };
    if !check.validation_passed {
        result.requires_review = true;
    }
    result.persons_check = check;
}

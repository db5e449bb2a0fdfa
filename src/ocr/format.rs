use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use super::{post_validate, AutoRecord, ExtractedInfo, OcrOutput, OcrResult, OficioAnalysis, Persona};
use crate::queue::OcrJob;

static CURRENCY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"\$[\d,]+\.?\d*", r"(?i)[\d,]+\.?\d*\s*pesos", r"(?i)[\d,]+\.?\d*\s*usd"]
        .iter()
        .map(|p| Regex::new(p).expect("valid currency regex"))
        .collect()
});

static DATE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"\d{1,2}/\d{1,2}/\d{4}", r"\d{4}-\d{1,2}-\d{1,2}", r"\d{1,2}-\d{1,2}-\d{4}"]
        .iter()
        .map(|p| Regex::new(p).expect("valid date regex"))
        .collect()
});

/// First currency-looking token, or the trimmed input.
pub fn extract_currency(text: &str) -> String {
    CURRENCY_PATTERNS
        .iter()
        .find_map(|re| re.find(text))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| text.trim().to_string())
}

pub fn extract_date(text: &str) -> Option<String> {
    DATE_PATTERNS
        .iter()
        .find_map(|re| re.find(text))
        .map(|m| m.as_str().to_string())
}

fn clean_value(value: &mut Option<String>) {
    if let Some(v) = value.as_mut() {
        *v = v.split_whitespace().collect::<Vec<_>>().join(" ");
    }
    if value.as_deref() == Some("") {
        *value = None;
    }
}

fn clean_date(value: &mut Option<String>) {
    if let Some(found) = value.as_deref().and_then(extract_date) {
        *value = Some(found);
    }
}

fn clean_person(person: &mut Persona) {
    person.nombre = person.nombre.split_whitespace().collect::<Vec<_>>().join(" ");
    if person.tipo.is_none() {
        person.tipo = Some("Persona".to_string());
    }
    if person.rol.is_none() {
        person.rol = Some("No especificado".to_string());
    }
    clean_value(&mut person.identificacion);
}

fn clean_auto(auto: &mut AutoRecord) {
    clean_date(&mut auto.fecha_auto);
    clean_value(&mut auto.numero_auto_placa);
    auto.monto_auto = auto.monto_auto.as_deref().map(extract_currency).filter(|m| !m.is_empty());
}

/// Normalizes the loosely formatted fields a model returns.
pub fn clean_info(info: &mut ExtractedInfo) {
    for field in [
        &mut info.numero_oficio,
        &mut info.autoridad,
        &mut info.oficiado_cliente,
        &mut info.numero_identificacion,
        &mut info.expediente,
        &mut info.numero_auto,
        &mut info.sucursal_recibido,
        &mut info.carpeta,
    ] {
        clean_value(field);
    }
    for field in [
        &mut info.fecha_emision,
        &mut info.fecha_recibido,
        &mut info.fecha_auto,
        &mut info.vencimiento,
    ] {
        clean_date(field);
    }
    info.monto = info.monto.as_deref().map(extract_currency).filter(|m| !m.is_empty());
    info.personas.iter_mut().for_each(clean_person);
}

pub fn build_result(job: &OcrJob, output: &OcrOutput, mut analysis: OficioAnalysis, now: DateTime<Utc>) -> OcrResult {
    clean_info(&mut analysis.informacion_extraida);
    analysis.lista_autos.iter_mut().for_each(clean_auto);

    let mut result = OcrResult {
        job_id: job.job_id.clone(),
        batch_id: job.batch_id.clone(),
        texto_completo: output.text.clone(),
        ocr: output.into(),
        analysis,
        lista_personas: Default::default(),
        persons_check: Default::default(),
        observaciones: job.metadata.observaciones.clone(),
        requires_review: false,
        metadata: job.metadata.clone(),
        processed_at: now,
    };
    post_validate::enrich(&mut result);
    if result.analysis.nivel_confianza == "bajo" {
        result.requires_review = true;
    }
    result
}

use once_cell::sync::Lazy;
use regex::Regex;

use super::{BatchMetadata, IntakeSource, DEFAULT_OPERATOR};

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("Invalid cover page regex"))
        .collect()
}

// Values stop at the end of the line or where the next label begins.
static COUNT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?im)cantidad_oficios\s*:\s*(\d+)",
        r"(?im)(?:cantidad_oficios|cantidad\s+oficios|oficios)\s*:?\s*(\d+)",
        r"(?im)(\d+)\s*oficios",
        r"(?im)(?:total|son|contiene)\s*(\d+)\s*(?:oficios|documentos)",
    ])
});
static EMPRESA_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?im)empresa\s*:\s*([a-záéíóúñ\s]+?)(?:\n|origen|cantidad|observaciones|procesado|$)",
        r"(?im)(?:empresa|compañia|organizacion)\s*:?\s*([a-záéíóúñ\s]+?)(?:\n|origen|cantidad|observaciones|procesado|$)",
    ])
});
static ORIGEN_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?im)origen\s*:\s*([a-záéíóúñ\s]+?)(?:\n|empresa|cantidad|observaciones|procesado|$)",
        r"(?im)(?:origen|enviado\s+desde|ubicacion|provincia)\s*:?\s*([a-záéíóúñ\s]+?)(?:\n|empresa|cantidad|observaciones|procesado|$)",
    ])
});
static OBSERVACIONES_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?im)observaciones\s*:\s*([a-záéíóúñ\s]+?)(?:\n|empresa|origen|cantidad|procesado|$)",
        r"(?im)(?:observaciones|comentarios|notas)\s*:?\s*([a-záéíóúñ\s]+?)(?:\n|empresa|origen|cantidad|procesado|$)",
    ])
});
static OPERADOR_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?im)procesado\s+por\s*:\s*([a-záéíóúñ\s]+?)(?:\n|empresa|origen|cantidad|observaciones|$)",
        r"(?im)(?:operador|usuario|responsable|procesado\s+por)\s*:?\s*([a-záéíóúñ\s]+?)(?:\n|empresa|origen|cantidad|observaciones|$)",
    ])
});
static FILE_NAME_OPERATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([a-zA-ZáéíóúÁÉÍÓÚñÑ]+)").expect("Invalid file name regex"));

fn first_capture(patterns: &[Regex], text: &str) -> Option<String> {
    patterns
        .iter()
        .find_map(|re| re.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Leading letters of the file name, e.g. `edwin_20250103.pdf` -> `edwin`.
pub fn operator_from_file_name(file_name: &str) -> Option<String> {
    let stem = std::path::Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())?;
    FILE_NAME_OPERATOR
        .captures(stem)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Reads batch settings printed on the first page of an uploaded bundle.
pub fn extract_metadata(first_page: &str, file_name: &str) -> BatchMetadata {
    let text = first_page.to_lowercase();
    let mut meta = BatchMetadata {
        source: IntakeSource::Upload,
        file_name: file_name.to_string(),
        ..BatchMetadata::default()
    };

    if let Some(count) = first_capture(&COUNT_PATTERNS, &text).and_then(|c| c.parse().ok()) {
        meta.declared_count = count;
    }
    if let Some(empresa) = first_capture(&EMPRESA_PATTERNS, &text) {
        if empresa.chars().count() > 3 {
            meta.empresa = empresa;
        }
    }
    if let Some(origen) = first_capture(&ORIGEN_PATTERNS, &text) {
        meta.origen = origen;
    }
    if let Some(obs) = first_capture(&OBSERVACIONES_PATTERNS, &text) {
        meta.observaciones = obs;
    }
    if let Some(op) = first_capture(&OPERADOR_PATTERNS, &text) {
        meta.operador = op;
    }
    if meta.operador == DEFAULT_OPERATOR {
        if let Some(op) = operator_from_file_name(file_name) {
            meta.operador = op;
        }
    }

    tracing::info!(
        declared = meta.declared_count,
        empresa = %meta.empresa,
        operador = %meta.operador,
        "Read cover page settings"
    );
    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::NOT_SPECIFIED;

    #[test]
    fn reads_labelled_settings() {
        let page = "CONFIGURACIÓN DEL LOTE\nCANTIDAD_OFICIOS: 15\nEMPRESA: Banco Nacional\nORIGEN: Colon\nOBSERVACIONES: revisar montos\nPROCESADO POR: Maria";
        let meta = extract_metadata(page, "lote.pdf");
        assert_eq!(meta.declared_count, 15);
        assert_eq!(meta.empresa, "banco nacional");
        assert_eq!(meta.origen, "colon");
        assert_eq!(meta.observaciones, "revisar montos");
        assert_eq!(meta.operador, "maria");
        assert_eq!(meta.source, IntakeSource::Upload);
    }

    #[test]
    fn values_on_one_line_stop_at_next_label() {
        let meta = extract_metadata("empresa: banco azul origen: david cantidad_oficios: 4", "x.pdf");
        assert_eq!(meta.empresa, "banco azul");
        assert_eq!(meta.origen, "david");
        assert_eq!(meta.declared_count, 4);
    }

    #[test]
    fn operator_falls_back_to_file_name() {
        let meta = extract_metadata("sin datos", "edwinpeñalba_20250103.pdf");
        assert_eq!(meta.operador, "edwinpeñalba");
        assert_eq!(meta.empresa, NOT_SPECIFIED);
        assert_eq!(meta.declared_count, 0);
    }

    #[test]
    fn file_name_without_letters_gives_no_operator() {
        assert_eq!(operator_from_file_name("20250103.pdf"), None);
        assert_eq!(operator_from_file_name("uploads/ana-lote.pdf").as_deref(), Some("ana"));
    }
}

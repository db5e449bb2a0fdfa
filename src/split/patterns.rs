use once_cell::sync::Lazy;
use regex::Regex;

/// Pages longer than this (after trimming) are never separators.
pub const SEPARATOR_MAX_CHARS: usize = 100;
/// Pages shorter than this (after trimming) never start a document.
pub const START_MIN_CHARS: usize = 50;
/// Lines inspected at the top of a page when looking for a document start.
pub const START_HEAD_LINES: usize = 5;

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("Invalid built-in splitting regex"))
        .collect()
}

pub static SEPARATOR_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)separador\s+de\s+oficios",
        r"(?i)={5,}\s*separador",
        r"(?i)nueva?\s+oficio",
        r"(?i)fin\s+de\s+oficio",
        r"(?i)separador\s+oficios",
        r"(?i)^\s*separador\s*$",
        r"^\s*={10,}\s*$",
        r"^\s*-{10,}\s*$",
    ])
});

pub static DOCUMENT_START_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"oficio\s+n[°º]?\s*\d+",
        r"juzgado\s+.+\s+de\s+.+",
        r"tribunal\s+.+",
        r"autoridad\s+competente",
        r"ref\s*[:.]?\s*expediente",
        r"exp\s*[:.]?\s*\d+",
        r"mediante\s+la\s+presente",
        r"por\s+medio\s+de\s+la\s+presente",
        r"fecha\s*[:.]?\s*\d{1,2}[/\-]\d{1,2}[/\-]\d{2,4}",
        r"despacho\s+judicial",
        r"sala\s+.+\s+de\s+.+",
        r"corte\s+suprema",
    ])
});

/// Keywords that mark the first page of an upload as a batch cover sheet.
pub const COVER_PAGE_KEYWORDS: &[&str] = &["cantidad_oficios", "empresa", "configuración", "lote"];

/// Keyword table for the coarse document type, checked top to bottom.
pub const DOCUMENT_TYPE_KEYWORDS: &[(&str, &[&str])] = &[
    ("embargo_secuestro", &["embargo", "secuestro", "retención"]),
    ("citacion", &["citación", "comparecer", "audiencia"]),
    ("levantamiento", &["levantamiento", "desbloqueo"]),
    ("allanamiento", &["allanamiento", "registro"]),
    ("investigacion", &["investigación", "información"]),
];

pub const GENERAL_DOCUMENT_TYPE: &str = "oficio_general";

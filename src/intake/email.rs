use mail_parser::{MessageParser, MimeHeaders};
use once_cell::sync::Lazy;
use regex::Regex;

use super::{BatchMetadata, IntakeSource, NOT_SPECIFIED, UNKNOWN_EMAIL};
use crate::error::{PipelineError, PipelineResult};

pub struct PdfAttachment {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// The parts of an inbound email the pipeline cares about.
pub struct InboundEmail {
    pub subject: String,
    pub from: String,
    pub date: Option<String>,
    pub body: String,
    pub attachments: Vec<PdfAttachment>,
}

impl InboundEmail {
    pub fn first_pdf(&self) -> Option<&PdfAttachment> {
        self.attachments.first()
    }
}

pub fn parse_email(raw: &[u8]) -> PipelineResult<InboundEmail> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| PipelineError::Metadata("Failed to parse email message".to_string()))?;

    let from = message
        .header_raw("From")
        .map(|s| s.trim().to_string())
        .or_else(|| {
            message
                .from()
                .and_then(|addrs| addrs.first())
                .and_then(|addr| addr.address())
                .map(|s| s.to_string())
        })
        .unwrap_or_default();

    let attachments = message
        .attachments()
        .filter_map(|att| {
            let name = att.attachment_name().unwrap_or("").to_string();
            let is_pdf_type = att
                .content_type()
                .map(|ct| {
                    ct.ctype().eq_ignore_ascii_case("application")
                        && ct.subtype().is_some_and(|s| s.eq_ignore_ascii_case("pdf"))
                })
                .unwrap_or(false);
            if !(name.to_lowercase().ends_with(".pdf") || is_pdf_type) {
                return None;
            }
            let file_name = if name.is_empty() { "adjunto.pdf".to_string() } else { name };
            Some(PdfAttachment {
                file_name,
                bytes: att.contents().to_vec(),
            })
        })
        .collect::<Vec<_>>();

    let body = message
        .body_text(0)
        .map(|s| s.to_string())
        .unwrap_or_default();

    tracing::info!(
        "Parsed email: {} PDF attachments, body {} chars",
        attachments.len(),
        body.len()
    );

    Ok(InboundEmail {
        subject: message.subject().unwrap_or("").to_string(),
        from,
        date: message
            .header_raw("Date")
            .map(|s| s.trim().to_string()),
        body,
        attachments,
    })
}

static BRACKETED_EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<([a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,})>").expect("Invalid email regex")
});
static BARE_EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,})").expect("Invalid email regex")
});

/// Address from a From header, lowercased; `unknown@email.com` when none is found.
pub fn extract_sender(from_header: &str) -> String {
    [&*BRACKETED_EMAIL, &*BARE_EMAIL]
        .iter()
        .find_map(|re| re.captures(from_header))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_lowercase())
        .unwrap_or_else(|| {
            tracing::warn!("Could not find an address in From header: {}", from_header);
            UNKNOWN_EMAIL.to_string()
        })
}

const KNOWN_DOMAINS: &[(&str, &str)] = &[
    ("gmail.com", "Cliente Gmail"),
    ("hotmail.com", "Cliente Hotmail"),
    ("outlook.com", "Cliente Outlook"),
    ("yahoo.com", "Cliente Yahoo"),
    ("globalbank.com.pa", "Global Bank"),
    ("bancoazteca.com.pa", "Banco Azteca"),
    ("bancogeneral.com", "Banco General"),
    ("bac.net", "BAC"),
    ("citi.com", "Citibank"),
    ("cibernetica.net", "Cibernética"),
];

/// Company name guessed from the sender's domain.
pub fn company_from_address(address: &str) -> String {
    let domain = match address.split_once('@') {
        Some((_, domain)) if address != UNKNOWN_EMAIL => domain.to_lowercase(),
        _ => return NOT_SPECIFIED.to_string(),
    };

    if let Some((_, name)) = KNOWN_DOMAINS.iter().find(|(d, _)| *d == domain) {
        return name.to_string();
    }

    match domain.split_once('.') {
        Some((label, _)) => capitalize(label),
        None => format!("Cliente {}", domain),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
        None => String::new(),
    }
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("Invalid email body regex"))
        .collect()
}

static EMPRESA_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?im)(?:empresa|compañia|organizacion):\s*([^\n\r]+)",
        r"(?im)(?:empresa|compañia|organizacion)\s*([^\n\r]+)",
    ])
});
static COUNT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?im)(?:cantidad_oficios|cantidad\s+oficios|oficios):\s*(\d+)",
        r"(?im)(\d+)\s*oficios",
        r"(?im)(?:total|son|contiene)\s*(\d+)\s*(?:oficios|documentos)",
    ])
});
static ORIGEN_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[r"(?im)(?:origen|enviado\s+desde|ubicacion|provincia):\s*([^\n\r]+)"])
});
static OBSERVACIONES_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?im)(?:observaciones|comentarios|notas):\s*([^\n\r]+)",
        r"(?im)(?:obs|nota):\s*([^\n\r]+)",
    ])
});

/// First capture of the first pattern that matches.
fn first_capture(patterns: &[Regex], text: &str) -> Option<String> {
    patterns
        .iter()
        .find_map(|re| re.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Builds batch metadata from the envelope and the free-text body.
pub fn extract_metadata(email: &InboundEmail) -> BatchMetadata {
    let contact_email = extract_sender(&email.from);
    let body = email.body.trim().to_lowercase();

    let mut meta = BatchMetadata {
        source: IntakeSource::Email,
        empresa: company_from_address(&contact_email),
        contact_email,
        subject: email.subject.clone(),
        ..BatchMetadata::default()
    };

    if let Some(empresa) = first_capture(&EMPRESA_PATTERNS, &body) {
        if empresa.chars().count() > 3 {
            meta.empresa = empresa;
        }
    }
    if let Some(count) = first_capture(&COUNT_PATTERNS, &body).and_then(|c| c.parse().ok()) {
        meta.declared_count = count;
    }
    if let Some(origen) = first_capture(&ORIGEN_PATTERNS, &body) {
        meta.origen = origen;
    }
    if let Some(obs) = first_capture(&OBSERVACIONES_PATTERNS, &body) {
        meta.observaciones = obs;
    }
    if let Some(pdf) = email.first_pdf() {
        meta.file_name = pdf.file_name.clone();
    }

    tracing::info!(
        contact = %meta.contact_email,
        empresa = %meta.empresa,
        declared = meta.declared_count,
        "Extracted email metadata"
    );
    meta
}

#[cfg(test)]
mod tests {
    use super::*;

    const EML: &[u8] = b"From: Ana Perez <Ana.Perez@BancoGeneral.com>\r\n\
To: oficios@example.com\r\n\
Subject: Lote de oficios\r\n\
Date: Mon, 7 Apr 2025 10:00:00 +0000\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
\r\n\
--XYZ\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Buenos dias,\r\n\
Adjunto 3 oficios del juzgado.\r\n\
Origen: Ciudad de Panama\r\n\
Observaciones: urgente revisar\r\n\
--XYZ\r\n\
Content-Type: application/pdf; name=\"lote.pdf\"\r\n\
Content-Disposition: attachment; filename=\"lote.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQKJSVFT0YK\r\n\
--XYZ--\r\n";

    #[test]
    fn parses_envelope_body_and_pdf_attachment() {
        let email = parse_email(EML).unwrap();
        assert_eq!(email.subject, "Lote de oficios");
        assert!(email.body.contains("3 oficios"));
        let pdf = email.first_pdf().unwrap();
        assert_eq!(pdf.file_name, "lote.pdf");
        assert!(pdf.bytes.starts_with(b"%PDF-1.4"));
    }

    #[test]
    fn metadata_comes_from_sender_and_body() {
        let email = parse_email(EML).unwrap();
        let meta = extract_metadata(&email);
        assert_eq!(meta.source, IntakeSource::Email);
        assert_eq!(meta.contact_email, "ana.perez@bancogeneral.com");
        assert_eq!(meta.empresa, "Banco General");
        assert_eq!(meta.declared_count, 3);
        assert_eq!(meta.origen, "ciudad de panama");
        assert_eq!(meta.observaciones, "urgente revisar");
        assert_eq!(meta.file_name, "lote.pdf");
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(parse_email(b"").is_err());
    }

    #[test]
    fn sender_extraction_prefers_bracketed_address() {
        assert_eq!(extract_sender("Juan <JUAN@corp.com.pa>"), "juan@corp.com.pa");
        assert_eq!(extract_sender("juan@corp.com"), "juan@corp.com");
        assert_eq!(extract_sender("Sin correo"), UNKNOWN_EMAIL);
    }

    #[test]
    fn company_inference_from_domain() {
        assert_eq!(company_from_address("x@gmail.com"), "Cliente Gmail");
        assert_eq!(company_from_address("x@bac.net"), "BAC");
        assert_eq!(company_from_address("x@caja-ahorros.com.pa"), "Caja-ahorros");
        assert_eq!(company_from_address("x@localhost"), "Cliente localhost");
        assert_eq!(company_from_address(UNKNOWN_EMAIL), NOT_SPECIFIED);
    }

    #[test]
    fn explicit_company_in_body_wins_when_long_enough() {
        let email = InboundEmail {
            subject: String::new(),
            from: "x@gmail.com".to_string(),
            date: None,
            body: "Empresa: Financiera Uno\nCantidad_oficios: 12".to_string(),
            attachments: Vec::new(),
        };
        let meta = extract_metadata(&email);
        assert_eq!(meta.empresa, "financiera uno");
        assert_eq!(meta.declared_count, 12);

        let short = InboundEmail {
            body: "empresa: bg".to_string(),
            ..email
        };
        assert_eq!(extract_metadata(&short).empresa, "Cliente Gmail");
    }
}

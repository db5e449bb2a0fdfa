//! Batch metadata gathered at intake: the email envelope and body, the cover
//! page of an uploaded bundle, or form fields sent to the API.

pub mod cover_page;
pub mod email;

use serde::{Deserialize, Serialize};

pub const NOT_SPECIFIED: &str = "No especificado";
pub const UNKNOWN_EMAIL: &str = "unknown@email.com";
pub const DEFAULT_OBSERVATIONS: &str = "Procesado automáticamente";
pub const DEFAULT_OPERATOR: &str = "Sistema";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntakeSource {
    Email,
    Upload,
}

impl IntakeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntakeSource::Email => "email",
            IntakeSource::Upload => "upload",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub source: IntakeSource,
    pub contact_email: String,
    pub empresa: String,
    /// 0 when the sender did not declare a count.
    pub declared_count: u32,
    pub origen: String,
    pub observaciones: String,
    pub operador: String,
    /// YYYY-MM-DD
    pub fecha_envio: String,
    pub subject: String,
    pub file_name: String,
}

impl Default for BatchMetadata {
    fn default() -> Self {
        Self {
            source: IntakeSource::Upload,
            contact_email: UNKNOWN_EMAIL.to_string(),
            empresa: NOT_SPECIFIED.to_string(),
            declared_count: 0,
            origen: NOT_SPECIFIED.to_string(),
            observaciones: DEFAULT_OBSERVATIONS.to_string(),
            operador: DEFAULT_OPERATOR.to_string(),
            fecha_envio: chrono::Utc::now().format("%Y-%m-%d").to_string(),
            subject: String::new(),
            file_name: String::new(),
        }
    }
}

impl BatchMetadata {
    pub fn has_contact(&self) -> bool {
        self.contact_email != UNKNOWN_EMAIL
    }
}

/// Values supplied explicitly by the uploader. They win over anything read from the PDF.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetadataOverrides {
    pub empresa: Option<String>,
    pub declared_count: Option<u32>,
    pub contact_email: Option<String>,
    pub origen: Option<String>,
    pub observaciones: Option<String>,
    pub operador: Option<String>,
}

impl MetadataOverrides {
    pub fn apply(self, meta: &mut BatchMetadata) {
        fn set(target: &mut String, value: Option<String>) {
            if let Some(v) = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
                *target = v;
            }
        }
        set(&mut meta.empresa, self.empresa);
        set(&mut meta.contact_email, self.contact_email.map(|e| e.to_lowercase()));
        set(&mut meta.origen, self.origen);
        set(&mut meta.observaciones, self.observaciones);
        set(&mut meta.operador, self.operador);
        if let Some(count) = self.declared_count {
            meta.declared_count = count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_only_given_non_empty_fields() {
        let mut meta = BatchMetadata {
            empresa: "Desde PDF".to_string(),
            declared_count: 3,
            ..BatchMetadata::default()
        };
        MetadataOverrides {
            empresa: Some("  Banco General ".to_string()),
            origen: Some("   ".to_string()),
            contact_email: Some("Ops@Banco.com".to_string()),
            ..MetadataOverrides::default()
        }
        .apply(&mut meta);

        assert_eq!(meta.empresa, "Banco General");
        assert_eq!(meta.origen, NOT_SPECIFIED);
        assert_eq!(meta.contact_email, "ops@banco.com");
        assert_eq!(meta.declared_count, 3);
        assert!(meta.has_contact());
    }
}

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;

use crate::validate::CountPolicy;

const APP_NAME: &str = "oficios";

/// Runtime configuration, read from the environment (and `.env` via dotenv).
#[derive(Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub bind_addr: String,

    pub mistral_api_key: Option<String>,
    pub mistral_base_url: String,
    pub ocr_model: String,
    pub chat_model: String,

    pub crm_endpoint: Option<String>,
    pub crm_api_key: Option<String>,
    pub crm_root_schema: String,

    pub notify_webhook: Option<String>,
    pub notify_from: String,
    pub operator_email: Option<String>,

    pub count_policy: CountPolicy,
    pub max_retries: u32,
    pub retry_base_minutes: i64,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("Config")
            .field("data_dir", &self.data_dir)
            .field("bind_addr", &self.bind_addr)
            .field("mistral_api_key", &redact(&self.mistral_api_key))
            .field("mistral_base_url", &self.mistral_base_url)
            .field("ocr_model", &self.ocr_model)
            .field("chat_model", &self.chat_model)
            .field("crm_endpoint", &self.crm_endpoint)
            .field("crm_api_key", &redact(&self.crm_api_key))
            .field("crm_root_schema", &self.crm_root_schema)
            .field("notify_webhook", &self.notify_webhook)
            .field("notify_from", &self.notify_from)
            .field("operator_email", &self.operator_email)
            .field("count_policy", &self.count_policy)
            .field("max_retries", &self.max_retries)
            .field("retry_base_minutes", &self.retry_base_minutes)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: Self::get_app_data_dir(),
            bind_addr: "127.0.0.1:8080".to_string(),
            mistral_api_key: None,
            mistral_base_url: "https://api.mistral.ai/v1".to_string(),
            ocr_model: "mistral-ocr-latest".to_string(),
            chat_model: "mistral-large-latest".to_string(),
            crm_endpoint: None,
            crm_api_key: None,
            crm_root_schema: "LegalDocumentRequest".to_string(),
            notify_webhook: None,
            notify_from: "Sistema de Procesamiento de Oficios".to_string(),
            operator_email: None,
            count_policy: CountPolicy::Lenient,
            max_retries: 3,
            retry_base_minutes: 5,
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env_opt(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid value for {}: {}", key, raw)),
        None => Ok(default),
    }
}

impl Config {
    /// Get the application data directory
    pub fn get_app_data_dir() -> PathBuf {
        let mut path = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(APP_NAME);
        path
    }

    pub fn from_env() -> Result<Config> {
        let defaults = Config::default();

        let data_dir = env_opt("OFICIOS_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let count_policy = match env_opt("OFICIOS_COUNT_POLICY") {
            Some(raw) => raw.parse()?,
            None => defaults.count_policy,
        };

        let config = Config {
            data_dir,
            bind_addr: env_opt("OFICIOS_BIND").unwrap_or(defaults.bind_addr),
            mistral_api_key: env_opt("MISTRAL_API_KEY"),
            mistral_base_url: env_opt("MISTRAL_BASE_URL").unwrap_or(defaults.mistral_base_url),
            ocr_model: env_opt("MISTRAL_OCR_MODEL").unwrap_or(defaults.ocr_model),
            chat_model: env_opt("MISTRAL_CHAT_MODEL").unwrap_or(defaults.chat_model),
            crm_endpoint: env_opt("CRM_API_ENDPOINT"),
            crm_api_key: env_opt("CRM_API_KEY"),
            crm_root_schema: env_opt("CRM_ROOT_SCHEMA").unwrap_or(defaults.crm_root_schema),
            notify_webhook: env_opt("NOTIFY_WEBHOOK_URL"),
            notify_from: env_opt("NOTIFY_FROM").unwrap_or(defaults.notify_from),
            operator_email: env_opt("OPERATOR_EMAIL"),
            count_policy,
            max_retries: env_parse("OFICIOS_MAX_RETRIES", defaults.max_retries)?,
            retry_base_minutes: env_parse("OFICIOS_RETRY_BASE_MINUTES", defaults.retry_base_minutes)?,
        };

        if let Some(endpoint) = &config.crm_endpoint {
            url::Url::parse(endpoint)
                .map_err(|e| anyhow::anyhow!("CRM_API_ENDPOINT is not a valid URL: {}", e))?;
        }

        Ok(config)
    }

    /// Create the data directory and warn about integrations that are not configured.
    pub fn prepare(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)?;
        }
        if self.mistral_api_key.is_none() {
            tracing::warn!("MISTRAL_API_KEY not set; OCR falls back to the PDF text layer");
        }
        if self.crm_endpoint.is_none() {
            tracing::warn!("CRM_API_ENDPOINT not set; jobs complete after OCR");
        }
        if self.notify_webhook.is_none() {
            tracing::warn!("NOTIFY_WEBHOOK_URL not set; notifications go to the pending outbox");
        }
        Ok(())
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.data_dir.join("objects")
    }

    pub fn queue_dir(&self, name: &str) -> PathBuf {
        self.data_dir.join("queues").join(name)
    }

    pub fn tracking_path(&self) -> PathBuf {
        self.data_dir.join("tracking.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_mistral() {
        let config = Config::default();
        assert_eq!(config.mistral_base_url, "https://api.mistral.ai/v1");
        assert_eq!(config.max_retries, 3);
        assert!(config.data_dir.ends_with(APP_NAME));
        assert!(config.crm_endpoint.is_none());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = Config {
            mistral_api_key: Some("sk-secret".to_string()),
            crm_api_key: Some("crm-secret".to_string()),
            ..Config::default()
        };
        let printed = format!("{:?}", config);
        assert!(!printed.contains("sk-secret"));
        assert!(!printed.contains("crm-secret"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn derived_paths_live_under_data_dir() {
        let config = Config {
            data_dir: PathBuf::from("/tmp/oficios-test"),
            ..Config::default()
        };
        assert_eq!(config.objects_dir(), PathBuf::from("/tmp/oficios-test/objects"));
        assert_eq!(config.queue_dir("ocr"), PathBuf::from("/tmp/oficios-test/queues/ocr"));
    }
}

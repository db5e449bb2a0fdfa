//! Operator and sender notifications. Delivery problems never stop the
//! pipeline: anything that cannot be sent lands in the outbox.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};
use crate::intake::BatchMetadata;
use crate::storage::{keys, ObjectStore};
use crate::validate::QuantityReport;

const SIGNATURE: &str = "Sistema de Procesamiento Automático de Oficios";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// An undelivered notification waiting in the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingNotification {
    pub notification: Notification,
    pub queued_at: DateTime<Utc>,
    pub reason: String,
    #[serde(default)]
    pub attempts: u32,
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn html_page(title: &str, color: &str, rows: &[(&str, String)], footer: &str) -> String {
    let rows = rows
        .iter()
        .map(|(k, v)| format!("<tr><td><strong>{}</strong></td><td>{}</td></tr>", k, escape_html(v)))
        .collect::<Vec<_>>()
        .join("");
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body style=\"font-family:Arial,sans-serif\">\
         <h2 style=\"color:{color}\">{title}</h2>\
         <table cellpadding=\"6\">{rows}</table>\
         <p>{footer}</p><p><em>{SIGNATURE}</em></p></body></html>",
        title = escape_html(title),
        color = color,
        rows = rows,
        footer = escape_html(footer),
    )
}

pub fn batch_accepted(meta: &BatchMetadata, total_oficios: usize, batch_id: &str, validation_status: &str) -> Notification {
    let declared = if meta.declared_count > 0 {
        meta.declared_count.to_string()
    } else {
        "No declarada".to_string()
    };
    let text = format!(
        "Estimado cliente de {empresa},\n\n\
         Su lote de oficios ha sido recibido y separado correctamente.\n\n\
         RESUMEN:\n\
         - Lote ID: {batch_id}\n\
         - Oficios procesados: {total_oficios}\n\
         - Cantidad declarada: {declared}\n\
         - Validación: {validation_status}\n\
         - Origen: {origen}\n\n\
         Los oficios están siendo procesados por OCR y serán integrados al CRM.\n\n\
         {SIGNATURE}\n",
        empresa = meta.empresa,
        origen = meta.origen,
    );
    let html = html_page(
        "Lote Procesado Exitosamente",
        "#2e7d32",
        &[
            ("Empresa", meta.empresa.clone()),
            ("ID del Lote", batch_id.to_string()),
            ("Oficios procesados", total_oficios.to_string()),
            ("Cantidad declarada", declared),
            ("Validación", validation_status.to_string()),
            ("Origen", meta.origen.clone()),
        ],
        "Los oficios están siendo procesados por OCR y serán integrados al CRM.",
    );
    Notification {
        recipient: meta.contact_email.clone(),
        subject: format!("Lote Procesado Exitosamente - {}", meta.empresa),
        text,
        html,
    }
}

pub fn batch_rejected(meta: &BatchMetadata, report: &QuantityReport) -> Notification {
    let text = format!(
        "Estimado cliente de {empresa},\n\n\
         PROBLEMA DETECTADO: {message}\n\n\
         DETALLES:\n\
         - Cantidad declarada: {declared} oficios\n\
         - Cantidad encontrada: {extracted} oficios\n\
         - Diferencia: {difference} oficios\n\n\
         ACCIÓN REQUERIDA:\n\
         1. Verifique que la cantidad declarada sea correcta\n\
         2. Confirme que todos los oficios estén en el PDF\n\
         3. Revise los separadores entre oficios\n\n\
         Puede reenviar el lote una vez corregido.\n\n\
         {SIGNATURE}\n",
        empresa = meta.empresa,
        message = report.message,
        declared = report.declared,
        extracted = report.extracted,
        difference = report.difference,
    );
    let html = html_page(
        "Error en Procesamiento de Lote",
        "#c62828",
        &[
            ("Empresa", meta.empresa.clone()),
            ("Problema", report.message.clone()),
            ("Cantidad declarada", report.declared.to_string()),
            ("Cantidad encontrada", report.extracted.to_string()),
            ("Diferencia", report.difference.to_string()),
        ],
        "Verifique la cantidad declarada y los separadores entre oficios, luego reenvíe el lote.",
    );
    Notification {
        recipient: meta.contact_email.clone(),
        subject: format!("Error en Procesamiento de Lote - {}", meta.empresa),
        text,
        html,
    }
}

pub fn general_error(recipient: &str, subject: &str, message: &str) -> Notification {
    let text = format!(
        "Estimado cliente,\n\n\
         Ha ocurrido un error durante el procesamiento:\n\n\
         {message}\n\n\
         Por favor revise el formato de su envío y reintente, o contacte soporte si persiste.\n\n\
         {SIGNATURE}\n"
    );
    let html = html_page(
        "Error en Procesamiento",
        "#c62828",
        &[("Asunto", subject.to_string()), ("Detalle", message.to_string())],
        "Revise el formato de su envío y reintente, o contacte soporte si persiste.",
    );
    Notification {
        recipient: recipient.to_string(),
        subject: format!("Error en Procesamiento - {}", subject),
        text,
        html,
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> PipelineResult<()>;
}

/// Posts notifications as JSON to a mail relay webhook.
pub struct WebhookTransport {
    client: Client,
    url: String,
    from: String,
}

impl WebhookTransport {
    pub fn new(url: &str, from: &str) -> Self {
        Self {
            client: Client::new(),
            url: url.to_string(),
            from: from.to_string(),
        }
    }
}

#[async_trait]
impl Transport for WebhookTransport {
    async fn deliver(&self, n: &Notification) -> PipelineResult<()> {
        let body = serde_json::json!({
            "from": self.from,
            "to": n.recipient,
            "subject": n.subject,
            "text": n.text,
            "html": n.html,
        });
        let resp = self
            .client
            .post(&self.url)
            .timeout(std::time::Duration::from_secs(15))
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Notification(format!("Webhook request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(PipelineError::Notification(format!("Webhook returned {}", resp.status())));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub sent: usize,
    pub remaining: usize,
}

pub struct Notifier {
    transport: Option<Arc<dyn Transport>>,
    store: Arc<dyn ObjectStore>,
    operator_email: Option<String>,
}

impl Notifier {
    pub fn new(transport: Option<Arc<dyn Transport>>, store: Arc<dyn ObjectStore>, operator_email: Option<String>) -> Self {
        Self {
            transport,
            store,
            operator_email,
        }
    }

    pub fn from_config(config: &Config, store: Arc<dyn ObjectStore>) -> Self {
        let transport = config
            .notify_webhook
            .as_deref()
            .map(|url| Arc::new(WebhookTransport::new(url, &config.notify_from)) as Arc<dyn Transport>);
        Self::new(transport, store, config.operator_email.clone())
    }

    /// Recipient for a batch: the sender when known, else the operator.
    pub fn recipient_for(&self, meta: &BatchMetadata) -> Option<String> {
        if meta.has_contact() {
            Some(meta.contact_email.clone())
        } else {
            self.operator_email.clone()
        }
    }

    /// Delivers or stores the notification. Returns whether it went out now.
    pub async fn send(&self, notification: Notification) -> bool {
        let reason = match &self.transport {
            Some(transport) => match transport.deliver(&notification).await {
                Ok(()) => {
                    tracing::info!("Notification sent to {}: {}", notification.recipient, notification.subject);
                    return true;
                }
                Err(e) => {
                    tracing::warn!("Notification to {} failed: {}", notification.recipient, e);
                    e.to_string()
                }
            },
            None => "no_transport_configured".to_string(),
        };

        let pending = PendingNotification {
            notification,
            queued_at: Utc::now(),
            reason,
            attempts: 0,
        };
        if let Err(e) = self.save_pending(&pending).await {
            tracing::error!("Could not save pending notification: {}", e);
        }
        false
    }

    async fn save_pending(&self, pending: &PendingNotification) -> PipelineResult<()> {
        let id = format!(
            "{}_{}_{}",
            pending.queued_at.format("%Y%m%d_%H%M%S"),
            pending.notification.recipient.replace('@', "_at_"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let key = keys::pending_notification(&id);
        self.store.put_json(&key, &serde_json::to_value(pending)?).await?;
        tracing::info!("Notification saved for later delivery: {}", key);
        Ok(())
    }

    /// Retries everything in the outbox.
    pub async fn flush_pending(&self) -> PipelineResult<FlushReport> {
        let keys = self.store.list(keys::PENDING_NOTIFICATIONS).await?;
        let mut report = FlushReport::default();

        let Some(transport) = &self.transport else {
            report.remaining = keys.len();
            tracing::warn!("No notification transport configured, {} pending", report.remaining);
            return Ok(report);
        };

        for key in keys {
            let mut pending: PendingNotification = match self.store.get_json(&key).await {
                Ok(value) => match serde_json::from_value(value) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!("Skipping unreadable pending notification {}: {}", key, e);
                        report.remaining += 1;
                        continue;
                    }
                },
                Err(e) => {
                    tracing::warn!("Could not read {}: {}", key, e);
                    report.remaining += 1;
                    continue;
                }
            };

            match transport.deliver(&pending.notification).await {
                Ok(()) => {
                    self.store.delete(&key).await?;
                    report.sent += 1;
                }
                Err(e) => {
                    pending.attempts += 1;
                    pending.reason = e.to_string();
                    self.store.put_json(&key, &serde_json::to_value(&pending)?).await?;
                    report.remaining += 1;
                }
            }
        }

        tracing::info!("Flushed notifications: {} sent, {} remaining", report.sent, report.remaining);
        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use super::*;

    /// Records deliveries; fails while `fail` is set.
    #[derive(Default)]
    pub struct RecordingTransport {
        pub sent: Mutex<Vec<Notification>>,
        pub fail: Mutex<bool>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn deliver(&self, n: &Notification) -> PipelineResult<()> {
            if *self.fail.lock().unwrap() {
                return Err(PipelineError::Notification("relay down".to_string()));
            }
            self.sent.lock().unwrap().push(n.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingTransport;
    use super::*;
    use crate::storage::FsObjectStore;
    use crate::validate::{validate_quantity, CountPolicy};

    fn meta() -> BatchMetadata {
        BatchMetadata {
            contact_email: "legal@bancoxyz.com".to_string(),
            empresa: "Banco <XYZ>".to_string(),
            declared_count: 3,
            ..BatchMetadata::default()
        }
    }

    #[test]
    fn templates_carry_batch_details() {
        let ok = batch_accepted(&meta(), 3, "batch_1", "exact_match");
        assert_eq!(ok.recipient, "legal@bancoxyz.com");
        assert!(ok.subject.contains("Banco <XYZ>"));
        assert!(ok.text.contains("batch_1"));
        assert!(ok.html.contains("Banco &lt;XYZ&gt;"));

        let report = validate_quantity(3, 0, CountPolicy::Lenient);
        let bad = batch_rejected(&meta(), &report);
        assert!(bad.text.contains("Cantidad declarada: 3"));
        assert!(bad.subject.starts_with("Error en Procesamiento de Lote"));

        let err = general_error("ops@x.com", "Sin adjunto", "No se encontró PDF");
        assert_eq!(err.subject, "Error en Procesamiento - Sin adjunto");
    }

    #[tokio::test]
    async fn undeliverable_notifications_are_kept_and_flushed_later() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(dir.path()).unwrap());
        let transport = Arc::new(RecordingTransport::default());
        *transport.fail.lock().unwrap() = true;
        let notifier = Notifier::new(Some(transport.clone()), store.clone(), None);

        assert!(!notifier.send(batch_accepted(&meta(), 3, "batch_1", "exact_match")).await);
        assert_eq!(store.list(keys::PENDING_NOTIFICATIONS).await.unwrap().len(), 1);

        let report = notifier.flush_pending().await.unwrap();
        assert_eq!(report, FlushReport { sent: 0, remaining: 1 });

        *transport.fail.lock().unwrap() = false;
        let report = notifier.flush_pending().await.unwrap();
        assert_eq!(report, FlushReport { sent: 1, remaining: 0 });
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
        assert!(store.list(keys::PENDING_NOTIFICATIONS).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn without_transport_everything_goes_to_outbox() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(dir.path()).unwrap());
        let notifier = Notifier::new(None, store.clone(), Some("ops@bank.com".to_string()));

        assert!(!notifier.send(general_error("ops@bank.com", "x", "y")).await);
        assert_eq!(notifier.flush_pending().await.unwrap().remaining, 1);

        let unknown = BatchMetadata::default();
        assert_eq!(notifier.recipient_for(&unknown).as_deref(), Some("ops@bank.com"));
        assert_eq!(notifier.recipient_for(&meta()).as_deref(), Some("legal@bancoxyz.com"));
    }
}

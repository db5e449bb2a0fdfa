use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use super::{new_batch_id, oficio_id, AppState};
use crate::intake::{self, cover_page, email, BatchMetadata, IntakeSource, MetadataOverrides};
use crate::notify;
use crate::pdf::PdfBundle;
use crate::queue::{send_message, OcrJob, OficioRef};
use crate::split::{self, SplitPlan};
use crate::storage::keys;
use crate::tracking::{BatchStatus, BatchSummary, OficioRecord, OficioStatus};
use crate::validate::{self, QuantityReport};

const PREVIEW_CHARS: usize = 500;

/// What happened to one submitted bundle.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub batch_id: String,
    pub accepted: bool,
    pub reason: Option<String>,
    pub strategy: Option<String>,
    pub total_pages: usize,
    pub validation: Option<QuantityReport>,
    pub oficios: Vec<String>,
    pub warnings: Vec<String>,
    pub notified: bool,
}

impl IngestOutcome {
    fn rejected(batch_id: String, reason: String, notified: bool) -> Self {
        Self {
            batch_id,
            accepted: false,
            reason: Some(reason),
            strategy: None,
            total_pages: 0,
            validation: None,
            oficios: Vec::new(),
            warnings: Vec::new(),
            notified,
        }
    }
}

fn job_source(source: IntakeSource) -> &'static str {
    match source {
        IntakeSource::Email => "email_batch_validated",
        IntakeSource::Upload => "direct_upload",
    }
}

async fn notify_error(state: &AppState, meta: &BatchMetadata, subject: &str, message: &str) -> bool {
    match state.notifier.recipient_for(meta) {
        Some(to) => state.notifier.send(notify::general_error(&to, subject, message)).await,
        None => {
            tracing::warn!("No recipient for error notification: {}", message);
            false
        }
    }
}

/// Last path component of a client-supplied name, limited to characters safe in an object key.
fn safe_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let clean: String = base
        .chars()
        .map(|c| if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    let clean = clean.trim_start_matches('.');
    if clean.is_empty() {
        "upload.pdf".to_string()
    } else {
        clean.to_string()
    }
}

async fn load_bundle(bytes: Vec<u8>) -> anyhow::Result<(Vec<u8>, PdfBundle)> {
    let (bytes, bundle) = tokio::task::spawn_blocking(move || {
        let bundle = PdfBundle::load(&bytes);
        (bytes, bundle)
    })
    .await?;
    Ok((bytes, bundle?))
}

/// Intake from a raw RFC 822 message carrying the bundle as a PDF attachment.
pub async fn ingest_email(state: &AppState, raw: &[u8]) -> anyhow::Result<IngestOutcome> {
    let now = Utc::now();
    let batch_id = new_batch_id(now);

    // 1. Parse the message and read the body fields
    let message = email::parse_email(raw)?;
    let metadata = email::extract_metadata(&message);
    tracing::info!("Email from {} with subject {:?}", metadata.contact_email, message.subject);

    // 2. Find the bundle
    let Some(pdf) = message.first_pdf() else {
        let reason = format!("No se encontró un archivo PDF adjunto en el correo: {}", message.subject);
        tracing::warn!("{}", reason);
        let notified = notify_error(state, &metadata, "PDF no encontrado", &reason).await;
        return Ok(IngestOutcome::rejected(batch_id, reason, notified));
    };

    if let Err(e) = validate::validate_pdf_bytes(&pdf.bytes) {
        let reason = e.to_string();
        let notified = notify_error(state, &metadata, "PDF inválido", &reason).await;
        return Ok(IngestOutcome::rejected(batch_id, reason, notified));
    }

    let (bytes, bundle) = load_bundle(pdf.bytes.clone()).await?;
    process_bundle(state, batch_id, bytes, bundle, metadata).await
}

/// Intake from a direct upload. A leading cover sheet supplies metadata and is not split.
pub async fn ingest_pdf(
    state: &AppState,
    bytes: Vec<u8>,
    file_name: &str,
    overrides: MetadataOverrides,
) -> anyhow::Result<IngestOutcome> {
    let batch_id = new_batch_id(Utc::now());
    validate::validate_pdf_bytes(&bytes)?;
    let file_name = safe_file_name(file_name);
    let file_name = file_name.as_str();

    let (bytes, bundle) = load_bundle(bytes).await?;
    let mut metadata = if split::is_cover_page(bundle.page_texts()) {
        cover_page::extract_metadata(&bundle.page_texts()[0], file_name)
    } else {
        BatchMetadata {
            source: IntakeSource::Upload,
            file_name: file_name.to_string(),
            operador: cover_page::operator_from_file_name(file_name)
                .unwrap_or_else(|| intake::DEFAULT_OPERATOR.to_string()),
            ..BatchMetadata::default()
        }
    };
    overrides.apply(&mut metadata);

    process_bundle(state, batch_id, bytes, bundle, metadata).await
}

async fn process_bundle(
    state: &AppState,
    batch_id: String,
    bytes: Vec<u8>,
    bundle: PdfBundle,
    metadata: BatchMetadata,
) -> anyhow::Result<IngestOutcome> {
    let now = Utc::now();

    // 1. Metadata sanity
    let warnings = match validate::validate_metadata(&metadata) {
        Ok(w) => w,
        Err(e) => {
            let reason = e.to_string();
            tracing::warn!("Batch {} rejected: {}", batch_id, reason);
            let notified = notify_error(state, &metadata, "Metadatos inválidos", &reason).await;
            return Ok(IngestOutcome::rejected(batch_id, reason, notified));
        }
    };
    for w in &warnings {
        tracing::warn!("Batch {}: {}", batch_id, w);
    }

    let raw_key = keys::inbox(&format!("{}_{}", batch_id, safe_file_name(&metadata.file_name)));
    state.store.put(&raw_key, &bytes).await?;

    // 2. Split
    let plan: SplitPlan = match metadata.source {
        IntakeSource::Upload => split::plan_split_skipping_cover(bundle.page_texts(), metadata.declared_count),
        IntakeSource::Email => split::plan_split(bundle.page_texts(), metadata.declared_count),
    };
    tracing::info!(
        "Batch {}: {} oficios from {} pages using {}",
        batch_id,
        plan.count(),
        plan.total_pages,
        plan.strategy
    );

    // 3. Count check
    let report = validate::validate_quantity(metadata.declared_count, plan.count() as u32, state.config.count_policy);
    if !report.action.proceeds() {
        tracing::warn!("Batch {} halted: {}", batch_id, report.message);
        let log = json!({
            "batch_id": batch_id,
            "status": "validation_failed",
            "metadata": metadata,
            "validation": report,
            "split_strategy": plan.strategy.to_string(),
            "total_pages": plan.total_pages,
            "raw_key": raw_key,
            "logged_at": now,
        });
        state.store.put_json(&keys::failed_log(&batch_id), &log).await?;

        let notified = match state.notifier.recipient_for(&metadata) {
            Some(to) => {
                let mut n = notify::batch_rejected(&metadata, &report);
                n.recipient = to;
                state.notifier.send(n).await
            }
            None => false,
        };
        return Ok(IngestOutcome {
            batch_id,
            accepted: false,
            reason: Some(report.message.clone()),
            strategy: Some(plan.strategy.to_string()),
            total_pages: plan.total_pages,
            validation: Some(report),
            oficios: Vec::new(),
            warnings,
            notified,
        });
    }

    // 4. Cut and store each oficio
    let mut oficios = Vec::with_capacity(plan.count());
    let mut parts = Vec::with_capacity(plan.count());
    for (idx, range) in plan.ranges.iter().enumerate() {
        let sequence = idx as u32 + 1;
        let id = oficio_id(&batch_id, sequence);
        let storage_key = keys::oficio_pdf(&batch_id, &id);
        parts.push((storage_key.clone(), bundle.extract(*range)?));

        let preview = split::preview_text(bundle.page_texts(), *range, PREVIEW_CHARS);
        oficios.push(OficioRef {
            oficio_id: id,
            batch_id: batch_id.clone(),
            sequence_number: sequence,
            storage_key,
            page_range: *range,
            page_count: range.len() as u32,
            document_type: split::classify_document(&preview).to_string(),
            preview_text: preview,
        });
    }

    futures::future::try_join_all(parts.iter().map(|(key, data)| state.store.put(key, data))).await?;

    // 5. Tracking records
    let summary = BatchSummary {
        batch_id: batch_id.clone(),
        status: BatchStatus::Queued,
        status_message: String::new(),
        metadata: metadata.clone(),
        validation_status: report.status.as_str().to_string(),
        split_strategy: plan.strategy.to_string(),
        declared_count: metadata.declared_count,
        extracted_count: plan.count() as u32,
        total_oficios: 0,
        completed_oficios: 0,
        failed_oficios: 0,
        processing_oficios: 0,
        completion_rate: 0.0,
        created_at: now,
        processing_started_at: now,
        updated_at: now,
        completed_at: None,
    };
    let records = oficios.iter().map(|o| OficioRecord::new(o, now)).collect();
    state.tracking.create_batch(summary, records)?;

    // 6. Queue for OCR
    for oficio in &oficios {
        let job = OcrJob {
            job_id: oficio.oficio_id.clone(),
            batch_id: batch_id.clone(),
            oficio: oficio.clone(),
            metadata: metadata.clone(),
            source: job_source(metadata.source).to_string(),
            created_at: now,
            retry_attempt: 0,
        };
        let queued = async {
            state
                .store
                .put_json(&keys::job_input(&job.job_id), &serde_json::to_value(&job)?)
                .await?;
            send_message(state.ocr_queue.as_ref(), &job).await
        }
        .await;
        if let Err(e) = queued {
            tracing::error!("Could not queue {}: {}", job.job_id, e);
            let msg = format!("Queue error: {}", e);
            state
                .tracking
                .update_oficio(&batch_id, &job.job_id, |r| r.fail(OficioStatus::Error, &msg, Utc::now()))?;
        }
    }

    let log = json!({
        "batch_id": batch_id,
        "status": "queued",
        "metadata": metadata,
        "validation": report,
        "split_strategy": plan.strategy.to_string(),
        "total_pages": plan.total_pages,
        "skipped_cover": plan.skipped_cover,
        "raw_key": raw_key,
        "oficios": oficios,
        "warnings": warnings,
        "logged_at": now,
    });
    state.store.put_json(&keys::success_log(&batch_id), &log).await?;

    // 7. Tell the sender
    let notified = match state.notifier.recipient_for(&metadata) {
        Some(to) => {
            let mut n = notify::batch_accepted(&metadata, oficios.len(), &batch_id, report.status.as_str());
            n.recipient = to;
            state.notifier.send(n).await
        }
        None => false,
    };

    tracing::info!("Batch {} accepted with {} oficios", batch_id, oficios.len());
    Ok(IngestOutcome {
        batch_id,
        accepted: true,
        reason: None,
        strategy: Some(plan.strategy.to_string()),
        total_pages: plan.total_pages,
        validation: Some(report),
        oficios: oficios.into_iter().map(|o| o.oficio_id).collect(),
        warnings,
        notified,
    })
}

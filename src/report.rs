//! Batch status report: statistics, progress, timeline and error summary.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::tracking::{BatchSummary, OficioRecord, OficioStatus};

const MAX_ERROR_DETAILS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingTimes {
    pub average_seconds: f64,
    pub min_seconds: f64,
    pub max_seconds: f64,
    pub completed_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionPercentage {
    pub completed: f64,
    pub failed: f64,
    pub pending: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchStatistics {
    pub total_oficios: usize,
    pub by_status: BTreeMap<String, u32>,
    pub by_ocr_status: BTreeMap<String, u32>,
    pub by_crm_status: BTreeMap<String, u32>,
    pub processing_times: Option<ProcessingTimes>,
    pub completion_percentage: CompletionPercentage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub percentage: f64,
    pub phase: &'static str,
    pub completed: u32,
    pub processing: u32,
    pub pending: u32,
    pub failed: u32,
    pub estimated_completion: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEvent {
    pub timestamp: DateTime<Utc>,
    pub event: &'static str,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorDetail {
    pub oficio_id: String,
    pub error_type: String,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorSummary {
    pub total_errors: usize,
    pub error_details: Vec<ErrorDetail>,
    pub error_types: BTreeMap<String, u32>,
    pub has_more_errors: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub summary: BatchSummary,
    pub statistics: BatchStatistics,
    pub oficios: Vec<OficioRecord>,
    pub progress: Progress,
    pub timeline: Vec<TimelineEvent>,
    pub errors: ErrorSummary,
}

fn percent(part: u32, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

fn count_where(oficios: &[OficioRecord], pred: impl Fn(OficioStatus) -> bool) -> u32 {
    oficios.iter().filter(|o| pred(o.status)).count() as u32
}

fn is_waiting(s: OficioStatus) -> bool {
    matches!(s, OficioStatus::Pending | OficioStatus::Retrying)
}

pub fn statistics(oficios: &[OficioRecord]) -> BatchStatistics {
    let mut by_status = BTreeMap::new();
    let mut by_ocr_status = BTreeMap::new();
    let mut by_crm_status = BTreeMap::new();
    for o in oficios {
        *by_status.entry(o.status.as_str().to_string()).or_insert(0) += 1;
        *by_ocr_status.entry(o.ocr_status.clone()).or_insert(0) += 1;
        *by_crm_status.entry(o.crm_status.clone()).or_insert(0) += 1;
    }

    let times: Vec<f64> = oficios
        .iter()
        .filter(|o| o.status == OficioStatus::Completed)
        .filter_map(|o| o.completed_at.map(|done| (done - o.created_at).num_milliseconds() as f64 / 1000.0))
        .collect();
    let processing_times = (!times.is_empty()).then(|| ProcessingTimes {
        average_seconds: times.iter().sum::<f64>() / times.len() as f64,
        min_seconds: times.iter().cloned().fold(f64::INFINITY, f64::min),
        max_seconds: times.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        completed_count: times.len(),
    });

    let total = oficios.len();
    BatchStatistics {
        total_oficios: total,
        by_status,
        by_ocr_status,
        by_crm_status,
        processing_times,
        completion_percentage: CompletionPercentage {
            completed: percent(count_where(oficios, |s| s == OficioStatus::Completed), total),
            failed: percent(count_where(oficios, |s| s.is_failed()), total),
            pending: percent(count_where(oficios, |s| is_waiting(s) || s.is_active()), total),
        },
    }
}

pub fn progress(oficios: &[OficioRecord], stats: &BatchStatistics, now: DateTime<Utc>) -> Progress {
    let total = oficios.len();
    let completed = count_where(oficios, |s| s == OficioStatus::Completed);
    let processing = count_where(oficios, |s| s.is_active());
    let pending = count_where(oficios, is_waiting);
    let failed = count_where(oficios, |s| s.is_failed());

    let percentage = (percent(completed + failed, total) * 10.0).round() / 10.0;
    let phase = if total == 0 {
        "unknown"
    } else if percentage >= 100.0 {
        "completed"
    } else if processing > 0 {
        "processing"
    } else if pending > 0 {
        "queued"
    } else {
        "unknown"
    };

    let estimated_completion = match (&stats.processing_times, processing > 0) {
        (Some(times), true) => {
            let remaining = (pending + processing) as f64 * times.average_seconds;
            Some(now + Duration::milliseconds((remaining * 1000.0) as i64))
        }
        _ => None,
    };

    Progress {
        percentage,
        phase,
        completed,
        processing,
        pending,
        failed,
        estimated_completion,
    }
}

pub fn timeline(summary: &BatchSummary, oficios: &[OficioRecord]) -> Vec<TimelineEvent> {
    let mut events = vec![
        TimelineEvent {
            timestamp: summary.created_at,
            event: "batch_created",
            description: format!("Lote creado con {} oficios", summary.total_oficios),
        },
        TimelineEvent {
            timestamp: summary.processing_started_at,
            event: "processing_started",
            description: "Iniciado procesamiento OCR".to_string(),
        },
    ];

    let mut done: Vec<(&DateTime<Utc>, &str)> = oficios
        .iter()
        .filter(|o| o.status == OficioStatus::Completed)
        .filter_map(|o| o.completed_at.as_ref().map(|t| (t, o.oficio_id.as_str())))
        .collect();
    done.sort();
    if let Some((at, id)) = done.first() {
        events.push(TimelineEvent {
            timestamp: **at,
            event: "first_oficio_completed",
            description: format!("Primer oficio completado: {}", id),
        });
    }
    if done.len() > 1 {
        if let Some((at, id)) = done.last() {
            events.push(TimelineEvent {
                timestamp: **at,
                event: "last_oficio_completed",
                description: format!("Último oficio completado: {}", id),
            });
        }
    }

    if let Some(at) = summary.completed_at {
        events.push(TimelineEvent {
            timestamp: at,
            event: "batch_completed",
            description: format!("Lote completado con {:.1}% de éxito", summary.completion_rate),
        });
    }
    events.sort_by_key(|e| e.timestamp);
    events
}

pub fn error_summary(oficios: &[OficioRecord]) -> ErrorSummary {
    let mut details = Vec::new();
    let mut error_types = BTreeMap::new();
    for o in oficios.iter().filter(|o| o.status.is_failed()) {
        let message = o.error_message.clone().unwrap_or_else(|| "Unknown error".to_string());
        let kind = message.split(':').next().unwrap_or(&message).trim().to_string();
        *error_types.entry(kind).or_insert(0) += 1;
        details.push(ErrorDetail {
            oficio_id: o.oficio_id.clone(),
            error_type: o.status.as_str().to_string(),
            error_message: message,
            timestamp: o.updated_at,
        });
    }

    let total_errors = details.len();
    details.truncate(MAX_ERROR_DETAILS);
    ErrorSummary {
        total_errors,
        error_details: details,
        error_types,
        has_more_errors: total_errors > MAX_ERROR_DETAILS,
    }
}

/// `oficios` are expected in sequence order, as `TrackingStore::get_batch` returns them.
pub fn build(summary: BatchSummary, oficios: Vec<OficioRecord>, now: DateTime<Utc>) -> BatchReport {
    let statistics = statistics(&oficios);
    let progress = progress(&oficios, &statistics, now);
    let timeline = timeline(&summary, &oficios);
    let errors = error_summary(&oficios);
    BatchReport {
        batch_id: summary.batch_id.clone(),
        summary,
        statistics,
        oficios,
        progress,
        timeline,
        errors,
    }
}

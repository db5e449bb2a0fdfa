use std::collections::HashSet;

use async_trait::async_trait;

use super::{OcrEngine, OcrOutput};
use crate::error::{PipelineError, PipelineResult};
use crate::pdf::{self, PdfBundle};

pub const MIN_TEXT_CHARS: usize = 50;

/// Reads the embedded text layer instead of calling a remote OCR service.
pub struct TextLayerOcr;

#[async_trait]
impl OcrEngine for TextLayerOcr {
    async fn extract(&self, bytes: &[u8]) -> PipelineResult<OcrOutput> {
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || extract_blocking(&bytes))
            .await
            .map_err(|e| PipelineError::Ocr(format!("Extraction task failed: {}", e)))?
    }
}

fn extract_blocking(bytes: &[u8]) -> PipelineResult<OcrOutput> {
    let bundle = PdfBundle::load(bytes).map_err(|e| PipelineError::Ocr(e.to_string()))?;
    if bundle.page_count() == 0 {
        return Err(PipelineError::Ocr("PDF has no pages".to_string()));
    }

    let text = match pdf::full_text(bytes) {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) | Err(_) => bundle.page_texts().join("\n\n"),
    };

    let chars = text.chars().filter(|c| !c.is_whitespace()).count();
    if chars < MIN_TEXT_CHARS {
        return Err(PipelineError::Ocr(format!("Extracted text too short: {} chars", chars)));
    }

    let with_text = bundle.page_texts().iter().filter(|p| !p.trim().is_empty()).count();
    tracing::debug!(
        "Text layer: {} pages, {} with text, {} chars",
        bundle.page_count(),
        with_text,
        chars
    );

    Ok(OcrOutput {
        confidence: Some(text_confidence(&text)),
        text,
        pages: bundle.page_count() as u32,
        engine: "text_layer".to_string(),
        model: "pdf-text".to_string(),
    })
}

/// Heuristic 0..1 score from length, character variety, word count and the share of letters.
pub fn text_confidence(text: &str) -> f64 {
    let len = text.chars().count();
    if len == 0 {
        return 0.0;
    }

    let length_score = (len as f64 / 1000.0).min(1.0) * 0.3;
    let unique: HashSet<char> = text.to_lowercase().chars().collect();
    let variety_score = (unique.len() as f64 / 50.0).min(1.0) * 0.2;
    let words = text.split_whitespace().count();
    let word_score = (words as f64 / 200.0).min(1.0) * 0.2;
    let alpha = text.chars().filter(|c| c.is_alphabetic()).count();
    let alpha_score = alpha as f64 / len as f64 * 0.3;

    (length_score + variety_score + word_score + alpha_score).clamp(0.0, 1.0)
}

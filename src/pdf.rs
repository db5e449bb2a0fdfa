use lopdf::Document;

use crate::error::{PipelineError, PipelineResult};
use crate::split::PageRange;

/// A parsed bundle plus the normalized text of each of its pages.
pub struct PdfBundle {
    doc: Document,
    pages: Vec<String>,
}

impl PdfBundle {
    pub fn load(bytes: &[u8]) -> PipelineResult<Self> {
        let doc = Document::load_mem(bytes)?;
        let pages = doc
            .get_pages()
            .keys()
            .map(|&num| match doc.extract_text(&[num]) {
                Ok(text) => normalize_text(&text),
                Err(e) => {
                    tracing::warn!("Could not extract text from page {}: {}", num, e);
                    String::new()
                }
            })
            .collect::<Vec<_>>();
        tracing::debug!("Loaded PDF with {} pages", pages.len());
        Ok(Self { doc, pages })
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page_texts(&self) -> &[String] {
        &self.pages
    }

    /// Writes a new PDF holding only the pages in `range`.
    pub fn extract(&self, range: PageRange) -> PipelineResult<Vec<u8>> {
        if range.end >= self.page_count() {
            return Err(PipelineError::Pdf(format!(
                "Page range {} is outside a {} page document",
                range.label(),
                self.page_count()
            )));
        }

        // lopdf numbers pages from 1
        let drop: Vec<u32> = (0..self.page_count())
            .filter(|idx| !range.pages().contains(idx))
            .map(|idx| idx as u32 + 1)
            .collect();

        let mut doc = self.doc.clone();
        if !drop.is_empty() {
            doc.delete_pages(&drop);
            doc.prune_objects();
            doc.renumber_objects();
        }

        let mut buf = Vec::new();
        doc.save_to(&mut buf)
            .map_err(|e| PipelineError::Pdf(format!("Failed to write oficio PDF: {}", e)))?;
        Ok(buf)
    }
}

/// Whole-document text through pdf-extract, which copes with more font encodings
/// than the per-page lopdf path. Panics inside the extractor are contained.
pub fn full_text(bytes: &[u8]) -> PipelineResult<String> {
    match std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes)) {
        Ok(Ok(text)) => Ok(normalize_text(&text)),
        Ok(Err(e)) => Err(PipelineError::Pdf(format!("Text extraction failed: {}", e))),
        Err(_) => Err(PipelineError::Pdf("Panic during text extraction".to_string())),
    }
}

/// Normalize text extracted from PDFs - fix ligatures and other Unicode issues.
/// Line breaks are kept; runs of spaces inside a line are collapsed.
pub fn normalize_text(text: &str) -> String {
    let replaced = text
        .replace('\u{FB00}', "ff")
        .replace('\u{FB01}', "fi")
        .replace('\u{FB02}', "fl")
        .replace('\u{FB03}', "ffi")
        .replace('\u{FB04}', "ffl")
        .replace('\u{FB05}', "st")
        .replace('\u{FB06}', "st")
        .replace('\u{2019}', "'")
        .replace('\u{2018}', "'")
        .replace('\u{201C}', "\"")
        .replace('\u{201D}', "\"")
        .replace('\u{2013}', "-")
        .replace('\u{2014}', "-")
        .replace('\u{2026}', "...")
        .replace('\u{00A0}', " ")
        .replace("\r\n", "\n")
        .replace('\r', "\n");

    replaced
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

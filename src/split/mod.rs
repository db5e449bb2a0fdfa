//! Heuristics that cut a bundled PDF into individual oficios.
//!
//! Everything here works on the extracted text of each page and returns
//! page ranges; cutting the actual PDF happens in `crate::pdf`.

pub mod patterns;

use serde::{Deserialize, Serialize};

use patterns::{
    COVER_PAGE_KEYWORDS, DOCUMENT_START_PATTERNS, DOCUMENT_TYPE_KEYWORDS, GENERAL_DOCUMENT_TYPE,
    SEPARATOR_MAX_CHARS, SEPARATOR_PATTERNS, START_HEAD_LINES, START_MIN_CHARS,
};

/// Inclusive, 0-based range of pages in the source PDF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub start: usize,
    pub end: usize,
}

impl PageRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Range covering `start..end_exclusive`, or None when empty.
    fn half_open(start: usize, end_exclusive: usize) -> Option<Self> {
        (end_exclusive > start).then(|| Self::new(start, end_exclusive - 1))
    }

    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    pub fn pages(&self) -> std::ops::RangeInclusive<usize> {
        self.start..=self.end
    }

    fn shifted(self, offset: usize) -> Self {
        Self::new(self.start + offset, self.end + offset)
    }

    /// 1-based page label, e.g. "3-5".
    pub fn label(&self) -> String {
        format!("{}-{}", self.start + 1, self.end + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategy {
    Separators,
    DocumentStarts,
    PageEstimation,
}

impl std::fmt::Display for SplitStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SplitStrategy::Separators => "separators",
            SplitStrategy::DocumentStarts => "document_starts",
            SplitStrategy::PageEstimation => "page_estimation",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitPlan {
    pub strategy: SplitStrategy,
    pub ranges: Vec<PageRange>,
    pub total_pages: usize,
    #[serde(default)]
    pub skipped_cover: bool,
}

impl SplitPlan {
    pub fn count(&self) -> usize {
        self.ranges.len()
    }
}

/// Pages that consist of nothing but a separator marker.
pub fn find_separator_pages(pages: &[String]) -> Vec<usize> {
    pages
        .iter()
        .enumerate()
        .filter_map(|(idx, text)| {
            let text = text.trim().to_lowercase();
            if text.chars().count() >= SEPARATOR_MAX_CHARS {
                return None;
            }
            SEPARATOR_PATTERNS
                .iter()
                .find(|re| re.is_match(&text))
                .map(|re| {
                    tracing::debug!("Separator on page {}: {}", idx + 1, re.as_str());
                    idx
                })
        })
        .collect()
}

/// Groups the pages between separators. Separator pages themselves are dropped.
pub fn group_by_separators(separators: &[usize], total_pages: usize) -> Vec<PageRange> {
    let mut ranges = Vec::new();
    let mut current_start = 0;

    for &sep in separators {
        if let Some(range) = PageRange::half_open(current_start, sep) {
            ranges.push(range);
        }
        current_start = sep + 1;
    }
    if let Some(range) = PageRange::half_open(current_start, total_pages) {
        ranges.push(range);
    }
    ranges
}

/// Pages whose heading looks like the start of a legal document. Page 0 is always a start.
pub fn find_document_starts(pages: &[String]) -> Vec<usize> {
    let mut starts = vec![0];

    for (idx, text) in pages.iter().enumerate().skip(1) {
        let text = text.trim();
        if text.chars().count() < START_MIN_CHARS {
            continue;
        }

        let head = text
            .split('\n')
            .take(START_HEAD_LINES)
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();

        if let Some(re) = DOCUMENT_START_PATTERNS.iter().find(|re| re.is_match(&head)) {
            tracing::debug!("Document start on page {}: {}", idx + 1, re.as_str());
            starts.push(idx);
        }
    }

    starts.sort_unstable();
    starts.dedup();
    starts
}

/// Each start runs until the page before the next start.
pub fn group_by_starts(starts: &[usize], total_pages: usize) -> Vec<PageRange> {
    starts
        .iter()
        .enumerate()
        .filter_map(|(i, &start)| {
            let end = starts.get(i + 1).copied().unwrap_or(total_pages);
            PageRange::half_open(start, end.min(total_pages))
        })
        .collect()
}

/// Even division of the pages, using the declared count or two pages per document.
pub fn estimate_ranges(total_pages: usize, declared: u32) -> Vec<PageRange> {
    if total_pages == 0 {
        return Vec::new();
    }

    let estimated_docs = if declared == 0 {
        (total_pages / 2).max(1)
    } else {
        declared as usize
    };
    let pages_per_doc = (total_pages / estimated_docs).max(1);
    tracing::debug!(
        "Page estimation: {} documents, ~{} pages each",
        estimated_docs,
        pages_per_doc
    );

    let mut ranges = Vec::new();
    let mut current = 0;
    for i in 0..estimated_docs {
        if current >= total_pages {
            break;
        }
        let end = if i == estimated_docs - 1 {
            total_pages
        } else {
            (current + pages_per_doc).min(total_pages)
        };
        if let Some(range) = PageRange::half_open(current, end) {
            ranges.push(range);
        }
        current = end;
    }
    ranges
}

/// Runs the three strategies in order over the page texts.
pub fn plan_split(pages: &[String], declared: u32) -> SplitPlan {
    let total_pages = pages.len();

    let separators = find_separator_pages(pages);
    if !separators.is_empty() {
        tracing::info!("Found {} explicit separator pages", separators.len());
        return SplitPlan {
            strategy: SplitStrategy::Separators,
            ranges: group_by_separators(&separators, total_pages),
            total_pages,
            skipped_cover: false,
        };
    }

    let starts = find_document_starts(pages);
    if starts.len() > 1 {
        tracing::info!("Detected {} document starts", starts.len());
        return SplitPlan {
            strategy: SplitStrategy::DocumentStarts,
            ranges: group_by_starts(&starts, total_pages),
            total_pages,
            skipped_cover: false,
        };
    }

    tracing::info!("No structural markers found, dividing {} pages by estimation", total_pages);
    SplitPlan {
        strategy: SplitStrategy::PageEstimation,
        ranges: estimate_ranges(total_pages, declared),
        total_pages,
        skipped_cover: false,
    }
}

/// True when the first page is a batch cover sheet rather than part of an oficio.
pub fn is_cover_page(pages: &[String]) -> bool {
    if pages.len() < 2 {
        return false;
    }
    let first = pages[0].to_lowercase();
    COVER_PAGE_KEYWORDS.iter().any(|kw| first.contains(kw))
}

/// Like `plan_split`, but leaves out a leading cover page. Ranges still index the full PDF.
pub fn plan_split_skipping_cover(pages: &[String], declared: u32) -> SplitPlan {
    if !is_cover_page(pages) {
        return plan_split(pages, declared);
    }

    tracing::info!("First page is a cover sheet, excluding it from splitting");
    let mut plan = plan_split(&pages[1..], declared);
    plan.ranges = plan.ranges.into_iter().map(|r| r.shifted(1)).collect();
    plan.total_pages = pages.len();
    plan.skipped_cover = true;
    plan
}

/// Joined text of the first two pages of a range, capped at `max_chars`.
pub fn preview_text(pages: &[String], range: PageRange, max_chars: usize) -> String {
    let joined = range
        .pages()
        .take(2)
        .filter_map(|idx| pages.get(idx))
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    joined.trim().chars().take(max_chars).collect()
}

/// Coarse oficio type from keywords in its preview text.
pub fn classify_document(preview: &str) -> &'static str {
    let lower = preview.to_lowercase();
    DOCUMENT_TYPE_KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
        .map(|(kind, _)| *kind)
        .unwrap_or(GENERAL_DOCUMENT_TYPE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pages(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|s| s.to_string()).collect()
    }

    const BODY: &str = "El suscrito funcionario solicita información sobre las cuentas del cliente indicado en el presente documento.";

    #[test]
    fn separators_split_and_are_dropped() {
        let p = pages(&[BODY, BODY, "SEPARADOR DE OFICIOS", BODY, "==========", BODY, BODY]);
        let plan = plan_split(&p, 3);
        assert_eq!(plan.strategy, SplitStrategy::Separators);
        assert_eq!(
            plan.ranges,
            vec![PageRange::new(0, 1), PageRange::new(3, 3), PageRange::new(5, 6)]
        );
    }

    #[test]
    fn long_page_mentioning_separator_is_not_a_separator() {
        let long = format!("fin de oficio {}", "x".repeat(120));
        assert!(find_separator_pages(&pages(&[&long])).is_empty());
        assert_eq!(find_separator_pages(&pages(&["  FIN DE OFICIO  "])), vec![0]);
    }

    #[test]
    fn adjacent_and_edge_separators_leave_no_empty_groups() {
        assert_eq!(
            group_by_separators(&[0, 2, 3, 5], 6),
            vec![PageRange::new(1, 1), PageRange::new(4, 4)]
        );
        assert!(group_by_separators(&[0, 1], 2).is_empty());
    }

    #[test]
    fn document_starts_split_on_headings() {
        let first = "JUZGADO PRIMERO DE CIRCUITO DE PANAMÁ\nOficio N° 1234\nMediante la presente se ordena el embargo";
        let second = "Oficio N° 5678\nAutoridad competente del distrito\nPor medio de la presente solicitamos información";
        let p = pages(&[first, BODY, second, BODY, BODY]);
        let plan = plan_split(&p, 0);
        assert_eq!(plan.strategy, SplitStrategy::DocumentStarts);
        assert_eq!(plan.ranges, vec![PageRange::new(0, 1), PageRange::new(2, 4)]);
    }

    #[test]
    fn short_pages_never_start_documents() {
        let p = pages(&[BODY, "Oficio N° 12"]);
        assert_eq!(find_document_starts(&p), vec![0]);
    }

    #[test]
    fn only_the_first_five_lines_are_inspected() {
        let late = format!("{}\nline\nline\nline\nline\nOficio N° 99 mediante la presente", BODY);
        assert_eq!(find_document_starts(&pages(&[BODY, &late])), vec![0]);
    }

    #[test]
    fn estimation_uses_declared_count_and_last_takes_remainder() {
        assert_eq!(
            estimate_ranges(7, 3),
            vec![PageRange::new(0, 1), PageRange::new(2, 3), PageRange::new(4, 6)]
        );
    }

    #[test]
    fn estimation_without_declaration_assumes_two_pages() {
        assert_eq!(
            estimate_ranges(5, 0),
            vec![PageRange::new(0, 1), PageRange::new(2, 4)]
        );
        assert_eq!(estimate_ranges(1, 0), vec![PageRange::new(0, 0)]);
    }

    #[test]
    fn estimation_with_more_declared_than_pages_stops_at_the_end() {
        let ranges = estimate_ranges(3, 5);
        assert_eq!(
            ranges,
            vec![PageRange::new(0, 0), PageRange::new(1, 1), PageRange::new(2, 2)]
        );
    }

    #[test]
    fn empty_pdf_yields_no_ranges() {
        let plan = plan_split(&[], 4);
        assert_eq!(plan.strategy, SplitStrategy::PageEstimation);
        assert!(plan.ranges.is_empty());
    }

    #[test]
    fn cover_page_is_skipped_and_indices_stay_absolute() {
        let p = pages(&["CANTIDAD_OFICIOS: 2\nEMPRESA: Banco General", BODY, BODY, BODY, BODY]);
        let plan = plan_split_skipping_cover(&p, 2);
        assert!(plan.skipped_cover);
        assert_eq!(plan.total_pages, 5);
        assert_eq!(plan.ranges, vec![PageRange::new(1, 2), PageRange::new(3, 4)]);
    }

    #[test]
    fn single_page_is_never_a_cover() {
        assert!(!is_cover_page(&pages(&["empresa: x"])));
    }

    #[test]
    fn classification_follows_keyword_order() {
        assert_eq!(classify_document("Se ordena el EMBARGO y la audiencia"), "embargo_secuestro");
        assert_eq!(classify_document("Citación a comparecer"), "citacion");
        assert_eq!(classify_document("Solicitud de información"), "investigacion");
        assert_eq!(classify_document("Saludos cordiales"), "oficio_general");
    }

    #[test]
    fn preview_uses_first_two_pages_and_caps_length() {
        let p = pages(&["uno", "dos", "tres"]);
        assert_eq!(preview_text(&p, PageRange::new(0, 2), 500), "uno\ndos");
        assert_eq!(preview_text(&p, PageRange::new(0, 2), 4), "uno\n");
    }

    #[test]
    fn range_labels_are_one_based() {
        assert_eq!(PageRange::new(0, 2).label(), "1-3");
        assert_eq!(PageRange::new(4, 4).len(), 1);
    }
}

//! Deterministic text chunker.
//!
//! Pure word-window chunking with overlap: re-running on the same extracted
//! text yields byte-identical chunk boundaries, which is what makes crash
//! recovery during chunking a no-op. Chunk ids are assigned by the caller
//! when the spans are persisted.

use crate::ocr::ExtractedPage;

/// A chunk boundary within one page of extracted text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    /// Position within the document, assigned in page order
    pub ordinal: i32,
    pub page_number: i32,
    /// Byte offsets into the page text
    pub start_offset: usize,
    pub end_offset: usize,
    pub content: String,
}

/// Split extracted pages into overlapping word-window chunks. Ordinals run
/// across page boundaries; pages with no words produce no chunks.
pub fn chunk_pages(pages: &[ExtractedPage], chunk_size: usize, overlap: usize) -> Vec<ChunkSpan> {
    let mut spans = Vec::new();
    let mut ordinal = 0;

    for page in pages {
        for (start, end) in chunk_ranges(&page.text, chunk_size, overlap) {
            spans.push(ChunkSpan {
                ordinal,
                page_number: page.number,
                start_offset: start,
                end_offset: end,
                content: page.text[start..end].to_string(),
            });
            ordinal += 1;
        }
    }

    spans
}

/// Byte ranges of overlapping word windows over one text.
fn chunk_ranges(text: &str, chunk_size: usize, overlap: usize) -> Vec<(usize, usize)> {
    let words = word_spans(text);
    if words.is_empty() {
        return Vec::new();
    }

    let chunk_size = chunk_size.max(1);
    // The window must advance by at least one word per chunk.
    let step = chunk_size.saturating_sub(overlap).max(1);

    let mut ranges = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + chunk_size).min(words.len());
        ranges.push((words[start].0, words[end - 1].1));
        if end == words.len() {
            break;
        }
        start += step;
    }

    ranges
}

/// Byte spans of whitespace-separated words.
fn word_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;

    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                spans.push((s, i));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        spans.push((s, text.len()));
    }

    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(number: i32, text: &str) -> ExtractedPage {
        ExtractedPage {
            number,
            text: text.to_string(),
        }
    }

    #[test]
    fn chunking_is_deterministic() {
        let pages = vec![
            page(1, "one two three four five six seven eight nine ten"),
            page(2, "eleven twelve thirteen fourteen fifteen"),
        ];
        let first = chunk_pages(&pages, 4, 1);
        let second = chunk_pages(&pages, 4, 1);
        assert_eq!(first, second);
    }

    #[test]
    fn offsets_slice_back_to_content() {
        let pages = vec![page(1, "  alpha   beta\tgamma\ndelta epsilon  ")];
        let spans = chunk_pages(&pages, 2, 1);
        assert!(!spans.is_empty());
        for span in &spans {
            assert_eq!(
                &pages[0].text[span.start_offset..span.end_offset],
                span.content
            );
        }
    }

    #[test]
    fn windows_overlap_by_the_configured_word_count() {
        let pages = vec![page(1, "a b c d e f g h")];
        let spans = chunk_pages(&pages, 4, 2);
        assert_eq!(spans[0].content, "a b c d");
        assert_eq!(spans[1].content, "c d e f");
        assert_eq!(spans[2].content, "e f g h");
    }

    #[test]
    fn short_page_is_a_single_chunk() {
        let pages = vec![page(1, "just three words")];
        let spans = chunk_pages(&pages, 512, 64);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].content, "just three words");
    }

    #[test]
    fn ordinals_run_across_pages_in_order() {
        let pages = vec![
            page(1, "one two three four five six"),
            page(2, ""),
            page(3, "seven eight nine ten eleven twelve"),
        ];
        let spans = chunk_pages(&pages, 3, 0);
        let ordinals: Vec<i32> = spans.iter().map(|s| s.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2, 3]);
        assert_eq!(spans[1].page_number, 1);
        assert_eq!(spans[2].page_number, 3);
    }

    #[test]
    fn overlap_wider_than_window_still_terminates() {
        let pages = vec![page(1, "a b c d e")];
        let spans = chunk_pages(&pages, 2, 5);
        // Step clamps to one word; every window is still bounded.
        assert_eq!(spans.len(), 4);
        assert_eq!(spans.last().unwrap().content, "d e");
    }
}

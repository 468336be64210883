use crate::types::{Chunk, ChunkConfig, PipelineError, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// The "PDF bytes to plain text" capability. Kept behind a trait so the
/// pipeline can be exercised without a real PDF renderer.
pub trait PdfTextSource: Send + Sync {
    fn convert(&self, pdf_bytes: &[u8]) -> Result<String>;
}

/// Default conversion backend built on `pdf-extract`.
pub struct PdfExtractSource;

impl PdfTextSource for PdfExtractSource {
    fn convert(&self, pdf_bytes: &[u8]) -> Result<String> {
        pdf_extract::extract_text_from_mem(pdf_bytes)
            .map_err(|e| PipelineError::Extraction(format!("unreadable PDF: {}", e)))
    }
}

/// Converts cached PDF bytes into ordered, overlapping text chunks.
pub struct TextExtractor {
    source: Arc<dyn PdfTextSource>,
    config: ChunkConfig,
}

impl TextExtractor {
    pub fn new(source: Arc<dyn PdfTextSource>, config: ChunkConfig) -> Self {
        Self { source, config }
    }

    /// Run the (CPU-bound) PDF conversion off the async runtime.
    pub async fn to_text(&self, pdf_bytes: Vec<u8>) -> Result<String> {
        let source = self.source.clone();
        let text = tokio::task::spawn_blocking(move || source.convert(&pdf_bytes))
            .await
            .map_err(|e| PipelineError::Extraction(format!("conversion task failed: {}", e)))??;

        if text.trim().is_empty() {
            return Err(PipelineError::Extraction(
                "PDF produced no text (encrypted or image-only?)".to_string(),
            ));
        }
        Ok(text)
    }

    /// Full extraction: convert, then chunk in document order.
    pub async fn extract(&self, paper_id: &str, pdf_bytes: Vec<u8>) -> Result<Vec<Chunk>> {
        let text = self.to_text(pdf_bytes).await?;
        let chunks = chunk_text(paper_id, &text, &self.config);
        info!("Split {} into {} chunk(s)", paper_id, chunks.len());
        Ok(chunks)
    }

    pub fn chunk(&self, paper_id: &str, text: &str) -> Vec<Chunk> {
        chunk_text(paper_id, text, &self.config)
    }
}

/// Split `text` into fixed-size windows of `max_chars` characters with the
/// configured overlap. Boundaries fall on character (not byte) offsets, and
/// the split is fully determined by the input and the config.
pub fn chunk_text(paper_id: &str, text: &str, config: &ChunkConfig) -> Vec<Chunk> {
    let max_chars = config.max_chars.max(1);
    let overlap = ((max_chars as f64 * config.overlap_ratio) as usize).min(max_chars - 1);

    // Byte offset of every char boundary, so windows slice valid UTF-8.
    let mut boundaries: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    boundaries.push(text.len());
    let total_chars = boundaries.len() - 1;

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < total_chars {
        let end = (start + max_chars).min(total_chars);
        chunks.push(Chunk {
            paper_id: paper_id.to_string(),
            index: chunks.len(),
            text: text[boundaries[start]..boundaries[end]].to_string(),
            char_range: start..end,
        });

        if end == total_chars {
            break;
        }
        start = end - overlap;
    }

    debug!(
        "Chunked {} chars into {} window(s) (max {}, overlap {})",
        total_chars,
        chunks.len(),
        max_chars,
        overlap
    );
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_chars: usize, overlap_ratio: f64) -> ChunkConfig {
        ChunkConfig {
            max_chars,
            overlap_ratio,
        }
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunk_text("p", "hello world", &config(5000, 0.05));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "hello world");
        assert_eq!(chunks[0].char_range, 0..11);
    }

    #[test]
    fn windows_overlap_by_the_configured_ratio() {
        let text: String = std::iter::repeat('a').take(250).collect();
        // 100-char windows, 10-char overlap: starts at 0, 90, 180.
        let chunks = chunk_text("p", &text, &config(100, 0.1));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].char_range, 0..100);
        assert_eq!(chunks[1].char_range, 90..190);
        assert_eq!(chunks[2].char_range, 180..250);
    }

    #[test]
    fn boundaries_are_deterministic_across_runs() {
        let text = "The quick brown fox. ".repeat(500);
        let a = chunk_text("p", &text, &config(1000, 0.05));
        let b = chunk_text("p", &text, &config(1000, 0.05));
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.char_range, y.char_range);
            assert_eq!(x.text, y.text);
        }
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let text = "é".repeat(150);
        let chunks = chunk_text("p", &text, &config(100, 0.0));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text.chars().count(), 100);
        assert_eq!(chunks[1].text.chars().count(), 50);
    }

    #[test]
    fn chunk_indexes_follow_document_order() {
        let text = "x".repeat(1000);
        let chunks = chunk_text("p", &text, &config(100, 0.05));
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert_eq!(chunk.paper_id, "p");
        }
    }

    struct FixedText(&'static str);

    impl PdfTextSource for FixedText {
        fn convert(&self, _bytes: &[u8]) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn empty_conversion_output_is_an_extraction_error() {
        let extractor = TextExtractor::new(Arc::new(FixedText("   \n")), ChunkConfig::default());
        let err = extractor.extract("p", vec![1, 2, 3]).await.unwrap_err();
        assert!(matches!(err, PipelineError::Extraction(_)));
    }
}

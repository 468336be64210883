pub mod acquirer;
pub mod collector;
pub mod extractor;
pub mod llm;
pub mod pipeline;
pub mod publisher;
pub mod store;
pub mod summarizer;
pub mod types;

pub use acquirer::{DocumentAcquirer, HttpPdfFetcher, PdfFetcher};
pub use collector::{paper_id_from_url, LinkCollector};
pub use extractor::{chunk_text, PdfExtractSource, PdfTextSource, TextExtractor};
pub use llm::{CompletionClient, CompletionRequest, MockCompletionClient, OpenAiCompatClient};
pub use pipeline::PipelineOrchestrator;
pub use publisher::FeedPublisher;
pub use store::ArtifactStore;
pub use summarizer::{summary_from_markdown, ProgressiveSummarizer};
pub use types::*;

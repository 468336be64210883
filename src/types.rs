use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::PathBuf;

/// A paper discovered in the input feed, keyed by a stable identifier
/// derived from its URL. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaperLink {
    pub id: String,
    pub source_url: String,
    pub discovered_at: DateTime<Utc>,
}

/// Pipeline stage whose output is cached in the artifact store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Pdf,
    Markdown,
    Summary,
    Tags,
}

impl Stage {
    /// Cache subdirectory for this stage.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Stage::Pdf => "papers",
            Stage::Markdown => "markdown",
            Stage::Summary => "summary",
            Stage::Tags => "tags",
        }
    }

    /// File extension used for artifacts of this stage.
    pub fn extension(&self) -> &'static str {
        match self {
            Stage::Pdf => "pdf",
            Stage::Markdown => "md",
            Stage::Summary => "md",
            Stage::Tags => "json",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Pdf => "pdf",
            Stage::Markdown => "markdown",
            Stage::Summary => "summary",
            Stage::Tags => "tags",
        };
        write!(f, "{}", name)
    }
}

/// A bounded window of extracted paper text. Produced in document order by
/// the extractor and consumed once by the summarizer; never persisted.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub paper_id: String,
    pub index: usize,
    pub text: String,
    pub char_range: Range<usize>,
}

/// Accumulator for the progressive summarization fold. Mutated in place
/// across chunks, then frozen into a [`Summary`].
#[derive(Debug, Clone)]
pub struct RunningSummary {
    pub paper_id: String,
    pub accumulated_text: String,
    pub stage_index: usize,
}

impl RunningSummary {
    pub fn new(paper_id: impl Into<String>) -> Self {
        Self {
            paper_id: paper_id.into(),
            accumulated_text: String::new(),
            stage_index: 0,
        }
    }
}

/// The finished structured summary of one paper.
#[derive(Debug, Clone)]
pub struct Summary {
    pub paper_id: String,
    pub one_line: String,
    pub innovations: String,
    pub results: String,
    pub glossary: String,
    pub raw_markdown: String,
}

/// Topic tags derived from a finished summary: up to 3 broad categories and
/// up to 5 specific terms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tags {
    #[serde(skip, default)]
    pub paper_id: String,
    pub top: Vec<String>,
    pub tags: Vec<String>,
}

/// Lifecycle of one dispatched paper. Transitions are owned by the worker
/// processing the task; `Done` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Downloading,
    Extracting,
    Summarizing,
    Tagging,
    Done,
    Failed,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskState::Pending => "pending",
            TaskState::Downloading => "downloading",
            TaskState::Extracting => "extracting",
            TaskState::Summarizing => "summarizing",
            TaskState::Tagging => "tagging",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Per-paper pipeline status record.
#[derive(Debug, Clone)]
pub struct PipelineTask {
    pub paper_id: String,
    pub state: TaskState,
    pub error: Option<String>,
    pub attempts: u32,
}

impl PipelineTask {
    pub fn new(paper_id: impl Into<String>) -> Self {
        Self {
            paper_id: paper_id.into(),
            state: TaskState::Pending,
            error: None,
            attempts: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, TaskState::Done | TaskState::Failed)
    }
}

/// One entry of the published output feed.
#[derive(Debug, Clone)]
pub struct FeedEntry {
    pub paper_id: String,
    pub title: String,
    pub summary_excerpt: String,
    pub link: String,
    pub published_at: DateTime<Utc>,
}

/// HTTP fetch behavior for feed and PDF downloads.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "paper-summarizer/0.2".to_string(),
            timeout_seconds: 60,
            max_retries: 3,
            retry_delay_seconds: 2,
        }
    }
}

/// Text chunking parameters. Identical input and config must always yield
/// identical chunk boundaries.
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    pub max_chars: usize,
    pub overlap_ratio: f64,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_chars: 5000,
            overlap_ratio: 0.05,
        }
    }
}

/// Completion-provider settings. Any OpenAI-compatible endpoint works; the
/// defaults target DeepSeek.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub max_retries: u32,
    pub tag_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com/v1".to_string(),
            api_key: String::new(),
            model: "deepseek-chat".to_string(),
            max_tokens: None,
            max_retries: 2,
            tag_retries: 2,
        }
    }
}

/// Which subset of the stage machine a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Collect, acquire, extract, summarize, tag, aggregate, publish.
    Full,
    /// Stop every task after the markdown stage.
    ExtractOnly,
    /// Skip acquisition/extraction; tag cached summaries only.
    TagsOnly,
    /// Run summarize+tag over cached markdown, no network feed or downloads.
    Local,
    /// Reconstruct the output feed from cached artifacts and exit.
    RebuildFeed,
}

/// Top-level orchestrator settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub cache_root: PathBuf,
    pub worker_count: usize,
    pub output_path: PathBuf,
    pub feed_path: PathBuf,
    pub retention: usize,
    pub mode: RunMode,
    pub force_refresh: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("cache"),
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            output_path: PathBuf::from("output.md"),
            feed_path: PathBuf::from("paper-summaries-rss.xml"),
            retention: 30,
            mode: RunMode::Full,
            force_refresh: false,
        }
    }
}

/// Outcome counts for one orchestrator run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub done: usize,
    pub failed: usize,
    pub skipped_cached: usize,
    pub failures: Vec<(String, String)>,
}

/// Why a PDF acquisition ultimately failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireFailure {
    Network,
    InvalidPdf,
    NotFound,
}

impl std::fmt::Display for AcquireFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AcquireFailure::Network => "network",
            AcquireFailure::InvalidPdf => "invalid-pdf",
            AcquireFailure::NotFound => "not-found",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("feed fetch failed: {0}")]
    FeedFetch(String),

    #[error("acquisition failed for {paper_id} ({reason}): {detail}")]
    Acquisition {
        paper_id: String,
        reason: AcquireFailure,
        detail: String,
    },

    #[error("text extraction failed: {0}")]
    Extraction(String),

    #[error("completion provider error: {0}")]
    Llm(String),

    #[error("tagging failed: {0}")]
    Tagging(String),

    #[error("artifact not found: {stage}/{paper_id}")]
    NotFound { stage: Stage, paper_id: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

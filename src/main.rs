use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use paper_summarizer::{
    ArtifactStore, ChunkConfig, DocumentAcquirer, FetchConfig, HttpPdfFetcher, LinkCollector,
    LlmConfig, OpenAiCompatClient, PdfExtractSource, PipelineConfig, PipelineOrchestrator,
    ProgressiveSummarizer, RunMode, TextExtractor,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Full,
    ExtractOnly,
    TagsOnly,
    Local,
    RebuildFeed,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Full => RunMode::Full,
            ModeArg::ExtractOnly => RunMode::ExtractOnly,
            ModeArg::TagsOnly => RunMode::TagsOnly,
            ModeArg::Local => RunMode::Local,
            ModeArg::RebuildFeed => RunMode::RebuildFeed,
        }
    }
}

/// Summarize research papers from an RSS feed into markdown and a
/// republished feed.
#[derive(Debug, Parser)]
#[command(name = "paper-summarizer", version)]
struct Cli {
    /// RSS feed URL listing papers. Required for full and extract-only
    /// modes; ignored by cache-only modes.
    feed_url: Option<String>,

    /// Which part of the pipeline to run.
    #[arg(long, value_enum, default_value = "full")]
    mode: ModeArg,

    /// Number of concurrent workers. Defaults to the CPU count.
    #[arg(long)]
    workers: Option<usize>,

    /// Path of the aggregated markdown document.
    #[arg(long, default_value = "output.md")]
    output: PathBuf,

    /// Path of the published RSS feed.
    #[arg(long, default_value = "paper-summaries-rss.xml")]
    feed_path: PathBuf,

    /// Root directory of the artifact cache.
    #[arg(long, default_value = "cache")]
    cache_dir: PathBuf,

    /// Completion-provider API key. Falls back to DEEPSEEK_API_KEY, then
    /// OPENAI_API_KEY.
    #[arg(long)]
    api_key: Option<String>,

    /// OpenAI-compatible API base URL.
    #[arg(long, default_value = "https://api.deepseek.com/v1")]
    base_url: String,

    /// Model name to request.
    #[arg(long, default_value = "deepseek-chat")]
    model: String,

    /// Maximum characters per text chunk.
    #[arg(long, default_value_t = 5000)]
    chunk_size: usize,

    /// Overlap between consecutive chunks, as a fraction of chunk size.
    #[arg(long, default_value_t = 0.05)]
    chunk_overlap: f64,

    /// Maximum number of entries kept in the published feed.
    #[arg(long, default_value_t = 30)]
    retention: usize,

    /// Recompute text, summary and tags even when cached. Downloaded PDFs
    /// are kept.
    #[arg(long)]
    force_refresh: bool,

    /// Enable debug-level logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();

    let mode: RunMode = cli.mode.into();
    let needs_feed = matches!(mode, RunMode::Full | RunMode::ExtractOnly);
    if needs_feed && cli.feed_url.is_none() {
        bail!("a feed URL is required in {:?} mode", cli.mode);
    }

    let needs_llm = !matches!(mode, RunMode::ExtractOnly | RunMode::RebuildFeed);
    let api_key = cli
        .api_key
        .or_else(|| std::env::var("DEEPSEEK_API_KEY").ok())
        .or_else(|| std::env::var("OPENAI_API_KEY").ok());
    if needs_llm && api_key.is_none() {
        bail!("no API key: pass --api-key or set DEEPSEEK_API_KEY / OPENAI_API_KEY");
    }

    let mut config = PipelineConfig {
        cache_root: cli.cache_dir,
        output_path: cli.output,
        feed_path: cli.feed_path,
        retention: cli.retention,
        mode,
        force_refresh: cli.force_refresh,
        ..PipelineConfig::default()
    };
    if let Some(workers) = cli.workers {
        config.worker_count = workers.max(1);
    }

    let llm_config = LlmConfig {
        base_url: cli.base_url,
        api_key: api_key.unwrap_or_default(),
        model: cli.model,
        ..LlmConfig::default()
    };
    let chunk_config = ChunkConfig {
        max_chars: cli.chunk_size.max(1),
        overlap_ratio: cli.chunk_overlap.clamp(0.0, 0.9),
    };
    let fetch_config = FetchConfig::default();

    info!(
        "Starting paper summarizer ({:?} mode, {} workers, cache at {})",
        cli.mode,
        config.worker_count,
        config.cache_root.display()
    );

    let store =
        Arc::new(ArtifactStore::open(config.cache_root.clone()).context("opening cache")?);
    let fetcher = Arc::new(HttpPdfFetcher::new(fetch_config.clone())?);
    let acquirer = Arc::new(DocumentAcquirer::new(store.clone(), fetcher));
    let extractor = Arc::new(TextExtractor::new(Arc::new(PdfExtractSource), chunk_config));
    let client = Arc::new(OpenAiCompatClient::new(llm_config.clone())?);
    let summarizer = Arc::new(ProgressiveSummarizer::new(client, llm_config));
    let collector = LinkCollector::new(&fetch_config)?;

    let orchestrator = Arc::new(PipelineOrchestrator::new(
        store, acquirer, extractor, summarizer, collector, config,
    ));

    // Ctrl-C lets in-flight stages finish; interrupted papers resume from
    // their last cached stage on the next run.
    {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                orchestrator.request_shutdown();
            }
        });
    }

    let report = orchestrator.run(cli.feed_url.as_deref()).await?;
    if report.failed > 0 {
        bail!(
            "{} of {} paper(s) failed",
            report.failed,
            report.done + report.failed
        );
    }
    Ok(())
}

use crate::acquirer::DocumentAcquirer;
use crate::collector::LinkCollector;
use crate::extractor::TextExtractor;
use crate::publisher::FeedPublisher;
use crate::store::ArtifactStore;
use crate::summarizer::{summary_from_markdown, ProgressiveSummarizer};
use crate::types::{
    FeedEntry, PaperLink, PipelineConfig, PipelineError, PipelineTask, Result, RunMode, RunReport,
    Stage, Summary, TaskState,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How far a single task got. `Interrupted` means a cooperative shutdown
/// stopped it between stages; everything completed so far is cached, so the
/// next run resumes where this one left off.
enum TaskOutcome {
    Done,
    Interrupted,
}

/// Coordinates the whole per-run pipeline: link collection, a fixed-size
/// worker pool walking each paper through its stage sequence, aggregation of
/// the results, and the feed rebuild.
///
/// Every stage consults the artifact store before doing work, so reruns
/// after a crash resume from the last completed stage, and a fully cached
/// paper costs no network or completion calls at all. A failing paper is
/// recorded on its own task and never disturbs its siblings.
pub struct PipelineOrchestrator {
    store: Arc<ArtifactStore>,
    acquirer: Arc<DocumentAcquirer>,
    extractor: Arc<TextExtractor>,
    summarizer: Arc<ProgressiveSummarizer>,
    publisher: FeedPublisher,
    collector: LinkCollector,
    config: PipelineConfig,
    tasks: Arc<RwLock<HashMap<String, PipelineTask>>>,
    shutdown: watch::Sender<bool>,
}

impl PipelineOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ArtifactStore>,
        acquirer: Arc<DocumentAcquirer>,
        extractor: Arc<TextExtractor>,
        summarizer: Arc<ProgressiveSummarizer>,
        collector: LinkCollector,
        config: PipelineConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            acquirer,
            extractor,
            summarizer,
            publisher: FeedPublisher::new(config.retention),
            collector,
            config,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
        }
    }

    /// Ask in-flight workers to stop after their current stage. No new
    /// tasks are dispatched once this is called; partially processed papers
    /// stay resumable because every finished stage is already cached.
    pub fn request_shutdown(&self) {
        info!("Shutdown requested; letting in-flight stages finish");
        let _ = self.shutdown.send(true);
    }

    /// Snapshot of all task states, for reporting and tests.
    pub async fn task_states(&self) -> HashMap<String, PipelineTask> {
        self.tasks.read().await.clone()
    }

    /// Execute one run in the configured mode and return the final report.
    pub async fn run(&self, feed_url: Option<&str>) -> Result<RunReport> {
        if self.config.mode == RunMode::RebuildFeed {
            self.publisher
                .rebuild(&self.store, &self.config.feed_path)
                .await?;
            return Ok(RunReport::default());
        }

        let links = self.gather_links(feed_url).await?;
        if links.is_empty() {
            info!("No papers to process; nothing to do");
            return Ok(RunReport::default());
        }

        let (to_process, skipped) = self.partition_cached(&links).await;
        info!(
            "{} paper(s) in scope: {} to process, {} fully cached",
            links.len(),
            to_process.len(),
            skipped
        );

        if self.config.force_refresh {
            self.clear_derived_artifacts(&to_process).await?;
        }

        self.dispatch(to_process).await;

        let mut report = self.build_report().await;
        report.skipped_cached = skipped;

        if self.config.mode != RunMode::ExtractOnly {
            self.aggregate_and_publish(&links, feed_url).await?;
        }

        info!(
            "Run finished: {} done, {} failed, {} skipped (cached)",
            report.done, report.failed, report.skipped_cached
        );
        for (paper_id, reason) in &report.failures {
            warn!("  failed {}: {}", paper_id, reason);
        }

        Ok(report)
    }

    /// Source of paper links for this run: the remote feed for network
    /// modes, the cache directories for local ones.
    async fn gather_links(&self, feed_url: Option<&str>) -> Result<Vec<PaperLink>> {
        match self.config.mode {
            RunMode::Full | RunMode::ExtractOnly => {
                let url = feed_url.ok_or_else(|| {
                    PipelineError::FeedFetch("this run mode requires a feed URL".to_string())
                })?;
                self.collector.collect(url).await
            }
            RunMode::TagsOnly => Ok(links_from_ids(self.store.list(Stage::Summary).await?)),
            RunMode::Local => Ok(links_from_ids(self.store.list(Stage::Markdown).await?)),
            RunMode::RebuildFeed => unreachable!("handled in run()"),
        }
    }

    /// Split links into (to-process, already-done count). What counts as
    /// done depends on the mode's last stage.
    async fn partition_cached(&self, links: &[PaperLink]) -> (Vec<PaperLink>, usize) {
        if self.config.force_refresh {
            return (links.to_vec(), 0);
        }

        let mut to_process = Vec::new();
        let mut skipped = 0usize;

        for link in links {
            let done = match self.config.mode {
                RunMode::ExtractOnly => self.store.has(Stage::Markdown, &link.id).await,
                _ => {
                    self.store.has(Stage::Summary, &link.id).await
                        && self.store.has(Stage::Tags, &link.id).await
                }
            };
            if done {
                debug!("Cache hit, skipping {}", link.id);
                skipped += 1;
            } else {
                to_process.push(link.clone());
            }
        }

        (to_process, skipped)
    }

    /// Forced refresh drops recomputable artifacts. The PDF itself is kept:
    /// the source document is immutable, only our derivations change. Each
    /// mode clears only the stages it is able to rebuild.
    async fn clear_derived_artifacts(&self, links: &[PaperLink]) -> Result<()> {
        let stages: &[Stage] = match self.config.mode {
            RunMode::ExtractOnly => &[Stage::Markdown],
            RunMode::TagsOnly => &[Stage::Tags],
            RunMode::Local => &[Stage::Summary, Stage::Tags],
            _ => &[Stage::Markdown, Stage::Summary, Stage::Tags],
        };
        for link in links {
            for stage in stages {
                self.store.remove(*stage, &link.id).await?;
            }
        }
        Ok(())
    }

    /// Fan tasks out over a fixed-size worker pool fed by a work queue.
    async fn dispatch(&self, links: Vec<PaperLink>) {
        if links.is_empty() {
            return;
        }

        {
            let mut tasks = self.tasks.write().await;
            for link in &links {
                tasks.insert(link.id.clone(), PipelineTask::new(&link.id));
            }
        }

        let worker_count = self.config.worker_count.max(1).min(links.len());
        info!("Dispatching {} task(s) across {} worker(s)", links.len(), worker_count);

        let (tx, rx) = mpsc::channel::<PaperLink>(links.len());
        for link in links {
            // Channel is sized to hold every task, send cannot block here.
            let _ = tx.send(link).await;
        }
        drop(tx);
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let rx = rx.clone();
            let store = self.store.clone();
            let acquirer = self.acquirer.clone();
            let extractor = self.extractor.clone();
            let summarizer = self.summarizer.clone();
            let tasks = self.tasks.clone();
            let shutdown = self.shutdown.subscribe();
            let mode = self.config.mode;

            handles.push(tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        debug!("Worker {} stopping before next task", worker_id);
                        break;
                    }

                    let link = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let link = match link {
                        Some(l) => l,
                        None => break,
                    };

                    debug!("Worker {} picked up {}", worker_id, link.id);
                    let outcome = process_task(
                        &link,
                        mode,
                        &store,
                        &acquirer,
                        &extractor,
                        &summarizer,
                        &tasks,
                        &shutdown,
                    )
                    .await;

                    let mut tasks = tasks.write().await;
                    if let Some(task) = tasks.get_mut(&link.id) {
                        match outcome {
                            Ok(TaskOutcome::Done) => {
                                task.state = TaskState::Done;
                            }
                            Ok(TaskOutcome::Interrupted) => {
                                info!("{} interrupted, will resume next run", link.id);
                            }
                            Err(e) => {
                                error!("{} failed: {}", link.id, e);
                                task.state = TaskState::Failed;
                                task.error = Some(e.to_string());
                            }
                        }
                    }
                }
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker panicked: {}", e);
            }
        }
    }

    async fn build_report(&self) -> RunReport {
        let tasks = self.tasks.read().await;
        let mut report = RunReport::default();
        for task in tasks.values() {
            match task.state {
                TaskState::Done => report.done += 1,
                TaskState::Failed => {
                    report.failed += 1;
                    report.failures.push((
                        task.paper_id.clone(),
                        task.error.clone().unwrap_or_else(|| "unknown".to_string()),
                    ));
                }
                _ => {}
            }
        }
        report.failures.sort();
        report
    }

    /// Concatenate every available summary (newly produced or cached) into
    /// the aggregated markdown document, in feed order, then update the
    /// output feed with this run's newly completed entries.
    async fn aggregate_and_publish(
        &self,
        links: &[PaperLink],
        feed_url: Option<&str>,
    ) -> Result<()> {
        let mut sections = Vec::new();
        let mut new_entries = Vec::new();
        let tasks = self.tasks.read().await;

        for link in links {
            if !self.store.has(Stage::Summary, &link.id).await {
                continue;
            }
            let raw = self.store.get_string(Stage::Summary, &link.id).await?;
            let summary = summary_from_markdown(&link.id, raw);

            let title = if summary.one_line.is_empty() {
                link.id.clone()
            } else {
                summary.one_line.clone()
            };
            sections.push(format!(
                "\n---\n\n## {}\n\n{}\n",
                title, summary.raw_markdown
            ));

            // Only papers completed in this run are republished; cached
            // ones already sit in the feed with their original timestamps.
            let completed_now = tasks
                .get(&link.id)
                .map(|t| t.state == TaskState::Done)
                .unwrap_or(false);
            if completed_now {
                new_entries.push(self.feed_entry(link, &summary).await);
            }
        }
        drop(tasks);

        if sections.is_empty() {
            warn!("No summaries available; skipping aggregation and feed update");
            return Ok(());
        }

        let header = format!(
            "# Batch Summary – {}\n_Generated: {}_\n",
            feed_url.unwrap_or("local cache"),
            Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        );
        let document = format!("{}{}", header, sections.concat());
        write_atomic(&self.config.output_path, document.as_bytes()).await?;
        info!(
            "Aggregated {} summar{} into {}",
            sections.len(),
            if sections.len() == 1 { "y" } else { "ies" },
            self.config.output_path.display()
        );

        if !new_entries.is_empty() {
            self.publisher
                .publish(&new_entries, &self.config.feed_path)?;
        }
        Ok(())
    }

    async fn feed_entry(&self, link: &PaperLink, summary: &Summary) -> FeedEntry {
        let mut title = if summary.one_line.is_empty() {
            format!("Paper {}", link.id)
        } else {
            summary.one_line.clone()
        };

        if let Ok(raw) = self.store.get(Stage::Tags, &link.id).await {
            if let Ok(tags) = serde_json::from_slice::<crate::types::Tags>(&raw) {
                title = format!("{} [{}]", title, tags.top.join(", "));
            }
        }

        FeedEntry {
            paper_id: link.id.clone(),
            title,
            summary_excerpt: crate::publisher::excerpt(&summary.raw_markdown, 600),
            link: link.source_url.clone(),
            published_at: Utc::now(),
        }
    }
}

/// Walk one paper through its stage sequence, consulting the store before
/// every stage and caching each stage's output before the next begins.
#[allow(clippy::too_many_arguments)]
async fn process_task(
    link: &PaperLink,
    mode: RunMode,
    store: &ArtifactStore,
    acquirer: &DocumentAcquirer,
    extractor: &TextExtractor,
    summarizer: &ProgressiveSummarizer,
    tasks: &RwLock<HashMap<String, PipelineTask>>,
    shutdown: &watch::Receiver<bool>,
) -> Result<TaskOutcome> {
    // The markdown stage is this mode's terminal stage, so the summary
    // cache is never consulted and a forced refresh always re-extracts.
    if mode == RunMode::ExtractOnly {
        ensure_markdown(link, mode, store, acquirer, extractor, tasks).await?;
        return Ok(TaskOutcome::Done);
    }

    let summary = if store.has(Stage::Summary, &link.id).await {
        debug!("Summary cache hit for {}", link.id);
        let raw = store.get_string(Stage::Summary, &link.id).await?;
        summary_from_markdown(&link.id, raw)
    } else {
        if mode == RunMode::TagsOnly {
            return Err(PipelineError::NotFound {
                stage: Stage::Summary,
                paper_id: link.id.clone(),
            });
        }

        let markdown = ensure_markdown(link, mode, store, acquirer, extractor, tasks).await?;
        if *shutdown.borrow() {
            return Ok(TaskOutcome::Interrupted);
        }

        set_state(tasks, &link.id, TaskState::Summarizing).await;
        let chunks = extractor.chunk(&link.id, &markdown);
        let summary = summarizer.summarize(&chunks).await?;
        store
            .put(Stage::Summary, &link.id, summary.raw_markdown.as_bytes())
            .await?;
        summary
    };

    if *shutdown.borrow() {
        return Ok(TaskOutcome::Interrupted);
    }

    if !store.has(Stage::Tags, &link.id).await {
        set_state(tasks, &link.id, TaskState::Tagging).await;
        match summarizer.tag(&summary).await {
            Ok(tags) => {
                store
                    .put(Stage::Tags, &link.id, &serde_json::to_vec(&tags)?)
                    .await?;
            }
            // The summary is already persisted; losing tags degrades the
            // entry, it does not invalidate the paper.
            Err(PipelineError::Tagging(reason)) => {
                warn!("Publishing {} without tags: {}", link.id, reason);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(TaskOutcome::Done)
}

/// Acquisition + extraction with per-stage cache consults. In `Local` mode
/// only the cache may satisfy this.
async fn ensure_markdown(
    link: &PaperLink,
    mode: RunMode,
    store: &ArtifactStore,
    acquirer: &DocumentAcquirer,
    extractor: &TextExtractor,
    tasks: &RwLock<HashMap<String, PipelineTask>>,
) -> Result<String> {
    if store.has(Stage::Markdown, &link.id).await {
        debug!("Markdown cache hit for {}", link.id);
        return store.get_string(Stage::Markdown, &link.id).await;
    }

    if mode == RunMode::Local {
        return Err(PipelineError::NotFound {
            stage: Stage::Markdown,
            paper_id: link.id.clone(),
        });
    }

    set_state(tasks, &link.id, TaskState::Downloading).await;
    let pdf_bytes = acquirer.acquire(link).await?;

    set_state(tasks, &link.id, TaskState::Extracting).await;
    let text = extractor.to_text(pdf_bytes).await?;
    store.put(Stage::Markdown, &link.id, text.as_bytes()).await?;
    Ok(text)
}

async fn set_state(
    tasks: &RwLock<HashMap<String, PipelineTask>>,
    paper_id: &str,
    state: TaskState,
) {
    let mut tasks = tasks.write().await;
    if let Some(task) = tasks.get_mut(paper_id) {
        debug!("{}: {} -> {}", paper_id, task.state, state);
        task.state = state;
        task.attempts += 1;
    }
}

/// Synthesize links for cache-only modes, where the feed never ran. The
/// arXiv PDF URL is reconstructible from the id alone.
fn links_from_ids(ids: Vec<String>) -> Vec<PaperLink> {
    let discovered_at = Utc::now();
    ids.into_iter()
        .map(|id| PaperLink {
            source_url: format!("https://arxiv.org/pdf/{}.pdf", id),
            id,
            discovered_at,
        })
        .collect()
}

/// Write a file atomically via a temp sibling and rename.
async fn write_atomic(path: &std::path::Path, payload: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, payload).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

use crate::store::ArtifactStore;
use crate::types::{AcquireFailure, FetchConfig, PaperLink, PipelineError, Result, Stage};
use async_trait::async_trait;
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use reqwest::Client;
use scraper::{Html, Selector};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const PDF_MAGIC: &[u8] = b"%PDF-";

/// Network half of acquisition: resolve a paper link to a direct PDF URL and
/// download the bytes. Split out as a trait so tests can force failures
/// without touching the cache logic.
#[async_trait]
pub trait PdfFetcher: Send + Sync {
    async fn fetch(&self, link: &PaperLink) -> Result<Vec<u8>>;
}

/// Resolves a paper identifier to cached PDF bytes, downloading at most once.
pub struct DocumentAcquirer {
    store: Arc<ArtifactStore>,
    fetcher: Arc<dyn PdfFetcher>,
}

impl DocumentAcquirer {
    pub fn new(store: Arc<ArtifactStore>, fetcher: Arc<dyn PdfFetcher>) -> Self {
        Self { store, fetcher }
    }

    /// Return the paper's PDF bytes, hitting the network only when the
    /// artifact store has no copy. Successful downloads are cached before
    /// this returns, so an interrupted run never repeats them.
    pub async fn acquire(&self, link: &PaperLink) -> Result<Vec<u8>> {
        if self.store.has(Stage::Pdf, &link.id).await {
            debug!("PDF cache hit for {}", link.id);
            return self.store.get(Stage::Pdf, &link.id).await;
        }

        let bytes = self.fetcher.fetch(link).await?;

        if !bytes.starts_with(PDF_MAGIC) {
            return Err(PipelineError::Acquisition {
                paper_id: link.id.clone(),
                reason: AcquireFailure::InvalidPdf,
                detail: format!("response is not a PDF ({} bytes)", bytes.len()),
            });
        }

        self.store.put(Stage::Pdf, &link.id, &bytes).await?;
        info!("Downloaded PDF for {} ({} bytes)", link.id, bytes.len());
        Ok(bytes)
    }
}

/// Production fetcher: URL resolution plus a retried, backed-off download.
pub struct HttpPdfFetcher {
    client: Client,
    config: FetchConfig,
}

impl HttpPdfFetcher {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .build()?;
        Ok(Self { client, config })
    }

    /// Turn a landing-page URL into a direct PDF URL without touching the
    /// network, when the URL shape allows it.
    fn rewrite_known_hosts(url: &str) -> Option<String> {
        let lower = url.to_lowercase();
        if lower.ends_with(".pdf") {
            return Some(url.to_string());
        }
        if url.contains("huggingface.co/papers") {
            return Some(format!(
                "{}.pdf",
                url.replace("huggingface.co/papers", "arxiv.org/pdf")
            ));
        }
        if url.contains("arxiv.org/abs/") {
            return Some(format!("{}.pdf", url.replace("arxiv.org/abs/", "arxiv.org/pdf/")));
        }
        None
    }

    /// Resolve the direct PDF URL for a paper, scraping the landing page for
    /// a `.pdf` anchor when no rewrite applies.
    async fn resolve_pdf_url(&self, link: &PaperLink) -> Result<String> {
        if let Some(direct) = Self::rewrite_known_hosts(&link.source_url) {
            return Ok(direct);
        }

        debug!("Scanning landing page for a PDF link: {}", link.source_url);
        let page = self
            .client
            .get(&link.source_url)
            .send()
            .await
            .map_err(|e| self.network_error(&link.id, &e))?;

        if page.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PipelineError::Acquisition {
                paper_id: link.id.clone(),
                reason: AcquireFailure::NotFound,
                detail: format!("landing page missing: {}", link.source_url),
            });
        }

        let html = page.text().await.map_err(|e| self.network_error(&link.id, &e))?;
        match find_pdf_href(&html, &link.source_url) {
            Some(pdf_url) => Ok(pdf_url),
            None => Err(PipelineError::Acquisition {
                paper_id: link.id.clone(),
                reason: AcquireFailure::NotFound,
                detail: format!("no PDF link found on {}", link.source_url),
            }),
        }
    }

    async fn download(&self, paper_id: &str, pdf_url: &str) -> Result<Vec<u8>> {
        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: Duration::from_secs(self.config.retry_delay_seconds),
            initial_interval: Duration::from_secs(self.config.retry_delay_seconds),
            max_interval: Duration::from_secs(self.config.retry_delay_seconds * 16),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            match self.try_download_once(paper_id, pdf_url).await {
                Ok(bytes) => return Ok(bytes),
                // not-found is terminal, retrying will not conjure the paper
                Err(e @ PipelineError::Acquisition {
                    reason: AcquireFailure::NotFound,
                    ..
                }) => return Err(e),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < self.config.max_retries {
                        if let Some(delay) = backoff.next_backoff() {
                            warn!(
                                "Download attempt {} failed for {}, retrying in {:?}",
                                attempt + 1,
                                pdf_url,
                                delay
                            );
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| PipelineError::Acquisition {
            paper_id: paper_id.to_string(),
            reason: AcquireFailure::Network,
            detail: format!("retries exhausted for {}", pdf_url),
        }))
    }

    async fn try_download_once(&self, paper_id: &str, pdf_url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(pdf_url)
            .send()
            .await
            .map_err(|e| self.network_error(paper_id, &e))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(PipelineError::Acquisition {
                paper_id: paper_id.to_string(),
                reason: AcquireFailure::NotFound,
                detail: format!("HTTP 404 for {}", pdf_url),
            });
        }
        if !status.is_success() {
            return Err(PipelineError::Acquisition {
                paper_id: paper_id.to_string(),
                reason: AcquireFailure::Network,
                detail: format!("HTTP {} for {}", status, pdf_url),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.network_error(paper_id, &e))?;
        Ok(bytes.to_vec())
    }

    fn network_error(&self, paper_id: &str, e: &reqwest::Error) -> PipelineError {
        PipelineError::Acquisition {
            paper_id: paper_id.to_string(),
            reason: AcquireFailure::Network,
            detail: e.to_string(),
        }
    }
}

#[async_trait]
impl PdfFetcher for HttpPdfFetcher {
    async fn fetch(&self, link: &PaperLink) -> Result<Vec<u8>> {
        let pdf_url = self.resolve_pdf_url(link).await?;
        debug!("PDF URL for {}: {}", link.id, pdf_url);
        self.download(&link.id, &pdf_url).await
    }
}

/// First `.pdf` anchor on a page, resolved against the page URL.
fn find_pdf_href(html: &str, page_url: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("a[href]").ok()?;
    let base = Url::parse(page_url).ok()?;

    for element in document.select(&selector) {
        if let Some(href) = element.value().attr("href") {
            if href.to_lowercase().ends_with(".pdf") {
                if let Ok(resolved) = base.join(href) {
                    return Some(resolved.to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn link(url: &str) -> PaperLink {
        PaperLink {
            id: "2506.00001".to_string(),
            source_url: url.to_string(),
            discovered_at: Utc::now(),
        }
    }

    struct StaticFetcher(Vec<u8>);

    #[async_trait]
    impl PdfFetcher for StaticFetcher {
        async fn fetch(&self, _link: &PaperLink) -> Result<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn known_host_rewrites() {
        assert_eq!(
            HttpPdfFetcher::rewrite_known_hosts("https://huggingface.co/papers/2506.00001"),
            Some("https://arxiv.org/pdf/2506.00001.pdf".to_string())
        );
        assert_eq!(
            HttpPdfFetcher::rewrite_known_hosts("https://arxiv.org/abs/2506.00001"),
            Some("https://arxiv.org/pdf/2506.00001.pdf".to_string())
        );
        assert_eq!(
            HttpPdfFetcher::rewrite_known_hosts("https://example.com/x.PDF"),
            Some("https://example.com/x.PDF".to_string())
        );
        assert_eq!(
            HttpPdfFetcher::rewrite_known_hosts("https://example.com/paper-page"),
            None
        );
    }

    #[test]
    fn pdf_href_is_resolved_against_page_url() {
        let html = r#"<html><body>
            <a href="/about">About</a>
            <a href="files/paper.pdf">Download</a>
        </body></html>"#;
        assert_eq!(
            find_pdf_href(html, "https://example.com/pubs/123"),
            Some("https://example.com/pubs/files/paper.pdf".to_string())
        );
    }

    #[tokio::test]
    async fn invalid_pdf_bytes_are_rejected_and_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::open(dir.path()).unwrap());
        let acquirer =
            DocumentAcquirer::new(store.clone(), Arc::new(StaticFetcher(b"<html>".to_vec())));

        let err = acquirer.acquire(&link("https://arxiv.org/abs/2506.00001")).await;
        assert!(matches!(
            err,
            Err(PipelineError::Acquisition {
                reason: AcquireFailure::InvalidPdf,
                ..
            })
        ));
        assert!(!store.has(Stage::Pdf, "2506.00001").await);
    }

    #[tokio::test]
    async fn cached_pdf_skips_the_fetcher() {
        struct PanicFetcher;

        #[async_trait]
        impl PdfFetcher for PanicFetcher {
            async fn fetch(&self, _link: &PaperLink) -> Result<Vec<u8>> {
                panic!("fetcher must not run on a cache hit");
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::open(dir.path()).unwrap());
        store.put(Stage::Pdf, "2506.00001", b"%PDF-1.4 body").await.unwrap();

        let acquirer = DocumentAcquirer::new(store, Arc::new(PanicFetcher));
        let bytes = acquirer
            .acquire(&link("https://arxiv.org/abs/2506.00001"))
            .await
            .unwrap();
        assert_eq!(bytes, b"%PDF-1.4 body");
    }
}

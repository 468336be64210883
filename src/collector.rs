use crate::types::{FetchConfig, PaperLink, PipelineError, Result};
use chrono::Utc;
use feed_rs::parser;
use reqwest::Client;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Fetches the input RSS/Atom feed and turns its entries into deduplicated
/// [`PaperLink`] values. Does not retry; a broken feed aborts the run.
pub struct LinkCollector {
    client: Client,
}

impl LinkCollector {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .build()?;
        Ok(Self { client })
    }

    /// Fetch and parse `feed_url`, returning one link per entry in feed
    /// order, deduplicated by paper id.
    pub async fn collect(&self, feed_url: &str) -> Result<Vec<PaperLink>> {
        debug!("Fetching feed: {}", feed_url);

        let response = self
            .client
            .get(feed_url)
            .send()
            .await
            .map_err(|e| PipelineError::FeedFetch(format!("{}: {}", feed_url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::FeedFetch(format!(
                "{}: HTTP {}",
                feed_url, status
            )));
        }

        let content = response
            .text()
            .await
            .map_err(|e| PipelineError::FeedFetch(format!("{}: {}", feed_url, e)))?;

        let links = Self::parse_links(&content)?;
        info!("Found {} unique paper link(s) in feed", links.len());
        Ok(links)
    }

    /// Parse feed XML into deduplicated links. Separated from `collect` so
    /// tests can exercise it without a network round trip.
    pub fn parse_links(content: &str) -> Result<Vec<PaperLink>> {
        let feed = parser::parse(content.as_bytes())
            .map_err(|e| PipelineError::FeedFetch(format!("failed to parse feed: {}", e)))?;

        let discovered_at = Utc::now();
        let mut seen_ids = HashSet::new();
        let mut links = Vec::new();

        for entry in feed.entries {
            let url = match entry.links.first() {
                Some(l) => l.href.clone(),
                None => {
                    debug!("Skipping feed entry without a link: {}", entry.id);
                    continue;
                }
            };

            let id = match paper_id_from_url(&url) {
                Some(id) => id,
                None => {
                    warn!("Could not derive a paper id from {}", url);
                    continue;
                }
            };

            if !seen_ids.insert(id.clone()) {
                debug!("Skipping duplicate paper: {}", id);
                continue;
            }

            links.push(PaperLink {
                id,
                source_url: url,
                discovered_at,
            });
        }

        Ok(links)
    }
}

/// Derive a stable identifier from a paper URL. The same source item always
/// maps to the same id across runs.
///
/// arXiv-shaped URLs (arxiv.org/abs, arxiv.org/pdf, huggingface.co/papers)
/// yield the bare arXiv id; anything else falls back to the sanitized last
/// path segment.
pub fn paper_id_from_url(url_str: &str) -> Option<String> {
    let url = Url::parse(url_str).ok()?;
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();

    // For arxiv.org/{abs,pdf}/<id> and huggingface.co/papers/<id> the last
    // segment is the arXiv id; other hosts get their last segment verbatim.
    let raw = segments.last().copied()?;
    // Extension matching is case-insensitive so x.pdf and x.PDF dedupe.
    let trimmed = if raw.len() >= 4 && raw.as_bytes()[raw.len() - 4..].eq_ignore_ascii_case(b".pdf")
    {
        &raw[..raw.len() - 4]
    } else {
        raw
    };
    let id: String = trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();

    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arxiv_abs_and_pdf_urls_share_an_id() {
        let abs = paper_id_from_url("https://arxiv.org/abs/2506.00001").unwrap();
        let pdf = paper_id_from_url("https://arxiv.org/pdf/2506.00001.pdf").unwrap();
        assert_eq!(abs, "2506.00001");
        assert_eq!(abs, pdf);
    }

    #[test]
    fn huggingface_paper_url_maps_to_arxiv_id() {
        let id = paper_id_from_url("https://huggingface.co/papers/2506.12345").unwrap();
        assert_eq!(id, "2506.12345");
    }

    #[test]
    fn arbitrary_url_uses_sanitized_last_segment() {
        let id = paper_id_from_url("https://example.com/pubs/my(paper)v2.pdf").unwrap();
        assert_eq!(id, "my-paper-v2");
    }

    #[test]
    fn pdf_extension_case_does_not_change_the_id() {
        let lower = paper_id_from_url("https://example.com/pubs/x.pdf").unwrap();
        let upper = paper_id_from_url("https://example.com/pubs/x.PDF").unwrap();
        assert_eq!(lower, "x");
        assert_eq!(lower, upper);
    }

    #[test]
    fn duplicate_entries_are_collapsed() {
        let xml = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>t</title>
<item><link>https://arxiv.org/abs/2506.00001</link></item>
<item><link>https://arxiv.org/pdf/2506.00001.pdf</link></item>
<item><link>https://arxiv.org/abs/2506.00002</link></item>
</channel></rss>"#;

        let links = LinkCollector::parse_links(xml).unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].id, "2506.00001");
        assert_eq!(links[1].id, "2506.00002");
    }

    #[test]
    fn malformed_feed_is_a_feed_fetch_error() {
        let err = LinkCollector::parse_links("this is not xml").unwrap_err();
        assert!(matches!(err, PipelineError::FeedFetch(_)));
    }
}

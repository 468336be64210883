use crate::store::ArtifactStore;
use crate::summarizer::first_header;
use crate::types::{FeedEntry, PipelineError, Result, Stage, Tags};
use chrono::{DateTime, Utc};
use rss::{Channel, ChannelBuilder, Guid, Item, ItemBuilder};
use std::collections::HashMap;
use std::io::BufReader;
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

const FEED_TITLE: &str = "Research Paper Summaries";
const FEED_DESCRIPTION: &str = "AI-generated summaries of research papers";
const FEED_SITE_LINK: &str = "https://example.com/paper-summaries";

/// Builds the output RSS document from completed summaries, keeping only the
/// most recent entries.
pub struct FeedPublisher {
    retention: usize,
}

impl FeedPublisher {
    pub fn new(retention: usize) -> Self {
        Self { retention }
    }

    /// Merge `entries` with whatever the feed file already holds,
    /// deduplicate by paper id (new entry wins), order by publish time
    /// descending, cap at the retention count, and atomically replace the
    /// file. Readers never observe a partially written feed.
    pub fn publish(&self, entries: &[FeedEntry], feed_path: &Path) -> Result<()> {
        let mut merged: HashMap<String, FeedEntry> = HashMap::new();

        for existing in self.read_existing(feed_path) {
            merged.insert(existing.paper_id.clone(), existing);
        }
        for entry in entries {
            merged.insert(entry.paper_id.clone(), entry.clone());
        }

        let mut all: Vec<FeedEntry> = merged.into_values().collect();
        all.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        all.truncate(self.retention);

        self.write_feed(&all, feed_path)?;
        info!(
            "Feed written to {} ({} entr{})",
            feed_path.display(),
            all.len(),
            if all.len() == 1 { "y" } else { "ies" }
        );
        Ok(())
    }

    /// Recovery path: ignore the existing feed file and reconstruct every
    /// entry from the cached summary/tags artifacts.
    pub async fn rebuild(&self, store: &ArtifactStore, feed_path: &Path) -> Result<()> {
        let mut entries = Vec::new();

        for paper_id in store.list(Stage::Summary).await? {
            let markdown = store.get_string(Stage::Summary, &paper_id).await?;

            let mut title = first_header(&markdown)
                .unwrap_or_else(|| format!("Paper {}", paper_id));
            if store.has(Stage::Tags, &paper_id).await {
                if let Ok(raw) = store.get(Stage::Tags, &paper_id).await {
                    if let Ok(tags) = serde_json::from_slice::<Tags>(&raw) {
                        title = format!("{} [{}]", title, tags.top.join(", "));
                    }
                }
            }

            entries.push(FeedEntry {
                paper_id: paper_id.clone(),
                title,
                summary_excerpt: excerpt(&markdown, 600),
                link: format!("https://arxiv.org/pdf/{}.pdf", paper_id),
                published_at: summary_mtime(store, &paper_id).unwrap_or_else(Utc::now),
            });
        }

        info!(
            "Rebuilding feed from {} cached summar{}",
            entries.len(),
            if entries.len() == 1 { "y" } else { "ies" }
        );

        let mut all = entries;
        all.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        all.truncate(self.retention);
        self.write_feed(&all, feed_path)
    }

    fn read_existing(&self, feed_path: &Path) -> Vec<FeedEntry> {
        let file = match std::fs::File::open(feed_path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };

        let channel = match Channel::read_from(BufReader::new(file)) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Existing feed {} is unreadable ({}), starting fresh",
                    feed_path.display(),
                    e
                );
                return Vec::new();
            }
        };

        channel
            .items()
            .iter()
            .filter_map(item_to_entry)
            .collect()
    }

    fn write_feed(&self, entries: &[FeedEntry], feed_path: &Path) -> Result<()> {
        let items: Vec<Item> = entries.iter().map(entry_to_item).collect();

        let channel = ChannelBuilder::default()
            .title(FEED_TITLE.to_string())
            .link(FEED_SITE_LINK.to_string())
            .description(FEED_DESCRIPTION.to_string())
            .items(items)
            .build();

        if let Some(parent) = feed_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = feed_path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        std::fs::write(&tmp_path, channel.to_string())?;
        if let Err(e) = std::fs::rename(&tmp_path, feed_path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(PipelineError::Io(e));
        }
        Ok(())
    }
}

fn entry_to_item(entry: &FeedEntry) -> Item {
    let mut guid = Guid::default();
    guid.set_value(entry.paper_id.clone());
    guid.set_permalink(false);

    ItemBuilder::default()
        .title(Some(entry.title.clone()))
        .link(Some(entry.link.clone()))
        .description(Some(entry.summary_excerpt.clone()))
        .pub_date(Some(entry.published_at.to_rfc2822()))
        .guid(Some(guid))
        .build()
}

fn item_to_entry(item: &Item) -> Option<FeedEntry> {
    let paper_id = item
        .guid()
        .map(|g| g.value().to_string())
        .or_else(|| item.link().and_then(|l| crate::collector::paper_id_from_url(l)))?;

    let published_at = item
        .pub_date()
        .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
        .map(|d| d.with_timezone(&Utc))?;

    Some(FeedEntry {
        paper_id,
        title: item.title().unwrap_or("Untitled").to_string(),
        summary_excerpt: item.description().unwrap_or("").to_string(),
        link: item.link().unwrap_or("").to_string(),
        published_at,
    })
}

/// Truncate markdown to roughly `max_chars`, breaking at a line boundary.
pub fn excerpt(markdown: &str, max_chars: usize) -> String {
    if markdown.chars().count() <= max_chars {
        return markdown.to_string();
    }

    let mut taken = String::new();
    for line in markdown.lines() {
        if taken.chars().count() + line.chars().count() + 1 > max_chars {
            break;
        }
        taken.push_str(line);
        taken.push('\n');
    }

    if taken.is_empty() {
        taken = markdown.chars().take(max_chars).collect();
    }
    format!("{}…", taken.trim_end())
}

fn summary_mtime(store: &ArtifactStore, paper_id: &str) -> Option<DateTime<Utc>> {
    let path = store
        .root()
        .join(Stage::Summary.dir_name())
        .join(format!("{}.md", paper_id));
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(paper_id: &str, age_minutes: i64) -> FeedEntry {
        FeedEntry {
            paper_id: paper_id.to_string(),
            title: format!("Paper {}", paper_id),
            summary_excerpt: "excerpt".to_string(),
            link: format!("https://arxiv.org/pdf/{}.pdf", paper_id),
            published_at: Utc::now() - Duration::minutes(age_minutes),
        }
    }

    #[test]
    fn retention_keeps_the_most_recent_entries() {
        let dir = tempfile::tempdir().unwrap();
        let feed_path = dir.path().join("feed.xml");
        let publisher = FeedPublisher::new(30);

        // 35 entries, oldest five must fall off.
        let entries: Vec<FeedEntry> = (0..35).map(|i| entry(&format!("p{:02}", i), i)).collect();
        publisher.publish(&entries, &feed_path).unwrap();

        let kept = publisher.read_existing(&feed_path);
        assert_eq!(kept.len(), 30);
        let ids: Vec<&str> = kept.iter().map(|e| e.paper_id.as_str()).collect();
        assert!(ids.contains(&"p00"));
        assert!(ids.contains(&"p29"));
        for old in 30..35 {
            assert!(!ids.contains(&format!("p{:02}", old).as_str()));
        }
    }

    #[test]
    fn merge_deduplicates_by_paper_id_with_new_entry_winning() {
        let dir = tempfile::tempdir().unwrap();
        let feed_path = dir.path().join("feed.xml");
        let publisher = FeedPublisher::new(30);

        publisher.publish(&[entry("p1", 60), entry("p2", 50)], &feed_path).unwrap();

        let mut updated = entry("p1", 0);
        updated.title = "Paper p1 (revised)".to_string();
        publisher.publish(&[updated], &feed_path).unwrap();

        let kept = publisher.read_existing(&feed_path);
        assert_eq!(kept.len(), 2);
        let p1 = kept.iter().find(|e| e.paper_id == "p1").unwrap();
        assert_eq!(p1.title, "Paper p1 (revised)");
    }

    #[test]
    fn entries_come_back_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let feed_path = dir.path().join("feed.xml");
        let publisher = FeedPublisher::new(30);

        publisher
            .publish(&[entry("old", 120), entry("new", 1), entry("mid", 60)], &feed_path)
            .unwrap();

        let kept = publisher.read_existing(&feed_path);
        let ids: Vec<&str> = kept.iter().map(|e| e.paper_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[test]
    fn corrupt_existing_feed_is_replaced_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let feed_path = dir.path().join("feed.xml");
        std::fs::write(&feed_path, "<not really xml").unwrap();

        let publisher = FeedPublisher::new(30);
        publisher.publish(&[entry("p1", 0)], &feed_path).unwrap();
        assert_eq!(publisher.read_existing(&feed_path).len(), 1);
    }

    #[tokio::test]
    async fn rebuild_reconstructs_entries_from_cached_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path().join("cache")).unwrap();
        let feed_path = dir.path().join("feed.xml");

        store
            .put(Stage::Summary, "2506.00001", b"## A clever method\nbody")
            .await
            .unwrap();
        store
            .put(
                Stage::Tags,
                "2506.00001",
                br#"{"top": ["ml"], "tags": ["x"]}"#,
            )
            .await
            .unwrap();
        store
            .put(Stage::Summary, "2506.00002", b"## Another paper\nbody")
            .await
            .unwrap();

        let publisher = FeedPublisher::new(30);
        publisher.rebuild(&store, &feed_path).await.unwrap();

        let kept = publisher.read_existing(&feed_path);
        assert_eq!(kept.len(), 2);
        let tagged = kept.iter().find(|e| e.paper_id == "2506.00001").unwrap();
        assert_eq!(tagged.title, "A clever method [ml]");
        assert!(tagged.link.ends_with("2506.00001.pdf"));
    }

    #[test]
    fn excerpt_breaks_at_line_boundaries() {
        let text = "line one\nline two\nline three";
        assert_eq!(excerpt(text, 1000), text);
        let short = excerpt(text, 20);
        assert!(short.starts_with("line one"));
        assert!(short.ends_with('…'));
    }
}

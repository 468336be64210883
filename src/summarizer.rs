use crate::llm::{CompletionClient, CompletionRequest};
use crate::types::{Chunk, LlmConfig, PipelineError, Result, RunningSummary, Summary, Tags};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

const PROGRESSIVE_PROMPT: &str = "\
You are summarizing an academic paper one passage at a time.

Below is the summary accumulated from the passages read so far, followed by \
the next passage. Update and extend the summary so it stays faithful to \
everything read so far. Keep it in Markdown with exactly these sections, \
preserving existing content unless the new passage corrects it:

## One-line Summary
## Innovations
## Results
## Glossary

Respond with the full updated summary only, no commentary.

--- SUMMARY SO FAR ---
{summary}

--- NEXT PASSAGE ---
{chunk}";

const TAG_PROMPT: &str = "\
Derive topic tags from the paper summary below.

Reply with a single JSON object and nothing else, using exactly these two \
keys: \"top\" (1 to 3 broad category names) and \"tags\" (1 to 5 specific \
terms). Example: {\"top\": [\"machine learning\"], \"tags\": [\"distillation\", \"LLM\"]}

--- SUMMARY ---
{summary}";

const TAG_RETRY_PROMPT: &str = "\
Your previous reply could not be parsed as the required JSON object:

--- PREVIOUS REPLY ---
{reply}

Reply again with ONLY a JSON object of the form \
{\"top\": [...], \"tags\": [...]} where \"top\" has 1-3 broad categories and \
\"tags\" has 1-5 specific terms. No prose, no code fences.";

/// Strict two-key shape the tagging reply must deserialize into.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TagsPayload {
    top: Vec<String>,
    tags: Vec<String>,
}

/// Folds chunked paper text into one coherent structured summary via a
/// sequence of bounded-context completion calls, then derives topic tags
/// from the result.
pub struct ProgressiveSummarizer {
    client: Arc<dyn CompletionClient>,
    config: LlmConfig,
}

impl ProgressiveSummarizer {
    pub fn new(client: Arc<dyn CompletionClient>, config: LlmConfig) -> Self {
        Self { client, config }
    }

    fn request(&self, prompt: String) -> CompletionRequest {
        CompletionRequest {
            prompt,
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
        }
    }

    /// Progressive summarization: one completion per chunk, each prompt
    /// carrying only the running summary and the current chunk, so context
    /// stays bounded no matter how long the paper is.
    pub async fn summarize(&self, chunks: &[Chunk]) -> Result<Summary> {
        let first = chunks.first().ok_or_else(|| {
            PipelineError::Extraction("cannot summarize an empty chunk sequence".to_string())
        })?;

        let mut running = RunningSummary::new(&first.paper_id);
        debug!(
            "Progressive summary for {} over {} chunk(s) via {}",
            running.paper_id,
            chunks.len(),
            self.client.provider_name()
        );

        for chunk in chunks {
            let prompt = PROGRESSIVE_PROMPT
                .replace("{summary}", &running.accumulated_text)
                .replace("{chunk}", &chunk.text);

            let reply = self.client.complete(self.request(prompt)).await?;
            running.accumulated_text = reply;
            running.stage_index += 1;
            debug!(
                "Chunk {}/{} folded for {}",
                chunk.index + 1,
                chunks.len(),
                running.paper_id
            );
        }

        info!("Summary complete for {}", running.paper_id);
        Ok(freeze(running))
    }

    /// Derive tags from a finished summary. Malformed replies are re-prompted
    /// with the raw reply quoted for correction; exhaustion is a
    /// `Tagging` error, which never invalidates the summary itself.
    pub async fn tag(&self, summary: &Summary) -> Result<Tags> {
        let mut prompt = TAG_PROMPT.replace("{summary}", &summary.raw_markdown);
        let mut last_problem = String::new();

        for attempt in 0..=self.config.tag_retries {
            let reply = self.client.complete(self.request(prompt.clone())).await?;

            match parse_tags_reply(&reply) {
                Ok(mut tags) => {
                    tags.paper_id = summary.paper_id.clone();
                    return Ok(tags);
                }
                Err(problem) => {
                    warn!(
                        "Tagging reply for {} rejected (attempt {}): {}",
                        summary.paper_id,
                        attempt + 1,
                        problem
                    );
                    last_problem = problem;
                    prompt = TAG_RETRY_PROMPT.replace("{reply}", &reply);
                }
            }
        }

        Err(PipelineError::Tagging(format!(
            "no valid tag JSON for {} after {} attempt(s): {}",
            summary.paper_id,
            self.config.tag_retries + 1,
            last_problem
        )))
    }
}

/// Rehydrate a [`Summary`] from its cached markdown artifact.
pub fn summary_from_markdown(paper_id: &str, raw_markdown: String) -> Summary {
    freeze(RunningSummary {
        paper_id: paper_id.to_string(),
        accumulated_text: raw_markdown,
        stage_index: 0,
    })
}

/// Freeze the accumulator into the immutable structured summary. Sections
/// missing from the model output are left empty rather than failing the
/// paper.
fn freeze(running: RunningSummary) -> Summary {
    let raw = running.accumulated_text;
    let one_line = section(&raw, "One-line Summary")
        .lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim()
        .to_string();

    let one_line = if one_line.is_empty() {
        first_header(&raw).unwrap_or_default()
    } else {
        one_line
    };

    Summary {
        paper_id: running.paper_id,
        one_line,
        innovations: section(&raw, "Innovations"),
        results: section(&raw, "Results"),
        glossary: section(&raw, "Glossary"),
        raw_markdown: raw,
    }
}

/// Body of a `## <name>` section, up to the next `##` heading.
fn section(markdown: &str, name: &str) -> String {
    let mut body = Vec::new();
    let mut in_section = false;

    for line in markdown.lines() {
        if let Some(heading) = line.strip_prefix("## ") {
            if in_section {
                break;
            }
            in_section = heading.trim().eq_ignore_ascii_case(name);
            continue;
        }
        if in_section {
            body.push(line);
        }
    }

    body.join("\n").trim().to_string()
}

/// First `## ` heading of a markdown document, with bold markers stripped.
pub fn first_header(markdown: &str) -> Option<String> {
    markdown
        .lines()
        .find_map(|line| line.strip_prefix("## "))
        .map(|h| h.replace("**", "").trim().to_string())
        .filter(|h| !h.is_empty())
}

/// Parse the tagging reply under the strict two-key contract. Returns a
/// human-readable rejection reason on failure so it can be fed back to the
/// model.
fn parse_tags_reply(reply: &str) -> std::result::Result<Tags, String> {
    // Models occasionally wrap JSON in fences or prose; take the outermost
    // object before parsing strictly.
    let start = reply.find('{').ok_or("no JSON object in reply")?;
    let end = reply.rfind('}').ok_or("no closing brace in reply")?;
    if end < start {
        return Err("braces out of order".to_string());
    }

    let payload: TagsPayload = serde_json::from_str(&reply[start..=end])
        .map_err(|e| format!("not the required two-key object: {}", e))?;

    if payload.top.is_empty() {
        return Err("\"top\" must have at least one category".to_string());
    }
    if payload.tags.is_empty() {
        return Err("\"tags\" must have at least one term".to_string());
    }

    let mut top = payload.top;
    let mut tags = payload.tags;
    top.truncate(3);
    tags.truncate(5);

    Ok(Tags {
        paper_id: String::new(),
        top,
        tags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockCompletionClient;

    fn chunk(paper_id: &str, index: usize, text: &str) -> Chunk {
        Chunk {
            paper_id: paper_id.to_string(),
            index,
            text: text.to_string(),
            char_range: 0..text.chars().count(),
        }
    }

    fn summary_markdown() -> &'static str {
        "## One-line Summary\nA faster attention variant.\n\n## Innovations\nSparse blocks.\n\n## Results\n2x speedup.\n\n## Glossary\nFLOP: floating point op."
    }

    fn summarizer(client: MockCompletionClient) -> ProgressiveSummarizer {
        ProgressiveSummarizer::new(Arc::new(client), LlmConfig::default())
    }

    #[tokio::test]
    async fn one_completion_per_chunk_in_document_order() {
        let client = MockCompletionClient::new("t").script(vec![
            "## One-line Summary\nfirst",
            summary_markdown(),
        ]);
        let client = Arc::new(client);
        let s = ProgressiveSummarizer::new(client.clone(), LlmConfig::default());

        let chunks = vec![chunk("p1", 0, "intro"), chunk("p1", 1, "methods")];
        let summary = s.summarize(&chunks).await.unwrap();

        assert_eq!(client.call_count(), 2);
        assert_eq!(summary.paper_id, "p1");
        assert_eq!(summary.one_line, "A faster attention variant.");
        assert_eq!(summary.innovations, "Sparse blocks.");
        assert_eq!(summary.results, "2x speedup.");
        assert_eq!(summary.glossary, "FLOP: floating point op.");
    }

    #[tokio::test]
    async fn empty_chunks_are_rejected() {
        let s = summarizer(MockCompletionClient::new("t"));
        assert!(s.summarize(&[]).await.is_err());
    }

    #[tokio::test]
    async fn tag_parses_valid_json() {
        let client = MockCompletionClient::new("t")
            .script(vec![r#"{"top": ["ml"], "tags": ["attention", "sparsity"]}"#]);
        let s = summarizer(client);

        let summary = Summary {
            paper_id: "p1".to_string(),
            one_line: "x".to_string(),
            innovations: String::new(),
            results: String::new(),
            glossary: String::new(),
            raw_markdown: summary_markdown().to_string(),
        };

        let tags = s.tag(&summary).await.unwrap();
        assert_eq!(tags.paper_id, "p1");
        assert_eq!(tags.top, vec!["ml"]);
        assert_eq!(tags.tags, vec!["attention", "sparsity"]);
    }

    #[tokio::test]
    async fn malformed_reply_is_retried_with_feedback_then_ok() {
        let client = MockCompletionClient::new("t").script(vec![
            "sure! here are some tags for you",
            r#"{"top": ["systems"], "tags": ["caching"]}"#,
        ]);
        let client = Arc::new(client);
        let s = ProgressiveSummarizer::new(client.clone(), LlmConfig::default());

        let summary = Summary {
            paper_id: "p1".to_string(),
            one_line: "x".to_string(),
            innovations: String::new(),
            results: String::new(),
            glossary: String::new(),
            raw_markdown: "## s".to_string(),
        };

        let tags = s.tag(&summary).await.unwrap();
        assert_eq!(client.call_count(), 2);
        assert_eq!(tags.top, vec!["systems"]);
    }

    #[tokio::test]
    async fn persistently_malformed_replies_become_tagging_error() {
        let client = MockCompletionClient::new("t").script(vec![
            "nope",
            r#"{"top": [], "tags": ["a"]}"#,
            r#"{"top": ["a"], "tags": ["b"], "extra": 1}"#,
        ]);
        let s = summarizer(client);

        let summary = Summary {
            paper_id: "p1".to_string(),
            one_line: "x".to_string(),
            innovations: String::new(),
            results: String::new(),
            glossary: String::new(),
            raw_markdown: "## s".to_string(),
        };

        let err = s.tag(&summary).await.unwrap_err();
        assert!(matches!(err, PipelineError::Tagging(_)));
    }

    #[tokio::test]
    async fn oversized_tag_sets_are_clamped() {
        let client = MockCompletionClient::new("t").script(vec![
            r#"{"top": ["a","b","c","d"], "tags": ["1","2","3","4","5","6","7"]}"#,
        ]);
        let s = summarizer(client);

        let summary = Summary {
            paper_id: "p1".to_string(),
            one_line: "x".to_string(),
            innovations: String::new(),
            results: String::new(),
            glossary: String::new(),
            raw_markdown: "## s".to_string(),
        };

        let tags = s.tag(&summary).await.unwrap();
        assert_eq!(tags.top.len(), 3);
        assert_eq!(tags.tags.len(), 5);
    }

    #[test]
    fn section_extraction_handles_missing_sections() {
        assert_eq!(section("## Results\nok", "Results"), "ok");
        assert_eq!(section("## Results\nok", "Glossary"), "");
        assert_eq!(first_header("intro\n## **Title** here\nbody").unwrap(), "Title here");
    }
}

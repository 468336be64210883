use crate::types::{LlmConfig, PipelineError, Result};
use async_trait::async_trait;
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// One text-completion request. The same shape works against DeepSeek, any
/// OpenAI-compatible endpoint, or a locally hosted completion service.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub model: String,
    pub max_tokens: Option<u32>,
}

/// Uniform text-completion capability used by the summarizer.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    fn provider_name(&self) -> String;

    /// Issue one completion. Implementations own their transport-level
    /// retry policy; an error here means retries are already exhausted.
    async fn complete(&self, request: CompletionRequest) -> Result<String>;
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequestBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ChatResponseBody {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// Client for any OpenAI-compatible `/chat/completions` endpoint, with
/// exponential-backoff retry on transport and throttling failures.
pub struct OpenAiCompatClient {
    http_client: reqwest::Client,
    config: LlmConfig,
}

impl OpenAiCompatClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            http_client,
            config,
        })
    }

    async fn complete_once(&self, request: &CompletionRequest) -> Result<String> {
        let body = ChatRequestBody {
            model: &request.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            temperature: 0.0,
            max_tokens: request.max_tokens,
        };

        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Llm(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(PipelineError::Llm(format!(
                "provider returned HTTP {}: {}",
                status, error_text
            )));
        }

        let parsed: ChatResponseBody = response
            .json()
            .await
            .map_err(|e| PipelineError::Llm(format!("malformed provider response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| PipelineError::Llm("provider returned no choices".to_string()))
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompatClient {
    fn provider_name(&self) -> String {
        format!("openai-compat ({})", self.config.base_url)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            let start = std::time::Instant::now();
            match self.complete_once(&request).await {
                Ok(text) => {
                    debug!(
                        model = %request.model,
                        duration_ms = start.elapsed().as_millis(),
                        "Completion finished"
                    );
                    return Ok(text);
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < self.config.max_retries {
                        if let Some(delay) = backoff.next_backoff() {
                            warn!(
                                "Completion attempt {} failed, retrying in {:?}",
                                attempt + 1,
                                delay
                            );
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| PipelineError::Llm("completion retries exhausted".to_string())))
    }
}

/// In-process completion client for development and tests.
///
/// Replies are taken from a scripted queue when one is loaded; otherwise a
/// deterministic echo of the prompt tail is produced. Call counting lets
/// tests assert that cached stages issue no completions.
pub struct MockCompletionClient {
    name: String,
    response_delay_ms: u64,
    scripted: Mutex<std::collections::VecDeque<String>>,
    fail_first: AtomicUsize,
    calls: AtomicUsize,
}

impl MockCompletionClient {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            response_delay_ms: 0,
            scripted: Mutex::new(std::collections::VecDeque::new()),
            fail_first: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.response_delay_ms = delay_ms;
        self
    }

    /// Queue exact replies returned (in order) before falling back to the
    /// default echo behavior.
    pub fn script(self, replies: Vec<&str>) -> Self {
        {
            let mut scripted = self.scripted.lock().unwrap();
            scripted.extend(replies.into_iter().map(String::from));
        }
        self
    }

    /// Make the first `n` calls fail with a transport error.
    pub fn fail_first(self, n: usize) -> Self {
        self.fail_first.store(n, Ordering::SeqCst);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionClient for MockCompletionClient {
    fn provider_name(&self) -> String {
        format!("mock ({})", self.name)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.response_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.response_delay_ms)).await;
        }

        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(PipelineError::Llm("mock transport failure".to_string()));
        }

        if let Some(reply) = self.scripted.lock().unwrap().pop_front() {
            return Ok(reply);
        }

        // Deterministic fallback: summarize by echoing the prompt tail.
        let tail: String = request
            .prompt
            .chars()
            .rev()
            .take(80)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        Ok(format!("## Summary\n\n{}", tail.trim()))
    }
}

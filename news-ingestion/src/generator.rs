use crate::config::GeneratorConfig;
use crate::types::{PipelineError, Result};
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error, warn};

/// A single generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask the backend for a JSON object.
    pub json_output: bool,
}

/// Text returned by a generator, with the usage it reported.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedText {
    pub text: String,
    pub tokens_used: Option<u32>,
}

/// Narrow generative-text capability used by the rewriter.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> String;

    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedText>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatUsage {
    total_tokens: u32,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat completions endpoint.
pub struct OpenAiGenerator {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_retries: u32,
    initial_retry_interval: Duration,
}

impl OpenAiGenerator {
    pub fn new(config: &GeneratorConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| PipelineError::Config("OPENAI_API_KEY is not set".to_string()))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_retries: config.max_retries,
            initial_retry_interval: Duration::from_millis(500),
        })
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.initial_retry_interval = interval;
        self
    }

    async fn call(&self, request: &GenerationRequest) -> Result<GeneratedText> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: &request.system },
                ChatMessage { role: "user", content: &request.prompt },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request.json_output.then_some(ResponseFormat { kind: "json_object" }),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(PipelineError::GenerationStatus { status: status.as_u16(), message });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::InvalidOutput(format!("unreadable completion: {}", e)))?;

        let tokens_used = parsed.usage.map(|u| u.total_tokens);
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(PipelineError::InvalidOutput("empty completion".to_string()));
        }
        Ok(GeneratedText { text: content, tokens_used })
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    fn name(&self) -> String {
        format!("openai ({})", self.model)
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedText> {
        let backoff = ExponentialBackoff {
            initial_interval: self.initial_retry_interval,
            current_interval: self.initial_retry_interval,
            max_elapsed_time: Some(Duration::from_secs(120)),
            ..Default::default()
        };
        let attempts = AtomicU32::new(0);

        retry(backoff, || async {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            match self.call(request).await {
                Ok(generated) => {
                    debug!(
                        tokens = ?generated.tokens_used,
                        "Generated {} chars on attempt {}",
                        generated.text.len(),
                        attempt + 1
                    );
                    Ok(generated)
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    warn!(error = %e, attempt = attempt + 1, "Transient generation error, retrying");
                    Err(backoff::Error::transient(e))
                }
                Err(e) => {
                    error!(error = %e, "Generation failed, not retrying");
                    Err(backoff::Error::permanent(e))
                }
            }
        })
        .await
    }
}

/// Deterministic generator for tests and dry runs.
///
/// Replies are served in order; the last one repeats once the queue is
/// down to a single reply.
pub struct MockTextGenerator {
    replies: Mutex<VecDeque<std::result::Result<String, String>>>,
    calls: AtomicUsize,
    delay: Duration,
    tokens_used: Option<u32>,
}

impl MockTextGenerator {
    pub fn new(reply: impl Into<String>) -> Self {
        Self::from_replies(vec![Ok(reply.into())])
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::from_replies(vec![Err(message.into())])
    }

    pub fn from_replies(replies: Vec<std::result::Result<String, String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            tokens_used: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Report this many tokens on every successful reply.
    pub fn with_tokens_used(mut self, tokens: u32) -> Self {
        self.tokens_used = Some(tokens);
        self
    }

    /// A well-formed rewrite payload with the given confidence.
    ///
    /// The body, excerpt and keywords are long enough to pass the default
    /// quality rules.
    pub fn rewrite_json(title: &str, confidence: f64) -> String {
        let paragraph = format!(
            "Residents and officials reacted to {} throughout the day, and the city council is expected to \
             return to the subject at its next session after a first round of consultations.",
            title
        );
        let body = format!(
            "# {}\n\n{}\n\n## Details\n\n{}\n\n## What comes next\n\n{}\n\n{}\n\n{}",
            title, paragraph, paragraph, paragraph, paragraph, paragraph
        );
        serde_json::json!({
            "title": title,
            "metaDescription": format!("{} in brief.", title),
            "content": body,
            "excerpt": format!("What happened with {}, and what it changes for residents in the coming weeks.", title),
            "keywords": ["local", "news", "city"],
            "category": "news",
            "confidence": confidence,
        })
        .to_string()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_reply(&self) -> std::result::Result<String, String> {
        let mut replies = match self.replies.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if replies.len() > 1 {
            replies.pop_front().unwrap_or_else(|| Err("no reply queued".to_string()))
        } else {
            replies.front().cloned().unwrap_or_else(|| Err("no reply queued".to_string()))
        }
    }
}

#[async_trait]
impl TextGenerator for MockTextGenerator {
    fn name(&self) -> String {
        "mock".to_string()
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<GeneratedText> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let text = self.next_reply().map_err(PipelineError::Generation)?;
        Ok(GeneratedText { text, tokens_used: self.tokens_used })
    }
}

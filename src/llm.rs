//! Chat-model client.
//!
//! [`ChatModel`] has two calls: a one-shot completion (used to generate
//! query paraphrases) and a streaming call that yields text fragments as the
//! model produces them. The stream is finite and cannot be restarted.
//!
//! [`OpenAIChat`] talks to any OpenAI-compatible `/v1/chat/completions`
//! endpoint and decodes the server-sent-event stream incrementally. A stream
//! only counts as complete once `data: [DONE]` arrives; a body that ends
//! early or stalls for longer than the configured timeout ends with an error.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::ChatConfig;

/// Lazy sequence of answer fragments.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Run the conversation to completion and return the whole reply.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;

    /// Start generation and return the reply as a fragment stream.
    ///
    /// Errors before the first fragment (auth, bad request) are returned
    /// directly; errors after that are yielded as stream items.
    async fn stream(&self, messages: &[ChatMessage]) -> Result<TokenStream>;
}

// ============ OpenAI-compatible client ============

pub struct OpenAIChat {
    model: String,
    temperature: f32,
    base_url: String,
    api_key: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl OpenAIChat {
    /// Requires `OPENAI_API_KEY` in the environment.
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let timeout = Duration::from_secs(config.timeout_secs);
        // No client-wide timeout: it would also cap how long an answer may stream.
        let client = reqwest::Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            model: config.model.clone(),
            temperature: config.temperature,
            base_url: config
                .url
                .as_deref()
                .unwrap_or("https://api.openai.com")
                .trim_end_matches('/')
                .to_string(),
            api_key,
            timeout,
            client,
        })
    }

    async fn post(&self, messages: &[ChatMessage], stream: bool) -> Result<reqwest::Response> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "stream": stream,
        });

        let mut request = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body);
        if !stream {
            request = request.timeout(self.timeout);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Chat API error {}: {}", status, body_text);
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatModel for OpenAIChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let payload: serde_json::Value = self.post(messages, false).await?.json().await?;
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("Invalid chat response: missing message content"))
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<TokenStream> {
        let response = self.post(messages, true).await?;
        let (tx, rx) = mpsc::channel::<Result<String>>(32);
        tokio::spawn(forward_events(response.bytes_stream(), tx, self.timeout));
        Ok(receiver_stream(rx))
    }
}

/// Decode an SSE body into tokens on `tx` until `[DONE]`.
///
/// The last item is an error unless `[DONE]` arrived; a stall longer than
/// `idle` counts as a failure. Stops early once the receiver is gone.
async fn forward_events<S, B, E>(bytes: S, tx: mpsc::Sender<Result<String>>, idle: Duration)
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<anyhow::Error>,
{
    let mut bytes = std::pin::pin!(bytes);
    let mut decoder = SseDecoder::default();
    loop {
        let chunk = match tokio::time::timeout(idle, bytes.next()).await {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(e))) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
            Ok(None) => {
                let _ = tx.send(Err(anyhow!("chat stream ended before [DONE]"))).await;
                return;
            }
            Err(_) => {
                let _ = tx
                    .send(Err(anyhow!("no data from chat stream for {:?}", idle)))
                    .await;
                return;
            }
        };
        for event in decoder.push(chunk.as_ref()) {
            let item = match event {
                SseEvent::Token(token) => Ok(token),
                SseEvent::Error(message) => Err(anyhow!(message)),
                SseEvent::Done => return,
            };
            let failed = item.is_err();
            if tx.send(item).await.is_err() || failed {
                return;
            }
        }
    }
}

/// Adapt a channel receiver into a [`TokenStream`].
pub fn receiver_stream(rx: mpsc::Receiver<Result<String>>) -> TokenStream {
    Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Token(String),
    Error(String),
    Done,
}

/// Incremental decoder for `data: {...}` lines of a chat-completions stream.
///
/// Network chunks may end mid-line or mid-UTF-8 sequence; incomplete lines
/// stay buffered until their newline arrives.
#[derive(Default)]
struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                events.push(SseEvent::Done);
                continue;
            }
            match serde_json::from_str::<serde_json::Value>(data) {
                Ok(json) => {
                    if let Some(message) = json["error"]["message"].as_str() {
                        events.push(SseEvent::Error(message.to_string()));
                    } else if let Some(content) = json["choices"][0]["delta"]["content"].as_str() {
                        if !content.is_empty() {
                            events.push(SseEvent::Token(content.to_string()));
                        }
                    }
                }
                Err(e) => tracing::debug!(error = %e, "skipping malformed stream line"),
            }
        }
        events
    }
}

/// Create the [`ChatModel`] named by `config.provider`.
pub fn create_chat_model(config: &ChatConfig) -> Result<Box<dyn ChatModel>> {
    match config.provider.as_str() {
        "openai" => Ok(Box::new(OpenAIChat::new(config)?)),
        other => bail!("Unknown chat provider: {}", other),
    }
}

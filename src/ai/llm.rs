//! Streaming chat-completion adapter (§4.3, feeds the Thinking pipeline of §4.7).
//!
//! Grounded in `translation/client.rs`'s reqwest client: classified-error retry with
//! exponential backoff, a `Debug` impl that doesn't leak the http client internals, and a
//! base-url-plus-path request builder. Unlike translation's single-shot `/translate` call,
//! the chat endpoint streams newline-delimited JSON chunks; each chunk is forwarded to the
//! caller as soon as it arrives so the Speaking state can start synthesizing the first
//! sentence before the model has finished the full reply (§9 design note on perceived
//! latency).

use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::{CancelHandle, UpstreamError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub text: String,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: "system".into(), text: text.into() }
    }
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: "user".into(), text: text.into() }
    }
    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: "assistant".into(), text: text.into() }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    #[serde(default)]
    delta: String,
    #[serde(default)]
    done: bool,
}

#[async_trait::async_trait]
pub trait ChatModel: Send + Sync {
    /// Begin a streamed completion. Returns a receiver of incremental text deltas; the
    /// channel closes when the model finishes, errors, or `cancel` fires.
    async fn stream_chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        temperature: f32,
        max_tokens: u32,
        cancel: CancelHandle,
    ) -> Result<mpsc::Receiver<Result<String, UpstreamError>>, UpstreamError>;
}

pub struct HttpChatModel {
    http: Client,
    base_url: String,
    max_retries: u32,
}

impl std::fmt::Debug for HttpChatModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpChatModel")
            .field("base_url", &self.base_url)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl HttpChatModel {
    pub fn new(base_url: impl Into<String>, timeout: Duration, max_retries: u32) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build llm http client");
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_retries,
        }
    }

    /// Open the streaming connection with classified retry on the initial request only;
    /// once bytes start flowing, a mid-stream drop is surfaced to the caller rather than
    /// silently retried (§4.7: a partial reply must not be replayed from scratch).
    async fn open_stream(
        &self,
        request: &ChatRequest<'_>,
    ) -> Result<reqwest::Response, UpstreamError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_millis(100 * 2u64.pow(attempt));
                warn!(attempt, ?delay, "retrying llm stream open");
                tokio::time::sleep(delay).await;
            }

            match self.http.post(&url).json(request).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    let transient = status.is_server_error() || status.as_u16() == 429;
                    let err = UpstreamError::from_reqwest_status(status);
                    last_err = Some(err);
                    if !transient {
                        break;
                    }
                }
                Err(e) => {
                    let transient = e.is_timeout() || e.is_connect();
                    last_err = Some(UpstreamError::from_reqwest(&e));
                    if !transient {
                        break;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| UpstreamError::Transient("llm stream open exhausted retries".into())))
    }
}

#[async_trait::async_trait]
impl ChatModel for HttpChatModel {
    async fn stream_chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        temperature: f32,
        max_tokens: u32,
        cancel: CancelHandle,
    ) -> Result<mpsc::Receiver<Result<String, UpstreamError>>, UpstreamError> {
        let request = ChatRequest {
            model,
            messages: &messages,
            temperature,
            max_tokens,
            stream: true,
        };
        let response = self.open_stream(&request).await?;

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buf = String::new();

            while let Some(chunk) = byte_stream.next().await {
                if cancel.is_cancelled() {
                    debug!("llm stream cancelled by caller");
                    break;
                }
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(UpstreamError::from_reqwest(&e))).await;
                        break;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim().to_string();
                    buf.drain(..=pos);
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ChatStreamChunk>(&line) {
                        Ok(parsed) => {
                            if !parsed.delta.is_empty() && tx.send(Ok(parsed.delta)).await.is_err() {
                                return;
                            }
                            if parsed.done {
                                return;
                            }
                        }
                        Err(e) => {
                            error!(error = %e, line, "unparseable llm stream chunk");
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

impl UpstreamError {
    fn from_reqwest_status(status: reqwest::StatusCode) -> Self {
        if status.is_server_error() || status.as_u16() == 429 {
            UpstreamError::Transient(format!("http {status}"))
        } else {
            UpstreamError::Fatal(format!("http {status}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_constructors_set_role() {
        assert_eq!(ChatMessage::system("x").role, "system");
        assert_eq!(ChatMessage::user("x").role, "user");
        assert_eq!(ChatMessage::assistant("x").role, "assistant");
    }

    #[test]
    fn status_classification_matches_upstream_taxonomy() {
        let transient = UpstreamError::from_reqwest_status(reqwest::StatusCode::SERVICE_UNAVAILABLE);
        assert!(transient.is_retryable());
        let fatal = UpstreamError::from_reqwest_status(reqwest::StatusCode::BAD_REQUEST);
        assert!(!fatal.is_retryable());
    }
}

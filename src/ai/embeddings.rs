//! Non-streaming embedding adapter (§4.3, feeds Knowledge Retrieval §4.4).
//!
//! Grounded directly in `translation/client.rs`'s single-shot request-with-retry pattern
//! (`translate_with_retry`): same exponential backoff, same classified last-error handling.
//! Embeddings have no natural streaming shape, so unlike [`super::llm`] and [`super::tts`]
//! this adapter is a plain async function returning the finished vector.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::UpstreamError;

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, UpstreamError>;
    fn dimensions(&self) -> usize;
}

pub struct HttpEmbedder {
    http: Client,
    base_url: String,
    max_retries: u32,
    dimensions: usize,
}

impl std::fmt::Debug for HttpEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEmbedder")
            .field("base_url", &self.base_url)
            .field("dimensions", &self.dimensions)
            .finish_non_exhaustive()
    }
}

impl HttpEmbedder {
    pub fn new(base_url: impl Into<String>, timeout: Duration, max_retries: u32, dimensions: usize) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build embeddings http client");
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_retries,
            dimensions,
        }
    }
}

#[async_trait::async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, UpstreamError> {
        let url = format!("{}/embed", self.base_url);
        let request = EmbedRequest { input: text };
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_millis(100 * 2u64.pow(attempt));
                warn!(attempt, ?delay, "retrying embeddings request");
                tokio::time::sleep(delay).await;
            }

            match self.http.post(&url).json(&request).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<EmbedResponse>()
                        .await
                        .map(|parsed| parsed.embedding)
                        .map_err(|e| UpstreamError::Fatal(format!("unparseable embedding response: {e}")));
                }
                Ok(resp) => {
                    let status = resp.status();
                    let transient = status.is_server_error() || status.as_u16() == 429;
                    last_err = Some(if transient {
                        UpstreamError::Transient(format!("http {status}"))
                    } else {
                        UpstreamError::Fatal(format!("http {status}"))
                    });
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

        Err(last_err.unwrap_or_else(|| UpstreamError::Transient("embeddings request exhausted retries".into())))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedder_reports_configured_dimensions() {
        let embedder = HttpEmbedder::new("http://localhost:8103", Duration::from_secs(5), 2, 1536);
        assert_eq!(embedder.dimensions(), 1536);
    }
}

//! Thin adapters over the three streaming AI collaborators (STT, LLM, TTS) plus
//! non-streaming embeddings (§4.3). Every adapter shares one shape: a lazy event stream
//! plus an explicit cancel handle, so the Voice Session can cancel promptly (observable
//! within 200ms per §9) regardless of which concrete provider is plugged in.
//!
//! Two client shapes cover all four collaborators: a reqwest-based HTTP adapter with
//! classified retry for the non-streaming calls, and a tokio-tungstenite streaming client
//! with a background reconnect task and a bounded outbound queue for the streaming ones.
//! Providers are dispatched dynamically behind a common capability set so the three
//! TTS/STT providers stay interchangeable.

pub mod embeddings;
pub mod llm;
pub mod stt;
pub mod tts;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// Normalized failure classes for all four AI collaborators (§4.3).
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("transient upstream failure: {0}")]
    Transient(String),
    #[error("fatal upstream failure: {0}")]
    Fatal(String),
}

impl UpstreamError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify a `reqwest` outcome the way every HTTP-backed adapter in this module does:
    /// timeouts/connects/5xx are transient, 4xx (other than 429) is fatal.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return Self::Transient(err.to_string());
        }
        if let Some(status) = err.status() {
            if status.is_server_error() || status.as_u16() == 429 {
                return Self::Transient(format!("http {status}"));
            }
            return Self::Fatal(format!("http {status}"));
        }
        Self::Transient(err.to_string())
    }
}

impl From<UpstreamError> for crate::error::AppError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Transient(msg) => crate::error::AppError::upstream_transient(msg),
            UpstreamError::Fatal(msg) => crate::error::AppError::upstream_fatal(msg),
        }
    }
}

/// A cooperative cancel signal shared between a stream's producer task and its caller.
/// Producers are expected to check [`CancelHandle::is_cancelled`] at every suspension
/// point and stop promptly; this is cheaper than needing a dedicated channel per stream.
#[derive(Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_handle_observes_cancel_across_clones() {
        let handle = CancelHandle::new();
        let clone = handle.clone();
        assert!(!clone.is_cancelled());
        handle.cancel();
        assert!(clone.is_cancelled());
    }
}

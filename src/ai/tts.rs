//! Streaming text-to-speech adapter (§4.3, consumed by the Speaking state of §4.8).
//!
//! Grounded in the same `voice/client.rs` streaming-socket shape as [`super::stt`]: a
//! per-utterance connection that pushes one request and receives a sequence of binary PCM
//! chunks terminated by a `done` control frame. TTS differs from STT in cardinality (one
//! short-lived connection per sentence rather than one long-lived connection per call) so
//! `synthesize` opens and tears down its own socket instead of running a background
//! reconnect task.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use super::{CancelHandle, UpstreamError};

#[derive(Debug, Clone)]
pub enum TtsEvent {
    /// Raw PCM16 audio at the provider's native sample rate (converted to the telephony
    /// frame format by the caller via [`crate::audio`]).
    AudioChunk(Vec<u8>),
    Done,
}

#[derive(Debug, Serialize)]
struct TtsWireRequest<'a> {
    voice_id: &'a str,
    text: &'a str,
    sample_rate: u32,
}

#[async_trait::async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(
        &self,
        voice_id: &str,
        text: &str,
        cancel: CancelHandle,
    ) -> Result<mpsc::Receiver<TtsEvent>, UpstreamError>;
}

#[derive(Debug, Clone)]
pub struct TtsClientConfig {
    pub url: String,
    pub sample_rate: u32,
    pub connect_timeout: Duration,
}

impl Default for TtsClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8102/tts".to_string(),
            sample_rate: 16_000,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

pub struct StreamingTtsClient {
    config: TtsClientConfig,
}

impl StreamingTtsClient {
    pub fn new(config: TtsClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl TextToSpeech for StreamingTtsClient {
    async fn synthesize(
        &self,
        voice_id: &str,
        text: &str,
        cancel: CancelHandle,
    ) -> Result<mpsc::Receiver<TtsEvent>, UpstreamError> {
        let (ws_stream, _) = tokio::time::timeout(self.config.connect_timeout, connect_async(&self.config.url))
            .await
            .map_err(|_| UpstreamError::Transient("tts connect timed out".into()))?
            .map_err(|e| UpstreamError::Transient(format!("tts connect failed: {e}")))?;

        let (mut write, mut read) = ws_stream.split();

        let request = TtsWireRequest {
            voice_id,
            text,
            sample_rate: self.config.sample_rate,
        };
        let body = serde_json::to_string(&request)
            .map_err(|e| UpstreamError::Fatal(format!("tts request serialize failed: {e}")))?;
        write
            .send(Message::Text(body))
            .await
            .map_err(|e| UpstreamError::Transient(format!("tts send failed: {e}")))?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
                match read.next().await {
                    Some(Ok(Message::Binary(bytes))) => {
                        if tx.send(TtsEvent::AudioChunk(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) if text == "done" => {
                        let _ = tx.send(TtsEvent::Done).await;
                        break;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = tx.send(TtsEvent::Done).await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "tts websocket read error");
                        break;
                    }
                }
            }
            debug!("tts synthesis stream closed");
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_use_inference_sample_rate() {
        let config = TtsClientConfig::default();
        assert_eq!(config.sample_rate, crate::audio::INFERENCE_SAMPLE_RATE);
    }
}

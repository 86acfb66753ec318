//! Streaming speech-to-text adapter (§4.3).
//!
//! A background connection task owns the tokio-tungstenite socket, reconnects with linear
//! backoff up to a cap, and exposes the caller a bounded outbound queue plus a broadcast
//! channel of decoded events. The binary wire format is `[4-byte header len][JSON
//! header][raw PCM]`, with the header carrying the call/session id.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::{CancelHandle, UpstreamError};

/// Decoded events surfaced to the Voice Session's Listening state (§4.6).
#[derive(Debug, Clone, PartialEq)]
pub enum SttEvent {
    Partial(String),
    Final(String),
    SpeechStarted,
    UtteranceEnd,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SttWireRequest {
    Audio {
        session_id: String,
        sample_rate: u32,
        #[serde(skip)]
        audio_base64: (),
    },
    Ping,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SttWireResponse {
    Partial { text: String },
    Final { text: String },
    SpeechStarted,
    UtteranceEnd,
}

impl From<SttWireResponse> for SttEvent {
    fn from(resp: SttWireResponse) -> Self {
        match resp {
            SttWireResponse::Partial { text } => SttEvent::Partial(text),
            SttWireResponse::Final { text } => SttEvent::Final(text),
            SttWireResponse::SpeechStarted => SttEvent::SpeechStarted,
            SttWireResponse::UtteranceEnd => SttEvent::UtteranceEnd,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct SttClientConfig {
    pub url: String,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub ping_interval: Duration,
    pub max_queue_size: usize,
}

impl Default for SttClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8101/stt".to_string(),
            reconnect_delay: Duration::from_millis(500),
            max_reconnect_attempts: 10,
            ping_interval: Duration::from_secs(10),
            max_queue_size: 64,
        }
    }
}

struct AudioFrame {
    session_id: String,
    sample_rate: u32,
    pcm: Vec<u8>,
}

/// A streaming STT session bound to one call. One client per active call; the Voice
/// Session drops it when the call ends.
pub struct StreamingSttClient {
    config: SttClientConfig,
    state: Arc<RwLock<ConnectionState>>,
    audio_tx: mpsc::Sender<AudioFrame>,
    events_tx: broadcast::Sender<SttEvent>,
    cancel: CancelHandle,
}

impl StreamingSttClient {
    pub fn connect(config: SttClientConfig, session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        let (audio_tx, audio_rx) = mpsc::channel(config.max_queue_size);
        let (events_tx, _) = broadcast::channel(256);
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let cancel = CancelHandle::new();

        tokio::spawn(connection_handler(
            config.clone(),
            session_id,
            audio_rx,
            events_tx.clone(),
            state.clone(),
            cancel.clone(),
        ));

        Self {
            config,
            state,
            audio_tx,
            events_tx,
            cancel,
        }
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SttEvent> {
        self.events_tx.subscribe()
    }

    /// Push one 8kHz µ-law-decoded, resampled-to-16kHz PCM frame for transcription.
    /// Non-blocking; drops the frame under backpressure rather than stalling the caller
    /// (audio is perishable, unlike the §4.1 pool acquire path).
    pub fn send_frame(&self, session_id: &str, sample_rate: u32, pcm: Vec<u8>) {
        let frame = AudioFrame {
            session_id: session_id.to_string(),
            sample_rate,
            pcm,
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = self.audio_tx.try_send(frame) {
            warn!("stt audio queue full, dropping frame");
        }
    }

    /// Stop the connection task and drop all pending audio (§4.6: cancel must be
    /// observable promptly, e.g. on barge-in).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

async fn connection_handler(
    config: SttClientConfig,
    session_id: String,
    mut audio_rx: mpsc::Receiver<AudioFrame>,
    events_tx: broadcast::Sender<SttEvent>,
    state: Arc<RwLock<ConnectionState>>,
    cancel: CancelHandle,
) {
    let mut reconnect_attempts = 0;

    while !cancel.is_cancelled() {
        *state.write().await = ConnectionState::Connecting;
        info!(url = %config.url, %session_id, "connecting to stt provider");

        match connect_async(&config.url).await {
            Ok((ws_stream, _)) => {
                *state.write().await = ConnectionState::Connected;
                reconnect_attempts = 0;
                let (mut write, mut read) = ws_stream.split();

                let events_tx_clone = events_tx.clone();
                let reader_cancel = cancel.clone();
                let reader_handle = tokio::spawn(async move {
                    while let Some(msg) = read.next().await {
                        if reader_cancel.is_cancelled() {
                            break;
                        }
                        match msg {
                            Ok(Message::Text(text)) => {
                                match serde_json::from_str::<SttWireResponse>(&text) {
                                    Ok(resp) => {
                                        let _ = events_tx_clone.send(resp.into());
                                    }
                                    Err(e) => warn!(error = %e, "unparseable stt response"),
                                }
                            }
                            Ok(Message::Close(_)) => break,
                            Err(e) => {
                                error!(error = %e, "stt websocket read error");
                                break;
                            }
                            _ => {}
                        }
                    }
                });

                let mut ping_interval = tokio::time::interval(config.ping_interval);
                loop {
                    if cancel.is_cancelled() {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                    tokio::select! {
                        Some(frame) = audio_rx.recv() => {
                            let header = SttWireRequest::Audio {
                                session_id: frame.session_id.clone(),
                                sample_rate: frame.sample_rate,
                                audio_base64: (),
                            };
                            let header_json = match serde_json::to_string(&header) {
                                Ok(j) => j,
                                Err(e) => { error!(error = %e, "failed to serialize stt header"); continue; }
                            };
                            let header_bytes = header_json.as_bytes();
                            let header_len = header_bytes.len() as u32;
                            let mut binary_msg = Vec::with_capacity(4 + header_bytes.len() + frame.pcm.len());
                            binary_msg.extend_from_slice(&header_len.to_le_bytes());
                            binary_msg.extend_from_slice(header_bytes);
                            binary_msg.extend_from_slice(&frame.pcm);

                            if let Err(e) = write.send(Message::Binary(binary_msg)).await {
                                error!(error = %e, "failed to send audio to stt provider");
                                break;
                            }
                        }
                        _ = ping_interval.tick() => {
                            if write.send(Message::Ping(Vec::new())).await.is_err() {
                                break;
                            }
                        }
                        else => break,
                    }
                }

                reader_handle.abort();
            }
            Err(e) => {
                error!(error = %e, "failed to connect to stt provider");
            }
        }

        if cancel.is_cancelled() {
            break;
        }

        *state.write().await = ConnectionState::Reconnecting;
        reconnect_attempts += 1;
        if reconnect_attempts >= config.max_reconnect_attempts {
            error!(attempts = reconnect_attempts, "stt max reconnect attempts reached");
            break;
        }
        tokio::time::sleep(config.reconnect_delay * reconnect_attempts).await;
    }

    *state.write().await = ConnectionState::Disconnected;
}

/// Non-streaming fallback classification for providers that return a hard HTTP error
/// instead of a socket drop (e.g. auth rejected before upgrade).
pub fn classify_handshake_error(err: &tokio_tungstenite::tungstenite::Error) -> UpstreamError {
    match err {
        tokio_tungstenite::tungstenite::Error::Http(resp) => {
            let status = resp.status();
            if status.is_server_error() || status.as_u16() == 429 {
                UpstreamError::Transient(format!("stt handshake http {status}"))
            } else {
                UpstreamError::Fatal(format!("stt handshake http {status}"))
            }
        }
        _ => UpstreamError::Transient(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_documented_reconnect_policy() {
        let config = SttClientConfig::default();
        assert_eq!(config.max_reconnect_attempts, 10);
        assert!(config.ping_interval >= Duration::from_secs(5));
    }

    #[test]
    fn wire_response_maps_to_stt_event() {
        let partial = SttWireResponse::Partial { text: "hel".into() };
        assert_eq!(SttEvent::from(partial), SttEvent::Partial("hel".into()));
        assert_eq!(SttEvent::from(SttWireResponse::SpeechStarted), SttEvent::SpeechStarted);
    }
}

//! Telephony media WebSocket bridge (§4.6-§4.8): the per-call socket loop that turns the
//! provider's inbound audio-streaming protocol into [`VoiceSession`] transitions and turns
//! synthesized speech back into outbound media frames.
//!
//! Grounded in `ai/stt.rs`'s connection-task shape (split sink/stream, a dedicated writer
//! owning the sink so every outbound write is serialized) and in `session::pipeline` for
//! the Thinking/Speaking cycle itself; this module is the glue between the two.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::ai::stt::{SttClientConfig, SttEvent, StreamingSttClient};
use crate::ai::tts::TtsEvent;
use crate::ai::CancelHandle;
use crate::audio;
use crate::config::AppConfig;
use crate::db::models::Speaker;
use crate::db::CallRepo;
use crate::error::{AppError, AppResult};
use crate::retrieval::RetrievalConfig;
use crate::session::{run_thinking, SessionState, ThinkingOutcome, VoiceSession};

use super::AppState;

/// How much prior transcript the Thinking pipeline is allowed to carry into the prompt
/// before the oldest caller/agent pair is trimmed (§4.7).
const HISTORY_TOKEN_BUDGET: usize = 2048;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub call_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum InboundFrame {
    Connected,
    Start { start: StartPayload },
    Media { media: MediaPayload },
    Dtmf { dtmf: DtmfPayload },
    Mark { mark: MarkPayload },
    Stop { stop: StopPayload },
}

#[derive(Debug, Deserialize)]
struct StartPayload {
    #[serde(rename = "streamSid")]
    stream_sid: String,
    #[serde(rename = "callSid", default)]
    #[allow(dead_code)]
    call_sid: Option<String>,
    #[serde(rename = "customParameters", default)]
    #[allow(dead_code)]
    custom_parameters: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct MediaPayload {
    payload: String,
}

#[derive(Debug, Deserialize)]
struct DtmfPayload {
    #[allow(dead_code)]
    digit: String,
}

#[derive(Debug, Deserialize)]
struct MarkPayload {
    #[allow(dead_code)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct StopPayload {
    #[serde(rename = "callSid", default)]
    #[allow(dead_code)]
    call_sid: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum OutboundFrame {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        #[serde(rename = "sequenceNumber")]
        sequence_number: String,
        media: OutboundMediaPayload,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: MarkPayload,
    },
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

#[derive(Debug, Serialize)]
struct OutboundMediaPayload {
    payload: String,
}

pub async fn telephony_ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<StreamQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = run_stream(socket, state, params.call_id.clone()).await {
            warn!(call_id = %params.call_id, error = %e, "telephony stream ended with error");
        }
    })
    .into_response()
}

async fn run_stream(socket: WebSocket, state: AppState, call_id: String) -> AppResult<()> {
    let (sink, mut stream) = socket.split();
    let stream_sid = await_start_frame(&mut stream).await?;

    let call = CallRepo::get_by_id(&state.db, &call_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("call {call_id} not found")))?;
    let agent = call.agent_snapshot();
    let session = Arc::new(VoiceSession::new(call.id.clone(), agent));
    state.sessions.insert(call.id.clone(), session.clone());

    let config = AppConfig::get();
    let stt_config = SttClientConfig {
        url: config.ai.stt_url.clone(),
        ..SttClientConfig::default()
    };
    let stt_client = Arc::new(StreamingSttClient::connect(stt_config, call.id.clone()));

    if session.connect(&state.stt_pool, stt_client.clone()).await.is_err() {
        state.sessions.remove(&call.id);
        return Ok(());
    }

    CallRepo::mark_started(&state.db, &call.id).await?;
    CallRepo::set_provider_ids(&state.db, &call.id, None, Some(&stream_sid)).await?;

    let (out_tx, out_rx) = mpsc::channel::<OutboundFrame>(64);
    let writer = tokio::spawn(run_writer(sink, out_rx));

    session.enter_greeting().await.ok();
    let greeting_cancel = session.begin_turn().await;
    speak_and_persist(&state, &session, &stream_sid, &out_tx, &session.agent.greeting.clone(), greeting_cancel).await;
    session.greeting_complete().await.ok();

    let mut stt_events = stt_client.subscribe();

    loop {
        if session.state().await == SessionState::Ended {
            break;
        }

        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound_frame(&text, &call.id, &stt_client);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(call_id = %call.id, error = %e, "telephony ws read error");
                        break;
                    }
                    _ => {}
                }
            }
            event = stt_events.recv() => {
                match event {
                    Ok(SttEvent::SpeechStarted) => {
                        if session.on_speech_started().await.is_ok() {
                            let _ = out_tx.send(OutboundFrame::Clear { stream_sid: stream_sid.clone() }).await;
                        }
                    }
                    Ok(SttEvent::Partial(text)) => {
                        session.accumulate_partial(&text).await;
                    }
                    Ok(SttEvent::Final(text)) => {
                        session.accumulate_partial(&text).await;
                    }
                    Ok(SttEvent::UtteranceEnd) => {
                        if let Ok(Some(transcript)) = session.start_thinking().await {
                            if transcript.trim().is_empty() {
                                session.finish_thinking(false).await.ok();
                                session.speaking_complete().await.ok();
                            } else {
                                tokio::spawn(process_turn(
                                    state.clone(),
                                    session.clone(),
                                    stream_sid.clone(),
                                    out_tx.clone(),
                                    transcript,
                                ));
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    stt_client.cancel();
    state.sessions.remove(&call.id);
    if session.state().await != SessionState::Ended {
        // WS closed out from under an in-flight turn: give it up to the grace window to
        // finish speaking before forcing the call record closed (§4.6).
        session.grace_wait_then_force_end(&state.db, Duration::from_millis(config.session.grace_window_ms), None).await;
    }
    drop(out_tx);
    writer.await.ok();
    Ok(())
}

fn handle_inbound_frame(text: &str, call_id: &str, stt_client: &StreamingSttClient) {
    match serde_json::from_str::<InboundFrame>(text) {
        Ok(InboundFrame::Media { media }) => {
            let Ok(raw) = BASE64.decode(&media.payload) else {
                return;
            };
            let pcm_16k = audio::decode_mulaw_8k(&raw);
            stt_client.send_frame(call_id, audio::INFERENCE_SAMPLE_RATE, audio::samples_to_pcm_bytes(&pcm_16k));
        }
        Ok(InboundFrame::Connected | InboundFrame::Start { .. } | InboundFrame::Dtmf { .. } | InboundFrame::Mark { .. } | InboundFrame::Stop { .. }) => {}
        Err(e) => warn!(call_id, error = %e, "unparseable telephony frame"),
    }
}

async fn await_start_frame(stream: &mut SplitStream<WebSocket>) -> AppResult<String> {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<InboundFrame>(&text) {
                Ok(InboundFrame::Connected) => continue,
                Ok(InboundFrame::Start { start }) => return Ok(start.stream_sid),
                _ => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => return Err(AppError::validation(format!("telephony ws read error before start: {e}"))),
        }
    }
    Err(AppError::validation("telephony stream closed before a start frame arrived"))
}

async fn run_writer(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<OutboundFrame>) {
    while let Some(frame) = rx.recv().await {
        let json = match serde_json::to_string(&frame) {
            Ok(j) => j,
            Err(e) => {
                error!(error = %e, "failed to serialize outbound telephony frame");
                continue;
            }
        };
        if sink.send(Message::Text(json)).await.is_err() {
            break;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

/// Run one Thinking/Speaking cycle for a finalized caller utterance (§4.7, §4.8). Spawned
/// as its own task so the session's main loop keeps servicing inbound audio (and therefore
/// barge-in) while the LLM/TTS round trip is in flight.
async fn process_turn(
    state: AppState,
    session: Arc<VoiceSession>,
    stream_sid: String,
    out_tx: mpsc::Sender<OutboundFrame>,
    transcript: String,
) {
    let config = AppConfig::get();
    if let Err(e) = CallRepo::append_transcript_turn(&state.db, &session.call_id, Speaker::Caller, &transcript).await {
        warn!(call_id = %session.call_id, error = %e, "failed to persist caller transcript turn");
    }

    let history = CallRepo::transcript(&state.db, &session.call_id).await.unwrap_or_default();
    let retrieval_config = RetrievalConfig {
        top_k: config.retrieval.top_k,
        min_score: config.retrieval.min_score,
    };
    let cancel = session.begin_turn().await;

    let outcome = run_thinking(
        &session.agent,
        &state.db,
        state.embedder.as_ref(),
        state.chat.as_ref(),
        retrieval_config,
        &history,
        &transcript,
        HISTORY_TOKEN_BUDGET,
        Duration::from_millis(config.session.llm_first_token_timeout_ms),
        Duration::from_millis(config.session.llm_mid_stream_timeout_ms),
        cancel.clone(),
    )
    .await;

    match outcome {
        Ok(ThinkingOutcome::EndCall { acknowledgement }) => {
            session.finish_thinking(true).await.ok();
            speak_and_persist(&state, &session, &stream_sid, &out_tx, &acknowledgement, cancel).await;
            session.end(&state.db, None).await.ok();
        }
        Ok(ThinkingOutcome::Speaking { mut sentences }) => {
            session.finish_thinking(false).await.ok();
            while let Some(sentence) = sentences.recv().await {
                if cancel.is_cancelled() {
                    break;
                }
                speak_and_persist(&state, &session, &stream_sid, &out_tx, &sentence, cancel.clone()).await;
            }
            session.speaking_complete().await.ok();
        }
        Err(e) => {
            error!(call_id = %session.call_id, error = %e, "thinking pipeline failed");
            session.finish_thinking(false).await.ok();
            session.speaking_complete().await.ok();
        }
    }
}

/// Synthesize one sentence, encode it back down to telephony-rate frames, and write them
/// out in order; persists the spoken text as an agent transcript turn once done speaking
/// (§4.8). Checked against `cancel` between chunks so a barge-in stops mid-utterance.
async fn speak_and_persist(
    state: &AppState,
    session: &VoiceSession,
    stream_sid: &str,
    out_tx: &mpsc::Sender<OutboundFrame>,
    text: &str,
    cancel: CancelHandle,
) {
    if text.is_empty() || out_tx.is_closed() {
        return;
    }

    let mut rx = match state.tts.synthesize(&session.agent.tts_voice_id, text, cancel.clone()).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!(call_id = %session.call_id, error = %e, "tts synthesis failed");
            return;
        }
    };

    while let Some(event) = rx.recv().await {
        if cancel.is_cancelled() {
            break;
        }
        match event {
            TtsEvent::AudioChunk(bytes) => {
                let Ok(samples) = audio::pcm_bytes_to_samples(&bytes) else {
                    continue;
                };
                let pcm_8k = audio::downsample_to_telephony(&samples);
                let pcm_8k_bytes = audio::samples_to_pcm_bytes(&pcm_8k);
                let Ok(frames) = audio::frame_for_provider(&pcm_8k_bytes) else {
                    continue;
                };
                for frame in frames {
                    let sent = out_tx
                        .send(OutboundFrame::Media {
                            stream_sid: stream_sid.to_string(),
                            sequence_number: session.next_sequence_number().to_string(),
                            media: OutboundMediaPayload { payload: BASE64.encode(frame) },
                        })
                        .await;
                    if sent.is_err() {
                        return;
                    }
                }
            }
            TtsEvent::Done => break,
        }
    }

    if let Err(e) = CallRepo::append_transcript_turn(&state.db, &session.call_id, Speaker::Agent, text).await {
        warn!(call_id = %session.call_id, error = %e, "failed to persist agent transcript turn");
    }
    let _ = out_tx
        .send(OutboundFrame::Mark { stream_sid: stream_sid.to_string(), mark: MarkPayload { name: "sentence-end".to_string() } })
        .await;
    info!(call_id = %session.call_id, "spoke sentence");
}

//! The Thinking pipeline (§4.7): normalize, detect end-call, retrieve, build the prompt,
//! stream the LLM reply, and split it into sentences as they arrive so Speaking (§4.8) can
//! start synthesizing the first sentence before the reply is finished.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use super::sentence::SentenceSplitter;
use super::{detect_end_call, normalize_transcript};
use crate::ai::llm::ChatModel;
use crate::ai::embeddings::Embedder;
use crate::ai::CancelHandle;
use crate::db::models::{AgentSnapshot, TranscriptTurn};
use crate::db::DbPool;
use crate::error::AppResult;
use crate::retrieval::{self, RetrievalConfig};

const BUILTIN_FAREWELL: &str = "Thank you. Goodbye.";
const FIRST_TOKEN_FALLBACK: &str = "One moment.";
const LLM_RETRY_FALLBACK: &str = "Sorry, I'm having trouble right now. Could you say that again?";

pub enum ThinkingOutcome {
    EndCall { acknowledgement: String },
    Speaking { sentences: mpsc::Receiver<String> },
}

#[allow(clippy::too_many_arguments)]
pub async fn run_thinking(
    agent: &AgentSnapshot,
    pool: &DbPool,
    embedder: &dyn Embedder,
    chat: &dyn ChatModel,
    retrieval_config: RetrievalConfig,
    history: &[TranscriptTurn],
    transcript: &str,
    history_token_budget: usize,
    llm_first_token_timeout: Duration,
    llm_mid_stream_timeout: Duration,
    cancel: CancelHandle,
) -> AppResult<ThinkingOutcome> {
    let normalized = normalize_transcript(transcript);

    if detect_end_call(&normalized, &agent.end_call_phrases) {
        // `agent.end_call_phrases` lists phrases to detect, not a farewell to speak; the
        // Voice Session has no separate configured-farewell field, so the built-in phrase
        // is always used here (§4.7 step 2).
        return Ok(ThinkingOutcome::EndCall { acknowledgement: BUILTIN_FAREWELL.to_string() });
    }

    let knowledge_base_configured = agent.knowledge_base_id.as_deref().is_some_and(|id| !id.is_empty());
    let retrieved = if knowledge_base_configured && retrieval::is_knowledge_seeking(&normalized) {
        match retrieval::retrieve(pool, embedder, &agent.agent_id, transcript, retrieval_config).await {
            Ok(passages) => passages,
            Err(e) => {
                warn!(agent_id = %agent.agent_id, error = %e, "retrieval failed, continuing ungrounded");
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    let messages = crate::prompt::build_messages(agent, history, &retrieved, transcript, history_token_budget);
    let max_tokens = agent.llm_max_tokens.unwrap_or(512).max(1) as u32;
    let temperature = agent.llm_temperature as f32;

    // §7: an UpstreamTransient opening the stream gets one retry with the same messages
    // at a capped temperature; a second failure ends the turn with a short fallback
    // instead of propagating the error (a caller is live on the line, not a batch job).
    let mut rx = match chat
        .stream_chat(&agent.llm_model, messages.clone(), temperature, max_tokens, cancel.clone())
        .await
    {
        Ok(rx) => rx,
        Err(e) => {
            warn!(agent_id = %agent.agent_id, error = %e, "llm stream open failed, retrying at capped temperature");
            let retried = chat
                .stream_chat(&agent.llm_model, messages, temperature.min(0.5), max_tokens, cancel.clone())
                .await;
            match retried {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(agent_id = %agent.agent_id, error = %e, "llm stream retry also failed, falling back");
                    let (out_tx, out_rx) = mpsc::channel(1);
                    let _ = out_tx.send(LLM_RETRY_FALLBACK.to_string()).await;
                    return Ok(ThinkingOutcome::Speaking { sentences: out_rx });
                }
            }
        }
    };

    let (out_tx, out_rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut splitter = SentenceSplitter::new();

        let first = tokio::time::timeout(llm_first_token_timeout, rx.recv()).await;
        match first {
            Err(_) => {
                cancel.cancel();
                let _ = out_tx.send(FIRST_TOKEN_FALLBACK.to_string()).await;
                return;
            }
            Ok(None) | Ok(Some(Err(_))) => {
                let _ = out_tx.send(FIRST_TOKEN_FALLBACK.to_string()).await;
                return;
            }
            Ok(Some(Ok(delta))) => {
                for sentence in splitter.push(&delta) {
                    if out_tx.send(sentence).await.is_err() {
                        return;
                    }
                }
            }
        }

        loop {
            match tokio::time::timeout(llm_mid_stream_timeout, rx.recv()).await {
                Err(_) => {
                    cancel.cancel();
                    break;
                }
                Ok(None) | Ok(Some(Err(_))) => break,
                Ok(Some(Ok(delta))) => {
                    for sentence in splitter.push(&delta) {
                        if out_tx.send(sentence).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }

        if let Some(rest) = splitter.finish() {
            let _ = out_tx.send(rest).await;
        }
    });

    Ok(ThinkingOutcome::Speaking { sentences: out_rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::AgentSnapshot;

    fn agent() -> AgentSnapshot {
        AgentSnapshot {
            agent_id: "agent-1".into(),
            persona: "a helpful assistant".into(),
            greeting: "Hi there".into(),
            language: "English".into(),
            llm_model: "test-model".into(),
            llm_temperature: 0.5,
            llm_max_tokens: Some(100),
            tts_provider: "test".into(),
            tts_voice_id: "voice-1".into(),
            end_call_phrases: vec!["goodbye".into()],
            knowledge_base_id: None,
        }
    }

    #[tokio::test]
    async fn end_call_phrase_short_circuits_before_any_llm_call() {
        struct PanicChat;
        #[async_trait::async_trait]
        impl ChatModel for PanicChat {
            async fn stream_chat(
                &self,
                _model: &str,
                _messages: Vec<crate::ai::llm::ChatMessage>,
                _temperature: f32,
                _max_tokens: u32,
                _cancel: CancelHandle,
            ) -> Result<mpsc::Receiver<Result<String, crate::ai::UpstreamError>>, crate::ai::UpstreamError> {
                panic!("must not be called when end-call short-circuits");
            }
        }
        struct PanicEmbedder;
        #[async_trait::async_trait]
        impl Embedder for PanicEmbedder {
            async fn embed(&self, _text: &str) -> Result<Vec<f32>, crate::ai::UpstreamError> {
                panic!("must not be called");
            }
            fn dimensions(&self) -> usize {
                0
            }
        }

        let pool = crate::db::queries::setup_test_db().await;
        let agent = agent();
        let config = RetrievalConfig { top_k: 5, min_score: 0.7 };
        let outcome = run_thinking(
            &agent,
            &pool,
            &PanicEmbedder,
            &PanicChat,
            config,
            &[],
            "okay goodbye",
            1000,
            Duration::from_secs(4),
            Duration::from_secs(2),
            CancelHandle::new(),
        )
        .await
        .unwrap();

        assert!(matches!(outcome, ThinkingOutcome::EndCall { .. }));
    }

    struct PanicEmbedder;
    #[async_trait::async_trait]
    impl Embedder for PanicEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, crate::ai::UpstreamError> {
            panic!("must not be called: no knowledge base configured");
        }
        fn dimensions(&self) -> usize {
            0
        }
    }

    /// §7: a second consecutive stream-open failure (after the capped-temperature retry)
    /// ends the turn with a short spoken fallback instead of propagating an error.
    #[tokio::test]
    async fn llm_stream_open_failure_retries_then_falls_back_to_speech() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use tokio::sync::Mutex;

        struct AlwaysFailChat {
            attempts: AtomicU32,
            seen_temperatures: Mutex<Vec<f32>>,
        }
        #[async_trait::async_trait]
        impl ChatModel for AlwaysFailChat {
            async fn stream_chat(
                &self,
                _model: &str,
                _messages: Vec<crate::ai::llm::ChatMessage>,
                temperature: f32,
                _max_tokens: u32,
                _cancel: CancelHandle,
            ) -> Result<mpsc::Receiver<Result<String, crate::ai::UpstreamError>>, crate::ai::UpstreamError> {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                self.seen_temperatures.lock().await.push(temperature);
                Err(crate::ai::UpstreamError::Transient("simulated outage".into()))
            }
        }

        let pool = crate::db::queries::setup_test_db().await;
        let mut agent = agent();
        agent.llm_temperature = 0.9;
        let config = RetrievalConfig { top_k: 5, min_score: 0.7 };
        let chat = AlwaysFailChat { attempts: AtomicU32::new(0), seen_temperatures: Mutex::new(Vec::new()) };

        let outcome = run_thinking(
            &agent,
            &pool,
            &PanicEmbedder,
            &chat,
            config,
            &[],
            "what is the weather like today",
            1000,
            Duration::from_secs(4),
            Duration::from_secs(2),
            CancelHandle::new(),
        )
        .await
        .unwrap();

        assert_eq!(chat.attempts.load(Ordering::SeqCst), 2);
        let temps = chat.seen_temperatures.lock().await;
        assert_eq!(temps[0], 0.9);
        assert_eq!(temps[1], 0.5);

        match outcome {
            ThinkingOutcome::Speaking { mut sentences } => {
                let first = sentences.recv().await.unwrap();
                assert_eq!(first, LLM_RETRY_FALLBACK);
            }
            _ => panic!("expected a spoken fallback, not an end-call outcome"),
        }
    }
}

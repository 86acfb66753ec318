//! Voice Session state machine and its Thinking/Speaking pipelines (§4.6-§4.8). This is
//! the largest single component: it owns the per-call STT lease, drives one LLM stream and
//! at most one TTS stream at a time, and serializes all outbound media writes.
//!
//! One task owns each live voice connection, fed by a channel of inbound events and
//! writing to a single owned WS sink, backed by [`crate::pool`] for the STT lease
//! lifecycle. The sentence splitter and end-call phrase matcher are pure functions so they
//! can be exercised without any network I/O.

pub mod pipeline;
pub mod sentence;
pub mod state;

pub use pipeline::{run_thinking, ThinkingOutcome};
pub use sentence::SentenceSplitter;
pub use state::{SessionState, StateTransitionError};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::ai::stt::StreamingSttClient;
use crate::ai::CancelHandle;
use crate::db::models::AgentSnapshot;
use crate::db::{CallRepo, DbPool};
use crate::error::AppResult;
use crate::pool::{PoolLease, ResourcePool};

/// Normalize a transcript for end-call phrase matching: lowercase, strip punctuation,
/// collapse whitespace (§4.7 step 1).
pub fn normalize_transcript(text: &str) -> String {
    let lowered = text.to_lowercase();
    let stripped: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Detect an end-call phrase match using the three-way disjunction from §4.7 step 2:
/// exact equality, trailing-phrase-with-leading-whitespace, or a standalone word-bounded
/// occurrence anywhere in the normalized transcript.
pub fn detect_end_call(normalized: &str, phrases: &[String]) -> bool {
    phrases.iter().any(|phrase| {
        let phrase_norm = normalize_transcript(phrase);
        if phrase_norm.is_empty() {
            return false;
        }
        if normalized == phrase_norm {
            return true;
        }
        if normalized.ends_with(&format!(" {phrase_norm}")) {
            return true;
        }
        word_boundary_contains(normalized, &phrase_norm)
    })
}

fn word_boundary_contains(haystack: &str, needle: &str) -> bool {
    let words: Vec<&str> = haystack.split_whitespace().collect();
    let needle_words: Vec<&str> = needle.split_whitespace().collect();
    if needle_words.is_empty() || needle_words.len() > words.len() {
        return false;
    }
    words.windows(needle_words.len()).any(|w| w == needle_words.as_slice())
}

/// A single outbound media frame carrying a monotonically increasing sequence number
/// (§4.8, §5: "WS writes per session are total-order").
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub sequence_number: u64,
    pub payload: Vec<u8>,
}

/// Per-call actor state. Exactly one [`VoiceSession`] exists per live call; it is removed
/// from the session registry on reaching [`SessionState::Ended`] (§4.6, §5).
pub struct VoiceSession {
    pub call_id: String,
    pub agent: AgentSnapshot,
    state: Mutex<SessionState>,
    current_user_transcript: Mutex<String>,
    is_processing: AtomicBool,
    sequence_number: AtomicU64,
    stt_lease: Mutex<Option<PoolLease>>,
    stt_client: Mutex<Option<Arc<StreamingSttClient>>>,
    /// Cancel handle for whichever LLM/TTS turn is currently in flight (greeting, or one
    /// Thinking/Speaking cycle). Replaced by a fresh handle at the start of each turn via
    /// [`Self::begin_turn`] so a barge-in cancelling turn N does not leave turn N+1
    /// born-cancelled (`CancelHandle` has no reset, only a one-way cancel flag).
    turn_cancel: Mutex<CancelHandle>,
}

impl VoiceSession {
    pub fn new(call_id: impl Into<String>, agent: AgentSnapshot) -> Self {
        Self {
            call_id: call_id.into(),
            agent,
            state: Mutex::new(SessionState::Connecting),
            current_user_transcript: Mutex::new(String::new()),
            is_processing: AtomicBool::new(false),
            sequence_number: AtomicU64::new(0),
            stt_lease: Mutex::new(None),
            stt_client: Mutex::new(None),
            turn_cancel: Mutex::new(CancelHandle::new()),
        }
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    async fn transition(&self, to: SessionState) -> Result<(), StateTransitionError> {
        let mut guard = self.state.lock().await;
        guard.validate_transition(to)?;
        info!(call_id = %self.call_id, from = ?*guard, to = ?to, "session state transition");
        *guard = to;
        Ok(())
    }

    pub fn next_sequence_number(&self) -> u64 {
        self.sequence_number.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn cancel_handle(&self) -> CancelHandle {
        self.turn_cancel.lock().await.clone()
    }

    /// Start a new cancellable turn (greeting, or one Thinking/Speaking cycle) with a fresh
    /// [`CancelHandle`], so a previous turn's barge-in cancellation can't leak forward.
    pub async fn begin_turn(&self) -> CancelHandle {
        let fresh = CancelHandle::new();
        *self.turn_cancel.lock().await = fresh.clone();
        fresh
    }

    /// Connecting (§4.6): acquire one STT lease. `PoolExhausted`/`AcquireTimeout` ends the
    /// session immediately with `ResourceExhausted` rather than retrying, since a caller is
    /// live on the line and cannot be kept waiting silently.
    pub async fn connect(&self, pool: &Arc<ResourcePool>, stt_client: Arc<StreamingSttClient>) -> AppResult<()> {
        match pool.acquire(self.call_id.clone()).await {
            Ok(lease) => {
                *self.stt_lease.lock().await = Some(lease);
                *self.stt_client.lock().await = Some(stt_client);
                Ok(())
            }
            Err(e) => {
                warn!(call_id = %self.call_id, error = %e, "stt lease unavailable, ending session");
                self.force_end().await;
                Err(crate::error::AppError::resource_exhausted(e.to_string()))
            }
        }
    }

    async fn force_end(&self) {
        let mut guard = self.state.lock().await;
        *guard = SessionState::Ended;
    }

    /// Greeting -> Idle once the greeting has been fully spoken.
    pub async fn enter_greeting(&self) -> Result<(), StateTransitionError> {
        self.transition(SessionState::Greeting).await
    }

    pub async fn greeting_complete(&self) -> Result<(), StateTransitionError> {
        self.transition(SessionState::Idle).await
    }

    pub async fn on_speech_started(&self) -> Result<(), StateTransitionError> {
        let current = self.state().await;
        match current {
            SessionState::Idle => self.transition(SessionState::Listening).await,
            SessionState::Speaking => {
                // Barge-in: cancel whatever TTS/LLM is in flight and go straight back to
                // Listening (§4.6). The next turn gets a fresh handle via `begin_turn`, so
                // this cancellation doesn't carry forward.
                self.turn_cancel.lock().await.cancel();
                self.transition(SessionState::Listening).await
            }
            _ => Ok(()),
        }
    }

    pub async fn accumulate_partial(&self, text: &str) {
        let mut transcript = self.current_user_transcript.lock().await;
        *transcript = text.to_string();
    }

    /// Listening -> Thinking, guarded by `is_processing` so a late STT event cannot
    /// re-enter the pipeline while a previous turn is still in flight (§4.6).
    pub async fn start_thinking(&self) -> Result<Option<String>, StateTransitionError> {
        if self.is_processing.swap(true, Ordering::AcqRel) {
            return Ok(None);
        }
        self.transition(SessionState::Thinking).await?;
        let mut transcript = self.current_user_transcript.lock().await;
        let snapshot = std::mem::take(&mut *transcript);
        Ok(Some(snapshot))
    }

    pub async fn finish_thinking(&self, outcome_is_end_call: bool) -> Result<(), StateTransitionError> {
        self.is_processing.store(false, Ordering::Release);
        if outcome_is_end_call {
            self.transition(SessionState::Ending).await
        } else {
            self.transition(SessionState::Speaking).await
        }
    }

    pub async fn speaking_complete(&self) -> Result<(), StateTransitionError> {
        self.transition(SessionState::Idle).await
    }

    /// Ending -> Ended, releasing the STT lease and persisting the final call record.
    /// Called either after the farewell finishes or the 3s cap elapses, whichever first
    /// (§4.6); the caller is responsible for racing those two conditions.
    pub async fn end(&self, pool_db: &DbPool, failure_reason: Option<&str>) -> AppResult<()> {
        self.transition(SessionState::Ended).await.ok();
        *self.stt_lease.lock().await = None;
        CallRepo::mark_ended(pool_db, &self.call_id, failure_reason).await?;
        Ok(())
    }

    /// Cooperative session-wide shutdown on WS close (§4.6, §5): cancel whatever turn is in
    /// flight and poll for it to actually finish (`is_processing` clears) rather than
    /// sleeping the full grace window unconditionally, so a quick in-flight turn doesn't
    /// hold up teardown; a slow one is force-ended once `grace` elapses regardless.
    pub async fn grace_wait_then_force_end(&self, pool_db: &DbPool, grace: Duration, failure_reason: Option<&str>) {
        self.turn_cancel.lock().await.cancel();
        let deadline = tokio::time::Instant::now() + grace;
        while self.is_processing.load(Ordering::Acquire) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let _ = self.end(pool_db, failure_reason).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_punctuation_and_collapses_whitespace() {
        assert_eq!(normalize_transcript("Goodbye,  Friend!!"), "goodbye friend");
    }

    #[test]
    fn detect_end_call_matches_exact_equality() {
        let phrases = vec!["goodbye".to_string()];
        assert!(detect_end_call("goodbye", &phrases));
    }

    #[test]
    fn detect_end_call_matches_trailing_phrase() {
        let phrases = vec!["hang up now".to_string()];
        assert!(detect_end_call("please hang up now", &phrases));
    }

    #[test]
    fn detect_end_call_matches_standalone_word_boundary() {
        let phrases = vec!["bye".to_string()];
        assert!(detect_end_call("okay bye then thanks", &phrases));
        assert!(!detect_end_call("goodbyeforever", &phrases));
    }

    #[test]
    fn detect_end_call_rejects_unrelated_transcript() {
        let phrases = vec!["goodbye".to_string()];
        assert!(!detect_end_call("what is the weather today", &phrases));
    }

    #[tokio::test]
    async fn thinking_guard_prevents_reentry() {
        let agent = AgentSnapshot {
            agent_id: "a1".into(),
            persona: "p".into(),
            greeting: "hi".into(),
            language: "en".into(),
            llm_model: "m".into(),
            llm_temperature: 0.5,
            llm_max_tokens: None,
            tts_provider: "t".into(),
            tts_voice_id: "v".into(),
            end_call_phrases: vec![],
            knowledge_base_id: None,
        };
        let session = VoiceSession::new("call-1", agent);
        *session.state.lock().await = SessionState::Listening;
        let first = session.start_thinking().await.unwrap();
        assert!(first.is_some());
        let second = session.start_thinking().await.unwrap();
        assert!(second.is_none());
    }
}

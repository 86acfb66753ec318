use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A tenant user. Auth/CRUD for this entity is out of scope; it exists only so
/// `scheduled_calls(user_id, status)` has something to reference.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub display_name: String,
    pub default_timezone: String,
    pub created_at: DateTime<Utc>,
}

/// Persona-configured voice agent. Immutable for the duration of any call that
/// references it; callers capture a snapshot at session start (see [`AgentSnapshot`]).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub persona: String,
    pub greeting: String,
    pub language: String,
    pub llm_model: String,
    pub llm_temperature: f64,
    pub llm_max_tokens: Option<i64>,
    pub tts_provider: String,
    pub tts_voice_id: String,
    /// JSON array of normalized end-call phrases.
    pub end_call_phrases: String,
    pub knowledge_base_id: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn end_call_phrases(&self) -> Vec<String> {
        serde_json::from_str(&self.end_call_phrases).unwrap_or_default()
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            agent_id: self.id.clone(),
            persona: self.persona.clone(),
            greeting: self.greeting.clone(),
            language: self.language.clone(),
            llm_model: self.llm_model.clone(),
            llm_temperature: self.llm_temperature,
            llm_max_tokens: self.llm_max_tokens,
            tts_provider: self.tts_provider.clone(),
            tts_voice_id: self.tts_voice_id.clone(),
            end_call_phrases: self.end_call_phrases(),
            knowledge_base_id: self.knowledge_base_id.clone(),
        }
    }
}

/// Immutable configuration snapshot captured on a [`Call`] at session start, so a later
/// edit to the `Agent` row never changes the behavior of a call already in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub persona: String,
    pub greeting: String,
    pub language: String,
    pub llm_model: String,
    pub llm_temperature: f64,
    pub llm_max_tokens: Option<i64>,
    pub tts_provider: String,
    pub tts_voice_id: String,
    pub end_call_phrases: Vec<String>,
    pub knowledge_base_id: Option<String>,
}

/// A telephony-provider phone number with its per-Phone provider credentials, encrypted
/// at rest (AES-256-GCM, envelope `iv_hex:ct_hex:tag_hex`).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Phone {
    pub id: String,
    pub e164: String,
    pub provider: String,
    pub encrypted_credentials: String,
    pub webhook_secret_ref: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "outbound" => Self::Outbound,
            _ => Self::Inbound,
        }
    }
}

/// One physical phone call. Maps onto the Voice Session state machine states plus the
/// outbound-only `initiated`/`ringing` pre-states from §4.9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Initiated,
    Ringing,
    Connecting,
    Greeting,
    Idle,
    Listening,
    Thinking,
    Speaking,
    Ending,
    Ended,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Ringing => "ringing",
            Self::Connecting => "connecting",
            Self::Greeting => "greeting",
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Ending => "ending",
            Self::Ended => "ended",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "initiated" => Self::Initiated,
            "ringing" => Self::Ringing,
            "connecting" => Self::Connecting,
            "greeting" => Self::Greeting,
            "idle" => Self::Idle,
            "listening" => Self::Listening,
            "thinking" => Self::Thinking,
            "speaking" => Self::Speaking,
            "ending" => Self::Ending,
            "ended" => Self::Ended,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended)
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Call {
    pub id: String,
    pub direction: String,
    pub from_number: String,
    pub to_number: String,
    pub agent_id: String,
    pub phone_id: Option<String>,
    pub correlation_id: Option<String>,
    pub provider_call_sid: Option<String>,
    pub stream_sid: Option<String>,
    pub state: String,
    pub agent_snapshot: String,
    pub failure_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Call {
    pub fn state(&self) -> CallState {
        CallState::from_str(&self.state).unwrap_or(CallState::Ended)
    }

    pub fn agent_snapshot(&self) -> AgentSnapshot {
        serde_json::from_str(&self.agent_snapshot).expect("agent_snapshot is always valid JSON")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Caller,
    Agent,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Caller => "caller",
            Self::Agent => "agent",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "caller" => Self::Caller,
            "agent" => Self::Agent,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub id: i64,
    pub call_id: String,
    pub speaker: String,
    pub text: String,
    pub ordinal: i64,
    pub turn_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledCallStatus {
    Pending,
    Processing,
    Completed,
    Cancelled,
    Failed,
}

impl ScheduledCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            "failed" => Self::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ScheduledCall {
    pub id: String,
    pub user_id: String,
    pub phone_e164: String,
    pub agent_id: String,
    pub scheduled_for: DateTime<Utc>,
    pub timezone: String,
    pub respect_business_hours: bool,
    pub business_hours_start: String,
    pub business_hours_end: String,
    /// JSON array of ISO weekday numbers (1=Mon..7=Sun).
    pub business_hours_days: String,
    pub recurrence_unit: Option<String>,
    pub recurrence_interval: Option<i64>,
    pub recurrence_end_date: Option<DateTime<Utc>>,
    pub max_occurrences: Option<i64>,
    pub occurrence: i64,
    pub status: String,
    pub produced_call_id: Option<String>,
    pub parent_scheduled_call_id: Option<String>,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledCall {
    pub fn status(&self) -> ScheduledCallStatus {
        ScheduledCallStatus::from_str(&self.status).unwrap_or(ScheduledCallStatus::Failed)
    }

    pub fn business_hours_days(&self) -> Vec<u8> {
        serde_json::from_str(&self.business_hours_days).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    NoAnswer,
    Busy,
    Voicemail,
    NetworkError,
    InvalidNumber,
    UpstreamFatal,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoAnswer => "no_answer",
            Self::Busy => "busy",
            Self::Voicemail => "voicemail",
            Self::NetworkError => "network_error",
            Self::InvalidNumber => "invalid_number",
            Self::UpstreamFatal => "upstream_fatal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidNumber | Self::UpstreamFatal)
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub id: i64,
    pub call_id: String,
    pub attempt_number: i64,
    pub failure_class: String,
    pub next_attempt_at: DateTime<Utc>,
    pub backoff_ms: i64,
    pub created_at: DateTime<Utc>,
}

/// A retrieval-ready chunk of a knowledge document. Ingestion/chunking/embedding is out
/// of scope; this type only describes what [`crate::retrieval`] reads back.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub id: String,
    pub agent_id: String,
    pub doc_id: String,
    pub ordinal: i64,
    pub text: String,
    pub embedding: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct NewCall {
    pub direction: CallDirection,
    pub from_number: String,
    pub to_number: String,
    pub agent_id: String,
    pub phone_id: Option<String>,
    pub correlation_id: Option<String>,
    pub agent_snapshot: AgentSnapshot,
}

//! Control surface (§6) and telephony WebSocket bridge (§4.8).
//!
//! Split the same way a routes/websocket pair usually is: one module owns the shared
//! application state and the plain REST handlers, a dedicated module owns the long-lived
//! per-call socket loop that drives the Voice Session state machine.

pub mod routes;
pub mod telephony_ws;

pub use routes::create_router;

use std::sync::Arc;

use dashmap::DashMap;

use crate::admin::SharedSecretStore;
use crate::admin::vault::VaultKey;
use crate::ai::embeddings::Embedder;
use crate::ai::llm::ChatModel;
use crate::ai::tts::TextToSpeech;
use crate::db::DbPool;
use crate::outbound::OutboundController;
use crate::pool::ResourcePool;
use crate::session::VoiceSession;
use crate::telephony::TelephonyClient;

/// Shared application state: one instance built at startup, cloned into every axum
/// handler. Provider clients are held as trait objects so tests can substitute fakes
/// without touching any handler signature.
#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub stt_pool: Arc<ResourcePool>,
    pub outbound: Arc<OutboundController>,
    pub chat: Arc<dyn ChatModel>,
    pub embedder: Arc<dyn Embedder>,
    pub tts: Arc<dyn TextToSpeech>,
    pub telephony: Arc<TelephonyClient>,
    pub vault_key: Arc<VaultKey>,
    pub secret_store: SharedSecretStore,
    /// Live voice sessions keyed by call id, so the status webhook and admin endpoints
    /// can observe what the WS bridge is doing without a shared database round trip.
    pub sessions: Arc<DashMap<String, Arc<VoiceSession>>>,
}

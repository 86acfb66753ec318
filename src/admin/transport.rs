//! Admin transport layer - HTTP endpoints for secure provisioning.
//!
//! Exposes endpoints for:
//! - Getting the orchestrator's ephemeral public key
//! - Checking provisioning status
//! - Receiving encrypted AI-provider credentials and the at-rest master key from admin

use crate::admin::crypto::{
    build_signature_message, decrypt_payload, parse_ed25519_public_key, parse_signature,
    parse_x25519_public_key, verify_signature, CryptoError, EphemeralKeyPair,
};
use crate::admin::secrets::{ProvisioningStatus, SecretsPayload, SharedSecretStore};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Provisioning request from admin CLI.
#[derive(Debug, Deserialize)]
pub struct ProvisionRequest {
    /// Admin's ephemeral X25519 public key (base64)
    pub admin_x25519_public: String,
    /// Encrypted secrets payload (base64)
    pub ciphertext: String,
    /// ChaCha20-Poly1305 nonce (base64)
    pub nonce: String,
    /// Ed25519 signature over (admin_x25519_public || ciphertext || nonce)
    pub signature: String,
}

/// Response for public key endpoint.
#[derive(Debug, Serialize)]
pub struct PublicKeyResponse {
    /// Orchestrator's ephemeral X25519 public key (base64)
    pub public_key: String,
}

/// Response for status endpoint.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: ProvisioningStatus,
}

/// Response for provision endpoint.
#[derive(Debug, Serialize)]
pub struct ProvisionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Admin transport errors.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Already provisioned")]
    AlreadyProvisioned,

    #[error("Secrets deserialization failed: {0}")]
    DeserializationFailed(String),
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match &self {
            AdminError::Crypto(_) => StatusCode::BAD_REQUEST,
            AdminError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AdminError::AlreadyProvisioned => StatusCode::CONFLICT,
            AdminError::DeserializationFailed(_) => StatusCode::BAD_REQUEST,
        };

        let body = Json(ErrorResponse {
            error: self.to_string(),
        });

        (status, body).into_response()
    }
}

/// Shared state for admin endpoints.
pub struct AdminState {
    /// Orchestrator's ephemeral keypair
    pub keypair: RwLock<Option<EphemeralKeyPair>>,
    /// Admin's Ed25519 public key for signature verification
    pub admin_public_key: VerifyingKey,
    /// Secret store to provision
    pub secret_store: SharedSecretStore,
}

impl AdminState {
    /// Create new admin state.
    ///
    /// # Arguments
    /// * `admin_public_key_base64` - Admin's Ed25519 public key in base64
    /// * `secret_store` - Shared secret store
    pub fn new(
        admin_public_key_base64: &str,
        secret_store: SharedSecretStore,
    ) -> Result<Self, CryptoError> {
        let admin_public_key = parse_ed25519_public_key(admin_public_key_base64)?;

        // Generate ephemeral keypair
        let keypair = EphemeralKeyPair::generate();
        info!("Generated ephemeral X25519 keypair for admin provisioning");

        Ok(Self {
            keypair: RwLock::new(Some(keypair)),
            admin_public_key,
            secret_store,
        })
    }
}

/// Handler: GET /admin/pubkey
///
/// Returns the orchestrator's ephemeral X25519 public key.
async fn get_public_key(State(state): State<Arc<AdminState>>) -> Result<Json<PublicKeyResponse>, AdminError> {
    let guard = state.keypair.read().await;
    let keypair = guard
        .as_ref()
        .ok_or_else(|| AdminError::AlreadyProvisioned)?;

    Ok(Json(PublicKeyResponse {
        public_key: keypair.public_key_base64(),
    }))
}

/// Handler: GET /admin/status
///
/// Returns current provisioning status.
async fn get_status(State(state): State<Arc<AdminState>>) -> Json<StatusResponse> {
    let status = state.secret_store.status().await;
    Json(StatusResponse { status })
}

/// Handler: POST /admin/provision
///
/// Receives encrypted secrets from admin, verifies signature, decrypts, and stores.
async fn provision(
    State(state): State<Arc<AdminState>>,
    Json(request): Json<ProvisionRequest>,
) -> Result<Json<ProvisionResponse>, AdminError> {
    // Check if already provisioned
    if state.secret_store.is_provisioned().await {
        warn!("Provision attempt when already provisioned");
        return Err(AdminError::AlreadyProvisioned);
    }

    // Take the keypair (consuming it, ensures single use)
    let keypair = {
        let mut guard = state.keypair.write().await;
        guard.take().ok_or(AdminError::AlreadyProvisioned)?
    };

    info!("Processing provision request...");

    // Parse admin's X25519 public key
    let admin_x25519_public = parse_x25519_public_key(&request.admin_x25519_public)?;

    // Decode ciphertext and nonce for signature verification
    let ciphertext_bytes = BASE64
        .decode(&request.ciphertext)
        .map_err(|e| AdminError::Crypto(CryptoError::Base64(e)))?;
    let nonce_bytes = BASE64
        .decode(&request.nonce)
        .map_err(|e| AdminError::Crypto(CryptoError::Base64(e)))?;

    // Build message that was signed
    let message = build_signature_message(
        admin_x25519_public.as_bytes(),
        &ciphertext_bytes,
        &nonce_bytes,
    );

    // Parse and verify signature
    let signature = parse_signature(&request.signature)?;
    verify_signature(&state.admin_public_key, &message, &signature)?;
    info!("Signature verified successfully");

    // Compute shared secret and decrypt
    let shared_secret = keypair.diffie_hellman(&admin_x25519_public);
    let plaintext = decrypt_payload(&shared_secret, &request.nonce, &request.ciphertext)?;
    info!("Decryption successful");

    // Parse secrets
    let secrets: SecretsPayload = serde_json::from_slice(&plaintext)
        .map_err(|e| AdminError::DeserializationFailed(e.to_string()))?;

    // Store secrets
    if !state.secret_store.provision(secrets).await {
        error!("Failed to store secrets - already provisioned");
        return Err(AdminError::AlreadyProvisioned);
    }

    info!("Secrets provisioned successfully!");

    Ok(Json(ProvisionResponse {
        success: true,
        message: Some("Secrets provisioned successfully".to_string()),
    }))
}

/// Create the admin router.
pub fn admin_router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/pubkey", get(get_public_key))
        .route("/status", get(get_status))
        .route("/provision", post(provision))
        .with_state(state)
}

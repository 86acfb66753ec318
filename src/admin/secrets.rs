//! In-memory secret storage with secure memory handling.
//!
//! Secrets are stored only in RAM and are zeroized on drop to minimize
//! exposure window. Never persisted to disk.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use zeroize::Zeroize;

/// Secrets payload sent by admin during provisioning: the API keys for the four AI
/// providers (§4.3) plus the AES-256-GCM master key used to encrypt per-[`crate::db::models::Phone`]
/// telephony credentials at rest (§1a, §6a). This structure is serialized/deserialized for
/// transport over the bootstrap handshake in [`super::transport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsPayload {
    /// API key for the streaming STT provider.
    pub stt_api_key: String,
    /// API key for the LLM provider.
    pub llm_api_key: String,
    /// API key for the streaming TTS provider.
    pub tts_api_key: String,
    /// API key for the embeddings provider.
    #[serde(default)]
    pub embeddings_api_key: Option<String>,
    /// Base64-encoded 32-byte AES-256-GCM key used to encrypt/decrypt `phones.encrypted_credentials`.
    pub at_rest_key_b64: String,
    /// Optional: additional custom secrets as key-value pairs (per-Phone webhook secrets,
    /// non-default provider credentials, etc).
    #[serde(default)]
    pub custom: HashMap<String, String>,
}

impl Drop for SecretsPayload {
    fn drop(&mut self) {
        self.stt_api_key.zeroize();
        self.llm_api_key.zeroize();
        self.tts_api_key.zeroize();
        if let Some(ref mut key) = self.embeddings_api_key {
            key.zeroize();
        }
        self.at_rest_key_b64.zeroize();
        for value in self.custom.values_mut() {
            value.zeroize();
        }
        self.custom.clear();
    }
}

/// Current provisioning status of the orchestrator process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStatus {
    /// Waiting for admin to provision secrets
    WaitingForProvisioning,
    /// Secrets received, application running
    Provisioned,
}

/// In-memory secret store.
///
/// This store holds sensitive configuration that was securely transmitted
/// by the admin. Secrets are zeroized when the store is dropped.
pub struct SecretStore {
    /// The actual secrets (None until provisioned)
    secrets: RwLock<Option<SecretsPayload>>,
    /// Notification channel for when secrets arrive
    provisioned_notify: Notify,
}

impl SecretStore {
    /// Create a new empty secret store.
    pub fn new() -> Self {
        Self {
            secrets: RwLock::new(None),
            provisioned_notify: Notify::new(),
        }
    }

    /// Check if the store has been provisioned with secrets.
    pub async fn is_provisioned(&self) -> bool {
        self.secrets.read().await.is_some()
    }

    /// Get the current provisioning status.
    pub async fn status(&self) -> ProvisioningStatus {
        if self.is_provisioned().await {
            ProvisioningStatus::Provisioned
        } else {
            ProvisioningStatus::WaitingForProvisioning
        }
    }

    /// Store secrets (called after successful decryption and verification).
    ///
    /// Returns false if already provisioned (can only provision once).
    pub async fn provision(&self, secrets: SecretsPayload) -> bool {
        let mut guard = self.secrets.write().await;
        if guard.is_some() {
            // Already provisioned, reject
            return false;
        }
        *guard = Some(secrets);
        drop(guard);

        // Notify waiters that secrets are available
        self.provisioned_notify.notify_waiters();
        true
    }

    /// Wait until secrets are provisioned.
    ///
    /// This is used by the main application to block startup until
    /// the admin has provided credentials.
    pub async fn wait_for_provisioning(&self) {
        // Check if already provisioned
        if self.is_provisioned().await {
            return;
        }

        // Wait for notification
        self.provisioned_notify.notified().await;
    }

    pub async fn stt_api_key(&self) -> Option<String> {
        self.secrets.read().await.as_ref().map(|s| s.stt_api_key.clone())
    }

    pub async fn llm_api_key(&self) -> Option<String> {
        self.secrets.read().await.as_ref().map(|s| s.llm_api_key.clone())
    }

    pub async fn tts_api_key(&self) -> Option<String> {
        self.secrets.read().await.as_ref().map(|s| s.tts_api_key.clone())
    }

    pub async fn embeddings_api_key(&self) -> Option<String> {
        self.secrets.read().await.as_ref().and_then(|s| s.embeddings_api_key.clone())
    }

    /// Raw base64 at-rest master key, for handing to [`super::vault::VaultKey::from_bytes`]
    /// once decoded.
    pub async fn at_rest_key_b64(&self) -> Option<String> {
        self.secrets.read().await.as_ref().map(|s| s.at_rest_key_b64.clone())
    }

    /// Get a custom secret by key.
    pub async fn custom_secret(&self, key: &str) -> Option<String> {
        self.secrets
            .read()
            .await
            .as_ref()
            .and_then(|s| s.custom.get(key).cloned())
    }
}

impl Default for SecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore")
            .field("provisioned", &"<check async>")
            .finish_non_exhaustive()
    }
}

/// Shared secret store handle for use across the application.
pub type SharedSecretStore = Arc<SecretStore>;

/// Create a new shared secret store.
pub fn create_secret_store() -> SharedSecretStore {
    Arc::new(SecretStore::new())
}

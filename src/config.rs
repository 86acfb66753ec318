use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Admin bootstrap-transport configuration (secure provisioning of process secrets).
#[derive(Debug, Deserialize, Clone)]
pub struct AdminConfig {
    /// Admin's Ed25519 public key (base64 encoded). The only trust anchor: only the
    /// holder of the corresponding private key can provision secrets to this process.
    pub public_key: String,
    #[serde(default = "default_admin_port")]
    pub port: u16,
    #[serde(default = "default_admin_host")]
    pub host: String,
}

fn default_admin_port() -> u16 {
    9999
}

fn default_admin_host() -> String {
    "0.0.0.0".to_string()
}

/// Resource Pool tunables (§4.1).
#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    #[serde(default = "default_pool_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_pool_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
    #[serde(default = "default_pool_max_queue_size")]
    pub max_queue_size: usize,
}

fn default_pool_max_connections() -> usize {
    20
}
fn default_pool_queue_timeout_ms() -> u64 {
    30_000
}
fn default_pool_max_queue_size() -> usize {
    50
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_pool_max_connections(),
            queue_timeout_ms: default_pool_queue_timeout_ms(),
            max_queue_size: default_pool_max_queue_size(),
        }
    }
}

/// Outbound Controller tunables (§4.9).
#[derive(Debug, Deserialize, Clone)]
pub struct OutboundConfig {
    #[serde(default = "default_outbound_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_outbound_rate_per_sec")]
    pub rate_per_sec: u32,
    #[serde(default = "default_outbound_min_spacing_ms")]
    pub min_spacing_ms: u64,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

fn default_outbound_max_concurrent() -> usize {
    10
}
fn default_outbound_rate_per_sec() -> u32 {
    20
}
fn default_outbound_min_spacing_ms() -> u64 {
    50
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_outbound_max_concurrent(),
            rate_per_sec: default_outbound_rate_per_sec(),
            min_spacing_ms: default_outbound_min_spacing_ms(),
            breaker: BreakerConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BreakerConfig {
    #[serde(default = "default_breaker_threshold")]
    pub threshold: u32,
    #[serde(default = "default_breaker_open_ms")]
    pub open_ms: u64,
}

fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_open_ms() -> u64 {
    60_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: default_breaker_threshold(),
            open_ms: default_breaker_open_ms(),
        }
    }
}

/// Voice Session tunables (§4.6).
#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_silence_threshold_ms")]
    pub silence_threshold_ms: u64,
    #[serde(default = "default_batch_silence_threshold_ms")]
    pub batch_silence_threshold_ms: u64,
    #[serde(default = "default_llm_first_token_timeout_ms")]
    pub llm_first_token_timeout_ms: u64,
    #[serde(default = "default_llm_mid_stream_timeout_ms")]
    pub llm_mid_stream_timeout_ms: u64,
    #[serde(default = "default_tts_sentence_timeout_ms")]
    pub tts_sentence_timeout_ms: u64,
    #[serde(default = "default_grace_window_ms")]
    pub grace_window_ms: u64,
    #[serde(default = "default_ending_cap_ms")]
    pub ending_cap_ms: u64,
}

fn default_silence_threshold_ms() -> u64 {
    150
}
fn default_batch_silence_threshold_ms() -> u64 {
    1500
}
fn default_llm_first_token_timeout_ms() -> u64 {
    4_000
}
fn default_llm_mid_stream_timeout_ms() -> u64 {
    2_000
}
fn default_tts_sentence_timeout_ms() -> u64 {
    10_000
}
fn default_grace_window_ms() -> u64 {
    30_000
}
fn default_ending_cap_ms() -> u64 {
    3_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            silence_threshold_ms: default_silence_threshold_ms(),
            batch_silence_threshold_ms: default_batch_silence_threshold_ms(),
            llm_first_token_timeout_ms: default_llm_first_token_timeout_ms(),
            llm_mid_stream_timeout_ms: default_llm_mid_stream_timeout_ms(),
            tts_sentence_timeout_ms: default_tts_sentence_timeout_ms(),
            grace_window_ms: default_grace_window_ms(),
            ending_cap_ms: default_ending_cap_ms(),
        }
    }
}

/// Knowledge Retrieval tunables (§4.4).
#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_retrieval_top_k")]
    pub top_k: usize,
    #[serde(default = "default_retrieval_min_score")]
    pub min_score: f32,
    #[serde(default = "default_retrieval_embedding_dim")]
    pub embedding_dim: usize,
}

fn default_retrieval_top_k() -> usize {
    5
}
fn default_retrieval_min_score() -> f32 {
    0.70
}
fn default_retrieval_embedding_dim() -> usize {
    1536
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_retrieval_top_k(),
            min_score: default_retrieval_min_score(),
            embedding_dim: default_retrieval_embedding_dim(),
        }
    }
}

/// Scheduler/Retry Engine tunables (§4.10).
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_timezone")]
    pub default_timezone: String,
    #[serde(default)]
    pub business_hours_default: BusinessHoursConfig,
}

fn default_scheduler_timezone() -> String {
    "Asia/Kolkata".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_timezone: default_scheduler_timezone(),
            business_hours_default: BusinessHoursConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BusinessHoursConfig {
    #[serde(default = "default_business_start")]
    pub start: String,
    #[serde(default = "default_business_end")]
    pub end: String,
    #[serde(default = "default_business_days")]
    pub days: Vec<u8>,
}

fn default_business_start() -> String {
    "09:00".to_string()
}
fn default_business_end() -> String {
    "18:00".to_string()
}
fn default_business_days() -> Vec<u8> {
    vec![1, 2, 3, 4, 5]
}

impl Default for BusinessHoursConfig {
    fn default() -> Self {
        Self {
            start: default_business_start(),
            end: default_business_end(),
            days: default_business_days(),
        }
    }
}

/// Durable delayed-job queue tunables.
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_queue_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_queue_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_queue_retry_attempts() -> u32 {
    3
}
fn default_queue_retry_backoff_ms() -> u64 {
    2_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_queue_retry_attempts(),
            retry_backoff_ms: default_queue_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeatureFlagConfig {
    /// Staged outbound-calling rollout gate (§6): a deterministic hash of the requesting
    /// user id decides membership. Defaults to 100 (fully enabled) so an unconfigured
    /// deployment behaves as if no gate were present.
    #[serde(default = "default_outbound_percentage")]
    pub outbound_percentage: u8,
}

fn default_outbound_percentage() -> u8 {
    100
}

impl Default for FeatureFlagConfig {
    fn default() -> Self {
        Self { outbound_percentage: default_outbound_percentage() }
    }
}

/// Deterministic staged-rollout membership test (§6 `featureFlag.outbound_percentage`):
/// hash `user_id` into `[0, 100)` and compare against the configured percentage. The same
/// user id always lands in the same bucket for a given percentage, so flipping the flag
/// from 10% to 20% only ever adds users, never removes any (monotonic rollout).
pub fn feature_flag_enabled(user_id: &str, percentage: u8) -> bool {
    if percentage >= 100 {
        return true;
    }
    if percentage == 0 {
        return false;
    }
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    user_id.hash(&mut hasher);
    let bucket = (hasher.finish() % 100) as u8;
    bucket < percentage
}

/// AI provider endpoints (STT/LLM/TTS/embeddings).
#[derive(Debug, Deserialize, Clone)]
pub struct AiConfig {
    pub stt_url: String,
    pub llm_url: String,
    pub llm_model: String,
    pub tts_url: String,
    pub embeddings_url: String,
    #[serde(default = "default_ai_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_ai_max_retries")]
    pub max_retries: u32,
}

fn default_ai_timeout_secs() -> u64 {
    30
}
fn default_ai_max_retries() -> u32 {
    3
}

/// Web server configuration for the REST control surface and telephony WS endpoint.
#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    pub public_url: String,
}

/// Telephony provider REST base (§6 "Telephony REST"). Per-Phone Basic-auth credentials
/// live encrypted in `phones.encrypted_credentials`, not here.
#[derive(Debug, Deserialize, Clone)]
pub struct TelephonyConfig {
    pub base_url: String,
}

/// Database configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// At-rest secrets encryption configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct SecretsConfig {
    /// Base64-encoded 32-byte AES-256-GCM master key used to encrypt per-Phone credentials.
    /// Delivered via the admin bootstrap transport, never read from a plain env var in
    /// production; the config layer only names where it would be looked up for local dev.
    #[serde(default)]
    pub at_rest_key_b64: Option<String>,
}

/// Root application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub admin: AdminConfig,
    pub ai: AiConfig,
    pub web: WebConfig,
    pub telephony: TelephonyConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub outbound: OutboundConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub feature_flag: FeatureFlagConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
}

impl AppConfig {
    /// Load configuration from files and environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // e.g. CALLFORGE_WEB__PORT, CALLFORGE_POOL__MAX_CONNECTIONS
            .add_source(
                Environment::with_prefix("CALLFORGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Initialize the global config singleton.
    pub fn init() -> Result<&'static Self, ConfigError> {
        let config = Self::load()?;
        Ok(CONFIG.get_or_init(|| config))
    }

    /// Get reference to the global config.
    pub fn get() -> &'static Self {
        CONFIG.get().expect("Config not initialized. Call AppConfig::init() first.")
    }
}

impl AiConfig {
    pub fn endpoint(base: &str, path: &str) -> String {
        let base = base.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_flag_full_and_zero_percentage_are_unconditional() {
        assert!(feature_flag_enabled("user-1", 100));
        assert!(!feature_flag_enabled("user-1", 0));
    }

    #[test]
    fn feature_flag_bucket_is_stable_for_same_user() {
        let at_50 = feature_flag_enabled("user-42", 50);
        assert_eq!(at_50, feature_flag_enabled("user-42", 50));
    }

    #[test]
    fn feature_flag_rollout_is_monotonic() {
        // Everyone enabled at 80% stays enabled at 100%; raising the percentage only adds
        // users, it never removes one that was already in the bucket.
        for i in 0..200 {
            let user = format!("user-{i}");
            if feature_flag_enabled(&user, 80) {
                assert!(feature_flag_enabled(&user, 100));
            }
        }
    }

    #[test]
    fn endpoint_joins_without_double_slash() {
        assert_eq!(
            AiConfig::endpoint("http://localhost:8000/", "/transcribe"),
            "http://localhost:8000/transcribe"
        );
        assert_eq!(
            AiConfig::endpoint("http://localhost:8000", "transcribe"),
            "http://localhost:8000/transcribe"
        );
    }

    #[test]
    fn pool_defaults_match_documented_capacity() {
        let pool = PoolConfig::default();
        assert_eq!(pool.max_connections, 20);
        assert_eq!(pool.max_queue_size, 50);
        assert_eq!(pool.queue_timeout_ms, 30_000);
    }

    #[test]
    fn outbound_breaker_defaults_match_documented_policy() {
        let outbound = OutboundConfig::default();
        assert_eq!(outbound.breaker.threshold, 5);
        assert_eq!(outbound.breaker.open_ms, 60_000);
        assert_eq!(outbound.rate_per_sec, 20);
    }
}

use std::sync::Arc;
use std::time::Duration;

use callforge::admin::vault::VaultKey;
use callforge::admin::{self, AdminState, SharedSecretStore};
use callforge::ai::embeddings::HttpEmbedder;
use callforge::ai::llm::HttpChatModel;
use callforge::ai::tts::{StreamingTtsClient, TtsClientConfig};
use callforge::config::AppConfig;
use callforge::db;
use callforge::outbound::OutboundController;
use callforge::pool::{PoolKind, ResourcePool};
use callforge::scheduler::scheduler_loop;
use callforge::telephony::TelephonyClient;
use callforge::web::{self, AppState};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use dashmap::DashMap;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "callforge=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Callforge v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::init()?;
    info!("Configuration loaded");

    if config.admin.public_key.is_empty() {
        error!("Admin public key not configured!");
        error!("Generate keys with: callforge-admin keygen");
        error!("Then set admin.public_key in config/default.toml or CALLFORGE_ADMIN__PUBLIC_KEY env var");
        return Err(anyhow::anyhow!("admin public key not configured"));
    }

    // Secrets (AI provider API keys, the at-rest master key) never live in a plain env
    // var in production; they are delivered over the signed bootstrap transport (§1a,
    // §6a) before the rest of the process starts.
    let secret_store = admin::create_secret_store();
    let admin_state = Arc::new(
        AdminState::new(&config.admin.public_key, secret_store.clone())
            .map_err(|e| anyhow::anyhow!("failed to initialize admin transport: {e}"))?,
    );

    let admin_addr = format!("{}:{}", config.admin.host, config.admin.port);
    let admin_listener = TcpListener::bind(&admin_addr).await?;
    info!("Admin provisioning server listening on http://{admin_addr}");
    info!("Waiting for admin to provision secrets...");
    info!("Use: callforge-admin provision --instance-url http://{admin_addr} --llm-api-key ...");

    let admin_router = admin::admin_router(admin_state.clone());
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(admin_listener, admin_router).await {
            error!("admin server error: {e}");
        }
    });

    secret_store.wait_for_provisioning().await;
    info!("Secrets provisioned! Starting orchestrator...");

    run_orchestrator(config, secret_store).await?;

    admin_handle.abort();
    Ok(())
}

/// Wire up and run the orchestrator once the bootstrap secrets have arrived: connect the
/// database, build the AI clients and resource pool, bring up the outbound controller and
/// scheduler loop, and serve the REST/telephony-WS surface until shutdown.
async fn run_orchestrator(config: &'static AppConfig, secret_store: SharedSecretStore) -> anyhow::Result<()> {
    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;
    info!("database connected: {}", config.database.url);

    db::init_db(&pool).await?;

    let at_rest_key_b64 = secret_store
        .at_rest_key_b64()
        .await
        .ok_or_else(|| anyhow::anyhow!("at-rest encryption key not found in secret store"))?;
    let at_rest_key_bytes = BASE64
        .decode(&at_rest_key_b64)
        .map_err(|e| anyhow::anyhow!("at-rest key is not valid base64: {e}"))?;
    let vault_key = Arc::new(
        VaultKey::from_bytes(&at_rest_key_bytes).map_err(|e| anyhow::anyhow!("invalid at-rest key: {e}"))?,
    );

    let stt_pool = ResourcePool::new(
        PoolKind::Stt,
        config.pool.max_connections,
        config.pool.max_queue_size,
        Duration::from_millis(config.pool.queue_timeout_ms),
    );

    let ai_timeout = Duration::from_secs(config.ai.timeout_secs);
    let chat: Arc<dyn callforge::ai::llm::ChatModel> =
        Arc::new(HttpChatModel::new(config.ai.llm_url.clone(), ai_timeout, config.ai.max_retries));
    let embedder: Arc<dyn callforge::ai::embeddings::Embedder> = Arc::new(HttpEmbedder::new(
        config.ai.embeddings_url.clone(),
        ai_timeout,
        config.ai.max_retries,
        config.retrieval.embedding_dim,
    ));
    let tts: Arc<dyn callforge::ai::tts::TextToSpeech> = Arc::new(StreamingTtsClient::new(TtsClientConfig {
        url: config.ai.tts_url.clone(),
        ..TtsClientConfig::default()
    }));

    let telephony = Arc::new(TelephonyClient::new(config.telephony.base_url.clone()));

    let outbound = Arc::new(OutboundController::new(
        config.outbound.max_concurrent,
        config.outbound.rate_per_sec,
        Duration::from_millis(config.outbound.min_spacing_ms),
        config.outbound.breaker.threshold,
        Duration::from_millis(config.outbound.breaker.open_ms),
    ));

    let web_state = AppState {
        db: pool.clone(),
        stt_pool,
        outbound: outbound.clone(),
        chat,
        embedder,
        tts,
        telephony,
        vault_key,
        secret_store,
        sessions: Arc::new(DashMap::new()),
    };

    let app = web::create_router(web_state);

    let scheduler_handle = tokio::spawn(scheduler_loop(pool, outbound, Duration::from_secs(5)));

    let web_addr = format!("{}:{}", config.web.host, config.web.port);
    let listener = TcpListener::bind(&web_addr).await?;
    info!("web server listening on http://{web_addr}");

    if let Err(e) = axum::serve(listener, app).await {
        error!("web server error: {e}");
    }

    scheduler_handle.abort();
    Ok(())
}

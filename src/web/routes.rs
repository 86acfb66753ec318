//! REST control surface (§6): placing and inspecting calls, scheduling, and operational
//! stats, plus the two plain-HTTP telephony-provider surfaces (inbound webhook and status
//! callback) that sit alongside the WS media bridge.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::models::{CallDirection, FailureClass, NewCall};
use crate::db::{AgentRepo, CallRepo, PhoneRepo, ScheduledCallRepo};
use crate::error::{AppError, AppResult};
use crate::outbound::app_result_from_outbound;
use crate::scheduler::{classify_failure, project_to_business_hours, schedule_retry, validate_timezone, RecurrenceUnit};
use crate::telephony::{decrypt_phone_credentials, is_valid_e164, verify_webhook_signature, StatusCallback};

use super::telephony_ws::telephony_ws_handler;
use super::AppState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", version: env!("CARGO_PKG_VERSION") })
}

#[derive(Debug, Deserialize)]
struct PlaceOutboundCallRequest {
    to_number: String,
    agent_id: String,
    phone_id: String,
    #[serde(default)]
    correlation_id: Option<String>,
}

fn ws_base_url(public_url: &str) -> String {
    public_url.replace("http://", "ws://").replace("https://", "wss://")
}

/// Place an outbound call (§4.9): resolve the dialing phone and the agent, decrypt the
/// phone's provider credentials, start the call through the telephony REST client, and
/// point it back at our own WS stream endpoint for the media bridge.
async fn place_outbound_call(
    State(state): State<AppState>,
    Json(request): Json<PlaceOutboundCallRequest>,
) -> AppResult<Json<crate::db::models::Call>> {
    if !is_valid_e164(&request.to_number) {
        return Err(AppError::validation(format!("{} is not a valid E.164 phone number", request.to_number)));
    }

    let phone = PhoneRepo::get_by_id(&state.db, &request.phone_id)
        .await?
        .filter(|p| p.active)
        .ok_or_else(|| AppError::not_found(format!("phone {} not found or inactive", request.phone_id)))?;
    let agent = AgentRepo::get_active(&state.db, &request.agent_id).await?;

    let new_call = NewCall {
        direction: CallDirection::Outbound,
        from_number: phone.e164.clone(),
        to_number: request.to_number.clone(),
        agent_id: agent.id.clone(),
        phone_id: Some(phone.id.clone()),
        correlation_id: request.correlation_id.clone().or_else(|| Some(Uuid::new_v4().to_string())),
        agent_snapshot: agent.snapshot(),
    };

    let call = app_result_from_outbound(state.outbound.place_call(&state.db, new_call).await)?;

    // Already has a provider call sid: an earlier request with the same correlation id
    // placed and started this call already, nothing further to do.
    if call.provider_call_sid.is_some() {
        return Ok(Json(call));
    }

    let credentials = decrypt_phone_credentials(&phone, &state.vault_key)?;
    let config = AppConfig::get();
    let callback_url = format!("{}/telephony/stream?call_id={}", ws_base_url(&config.web.public_url), call.id);
    let status_callback_url = format!("{}/telephony/status", config.web.public_url);

    let started = state
        .telephony
        .start_call(&credentials, &phone.e164, &request.to_number, &callback_url, &status_callback_url)
        .await?;
    CallRepo::set_provider_ids(&state.db, &call.id, Some(&started.sid), None).await?;

    let call = CallRepo::get_by_id(&state.db, &call.id)
        .await?
        .ok_or_else(|| AppError::internal("call vanished immediately after creation"))?;
    Ok(Json(call))
}

#[derive(Debug, Serialize)]
struct CallDetail {
    #[serde(flatten)]
    call: crate::db::models::Call,
    transcript: Vec<crate::db::models::TranscriptTurn>,
}

async fn get_call(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<CallDetail>> {
    let call = CallRepo::get_by_id(&state.db, &id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("call {id} not found")))?;
    let transcript = CallRepo::transcript(&state.db, &id).await?;
    Ok(Json(CallDetail { call, transcript }))
}

/// Cancel a call in progress (§4.6). If a Voice Session is live for it, cancel its
/// in-flight work and let its own shutdown path persist the final state; otherwise mark it
/// ended directly (it was never bridged, e.g. still ringing).
async fn cancel_call(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<StatusCode> {
    CallRepo::get_by_id(&state.db, &id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("call {id} not found")))?;

    if let Some(session) = state.sessions.get(&id).map(|entry| entry.value().clone()) {
        session.cancel_handle().await.cancel();
        session.end(&state.db, Some("cancelled")).await?;
    } else {
        CallRepo::mark_ended(&state.db, &id, Some("cancelled")).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ScheduleCallRequest {
    user_id: String,
    phone_e164: String,
    agent_id: String,
    scheduled_for: DateTime<Utc>,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    respect_business_hours: bool,
    #[serde(default)]
    business_hours_start: Option<String>,
    #[serde(default)]
    business_hours_end: Option<String>,
    #[serde(default)]
    business_hours_days: Option<Vec<u8>>,
    #[serde(default)]
    recurrence_unit: Option<String>,
    #[serde(default)]
    recurrence_interval: Option<i64>,
    #[serde(default)]
    recurrence_end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    max_occurrences: Option<i64>,
}

fn parse_time_of_day(s: &str) -> AppResult<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").map_err(|_| AppError::validation(format!("invalid HH:MM time: {s}")))
}

/// Create a (possibly recurring) scheduled outbound call (§4.10): validate the timezone up
/// front, project the requested time forward into business hours if asked, and hand the
/// rest to the durable `scheduled_calls` queue that [`crate::scheduler::scheduler_loop`]
/// polls.
async fn create_schedule(
    State(state): State<AppState>,
    Json(request): Json<ScheduleCallRequest>,
) -> AppResult<Json<crate::db::models::ScheduledCall>> {
    let config = AppConfig::get();
    if !crate::config::feature_flag_enabled(&request.user_id, config.feature_flag.outbound_percentage) {
        return Err(AppError::policy_rejected(format!(
            "user {} is not in the outbound-calling rollout bucket",
            request.user_id
        )));
    }

    if !is_valid_e164(&request.phone_e164) {
        return Err(AppError::validation(format!("{} is not a valid E.164 phone number", request.phone_e164)));
    }

    let timezone = request.timezone.unwrap_or_else(|| config.scheduler.default_timezone.clone());
    let tz = validate_timezone(&timezone)?;

    let business_hours_start = request.business_hours_start.unwrap_or_else(|| config.scheduler.business_hours_default.start.clone());
    let business_hours_end = request.business_hours_end.unwrap_or_else(|| config.scheduler.business_hours_default.end.clone());
    let business_hours_days = request.business_hours_days.unwrap_or_else(|| config.scheduler.business_hours_default.days.clone());

    let scheduled_for = if request.respect_business_hours {
        project_to_business_hours(
            request.scheduled_for,
            tz,
            parse_time_of_day(&business_hours_start)?,
            parse_time_of_day(&business_hours_end)?,
            &business_hours_days,
        )
    } else {
        request.scheduled_for
    };

    // §4.10 step 4: reject schedules that land in the past, whether that's the caller's
    // raw input (business hours disabled) or business-hours projection still somehow
    // landing at or before now.
    if scheduled_for <= Utc::now() {
        return Err(AppError::validation("scheduled time is in the past"));
    }

    if let Some(unit) = &request.recurrence_unit {
        if RecurrenceUnit::parse(unit).is_none() {
            return Err(AppError::validation(format!("unknown recurrence unit: {unit}")));
        }
    }

    let correlation_id = Uuid::new_v4().to_string();
    let scheduled = ScheduledCallRepo::create(
        &state.db,
        &request.user_id,
        &request.phone_e164,
        &request.agent_id,
        scheduled_for,
        &timezone,
        request.respect_business_hours,
        &business_hours_start,
        &business_hours_end,
        &business_hours_days,
        request.recurrence_unit.as_deref(),
        request.recurrence_interval,
        request.recurrence_end_date,
        request.max_occurrences,
        1,
        None,
        &correlation_id,
    )
    .await?;
    Ok(Json(scheduled))
}

#[derive(Debug, Deserialize)]
struct ListScheduledCallsQuery {
    user_id: Option<String>,
    status: Option<String>,
    agent_id: Option<String>,
}

async fn list_scheduled_calls(
    State(state): State<AppState>,
    Query(query): Query<ListScheduledCallsQuery>,
) -> AppResult<Json<Vec<crate::db::models::ScheduledCall>>> {
    let rows = ScheduledCallRepo::list(&state.db, query.user_id.as_deref(), query.status.as_deref(), query.agent_id.as_deref()).await?;
    Ok(Json(rows))
}

async fn cancel_scheduled_call(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<StatusCode> {
    let cancelled = ScheduledCallRepo::cancel(&state.db, &id).await?;
    if cancelled {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::conflict(format!("scheduled call {id} is not pending")))
    }
}

#[derive(Debug, Deserialize)]
struct RescheduleRequest {
    scheduled_for: DateTime<Utc>,
}

async fn reschedule_scheduled_call(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RescheduleRequest>,
) -> AppResult<Json<crate::db::models::ScheduledCall>> {
    let scheduled = ScheduledCallRepo::reschedule(&state.db, &id, request.scheduled_for).await?;
    Ok(Json(scheduled))
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    outbound_available_concurrency: i64,
    stt_pool: crate::pool::PoolStats,
    active_sessions: usize,
}

async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        outbound_available_concurrency: state.outbound.available_concurrency(&state.db).await,
        stt_pool: state.stt_pool.stats(),
        active_sessions: state.sessions.len(),
    })
}

async fn get_pool_stats(State(state): State<AppState>) -> Json<crate::pool::PoolStats> {
    Json(state.stt_pool.stats())
}

#[derive(Debug, Deserialize)]
struct InboundWebhookQuery {
    agent_id: String,
}

#[derive(Debug, Deserialize)]
struct InboundWebhookBody {
    #[serde(rename = "From")]
    from: String,
    #[serde(rename = "To")]
    to: String,
    #[serde(rename = "CallSid")]
    call_sid: String,
}

#[derive(Debug, Serialize)]
struct InboundWebhookResponse {
    stream_url: String,
}

/// The provider's inbound-call webhook (§4.6, §6): the provider hits this once per ringing
/// call for a number whose console configuration points at
/// `/telephony/inbound?agent_id=...`, since [`crate::db::models::Phone`] itself carries no
/// agent routing. The `Call` row is created up front so the WS stream endpoint it redirects
/// to only ever has to look one up, never create one.
async fn telephony_inbound_webhook(
    State(state): State<AppState>,
    Query(query): Query<InboundWebhookQuery>,
    body: Bytes,
) -> AppResult<Json<InboundWebhookResponse>> {
    let payload: InboundWebhookBody =
        serde_urlencoded::from_bytes(&body).map_err(|e| AppError::validation(format!("malformed inbound webhook body: {e}")))?;

    let phone = PhoneRepo::get_by_e164(&state.db, &payload.to)
        .await?
        .filter(|p| p.active)
        .ok_or_else(|| AppError::not_found(format!("no active phone registered for {}", payload.to)))?;
    let agent = AgentRepo::get_active(&state.db, &query.agent_id).await?;

    let new_call = NewCall {
        direction: CallDirection::Inbound,
        from_number: payload.from,
        to_number: payload.to,
        agent_id: agent.id.clone(),
        phone_id: Some(phone.id.clone()),
        correlation_id: Some(payload.call_sid.clone()),
        agent_snapshot: agent.snapshot(),
    };
    let call = CallRepo::create(&state.db, new_call).await?;
    CallRepo::set_provider_ids(&state.db, &call.id, Some(&payload.call_sid), None).await?;

    let config = AppConfig::get();
    let stream_url = format!("{}/telephony/stream?call_id={}", ws_base_url(&config.web.public_url), call.id);
    Ok(Json(InboundWebhookResponse { stream_url }))
}

/// The provider's call-status webhook (§6): verified against the per-Phone webhook secret
/// (delivered as a `custom` secret keyed by `Phone.webhook_secret_ref`, §1a), then used to
/// finalize the call record and feed the retry ladder on failure.
async fn telephony_status_webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> AppResult<StatusCode> {
    let callback: StatusCallback =
        serde_urlencoded::from_bytes(&body).map_err(|e| AppError::validation(format!("malformed status callback: {e}")))?;

    let call = CallRepo::find_by_provider_call_sid(&state.db, &callback.call_sid)
        .await?
        .ok_or_else(|| AppError::not_found(format!("no call for provider sid {}", callback.call_sid)))?;

    if let Some(phone_id) = &call.phone_id {
        let phone = PhoneRepo::get_by_id(&state.db, phone_id)
            .await?
            .ok_or_else(|| AppError::internal("call references a phone that no longer exists"))?;
        let secret = state
            .secret_store
            .custom_secret(&phone.webhook_secret_ref)
            .await
            .ok_or_else(|| AppError::internal("webhook secret not provisioned"))?;
        let signature = headers.get("x-webhook-signature").and_then(|v| v.to_str().ok()).unwrap_or_default();
        if !verify_webhook_signature(&secret, &body, signature) {
            return Err(AppError::policy_rejected("invalid webhook signature"));
        }
    }

    if callback.call_status == "completed" {
        CallRepo::mark_ended(&state.db, &call.id, None).await?;
        state.outbound.record_outcome(&call.to_number, None).await;
    } else if matches!(callback.call_status.as_str(), "failed" | "busy" | "no-answer" | "canceled") {
        let class = classify_failure(&callback.call_status);
        CallRepo::mark_ended(&state.db, &call.id, Some(class.as_str())).await?;
        state.outbound.record_outcome(&call.to_number, Some(class)).await;

        let config = AppConfig::get();
        schedule_retry(&state.db, &call.id, class, config.queue.retry_backoff_ms as i64, config.queue.retry_attempts as i64).await?;
    }

    Ok(StatusCode::OK)
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/telephony/stream", get(telephony_ws_handler))
        .route("/telephony/inbound", post(telephony_inbound_webhook))
        .route("/telephony/status", post(telephony_status_webhook))
        .route("/calls/outbound", post(place_outbound_call))
        .route("/calls/{id}", get(get_call))
        .route("/calls/{id}/cancel", post(cancel_call))
        .route("/schedule", post(create_schedule))
        .route("/scheduled-calls", get(list_scheduled_calls))
        .route("/scheduled-calls/{id}/cancel", post(cancel_scheduled_call))
        .route("/scheduled-calls/{id}/reschedule", post(reschedule_scheduled_call))
        .route("/stats", get(get_stats))
        .route("/stats/pool", get(get_pool_stats))
        .with_state(state)
        .layer(cors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_reports_ok_and_crate_version() {
        let resp = health().await;
        assert_eq!(resp.0.status, "ok");
        assert_eq!(resp.0.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn parse_time_of_day_rejects_malformed_input() {
        assert!(parse_time_of_day("9am").is_err());
        assert!(parse_time_of_day("09:00").is_ok());
    }

    #[test]
    fn ws_base_url_swaps_scheme_only() {
        assert_eq!(ws_base_url("http://localhost:8080"), "ws://localhost:8080");
        assert_eq!(ws_base_url("https://callforge.example.com"), "wss://callforge.example.com");
    }
}

use crate::db::models::*;
use crate::error::{AppError, AppResult};
use chrono::Utc;
use sqlx::{Pool, Sqlite};
use tracing::info;
use uuid::Uuid;

pub type DbPool = Pool<Sqlite>;

/// Database operations for voice agents.
pub struct AgentRepo;

impl AgentRepo {
    pub async fn get_by_id(pool: &DbPool, agent_id: &str) -> AppResult<Option<Agent>> {
        let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = ?")
            .bind(agent_id)
            .fetch_optional(pool)
            .await?;
        Ok(agent)
    }

    pub async fn get_active(pool: &DbPool, agent_id: &str) -> AppResult<Agent> {
        Self::get_by_id(pool, agent_id)
            .await?
            .filter(|a| a.active)
            .ok_or_else(|| AppError::not_found(format!("agent {agent_id} not found or inactive")))
    }
}

/// Database operations for per-Phone telephony credentials.
pub struct PhoneRepo;

impl PhoneRepo {
    pub async fn get_by_e164(pool: &DbPool, e164: &str) -> AppResult<Option<Phone>> {
        let phone = sqlx::query_as::<_, Phone>("SELECT * FROM phones WHERE e164 = ?")
            .bind(e164)
            .fetch_optional(pool)
            .await?;
        Ok(phone)
    }

    pub async fn get_by_id(pool: &DbPool, id: &str) -> AppResult<Option<Phone>> {
        let phone = sqlx::query_as::<_, Phone>("SELECT * FROM phones WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(phone)
    }
}

/// Database operations for calls and their transcripts.
pub struct CallRepo;

impl CallRepo {
    /// Create a Call in `initiated`/`connecting` state. Outbound calls start `initiated`
    /// (§4.9); inbound calls start `connecting` (§4.6).
    pub async fn create(pool: &DbPool, new_call: NewCall) -> AppResult<Call> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let initial_state = match new_call.direction {
            CallDirection::Outbound => CallState::Initiated,
            CallDirection::Inbound => CallState::Connecting,
        };
        let snapshot_json = serde_json::to_string(&new_call.agent_snapshot)
            .map_err(|e| AppError::internal(format!("snapshot serialize: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO calls (
                id, direction, from_number, to_number, agent_id, phone_id, correlation_id,
                provider_call_sid, stream_sid, state, agent_snapshot, failure_reason,
                started_at, ended_at, duration_ms, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, NULL, NULL, ?, ?, NULL, NULL, NULL, NULL, ?)
            "#,
        )
        .bind(&id)
        .bind(new_call.direction.as_str())
        .bind(&new_call.from_number)
        .bind(&new_call.to_number)
        .bind(&new_call.agent_id)
        .bind(&new_call.phone_id)
        .bind(&new_call.correlation_id)
        .bind(initial_state.as_str())
        .bind(&snapshot_json)
        .bind(now)
        .execute(pool)
        .await?;

        Self::get_by_id(pool, &id)
            .await?
            .ok_or_else(|| AppError::internal("failed to retrieve created call"))
    }

    pub async fn get_by_id(pool: &DbPool, id: &str) -> AppResult<Option<Call>> {
        let call = sqlx::query_as::<_, Call>("SELECT * FROM calls WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(call)
    }

    /// Idempotent outbound lookup: a correlation id seen within the dedup window maps back
    /// to its original call (§4.9, §8).
    pub async fn find_by_correlation_id(pool: &DbPool, correlation_id: &str) -> AppResult<Option<Call>> {
        let call = sqlx::query_as::<_, Call>(
            "SELECT * FROM calls WHERE correlation_id = ? ORDER BY created_at ASC LIMIT 1",
        )
        .bind(correlation_id)
        .fetch_optional(pool)
        .await?;
        Ok(call)
    }

    /// Look up a call by the provider's own call identifier, used by the status webhook
    /// which only ever carries `CallSid`, never our internal id or correlation id (§6).
    pub async fn find_by_provider_call_sid(pool: &DbPool, provider_call_sid: &str) -> AppResult<Option<Call>> {
        let call = sqlx::query_as::<_, Call>("SELECT * FROM calls WHERE provider_call_sid = ?")
            .bind(provider_call_sid)
            .fetch_optional(pool)
            .await?;
        Ok(call)
    }

    /// Count outbound Calls not yet in a terminal state, i.e. the live concurrency the
    /// Outbound Controller's cap (§4.9) is measured against.
    pub async fn count_non_terminal_outbound(pool: &DbPool) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM calls WHERE direction = 'outbound' AND state != 'ended'",
        )
        .fetch_one(pool)
        .await?;
        Ok(count)
    }

    pub async fn set_state(pool: &DbPool, id: &str, state: CallState) -> AppResult<()> {
        sqlx::query("UPDATE calls SET state = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn set_provider_ids(
        pool: &DbPool,
        id: &str,
        provider_call_sid: Option<&str>,
        stream_sid: Option<&str>,
    ) -> AppResult<()> {
        sqlx::query("UPDATE calls SET provider_call_sid = COALESCE(?, provider_call_sid), stream_sid = COALESCE(?, stream_sid) WHERE id = ?")
            .bind(provider_call_sid)
            .bind(stream_sid)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn mark_started(pool: &DbPool, id: &str) -> AppResult<()> {
        sqlx::query("UPDATE calls SET started_at = COALESCE(started_at, ?) WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Terminate a call. A call that produced any audio always ends `completed`
    /// regardless of recovered faults (§7); `failure_reason` records the root cause.
    pub async fn mark_ended(
        pool: &DbPool,
        id: &str,
        failure_reason: Option<&str>,
    ) -> AppResult<()> {
        let call = Self::get_by_id(pool, id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("call {id} not found")))?;
        let now = Utc::now();
        let duration_ms = call
            .started_at
            .map(|started| (now - started).num_milliseconds())
            .unwrap_or(0);

        sqlx::query(
            "UPDATE calls SET state = ?, ended_at = ?, duration_ms = ?, failure_reason = COALESCE(?, failure_reason) WHERE id = ?",
        )
        .bind(CallState::Ended.as_str())
        .bind(now)
        .bind(duration_ms)
        .bind(failure_reason)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn append_transcript_turn(
        pool: &DbPool,
        call_id: &str,
        speaker: Speaker,
        text: &str,
    ) -> AppResult<TranscriptTurn> {
        let ordinal: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(ordinal) + 1, 0) FROM transcript_turns WHERE call_id = ?")
                .bind(call_id)
                .fetch_one(pool)
                .await?;
        let now = Utc::now();

        let id = sqlx::query(
            "INSERT INTO transcript_turns (call_id, speaker, text, ordinal, turn_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(call_id)
        .bind(speaker.as_str())
        .bind(text)
        .bind(ordinal)
        .bind(now)
        .execute(pool)
        .await?
        .last_insert_rowid();

        Ok(TranscriptTurn {
            id,
            call_id: call_id.to_string(),
            speaker: speaker.as_str().to_string(),
            text: text.to_string(),
            ordinal,
            turn_at: now,
        })
    }

    pub async fn transcript(pool: &DbPool, call_id: &str) -> AppResult<Vec<TranscriptTurn>> {
        let turns = sqlx::query_as::<_, TranscriptTurn>(
            "SELECT * FROM transcript_turns WHERE call_id = ? ORDER BY ordinal ASC",
        )
        .bind(call_id)
        .fetch_all(pool)
        .await?;
        Ok(turns)
    }
}

/// Database operations for scheduled (and recurring) outbound calls.
pub struct ScheduledCallRepo;

impl ScheduledCallRepo {
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        pool: &DbPool,
        user_id: &str,
        phone_e164: &str,
        agent_id: &str,
        scheduled_for: chrono::DateTime<Utc>,
        timezone: &str,
        respect_business_hours: bool,
        business_hours_start: &str,
        business_hours_end: &str,
        business_hours_days: &[u8],
        recurrence_unit: Option<&str>,
        recurrence_interval: Option<i64>,
        recurrence_end_date: Option<chrono::DateTime<Utc>>,
        max_occurrences: Option<i64>,
        occurrence: i64,
        parent_scheduled_call_id: Option<&str>,
        correlation_id: &str,
    ) -> AppResult<ScheduledCall> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let days_json = serde_json::to_string(business_hours_days).unwrap();

        sqlx::query(
            r#"
            INSERT INTO scheduled_calls (
                id, user_id, phone_e164, agent_id, scheduled_for, timezone,
                respect_business_hours, business_hours_start, business_hours_end, business_hours_days,
                recurrence_unit, recurrence_interval, recurrence_end_date, max_occurrences, occurrence,
                status, produced_call_id, parent_scheduled_call_id, correlation_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', NULL, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(phone_e164)
        .bind(agent_id)
        .bind(scheduled_for)
        .bind(timezone)
        .bind(respect_business_hours)
        .bind(business_hours_start)
        .bind(business_hours_end)
        .bind(&days_json)
        .bind(recurrence_unit)
        .bind(recurrence_interval)
        .bind(recurrence_end_date)
        .bind(max_occurrences)
        .bind(occurrence)
        .bind(parent_scheduled_call_id)
        .bind(correlation_id)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        Self::get_by_id(pool, &id)
            .await?
            .ok_or_else(|| AppError::internal("failed to retrieve created scheduled call"))
    }

    pub async fn get_by_id(pool: &DbPool, id: &str) -> AppResult<Option<ScheduledCall>> {
        let row = sqlx::query_as::<_, ScheduledCall>("SELECT * FROM scheduled_calls WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(row)
    }

    pub async fn list(
        pool: &DbPool,
        user_id: Option<&str>,
        status: Option<&str>,
        agent_id: Option<&str>,
    ) -> AppResult<Vec<ScheduledCall>> {
        let rows = sqlx::query_as::<_, ScheduledCall>(
            r#"
            SELECT * FROM scheduled_calls
            WHERE (?1 IS NULL OR user_id = ?1)
              AND (?2 IS NULL OR status = ?2)
              AND (?3 IS NULL OR agent_id = ?3)
            ORDER BY scheduled_for ASC
            "#,
        )
        .bind(user_id)
        .bind(status)
        .bind(agent_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Compare-and-set the status, the single source of truth for at-least-once dedup
    /// (§5, §4.10). Returns `false` if another worker already moved the row off `from`.
    pub async fn cas_status(
        pool: &DbPool,
        id: &str,
        from: ScheduledCallStatus,
        to: ScheduledCallStatus,
    ) -> AppResult<bool> {
        let result = sqlx::query("UPDATE scheduled_calls SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(Utc::now())
            .bind(id)
            .bind(from.as_str())
            .execute(pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_produced_call(pool: &DbPool, id: &str, call_id: &str) -> AppResult<()> {
        sqlx::query("UPDATE scheduled_calls SET produced_call_id = ? WHERE id = ?")
            .bind(call_id)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn cancel(pool: &DbPool, id: &str) -> AppResult<bool> {
        let row = Self::get_by_id(pool, id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("scheduled call {id} not found")))?;
        Self::cas_status(pool, id, row.status(), ScheduledCallStatus::Cancelled).await
    }

    pub async fn reschedule(
        pool: &DbPool,
        id: &str,
        new_scheduled_for: chrono::DateTime<Utc>,
    ) -> AppResult<ScheduledCall> {
        sqlx::query("UPDATE scheduled_calls SET scheduled_for = ?, status = 'pending', updated_at = ? WHERE id = ?")
            .bind(new_scheduled_for)
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await?;
        Self::get_by_id(pool, id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("scheduled call {id} not found")))
    }
}

/// Database operations for the retry ladder applied to failed outbound calls.
pub struct RetryAttemptRepo;

impl RetryAttemptRepo {
    pub async fn create(
        pool: &DbPool,
        call_id: &str,
        attempt_number: i64,
        failure_class: FailureClass,
        next_attempt_at: chrono::DateTime<Utc>,
        backoff_ms: i64,
    ) -> AppResult<RetryAttempt> {
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO retry_attempts (call_id, attempt_number, failure_class, next_attempt_at, backoff_ms, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(call_id)
        .bind(attempt_number)
        .bind(failure_class.as_str())
        .bind(next_attempt_at)
        .bind(backoff_ms)
        .bind(now)
        .execute(pool)
        .await?
        .last_insert_rowid();

        Ok(RetryAttempt {
            id,
            call_id: call_id.to_string(),
            attempt_number,
            failure_class: failure_class.as_str().to_string(),
            next_attempt_at,
            backoff_ms,
            created_at: now,
        })
    }

    pub async fn count_for_call(pool: &DbPool, call_id: &str) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM retry_attempts WHERE call_id = ?")
            .bind(call_id)
            .fetch_one(pool)
            .await?;
        Ok(count)
    }
}

/// Naive cosine-similarity scan over a flat table, standing in for a real vector index
/// (out of scope per §1 non-goals: "Document ingestion/chunking/embedding").
pub struct KnowledgeChunkRepo;

impl KnowledgeChunkRepo {
    pub async fn by_agent(pool: &DbPool, agent_id: &str) -> AppResult<Vec<KnowledgeChunk>> {
        let rows = sqlx::query_as::<_, KnowledgeChunk>(
            "SELECT * FROM knowledge_chunks WHERE agent_id = ? ORDER BY ordinal ASC",
        )
        .bind(agent_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}

pub async fn init_db(pool: &DbPool) -> AppResult<()> {
    info!("running database migrations");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            default_timezone TEXT NOT NULL DEFAULT 'UTC',
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS agents (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            persona TEXT NOT NULL,
            greeting TEXT NOT NULL,
            language TEXT NOT NULL DEFAULT 'en',
            llm_model TEXT NOT NULL,
            llm_temperature REAL NOT NULL DEFAULT 0.7,
            llm_max_tokens INTEGER,
            tts_provider TEXT NOT NULL,
            tts_voice_id TEXT NOT NULL,
            end_call_phrases TEXT NOT NULL DEFAULT '[]',
            knowledge_base_id TEXT,
            active BOOLEAN NOT NULL DEFAULT true,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS phones (
            id TEXT PRIMARY KEY,
            e164 TEXT UNIQUE NOT NULL,
            provider TEXT NOT NULL,
            encrypted_credentials TEXT NOT NULL,
            webhook_secret_ref TEXT NOT NULL,
            active BOOLEAN NOT NULL DEFAULT true,
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS calls (
            id TEXT PRIMARY KEY,
            direction TEXT NOT NULL,
            from_number TEXT NOT NULL,
            to_number TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            phone_id TEXT,
            correlation_id TEXT,
            provider_call_sid TEXT,
            stream_sid TEXT,
            state TEXT NOT NULL,
            agent_snapshot TEXT NOT NULL,
            failure_reason TEXT,
            started_at DATETIME,
            ended_at DATETIME,
            duration_ms INTEGER,
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transcript_turns (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            call_id TEXT NOT NULL,
            speaker TEXT NOT NULL,
            text TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            turn_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scheduled_calls (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            phone_e164 TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            scheduled_for DATETIME NOT NULL,
            timezone TEXT NOT NULL,
            respect_business_hours BOOLEAN NOT NULL DEFAULT false,
            business_hours_start TEXT NOT NULL DEFAULT '09:00',
            business_hours_end TEXT NOT NULL DEFAULT '18:00',
            business_hours_days TEXT NOT NULL DEFAULT '[1,2,3,4,5]',
            recurrence_unit TEXT,
            recurrence_interval INTEGER,
            recurrence_end_date DATETIME,
            max_occurrences INTEGER,
            occurrence INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'pending',
            produced_call_id TEXT,
            parent_scheduled_call_id TEXT,
            correlation_id TEXT NOT NULL,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS retry_attempts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            call_id TEXT NOT NULL,
            attempt_number INTEGER NOT NULL,
            failure_class TEXT NOT NULL,
            next_attempt_at DATETIME NOT NULL,
            backoff_ms INTEGER NOT NULL,
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS knowledge_docs (
            id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            source_uri TEXT NOT NULL,
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS knowledge_chunks (
            id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            doc_id TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            text TEXT NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_calls_correlation_id ON calls(correlation_id) WHERE correlation_id IS NOT NULL")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_scheduled_calls_status_time ON scheduled_calls(status, scheduled_for)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_scheduled_calls_user_status ON scheduled_calls(user_id, status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_knowledge_chunks_agent ON knowledge_chunks(agent_id)")
        .execute(pool)
        .await?;

    info!("database migrations complete");
    Ok(())
}

#[cfg(test)]
pub async fn setup_test_db() -> DbPool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite pool");
    init_db(&pool).await.expect("init_db");
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::AgentSnapshot;

    fn snapshot() -> AgentSnapshot {
        AgentSnapshot {
            agent_id: "agent-1".into(),
            persona: "You are Pat.".into(),
            greeting: "Hi, Pat here.".into(),
            language: "en".into(),
            llm_model: "gpt-test".into(),
            llm_temperature: 0.7,
            llm_max_tokens: None,
            tts_provider: "test".into(),
            tts_voice_id: "voice-1".into(),
            end_call_phrases: vec!["goodbye".into()],
            knowledge_base_id: None,
        }
    }

    #[tokio::test]
    async fn create_and_fetch_call_roundtrips() {
        let pool = setup_test_db().await;
        let call = CallRepo::create(
            &pool,
            NewCall {
                direction: CallDirection::Inbound,
                from_number: "+15551234567".into(),
                to_number: "+15557654321".into(),
                agent_id: "agent-1".into(),
                phone_id: None,
                correlation_id: None,
                agent_snapshot: snapshot(),
            },
        )
        .await
        .unwrap();

        assert_eq!(call.state(), CallState::Connecting);
        let fetched = CallRepo::get_by_id(&pool, &call.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, call.id);
    }

    #[tokio::test]
    async fn correlation_id_lookup_dedups() {
        let pool = setup_test_db().await;
        let call = CallRepo::create(
            &pool,
            NewCall {
                direction: CallDirection::Outbound,
                from_number: "+15551234567".into(),
                to_number: "+15557654321".into(),
                agent_id: "agent-1".into(),
                phone_id: None,
                correlation_id: Some("corr-1".into()),
                agent_snapshot: snapshot(),
            },
        )
        .await
        .unwrap();

        let found = CallRepo::find_by_correlation_id(&pool, "corr-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, call.id);
    }

    #[tokio::test]
    async fn transcript_turns_are_ordered() {
        let pool = setup_test_db().await;
        let call = CallRepo::create(
            &pool,
            NewCall {
                direction: CallDirection::Inbound,
                from_number: "+15551234567".into(),
                to_number: "+15557654321".into(),
                agent_id: "agent-1".into(),
                phone_id: None,
                correlation_id: None,
                agent_snapshot: snapshot(),
            },
        )
        .await
        .unwrap();

        CallRepo::append_transcript_turn(&pool, &call.id, Speaker::Agent, "Hi, Pat here.")
            .await
            .unwrap();
        CallRepo::append_transcript_turn(&pool, &call.id, Speaker::Caller, "hi there")
            .await
            .unwrap();

        let turns = CallRepo::transcript(&pool, &call.id).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].speaker, "agent");
        assert_eq!(turns[1].speaker, "caller");
    }

    #[tokio::test]
    async fn scheduled_call_cas_status_rejects_stale_transition() {
        let pool = setup_test_db().await;
        let sched = ScheduledCallRepo::create(
            &pool,
            "user-1",
            "+15551234567",
            "agent-1",
            Utc::now(),
            "Asia/Kolkata",
            false,
            "09:00",
            "18:00",
            &[1, 2, 3, 4, 5],
            None,
            None,
            None,
            None,
            1,
            None,
            "corr-sched-1",
        )
        .await
        .unwrap();

        assert!(
            ScheduledCallRepo::cas_status(
                &pool,
                &sched.id,
                ScheduledCallStatus::Pending,
                ScheduledCallStatus::Processing
            )
            .await
            .unwrap()
        );
        // Second worker racing on the same (stale) expectation must lose.
        assert!(
            !ScheduledCallRepo::cas_status(
                &pool,
                &sched.id,
                ScheduledCallStatus::Pending,
                ScheduledCallStatus::Processing
            )
            .await
            .unwrap()
        );
    }
}

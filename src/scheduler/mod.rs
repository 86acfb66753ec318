//! Scheduler / Retry Engine (§4.10): durable delayed-job queue over `scheduled_calls`,
//! IANA-timezone business-hours projection, bounded recurrence chaining, and a
//! failure-class-aware retry ladder for outbound placement failures.
//!
//! Built on the cron crate for recurrence interval math and chrono-tz for correct
//! timezone-aware business-hours projection; the worker loop itself follows a
//! poll-claim-execute shape, generalized from a single fixed interval to a per-row
//! `scheduled_for` due-time poll.

use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::{error, info, warn};

use crate::db::models::{FailureClass, NewCall, ScheduledCall, ScheduledCallStatus};
use crate::db::{CallRepo, DbPool, ScheduledCallRepo};
use crate::error::{AppError, AppResult};
use crate::outbound::{retry_backoff, OutboundController};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecurrenceUnit {
    Days,
    Weeks,
    Months,
}

impl RecurrenceUnit {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "days" => Some(Self::Days),
            "weeks" => Some(Self::Weeks),
            "months" => Some(Self::Months),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Days => "days",
            Self::Weeks => "weeks",
            Self::Months => "months",
        }
    }
}

/// Add `months` calendar months to `from`, preserving the local time-of-day and clamping
/// the day-of-month into the target month if it doesn't have that many days (e.g. Jan 31 +
/// 1 month -> Feb 28/29, not Mar 3) (§4.10).
fn add_months_preserving_day(from: DateTime<Utc>, months: i64) -> DateTime<Utc> {
    let total_months = from.year() as i64 * 12 + (from.month() as i64 - 1) + months;
    let target_year = total_months.div_euclid(12) as i32;
    let target_month = (total_months.rem_euclid(12) + 1) as u32;
    let last_day_of_target_month = last_day_of_month(target_year, target_month);
    let target_day = from.day().min(last_day_of_target_month);

    let naive_date = chrono::NaiveDate::from_ymd_opt(target_year, target_month, target_day)
        .expect("clamped day is always valid for its month");
    let naive = naive_date.and_time(from.time());
    Utc.from_utc_datetime(&naive)
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let first_of_next = chrono::NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .expect("valid next-month first day");
    first_of_next.pred_opt().expect("day before the 1st exists").day()
}

/// Validate that `tz_name` is a real IANA timezone identifier (§4.10 edge case: reject
/// unknown timezones at schedule-creation time rather than failing silently at fire time).
pub fn validate_timezone(tz_name: &str) -> AppResult<Tz> {
    tz_name
        .parse::<Tz>()
        .map_err(|_| AppError::validation(format!("unknown IANA timezone: {tz_name}")))
}

/// Project `candidate` (UTC) forward to the next moment that falls inside the configured
/// business-hours window in `tz`, or return it unchanged if it already qualifies.
/// Business hours are defined as `[start, end)` local time on the configured weekdays
/// (ISO weekday numbers, 1=Mon..7=Sun).
pub fn project_to_business_hours(
    candidate: DateTime<Utc>,
    tz: Tz,
    start: NaiveTime,
    end: NaiveTime,
    days: &[u8],
) -> DateTime<Utc> {
    if days.is_empty() {
        return candidate;
    }

    let mut local = candidate.with_timezone(&tz);
    for _ in 0..8 {
        let weekday = local.weekday().number_from_monday() as u8;
        let time = local.time();
        let is_business_day = days.contains(&weekday);

        if is_business_day && time >= start && time < end {
            return local.with_timezone(&Utc);
        }

        if is_business_day && time < start {
            let projected = local.date_naive().and_time(start);
            if let chrono::LocalResult::Single(dt) = tz.from_local_datetime(&projected) {
                return dt.with_timezone(&Utc);
            }
        }

        // Past end-of-day or not a business day: advance to the next day's start.
        let next_day = local.date_naive().succ_opt().unwrap_or(local.date_naive());
        let projected = next_day.and_time(start);
        match tz.from_local_datetime(&projected) {
            chrono::LocalResult::Single(dt) => local = dt,
            chrono::LocalResult::Ambiguous(dt, _) => local = dt,
            chrono::LocalResult::None => {
                local = local + chrono::Duration::days(1);
            }
        }
    }

    warn!("business hours projection did not converge within 8 iterations, returning best effort");
    local.with_timezone(&Utc)
}

/// Compute the next occurrence's naive due time, bounded by `max_occurrences` and
/// `recurrence_end_date` (§4.10: a recurrence never schedules past either bound).
pub fn next_occurrence(
    previous: &ScheduledCall,
) -> Option<DateTime<Utc>> {
    let unit = previous.recurrence_unit.as_deref().and_then(RecurrenceUnit::parse)?;
    let interval = previous.recurrence_interval.unwrap_or(1).max(1);

    if let Some(max) = previous.max_occurrences {
        if previous.occurrence >= max {
            return None;
        }
    }

    let next = match unit {
        RecurrenceUnit::Days => previous.scheduled_for + chrono::Duration::days(interval),
        RecurrenceUnit::Weeks => previous.scheduled_for + chrono::Duration::weeks(interval),
        RecurrenceUnit::Months => add_months_preserving_day(previous.scheduled_for, interval),
    };

    if let Some(end_date) = previous.recurrence_end_date {
        if next > end_date {
            return None;
        }
    }

    Some(next)
}

/// Map a raw telephony outcome to a [`FailureClass`]; anything not recognized is treated
/// as a network error (conservatively retryable) rather than silently dropped (§4.10).
pub fn classify_failure(reason: &str) -> FailureClass {
    let lowered = reason.to_lowercase();
    if lowered.contains("no-answer") || lowered.contains("no_answer") {
        FailureClass::NoAnswer
    } else if lowered.contains("busy") {
        FailureClass::Busy
    } else if lowered.contains("voicemail") || lowered.contains("machine") {
        FailureClass::Voicemail
    } else if lowered.contains("invalid") {
        FailureClass::InvalidNumber
    } else if lowered.contains("fatal") || lowered.contains("4") && lowered.contains("http") {
        FailureClass::UpstreamFatal
    } else {
        FailureClass::NetworkError
    }
}

/// Poll `scheduled_calls` for rows whose `scheduled_for` has passed, claim each one via
/// CAS (`pending` -> `processing`), place the call, and chain the next recurrence if any.
/// Designed to run as a background task polled on a fixed interval; concurrent workers
/// never double-fire a row because the CAS only ever succeeds for one caller (§5, §8).
pub async fn run_due_schedules(pool: &DbPool, outbound: &OutboundController) -> AppResult<usize> {
    let due = ScheduledCallRepo::list(pool, None, Some(ScheduledCallStatus::Pending.as_str()), None).await?;
    let now = Utc::now();
    let mut fired = 0;

    for scheduled in due {
        if scheduled.scheduled_for > now {
            continue;
        }

        let claimed = ScheduledCallRepo::cas_status(
            pool,
            &scheduled.id,
            ScheduledCallStatus::Pending,
            ScheduledCallStatus::Processing,
        )
        .await?;
        if !claimed {
            continue;
        }

        match fire_schedule(pool, outbound, &scheduled).await {
            Ok(call_id) => {
                ScheduledCallRepo::set_produced_call(pool, &scheduled.id, &call_id).await?;
                ScheduledCallRepo::cas_status(
                    pool,
                    &scheduled.id,
                    ScheduledCallStatus::Processing,
                    ScheduledCallStatus::Completed,
                )
                .await?;
                fired += 1;
            }
            Err(e) => {
                error!(scheduled_call_id = %scheduled.id, error = %e, "failed to fire scheduled call");
                ScheduledCallRepo::cas_status(
                    pool,
                    &scheduled.id,
                    ScheduledCallStatus::Processing,
                    ScheduledCallStatus::Failed,
                )
                .await?;
            }
        }

        if let Some(next_due) = next_occurrence(&scheduled) {
            let tz = validate_timezone(&scheduled.timezone).unwrap_or(chrono_tz::UTC);
            let due = if scheduled.respect_business_hours {
                project_to_business_hours(
                    next_due,
                    tz,
                    parse_time(&scheduled.business_hours_start),
                    parse_time(&scheduled.business_hours_end),
                    &scheduled.business_hours_days(),
                )
            } else {
                next_due
            };

            ScheduledCallRepo::create(
                pool,
                &scheduled.user_id,
                &scheduled.phone_e164,
                &scheduled.agent_id,
                due,
                &scheduled.timezone,
                scheduled.respect_business_hours,
                &scheduled.business_hours_start,
                &scheduled.business_hours_end,
                &scheduled.business_hours_days(),
                scheduled.recurrence_unit.as_deref(),
                scheduled.recurrence_interval,
                scheduled.recurrence_end_date,
                scheduled.max_occurrences,
                scheduled.occurrence + 1,
                Some(&scheduled.id),
                &format!("{}-occ{}", scheduled.correlation_id, scheduled.occurrence + 1),
            )
            .await?;
        }
    }

    Ok(fired)
}

fn parse_time(s: &str) -> NaiveTime {
    NaiveTime::parse_from_str(s, "%H:%M").unwrap_or_else(|_| NaiveTime::from_hms_opt(0, 0, 0).unwrap())
}

async fn fire_schedule(pool: &DbPool, outbound: &OutboundController, scheduled: &ScheduledCall) -> AppResult<String> {
    let agent = crate::db::AgentRepo::get_active(pool, &scheduled.agent_id).await?;
    let new_call = NewCall {
        direction: crate::db::models::CallDirection::Outbound,
        from_number: String::new(),
        to_number: scheduled.phone_e164.clone(),
        agent_id: agent.id.clone(),
        phone_id: None,
        correlation_id: Some(scheduled.correlation_id.clone()),
        agent_snapshot: agent.snapshot(),
    };

    let call = outbound
        .place_call(pool, new_call)
        .await
        .map_err(AppError::from)?;
    Ok(call.id)
}

/// Schedule the next retry attempt for a failed outbound call, honoring the per-class
/// retry policy (§4.10): non-retryable classes (invalid number, upstream fatal) never
/// schedule another attempt.
pub async fn schedule_retry(
    pool: &DbPool,
    call_id: &str,
    failure_class: FailureClass,
    base_backoff_ms: i64,
    max_attempts: i64,
) -> AppResult<Option<DateTime<Utc>>> {
    if !failure_class.is_retryable() {
        info!(call_id, ?failure_class, "failure class is not retryable, no further attempts scheduled");
        return Ok(None);
    }

    let attempts_so_far = crate::db::RetryAttemptRepo::count_for_call(pool, call_id).await?;
    if attempts_so_far >= max_attempts {
        info!(call_id, attempts_so_far, "retry attempts exhausted");
        return Ok(None);
    }

    let backoff = retry_backoff(attempts_so_far, base_backoff_ms);
    let next_attempt_at = Utc::now() + chrono::Duration::from_std(backoff).unwrap_or_default();

    crate::db::RetryAttemptRepo::create(
        pool,
        call_id,
        attempts_so_far + 1,
        failure_class,
        next_attempt_at,
        backoff.as_millis() as i64,
    )
    .await?;

    Ok(Some(next_attempt_at))
}

/// Run [`run_due_schedules`] on a fixed poll interval until cancelled.
pub async fn scheduler_loop(pool: DbPool, outbound: std::sync::Arc<OutboundController>, poll_interval: Duration) {
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        ticker.tick().await;
        match run_due_schedules(&pool, &outbound).await {
            Ok(fired) if fired > 0 => info!(fired, "scheduler fired due calls"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "scheduler poll failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_timezone_accepts_iana_names() {
        assert!(validate_timezone("Asia/Kolkata").is_ok());
        assert!(validate_timezone("Not/AZone").is_err());
    }

    #[test]
    fn project_to_business_hours_is_noop_when_already_inside_window() {
        let tz: Tz = "UTC".parse().unwrap();
        let candidate = Utc.with_ymd_and_hms(2026, 7, 28, 10, 0, 0).unwrap();
        let start = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let end = NaiveTime::from_hms_opt(18, 0, 0).unwrap();
        let projected = project_to_business_hours(candidate, tz, start, end, &[1, 2, 3, 4, 5]);
        assert_eq!(projected, candidate);
    }

    #[test]
    fn project_to_business_hours_rolls_forward_past_close() {
        let tz: Tz = "UTC".parse().unwrap();
        // 2026-07-28 is a Tuesday; 19:00 is past the 18:00 close.
        let candidate = Utc.with_ymd_and_hms(2026, 7, 28, 19, 0, 0).unwrap();
        let start = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let end = NaiveTime::from_hms_opt(18, 0, 0).unwrap();
        let projected = project_to_business_hours(candidate, tz, start, end, &[1, 2, 3, 4, 5]);
        assert!(projected > candidate);
        assert_eq!(projected.with_timezone(&tz).time(), start);
    }

    #[test]
    fn classify_failure_recognizes_common_reasons() {
        assert_eq!(classify_failure("call ended with no-answer"), FailureClass::NoAnswer);
        assert_eq!(classify_failure("line busy"), FailureClass::Busy);
        assert_eq!(classify_failure("invalid number format"), FailureClass::InvalidNumber);
    }

    #[test]
    fn retry_is_skipped_for_non_retryable_class() {
        assert!(!FailureClass::InvalidNumber.is_retryable());
        assert!(FailureClass::NoAnswer.is_retryable());
    }

    #[test]
    fn monthly_recurrence_preserves_day_of_month() {
        let start = Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap();
        let next = add_months_preserving_day(start, 1);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 15, 9, 0, 0).unwrap());
    }

    #[test]
    fn monthly_recurrence_clamps_into_shorter_months() {
        let start = Utc.with_ymd_and_hms(2026, 1, 31, 9, 0, 0).unwrap();
        let next = add_months_preserving_day(start, 1);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 28, 9, 0, 0).unwrap());
    }

    fn scheduled_call_at(occurrence: i64, max_occurrences: Option<i64>) -> crate::db::models::ScheduledCall {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        crate::db::models::ScheduledCall {
            id: format!("sched-{occurrence}"),
            user_id: "user-1".into(),
            phone_e164: "+15551234567".into(),
            agent_id: "agent-1".into(),
            scheduled_for: now + chrono::Duration::days(occurrence - 1),
            timezone: "UTC".into(),
            respect_business_hours: false,
            business_hours_start: "09:00".into(),
            business_hours_end: "18:00".into(),
            business_hours_days: "[1,2,3,4,5]".into(),
            recurrence_unit: Some("days".into()),
            recurrence_interval: Some(1),
            recurrence_end_date: None,
            max_occurrences,
            occurrence,
            status: "pending".into(),
            produced_call_id: None,
            parent_scheduled_call_id: None,
            correlation_id: format!("corr-{occurrence}"),
            created_at: now,
            updated_at: now,
        }
    }

    /// §8 scenario 6: daily recurrence with `max_occurrences = 3` must fire occurrences 1,
    /// 2, and 3, and produce no successor after occurrence 3 completes.
    #[test]
    fn recurrence_chain_runs_exactly_max_occurrences_then_terminates() {
        let occurrence_1 = scheduled_call_at(1, Some(3));
        let occurrence_2_due = next_occurrence(&occurrence_1).expect("occurrence 2 must be scheduled");
        assert_eq!(occurrence_2_due, occurrence_1.scheduled_for + chrono::Duration::days(1));

        let occurrence_2 = scheduled_call_at(2, Some(3));
        let occurrence_3_due = next_occurrence(&occurrence_2).expect("occurrence 3 must be scheduled");
        assert_eq!(occurrence_3_due, occurrence_2.scheduled_for + chrono::Duration::days(1));

        let occurrence_3 = scheduled_call_at(3, Some(3));
        assert!(next_occurrence(&occurrence_3).is_none(), "chain must terminate after occurrence 3");
    }
}

//! Retry scheduling
//!
//! The automatic schedule is fixed-shape: offsets of 3, 7 and 14 days from
//! `recovery_started_at`, for a maximum of three automatic attempts. Manual
//! attempts are immediate, appended after the highest existing sequence
//! number, and capped at three per case per trailing 24 hours.
//!
//! Scheduling is idempotent: the unique `(case_id, sequence_number)` index
//! makes a duplicate insert a no-op, which is what keeps the
//! single-pending-attempt invariant without pessimistic locking.

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{RecoveryError, RecoveryResult};
use crate::model::{AttemptSource, CaseEvent, CaseStatus, FailedPaymentCase};

/// Day offsets of the automatic schedule, from `recovery_started_at`.
pub const RETRY_OFFSET_DAYS: [i64; 3] = [3, 7, 14];

/// Maximum manually-scheduled attempts per case per trailing 24 hours.
pub const MANUAL_RETRY_WINDOW: Duration = Duration::hours(24);
pub const MANUAL_RETRY_LIMIT: i64 = 3;

/// Offset of automatic attempt `sequence` (1-based), or `None` past the end
/// of the fixed table.
pub fn automatic_offset(sequence: i32) -> Option<Duration> {
    if sequence < 1 {
        return None;
    }
    RETRY_OFFSET_DAYS
        .get(sequence as usize - 1)
        .map(|&days| Duration::days(days))
}

/// Trailing-window manual cap decision: given how many manual attempts exist
/// in the window and when the oldest of them was created, returns the seconds
/// the caller must wait, or `None` when another attempt is allowed.
pub fn manual_cap_delay(
    recent_manual: i64,
    oldest_recent: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> Option<i64> {
    if recent_manual < MANUAL_RETRY_LIMIT {
        return None;
    }
    let oldest = oldest_recent.unwrap_or(now);
    Some(((oldest + MANUAL_RETRY_WINDOW) - now).whole_seconds().max(0))
}

/// Outcome of asking for the next automatic attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextRetry {
    Scheduled {
        attempt_id: Uuid,
        sequence_number: i32,
        scheduled_at: OffsetDateTime,
    },
    /// Fixed table used up; the caller transitions the case to paused.
    Exhausted,
}

/// Result of an operator-triggered manual retry request.
#[derive(Debug, Clone)]
pub struct ManualRetry {
    pub attempt_id: Uuid,
    pub sequence_number: i32,
    pub scheduled_at: OffsetDateTime,
    /// Whether the request reactivated a paused case.
    pub reactivated: bool,
}

#[derive(Debug, Clone)]
pub struct RetryScheduler {
    pool: PgPool,
}

impl RetryScheduler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lay down attempt #1 for a freshly created case.
    pub async fn schedule_first(&self, case: &FailedPaymentCase) -> RecoveryResult<Option<Uuid>> {
        self.insert_automatic(case, 1).await
    }

    /// Schedule the attempt after `just_failed`, or report exhaustion.
    pub async fn schedule_next(
        &self,
        case: &FailedPaymentCase,
        just_failed: i32,
    ) -> RecoveryResult<NextRetry> {
        let next_sequence = just_failed + 1;
        let Some(offset) = automatic_offset(next_sequence) else {
            tracing::info!(
                case_id = %case.id,
                attempts_used = just_failed,
                "Automatic retry schedule exhausted"
            );
            return Ok(NextRetry::Exhausted);
        };

        let scheduled_at = case.recovery_started_at + offset;
        match self.insert_automatic(case, next_sequence).await? {
            Some(attempt_id) => Ok(NextRetry::Scheduled {
                attempt_id,
                sequence_number: next_sequence,
                scheduled_at,
            }),
            None => {
                // Already scheduled by a concurrent path; report the existing row.
                let existing: (Uuid, OffsetDateTime) = sqlx::query_as(
                    r#"
                    SELECT id, scheduled_at FROM retry_attempts
                    WHERE case_id = $1 AND sequence_number = $2
                    "#,
                )
                .bind(case.id)
                .bind(next_sequence)
                .fetch_one(&self.pool)
                .await?;
                Ok(NextRetry::Scheduled {
                    attempt_id: existing.0,
                    sequence_number: next_sequence,
                    scheduled_at: existing.1,
                })
            }
        }
    }

    /// Insert an immediate operator-triggered attempt, reactivating a paused
    /// case first. Rejects when the trailing-24h manual cap is hit.
    pub async fn schedule_manual(&self, case: &FailedPaymentCase) -> RecoveryResult<ManualRetry> {
        if case.status.is_terminal() {
            return Err(RecoveryError::InvalidCaseStatus {
                case_id: case.id,
                status: case.status.to_string(),
            });
        }

        let recent_manual: (i64, Option<OffsetDateTime>) = sqlx::query_as(
            r#"
            SELECT COUNT(*), MIN(created_at)
            FROM retry_attempts
            WHERE case_id = $1 AND source = 'manual' AND created_at > NOW() - INTERVAL '24 hours'
            "#,
        )
        .bind(case.id)
        .fetch_one(&self.pool)
        .await?;

        if let Some(retry_after_secs) =
            manual_cap_delay(recent_manual.0, recent_manual.1, OffsetDateTime::now_utc())
        {
            tracing::warn!(
                case_id = %case.id,
                recent_manual = recent_manual.0,
                "Manual retry rejected by 24h cap"
            );
            return Err(RecoveryError::ManualRetryLimit { retry_after_secs });
        }

        // Transition table rules out terminal statuses above; a paused case
        // reactivates, an active case stays active.
        let new_status = case.status.apply(CaseEvent::ManualRetryRequested)?;
        let reactivated = case.status == CaseStatus::Paused;
        if reactivated {
            sqlx::query(
                "UPDATE failed_payment_cases SET status = $1, updated_at = NOW() WHERE id = $2",
            )
            .bind(new_status)
            .bind(case.id)
            .execute(&self.pool)
            .await?;
            tracing::info!(case_id = %case.id, "Paused case reactivated by manual retry");
        }

        let row: (Uuid, i32, OffsetDateTime) = sqlx::query_as(
            r#"
            INSERT INTO retry_attempts (case_id, sequence_number, scheduled_at, status, source)
            SELECT $1,
                   COALESCE(MAX(sequence_number), 0) + 1,
                   NOW(),
                   'pending',
                   'manual'
            FROM retry_attempts WHERE case_id = $1
            RETURNING id, sequence_number, scheduled_at
            "#,
        )
        .bind(case.id)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            case_id = %case.id,
            attempt_id = %row.0,
            sequence_number = row.1,
            "Manual retry scheduled"
        );

        Ok(ManualRetry {
            attempt_id: row.0,
            sequence_number: row.1,
            scheduled_at: row.2,
            reactivated,
        })
    }

    /// Due pending attempts on active cases, oldest first. Feeds the retry
    /// scan of the batch loop.
    pub async fn find_due(&self, batch_size: i64) -> RecoveryResult<Vec<(Uuid, Uuid)>> {
        let rows: Vec<(Uuid, Uuid)> = sqlx::query_as(
            r#"
            SELECT c.id, a.id
            FROM retry_attempts a
            JOIN failed_payment_cases c ON c.id = a.case_id
            WHERE a.status = 'pending'
              AND a.scheduled_at <= NOW()
              AND c.status = 'active'
            ORDER BY a.scheduled_at
            LIMIT $1
            "#,
        )
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn insert_automatic(
        &self,
        case: &FailedPaymentCase,
        sequence: i32,
    ) -> RecoveryResult<Option<Uuid>> {
        let offset = automatic_offset(sequence).ok_or_else(|| {
            RecoveryError::Internal(format!("no automatic offset for sequence {sequence}"))
        })?;
        let scheduled_at = case.recovery_started_at + offset;

        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO retry_attempts (case_id, sequence_number, scheduled_at, status, source)
            VALUES ($1, $2, $3, 'pending', $4)
            ON CONFLICT (case_id, sequence_number) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(case.id)
        .bind(sequence)
        .bind(scheduled_at)
        .bind(AttemptSource::Automatic)
        .fetch_optional(&self.pool)
        .await?;

        match &inserted {
            Some((id,)) => tracing::info!(
                case_id = %case.id,
                attempt_id = %id,
                sequence_number = sequence,
                scheduled_at = %scheduled_at,
                "Retry attempt scheduled"
            ),
            None => tracing::debug!(
                case_id = %case.id,
                sequence_number = sequence,
                "Retry attempt already scheduled, skipping duplicate"
            ),
        }

        Ok(inserted.map(|(id,)| id))
    }
}

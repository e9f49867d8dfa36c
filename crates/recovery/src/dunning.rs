//! Dunning scheduling and execution
//!
//! The email sequence is a fixed calendar anchored at case creation: step N
//! is due at `recovery_started_at + delay_days(N)` regardless of when step
//! N-1 actually went out. The scheduler advances one step per case per scan
//! even when several steps are simultaneously overdue, preserving sequence
//! order over burst catch-up after an outage.
//!
//! "Attempted" means a `dunning_email_records` row exists for the
//! (case, template) pair, whatever its status: a failed send is not retried
//! by the scan, it is superseded by the next step at that step's own time.

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::email::{DeliveryEventKind, EmailClient};
use crate::error::{RecoveryError, RecoveryResult};
use crate::model::{CaseStatus, DunningTemplate, EmailStatus, FailedPaymentCase};
use crate::templates::{format_amount, render, TemplateVars};

/// One unit of due dunning work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueDunning {
    pub case_id: Uuid,
    pub template_id: Uuid,
}

/// One unattempted (case, template) pair as loaded from the record store.
#[derive(Debug, Clone, sqlx::FromRow)]
struct StepCandidate {
    case_id: Uuid,
    template_id: Uuid,
    delay_days: i32,
    recovery_started_at: OffsetDateTime,
}

/// One step per case per scan: `candidates` is ordered by
/// (case, sequence order), so the first row seen for a case is its next
/// sequence step. That step is emitted only once its own due time has
/// passed; a later overdue step never jumps ahead of an earlier step that
/// is not yet due.
fn select_due_steps(
    candidates: Vec<StepCandidate>,
    now: OffsetDateTime,
    batch_size: i64,
) -> Vec<DueDunning> {
    let mut due = Vec::new();
    let mut last_case: Option<Uuid> = None;
    for candidate in candidates {
        if due.len() as i64 >= batch_size {
            break;
        }
        if last_case == Some(candidate.case_id) {
            continue;
        }
        last_case = Some(candidate.case_id);

        let due_at = candidate.recovery_started_at + Duration::days(candidate.delay_days as i64);
        if due_at <= now {
            due.push(DueDunning {
                case_id: candidate.case_id,
                template_id: candidate.template_id,
            });
        }
    }
    due
}

#[derive(Debug, Clone)]
pub struct DunningScheduler {
    pool: PgPool,
}

impl DunningScheduler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Cases whose next unattempted template step is due. At most one step
    /// per case, at most `batch_size` cases.
    ///
    /// The query loads every unattempted active template per eligible case;
    /// [`select_due_steps`] then picks the single next step per case and
    /// applies its due time.
    pub async fn find_due(&self, batch_size: i64) -> RecoveryResult<Vec<DueDunning>> {
        let candidates: Vec<StepCandidate> = sqlx::query_as(
            r#"
            SELECT c.id AS case_id,
                   t.id AS template_id,
                   t.delay_days,
                   c.recovery_started_at
            FROM failed_payment_cases c
            JOIN gateway_connections g ON g.id = c.gateway_connection_id
            JOIN dunning_templates t ON t.merchant_id = g.merchant_id AND t.active
            WHERE c.status = 'active'
              AND c.customer_email IS NOT NULL
              AND NOT EXISTS (
                  SELECT 1 FROM dunning_email_records r
                  WHERE r.case_id = c.id AND r.template_id = t.id
              )
            ORDER BY c.recovery_started_at, c.id, t.sequence_order
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(select_due_steps(
            candidates,
            OffsetDateTime::now_utc(),
            batch_size,
        ))
    }

    /// Due time of the step after `just_sent_order`, or `None` when the
    /// sequence ends or the case has left active status. Purely advisory —
    /// dedup is carried by the unique (case, template) email record, so the
    /// scan picking the step up again later is harmless.
    pub async fn schedule_next(
        &self,
        case: &FailedPaymentCase,
        just_sent_order: i32,
    ) -> RecoveryResult<Option<OffsetDateTime>> {
        if case.status != CaseStatus::Active {
            return Ok(None);
        }

        let next: Option<(Uuid, i32, i32)> = sqlx::query_as(
            r#"
            SELECT t.id, t.sequence_order, t.delay_days
            FROM dunning_templates t
            JOIN gateway_connections g ON g.merchant_id = t.merchant_id
            WHERE g.id = $1 AND t.active AND t.sequence_order > $2
            ORDER BY t.sequence_order
            LIMIT 1
            "#,
        )
        .bind(case.gateway_connection_id)
        .bind(just_sent_order)
        .fetch_optional(&self.pool)
        .await?;

        let Some((template_id, sequence_order, delay_days)) = next else {
            tracing::debug!(case_id = %case.id, "Dunning sequence complete");
            return Ok(None);
        };

        let due_at = case.recovery_started_at + Duration::days(delay_days as i64);
        tracing::debug!(
            case_id = %case.id,
            template_id = %template_id,
            sequence_order = sequence_order,
            due_at = %due_at,
            "Next dunning step computed"
        );
        Ok(Some(due_at))
    }
}

/// Outcome of one dunning send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DunningOutcome {
    /// Email handed to the provider; next step due time, if any.
    Sent {
        record_id: Uuid,
        next_step_due: Option<OffsetDateTime>,
    },
    /// Provider rejected the send; recorded, never auto-retried.
    SendFailed { record_id: Uuid },
    /// Case no longer active or step already attempted: correctly stopped.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct DunningExecutor {
    pool: PgPool,
    email: EmailClient,
    scheduler: DunningScheduler,
    update_link_base: String,
}

impl DunningExecutor {
    pub fn new(
        pool: PgPool,
        email: EmailClient,
        scheduler: DunningScheduler,
        update_link_base: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            email,
            scheduler,
            update_link_base: update_link_base.into(),
        }
    }

    pub async fn send(&self, case_id: Uuid, template_id: Uuid) -> RecoveryResult<DunningOutcome> {
        let case: Option<FailedPaymentCase> = sqlx::query_as(
            r#"
            SELECT id, gateway_connection_id, external_invoice_id, external_customer_id,
                   amount_due_cents, currency, failure_code, failure_message,
                   customer_name, customer_email, status, recovery_started_at, recovered_at
            FROM failed_payment_cases WHERE id = $1
            "#,
        )
        .bind(case_id)
        .fetch_optional(&self.pool)
        .await?;
        let case = case.ok_or(RecoveryError::CaseNotFound(case_id))?;

        // A case that recovered (or was paused/canceled) between scan and
        // send is a success-no-op, not a failure.
        if case.status != CaseStatus::Active {
            tracing::info!(
                case_id = %case_id,
                status = %case.status,
                "Dunning send skipped, case no longer active"
            );
            return Ok(DunningOutcome::Skipped);
        }

        let recipient = case
            .customer_email
            .clone()
            .ok_or(RecoveryError::MissingContact(case_id))?;

        let template: Option<DunningTemplate> = sqlx::query_as(
            r#"
            SELECT id, merchant_id, name, subject, body_html, body_text,
                   delay_days, sequence_order, active
            FROM dunning_templates WHERE id = $1
            "#,
        )
        .bind(template_id)
        .fetch_optional(&self.pool)
        .await?;
        let template = template.ok_or(RecoveryError::TemplateNotFound(template_id))?;

        let vars = TemplateVars {
            customer_name: case
                .customer_name
                .clone()
                .unwrap_or_else(|| "there".to_string()),
            amount_due: format_amount(case.amount_due_cents, &case.currency),
            update_link: format!("{}/{}", self.update_link_base, case.id),
        };
        let subject = render(&template.subject, &vars);
        let html = render(&template.body_html, &vars);
        let text = render(&template.body_text, &vars);

        // Create the audit row before the provider call so a crash between
        // send and log still leaves a "we tried" record.
        let record: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO dunning_email_records (case_id, template_id, recipient, rendered_subject, status)
            VALUES ($1, $2, $3, $4, 'pending')
            ON CONFLICT (case_id, template_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(case_id)
        .bind(template_id)
        .bind(&recipient)
        .bind(&subject)
        .fetch_optional(&self.pool)
        .await?;

        let Some((record_id,)) = record else {
            tracing::info!(
                case_id = %case_id,
                template_id = %template_id,
                "Dunning step already attempted, skipping duplicate send"
            );
            return Ok(DunningOutcome::Skipped);
        };

        match self
            .email
            .send(&recipient, &subject, &html, &text, case_id, template_id)
            .await
        {
            Ok(message_id) => {
                sqlx::query(
                    r#"
                    UPDATE dunning_email_records
                    SET status = 'sent', sent_at = NOW(), provider_message_id = $1
                    WHERE id = $2
                    "#,
                )
                .bind(&message_id)
                .bind(record_id)
                .execute(&self.pool)
                .await?;

                let next_step_due = self
                    .scheduler
                    .schedule_next(&case, template.sequence_order)
                    .await?;

                tracing::info!(
                    case_id = %case_id,
                    template_id = %template_id,
                    sequence_order = template.sequence_order,
                    provider_message_id = %message_id,
                    "Dunning email sent"
                );
                Ok(DunningOutcome::Sent {
                    record_id,
                    next_step_due,
                })
            }
            Err(e) => {
                // The record stays as the "attempted" marker; the next
                // sequence step still fires at its own due time.
                sqlx::query("UPDATE dunning_email_records SET status = 'failed' WHERE id = $1")
                    .bind(record_id)
                    .execute(&self.pool)
                    .await?;
                tracing::error!(
                    case_id = %case_id,
                    template_id = %template_id,
                    error = %e,
                    "Dunning email send failed"
                );
                Ok(DunningOutcome::SendFailed { record_id })
            }
        }
    }

    /// Apply an out-of-band delivery event by provider message id.
    ///
    /// Unknown ids are accepted as no-ops. A transition is only applied when
    /// it moves the record to a strictly more terminal status.
    pub async fn apply_delivery_event(
        &self,
        provider_message_id: &str,
        kind: DeliveryEventKind,
    ) -> RecoveryResult<()> {
        let record: Option<(Uuid, EmailStatus)> = sqlx::query_as(
            r#"
            SELECT id, status FROM dunning_email_records WHERE provider_message_id = $1
            "#,
        )
        .bind(provider_message_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((record_id, current)) = record else {
            tracing::debug!(
                provider_message_id = %provider_message_id,
                "Delivery event for untracked message, ignoring"
            );
            return Ok(());
        };

        let new_status = match kind {
            DeliveryEventKind::Opened => EmailStatus::Opened,
            DeliveryEventKind::Clicked => EmailStatus::Clicked,
            DeliveryEventKind::Bounced | DeliveryEventKind::Complained => EmailStatus::Bounced,
        };

        if new_status.rank() <= current.rank() {
            tracing::debug!(
                record_id = %record_id,
                current = ?current,
                event = ?kind,
                "Delivery event does not advance status, ignoring"
            );
            return Ok(());
        }

        let stamp_column = match new_status {
            EmailStatus::Opened => Some("opened_at"),
            EmailStatus::Clicked => Some("clicked_at"),
            _ => None,
        };

        match stamp_column {
            Some("opened_at") => {
                sqlx::query(
                    "UPDATE dunning_email_records SET status = $1, opened_at = NOW() WHERE id = $2",
                )
                .bind(new_status)
                .bind(record_id)
                .execute(&self.pool)
                .await?;
            }
            Some(_) => {
                sqlx::query(
                    "UPDATE dunning_email_records SET status = $1, clicked_at = NOW() WHERE id = $2",
                )
                .bind(new_status)
                .bind(record_id)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("UPDATE dunning_email_records SET status = $1 WHERE id = $2")
                    .bind(new_status)
                    .bind(record_id)
                    .execute(&self.pool)
                    .await?;
            }
        }

        tracing::info!(
            record_id = %record_id,
            new_status = ?new_status,
            "Delivery event applied"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn candidate(
        case_id: Uuid,
        template_id: Uuid,
        delay_days: i32,
        recovery_started_at: OffsetDateTime,
    ) -> StepCandidate {
        StepCandidate {
            case_id,
            template_id,
            delay_days,
            recovery_started_at,
        }
    }

    #[test]
    fn one_step_per_case_even_when_several_overdue() {
        // Scanner was down: day-1 and day-5 steps are both overdue.
        let case_id = Uuid::new_v4();
        let step1 = Uuid::new_v4();
        let step2 = Uuid::new_v4();
        let started = datetime!(2026-01-01 00:00 UTC);
        let now = datetime!(2026-01-10 00:00 UTC);

        let due = select_due_steps(
            vec![
                candidate(case_id, step1, 1, started),
                candidate(case_id, step2, 5, started),
            ],
            now,
            100,
        );
        assert_eq!(
            due,
            vec![DueDunning {
                case_id,
                template_id: step1,
            }]
        );
    }

    #[test]
    fn later_overdue_step_never_jumps_an_earlier_undue_one() {
        // First step not yet due (its template was edited to a later delay);
        // the case sends nothing rather than skipping ahead in the sequence.
        let case_id = Uuid::new_v4();
        let started = datetime!(2026-01-01 00:00 UTC);
        let now = datetime!(2026-01-06 00:00 UTC);

        let due = select_due_steps(
            vec![
                candidate(case_id, Uuid::new_v4(), 10, started),
                candidate(case_id, Uuid::new_v4(), 5, started),
            ],
            now,
            100,
        );
        assert!(due.is_empty());
    }

    #[test]
    fn step_not_emitted_before_its_due_time() {
        let started = datetime!(2026-01-01 00:00 UTC);
        let due = select_due_steps(
            vec![candidate(Uuid::new_v4(), Uuid::new_v4(), 5, started)],
            datetime!(2026-01-05 23:59 UTC),
            100,
        );
        assert!(due.is_empty());
    }

    #[test]
    fn batch_size_bounds_emitted_cases_not_candidates() {
        let started = datetime!(2026-01-01 00:00 UTC);
        let now = datetime!(2026-01-10 00:00 UTC);

        // Three cases, first one not due yet; batch of 2 still yields both
        // due cases.
        let undue_case = Uuid::new_v4();
        let case_a = Uuid::new_v4();
        let case_b = Uuid::new_v4();
        let due = select_due_steps(
            vec![
                candidate(undue_case, Uuid::new_v4(), 30, started),
                candidate(case_a, Uuid::new_v4(), 1, started),
                candidate(case_b, Uuid::new_v4(), 1, started),
            ],
            now,
            2,
        );
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].case_id, case_a);
        assert_eq!(due[1].case_id, case_b);
    }
}

//! Retry execution
//!
//! Runs one due attempt: decrypt the gateway credential, charge the invoice,
//! record the outcome and either hand the case back to the scheduler or
//! terminalize it. Business state only ever changes on a completed provider
//! interaction or a parsed decline — an ambiguous transport failure bubbles
//! out untouched so the job framework can redeliver it.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{RecoveryError, RecoveryResult};
use crate::gateway::{ChargeOutcome, GatewayClient};
use crate::model::{
    AttemptSource, AttemptStatus, CaseEvent, CaseStatus, FailedPaymentCase, GatewayConnection,
    RetryAttempt,
};
use crate::schedule::{NextRetry, RetryScheduler};
use crate::vault::CredentialVault;

/// What one execution resolved to. Surfaced to the batch scan log and to the
/// manual-retry path.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RetryResult {
    pub recovered: bool,
    pub attempt_number: i32,
    /// Next automatic attempt time on failure; `None` when exhausted or recovered.
    pub next_retry_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct RetryExecutor {
    pool: PgPool,
    gateway: GatewayClient,
    vault: CredentialVault,
    scheduler: RetryScheduler,
}

impl RetryExecutor {
    pub fn new(
        pool: PgPool,
        gateway: GatewayClient,
        vault: CredentialVault,
        scheduler: RetryScheduler,
    ) -> Self {
        Self {
            pool,
            gateway,
            vault,
            scheduler,
        }
    }

    pub async fn execute(&self, case_id: Uuid, attempt_id: Uuid) -> RecoveryResult<RetryResult> {
        let case = self.load_case(case_id).await?;

        // Preconditions: violations are data/programming errors, fatal for
        // this invocation, never job-retried.
        if case.status != CaseStatus::Active {
            return Err(RecoveryError::InvalidCaseStatus {
                case_id,
                status: case.status.to_string(),
            });
        }
        let invoice_id = case
            .external_invoice_id
            .clone()
            .ok_or(RecoveryError::MissingInvoiceId(case_id))?;

        let connection: Option<GatewayConnection> = sqlx::query_as(
            r#"
            SELECT id, merchant_id, provider_account_id, access_credential_enc, active
            FROM gateway_connections WHERE id = $1 AND active
            "#,
        )
        .bind(case.gateway_connection_id)
        .fetch_optional(&self.pool)
        .await?;
        let connection = connection.ok_or(RecoveryError::ConnectionNotFound(case_id))?;

        let attempt = self.load_attempt(attempt_id).await?;
        if attempt.case_id != case_id {
            return Err(RecoveryError::Internal(format!(
                "attempt {attempt_id} does not belong to case {case_id}"
            )));
        }
        if attempt.status != AttemptStatus::Pending {
            // Redelivered job for an already-resolved attempt.
            tracing::info!(
                case_id = %case_id,
                attempt_id = %attempt_id,
                status = ?attempt.status,
                "Attempt already resolved, skipping execution"
            );
            return Ok(RetryResult {
                recovered: attempt.status == AttemptStatus::Success,
                attempt_number: attempt.sequence_number,
                next_retry_at: None,
            });
        }

        // Mark in-flight before the network call so a crash mid-charge still
        // shows an attempted timestamp.
        sqlx::query("UPDATE retry_attempts SET attempted_at = NOW() WHERE id = $1")
            .bind(attempt_id)
            .execute(&self.pool)
            .await?;

        let credential = self.vault.decrypt(&connection.access_credential_enc)?;

        match self.gateway.pay_invoice(&credential, &invoice_id).await? {
            ChargeOutcome::Paid => {
                self.resolve_success(&case, &attempt).await?;
                Ok(RetryResult {
                    recovered: true,
                    attempt_number: attempt.sequence_number,
                    next_retry_at: None,
                })
            }
            ChargeOutcome::Declined { code, message } => {
                let next_retry_at = self.resolve_decline(&case, &attempt, &code, message).await?;
                Ok(RetryResult {
                    recovered: false,
                    attempt_number: attempt.sequence_number,
                    next_retry_at,
                })
            }
        }
    }

    async fn resolve_success(
        &self,
        case: &FailedPaymentCase,
        attempt: &RetryAttempt,
    ) -> RecoveryResult<()> {
        sqlx::query("UPDATE retry_attempts SET status = 'success' WHERE id = $1")
            .bind(attempt.id)
            .execute(&self.pool)
            .await?;

        let new_status = case.status.apply(CaseEvent::PaymentRecovered)?;
        sqlx::query(
            r#"
            UPDATE failed_payment_cases
            SET status = $1, recovered_at = NOW(), updated_at = NOW()
            WHERE id = $2 AND status = 'active'
            "#,
        )
        .bind(new_status)
        .bind(case.id)
        .execute(&self.pool)
        .await?;

        // Close the in-flight race: a second concurrently-scheduled attempt
        // must never charge a customer who already paid.
        let skipped = sqlx::query(
            r#"
            UPDATE retry_attempts SET status = 'skipped'
            WHERE case_id = $1 AND status = 'pending' AND id != $2
            "#,
        )
        .bind(case.id)
        .bind(attempt.id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            case_id = %case.id,
            attempt_number = attempt.sequence_number,
            skipped_attempts = skipped.rows_affected(),
            "Case recovered by retry attempt"
        );
        Ok(())
    }

    async fn resolve_decline(
        &self,
        case: &FailedPaymentCase,
        attempt: &RetryAttempt,
        code: &str,
        message: Option<String>,
    ) -> RecoveryResult<Option<OffsetDateTime>> {
        sqlx::query(
            r#"
            UPDATE retry_attempts
            SET status = 'failed', decline_code = $1, decline_message = $2
            WHERE id = $3
            "#,
        )
        .bind(code)
        .bind(message.as_deref())
        .bind(attempt.id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            case_id = %case.id,
            attempt_number = attempt.sequence_number,
            decline_code = %code,
            "Retry attempt declined"
        );

        match attempt.source {
            AttemptSource::Automatic => {
                match self.scheduler.schedule_next(case, attempt.sequence_number).await? {
                    NextRetry::Scheduled { scheduled_at, .. } => Ok(Some(scheduled_at)),
                    NextRetry::Exhausted => {
                        self.pause_case(case).await?;
                        Ok(None)
                    }
                }
            }
            AttemptSource::Manual => {
                // Manual attempts never re-enter the automatic schedule. If
                // nothing else is pending for the case it goes back to paused.
                let pending: (i64,) = sqlx::query_as(
                    "SELECT COUNT(*) FROM retry_attempts WHERE case_id = $1 AND status = 'pending'",
                )
                .bind(case.id)
                .fetch_one(&self.pool)
                .await?;
                if pending.0 == 0 {
                    self.pause_case(case).await?;
                }
                Ok(None)
            }
        }
    }

    async fn pause_case(&self, case: &FailedPaymentCase) -> RecoveryResult<()> {
        let new_status = case.status.apply(CaseEvent::RetriesExhausted)?;
        sqlx::query(
            r#"
            UPDATE failed_payment_cases
            SET status = $1, updated_at = NOW()
            WHERE id = $2 AND status = 'active'
            "#,
        )
        .bind(new_status)
        .bind(case.id)
        .execute(&self.pool)
        .await?;
        tracing::info!(case_id = %case.id, "Case paused after retry exhaustion");
        Ok(())
    }

    async fn load_case(&self, case_id: Uuid) -> RecoveryResult<FailedPaymentCase> {
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
        case.ok_or(RecoveryError::CaseNotFound(case_id))
    }

    async fn load_attempt(&self, attempt_id: Uuid) -> RecoveryResult<RetryAttempt> {
        let attempt: Option<RetryAttempt> = sqlx::query_as(
            r#"
            SELECT id, case_id, sequence_number, scheduled_at, attempted_at,
                   status, source, decline_code, decline_message
            FROM retry_attempts WHERE id = $1
            "#,
        )
        .bind(attempt_id)
        .fetch_optional(&self.pool)
        .await?;
        attempt.ok_or(RecoveryError::AttemptNotFound(attempt_id))
    }
}

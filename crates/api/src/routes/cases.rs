//! Operator case routes

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use recoup_recovery::{FailedPaymentCase, InvariantCheckSummary, RecoveryError};

use crate::auth::API_KEY_HEADER;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ManualRetryResponse {
    pub attempt_id: Uuid,
    pub attempt_number: i32,
    /// When the attempt is expected to have run; immediate for manual
    /// retries, so this is effectively "poll the case after this time".
    pub next_check_hint: OffsetDateTime,
}

/// `POST /cases/{id}/retry`
///
/// Schedules an immediate manual attempt and executes it in the background.
/// The response reports the scheduled attempt, not its outcome; callers poll
/// the case for the result.
pub async fn manual_retry(
    State(state): State<AppState>,
    Path(case_id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Json<ManualRetryResponse>> {
    let api_key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;
    let merchant_id = state.api_keys.merchant_for_key(&state.pool, api_key).await?;

    let case: Option<FailedPaymentCase> = sqlx::query_as(
        r#"
        SELECT id, gateway_connection_id, external_invoice_id, external_customer_id,
               amount_due_cents, currency, failure_code, failure_message,
               customer_name, customer_email, status, recovery_started_at, recovered_at
        FROM failed_payment_cases WHERE id = $1
        "#,
    )
    .bind(case_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(RecoveryError::from)?;
    let case = case.ok_or(RecoveryError::CaseNotFound(case_id))?;

    let owner: (Uuid,) = sqlx::query_as("SELECT merchant_id FROM gateway_connections WHERE id = $1")
        .bind(case.gateway_connection_id)
        .fetch_one(&state.pool)
        .await
        .map_err(RecoveryError::from)?;
    if owner.0 != merchant_id {
        tracing::warn!(
            case_id = %case_id,
            merchant_id = %merchant_id,
            "Manual retry rejected, case belongs to another merchant"
        );
        return Err(ApiError::Forbidden);
    }

    let scheduled = state.recovery.retry_scheduler.schedule_manual(&case).await?;

    // Fire the attempt without holding the request open. Failures land in
    // the attempt row and the log, never in this response.
    let executor = state.recovery.retry_executor.clone();
    let attempt_id = scheduled.attempt_id;
    tokio::spawn(async move {
        match executor.execute(case_id, attempt_id).await {
            Ok(result) => tracing::info!(
                case_id = %case_id,
                attempt_id = %attempt_id,
                recovered = result.recovered,
                "Manual retry attempt executed"
            ),
            Err(e) => tracing::error!(
                case_id = %case_id,
                attempt_id = %attempt_id,
                error = %e,
                "Manual retry attempt failed to execute"
            ),
        }
    });

    tracing::info!(
        case_id = %case_id,
        merchant_id = %merchant_id,
        attempt_id = %scheduled.attempt_id,
        sequence_number = scheduled.sequence_number,
        reactivated = scheduled.reactivated,
        "Manual retry accepted"
    );

    Ok(Json(ManualRetryResponse {
        attempt_id: scheduled.attempt_id,
        attempt_number: scheduled.sequence_number,
        next_check_hint: scheduled.scheduled_at + time::Duration::seconds(30),
    }))
}

/// `GET /internal/invariants`
///
/// Read-only consistency report over the record store. Deployments keep this
/// off the public listener.
pub async fn run_invariants(
    State(state): State<AppState>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let summary = state.recovery.invariants.run_all_checks().await?;
    if !summary.healthy {
        tracing::warn!(
            checks_failed = summary.checks_failed,
            violations = summary.violations.len(),
            "Invariant check found violations"
        );
    }
    Ok(Json(summary))
}

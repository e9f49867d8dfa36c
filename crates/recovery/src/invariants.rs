//! Recovery invariants
//!
//! Runnable consistency checks over the Recovery Record Store. Each check is
//! a real SQL query, read-only, and returns enough context to debug a
//! violation. Intended to run after webhook replays or schema migrations and
//! from operator tooling.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::RecoveryResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Case(s) affected
    pub case_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// System may double-charge or stall recovery
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Should investigate
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct SequenceGapRow {
    case_id: Uuid,
    attempt_count: i64,
    max_sequence: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct MultiPendingRow {
    case_id: Uuid,
    pending_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct CaseIdRow {
    case_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct PausedShortRow {
    case_id: Uuid,
    resolved_automatic: i64,
}

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> RecoveryResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_contiguous_sequences().await?);
        violations.extend(self.check_single_pending_attempt().await?);
        violations.extend(self.check_recovered_has_timestamp().await?);
        violations.extend(self.check_recovered_no_pending().await?);
        violations.extend(self.check_paused_exhausted().await?);

        let checks_run = 5;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: attempt sequence numbers per case form a contiguous run
    /// 1..k with no gaps or duplicates.
    async fn check_contiguous_sequences(&self) -> RecoveryResult<Vec<InvariantViolation>> {
        let rows: Vec<SequenceGapRow> = sqlx::query_as(
            r#"
            SELECT case_id,
                   COUNT(*) AS attempt_count,
                   MAX(sequence_number) AS max_sequence
            FROM retry_attempts
            GROUP BY case_id
            HAVING MAX(sequence_number) != COUNT(*) OR MIN(sequence_number) != 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "contiguous_attempt_sequences".to_string(),
                case_ids: vec![row.case_id],
                description: format!(
                    "Case has {} attempts but max sequence {}",
                    row.attempt_count, row.max_sequence
                ),
                context: serde_json::json!({
                    "attempt_count": row.attempt_count,
                    "max_sequence": row.max_sequence,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 2: at most one pending attempt per case.
    async fn check_single_pending_attempt(&self) -> RecoveryResult<Vec<InvariantViolation>> {
        let rows: Vec<MultiPendingRow> = sqlx::query_as(
            r#"
            SELECT case_id, COUNT(*) AS pending_count
            FROM retry_attempts
            WHERE status = 'pending'
            GROUP BY case_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_pending_attempt".to_string(),
                case_ids: vec![row.case_id],
                description: format!(
                    "Case has {} pending attempts (expected at most 1), two could fire concurrently",
                    row.pending_count
                ),
                context: serde_json::json!({ "pending_count": row.pending_count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: recovered cases carry a recovered_at timestamp.
    async fn check_recovered_has_timestamp(&self) -> RecoveryResult<Vec<InvariantViolation>> {
        let rows: Vec<CaseIdRow> = sqlx::query_as(
            r#"
            SELECT id AS case_id FROM failed_payment_cases
            WHERE status = 'recovered' AND recovered_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "recovered_has_timestamp".to_string(),
                case_ids: vec![row.case_id],
                description: "Recovered case has no recovered_at timestamp".to_string(),
                context: serde_json::json!({}),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 4: a recovered or canceled case has no pending attempts.
    /// A leftover pending attempt on a terminal case could double-charge.
    async fn check_recovered_no_pending(&self) -> RecoveryResult<Vec<InvariantViolation>> {
        let rows: Vec<CaseIdRow> = sqlx::query_as(
            r#"
            SELECT DISTINCT c.id AS case_id
            FROM failed_payment_cases c
            JOIN retry_attempts a ON a.case_id = c.id
            WHERE c.status IN ('recovered', 'canceled') AND a.status = 'pending'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "terminal_case_no_pending".to_string(),
                case_ids: vec![row.case_id],
                description: "Terminal case still has a pending retry attempt".to_string(),
                context: serde_json::json!({}),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 5: paused cases have a fully resolved automatic schedule.
    async fn check_paused_exhausted(&self) -> RecoveryResult<Vec<InvariantViolation>> {
        let rows: Vec<PausedShortRow> = sqlx::query_as(
            r#"
            SELECT c.id AS case_id,
                   COUNT(a.id) FILTER (
                       WHERE a.source = 'automatic' AND a.status IN ('failed', 'skipped', 'success')
                   ) AS resolved_automatic
            FROM failed_payment_cases c
            LEFT JOIN retry_attempts a ON a.case_id = c.id
            WHERE c.status = 'paused'
            GROUP BY c.id
            HAVING COUNT(a.id) FILTER (WHERE a.status = 'pending') > 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paused_case_exhausted".to_string(),
                case_ids: vec![row.case_id],
                description: "Paused case still has an unresolved attempt".to_string(),
                context: serde_json::json!({
                    "resolved_automatic": row.resolved_automatic,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    pub async fn run_check(&self, name: &str) -> RecoveryResult<Vec<InvariantViolation>> {
        match name {
            "contiguous_attempt_sequences" => self.check_contiguous_sequences().await,
            "single_pending_attempt" => self.check_single_pending_attempt().await,
            "recovered_has_timestamp" => self.check_recovered_has_timestamp().await,
            "terminal_case_no_pending" => self.check_recovered_no_pending().await,
            "paused_case_exhausted" => self.check_paused_exhausted().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "contiguous_attempt_sequences",
            "single_pending_attempt",
            "recovered_has_timestamp",
            "terminal_case_no_pending",
            "paused_case_exhausted",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
    }

    #[test]
    fn available_checks_listed() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"single_pending_attempt"));
        assert!(checks.contains(&"contiguous_attempt_sequences"));
    }
}

//! Recovery Record Store row types and status machines
//!
//! Statuses are closed enums backed by Postgres enum types. Case status
//! changes go through a single transition table ([`CaseStatus::apply`]) so an
//! illegal transition is an error at the point of construction, not a
//! scattered branch check.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{RecoveryError, RecoveryResult};

/// Lifecycle status of a failed-payment case.
///
/// `Recovered` and `Canceled` are terminal. `Paused` is soft-terminal: it is
/// reached only by retry exhaustion and can be reactivated by a manual retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "case_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    Active,
    Recovered,
    Canceled,
    Paused,
}

/// Events that can move a case between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseEvent {
    /// Payment confirmed, either by a retry attempt or an out-of-band
    /// `payment_succeeded` webhook.
    PaymentRecovered,
    /// Automatic retry schedule used up without success.
    RetriesExhausted,
    /// Operator requested a manual retry on a paused case.
    ManualRetryRequested,
    /// Operator or upstream cancellation.
    Canceled,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Active => "active",
            CaseStatus::Recovered => "recovered",
            CaseStatus::Canceled => "canceled",
            CaseStatus::Paused => "paused",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CaseStatus::Recovered | CaseStatus::Canceled)
    }

    /// The authoritative transition table.
    pub fn apply(self, event: CaseEvent) -> RecoveryResult<CaseStatus> {
        use CaseEvent::*;
        use CaseStatus::*;

        let next = match (self, event) {
            (Active, PaymentRecovered) => Recovered,
            (Active, RetriesExhausted) => Paused,
            (Active, CaseEvent::Canceled) => CaseStatus::Canceled,
            // A manual retry on an already-active case changes nothing.
            (Active, ManualRetryRequested) => Active,
            (Paused, ManualRetryRequested) => Active,
            (Paused, PaymentRecovered) => Recovered,
            (Paused, CaseEvent::Canceled) => CaseStatus::Canceled,
            (Paused, RetriesExhausted) => Paused,
            (from, event) => {
                return Err(RecoveryError::IllegalTransition {
                    from: from.as_str().to_string(),
                    event: format!("{event:?}"),
                })
            }
        };
        Ok(next)
    }
}

impl std::fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "attempt_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Pending,
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "attempt_source", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AttemptSource {
    Automatic,
    Manual,
}

/// Delivery status of one dunning email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "email_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EmailStatus {
    Pending,
    Sent,
    Failed,
    Bounced,
    Opened,
    Clicked,
}

impl EmailStatus {
    /// Terminality ranking used when applying out-of-band delivery events.
    /// A delivery event only ever moves a record to a strictly higher rank,
    /// so `opened` never reverts `clicked` and nothing reverts `bounced`.
    pub fn rank(&self) -> u8 {
        match self {
            EmailStatus::Pending => 0,
            EmailStatus::Sent => 1,
            EmailStatus::Opened => 2,
            EmailStatus::Clicked => 3,
            EmailStatus::Failed => 4,
            EmailStatus::Bounced => 4,
        }
    }
}

/// One provider invoice under recovery tracking.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FailedPaymentCase {
    pub id: Uuid,
    pub gateway_connection_id: Uuid,
    pub external_invoice_id: Option<String>,
    pub external_customer_id: Option<String>,
    pub amount_due_cents: i64,
    pub currency: String,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub status: CaseStatus,
    pub recovery_started_at: OffsetDateTime,
    pub recovered_at: Option<OffsetDateTime>,
}

/// One scheduled or executed payment retry.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RetryAttempt {
    pub id: Uuid,
    pub case_id: Uuid,
    pub sequence_number: i32,
    pub scheduled_at: OffsetDateTime,
    pub attempted_at: Option<OffsetDateTime>,
    pub status: AttemptStatus,
    pub source: AttemptSource,
    pub decline_code: Option<String>,
    pub decline_message: Option<String>,
}

/// One step of a merchant's dunning email sequence.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DunningTemplate {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub name: String,
    pub subject: String,
    pub body_html: String,
    pub body_text: String,
    pub delay_days: i32,
    pub sequence_order: i32,
    pub active: bool,
}

/// Audit row for one dunning email send.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DunningEmailRecord {
    pub id: Uuid,
    pub case_id: Uuid,
    pub template_id: Option<Uuid>,
    pub recipient: String,
    pub rendered_subject: String,
    pub status: EmailStatus,
    pub provider_message_id: Option<String>,
    pub sent_at: Option<OffsetDateTime>,
    pub opened_at: Option<OffsetDateTime>,
    pub clicked_at: Option<OffsetDateTime>,
}

/// Per-merchant gateway account with the encrypted access credential.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GatewayConnection {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub provider_account_id: String,
    pub access_credential_enc: String,
    pub active: bool,
}

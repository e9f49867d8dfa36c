//! Error taxonomy for the recovery engine
//!
//! Four families, handled differently (see the executor and the worker):
//! verification errors reject at the boundary, domain-precondition errors are
//! fatal for the invocation, provider declines are typed results (not errors),
//! and transport errors bubble so the job framework can retry them.

use uuid::Uuid;

use crate::verify::VerificationError;

pub type RecoveryResult<T> = Result<T, RecoveryError>;

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("webhook verification failed: {0}")]
    Verification(#[from] VerificationError),

    #[error("malformed provider event: {0}")]
    MalformedEvent(String),

    #[error("case not found: {0}")]
    CaseNotFound(Uuid),

    #[error("retry attempt not found: {0}")]
    AttemptNotFound(Uuid),

    #[error("gateway connection not found for case {0}")]
    ConnectionNotFound(Uuid),

    #[error("dunning template not found: {0}")]
    TemplateNotFound(Uuid),

    #[error("case {case_id} is {status}, operation requires an active case")]
    InvalidCaseStatus { case_id: Uuid, status: String },

    #[error("case {0} has no external invoice id")]
    MissingInvoiceId(Uuid),

    #[error("case {0} has no customer contact email")]
    MissingContact(Uuid),

    #[error("illegal status transition: {from} on {event}")]
    IllegalTransition { from: String, event: String },

    #[error("manual retry limit reached, retry after {retry_after_secs}s")]
    ManualRetryLimit { retry_after_secs: i64 },

    #[error("credential vault error: {0}")]
    Vault(String),

    #[error("payment gateway transport error: {0}")]
    GatewayTransport(String),

    #[error("email provider transport error: {0}")]
    EmailTransport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RecoveryError {
    /// Whether the job framework should redeliver the job that hit this error.
    ///
    /// Only ambiguous transport-level failures qualify. Domain-precondition
    /// errors and declines must never be retried at the job level, and must
    /// never advance the business retry schedule either.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RecoveryError::Database(_)
                | RecoveryError::GatewayTransport(_)
                | RecoveryError::EmailTransport(_)
        )
    }
}

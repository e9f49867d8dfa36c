// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Recoup recovery engine
//!
//! Recovers failed recurring-billing charges for SaaS merchants: a verified
//! `payment_failed` webhook opens a case, a fixed 3/7/14-day retry schedule
//! re-attempts the charge, and a template-driven dunning email sequence nudges
//! the customer in parallel, until the invoice is paid, exhausted or canceled.
//!
//! ## Components
//!
//! - **Webhook ingestion**: verified provider events create and recover cases
//! - **Retry scheduling/execution**: the bounded automatic schedule plus
//!   operator-triggered manual retries
//! - **Dunning scheduling/execution**: the per-merchant email sequence
//! - **Credential vault**: gateway credentials encrypted at rest
//! - **Invariants**: runnable consistency checks over the record store

pub mod dunning;
pub mod email;
pub mod error;
pub mod events;
pub mod executor;
pub mod gateway;
pub mod invariants;
pub mod model;
pub mod schedule;
pub mod templates;
pub mod vault;
pub mod verify;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

pub use dunning::{DueDunning, DunningExecutor, DunningOutcome, DunningScheduler};
pub use email::{DeliveryEventKind, EmailClient};
pub use error::{RecoveryError, RecoveryResult};
pub use events::{EventInvoice, EventSubscription, GatewayEvent, SubscriptionAction, WireEvent};
pub use executor::{RetryExecutor, RetryResult};
pub use gateway::{ChargeOutcome, GatewayClient};
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};
pub use model::{
    AttemptSource, AttemptStatus, CaseEvent, CaseStatus, DunningEmailRecord, DunningTemplate,
    EmailStatus, FailedPaymentCase, GatewayConnection, RetryAttempt,
};
pub use schedule::{
    automatic_offset, manual_cap_delay, ManualRetry, NextRetry, RetryScheduler,
    MANUAL_RETRY_LIMIT, RETRY_OFFSET_DAYS,
};
pub use templates::{format_amount, render, seed_defaults, TemplateVars};
pub use vault::CredentialVault;
pub use verify::{sign, verify_signature, VerificationError, TIMESTAMP_TOLERANCE_SECS};
pub use webhooks::WebhookIngestor;

use sqlx::PgPool;

/// Engine configuration, read from the environment at process start.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub webhook_secret: String,
    pub vault_key_hex: String,
    pub gateway_api_url: String,
    pub email_api_url: String,
    pub email_api_key: String,
    pub dunning_from: String,
    pub payment_update_url: String,
}

impl RecoveryConfig {
    pub fn from_env() -> RecoveryResult<Self> {
        fn required(name: &str) -> RecoveryResult<String> {
            std::env::var(name).map_err(|_| RecoveryError::Config(format!("{name} must be set")))
        }

        Ok(Self {
            webhook_secret: required("GATEWAY_WEBHOOK_SECRET")?,
            vault_key_hex: required("VAULT_KEY")?,
            gateway_api_url: std::env::var("GATEWAY_API_URL")
                .unwrap_or_else(|_| "https://api.gateway.example.com/v1".to_string()),
            email_api_url: std::env::var("EMAIL_API_URL")
                .unwrap_or_else(|_| "https://api.resend.com".to_string()),
            email_api_key: required("RESEND_API_KEY")?,
            dunning_from: std::env::var("DUNNING_FROM_EMAIL")
                .unwrap_or_else(|_| "billing@recoup.example.com".to_string()),
            payment_update_url: std::env::var("PAYMENT_UPDATE_URL")
                .unwrap_or_else(|_| "https://pay.recoup.example.com/update".to_string()),
        })
    }
}

/// Main recovery service combining every sub-service.
///
/// Constructed once at process start and injected wherever needed; both the
/// HTTP-triggered manual path and the recurring batch path go through the
/// same schedulers and executors, so the two cannot drift.
#[derive(Clone)]
pub struct RecoveryService {
    pub webhooks: WebhookIngestor,
    pub retry_scheduler: RetryScheduler,
    pub retry_executor: RetryExecutor,
    pub dunning_scheduler: DunningScheduler,
    pub dunning_executor: DunningExecutor,
    pub invariants: std::sync::Arc<InvariantChecker>,
    pub pool: PgPool,
}

impl RecoveryService {
    pub fn new(config: RecoveryConfig, pool: PgPool) -> RecoveryResult<Self> {
        let http = reqwest::Client::new();
        let vault = CredentialVault::from_hex_key(&config.vault_key_hex)?;
        let gateway = GatewayClient::new(http.clone(), config.gateway_api_url);
        let email = EmailClient::new(
            http,
            config.email_api_url,
            config.email_api_key,
            config.dunning_from,
        );

        let retry_scheduler = RetryScheduler::new(pool.clone());
        let dunning_scheduler = DunningScheduler::new(pool.clone());

        Ok(Self {
            webhooks: WebhookIngestor::new(
                pool.clone(),
                retry_scheduler.clone(),
                config.webhook_secret,
            ),
            retry_executor: RetryExecutor::new(
                pool.clone(),
                gateway,
                vault,
                retry_scheduler.clone(),
            ),
            dunning_executor: DunningExecutor::new(
                pool.clone(),
                email,
                dunning_scheduler.clone(),
                config.payment_update_url,
            ),
            retry_scheduler,
            dunning_scheduler,
            invariants: std::sync::Arc::new(InvariantChecker::new(pool.clone())),
            pool,
        })
    }

    pub fn from_env(pool: PgPool) -> RecoveryResult<Self> {
        Self::new(RecoveryConfig::from_env()?, pool)
    }
}

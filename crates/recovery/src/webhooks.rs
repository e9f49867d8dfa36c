//! Webhook ingestion
//!
//! Turns verified provider events into Recovery Record Store mutations. Case
//! creation is deduplicated on (connection, external invoice id), so a
//! redelivered `payment_failed` event is a no-op. Processing is replay-safe:
//! each provider event id is atomically claimed in `gateway_webhook_events`
//! before any handler runs, and a stuck `processing` claim can be re-taken
//! after a timeout.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{RecoveryError, RecoveryResult};
use crate::events::{EventInvoice, EventSubscription, GatewayEvent, SubscriptionAction, WireEvent};
use crate::model::{CaseEvent, CaseStatus};
use crate::schedule::RetryScheduler;
use crate::verify::verify_signature;

const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

#[derive(Debug, Clone)]
pub struct WebhookIngestor {
    pool: PgPool,
    scheduler: RetryScheduler,
    webhook_secret: String,
}

impl WebhookIngestor {
    pub fn new(pool: PgPool, scheduler: RetryScheduler, webhook_secret: impl Into<String>) -> Self {
        Self {
            pool,
            scheduler,
            webhook_secret: webhook_secret.into(),
        }
    }

    /// Verify the signature header and decode the wire envelope. Nothing in
    /// the body may be trusted before this succeeds.
    pub fn verify_event(&self, payload: &str, signature_header: &str) -> RecoveryResult<WireEvent> {
        verify_signature(
            payload,
            signature_header,
            &self.webhook_secret,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;

        let wire: WireEvent = serde_json::from_str(payload)
            .map_err(|e| RecoveryError::MalformedEvent(format!("unparseable envelope: {e}")))?;
        Ok(wire)
    }

    /// Process a verified event exactly once per provider event id.
    pub async fn handle_event(&self, wire: WireEvent) -> RecoveryResult<()> {
        let event_timestamp = OffsetDateTime::from_unix_timestamp(wire.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        // Atomic claim: only one concurrent delivery gets a row back. A claim
        // stuck in 'processing' past the timeout can be re-taken.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO gateway_webhook_events
                (provider_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (provider_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW()
            WHERE gateway_webhook_events.processing_result = 'processing'
              AND gateway_webhook_events.processing_started_at < NOW() - make_interval(mins => $4)
            RETURNING id
            "#,
        )
        .bind(&wire.id)
        .bind(&wire.event_type)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_none() {
            tracing::info!(
                event_id = %wire.id,
                event_type = %wire.event_type,
                "Duplicate webhook event, already claimed"
            );
            return Ok(());
        }

        let result = self.process_event(&wire).await;

        let (processing_result, error_message) = match &result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };
        if let Err(e) = sqlx::query(
            r#"
            UPDATE gateway_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE provider_event_id = $3
            "#,
        )
        .bind(processing_result)
        .bind(&error_message)
        .bind(&wire.id)
        .execute(&self.pool)
        .await
        {
            tracing::error!(
                event_id = %wire.id,
                error = %e,
                "Failed to update webhook audit record"
            );
        }

        result
    }

    async fn process_event(&self, wire: &WireEvent) -> RecoveryResult<()> {
        match GatewayEvent::from_wire(wire)? {
            GatewayEvent::InvoicePaymentFailed { account, invoice } => {
                self.handle_payment_failed(&account, &invoice).await
            }
            GatewayEvent::InvoicePaid { account, invoice } => {
                self.handle_payment_succeeded(&account, &invoice).await
            }
            GatewayEvent::PlatformSubscription {
                action,
                subscription,
            } => self.handle_platform_subscription(action, &subscription).await,
            GatewayEvent::PlatformInvoice {
                event_type,
                invoice,
            } => self.handle_platform_invoice(&event_type, &invoice).await,
            GatewayEvent::Unhandled { event_type } => {
                tracing::info!(
                    event_type = %event_type,
                    "Received unhandled event type, no handler configured"
                );
                Ok(())
            }
        }
    }

    /// Create a recovery case for a failed connected-account invoice and lay
    /// down attempt #1.
    async fn handle_payment_failed(
        &self,
        account: &str,
        invoice: &EventInvoice,
    ) -> RecoveryResult<()> {
        let connection: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM gateway_connections WHERE provider_account_id = $1 AND active",
        )
        .bind(account)
        .fetch_optional(&self.pool)
        .await?;
        let Some((connection_id,)) = connection else {
            tracing::warn!(
                account = %account,
                invoice_id = %invoice.id,
                "payment_failed for unknown gateway account, ignoring"
            );
            return Ok(());
        };

        let created: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO failed_payment_cases
                (gateway_connection_id, external_invoice_id, external_customer_id,
                 amount_due_cents, currency, failure_code, failure_message,
                 customer_name, customer_email, status, recovery_started_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'active', NOW())
            ON CONFLICT (gateway_connection_id, external_invoice_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(connection_id)
        .bind(&invoice.id)
        .bind(invoice.customer.as_deref())
        .bind(invoice.amount_due)
        .bind(invoice.currency.to_ascii_lowercase())
        .bind(invoice.failure_code.as_deref())
        .bind(invoice.failure_message.as_deref())
        .bind(invoice.customer_name.as_deref())
        .bind(invoice.customer_email.as_deref())
        .fetch_optional(&self.pool)
        .await?;

        let Some((case_id,)) = created else {
            tracing::info!(
                account = %account,
                invoice_id = %invoice.id,
                "Case already exists for failed invoice, ignoring redelivery"
            );
            return Ok(());
        };

        let case = sqlx::query_as(
            r#"
            SELECT id, gateway_connection_id, external_invoice_id, external_customer_id,
                   amount_due_cents, currency, failure_code, failure_message,
                   customer_name, customer_email, status, recovery_started_at, recovered_at
            FROM failed_payment_cases WHERE id = $1
            "#,
        )
        .bind(case_id)
        .fetch_one(&self.pool)
        .await?;
        self.scheduler.schedule_first(&case).await?;

        tracing::info!(
            case_id = %case_id,
            invoice_id = %invoice.id,
            amount_due_cents = invoice.amount_due,
            "Recovery case created from payment_failed event"
        );
        Ok(())
    }

    /// Recovery detection: the customer paid out-of-band. Terminalize the
    /// case and skip every still-pending attempt so no stale retry can
    /// double-charge.
    async fn handle_payment_succeeded(
        &self,
        account: &str,
        invoice: &EventInvoice,
    ) -> RecoveryResult<()> {
        let case: Option<(Uuid, CaseStatus)> = sqlx::query_as(
            r#"
            SELECT c.id, c.status
            FROM failed_payment_cases c
            JOIN gateway_connections g ON g.id = c.gateway_connection_id
            WHERE g.provider_account_id = $1 AND c.external_invoice_id = $2
            "#,
        )
        .bind(account)
        .bind(&invoice.id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((case_id, status)) = case else {
            // Paid invoice we never tracked; normal for healthy customers.
            return Ok(());
        };

        if status.is_terminal() {
            tracing::info!(
                case_id = %case_id,
                status = %status,
                "payment_succeeded for already-terminal case, ignoring"
            );
            return Ok(());
        }

        let new_status = status.apply(CaseEvent::PaymentRecovered)?;
        sqlx::query(
            r#"
            UPDATE failed_payment_cases
            SET status = $1, recovered_at = NOW(), updated_at = NOW()
            WHERE id = $2 AND status = $3
            "#,
        )
        .bind(new_status)
        .bind(case_id)
        .bind(status)
        .execute(&self.pool)
        .await?;

        let skipped = sqlx::query(
            "UPDATE retry_attempts SET status = 'skipped' WHERE case_id = $1 AND status = 'pending'",
        )
        .bind(case_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            case_id = %case_id,
            invoice_id = %invoice.id,
            skipped_attempts = skipped.rows_affected(),
            "Case recovered via payment_succeeded event"
        );
        Ok(())
    }

    /// Platform namespace: the platform's own invoice outcomes move the
    /// merchant's plan status, nothing else.
    async fn handle_platform_invoice(
        &self,
        event_type: &str,
        invoice: &EventInvoice,
    ) -> RecoveryResult<()> {
        let Some(customer) = invoice.customer.as_deref() else {
            tracing::warn!(
                event_type = %event_type,
                invoice_id = %invoice.id,
                "Platform invoice event with no customer, ignoring"
            );
            return Ok(());
        };

        let plan_status = if event_type == "invoice.payment_failed" {
            "past_due"
        } else {
            "active"
        };

        let updated = sqlx::query(
            r#"
            UPDATE merchants SET plan_status = $1, updated_at = NOW()
            WHERE provider_customer_id = $2
            "#,
        )
        .bind(plan_status)
        .bind(customer)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            customer = %customer,
            event_type = %event_type,
            plan_status = %plan_status,
            updated = updated.rows_affected(),
            "Merchant plan status projected from platform invoice event"
        );
        Ok(())
    }

    /// Platform namespace: project the platform's own subscription lifecycle
    /// onto the merchant row. No retry or dunning implications.
    async fn handle_platform_subscription(
        &self,
        action: SubscriptionAction,
        subscription: &EventSubscription,
    ) -> RecoveryResult<()> {
        let (plan, plan_status) = match action {
            SubscriptionAction::Deleted => ("free".to_string(), "canceled".to_string()),
            _ => {
                let plan = subscription
                    .plan
                    .as_ref()
                    .and_then(|p| p.nickname.clone())
                    .unwrap_or_else(|| "unknown".to_string());
                (plan, subscription.status.clone())
            }
        };

        let updated = sqlx::query(
            r#"
            UPDATE merchants
            SET plan = $1, plan_status = $2, updated_at = NOW()
            WHERE provider_customer_id = $3
            "#,
        )
        .bind(&plan)
        .bind(&plan_status)
        .bind(&subscription.customer)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            tracing::warn!(
                customer = %subscription.customer,
                subscription_id = %subscription.id,
                "Platform subscription event for unknown merchant"
            );
        } else {
            tracing::info!(
                customer = %subscription.customer,
                action = ?action,
                plan = %plan,
                plan_status = %plan_status,
                "Merchant plan projected from platform event"
            );
        }
        Ok(())
    }
}

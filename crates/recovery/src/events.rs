//! Typed provider events
//!
//! Inbound webhook payloads are duck-typed JSON on the wire. They are decoded
//! into a tagged union with an explicit field-set contract per variant:
//! malformed payloads for a known event type are rejected, unknown event
//! types surface as [`GatewayEvent::Unhandled`] so the ingestor can log them.
//!
//! Two namespaces share the wire format: events carrying a connected
//! `account` originate from a merchant's gateway account and drive recovery;
//! events without one are the platform's own billing account and are only
//! projected onto the merchant row.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{RecoveryError, RecoveryResult};

/// Raw wire envelope, verified but not yet interpreted.
#[derive(Debug, Clone, Deserialize)]
pub struct WireEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    /// Connected gateway account id; absent for platform-namespace events.
    #[serde(default)]
    pub account: Option<String>,
    pub data: WireEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireEventData {
    pub object: Value,
}

/// Invoice payload carried by `invoice.*` events.
#[derive(Debug, Clone, Deserialize)]
pub struct EventInvoice {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    pub amount_due: i64,
    pub currency: String,
    #[serde(default)]
    pub failure_code: Option<String>,
    #[serde(default)]
    pub failure_message: Option<String>,
}

/// Subscription payload carried by platform `customer.subscription.*` events.
#[derive(Debug, Clone, Deserialize)]
pub struct EventSubscription {
    pub id: String,
    pub customer: String,
    pub status: String,
    #[serde(default)]
    pub plan: Option<EventPlan>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventPlan {
    pub id: String,
    #[serde(default)]
    pub nickname: Option<String>,
}

/// Fully decoded provider event.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// Connected-account invoice failure: originates a recovery case.
    InvoicePaymentFailed {
        account: String,
        invoice: EventInvoice,
    },
    /// Connected-account invoice paid: recovery detection.
    InvoicePaid {
        account: String,
        invoice: EventInvoice,
    },
    /// Platform-namespace subscription lifecycle, projected onto the merchant.
    PlatformSubscription {
        action: SubscriptionAction,
        subscription: EventSubscription,
    },
    /// Platform-namespace invoice events: projected onto the merchant's plan
    /// status, no recovery implications.
    PlatformInvoice {
        event_type: String,
        invoice: EventInvoice,
    },
    /// Known wire format, no handler configured.
    Unhandled { event_type: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    Created,
    Updated,
    Deleted,
}

impl GatewayEvent {
    /// Interpret a verified wire envelope.
    pub fn from_wire(wire: &WireEvent) -> RecoveryResult<GatewayEvent> {
        let decode_invoice = || -> RecoveryResult<EventInvoice> {
            serde_json::from_value(wire.data.object.clone()).map_err(|e| {
                RecoveryError::MalformedEvent(format!(
                    "{} payload does not match invoice contract: {e}",
                    wire.event_type
                ))
            })
        };
        let decode_subscription = || -> RecoveryResult<EventSubscription> {
            serde_json::from_value(wire.data.object.clone()).map_err(|e| {
                RecoveryError::MalformedEvent(format!(
                    "{} payload does not match subscription contract: {e}",
                    wire.event_type
                ))
            })
        };

        match (wire.event_type.as_str(), wire.account.as_deref()) {
            ("invoice.payment_failed", Some(account)) => Ok(GatewayEvent::InvoicePaymentFailed {
                account: account.to_string(),
                invoice: decode_invoice()?,
            }),
            ("invoice.paid", Some(account)) | ("invoice.payment_succeeded", Some(account)) => {
                Ok(GatewayEvent::InvoicePaid {
                    account: account.to_string(),
                    invoice: decode_invoice()?,
                })
            }
            ("customer.subscription.created", None) => Ok(GatewayEvent::PlatformSubscription {
                action: SubscriptionAction::Created,
                subscription: decode_subscription()?,
            }),
            ("customer.subscription.updated", None) => Ok(GatewayEvent::PlatformSubscription {
                action: SubscriptionAction::Updated,
                subscription: decode_subscription()?,
            }),
            ("customer.subscription.deleted", None) => Ok(GatewayEvent::PlatformSubscription {
                action: SubscriptionAction::Deleted,
                subscription: decode_subscription()?,
            }),
            ("invoice.payment_failed", None)
            | ("invoice.paid", None)
            | ("invoice.payment_succeeded", None) => {
                Ok(GatewayEvent::PlatformInvoice {
                    event_type: wire.event_type.clone(),
                    invoice: decode_invoice()?,
                })
            }
            (other, _) => Ok(GatewayEvent::Unhandled {
                event_type: other.to_string(),
            }),
        }
    }
}

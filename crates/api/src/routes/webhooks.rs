//! Webhook receiver routes
//!
//! The gateway route verifies the signature over the raw body before any
//! parsing, so extractors that consume or reformat the payload cannot be
//! used here. Verification failures are the caller's fault (400); failures
//! inside the handler are acknowledged with 200 after being recorded, since
//! the provider's redelivery would be rejected by the event claim anyway.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use recoup_recovery::DeliveryEventKind;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "gateway-signature";

pub async fn gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let wire = state
        .recovery
        .webhooks
        .verify_event(&body, signature)
        .map_err(ApiError::Recovery)?;

    let event_id = wire.id.clone();
    let event_type = wire.event_type.clone();
    if let Err(e) = state.recovery.webhooks.handle_event(wire).await {
        tracing::error!(
            event_id = %event_id,
            event_type = %event_type,
            error = %e,
            "Webhook event processing failed"
        );
    }

    Ok(Json(json!({ "received": true })))
}

#[derive(Debug, Deserialize)]
pub struct EmailDeliveryEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EmailDeliveryData,
}

#[derive(Debug, Deserialize)]
pub struct EmailDeliveryData {
    pub email_id: String,
}

/// Delivery-event callback from the email provider. Always 200: unknown
/// message ids and unhandled event types are no-ops by contract, and the
/// provider treats anything else as a reason to disable the endpoint.
pub async fn email_delivery_event(
    State(state): State<AppState>,
    Json(event): Json<EmailDeliveryEvent>,
) -> StatusCode {
    let Some(kind) = DeliveryEventKind::from_provider(&event.event_type) else {
        tracing::debug!(
            event_type = %event.event_type,
            "Ignoring unhandled email delivery event type"
        );
        return StatusCode::OK;
    };

    if let Err(e) = state
        .recovery
        .dunning_executor
        .apply_delivery_event(&event.data.email_id, kind)
        .await
    {
        tracing::error!(
            provider_message_id = %event.data.email_id,
            event_type = %event.event_type,
            error = %e,
            "Failed to apply email delivery event"
        );
    }

    StatusCode::OK
}

//! Payment gateway client
//!
//! Thin typed wrapper around the provider's "charge this invoice" call.
//! Declines are a business outcome, not an error: only network failures,
//! 5xx responses and unparseable bodies surface as transport errors, and
//! those must never advance the business retry schedule.

use serde::Deserialize;

use crate::error::{RecoveryError, RecoveryResult};

/// Outcome of a charge call that actually reached the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    Paid,
    Declined {
        code: String,
        message: Option<String>,
    },
}

/// Structured error body the gateway returns on a decline.
#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    #[serde(rename = "type")]
    kind: String,
    code: Option<String>,
    decline_code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
}

impl GatewayClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { http, base_url }
    }

    /// Charge the invoice's default payment method.
    ///
    /// `POST {base}/invoices/{id}/pay`, bearer-authenticated, empty body.
    pub async fn pay_invoice(
        &self,
        credential: &str,
        external_invoice_id: &str,
    ) -> RecoveryResult<ChargeOutcome> {
        let url = format!("{}/invoices/{}/pay", self.base_url, external_invoice_id);

        let response = self
            .http
            .post(&url)
            .bearer_auth(credential)
            .send()
            .await
            .map_err(|e| RecoveryError::GatewayTransport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(ChargeOutcome::Paid);
        }

        if status.is_server_error() {
            return Err(RecoveryError::GatewayTransport(format!(
                "gateway returned {status} for invoice {external_invoice_id}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| RecoveryError::GatewayTransport(e.to_string()))?;

        // A 4xx without a parseable decline body is ambiguous and must not be
        // recorded as a business decline.
        let error: GatewayErrorBody = serde_json::from_str(&body).map_err(|_| {
            RecoveryError::GatewayTransport(format!(
                "gateway returned {status} with unparseable body"
            ))
        })?;

        let code = error
            .decline_code
            .or(error.code)
            .unwrap_or_else(|| error.kind.clone());

        tracing::info!(
            invoice_id = %external_invoice_id,
            decline_code = %code,
            "Gateway declined charge"
        );

        Ok(ChargeOutcome::Declined {
            code,
            message: error.message,
        })
    }
}

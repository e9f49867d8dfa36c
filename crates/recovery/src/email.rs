//! Outbound email provider client
//!
//! Resend-style JSON API: subject/html/text plus correlation tags so inbound
//! delivery-event callbacks can be matched back to the case and template.
//! Any provider failure here is a transport error; the business rule that a
//! failed dunning email is never retried lives in the executor, not here.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RecoveryError, RecoveryResult};

#[derive(Debug, Clone)]
pub struct EmailClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    from: String,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    text: &'a str,
    tags: Vec<Tag>,
}

#[derive(Debug, Serialize)]
struct Tag {
    name: &'static str,
    value: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

impl EmailClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
    ) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            http,
            base_url,
            api_key: api_key.into(),
            from: from.into(),
        }
    }

    /// Send one dunning email. Returns the provider message id used to
    /// correlate delivery events.
    pub async fn send(
        &self,
        recipient: &str,
        subject: &str,
        html: &str,
        text: &str,
        case_id: Uuid,
        template_id: Uuid,
    ) -> RecoveryResult<String> {
        let request = SendRequest {
            from: &self.from,
            to: [recipient],
            subject,
            html,
            text,
            tags: vec![
                Tag {
                    name: "case_id",
                    value: case_id.to_string(),
                },
                Tag {
                    name: "template_id",
                    value: template_id.to_string(),
                },
            ],
        };

        let response = self
            .http
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| RecoveryError::EmailTransport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RecoveryError::EmailTransport(format!(
                "email provider returned {status}: {body}"
            )));
        }

        let parsed: SendResponse = response
            .json()
            .await
            .map_err(|e| RecoveryError::EmailTransport(format!("unparseable send response: {e}")))?;

        Ok(parsed.id)
    }
}

/// Inbound delivery event types from the email provider.
///
/// Bounce and complaint both collapse to the single `bounced` record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryEventKind {
    Opened,
    Clicked,
    Bounced,
    Complained,
}

impl DeliveryEventKind {
    pub fn from_provider(event_type: &str) -> Option<Self> {
        match event_type {
            "email.opened" | "opened" => Some(Self::Opened),
            "email.clicked" | "clicked" => Some(Self::Clicked),
            "email.bounced" | "bounced" => Some(Self::Bounced),
            "email.complained" | "complained" => Some(Self::Complained),
            _ => None,
        }
    }
}

// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Recovery Engine
//!
//! Covers boundary conditions in:
//! - Webhook signature verification
//! - Credential vault encryption
//! - Retry schedule math and the case status transition table
//! - Template rendering and currency formatting
//! - Provider event decoding
//! - Gateway and email provider clients (mocked HTTP)

#[cfg(test)]
mod verify_tests {
    use crate::verify::*;

    const SECRET: &str = "whsec_test_secret";
    const BODY: &str = r#"{"id":"evt_1","type":"invoice.payment_failed"}"#;

    #[test]
    fn valid_signature_accepted() {
        let now = 1_700_000_000;
        let header = sign(BODY, SECRET, now).unwrap();
        assert!(verify_signature(BODY, &header, SECRET, now).is_ok());
    }

    #[test]
    fn skew_within_tolerance_accepted() {
        let now = 1_700_000_000;
        let header = sign(BODY, SECRET, now - TIMESTAMP_TOLERANCE_SECS).unwrap();
        assert!(verify_signature(BODY, &header, SECRET, now).is_ok());
    }

    #[test]
    fn stale_timestamp_rejected() {
        let now = 1_700_000_000;
        let header = sign(BODY, SECRET, now - TIMESTAMP_TOLERANCE_SECS - 1).unwrap();
        assert!(matches!(
            verify_signature(BODY, &header, SECRET, now),
            Err(VerificationError::StaleTimestamp { skew_secs: 301 })
        ));
    }

    #[test]
    fn future_timestamp_beyond_tolerance_rejected() {
        let now = 1_700_000_000;
        let header = sign(BODY, SECRET, now + 400).unwrap();
        assert!(matches!(
            verify_signature(BODY, &header, SECRET, now),
            Err(VerificationError::StaleTimestamp { .. })
        ));
    }

    #[test]
    fn wrong_secret_rejected() {
        let now = 1_700_000_000;
        let header = sign(BODY, "other_secret", now).unwrap();
        assert_eq!(
            verify_signature(BODY, &header, SECRET, now),
            Err(VerificationError::SignatureMismatch)
        );
    }

    #[test]
    fn tampered_body_rejected() {
        let now = 1_700_000_000;
        let header = sign(BODY, SECRET, now).unwrap();
        assert_eq!(
            verify_signature("{\"tampered\":true}", &header, SECRET, now),
            Err(VerificationError::SignatureMismatch)
        );
    }

    #[test]
    fn any_matching_candidate_accepted_for_rotation() {
        // Secret rotation: header carries a signature from the old secret and
        // one from the current secret.
        let now = 1_700_000_000;
        let old = sign(BODY, "retired_secret", now).unwrap();
        let current = sign(BODY, SECRET, now).unwrap();
        let old_sig = old.split("v1=").nth(1).unwrap();
        let header = format!("{current},v1={old_sig}");
        assert!(verify_signature(BODY, &header, SECRET, now).is_ok());

        let header_old_first = format!("t={now},v1={old_sig},{}", current.split(',').nth(1).unwrap());
        assert!(verify_signature(BODY, &header_old_first, SECRET, now).is_ok());
    }

    #[test]
    fn missing_timestamp_rejected() {
        assert_eq!(
            verify_signature(BODY, "v1=deadbeef", SECRET, 0),
            Err(VerificationError::MissingTimestamp)
        );
    }

    #[test]
    fn missing_signature_rejected() {
        assert_eq!(
            verify_signature(BODY, "t=1700000000", SECRET, 1_700_000_000),
            Err(VerificationError::MissingSignature)
        );
    }

    #[test]
    fn non_hex_candidates_ignored() {
        assert_eq!(
            verify_signature(BODY, "t=1700000000,v1=not-hex!", SECRET, 1_700_000_000),
            Err(VerificationError::MissingSignature)
        );
    }
}

#[cfg(test)]
mod vault_tests {
    use crate::error::RecoveryError;
    use crate::vault::CredentialVault;

    const KEY: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn roundtrip() {
        let vault = CredentialVault::from_hex_key(KEY).unwrap();
        let ciphertext = vault.encrypt("sk_live_abc123").unwrap();
        assert_ne!(ciphertext, "sk_live_abc123");
        assert_eq!(vault.decrypt(&ciphertext).unwrap(), "sk_live_abc123");
    }

    #[test]
    fn nonce_is_random_per_encryption() {
        let vault = CredentialVault::from_hex_key(KEY).unwrap();
        let a = vault.encrypt("same-credential").unwrap();
        let b = vault.encrypt("same-credential").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let vault = CredentialVault::from_hex_key(KEY).unwrap();
        let ciphertext = vault.encrypt("sk_live_abc123").unwrap();
        let mut bytes = ciphertext.into_bytes();
        let last = bytes.len() - 1;
        bytes[last] = if bytes[last] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();
        assert!(matches!(
            vault.decrypt(&tampered),
            Err(RecoveryError::Vault(_))
        ));
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let vault = CredentialVault::from_hex_key(KEY).unwrap();
        let other = CredentialVault::from_hex_key(
            "ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .unwrap();
        let ciphertext = vault.encrypt("sk_live_abc123").unwrap();
        assert!(other.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn short_key_rejected() {
        assert!(matches!(
            CredentialVault::from_hex_key("0123"),
            Err(RecoveryError::Config(_))
        ));
    }

    #[test]
    fn non_hex_key_rejected() {
        assert!(CredentialVault::from_hex_key("zz").is_err());
    }

    #[test]
    fn garbage_ciphertext_rejected() {
        let vault = CredentialVault::from_hex_key(KEY).unwrap();
        assert!(vault.decrypt("not base64!!!").is_err());
        assert!(vault.decrypt("QUJD").is_err()); // valid base64, too short
    }
}

#[cfg(test)]
mod schedule_tests {
    use crate::schedule::{
        automatic_offset, manual_cap_delay, MANUAL_RETRY_LIMIT, RETRY_OFFSET_DAYS,
    };
    use time::macros::datetime;
    use time::Duration;

    #[test]
    fn fixed_offsets_are_3_7_14_days() {
        assert_eq!(RETRY_OFFSET_DAYS, [3, 7, 14]);
        assert_eq!(automatic_offset(1), Some(Duration::days(3)));
        assert_eq!(automatic_offset(2), Some(Duration::days(7)));
        assert_eq!(automatic_offset(3), Some(Duration::days(14)));
    }

    #[test]
    fn schedule_exhausts_after_three_attempts() {
        assert_eq!(automatic_offset(4), None);
        assert_eq!(automatic_offset(100), None);
    }

    #[test]
    fn out_of_range_sequences_have_no_offset() {
        assert_eq!(automatic_offset(0), None);
        assert_eq!(automatic_offset(-1), None);
    }

    #[test]
    fn manual_cap_allows_up_to_three_per_window() {
        let now = datetime!(2026-02-01 12:00 UTC);
        assert_eq!(manual_cap_delay(0, None, now), None);
        assert_eq!(manual_cap_delay(2, Some(now - Duration::hours(1)), now), None);
        assert_eq!(MANUAL_RETRY_LIMIT, 3);
    }

    #[test]
    fn fourth_manual_within_window_is_rejected_with_wait_time() {
        // Oldest of the three recent attempts is 23h old: the caller must
        // wait the remaining hour before the window frees a slot.
        let now = datetime!(2026-02-01 12:00 UTC);
        let oldest = now - Duration::hours(23);
        assert_eq!(manual_cap_delay(3, Some(oldest), now), Some(3600));
        assert_eq!(manual_cap_delay(5, Some(oldest), now), Some(3600));
    }

    #[test]
    fn manual_cap_wait_never_negative() {
        // Count query and cap check race: the oldest attempt may have just
        // aged out of the window.
        let now = datetime!(2026-02-01 12:00 UTC);
        let oldest = now - Duration::hours(25);
        assert_eq!(manual_cap_delay(3, Some(oldest), now), Some(0));
        assert_eq!(manual_cap_delay(3, None, now), Some(Duration::hours(24).whole_seconds()));
    }
}

#[cfg(test)]
mod transition_tests {
    use crate::error::RecoveryError;
    use crate::model::{CaseEvent, CaseStatus};

    #[test]
    fn active_case_recovers() {
        assert_eq!(
            CaseStatus::Active.apply(CaseEvent::PaymentRecovered).unwrap(),
            CaseStatus::Recovered
        );
    }

    #[test]
    fn active_case_pauses_on_exhaustion() {
        assert_eq!(
            CaseStatus::Active.apply(CaseEvent::RetriesExhausted).unwrap(),
            CaseStatus::Paused
        );
    }

    #[test]
    fn paused_case_reactivates_on_manual_retry() {
        assert_eq!(
            CaseStatus::Paused
                .apply(CaseEvent::ManualRetryRequested)
                .unwrap(),
            CaseStatus::Active
        );
    }

    #[test]
    fn paused_case_can_still_recover_out_of_band() {
        assert_eq!(
            CaseStatus::Paused.apply(CaseEvent::PaymentRecovered).unwrap(),
            CaseStatus::Recovered
        );
    }

    #[test]
    fn manual_retry_on_active_case_is_identity() {
        assert_eq!(
            CaseStatus::Active
                .apply(CaseEvent::ManualRetryRequested)
                .unwrap(),
            CaseStatus::Active
        );
    }

    #[test]
    fn terminal_statuses_reject_all_events() {
        for terminal in [CaseStatus::Recovered, CaseStatus::Canceled] {
            for event in [
                CaseEvent::PaymentRecovered,
                CaseEvent::RetriesExhausted,
                CaseEvent::ManualRetryRequested,
                CaseEvent::Canceled,
            ] {
                assert!(
                    matches!(
                        terminal.apply(event),
                        Err(RecoveryError::IllegalTransition { .. })
                    ),
                    "{terminal:?} should reject {event:?}"
                );
            }
        }
    }
}

#[cfg(test)]
mod render_tests {
    use crate::templates::{format_amount, render, TemplateVars};

    fn vars() -> TemplateVars {
        TemplateVars {
            customer_name: "Jane".to_string(),
            amount_due: "$29.00".to_string(),
            update_link: "https://pay.example.com/update/c1".to_string(),
        }
    }

    #[test]
    fn substitutes_known_tokens() {
        let rendered = render("Hi {{customer_name}}, pay {{amount_due}}", &vars());
        assert_eq!(rendered, "Hi Jane, pay $29.00");
    }

    #[test]
    fn unknown_token_left_verbatim() {
        let rendered = render("Hi {{customer_name}}, {{foo}}", &vars());
        assert_eq!(rendered, "Hi Jane, {{foo}}");
    }

    #[test]
    fn repeated_tokens_all_substituted() {
        let rendered = render("{{amount_due}} / {{amount_due}}", &vars());
        assert_eq!(rendered, "$29.00 / $29.00");
    }

    #[test]
    fn usd_amounts() {
        assert_eq!(format_amount(4900, "usd"), "$49.00");
        assert_eq!(format_amount(2900, "USD"), "$29.00");
        assert_eq!(format_amount(5, "usd"), "$0.05");
    }

    #[test]
    fn thousands_grouped() {
        assert_eq!(format_amount(1_234_567, "usd"), "$12,345.67");
        assert_eq!(format_amount(100_000_000, "eur"), "€1,000,000.00");
    }

    #[test]
    fn zero_decimal_currencies() {
        assert_eq!(format_amount(500, "jpy"), "¥500");
        assert_eq!(format_amount(125_000, "krw"), "125,000 KRW");
    }

    #[test]
    fn unknown_currency_falls_back_to_code() {
        assert_eq!(format_amount(4900, "xyz"), "49.00 XYZ");
    }

    #[test]
    fn negative_amounts_keep_their_sign() {
        // Credits under one major unit have a zero whole part; the sign must
        // come from the full amount.
        assert_eq!(format_amount(-50, "usd"), "-$0.50");
        assert_eq!(format_amount(-4900, "usd"), "-$49.00");
        assert_eq!(format_amount(-500, "jpy"), "-¥500");
        assert_eq!(format_amount(-1_234_567, "xyz"), "-12,345.67 XYZ");
    }
}

#[cfg(test)]
mod events_tests {
    use crate::error::RecoveryError;
    use crate::events::{GatewayEvent, SubscriptionAction, WireEvent};

    fn wire(json: &str) -> WireEvent {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn connected_payment_failed_decodes() {
        let event = wire(
            r#"{
                "id": "evt_1",
                "type": "invoice.payment_failed",
                "created": 1700000000,
                "account": "acct_42",
                "data": {"object": {
                    "id": "in_99",
                    "customer": "cus_7",
                    "customer_email": "jane@example.com",
                    "customer_name": "Jane",
                    "amount_due": 4900,
                    "currency": "usd",
                    "failure_code": "card_declined"
                }}
            }"#,
        );
        match GatewayEvent::from_wire(&event).unwrap() {
            GatewayEvent::InvoicePaymentFailed { account, invoice } => {
                assert_eq!(account, "acct_42");
                assert_eq!(invoice.id, "in_99");
                assert_eq!(invoice.amount_due, 4900);
                assert_eq!(invoice.failure_code.as_deref(), Some("card_declined"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn malformed_known_type_rejected() {
        // amount_due missing: known type, wrong shape
        let event = wire(
            r#"{
                "id": "evt_2",
                "type": "invoice.payment_failed",
                "created": 1700000000,
                "account": "acct_42",
                "data": {"object": {"id": "in_99", "currency": "usd"}}
            }"#,
        );
        assert!(matches!(
            GatewayEvent::from_wire(&event),
            Err(RecoveryError::MalformedEvent(_))
        ));
    }

    #[test]
    fn unknown_type_is_unhandled_not_error() {
        let event = wire(
            r#"{
                "id": "evt_3",
                "type": "charge.dispute.created",
                "created": 1700000000,
                "data": {"object": {}}
            }"#,
        );
        assert!(matches!(
            GatewayEvent::from_wire(&event).unwrap(),
            GatewayEvent::Unhandled { .. }
        ));
    }

    #[test]
    fn account_header_splits_namespaces() {
        // Same wire shape without an account is the platform namespace.
        let event = wire(
            r#"{
                "id": "evt_4",
                "type": "invoice.payment_failed",
                "created": 1700000000,
                "data": {"object": {"id": "in_1", "amount_due": 100, "currency": "usd"}}
            }"#,
        );
        assert!(matches!(
            GatewayEvent::from_wire(&event).unwrap(),
            GatewayEvent::PlatformInvoice { .. }
        ));
    }

    #[test]
    fn platform_subscription_deleted_decodes() {
        let event = wire(
            r#"{
                "id": "evt_5",
                "type": "customer.subscription.deleted",
                "created": 1700000000,
                "data": {"object": {
                    "id": "sub_1",
                    "customer": "cus_plat_9",
                    "status": "canceled"
                }}
            }"#,
        );
        match GatewayEvent::from_wire(&event).unwrap() {
            GatewayEvent::PlatformSubscription {
                action,
                subscription,
            } => {
                assert_eq!(action, SubscriptionAction::Deleted);
                assert_eq!(subscription.customer, "cus_plat_9");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

#[cfg(test)]
mod email_status_tests {
    use crate::email::DeliveryEventKind;
    use crate::model::EmailStatus;

    #[test]
    fn rank_orders_terminality() {
        assert!(EmailStatus::Pending.rank() < EmailStatus::Sent.rank());
        assert!(EmailStatus::Sent.rank() < EmailStatus::Opened.rank());
        assert!(EmailStatus::Opened.rank() < EmailStatus::Clicked.rank());
        // opened must never revert clicked or bounced
        assert!(EmailStatus::Opened.rank() < EmailStatus::Bounced.rank());
        assert!(EmailStatus::Clicked.rank() < EmailStatus::Bounced.rank());
    }

    #[test]
    fn provider_event_types_map() {
        assert_eq!(
            DeliveryEventKind::from_provider("email.opened"),
            Some(DeliveryEventKind::Opened)
        );
        assert_eq!(
            DeliveryEventKind::from_provider("email.complained"),
            Some(DeliveryEventKind::Complained)
        );
        assert_eq!(DeliveryEventKind::from_provider("email.delivered"), None);
    }
}

#[cfg(test)]
mod gateway_tests {
    use crate::error::RecoveryError;
    use crate::gateway::{ChargeOutcome, GatewayClient};

    #[tokio::test]
    async fn success_is_paid() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/invoices/in_123/pay")
            .match_header("authorization", "Bearer sk_test_1")
            .with_status(200)
            .with_body(r#"{"id":"in_123","status":"paid"}"#)
            .create_async()
            .await;

        let client = GatewayClient::new(reqwest::Client::new(), server.url());
        let outcome = client.pay_invoice("sk_test_1", "in_123").await.unwrap();
        assert_eq!(outcome, ChargeOutcome::Paid);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn structured_decline_is_a_business_outcome() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/invoices/in_123/pay")
            .with_status(402)
            .with_body(
                r#"{"type":"card_error","code":"card_declined","decline_code":"insufficient_funds","message":"Your card has insufficient funds."}"#,
            )
            .create_async()
            .await;

        let client = GatewayClient::new(reqwest::Client::new(), server.url());
        match client.pay_invoice("sk_test_1", "in_123").await.unwrap() {
            ChargeOutcome::Declined { code, message } => {
                assert_eq!(code, "insufficient_funds");
                assert_eq!(
                    message.as_deref(),
                    Some("Your card has insufficient funds.")
                );
            }
            other => panic!("expected decline, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn decline_without_decline_code_uses_code() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/invoices/in_9/pay")
            .with_status(404)
            .with_body(r#"{"type":"invalid_request_error","code":"resource_missing"}"#)
            .create_async()
            .await;

        let client = GatewayClient::new(reqwest::Client::new(), server.url());
        match client.pay_invoice("sk", "in_9").await.unwrap() {
            ChargeOutcome::Declined { code, .. } => assert_eq!(code, "resource_missing"),
            other => panic!("expected decline, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_is_transport_not_decline() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/invoices/in_123/pay")
            .with_status(503)
            .with_body("upstream unavailable")
            .create_async()
            .await;

        let client = GatewayClient::new(reqwest::Client::new(), server.url());
        let err = client.pay_invoice("sk_test_1", "in_123").await.unwrap_err();
        assert!(matches!(err, RecoveryError::GatewayTransport(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn unparseable_error_body_is_transport() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/invoices/in_123/pay")
            .with_status(400)
            .with_body("<html>Bad Request</html>")
            .create_async()
            .await;

        let client = GatewayClient::new(reqwest::Client::new(), server.url());
        assert!(matches!(
            client.pay_invoice("sk_test_1", "in_123").await,
            Err(RecoveryError::GatewayTransport(_))
        ));
    }
}

#[cfg(test)]
mod email_client_tests {
    use crate::email::EmailClient;
    use crate::error::RecoveryError;
    use uuid::Uuid;

    #[tokio::test]
    async fn send_returns_provider_message_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/emails")
            .match_header("authorization", "Bearer re_test_key")
            .with_status(200)
            .with_body(r#"{"id":"msg_abc"}"#)
            .create_async()
            .await;

        let client = EmailClient::new(
            reqwest::Client::new(),
            server.url(),
            "re_test_key",
            "billing@example.com",
        );
        let id = client
            .send(
                "jane@example.com",
                "Payment reminder",
                "<p>hi</p>",
                "hi",
                Uuid::new_v4(),
                Uuid::new_v4(),
            )
            .await
            .unwrap();
        assert_eq!(id, "msg_abc");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn provider_rejection_is_transport_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/emails")
            .with_status(422)
            .with_body(r#"{"message":"invalid recipient"}"#)
            .create_async()
            .await;

        let client = EmailClient::new(
            reqwest::Client::new(),
            server.url(),
            "re_test_key",
            "billing@example.com",
        );
        let err = client
            .send(
                "not-an-email",
                "s",
                "<p>h</p>",
                "h",
                Uuid::new_v4(),
                Uuid::new_v4(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::EmailTransport(_)));
    }
}

#[cfg(test)]
mod error_tests {
    use crate::error::RecoveryError;
    use uuid::Uuid;

    #[test]
    fn only_transport_errors_are_transient() {
        assert!(RecoveryError::GatewayTransport("timeout".into()).is_transient());
        assert!(RecoveryError::EmailTransport("timeout".into()).is_transient());
        assert!(!RecoveryError::CaseNotFound(Uuid::new_v4()).is_transient());
        assert!(!RecoveryError::ManualRetryLimit {
            retry_after_secs: 60
        }
        .is_transient());
        assert!(!RecoveryError::MissingInvoiceId(Uuid::new_v4()).is_transient());
    }
}

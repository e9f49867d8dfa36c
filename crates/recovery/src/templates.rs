//! Dunning template rendering and seeding
//!
//! Rendering is literal `{{variable}}` token substitution, nothing more.
//! Unknown tokens are left verbatim so a typo in a merchant's template shows
//! up in the email instead of silently vanishing.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::RecoveryResult;

/// Variable set available to every template.
#[derive(Debug, Clone)]
pub struct TemplateVars {
    pub customer_name: String,
    pub amount_due: String,
    pub update_link: String,
}

impl TemplateVars {
    fn pairs(&self) -> [(&'static str, &str); 3] {
        [
            ("customer_name", &self.customer_name),
            ("amount_due", &self.amount_due),
            ("update_link", &self.update_link),
        ]
    }
}

/// Substitute `{{name}}` tokens in `template`.
pub fn render(template: &str, vars: &TemplateVars) -> String {
    let mut out = template.to_string();
    for (name, value) in vars.pairs() {
        out = out.replace(&format!("{{{{{name}}}}}"), value);
    }
    out
}

/// Format a minor-currency-unit amount as a customer-facing string.
///
/// Knows the common symbols and the zero-decimal currencies; anything else
/// falls back to `"12.34 XYZ"`.
pub fn format_amount(minor_units: i64, currency: &str) -> String {
    let currency = currency.to_ascii_uppercase();
    let zero_decimal = matches!(currency.as_str(), "JPY" | "KRW" | "VND" | "CLP");

    // The sign is carried from the full amount: whole-part truncation would
    // lose it for credits smaller than one major unit.
    let sign = if minor_units < 0 { "-" } else { "" };
    let magnitude = minor_units.abs();

    let (whole, cents) = if zero_decimal {
        (magnitude, 0)
    } else {
        (magnitude / 100, magnitude % 100)
    };

    let whole_str = group_thousands(whole);

    let symbol = match currency.as_str() {
        "USD" | "AUD" | "CAD" | "NZD" | "SGD" => Some("$"),
        "EUR" => Some("€"),
        "GBP" => Some("£"),
        "JPY" => Some("¥"),
        _ => None,
    };

    match (symbol, zero_decimal) {
        (Some(sym), true) => format!("{sign}{sym}{whole_str}"),
        (Some(sym), false) => format!("{sign}{sym}{whole_str}.{cents:02}"),
        (None, true) => format!("{sign}{whole_str} {currency}"),
        (None, false) => format!("{sign}{whole_str}.{cents:02} {currency}"),
    }
}

fn group_thousands(value: i64) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    grouped
}

/// Stock sequence installed at merchant onboarding: a gentle reminder on day
/// 1, a follow-up on day 5 and a final notice on day 12.
pub const DEFAULT_TEMPLATES: [(&str, &str, i32, i32); 3] = [
    ("Payment reminder", "Your payment didn't go through", 1, 1),
    ("Payment follow-up", "Reminder: update your payment method", 5, 2),
    ("Final notice", "Final notice: your subscription is at risk", 12, 3),
];

const DEFAULT_BODY_HTML: &str = "<p>Hi {{customer_name}},</p>\
<p>We couldn't collect your payment of {{amount_due}}. \
Please <a href=\"{{update_link}}\">update your payment method</a> to keep your subscription active.</p>";

const DEFAULT_BODY_TEXT: &str = "Hi {{customer_name}},\n\n\
We couldn't collect your payment of {{amount_due}}. \
Please update your payment method to keep your subscription active:\n{{update_link}}\n";

/// Seed the default template sequence for a merchant. Idempotent: existing
/// sequence positions are left untouched.
pub async fn seed_defaults(pool: &PgPool, merchant_id: Uuid) -> RecoveryResult<u64> {
    let mut inserted = 0;
    for (name, subject, delay_days, sequence_order) in DEFAULT_TEMPLATES {
        let result = sqlx::query(
            r#"
            INSERT INTO dunning_templates
                (merchant_id, name, subject, body_html, body_text, delay_days, sequence_order)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (merchant_id, sequence_order) DO NOTHING
            "#,
        )
        .bind(merchant_id)
        .bind(name)
        .bind(subject)
        .bind(DEFAULT_BODY_HTML)
        .bind(DEFAULT_BODY_TEXT)
        .bind(delay_days)
        .bind(sequence_order)
        .execute(pool)
        .await?;
        inserted += result.rows_affected();
    }

    tracing::info!(
        merchant_id = %merchant_id,
        inserted = inserted,
        "Seeded default dunning templates"
    );
    Ok(inserted)
}

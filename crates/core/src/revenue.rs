//! Revenue field extraction for purchase, subscription, donation and refund events.

use serde_json::{Map, Value};

use crate::event::names;

pub fn is_revenue_event(event_name: &str) -> bool {
    names::is_positive_revenue(event_name) || event_name == names::REFUND
}

/// Numeric amount; numeric strings are coerced
pub fn parse_amount(value: Option<&Value>) -> Option<f64> {
    let amount = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if !s.trim().is_empty() => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    amount.is_finite().then_some(amount)
}

/// Three upper-case ASCII letters
pub fn is_iso_currency(value: &str) -> bool {
    value.len() == 3 && value.bytes().all(|b| b.is_ascii_uppercase())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RevenueFields {
    /// Negative for refunds
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub product: Option<String>,
    pub payment_provider: Option<String>,
}

pub fn parse_revenue_fields(event_name: &str, properties: &Map<String, Value>) -> RevenueFields {
    if !is_revenue_event(event_name) {
        return RevenueFields::default();
    }

    let string_field = |key: &str| {
        properties
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    let amount = parse_amount(properties.get("amount")).map(|amount| {
        if event_name == names::REFUND {
            -amount.abs()
        } else {
            amount.abs()
        }
    });

    RevenueFields {
        amount,
        currency: string_field("currency").filter(|c| is_iso_currency(c)),
        product: string_field("product"),
        payment_provider: string_field("payment_provider"),
    }
}

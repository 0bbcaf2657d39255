//! JSON snapshots stored in `approval_requests.request_data`.
//!
//! Pending requests can sit for a long time before somebody approves them, so
//! every field defaults when absent and unknown fields are ignored. Decimal
//! amounts travel as strings to keep their exact scale.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderItemSnapshot {
    pub product_id: Option<Uuid>,
    pub product_name: String,
    pub quantity: i32,
    pub unit_price: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderRequestData {
    pub order_code: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub note: String,
    pub items: Vec<OrderItemSnapshot>,
    /// Tax rule chosen by the requester; resolved again when the request is approved.
    /// Approval reads this and `side_fees` straight from the stored JSON.
    pub tax_rule_id: Option<String>,
    pub side_fees: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpenseRequestData {
    pub currency: String,
    pub exchange_rate: String,
    pub original_amount: String,
    pub is_foreign_vendor: bool,
    pub fct_type: Option<String>,
    pub document_type: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductRequestData {
    pub sku: String,
    pub name: String,
    pub price: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn old_order_snapshots_still_parse() {
        let raw = r#"{"order_code":"PO-1","type":"EXPORT","legacy_field":42}"#;
        let data: OrderRequestData = serde_json::from_str(raw).unwrap();
        assert_eq!(data.order_code, "PO-1");
        assert_eq!(data.order_type, "EXPORT");
        assert!(data.items.is_empty());
        assert_eq!(data.tax_rule_id, None);
    }

    #[test]
    fn order_snapshots_keep_the_wire_names() {
        let data = OrderRequestData {
            order_code: "SO-1".into(),
            order_type: "IMPORT".into(),
            side_fees: Some("2.50".into()),
            ..Default::default()
        };
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["type"], "IMPORT");
        assert_eq!(value["side_fees"], "2.50");
        assert!(value["tax_rule_id"].is_null());
    }
}

#![allow(dead_code)]

use std::str::FromStr;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use ledger_service::models::{Product, TaxRule};
use ledger_service::notify::BroadcastSink;
use ledger_service::requests::{NewOrderItem, NewOrderRequest};
use ledger_service::store::{Database, MemoryDatabase, ProductStore, TaxRuleStore};
use ledger_service::Ledger;
use ledger_shared::{OrderDirection, TaxType};
use uuid::Uuid;

pub fn new_year() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
}

pub fn dec(raw: &str) -> BigDecimal {
    BigDecimal::from_str(raw).unwrap()
}

pub struct Harness {
    pub db: MemoryDatabase,
    pub sink: BroadcastSink,
    pub ledger: Ledger,
}

impl Harness {
    pub fn new() -> Self {
        let db = MemoryDatabase::new();
        let sink = BroadcastSink::new(64);
        let ledger = Ledger::new(Arc::new(db.clone()), Arc::new(sink.clone()), new_year);
        Self { db, sink, ledger }
    }

    pub async fn product(&self, sku: &str, stock: i32) -> Product {
        let mut product = Product::new(sku, format!("Product {}", sku), dec("10"));
        product.current_stock = stock;
        self.db.connect().await.unwrap().insert_product(&product).await.unwrap();
        product
    }

    pub async fn tax_rule(&self, tax_type: TaxType, rate: &str) -> TaxRule {
        let rule = TaxRule::new(tax_type, dec(rate), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), None);
        self.db.connect().await.unwrap().insert_tax_rule(&rule).await.unwrap();
        rule
    }

    pub fn stock_of(&self, product_id: Uuid) -> i32 {
        self.db
            .snapshot()
            .products
            .iter()
            .find(|p| p.id == product_id)
            .map(|p| p.current_stock)
            .unwrap()
    }

    pub fn audit_actions(&self) -> Vec<String> {
        self.db.snapshot().audit_logs.into_iter().map(|l| l.action).collect()
    }
}

pub fn order_request(code: &str, direction: OrderDirection, lines: &[(Uuid, i32, &str)]) -> NewOrderRequest {
    NewOrderRequest {
        order_code: code.to_string(),
        direction,
        note: format!("{} note", code),
        items: lines
            .iter()
            .map(|(product_id, quantity, unit_price)| NewOrderItem {
                product_id: *product_id,
                quantity: *quantity,
                unit_price: dec(unit_price),
            })
            .collect(),
        tax_rule_id: None,
        side_fees: None,
    }
}

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use ledger_shared::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::products)]
pub struct Product {
    pub id: Uuid,
    pub sku: String,
    pub name: String,
    pub current_stock: i32,
    pub price: BigDecimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    /// New products start with no stock; stock only moves through the ledger.
    pub fn new(sku: impl Into<String>, name: impl Into<String>, price: BigDecimal) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            sku: sku.into(),
            name: name.into(),
            current_stock: 0,
            price,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::orders)]
pub struct Order {
    pub id: Uuid,
    pub order_code: String,
    pub order_type: String,
    pub status: String,
    pub note: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(order_code: impl Into<String>, direction: OrderDirection, note: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            order_code: order_code.into(),
            order_type: direction.as_str().to_string(),
            status: OrderStatus::PendingApproval.as_str().to_string(),
            note: note.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn direction(&self) -> LedgerResult<OrderDirection> {
        Ok(self.order_type.parse()?)
    }

    pub fn status(&self) -> LedgerResult<OrderStatus> {
        Ok(self.status.parse()?)
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::order_items)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub line_no: i32,
    pub quantity: i32,
    /// Price captured when the order was requested; never recomputed.
    pub unit_price: BigDecimal,
}

impl OrderItem {
    pub fn line_total(&self) -> BigDecimal {
        &self.unit_price * BigDecimal::from(self.quantity)
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::inventory_transactions)]
pub struct InventoryTransaction {
    pub id: Uuid,
    pub product_id: Uuid,
    pub order_id: Option<Uuid>,
    pub transaction_type: String,
    pub quantity_changed: i32,
    pub stock_after: i32,
    pub created_at: DateTime<Utc>,
}

impl InventoryTransaction {
    pub fn record(product_id: Uuid, order_id: Option<Uuid>, delta: i32, stock_after: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            product_id,
            order_id,
            transaction_type: TxDirection::from_delta(delta).as_str().to_string(),
            quantity_changed: delta,
            stock_after,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::expenses)]
pub struct Expense {
    pub id: Uuid,
    pub order_id: Option<Uuid>,
    pub vendor_id: Option<Uuid>,
    pub currency: String,
    pub exchange_rate: BigDecimal,
    pub original_amount: BigDecimal,
    pub converted_amount_usd: BigDecimal,
    pub is_foreign_vendor: bool,
    pub fct_type: Option<String>,
    pub fct_rate: BigDecimal,
    pub fct_amount: BigDecimal,
    pub total_payable: BigDecimal,
    pub vat_rate: BigDecimal,
    pub vat_amount: BigDecimal,
    pub document_type: String,
    pub vendor_tax_code: Option<String>,
    pub document_url: Option<String>,
    pub is_deductible_expense: bool,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl Expense {
    /// Tax carried onto the invoice: VAT plus foreign contractor tax.
    pub fn invoice_tax(&self) -> BigDecimal {
        &self.vat_amount + &self.fct_amount
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::approval_requests)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub request_type: String,
    pub reference_id: Uuid,
    pub request_data: serde_json::Value,
    pub status: String,
    pub requested_by: Option<Uuid>,
    pub approved_by: Option<Uuid>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The entity an approval request points at. `reference_id` is only meaningful
/// together with `request_type`, so the pair is always resolved through this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id")]
pub enum ApprovalSubject {
    Order(Uuid),
    Product(Uuid),
    Expense(Uuid),
}

impl ApprovalSubject {
    pub fn new(request_type: RequestType, reference_id: Uuid) -> Self {
        match request_type {
            RequestType::CreateOrder => ApprovalSubject::Order(reference_id),
            RequestType::CreateProduct => ApprovalSubject::Product(reference_id),
            RequestType::CreateExpense => ApprovalSubject::Expense(reference_id),
        }
    }

    pub fn request_type(&self) -> RequestType {
        match self {
            ApprovalSubject::Order(_) => RequestType::CreateOrder,
            ApprovalSubject::Product(_) => RequestType::CreateProduct,
            ApprovalSubject::Expense(_) => RequestType::CreateExpense,
        }
    }

    pub fn reference_id(&self) -> Uuid {
        match self {
            ApprovalSubject::Order(id) | ApprovalSubject::Product(id) | ApprovalSubject::Expense(id) => *id,
        }
    }
}

impl ApprovalRequest {
    pub fn pending(subject: ApprovalSubject, request_data: serde_json::Value, requested_by: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            request_type: subject.request_type().as_str().to_string(),
            reference_id: subject.reference_id(),
            request_data,
            status: ApprovalStatus::Pending.as_str().to_string(),
            requested_by,
            approved_by: None,
            approved_at: None,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> LedgerResult<ApprovalStatus> {
        Ok(self.status.parse()?)
    }

    pub fn subject(&self) -> LedgerResult<ApprovalSubject> {
        let request_type: RequestType = self.request_type.parse()?;
        Ok(ApprovalSubject::new(request_type, self.reference_id))
    }

    /// Moves a pending request into a terminal state. Callers must hold the row lock.
    pub fn resolve(
        &mut self,
        status: ApprovalStatus,
        approver: Uuid,
        reason: Option<String>,
    ) -> LedgerResult<()> {
        let current = self.status()?;
        if current.is_terminal() {
            return Err(LedgerError::AlreadyResolved { id: self.id, status: current });
        }
        if !status.is_terminal() {
            return Err(LedgerError::Fatal(format!(
                "approval request {} cannot move to {}",
                self.id, status
            )));
        }
        let now = Utc::now();
        self.status = status.as_str().to_string();
        self.approved_by = Some(approver);
        self.approved_at = Some(now);
        self.rejection_reason = reason;
        self.updated_at = now;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::invoices)]
pub struct Invoice {
    pub id: Uuid,
    pub invoice_no: String,
    pub reference_type: String,
    pub reference_id: Uuid,
    pub tax_rule_id: Option<Uuid>,
    pub subtotal: BigDecimal,
    pub tax_amount: BigDecimal,
    pub side_fees: BigDecimal,
    pub total_amount: BigDecimal,
    pub approval_status: String,
    pub approved_by: Option<Uuid>,
    pub approved_at: Option<DateTime<Utc>>,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::audit_logs)]
pub struct AuditLog {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub action: String,
    pub entity_id: String,
    pub entity_name: Option<String>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::tax_rules)]
pub struct TaxRule {
    pub id: Uuid,
    pub tax_type: String,
    pub rate: BigDecimal,
    pub effective_from: NaiveDate,
    pub effective_to: Option<NaiveDate>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl TaxRule {
    pub fn new(tax_type: TaxType, rate: BigDecimal, effective_from: NaiveDate, effective_to: Option<NaiveDate>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tax_type: tax_type.as_str().to_string(),
            rate,
            effective_from,
            effective_to,
            description: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        self.effective_from <= date && self.effective_to.map_or(true, |to| to >= date)
    }
}

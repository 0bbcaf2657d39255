//! Data access seam.
//!
//! Every accessor works on a [`Session`]: either an open transaction or an
//! autocommit connection. Services never hold a connection themselves; they ask
//! the unit of work for the active session, so a test can swap the whole store
//! for [`memory::MemoryDatabase`].

pub mod memory;
pub mod pg;

use async_trait::async_trait;
use chrono::NaiveDate;
use ledger_shared::{ApprovalStatus, OrderStatus, Page, PageRequest, ReferenceType, TaxType};
use uuid::Uuid;

use crate::error::LedgerResult;
use crate::models::*;

pub use memory::MemoryDatabase;
pub use pg::PgDatabase;

#[async_trait]
pub trait Database: Send + Sync {
    /// Opens a transaction on a fresh connection.
    async fn begin(&self) -> LedgerResult<Box<dyn Session>>;

    /// Checks out a connection in autocommit mode.
    async fn connect(&self) -> LedgerResult<Box<dyn Session>>;
}

#[async_trait]
pub trait ProductStore: Send {
    async fn find_product(&mut self, id: Uuid) -> LedgerResult<Option<Product>>;
    /// `SELECT ... FOR UPDATE`; the lock is held until the transaction ends.
    async fn lock_product(&mut self, id: Uuid) -> LedgerResult<Option<Product>>;
    async fn set_stock(&mut self, id: Uuid, stock: i32) -> LedgerResult<()>;
    async fn insert_product(&mut self, product: &Product) -> LedgerResult<()>;
    async fn list_products(&mut self, page: PageRequest) -> LedgerResult<Page<Product>>;
}

#[async_trait]
pub trait OrderStore: Send {
    async fn insert_order(&mut self, order: &Order, items: &[OrderItem]) -> LedgerResult<()>;
    async fn find_order(&mut self, id: Uuid) -> LedgerResult<Option<Order>>;
    async fn lock_order(&mut self, id: Uuid) -> LedgerResult<Option<Order>>;
    /// Items in line order.
    async fn order_items(&mut self, order_id: Uuid) -> LedgerResult<Vec<OrderItem>>;
    async fn set_order_status(&mut self, id: Uuid, status: OrderStatus) -> LedgerResult<()>;
}

#[async_trait]
pub trait ExpenseStore: Send {
    async fn insert_expense(&mut self, expense: &Expense) -> LedgerResult<()>;
    async fn find_expense(&mut self, id: Uuid) -> LedgerResult<Option<Expense>>;
}

#[async_trait]
pub trait ApprovalStore: Send {
    async fn insert_approval_request(&mut self, request: &ApprovalRequest) -> LedgerResult<()>;
    async fn find_approval_request(&mut self, id: Uuid) -> LedgerResult<Option<ApprovalRequest>>;
    async fn lock_approval_request(&mut self, id: Uuid) -> LedgerResult<Option<ApprovalRequest>>;
    /// Persists the resolution fields of a request.
    async fn update_approval_request(&mut self, request: &ApprovalRequest) -> LedgerResult<()>;
    async fn list_approval_requests(
        &mut self,
        status: Option<ApprovalStatus>,
        page: PageRequest,
    ) -> LedgerResult<Page<ApprovalRequest>>;
}

#[async_trait]
pub trait InventoryTxStore: Send {
    async fn insert_inventory_tx(&mut self, entry: &InventoryTransaction) -> LedgerResult<()>;
    /// Ledger entries of one product, newest first.
    async fn list_inventory_txs(
        &mut self,
        product_id: Uuid,
        page: PageRequest,
    ) -> LedgerResult<Page<InventoryTransaction>>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvoiceFilter {
    pub reference_type: Option<ReferenceType>,
    /// Substring of the invoice number.
    pub invoice_no: Option<String>,
}

#[async_trait]
pub trait InvoiceStore: Send {
    /// Transaction-scoped advisory lock keyed by `prefix`.
    async fn lock_invoice_sequence(&mut self, prefix: &str) -> LedgerResult<()>;
    async fn count_invoices_with_prefix(&mut self, prefix: &str) -> LedgerResult<i64>;
    async fn insert_invoice(&mut self, invoice: &Invoice) -> LedgerResult<()>;
    async fn find_invoice(&mut self, id: Uuid) -> LedgerResult<Option<Invoice>>;
    async fn list_invoices(&mut self, filter: &InvoiceFilter, page: PageRequest) -> LedgerResult<Page<Invoice>>;
}

#[async_trait]
pub trait AuditStore: Send {
    async fn insert_audit_log(&mut self, entry: &AuditLog) -> LedgerResult<()>;
    async fn list_audit_logs(&mut self, page: PageRequest) -> LedgerResult<Page<AuditLog>>;
    /// Oldest first.
    async fn audit_logs_for(&mut self, entity_id: &str) -> LedgerResult<Vec<AuditLog>>;
}

#[async_trait]
pub trait TaxRuleStore: Send {
    async fn find_tax_rule(&mut self, id: Uuid) -> LedgerResult<Option<TaxRule>>;
    /// Latest rule of `tax_type` in force on `date`.
    async fn find_active_tax_rule(&mut self, tax_type: TaxType, date: NaiveDate) -> LedgerResult<Option<TaxRule>>;
    async fn insert_tax_rule(&mut self, rule: &TaxRule) -> LedgerResult<()>;
    /// Rewrites rate, validity and description; requests filed earlier pick up the change.
    async fn update_tax_rule(&mut self, rule: &TaxRule) -> LedgerResult<()>;
    async fn delete_tax_rule(&mut self, id: Uuid) -> LedgerResult<()>;
}

#[async_trait]
pub trait Session:
    ProductStore
    + OrderStore
    + ExpenseStore
    + ApprovalStore
    + InventoryTxStore
    + InvoiceStore
    + AuditStore
    + TaxRuleStore
    + Send
{
    /// No-op on autocommit sessions.
    async fn commit(&mut self) -> LedgerResult<()>;
    async fn rollback(&mut self) -> LedgerResult<()>;
}

//! In-process store used by the test suites.
//!
//! Transactions are serialized by a single writer lock and work on a private
//! copy of the tables; commit publishes the copy, rollback throws it away.
//! Autocommit sessions never wait for the writer lock, so a best-effort write
//! issued while a transaction is open still lands immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::NaiveDate;
use ledger_shared::{ApprovalStatus, OrderStatus, Page, PageRequest, TaxType};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::{
    ApprovalStore, AuditStore, Database, ExpenseStore, InventoryTxStore, InvoiceFilter, InvoiceStore,
    OrderStore, ProductStore, Session, TaxRuleStore,
};
use crate::error::{LedgerError, LedgerResult};
use crate::models::*;

macro_rules! tables {
    ($($field:ident: $row:ty),+ $(,)?) => {
        #[derive(Debug, Clone, Default)]
        pub struct Tables {
            $(pub $field: Vec<$row>,)+
        }

        #[derive(Debug, Clone, Copy, Default)]
        struct Marks {
            $($field: usize,)+
        }

        impl Tables {
            fn marks(&self) -> Marks {
                Marks { $($field: self.$field.len(),)+ }
            }

            /// Appends rows that autocommit sessions inserted after `since` was taken.
            fn carry_appended(&mut self, committed: &Tables, since: Marks) {
                $(self.$field.extend(committed.$field.iter().skip(since.$field).cloned());)+
            }
        }
    };
}

tables! {
    products: Product,
    orders: Order,
    order_items: OrderItem,
    inventory_transactions: InventoryTransaction,
    expenses: Expense,
    approval_requests: ApprovalRequest,
    invoices: Invoice,
    audit_logs: AuditLog,
    tax_rules: TaxRule,
}

#[derive(Clone, Default)]
pub struct MemoryDatabase {
    committed: Arc<Mutex<Tables>>,
    writer: Arc<tokio::sync::Mutex<()>>,
    fail_audit: Arc<AtomicBool>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent audit insert fail until switched off again.
    pub fn set_audit_failure(&self, fail: bool) {
        self.fail_audit.store(fail, Ordering::SeqCst);
    }

    /// Copy of the committed state.
    pub fn snapshot(&self) -> Tables {
        lock(&self.committed).clone()
    }

    fn session(&self, mode: Mode) -> Box<dyn Session> {
        Box::new(MemorySession {
            committed: self.committed.clone(),
            fail_audit: self.fail_audit.clone(),
            mode,
        })
    }
}

fn lock(tables: &Mutex<Tables>) -> MutexGuard<'_, Tables> {
    tables.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn begin(&self) -> LedgerResult<Box<dyn Session>> {
        let guard = self.writer.clone().lock_owned().await;
        let (work, marks) = {
            let committed = lock(&self.committed);
            (committed.clone(), committed.marks())
        };
        Ok(self.session(Mode::Tx { _guard: guard, work, marks }))
    }

    async fn connect(&self) -> LedgerResult<Box<dyn Session>> {
        Ok(self.session(Mode::Autocommit))
    }
}

enum Mode {
    Autocommit,
    Tx {
        _guard: OwnedMutexGuard<()>,
        work: Tables,
        marks: Marks,
    },
    Closed,
}

pub struct MemorySession {
    committed: Arc<Mutex<Tables>>,
    fail_audit: Arc<AtomicBool>,
    mode: Mode,
}

impl MemorySession {
    fn with_tables<R>(&mut self, f: impl FnOnce(&mut Tables) -> LedgerResult<R>) -> LedgerResult<R> {
        match &mut self.mode {
            Mode::Tx { work, .. } => f(work),
            Mode::Autocommit => f(&mut lock(&self.committed)),
            Mode::Closed => Err(LedgerError::Fatal("session used after commit or rollback".to_string())),
        }
    }

    fn find<T: Clone>(rows: &[T], pred: impl Fn(&T) -> bool) -> Option<T> {
        rows.iter().find(|row| pred(row)).cloned()
    }
}

fn paginate<T: Clone>(rows: Vec<T>, page: PageRequest) -> Page<T> {
    let total = rows.len() as i64;
    let items = rows
        .into_iter()
        .skip(page.offset() as usize)
        .take(page.limit as usize)
        .collect();
    Page::new(items, total, page)
}

fn duplicate(constraint: &str, value: &str) -> LedgerError {
    LedgerError::DuplicateReference(format!("{}: {}", constraint, value))
}

#[async_trait]
impl Session for MemorySession {
    async fn commit(&mut self) -> LedgerResult<()> {
        match std::mem::replace(&mut self.mode, Mode::Closed) {
            Mode::Tx { mut work, marks, _guard } => {
                let mut committed = lock(&self.committed);
                work.carry_appended(&committed, marks);
                *committed = work;
                Ok(())
            }
            Mode::Autocommit => {
                self.mode = Mode::Autocommit;
                Ok(())
            }
            Mode::Closed => Err(LedgerError::Fatal("transaction already finished".to_string())),
        }
    }

    async fn rollback(&mut self) -> LedgerResult<()> {
        match std::mem::replace(&mut self.mode, Mode::Closed) {
            Mode::Tx { .. } => Ok(()),
            Mode::Autocommit => {
                self.mode = Mode::Autocommit;
                Ok(())
            }
            Mode::Closed => Err(LedgerError::Fatal("transaction already finished".to_string())),
        }
    }
}

#[async_trait]
impl ProductStore for MemorySession {
    async fn find_product(&mut self, id: Uuid) -> LedgerResult<Option<Product>> {
        self.with_tables(|t| Ok(Self::find(&t.products, |p| p.id == id)))
    }

    async fn lock_product(&mut self, id: Uuid) -> LedgerResult<Option<Product>> {
        self.find_product(id).await
    }

    async fn set_stock(&mut self, id: Uuid, stock: i32) -> LedgerResult<()> {
        self.with_tables(|t| {
            if stock < 0 {
                return Err(LedgerError::Fatal(format!(
                    "products_current_stock_check violated for product {}",
                    id
                )));
            }
            let product = t
                .products
                .iter_mut()
                .find(|p| p.id == id)
                .ok_or_else(|| LedgerError::not_found("product", id))?;
            product.current_stock = stock;
            product.updated_at = chrono::Utc::now();
            Ok(())
        })
    }

    async fn insert_product(&mut self, product: &Product) -> LedgerResult<()> {
        self.with_tables(|t| {
            if t.products.iter().any(|p| p.sku == product.sku) {
                return Err(duplicate("products_sku_key", &product.sku));
            }
            t.products.push(product.clone());
            Ok(())
        })
    }

    async fn list_products(&mut self, page: PageRequest) -> LedgerResult<Page<Product>> {
        self.with_tables(|t| {
            let mut rows = t.products.clone();
            rows.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
            Ok(paginate(rows, page))
        })
    }
}

#[async_trait]
impl OrderStore for MemorySession {
    async fn insert_order(&mut self, order: &Order, items: &[OrderItem]) -> LedgerResult<()> {
        self.with_tables(|t| {
            if t.orders.iter().any(|o| o.order_code == order.order_code) {
                return Err(duplicate("orders_order_code_key", &order.order_code));
            }
            t.orders.push(order.clone());
            t.order_items.extend(items.iter().cloned());
            Ok(())
        })
    }

    async fn find_order(&mut self, id: Uuid) -> LedgerResult<Option<Order>> {
        self.with_tables(|t| Ok(Self::find(&t.orders, |o| o.id == id)))
    }

    async fn lock_order(&mut self, id: Uuid) -> LedgerResult<Option<Order>> {
        self.find_order(id).await
    }

    async fn order_items(&mut self, order_id: Uuid) -> LedgerResult<Vec<OrderItem>> {
        self.with_tables(|t| {
            let mut items: Vec<OrderItem> = t
                .order_items
                .iter()
                .filter(|i| i.order_id == order_id)
                .cloned()
                .collect();
            items.sort_by_key(|i| i.line_no);
            Ok(items)
        })
    }

    async fn set_order_status(&mut self, id: Uuid, status: OrderStatus) -> LedgerResult<()> {
        self.with_tables(|t| {
            let order = t
                .orders
                .iter_mut()
                .find(|o| o.id == id)
                .ok_or_else(|| LedgerError::not_found("order", id))?;
            order.status = status.as_str().to_string();
            order.updated_at = chrono::Utc::now();
            Ok(())
        })
    }
}

#[async_trait]
impl ExpenseStore for MemorySession {
    async fn insert_expense(&mut self, expense: &Expense) -> LedgerResult<()> {
        self.with_tables(|t| {
            t.expenses.push(expense.clone());
            Ok(())
        })
    }

    async fn find_expense(&mut self, id: Uuid) -> LedgerResult<Option<Expense>> {
        self.with_tables(|t| Ok(Self::find(&t.expenses, |e| e.id == id)))
    }
}

#[async_trait]
impl ApprovalStore for MemorySession {
    async fn insert_approval_request(&mut self, request: &ApprovalRequest) -> LedgerResult<()> {
        self.with_tables(|t| {
            t.approval_requests.push(request.clone());
            Ok(())
        })
    }

    async fn find_approval_request(&mut self, id: Uuid) -> LedgerResult<Option<ApprovalRequest>> {
        self.with_tables(|t| Ok(Self::find(&t.approval_requests, |r| r.id == id)))
    }

    async fn lock_approval_request(&mut self, id: Uuid) -> LedgerResult<Option<ApprovalRequest>> {
        self.find_approval_request(id).await
    }

    async fn update_approval_request(&mut self, request: &ApprovalRequest) -> LedgerResult<()> {
        self.with_tables(|t| {
            let row = t
                .approval_requests
                .iter_mut()
                .find(|r| r.id == request.id)
                .ok_or_else(|| LedgerError::not_found("approval request", request.id))?;
            *row = request.clone();
            Ok(())
        })
    }

    async fn list_approval_requests(
        &mut self,
        status: Option<ApprovalStatus>,
        page: PageRequest,
    ) -> LedgerResult<Page<ApprovalRequest>> {
        self.with_tables(|t| {
            let rows = t
                .approval_requests
                .iter()
                .rev()
                .filter(|r| status.map_or(true, |s| r.status == s.as_str()))
                .cloned()
                .collect();
            Ok(paginate(rows, page))
        })
    }
}

#[async_trait]
impl InventoryTxStore for MemorySession {
    async fn insert_inventory_tx(&mut self, entry: &InventoryTransaction) -> LedgerResult<()> {
        self.with_tables(|t| {
            t.inventory_transactions.push(entry.clone());
            Ok(())
        })
    }

    async fn list_inventory_txs(
        &mut self,
        product_id: Uuid,
        page: PageRequest,
    ) -> LedgerResult<Page<InventoryTransaction>> {
        self.with_tables(|t| {
            let rows = t
                .inventory_transactions
                .iter()
                .rev()
                .filter(|e| e.product_id == product_id)
                .cloned()
                .collect();
            Ok(paginate(rows, page))
        })
    }
}

#[async_trait]
impl InvoiceStore for MemorySession {
    async fn lock_invoice_sequence(&mut self, _prefix: &str) -> LedgerResult<()> {
        match self.mode {
            Mode::Tx { .. } => Ok(()),
            _ => Err(LedgerError::Fatal(
                "advisory lock requested outside a transaction".to_string(),
            )),
        }
    }

    async fn count_invoices_with_prefix(&mut self, prefix: &str) -> LedgerResult<i64> {
        self.with_tables(|t| {
            Ok(t.invoices
                .iter()
                .filter(|i| i.invoice_no.starts_with(prefix))
                .count() as i64)
        })
    }

    async fn insert_invoice(&mut self, invoice: &Invoice) -> LedgerResult<()> {
        self.with_tables(|t| {
            if t.invoices.iter().any(|i| i.invoice_no == invoice.invoice_no) {
                return Err(duplicate("invoices_invoice_no_key", &invoice.invoice_no));
            }
            t.invoices.push(invoice.clone());
            Ok(())
        })
    }

    async fn find_invoice(&mut self, id: Uuid) -> LedgerResult<Option<Invoice>> {
        self.with_tables(|t| Ok(Self::find(&t.invoices, |i| i.id == id)))
    }

    async fn list_invoices(&mut self, filter: &InvoiceFilter, page: PageRequest) -> LedgerResult<Page<Invoice>> {
        self.with_tables(|t| {
            let rows = t
                .invoices
                .iter()
                .rev()
                .filter(|i| {
                    filter
                        .reference_type
                        .map_or(true, |r| i.reference_type == r.as_str())
                })
                .filter(|i| {
                    filter
                        .invoice_no
                        .as_deref()
                        .map_or(true, |needle| i.invoice_no.contains(needle))
                })
                .cloned()
                .collect();
            Ok(paginate(rows, page))
        })
    }
}

#[async_trait]
impl AuditStore for MemorySession {
    async fn insert_audit_log(&mut self, entry: &AuditLog) -> LedgerResult<()> {
        if self.fail_audit.load(Ordering::SeqCst) {
            return Err(LedgerError::Transient("audit store unavailable".to_string()));
        }
        self.with_tables(|t| {
            t.audit_logs.push(entry.clone());
            Ok(())
        })
    }

    async fn list_audit_logs(&mut self, page: PageRequest) -> LedgerResult<Page<AuditLog>> {
        self.with_tables(|t| Ok(paginate(t.audit_logs.iter().rev().cloned().collect(), page)))
    }

    async fn audit_logs_for(&mut self, entity_id: &str) -> LedgerResult<Vec<AuditLog>> {
        self.with_tables(|t| {
            Ok(t.audit_logs
                .iter()
                .filter(|e| e.entity_id == entity_id)
                .cloned()
                .collect())
        })
    }
}

#[async_trait]
impl TaxRuleStore for MemorySession {
    async fn find_tax_rule(&mut self, id: Uuid) -> LedgerResult<Option<TaxRule>> {
        self.with_tables(|t| Ok(Self::find(&t.tax_rules, |r| r.id == id)))
    }

    async fn find_active_tax_rule(&mut self, tax_type: TaxType, date: NaiveDate) -> LedgerResult<Option<TaxRule>> {
        self.with_tables(|t| {
            Ok(t.tax_rules
                .iter()
                .filter(|r| r.tax_type == tax_type.as_str() && r.is_active_on(date))
                .max_by_key(|r| r.effective_from)
                .cloned())
        })
    }

    async fn insert_tax_rule(&mut self, rule: &TaxRule) -> LedgerResult<()> {
        self.with_tables(|t| {
            t.tax_rules.push(rule.clone());
            Ok(())
        })
    }

    async fn update_tax_rule(&mut self, rule: &TaxRule) -> LedgerResult<()> {
        self.with_tables(|t| {
            let stored = t
                .tax_rules
                .iter_mut()
                .find(|r| r.id == rule.id)
                .ok_or_else(|| LedgerError::not_found("tax rule", rule.id))?;
            stored.rate = rule.rate.clone();
            stored.effective_from = rule.effective_from;
            stored.effective_to = rule.effective_to;
            stored.description = rule.description.clone();
            Ok(())
        })
    }

    async fn delete_tax_rule(&mut self, id: Uuid) -> LedgerResult<()> {
        self.with_tables(|t| {
            let before = t.tax_rules.len();
            t.tax_rules.retain(|r| r.id != id);
            if t.tax_rules.len() == before {
                return Err(LedgerError::not_found("tax rule", id));
            }
            Ok(())
        })
    }
}

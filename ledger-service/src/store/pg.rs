use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use diesel::prelude::*;
use diesel::sql_types::Text;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AnsiTransactionManager, AsyncPgConnection, RunQueryDsl, TransactionManager};
use ledger_shared::{ApprovalStatus, OrderStatus, Page, PageRequest, TaxType};
use tracing::debug;
use uuid::Uuid;

use super::{
    ApprovalStore, AuditStore, Database, ExpenseStore, InventoryTxStore, InvoiceFilter, InvoiceStore,
    OrderStore, ProductStore, Session, TaxRuleStore,
};
use crate::error::{LedgerError, LedgerResult};
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

pub async fn build_pool(database_url: &str, max_size: u32) -> LedgerResult<DbPool> {
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    Pool::builder()
        .max_size(max_size)
        .build(config)
        .await
        .map_err(|e| LedgerError::Transient(format!("connection pool: {}", e)))
}

#[derive(Clone)]
pub struct PgDatabase {
    pool: DbPool,
}

impl PgDatabase {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn begin(&self) -> LedgerResult<Box<dyn Session>> {
        let mut conn = self.pool.get_owned().await?;
        <AnsiTransactionManager as TransactionManager<AsyncPgConnection>>::begin_transaction(&mut *conn).await?;
        Ok(Box::new(PgSession { conn, in_tx: true }))
    }

    async fn connect(&self) -> LedgerResult<Box<dyn Session>> {
        let conn = self.pool.get_owned().await?;
        Ok(Box::new(PgSession { conn, in_tx: false }))
    }
}

/// A pooled connection. Dropped with a transaction still open, the pool
/// sees a broken transaction manager and discards the connection.
pub struct PgSession {
    conn: PooledConnection<'static, AsyncPgConnection>,
    in_tx: bool,
}

impl PgSession {
    fn conn(&mut self) -> &mut AsyncPgConnection {
        &mut self.conn
    }
}

#[async_trait]
impl Session for PgSession {
    async fn commit(&mut self) -> LedgerResult<()> {
        if !self.in_tx {
            return Ok(());
        }
        self.in_tx = false;
        <AnsiTransactionManager as TransactionManager<AsyncPgConnection>>::commit_transaction(self.conn()).await?;
        Ok(())
    }

    async fn rollback(&mut self) -> LedgerResult<()> {
        if !self.in_tx {
            return Ok(());
        }
        self.in_tx = false;
        <AnsiTransactionManager as TransactionManager<AsyncPgConnection>>::rollback_transaction(self.conn()).await?;
        Ok(())
    }
}

#[async_trait]
impl ProductStore for PgSession {
    async fn find_product(&mut self, id: Uuid) -> LedgerResult<Option<Product>> {
        let product = products::table
            .find(id)
            .select(Product::as_select())
            .get_result(self.conn())
            .await
            .optional()?;
        Ok(product)
    }

    async fn lock_product(&mut self, id: Uuid) -> LedgerResult<Option<Product>> {
        let product = products::table
            .find(id)
            .select(Product::as_select())
            .for_update()
            .get_result(self.conn())
            .await
            .optional()?;
        Ok(product)
    }

    async fn set_stock(&mut self, id: Uuid, stock: i32) -> LedgerResult<()> {
        diesel::update(products::table.find(id))
            .set((products::current_stock.eq(stock), products::updated_at.eq(Utc::now())))
            .execute(self.conn())
            .await?;
        Ok(())
    }

    async fn insert_product(&mut self, product: &Product) -> LedgerResult<()> {
        diesel::insert_into(products::table)
            .values(product)
            .execute(self.conn())
            .await?;
        Ok(())
    }

    async fn list_products(&mut self, page: PageRequest) -> LedgerResult<Page<Product>> {
        let total = products::table.count().get_result::<i64>(self.conn()).await?;
        let items = products::table
            .select(Product::as_select())
            .order((products::name.asc(), products::id.asc()))
            .limit(page.limit)
            .offset(page.offset())
            .load(self.conn())
            .await?;
        Ok(Page::new(items, total, page))
    }
}

#[async_trait]
impl OrderStore for PgSession {
    async fn insert_order(&mut self, order: &Order, items: &[OrderItem]) -> LedgerResult<()> {
        diesel::insert_into(orders::table)
            .values(order)
            .execute(self.conn())
            .await?;
        diesel::insert_into(order_items::table)
            .values(items)
            .execute(self.conn())
            .await?;
        Ok(())
    }

    async fn find_order(&mut self, id: Uuid) -> LedgerResult<Option<Order>> {
        let order = orders::table
            .find(id)
            .select(Order::as_select())
            .get_result(self.conn())
            .await
            .optional()?;
        Ok(order)
    }

    async fn lock_order(&mut self, id: Uuid) -> LedgerResult<Option<Order>> {
        let order = orders::table
            .find(id)
            .select(Order::as_select())
            .for_update()
            .get_result(self.conn())
            .await
            .optional()?;
        Ok(order)
    }

    async fn order_items(&mut self, order_id: Uuid) -> LedgerResult<Vec<OrderItem>> {
        let items = order_items::table
            .filter(order_items::order_id.eq(order_id))
            .order(order_items::line_no.asc())
            .select(OrderItem::as_select())
            .load(self.conn())
            .await?;
        Ok(items)
    }

    async fn set_order_status(&mut self, id: Uuid, status: OrderStatus) -> LedgerResult<()> {
        let updated = diesel::update(orders::table.find(id))
            .set((orders::status.eq(status.as_str()), orders::updated_at.eq(Utc::now())))
            .execute(self.conn())
            .await?;
        if updated == 0 {
            return Err(LedgerError::not_found("order", id));
        }
        Ok(())
    }
}

#[async_trait]
impl ExpenseStore for PgSession {
    async fn insert_expense(&mut self, expense: &Expense) -> LedgerResult<()> {
        diesel::insert_into(expenses::table)
            .values(expense)
            .execute(self.conn())
            .await?;
        Ok(())
    }

    async fn find_expense(&mut self, id: Uuid) -> LedgerResult<Option<Expense>> {
        let expense = expenses::table
            .find(id)
            .select(Expense::as_select())
            .get_result(self.conn())
            .await
            .optional()?;
        Ok(expense)
    }
}

#[async_trait]
impl ApprovalStore for PgSession {
    async fn insert_approval_request(&mut self, request: &ApprovalRequest) -> LedgerResult<()> {
        diesel::insert_into(approval_requests::table)
            .values(request)
            .execute(self.conn())
            .await?;
        Ok(())
    }

    async fn find_approval_request(&mut self, id: Uuid) -> LedgerResult<Option<ApprovalRequest>> {
        let request = approval_requests::table
            .find(id)
            .select(ApprovalRequest::as_select())
            .get_result(self.conn())
            .await
            .optional()?;
        Ok(request)
    }

    async fn lock_approval_request(&mut self, id: Uuid) -> LedgerResult<Option<ApprovalRequest>> {
        let request = approval_requests::table
            .find(id)
            .select(ApprovalRequest::as_select())
            .for_update()
            .get_result(self.conn())
            .await
            .optional()?;
        Ok(request)
    }

    async fn update_approval_request(&mut self, request: &ApprovalRequest) -> LedgerResult<()> {
        diesel::update(approval_requests::table.find(request.id))
            .set((
                approval_requests::status.eq(request.status.as_str()),
                approval_requests::approved_by.eq(request.approved_by),
                approval_requests::approved_at.eq(request.approved_at),
                approval_requests::rejection_reason.eq(request.rejection_reason.as_deref()),
                approval_requests::updated_at.eq(request.updated_at),
            ))
            .execute(self.conn())
            .await?;
        Ok(())
    }

    async fn list_approval_requests(
        &mut self,
        status: Option<ApprovalStatus>,
        page: PageRequest,
    ) -> LedgerResult<Page<ApprovalRequest>> {
        let mut count_query = approval_requests::table.count().into_boxed();
        let mut query = approval_requests::table
            .select(ApprovalRequest::as_select())
            .into_boxed();
        if let Some(status) = status {
            count_query = count_query.filter(approval_requests::status.eq(status.as_str()));
            query = query.filter(approval_requests::status.eq(status.as_str()));
        }

        let total = count_query.get_result::<i64>(self.conn()).await?;
        let items = query
            .order((approval_requests::created_at.desc(), approval_requests::id.asc()))
            .limit(page.limit)
            .offset(page.offset())
            .load(self.conn())
            .await?;
        Ok(Page::new(items, total, page))
    }
}

#[async_trait]
impl InventoryTxStore for PgSession {
    async fn insert_inventory_tx(&mut self, entry: &InventoryTransaction) -> LedgerResult<()> {
        diesel::insert_into(inventory_transactions::table)
            .values(entry)
            .execute(self.conn())
            .await?;
        Ok(())
    }

    async fn list_inventory_txs(
        &mut self,
        product_id: Uuid,
        page: PageRequest,
    ) -> LedgerResult<Page<InventoryTransaction>> {
        let total = inventory_transactions::table
            .filter(inventory_transactions::product_id.eq(product_id))
            .count()
            .get_result::<i64>(self.conn())
            .await?;
        let items = inventory_transactions::table
            .filter(inventory_transactions::product_id.eq(product_id))
            .order(inventory_transactions::created_at.desc())
            .limit(page.limit)
            .offset(page.offset())
            .select(InventoryTransaction::as_select())
            .load(self.conn())
            .await?;
        Ok(Page::new(items, total, page))
    }
}

#[async_trait]
impl InvoiceStore for PgSession {
    async fn lock_invoice_sequence(&mut self, prefix: &str) -> LedgerResult<()> {
        debug!(prefix, "acquiring invoice sequence lock");
        diesel::sql_query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind::<Text, _>(prefix)
            .execute(self.conn())
            .await?;
        Ok(())
    }

    async fn count_invoices_with_prefix(&mut self, prefix: &str) -> LedgerResult<i64> {
        let count = invoices::table
            .filter(invoices::invoice_no.like(format!("{}%", prefix)))
            .count()
            .get_result::<i64>(self.conn())
            .await?;
        Ok(count)
    }

    async fn insert_invoice(&mut self, invoice: &Invoice) -> LedgerResult<()> {
        diesel::insert_into(invoices::table)
            .values(invoice)
            .execute(self.conn())
            .await?;
        Ok(())
    }

    async fn find_invoice(&mut self, id: Uuid) -> LedgerResult<Option<Invoice>> {
        let invoice = invoices::table
            .find(id)
            .select(Invoice::as_select())
            .get_result(self.conn())
            .await
            .optional()?;
        Ok(invoice)
    }

    async fn list_invoices(&mut self, filter: &InvoiceFilter, page: PageRequest) -> LedgerResult<Page<Invoice>> {
        let mut count_query = invoices::table.count().into_boxed();
        let mut query = invoices::table.select(Invoice::as_select()).into_boxed();
        if let Some(reference_type) = filter.reference_type {
            count_query = count_query.filter(invoices::reference_type.eq(reference_type.as_str()));
            query = query.filter(invoices::reference_type.eq(reference_type.as_str()));
        }
        if let Some(needle) = filter.invoice_no.as_deref().filter(|n| !n.is_empty()) {
            let pattern = format!("%{}%", needle);
            count_query = count_query.filter(invoices::invoice_no.like(pattern.clone()));
            query = query.filter(invoices::invoice_no.like(pattern));
        }

        let total = count_query.get_result::<i64>(self.conn()).await?;
        let items = query
            .order(invoices::created_at.desc())
            .limit(page.limit)
            .offset(page.offset())
            .load(self.conn())
            .await?;
        Ok(Page::new(items, total, page))
    }
}

#[async_trait]
impl AuditStore for PgSession {
    async fn insert_audit_log(&mut self, entry: &AuditLog) -> LedgerResult<()> {
        diesel::insert_into(audit_logs::table)
            .values(entry)
            .execute(self.conn())
            .await?;
        Ok(())
    }

    async fn list_audit_logs(&mut self, page: PageRequest) -> LedgerResult<Page<AuditLog>> {
        let total = audit_logs::table.count().get_result::<i64>(self.conn()).await?;
        let items = audit_logs::table
            .select(AuditLog::as_select())
            .order(audit_logs::created_at.desc())
            .limit(page.limit)
            .offset(page.offset())
            .load(self.conn())
            .await?;
        Ok(Page::new(items, total, page))
    }

    async fn audit_logs_for(&mut self, entity_id: &str) -> LedgerResult<Vec<AuditLog>> {
        let items = audit_logs::table
            .filter(audit_logs::entity_id.eq(entity_id))
            .order(audit_logs::created_at.asc())
            .select(AuditLog::as_select())
            .load(self.conn())
            .await?;
        Ok(items)
    }
}

#[async_trait]
impl TaxRuleStore for PgSession {
    async fn find_tax_rule(&mut self, id: Uuid) -> LedgerResult<Option<TaxRule>> {
        let rule = tax_rules::table
            .find(id)
            .select(TaxRule::as_select())
            .get_result(self.conn())
            .await
            .optional()?;
        Ok(rule)
    }

    async fn find_active_tax_rule(&mut self, tax_type: TaxType, date: NaiveDate) -> LedgerResult<Option<TaxRule>> {
        let rule = tax_rules::table
            .filter(tax_rules::tax_type.eq(tax_type.as_str()))
            .filter(tax_rules::effective_from.le(date))
            .filter(tax_rules::effective_to.is_null().or(tax_rules::effective_to.ge(date)))
            .order(tax_rules::effective_from.desc())
            .select(TaxRule::as_select())
            .first(self.conn())
            .await
            .optional()?;
        Ok(rule)
    }

    async fn insert_tax_rule(&mut self, rule: &TaxRule) -> LedgerResult<()> {
        diesel::insert_into(tax_rules::table)
            .values(rule)
            .execute(self.conn())
            .await?;
        Ok(())
    }

    async fn update_tax_rule(&mut self, rule: &TaxRule) -> LedgerResult<()> {
        let updated = diesel::update(tax_rules::table.find(rule.id))
            .set((
                tax_rules::rate.eq(&rule.rate),
                tax_rules::effective_from.eq(rule.effective_from),
                tax_rules::effective_to.eq(rule.effective_to),
                tax_rules::description.eq(&rule.description),
            ))
            .execute(self.conn())
            .await?;
        if updated == 0 {
            return Err(LedgerError::not_found("tax rule", rule.id));
        }
        Ok(())
    }

    async fn delete_tax_rule(&mut self, id: Uuid) -> LedgerResult<()> {
        let deleted = diesel::delete(tax_rules::table.find(id))
            .execute(self.conn())
            .await?;
        if deleted == 0 {
            return Err(LedgerError::not_found("tax rule", id));
        }
        Ok(())
    }
}

use chrono::Utc;
use ledger_shared::{Page, PageRequest, StockChanged};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::models::{InventoryTransaction, Order, OrderItem, Product};
use crate::store::{InventoryTxStore, ProductStore};
use crate::uow::{ExecContext, TxManager};

/// Owns every change to `products.current_stock` and the ledger entry that
/// explains it.
#[derive(Clone)]
pub struct InventoryLedger {
    tx: TxManager,
}

impl InventoryLedger {
    pub fn new(tx: TxManager) -> Self {
        Self { tx }
    }

    /// Applies `delta` to the product's stock under its row lock and appends a
    /// ledger entry. Must run inside the caller's unit of work.
    pub(crate) async fn adjust_stock(
        &self,
        ctx: &mut ExecContext,
        product_id: Uuid,
        delta: i32,
        order_id: Option<Uuid>,
    ) -> LedgerResult<i32> {
        if delta == 0 {
            return Err(LedgerError::Validation(format!(
                "stock adjustment for product {} must not be zero",
                product_id
            )));
        }

        let session = ctx.require_tx()?;
        let product = session
            .lock_product(product_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("product", product_id))?;

        let stock_after = i64::from(product.current_stock) + i64::from(delta);
        if delta < 0 && stock_after < 0 {
            return Err(LedgerError::InsufficientStock {
                product_id,
                product: product.name,
                have: product.current_stock,
                want: delta.saturating_neg(),
            });
        }
        let stock_after = i32::try_from(stock_after).map_err(|_| {
            LedgerError::Fatal(format!("stock of product {} overflows", product_id))
        })?;
        if stock_after < 0 {
            return Err(LedgerError::Fatal(format!(
                "product {} would end with negative stock {}",
                product_id, stock_after
            )));
        }

        session.set_stock(product_id, stock_after).await?;
        session
            .insert_inventory_tx(&InventoryTransaction::record(product_id, order_id, delta, stock_after))
            .await?;

        ctx.defer_notification(StockChanged {
            product_id,
            new_stock: stock_after,
            order_id,
            occurred_at: Utc::now(),
        });
        info!(
            "Stock of {} moved by {} to {} (order {:?})",
            product_id, delta, stock_after, order_id
        );
        Ok(stock_after)
    }

    /// Adjusts stock for every line of an approved order, in line order.
    pub(crate) async fn apply_order(
        &self,
        ctx: &mut ExecContext,
        order: &Order,
        items: &[OrderItem],
    ) -> LedgerResult<Vec<i32>> {
        let direction = order.direction()?;
        let mut levels = Vec::with_capacity(items.len());
        for item in items {
            let level = self
                .adjust_stock(ctx, item.product_id, direction.signed(item.quantity), Some(order.id))
                .await?;
            levels.push(level);
        }
        Ok(levels)
    }

    pub async fn get_product(&self, ctx: &mut ExecContext, id: Uuid) -> LedgerResult<Product> {
        self.tx
            .session(ctx)
            .await?
            .find_product(id)
            .await?
            .ok_or_else(|| LedgerError::not_found("product", id))
    }

    pub async fn list_products(&self, ctx: &mut ExecContext, page: PageRequest) -> LedgerResult<Page<Product>> {
        self.tx.session(ctx).await?.list_products(page).await
    }

    /// Ledger entries of one product, newest first.
    #[instrument(skip(self, ctx))]
    pub async fn stock_card(
        &self,
        ctx: &mut ExecContext,
        product_id: Uuid,
        page: PageRequest,
    ) -> LedgerResult<Page<InventoryTransaction>> {
        let session = self.tx.session(ctx).await?;
        if session.find_product(product_id).await?.is_none() {
            return Err(LedgerError::not_found("product", product_id));
        }
        session.list_inventory_txs(product_id, page).await
    }
}

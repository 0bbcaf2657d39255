//! Creation of the records that later go through approval. Nothing here
//! touches stock or invoices.

use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::Utc;
use ledger_shared::*;
use num_traits::{One, Zero};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::approval::ApprovalWorkflow;
use crate::audit::{AuditEntry, AuditRecorder};
use crate::error::{LedgerError, LedgerResult};
use crate::invoice::MONEY_SCALE;
use crate::models::{ApprovalRequest, ApprovalSubject, Expense, Order, OrderItem, Product};
use crate::store::{ExpenseStore, OrderStore, ProductStore};
use crate::tax::TaxService;
use crate::uow::{ExecContext, TxManager};
use crate::Clock;

/// Fractional digits kept for `expenses.exchange_rate`.
const EXCHANGE_RATE_SCALE: i64 = 6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProductRequest {
    pub sku: String,
    pub name: String,
    pub price: BigDecimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOrderItem {
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price: BigDecimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOrderRequest {
    pub order_code: String,
    #[serde(rename = "type")]
    pub direction: OrderDirection,
    #[serde(default)]
    pub note: String,
    pub items: Vec<NewOrderItem>,
    #[serde(default)]
    pub tax_rule_id: Option<String>,
    #[serde(default)]
    pub side_fees: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewExpenseRequest {
    pub currency: String,
    pub exchange_rate: BigDecimal,
    pub original_amount: BigDecimal,
    #[serde(default)]
    pub is_foreign_vendor: bool,
    #[serde(default)]
    pub fct_type: Option<FctType>,
    pub document_type: DocumentType,
    #[serde(default)]
    pub vendor_tax_code: Option<String>,
    #[serde(default)]
    pub document_url: Option<String>,
    #[serde(default)]
    pub order_id: Option<Uuid>,
    #[serde(default)]
    pub vendor_id: Option<Uuid>,
    #[serde(default)]
    pub description: String,
}

/// A freshly created record and the approval request filed for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Submitted<T> {
    pub record: T,
    pub approval: ApprovalRequest,
}

/// Derived amounts of an expense, in USD unless noted.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpenseFigures {
    pub converted_amount_usd: BigDecimal,
    pub fct_rate: BigDecimal,
    pub fct_amount: BigDecimal,
    /// In the original currency.
    pub total_payable: BigDecimal,
    pub vat_rate: BigDecimal,
    pub vat_amount: BigDecimal,
    pub deductible: bool,
}

/// Applies foreign contractor tax and VAT to an expense.
///
/// `fct_rate` is only read for foreign vendors, `vat_rate` only for VAT invoices.
pub fn expense_figures(
    request: &NewExpenseRequest,
    fct_rate: Option<&BigDecimal>,
    vat_rate: Option<&BigDecimal>,
) -> LedgerResult<ExpenseFigures> {
    let converted = &request.original_amount * &request.exchange_rate;
    let zero = BigDecimal::zero();

    let (fct_rate, fct_amount, total_payable) = if request.is_foreign_vendor {
        let rate = fct_rate
            .cloned()
            .ok_or_else(|| LedgerError::Fatal("FCT rate missing for a foreign vendor".to_string()))?;
        let fct_amount = match request.fct_type {
            Some(FctType::Net) => &converted * &rate,
            Some(FctType::Gross) => &converted * &rate / (BigDecimal::one() + &rate),
            None => {
                return Err(LedgerError::Validation(
                    "fct_type must be NET or GROSS for a foreign vendor".to_string(),
                ))
            }
        };
        let total = &request.original_amount + &fct_amount / &request.exchange_rate;
        (rate, fct_amount.round(MONEY_SCALE), total.round(MONEY_SCALE))
    } else {
        (zero.clone(), zero.clone(), request.original_amount.clone())
    };

    let is_vat_invoice = request.document_type == DocumentType::VatInvoice;
    let (vat_rate, vat_amount) = if is_vat_invoice {
        let rate = vat_rate
            .cloned()
            .ok_or_else(|| LedgerError::Fatal("VAT rate missing for a VAT invoice".to_string()))?;
        let amount = (&converted * &rate).round(MONEY_SCALE);
        (rate, amount)
    } else {
        (zero.clone(), zero)
    };

    Ok(ExpenseFigures {
        converted_amount_usd: converted.round(MONEY_SCALE),
        fct_rate,
        fct_amount,
        total_payable,
        vat_rate,
        vat_amount,
        deductible: is_vat_invoice,
    })
}

fn required(field: &str, value: &str) -> LedgerResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(LedgerError::Validation(format!("{} is required", field)));
    }
    Ok(value.to_string())
}

/// Rejects amounts with more fractional digits than the column keeps, so
/// nothing is rounded silently on insert.
fn within_scale(field: &str, value: &BigDecimal, scale: i64) -> LedgerResult<()> {
    let (_, exponent) = value.normalized().as_bigint_and_exponent();
    if exponent > scale {
        return Err(LedgerError::Validation(format!(
            "{} {} has more than {} decimal places",
            field, value, scale
        )));
    }
    Ok(())
}

fn validate_product(request: &NewProductRequest) -> LedgerResult<()> {
    required("sku", &request.sku)?;
    required("name", &request.name)?;
    if request.price < BigDecimal::zero() {
        return Err(LedgerError::Validation("price must not be negative".to_string()));
    }
    within_scale("price", &request.price, MONEY_SCALE)
}

fn validate_order(request: &NewOrderRequest) -> LedgerResult<()> {
    required("order_code", &request.order_code)?;
    if request.items.is_empty() {
        return Err(LedgerError::Validation("an order needs at least one item".to_string()));
    }
    for (idx, item) in request.items.iter().enumerate() {
        if item.quantity <= 0 {
            return Err(LedgerError::Validation(format!("item {}: quantity must be positive", idx + 1)));
        }
        if item.unit_price <= BigDecimal::zero() {
            return Err(LedgerError::Validation(format!("item {}: unit price must be positive", idx + 1)));
        }
        within_scale(&format!("item {}: unit price", idx + 1), &item.unit_price, MONEY_SCALE)?;
    }
    if let Some(raw) = request.tax_rule_id.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
        Uuid::parse_str(raw).map_err(|e| LedgerError::InvalidReference(format!("tax_rule_id {}: {}", raw, e)))?;
    }
    if let Some(raw) = request.side_fees.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
        let fees = BigDecimal::from_str(raw)
            .map_err(|_| LedgerError::Validation(format!("side_fees '{}' is not a decimal", raw)))?;
        if fees < BigDecimal::zero() {
            return Err(LedgerError::Validation("side_fees must not be negative".to_string()));
        }
        within_scale("side_fees", &fees, MONEY_SCALE)?;
    }
    Ok(())
}

fn validate_expense(request: &NewExpenseRequest) -> LedgerResult<()> {
    required("currency", &request.currency)?;
    if request.exchange_rate <= BigDecimal::zero() {
        return Err(LedgerError::Validation("exchange_rate must be greater than 0".to_string()));
    }
    if request.original_amount <= BigDecimal::zero() {
        return Err(LedgerError::Validation("original_amount must be greater than 0".to_string()));
    }
    within_scale("exchange_rate", &request.exchange_rate, EXCHANGE_RATE_SCALE)?;
    within_scale("original_amount", &request.original_amount, MONEY_SCALE)?;
    if request.is_foreign_vendor && request.fct_type.is_none() {
        return Err(LedgerError::Validation(
            "fct_type must be NET or GROSS when is_foreign_vendor is true".to_string(),
        ));
    }
    if request.document_type == DocumentType::VatInvoice
        && request.vendor_tax_code.as_deref().map_or(true, |c| c.trim().is_empty())
    {
        return Err(LedgerError::Validation(
            "vendor_tax_code is required when document_type is VAT_INVOICE".to_string(),
        ));
    }
    Ok(())
}

#[derive(Clone)]
pub struct RequestService {
    tx: TxManager,
    audit: AuditRecorder,
    approvals: ApprovalWorkflow,
    tax: TaxService,
    today: Clock,
}

impl RequestService {
    pub fn new(
        tx: TxManager,
        audit: AuditRecorder,
        approvals: ApprovalWorkflow,
        tax: TaxService,
        today: Clock,
    ) -> Self {
        Self {
            tx,
            audit,
            approvals,
            tax,
            today,
        }
    }

    #[instrument(skip(self, ctx, request), fields(sku = %request.sku))]
    pub async fn create_product(
        &self,
        ctx: &mut ExecContext,
        actor: Option<Uuid>,
        request: NewProductRequest,
    ) -> LedgerResult<Submitted<Product>> {
        validate_product(&request)?;
        let this = self.clone();
        self.tx
            .run_in_tx(ctx, move |ctx| {
                Box::pin(async move {
                    let product = Product::new(request.sku.trim(), request.name.trim(), request.price.clone());
                    ctx.require_tx()?.insert_product(&product).await?;
                    this.audit
                        .log(
                            ctx,
                            AuditEntry::new(actor, AuditAction::CreateProduct, product.id)
                                .named(product.name.clone())
                                .details(serde_json::to_value(&request)?),
                        )
                        .await?;

                    let snapshot = ProductRequestData {
                        sku: product.sku.clone(),
                        name: product.name.clone(),
                        price: product.price.to_string(),
                    };
                    let approval = this
                        .approvals
                        .submit(ctx, ApprovalSubject::Product(product.id), serde_json::to_value(snapshot)?, actor)
                        .await?;
                    info!("Product {} created, pending approval {}", product.sku, approval.id);
                    Ok(Submitted { record: product, approval })
                })
            })
            .await
    }

    #[instrument(skip(self, ctx, request), fields(order_code = %request.order_code))]
    pub async fn create_order(
        &self,
        ctx: &mut ExecContext,
        actor: Option<Uuid>,
        request: NewOrderRequest,
    ) -> LedgerResult<Submitted<Order>> {
        validate_order(&request)?;
        let this = self.clone();
        self.tx
            .run_in_tx(ctx, move |ctx| Box::pin(async move { this.create_order_in_tx(ctx, actor, request).await }))
            .await
    }

    async fn create_order_in_tx(
        &self,
        ctx: &mut ExecContext,
        actor: Option<Uuid>,
        request: NewOrderRequest,
    ) -> LedgerResult<Submitted<Order>> {
        let tax_rule_id = request
            .tax_rule_id
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(Uuid::parse_str)
            .transpose()
            .map_err(|e| LedgerError::InvalidReference(e.to_string()))?;
        if let Some(rule_id) = tax_rule_id {
            self.tax.find_rule(ctx, rule_id).await?;
        }

        let mut snapshot_items = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let product = ctx
                .require_tx()?
                .find_product(item.product_id)
                .await?
                .ok_or_else(|| LedgerError::not_found("product", item.product_id))?;
            snapshot_items.push(OrderItemSnapshot {
                product_id: Some(product.id),
                product_name: product.name,
                quantity: item.quantity,
                unit_price: item.unit_price.to_string(),
            });
        }

        let order = Order::new(request.order_code.trim(), request.direction, request.note.clone());
        let items: Vec<OrderItem> = request
            .items
            .iter()
            .enumerate()
            .map(|(idx, item)| OrderItem {
                id: Uuid::new_v4(),
                order_id: order.id,
                product_id: item.product_id,
                line_no: idx as i32 + 1,
                quantity: item.quantity,
                unit_price: item.unit_price.clone(),
            })
            .collect();
        ctx.require_tx()?.insert_order(&order, &items).await?;

        let snapshot = OrderRequestData {
            order_code: order.order_code.clone(),
            order_type: request.direction.as_str().to_string(),
            note: order.note.clone(),
            items: snapshot_items,
            tax_rule_id: tax_rule_id.map(|id| id.to_string()),
            side_fees: request.side_fees.clone().filter(|f| !f.trim().is_empty()),
        };

        self.audit
            .log(
                ctx,
                AuditEntry::new(actor, request.direction.creation_action(), order.id)
                    .named(order.order_code.clone())
                    .details(json!({
                        "order_code": snapshot.order_code,
                        "type": snapshot.order_type,
                        "note": snapshot.note,
                        "items": snapshot.items,
                    })),
            )
            .await?;

        let approval = self
            .approvals
            .submit(ctx, ApprovalSubject::Order(order.id), serde_json::to_value(&snapshot)?, actor)
            .await?;
        info!(
            "Order {} ({}) created with {} items, pending approval {}",
            order.order_code,
            request.direction,
            items.len(),
            approval.id
        );
        Ok(Submitted { record: order, approval })
    }

    #[instrument(skip(self, ctx, request))]
    pub async fn create_expense(
        &self,
        ctx: &mut ExecContext,
        actor: Option<Uuid>,
        request: NewExpenseRequest,
    ) -> LedgerResult<Submitted<Expense>> {
        validate_expense(&request)?;
        let this = self.clone();
        self.tx
            .run_in_tx(ctx, move |ctx| {
                Box::pin(async move { this.create_expense_in_tx(ctx, actor, request).await })
            })
            .await
    }

    async fn create_expense_in_tx(
        &self,
        ctx: &mut ExecContext,
        actor: Option<Uuid>,
        request: NewExpenseRequest,
    ) -> LedgerResult<Submitted<Expense>> {
        let today = (self.today)();
        let fct_rate = if request.is_foreign_vendor {
            Some(self.tax.calculate_active_tax(ctx, TaxType::Fct, today).await?)
        } else {
            None
        };
        let vat_rate = if request.document_type == DocumentType::VatInvoice {
            let vat_type = if request.is_foreign_vendor {
                TaxType::VatIntl
            } else {
                TaxType::VatInland
            };
            Some(self.tax.calculate_active_tax(ctx, vat_type, today).await?)
        } else {
            None
        };
        let figures = expense_figures(&request, fct_rate.as_ref(), vat_rate.as_ref())?;

        let expense = Expense {
            id: Uuid::new_v4(),
            order_id: request.order_id,
            vendor_id: request.vendor_id,
            currency: request.currency.trim().to_string(),
            exchange_rate: request.exchange_rate.clone(),
            original_amount: request.original_amount.clone(),
            converted_amount_usd: figures.converted_amount_usd,
            is_foreign_vendor: request.is_foreign_vendor,
            fct_type: request
                .fct_type
                .filter(|_| request.is_foreign_vendor)
                .map(|t| t.as_str().to_string()),
            fct_rate: figures.fct_rate,
            fct_amount: figures.fct_amount,
            total_payable: figures.total_payable,
            vat_rate: figures.vat_rate,
            vat_amount: figures.vat_amount,
            document_type: request.document_type.as_str().to_string(),
            vendor_tax_code: request.vendor_tax_code.clone(),
            document_url: request.document_url.clone(),
            is_deductible_expense: figures.deductible,
            description: request.description.clone(),
            created_at: Utc::now(),
        };
        ctx.require_tx()?.insert_expense(&expense).await?;

        self.audit
            .log(
                ctx,
                AuditEntry::new(actor, AuditAction::CreateExpense, expense.id)
                    .named(expense.description.clone())
                    .details(json!({
                        "currency": expense.currency,
                        "exchange_rate": expense.exchange_rate.to_string(),
                        "original_amount": expense.original_amount.to_string(),
                        "is_foreign_vendor": expense.is_foreign_vendor,
                        "document_type": expense.document_type,
                        "description": expense.description,
                    })),
            )
            .await?;

        let snapshot = ExpenseRequestData {
            currency: expense.currency.clone(),
            exchange_rate: expense.exchange_rate.to_string(),
            original_amount: expense.original_amount.to_string(),
            is_foreign_vendor: expense.is_foreign_vendor,
            fct_type: expense.fct_type.clone(),
            document_type: expense.document_type.clone(),
            description: expense.description.clone(),
        };
        let approval = self
            .approvals
            .submit(ctx, ApprovalSubject::Expense(expense.id), serde_json::to_value(snapshot)?, actor)
            .await?;
        info!("Expense {} recorded, pending approval {}", expense.id, approval.id);
        Ok(Submitted { record: expense, approval })
    }
}

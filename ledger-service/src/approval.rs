//! Approval state machine: `PENDING` moves to `APPROVED` or `REJECTED` exactly
//! once, under the request's row lock.

use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::Utc;
use ledger_shared::*;
use num_traits::Zero;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditRecorder};
use crate::error::{LedgerError, LedgerResult};
use crate::inventory::InventoryLedger;
use crate::invoice::{InvoiceAllocator, InvoiceDraft};
use crate::models::{ApprovalRequest, ApprovalSubject, Invoice, OrderItem};
use crate::store::{ApprovalStore, ExpenseStore, OrderStore, ProductStore};
use crate::tax::TaxService;
use crate::uow::{ExecContext, TxManager};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalOutcome {
    pub request: ApprovalRequest,
    /// Present for order and expense approvals.
    pub invoice: Option<Invoice>,
}

#[derive(Clone)]
pub struct ApprovalWorkflow {
    tx: TxManager,
    audit: AuditRecorder,
    inventory: InventoryLedger,
    invoices: InvoiceAllocator,
    tax: TaxService,
}

impl ApprovalWorkflow {
    pub fn new(
        tx: TxManager,
        audit: AuditRecorder,
        inventory: InventoryLedger,
        invoices: InvoiceAllocator,
        tax: TaxService,
    ) -> Self {
        Self {
            tx,
            audit,
            inventory,
            invoices,
            tax,
        }
    }

    /// Files a pending request from untyped input.
    pub async fn create_approval_request(
        &self,
        ctx: &mut ExecContext,
        request_type: &str,
        reference_id: &str,
        snapshot: Value,
        requester: Option<Uuid>,
    ) -> LedgerResult<ApprovalRequest> {
        let request_type = RequestType::from_str(request_type.trim())
            .map_err(|e| LedgerError::Validation(e.to_string()))?;
        let reference_id = Uuid::parse_str(reference_id.trim())
            .map_err(|e| LedgerError::InvalidReference(format!("{}: {}", reference_id, e)))?;
        self.submit(ctx, ApprovalSubject::new(request_type, reference_id), snapshot, requester)
            .await
    }

    /// Files a pending request for an entity that already exists.
    #[instrument(skip(self, ctx, snapshot))]
    pub async fn submit(
        &self,
        ctx: &mut ExecContext,
        subject: ApprovalSubject,
        snapshot: Value,
        requester: Option<Uuid>,
    ) -> LedgerResult<ApprovalRequest> {
        let this = self.clone();
        self.tx
            .run_in_tx(ctx, move |ctx| {
                Box::pin(async move {
                    this.ensure_subject_exists(ctx, subject).await?;
                    let request = ApprovalRequest::pending(subject, snapshot, requester);
                    ctx.require_tx()?.insert_approval_request(&request).await?;
                    this.audit
                        .log(
                            ctx,
                            AuditEntry::new(requester, AuditAction::CreateApprovalRequest, request.id)
                                .named(request.request_type.clone())
                                .details(json!({
                                    "request_type": request.request_type,
                                    "reference_id": request.reference_id,
                                })),
                        )
                        .await?;
                    info!("Approval request {} filed for {:?}", request.id, subject);
                    Ok(request)
                })
            })
            .await
    }

    #[instrument(skip(self, ctx))]
    pub async fn approve(&self, ctx: &mut ExecContext, id: Uuid, approver: Uuid) -> LedgerResult<ApprovalOutcome> {
        let this = self.clone();
        let outcome = self
            .tx
            .run_in_tx(ctx, move |ctx| Box::pin(async move { this.approve_in_tx(ctx, id, approver).await }))
            .await;
        if let Err(e) = &outcome {
            warn!("Approval of request {} failed: {}", id, e);
        }
        outcome
    }

    async fn approve_in_tx(&self, ctx: &mut ExecContext, id: Uuid, approver: Uuid) -> LedgerResult<ApprovalOutcome> {
        let mut request = self.lock_pending(ctx, id).await?;
        request.resolve(ApprovalStatus::Approved, approver, None)?;
        ctx.require_tx()?.update_approval_request(&request).await?;

        let invoice = match request.subject()? {
            ApprovalSubject::Order(order_id) => Some(self.realize_order(ctx, &request, order_id, approver).await?),
            ApprovalSubject::Expense(expense_id) => {
                Some(self.realize_expense(ctx, &request, expense_id, approver).await?)
            }
            // The product row was created with the request; approval only confirms it.
            ApprovalSubject::Product(product_id) => {
                self.ensure_subject_exists(ctx, ApprovalSubject::Product(product_id)).await?;
                None
            }
        };

        self.audit
            .log(
                ctx,
                AuditEntry::new(Some(approver), AuditAction::ApproveRequest, request.id)
                    .named(request.request_type.clone())
                    .details(json!({
                        "request_type": request.request_type,
                        "reference_id": request.reference_id,
                        "invoice_no": invoice.as_ref().map(|i| i.invoice_no.clone()),
                    })),
            )
            .await?;

        info!("Approval request {} approved by {}", request.id, approver);
        Ok(ApprovalOutcome { request, invoice })
    }

    #[instrument(skip(self, ctx, reason))]
    pub async fn reject(
        &self,
        ctx: &mut ExecContext,
        id: Uuid,
        approver: Uuid,
        reason: String,
    ) -> LedgerResult<ApprovalRequest> {
        let this = self.clone();
        self.tx
            .run_in_tx(ctx, move |ctx| {
                Box::pin(async move { this.reject_in_tx(ctx, id, approver, reason).await })
            })
            .await
    }

    async fn reject_in_tx(
        &self,
        ctx: &mut ExecContext,
        id: Uuid,
        approver: Uuid,
        reason: String,
    ) -> LedgerResult<ApprovalRequest> {
        let mut request = self.lock_pending(ctx, id).await?;
        request.resolve(ApprovalStatus::Rejected, approver, Some(reason.clone()))?;
        ctx.require_tx()?.update_approval_request(&request).await?;

        if let ApprovalSubject::Order(order_id) = request.subject()? {
            let session = ctx.require_tx()?;
            let order = session
                .lock_order(order_id)
                .await?
                .ok_or_else(|| LedgerError::not_found("order", order_id))?;
            ensure_order_pending(order.id, order.status()?)?;
            session.set_order_status(order_id, OrderStatus::Rejected).await?;
        }

        self.audit
            .log(
                ctx,
                AuditEntry::new(Some(approver), AuditAction::RejectRequest, request.id)
                    .named(request.request_type.clone())
                    .details(json!({
                        "request_type": request.request_type,
                        "reference_id": request.reference_id,
                        "reason": reason,
                    })),
            )
            .await?;

        info!("Approval request {} rejected by {}", request.id, approver);
        Ok(request)
    }

    /// Newest first; `None` lists every status.
    pub async fn list_approval_requests(
        &self,
        ctx: &mut ExecContext,
        status: Option<ApprovalStatus>,
        page: PageRequest,
    ) -> LedgerResult<Page<ApprovalRequest>> {
        self.tx.session(ctx).await?.list_approval_requests(status, page).await
    }

    pub async fn get_approval_request(&self, ctx: &mut ExecContext, id: Uuid) -> LedgerResult<ApprovalRequest> {
        self.tx
            .session(ctx)
            .await?
            .find_approval_request(id)
            .await?
            .ok_or_else(|| LedgerError::not_found("approval request", id))
    }

    /// Takes the row lock first; every other lock of the operation comes after it.
    async fn lock_pending(&self, ctx: &mut ExecContext, id: Uuid) -> LedgerResult<ApprovalRequest> {
        let request = ctx
            .require_tx()?
            .lock_approval_request(id)
            .await?
            .ok_or_else(|| LedgerError::not_found("approval request", id))?;
        let status = request.status()?;
        if status.is_terminal() {
            return Err(LedgerError::AlreadyResolved { id, status });
        }
        Ok(request)
    }

    async fn ensure_subject_exists(&self, ctx: &mut ExecContext, subject: ApprovalSubject) -> LedgerResult<()> {
        let session = self.tx.session(ctx).await?;
        let found = match subject {
            ApprovalSubject::Order(id) => session.find_order(id).await?.is_some(),
            ApprovalSubject::Product(id) => session.find_product(id).await?.is_some(),
            ApprovalSubject::Expense(id) => session.find_expense(id).await?.is_some(),
        };
        if !found {
            return Err(LedgerError::not_found(
                subject.request_type().as_str(),
                subject.reference_id(),
            ));
        }
        Ok(())
    }

    async fn realize_order(
        &self,
        ctx: &mut ExecContext,
        request: &ApprovalRequest,
        order_id: Uuid,
        approver: Uuid,
    ) -> LedgerResult<Invoice> {
        let session = ctx.require_tx()?;
        let order = session
            .lock_order(order_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("order", order_id))?;
        ensure_order_pending(order.id, order.status()?)?;
        let items = session.order_items(order_id).await?;
        if items.is_empty() {
            return Err(LedgerError::Fatal(format!("order {} has no items", order_id)));
        }
        let terms = OrderTerms::read(request)?;

        self.inventory.apply_order(ctx, &order, &items).await?;
        ctx.require_tx()?
            .set_order_status(order_id, OrderStatus::Completed)
            .await?;

        let subtotal = items
            .iter()
            .map(OrderItem::line_total)
            .fold(BigDecimal::zero(), |acc, line| acc + line);
        // The rule is resolved now, so a rate edited after the request was filed applies.
        let tax_amount = match terms.tax_rule_id {
            Some(rule_id) => &subtotal * &self.tax.find_rule(ctx, rule_id).await?.rate,
            None => BigDecimal::zero(),
        };

        let direction = order.direction()?;
        let mut audit_details = Map::new();
        audit_details.insert("order_code".to_string(), json!(order.order_code));
        audit_details.insert("order_type".to_string(), json!(direction));

        self.invoices
            .issue(
                ctx,
                InvoiceDraft {
                    reference_type: direction.reference_type(),
                    reference_id: order.id,
                    tax_rule_id: terms.tax_rule_id,
                    subtotal,
                    tax_amount,
                    side_fees: terms.side_fees,
                    approved_by: approver,
                    approved_at: request.approved_at.unwrap_or_else(Utc::now),
                    note: order.note.clone(),
                    audit_details,
                },
            )
            .await
    }

    async fn realize_expense(
        &self,
        ctx: &mut ExecContext,
        request: &ApprovalRequest,
        expense_id: Uuid,
        approver: Uuid,
    ) -> LedgerResult<Invoice> {
        let expense = ctx
            .require_tx()?
            .find_expense(expense_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("expense", expense_id))?;

        let mut audit_details = Map::new();
        audit_details.insert("expense_id".to_string(), json!(expense.id));

        self.invoices
            .issue(
                ctx,
                InvoiceDraft {
                    reference_type: ReferenceType::Expense,
                    reference_id: expense.id,
                    tax_rule_id: None,
                    subtotal: expense.converted_amount_usd.clone(),
                    tax_amount: expense.invoice_tax(),
                    side_fees: BigDecimal::zero(),
                    approved_by: approver,
                    approved_at: request.approved_at.unwrap_or_else(Utc::now),
                    note: expense.description.clone(),
                    audit_details,
                },
            )
            .await
    }
}

/// An order whose request is still pending must itself still be pending.
fn ensure_order_pending(order_id: Uuid, status: OrderStatus) -> LedgerResult<()> {
    if status != OrderStatus::PendingApproval {
        return Err(LedgerError::Fatal(format!(
            "order {} is {} while its approval request is still pending",
            order_id, status
        )));
    }
    Ok(())
}

/// Invoice terms carried by an order request's snapshot.
///
/// Fields are read one at a time: snapshots filed by older clients may lack
/// a field or carry unrelated ones, and one odd field must not hide the
/// others. A field that is present but unusable fails the approval.
#[derive(Debug, PartialEq)]
struct OrderTerms {
    tax_rule_id: Option<Uuid>,
    side_fees: BigDecimal,
}

impl OrderTerms {
    fn read(request: &ApprovalRequest) -> LedgerResult<Self> {
        let fields = match &request.request_data {
            Value::Object(fields) => fields,
            Value::Null => return Ok(Self::none()),
            other => {
                return Err(LedgerError::Validation(format!(
                    "request {} carries a non-object snapshot: {}",
                    request.id, other
                )))
            }
        };
        let malformed = |field: &str, value: &Value| {
            LedgerError::Validation(format!("malformed {} {} in request {}", field, value, request.id))
        };

        let tax_rule_id = match fields.get("tax_rule_id") {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) if raw.trim().is_empty() => None,
            Some(value @ Value::String(raw)) => {
                Some(Uuid::parse_str(raw.trim()).map_err(|_| malformed("tax_rule_id", value))?)
            }
            Some(value) => return Err(malformed("tax_rule_id", value)),
        };

        let side_fees = match fields.get("side_fees") {
            None | Some(Value::Null) => BigDecimal::zero(),
            Some(Value::String(raw)) if raw.trim().is_empty() => BigDecimal::zero(),
            Some(value @ Value::String(raw)) => {
                BigDecimal::from_str(raw.trim()).map_err(|_| malformed("side_fees", value))?
            }
            Some(value @ Value::Number(n)) => {
                BigDecimal::from_str(&n.to_string()).map_err(|_| malformed("side_fees", value))?
            }
            Some(value) => return Err(malformed("side_fees", value)),
        };
        if side_fees < BigDecimal::zero() {
            return Err(LedgerError::Validation(format!(
                "negative side fees {} in request {}",
                side_fees, request.id
            )));
        }

        Ok(Self { tax_rule_id, side_fees })
    }

    fn none() -> Self {
        Self {
            tax_rule_id: None,
            side_fees: BigDecimal::zero(),
        }
    }
}

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use ledger_shared::{ApprovalStatus, AuditAction, Page, PageRequest, ReferenceType};
use serde_json::{json, Map, Value};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditRecorder};
use crate::error::{LedgerError, LedgerResult};
use crate::models::Invoice;
use crate::store::{InvoiceFilter, InvoiceStore};
use crate::uow::{ExecContext, TxManager};
use crate::Clock;

/// Monetary scale of every stored invoice amount.
pub const MONEY_SCALE: i64 = 4;

/// Everything an approval knows about the invoice it is about to produce.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceDraft {
    pub reference_type: ReferenceType,
    pub reference_id: Uuid,
    pub tax_rule_id: Option<Uuid>,
    pub subtotal: BigDecimal,
    pub tax_amount: BigDecimal,
    pub side_fees: BigDecimal,
    pub approved_by: Uuid,
    pub approved_at: DateTime<Utc>,
    pub note: String,
    /// Extra fields for the invoice's audit entry.
    pub audit_details: Map<String, Value>,
}

#[derive(Clone)]
pub struct InvoiceAllocator {
    tx: TxManager,
    audit: AuditRecorder,
    today: Clock,
}

impl InvoiceAllocator {
    pub fn new(tx: TxManager, audit: AuditRecorder, today: Clock) -> Self {
        Self { tx, audit, today }
    }

    /// `INV-YYYYMMDD-NNNNN`, serialized per day by an advisory lock that is
    /// held until the surrounding transaction ends.
    pub async fn next_invoice_no(&self, ctx: &mut ExecContext) -> LedgerResult<String> {
        let prefix = format!("INV-{}-", (self.today)().format("%Y%m%d"));
        let session = ctx.require_tx()?;
        session.lock_invoice_sequence(&prefix).await?;
        let issued = session.count_invoices_with_prefix(&prefix).await?;
        Ok(format!("{}{:05}", prefix, issued + 1))
    }

    /// Numbers and stores an approved invoice together with its audit entry.
    #[instrument(skip(self, ctx, draft), fields(reference = %draft.reference_id))]
    pub async fn issue(&self, ctx: &mut ExecContext, draft: InvoiceDraft) -> LedgerResult<Invoice> {
        let this = self.clone();
        self.tx
            .run_in_tx(ctx, move |ctx| Box::pin(async move { this.issue_in_tx(ctx, draft).await }))
            .await
    }

    async fn issue_in_tx(&self, ctx: &mut ExecContext, draft: InvoiceDraft) -> LedgerResult<Invoice> {
        let invoice_no = self.next_invoice_no(ctx).await?;

        let subtotal = draft.subtotal.round(MONEY_SCALE);
        let tax_amount = draft.tax_amount.round(MONEY_SCALE);
        let side_fees = draft.side_fees.round(MONEY_SCALE);
        let total_amount = (&subtotal + &tax_amount + &side_fees).round(MONEY_SCALE);

        let invoice = Invoice {
            id: Uuid::new_v4(),
            invoice_no: invoice_no.clone(),
            reference_type: draft.reference_type.as_str().to_string(),
            reference_id: draft.reference_id,
            tax_rule_id: draft.tax_rule_id,
            subtotal,
            tax_amount,
            side_fees,
            total_amount,
            approval_status: ApprovalStatus::Approved.as_str().to_string(),
            approved_by: Some(draft.approved_by),
            approved_at: Some(draft.approved_at),
            note: draft.note,
            created_at: Utc::now(),
        };
        ctx.require_tx()?.insert_invoice(&invoice).await?;

        let mut details = draft.audit_details;
        details.insert("invoice_no".to_string(), json!(invoice_no));
        details.insert(
            "total".to_string(),
            json!(invoice.total_amount.with_scale(MONEY_SCALE).to_string()),
        );
        self.audit
            .log(
                ctx,
                AuditEntry::new(
                    Some(draft.approved_by),
                    AuditAction::CreateInvoiceFromApproval,
                    invoice.id,
                )
                .named(invoice_no.clone())
                .details(Value::Object(details)),
            )
            .await?;

        info!("Issued invoice {} for {} {}", invoice_no, draft.reference_type, draft.reference_id);
        Ok(invoice)
    }

    pub async fn get_invoice(&self, ctx: &mut ExecContext, id: Uuid) -> LedgerResult<Invoice> {
        self.tx
            .session(ctx)
            .await?
            .find_invoice(id)
            .await?
            .ok_or_else(|| LedgerError::not_found("invoice", id))
    }

    pub async fn list_invoices(
        &self,
        ctx: &mut ExecContext,
        filter: &InvoiceFilter,
        page: PageRequest,
    ) -> LedgerResult<Page<Invoice>> {
        self.tx.session(ctx).await?.list_invoices(filter, page).await
    }
}

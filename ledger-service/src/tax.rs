use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use ledger_shared::{AuditAction, TaxType};
use serde_json::json;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditRecorder};
use crate::error::{LedgerError, LedgerResult};
use crate::models::TaxRule;
use crate::store::TaxRuleStore;
use crate::uow::{ExecContext, TxManager};
use crate::Clock;

/// Read side of the tax rule table.
#[derive(Clone)]
pub struct TaxService {
    tx: TxManager,
    audit: AuditRecorder,
    today: Clock,
}

impl TaxService {
    pub fn new(tx: TxManager, audit: AuditRecorder, today: Clock) -> Self {
        Self { tx, audit, today }
    }

    /// Rate of the rule in force on `date`. A missing rule is an error, never zero.
    #[instrument(skip(self, ctx))]
    pub async fn calculate_active_tax(
        &self,
        ctx: &mut ExecContext,
        tax_type: TaxType,
        date: NaiveDate,
    ) -> LedgerResult<BigDecimal> {
        let rule = self
            .tx
            .session(ctx)
            .await?
            .find_active_tax_rule(tax_type, date)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("no active {} rate on {}", tax_type, date)))?;
        debug!(rule = %rule.id, rate = %rule.rate, "resolved tax rate");
        Ok(rule.rate)
    }

    /// Today's rate for display. The lookup is audited on the side.
    pub async fn active_tax_rate(
        &self,
        ctx: &mut ExecContext,
        actor: Option<Uuid>,
        tax_type: TaxType,
    ) -> LedgerResult<BigDecimal> {
        let today = (self.today)();
        let rate = self.calculate_active_tax(ctx, tax_type, today).await?;
        let entry = AuditEntry::new(actor, AuditAction::ReadTaxRate, tax_type)
            .details(json!({ "tax_type": tax_type, "rate": rate.to_string(), "date": today }));
        self.audit.log_best_effort(ctx, entry).await;
        Ok(rate)
    }

    pub async fn find_rule(&self, ctx: &mut ExecContext, id: Uuid) -> LedgerResult<TaxRule> {
        self.tx
            .session(ctx)
            .await?
            .find_tax_rule(id)
            .await?
            .ok_or_else(|| LedgerError::not_found("tax rule", id))
    }
}

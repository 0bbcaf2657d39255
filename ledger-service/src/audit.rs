use chrono::Utc;
use ledger_shared::{AuditAction, Page, PageRequest};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::models::AuditLog;
use crate::store::AuditStore;
use crate::uow::{ExecContext, TxManager};

/// One audit trail entry before it is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    /// `None` for system actions.
    pub actor: Option<Uuid>,
    pub action: AuditAction,
    pub entity_id: String,
    pub entity_name: Option<String>,
    pub details: serde_json::Value,
}

impl AuditEntry {
    pub fn new(actor: Option<Uuid>, action: AuditAction, entity_id: impl ToString) -> Self {
        Self {
            actor,
            action,
            entity_id: entity_id.to_string(),
            entity_name: None,
            details: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.entity_name = Some(name.into());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    fn into_row(self) -> AuditLog {
        AuditLog {
            id: Uuid::new_v4(),
            user_id: self.actor,
            action: self.action.as_str().to_string(),
            entity_id: self.entity_id,
            entity_name: self.entity_name,
            details: self.details,
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct AuditRecorder {
    tx: TxManager,
}

impl AuditRecorder {
    pub fn new(tx: TxManager) -> Self {
        Self { tx }
    }

    /// Writes the entry in the caller's unit of work, or in its own when none is
    /// open. A failure aborts the surrounding unit of work.
    pub async fn log(&self, ctx: &mut ExecContext, entry: AuditEntry) -> LedgerResult<AuditLog> {
        let row = entry.into_row();
        self.tx
            .run_in_tx(ctx, move |ctx| {
                Box::pin(async move {
                    ctx.require_tx()?.insert_audit_log(&row).await?;
                    Ok(row)
                })
            })
            .await
    }

    /// Read-path entries. Written on a separate autocommit connection so they
    /// survive a rollback, and never fail the caller.
    pub async fn log_best_effort(&self, ctx: &mut ExecContext, entry: AuditEntry) {
        let row = entry.into_row();
        let action = row.action.clone();
        let write = async {
            let mut session = self.tx.database().connect().await?;
            session.insert_audit_log(&row).await
        };
        let result = match ctx.deadline() {
            Some(deadline) => tokio::time::timeout_at(deadline, write)
                .await
                .unwrap_or(Err(LedgerError::DeadlineExceeded)),
            None => write.await,
        };
        if let Err(e) = result {
            warn!("Dropped best-effort audit entry {}: {}", action, e);
        }
    }

    /// Newest first.
    #[instrument(skip(self, ctx))]
    pub async fn list(&self, ctx: &mut ExecContext, page: PageRequest) -> LedgerResult<Page<AuditLog>> {
        self.tx.session(ctx).await?.list_audit_logs(page).await
    }

    pub async fn entries_for(&self, ctx: &mut ExecContext, entity_id: &str) -> LedgerResult<Vec<AuditLog>> {
        self.tx.session(ctx).await?.audit_logs_for(entity_id).await
    }
}

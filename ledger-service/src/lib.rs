pub mod approval;
pub mod audit;
pub mod config;
pub mod error;
pub mod inventory;
pub mod invoice;
pub mod models;
pub mod notify;
pub mod permissions;
pub mod requests;
pub mod schema;
pub mod store;
pub mod tax;
pub mod uow;

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use diesel::Connection;
use diesel_async::async_connection_wrapper::AsyncConnectionWrapper;
use diesel_async::AsyncPgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing::info;

use crate::approval::ApprovalWorkflow;
use crate::audit::AuditRecorder;
use crate::error::{LedgerError, LedgerResult};
use crate::inventory::InventoryLedger;
use crate::invoice::InvoiceAllocator;
use crate::notify::NotificationSink;
use crate::requests::RequestService;
use crate::store::Database;
use crate::tax::TaxService;
use crate::uow::TxManager;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Source of "today" for invoice numbering and tax lookups.
pub type Clock = fn() -> NaiveDate;

pub fn system_today() -> NaiveDate {
    Utc::now().date_naive()
}

pub async fn run_migrations(database_url: &str) -> LedgerResult<()> {
    let url = database_url.to_string();
    tokio::task::spawn_blocking(move || -> LedgerResult<()> {
        let mut conn = AsyncConnectionWrapper::<AsyncPgConnection>::establish(&url)
            .map_err(|e| LedgerError::Transient(format!("migration connection: {}", e)))?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| LedgerError::Fatal(format!("migration error: {}", e)))?;
        info!("Applied {} migrations", applied.len());
        Ok(())
    })
    .await
    .map_err(|e| LedgerError::Fatal(format!("migration task: {}", e)))?
}

/// Every service wired over one database and notification sink.
#[derive(Clone)]
pub struct Ledger {
    pub tx: TxManager,
    pub audit: AuditRecorder,
    pub inventory: InventoryLedger,
    pub invoices: InvoiceAllocator,
    pub tax: TaxService,
    pub approvals: ApprovalWorkflow,
    pub requests: RequestService,
}

impl Ledger {
    pub fn new(db: Arc<dyn Database>, sink: Arc<dyn NotificationSink>, today: Clock) -> Self {
        let tx = TxManager::new(db, sink);
        let audit = AuditRecorder::new(tx.clone());
        let inventory = InventoryLedger::new(tx.clone());
        let tax = TaxService::new(tx.clone(), audit.clone(), today);
        let invoices = InvoiceAllocator::new(tx.clone(), audit.clone(), today);
        let approvals = ApprovalWorkflow::new(
            tx.clone(),
            audit.clone(),
            inventory.clone(),
            invoices.clone(),
            tax.clone(),
        );
        let requests = RequestService::new(tx.clone(), audit.clone(), approvals.clone(), tax.clone(), today);
        Self {
            tx,
            audit,
            inventory,
            invoices,
            tax,
            approvals,
            requests,
        }
    }
}

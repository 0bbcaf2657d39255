use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use ledger_service::config::{Command, LedgerConfig};
use ledger_service::notify::{BroadcastSink, KafkaSink, NotificationSink};
use ledger_service::permissions::{self, PermissionCache, StaticPermissions};
use ledger_service::store::pg::build_pool;
use ledger_service::store::PgDatabase;
use ledger_service::uow::ExecContext;
use ledger_service::{run_migrations, system_today, Ledger};
use ledger_shared::Principal;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let config = LedgerConfig::parse();

    // Run migrations first
    info!("Running database migrations...");
    run_migrations(&config.database_url).await?;
    info!("Migrations completed successfully");
    if let Command::Migrate = config.command {
        return Ok(());
    }

    let pool = build_pool(&config.database_url, config.pool_size).await?;
    let sink: Arc<dyn NotificationSink> = match &config.kafka_brokers {
        Some(brokers) => Arc::new(KafkaSink::new(brokers, config.stock_topic.clone())?),
        None => Arc::new(BroadcastSink::new(64)),
    };
    let ledger = Ledger::new(Arc::new(PgDatabase::new(pool)), sink, system_today);

    let source = StaticPermissions::parse(&config.role_permissions)?;
    let access = PermissionCache::new(Arc::new(source), config.permission_ttl());
    let operator = |user_id: Uuid| Principal {
        user_id,
        role: config.role.clone(),
    };

    let mut ctx = ExecContext::with_timeout(config.tx_timeout());
    match config.command {
        Command::Migrate => {}
        Command::Approvals { status, page } => {
            access.authorize(&operator(Uuid::nil()), permissions::APPROVALS_VIEW).await?;
            let requests = ledger
                .approvals
                .list_approval_requests(&mut ctx, status, page.into())
                .await?;
            print(&requests)?;
        }
        Command::Approve { id, approver } => {
            access.authorize(&operator(approver), permissions::APPROVALS_APPROVE).await?;
            let outcome = ledger.approvals.approve(&mut ctx, id, approver).await?;
            match &outcome.invoice {
                Some(invoice) => info!("Request {} approved, invoice {}", id, invoice.invoice_no),
                None => info!("Request {} approved", id),
            }
            print(&outcome)?;
        }
        Command::Reject { id, approver, reason } => {
            access.authorize(&operator(approver), permissions::APPROVALS_APPROVE).await?;
            let request = ledger.approvals.reject(&mut ctx, id, approver, reason).await?;
            print(&request)?;
        }
        Command::Audit { page } => {
            access.authorize(&operator(Uuid::nil()), permissions::AUDIT_VIEW).await?;
            print(&ledger.audit.list(&mut ctx, page.into()).await?)?;
        }
        Command::StockCard { product_id, page } => {
            access.authorize(&operator(Uuid::nil()), permissions::INVENTORY_VIEW).await?;
            let product = ledger.inventory.get_product(&mut ctx, product_id).await?;
            info!("{} ({}) has {} in stock", product.name, product.sku, product.current_stock);
            print(&ledger.inventory.stock_card(&mut ctx, product_id, page.into()).await?)?;
        }
    }

    Ok(())
}

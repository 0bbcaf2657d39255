//! Unit of work.
//!
//! An [`ExecContext`] is threaded explicitly through every call. It carries the
//! deadline of the current operation and, while a unit of work is open, the
//! transaction every store accessor must use.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use ledger_shared::StockChanged;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::notify::NotificationSink;
use crate::store::{Database, Session};

#[derive(Default)]
pub struct ExecContext {
    deadline: Option<Instant>,
    tx: Option<Box<dyn Session>>,
    root: Option<Box<dyn Session>>,
    pending: Vec<StockChanged>,
}

impl ExecContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..Self::default()
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn in_tx(&self) -> bool {
        self.tx.is_some()
    }

    /// The open transaction, for operations that must not run on their own.
    pub fn require_tx(&mut self) -> LedgerResult<&mut dyn Session> {
        match self.tx.as_mut() {
            Some(tx) => Ok(tx.as_mut()),
            None => Err(LedgerError::Fatal(
                "operation requires an active unit of work".to_string(),
            )),
        }
    }

    /// Queues an event for delivery once the outermost unit of work commits.
    pub fn defer_notification(&mut self, event: StockChanged) {
        self.pending.push(event);
    }

    fn check_deadline(&self) -> LedgerResult<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(LedgerError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct TxManager {
    db: Arc<dyn Database>,
    sink: Arc<dyn NotificationSink>,
}

impl TxManager {
    pub fn new(db: Arc<dyn Database>, sink: Arc<dyn NotificationSink>) -> Self {
        Self { db, sink }
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Runs `work` inside a transaction, committing on `Ok` and rolling back on
    /// `Err`. The error is returned unchanged.
    ///
    /// When `ctx` already carries a transaction, `work` joins it and the
    /// outermost caller decides the outcome.
    pub async fn run_in_tx<T, F>(&self, ctx: &mut ExecContext, work: F) -> LedgerResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut ExecContext) -> BoxFuture<'c, LedgerResult<T>> + Send,
    {
        if ctx.in_tx() {
            return work(ctx).await;
        }

        ctx.check_deadline()?;
        // Waiting for a connection or a lock counts against the deadline too.
        let session = match ctx.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.db.begin())
                .await
                .map_err(|_| LedgerError::DeadlineExceeded)??,
            None => self.db.begin().await?,
        };
        ctx.tx = Some(session);
        debug!("unit of work started");

        let outcome = match ctx.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, work(ctx)).await {
                Ok(result) => result,
                Err(_) => Err(LedgerError::DeadlineExceeded),
            },
            None => work(ctx).await,
        };
        let outcome = outcome.and_then(|value| ctx.check_deadline().map(|_| value));

        let mut session = ctx
            .tx
            .take()
            .ok_or_else(|| LedgerError::Fatal("transaction vanished from context".to_string()))?;

        match outcome {
            Ok(value) => {
                if let Err(e) = session.commit().await {
                    ctx.pending.clear();
                    return Err(e);
                }
                debug!("unit of work committed");
                for event in ctx.pending.drain(..) {
                    self.sink.publish(event);
                }
                Ok(value)
            }
            Err(err) => {
                ctx.pending.clear();
                if let Err(rollback_err) = session.rollback().await {
                    warn!("Rollback failed after {}: {}", err, rollback_err);
                } else {
                    debug!("unit of work rolled back: {}", err);
                }
                Err(err)
            }
        }
    }

    /// The active transaction if one is open, otherwise the root connection.
    pub async fn session<'c>(&self, ctx: &'c mut ExecContext) -> LedgerResult<&'c mut dyn Session> {
        if ctx.tx.is_none() && ctx.root.is_none() {
            ctx.root = Some(self.db.connect().await?);
        }
        match (ctx.tx.as_mut(), ctx.root.as_mut()) {
            (Some(tx), _) => Ok(tx.as_mut()),
            (None, Some(root)) => Ok(root.as_mut()),
            (None, None) => Err(LedgerError::Fatal("no connection available".to_string())),
        }
    }
}

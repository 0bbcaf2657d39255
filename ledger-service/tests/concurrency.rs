mod common;

use std::collections::HashSet;
use std::time::Duration;

use assert_matches::assert_matches;
use common::{order_request, Harness};
use futures::future::join_all;
use ledger_service::error::LedgerError;
use ledger_service::uow::ExecContext;
use ledger_shared::{ApprovalStatus, OrderDirection};
use tokio::time::Instant;
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn double_approval_issues_exactly_one_invoice() {
    let h = Harness::new();
    let widget = h.product("W-1", 10).await;
    let mut ctx = ExecContext::new();
    let submitted = h
        .ledger
        .requests
        .create_order(&mut ctx, None, order_request("SO-1", OrderDirection::Export, &[(widget.id, 4, "2")]))
        .await
        .unwrap();

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let ledger = h.ledger.clone();
            let id = submitted.approval.id;
            tokio::spawn(async move {
                let mut ctx = ExecContext::new();
                ledger.approvals.approve(&mut ctx, id, Uuid::new_v4()).await
            })
        })
        .collect();
    let results: Vec<_> = join_all(handles).await.into_iter().map(|r| r.unwrap()).collect();

    let approved: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(approved.len(), 1);
    assert_eq!(approved[0].invoice.as_ref().unwrap().invoice_no, "INV-20250101-00001");
    let refused: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
    assert_eq!(refused.len(), 1);
    assert_matches!(refused[0], LedgerError::AlreadyResolved { status: ApprovalStatus::Approved, .. });

    assert_eq!(h.db.snapshot().invoices.len(), 1);
    assert_eq!(h.stock_of(widget.id), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_approvals_get_distinct_invoice_numbers() {
    const ORDERS: usize = 8;
    let h = Harness::new();
    let widget = h.product("W-1", 100).await;
    let mut ctx = ExecContext::new();
    let mut ids = Vec::new();
    for n in 0..ORDERS {
        let code = format!("SO-{}", n);
        let submitted = h
            .ledger
            .requests
            .create_order(&mut ctx, None, order_request(&code, OrderDirection::Export, &[(widget.id, 1, "1")]))
            .await
            .unwrap();
        ids.push(submitted.approval.id);
    }

    let handles: Vec<_> = ids
        .into_iter()
        .map(|id| {
            let ledger = h.ledger.clone();
            tokio::spawn(async move {
                let mut ctx = ExecContext::new();
                ledger.approvals.approve(&mut ctx, id, Uuid::new_v4()).await
            })
        })
        .collect();
    let numbers: HashSet<String> = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap().invoice.unwrap().invoice_no)
        .collect();

    let expected: HashSet<String> = (1..=ORDERS).map(|n| format!("INV-20250101-{:05}", n)).collect();
    assert_eq!(numbers, expected);
    assert_eq!(h.stock_of(widget.id), 100 - ORDERS as i32);
    assert_eq!(h.db.snapshot().inventory_transactions.len(), ORDERS);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn competing_exports_never_drive_stock_negative() {
    let h = Harness::new();
    let widget = h.product("W-1", 5).await;
    let mut ctx = ExecContext::new();
    let mut ids = Vec::new();
    for n in 0..4 {
        let submitted = h
            .ledger
            .requests
            .create_order(&mut ctx, None, order_request(&format!("SO-{}", n), OrderDirection::Export, &[(widget.id, 2, "1")]))
            .await
            .unwrap();
        ids.push(submitted.approval.id);
    }

    let handles: Vec<_> = ids
        .into_iter()
        .map(|id| {
            let ledger = h.ledger.clone();
            tokio::spawn(async move {
                let mut ctx = ExecContext::new();
                ledger.approvals.approve(&mut ctx, id, Uuid::new_v4()).await
            })
        })
        .collect();
    let results: Vec<_> = join_all(handles).await.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_matches!(err, LedgerError::InsufficientStock { have: 1, want: 2, .. });
    }
    assert_eq!(h.stock_of(widget.id), 1);
}

#[tokio::test]
async fn an_expired_deadline_commits_nothing() {
    let h = Harness::new();
    let widget = h.product("W-1", 5).await;
    let mut ctx = ExecContext::new();
    let submitted = h
        .ledger
        .requests
        .create_order(&mut ctx, None, order_request("SO-1", OrderDirection::Export, &[(widget.id, 1, "1")]))
        .await
        .unwrap();

    let mut late = ExecContext::with_deadline(Instant::now() - Duration::from_millis(1));
    let err = h
        .ledger
        .approvals
        .approve(&mut late, submitted.approval.id, Uuid::new_v4())
        .await
        .unwrap_err();
    assert_matches!(err, LedgerError::DeadlineExceeded);
    assert!(err.is_retryable());

    let state = h.db.snapshot();
    assert_eq!(state.approval_requests[0].status, "PENDING");
    assert!(state.invoices.is_empty());
    assert_eq!(h.stock_of(widget.id), 5);

    let mut ctx = ExecContext::with_timeout(Duration::from_secs(5));
    h.ledger.approvals.approve(&mut ctx, submitted.approval.id, Uuid::new_v4()).await.unwrap();
}

#[tokio::test]
async fn nested_operations_join_the_callers_unit_of_work() {
    let h = Harness::new();
    let widget = h.product("W-1", 5).await;
    let mut ctx = ExecContext::new();
    let submitted = h
        .ledger
        .requests
        .create_order(&mut ctx, None, order_request("SO-1", OrderDirection::Export, &[(widget.id, 1, "1")]))
        .await
        .unwrap();

    let ledger = h.ledger.clone();
    let id = submitted.approval.id;
    let err = h
        .ledger
        .tx
        .run_in_tx(&mut ctx, move |ctx| {
            Box::pin(async move {
                ledger.approvals.approve(ctx, id, Uuid::new_v4()).await?;
                Err::<(), _>(LedgerError::Validation("caller changed its mind".to_string()))
            })
        })
        .await
        .unwrap_err();
    assert_matches!(err, LedgerError::Validation(_));

    let state = h.db.snapshot();
    assert_eq!(state.approval_requests[0].status, "PENDING");
    assert!(state.invoices.is_empty());
    assert_eq!(h.stock_of(widget.id), 5);
}

mod common;

use assert_matches::assert_matches;
use common::{dec, order_request, Harness};
use ledger_service::error::LedgerError;
use ledger_service::requests::{NewExpenseRequest, NewProductRequest};
use ledger_service::store::{Database, TaxRuleStore};
use ledger_service::uow::ExecContext;
use ledger_shared::*;
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn approving_an_export_moves_stock_and_issues_an_invoice() {
    let h = Harness::new();
    let widget = h.product("W-1", 10).await;
    let vat = h.tax_rule(TaxType::VatInland, "0.1").await;
    let mut events = h.sink.subscribe();
    let requester = Uuid::new_v4();
    let approver = Uuid::new_v4();

    let mut ctx = ExecContext::new();
    let mut request = order_request("SO-1", OrderDirection::Export, &[(widget.id, 3, "5")]);
    request.tax_rule_id = Some(vat.id.to_string());
    request.side_fees = Some("2.5".to_string());
    let submitted = h.ledger.requests.create_order(&mut ctx, Some(requester), request).await.unwrap();
    assert_eq!(submitted.record.status, "PENDING_APPROVAL");
    assert_eq!(submitted.approval.status, "PENDING");
    assert_eq!(h.stock_of(widget.id), 10);

    let outcome = h.ledger.approvals.approve(&mut ctx, submitted.approval.id, approver).await.unwrap();
    assert_eq!(outcome.request.status, "APPROVED");
    assert_eq!(outcome.request.approved_by, Some(approver));
    let invoice = outcome.invoice.unwrap();
    assert_eq!(invoice.invoice_no, "INV-20250101-00001");
    assert_eq!(invoice.reference_type, "ORDER_EXPORT");
    assert_eq!(invoice.tax_rule_id, Some(vat.id));
    assert_eq!(invoice.subtotal, dec("15"));
    assert_eq!(invoice.tax_amount, dec("1.5"));
    assert_eq!(invoice.side_fees, dec("2.5"));
    assert_eq!(invoice.total_amount, dec("19"));

    assert_eq!(h.stock_of(widget.id), 7);
    let state = h.db.snapshot();
    assert_eq!(state.orders[0].status, "COMPLETED");
    assert_eq!(state.inventory_transactions.len(), 1);
    assert_eq!(state.inventory_transactions[0].order_id, Some(submitted.record.id));
    assert_eq!(state.inventory_transactions[0].quantity_changed, -3);

    let event = events.recv().await.unwrap();
    assert_eq!(event.product_id, widget.id);
    assert_eq!(event.new_stock, 7);

    assert_eq!(
        h.audit_actions(),
        vec![
            "CREATE_ORDER_EXPORT",
            "CREATE_APPROVAL_REQUEST",
            "CREATE_INVOICE_FROM_APPROVAL",
            "APPROVE_REQUEST",
        ]
    );
    let trail = h.ledger.audit.entries_for(&mut ctx, &submitted.approval.id.to_string()).await.unwrap();
    assert_eq!(trail.len(), 2);
    assert_eq!(trail[1].details["invoice_no"], "INV-20250101-00001");
}

#[tokio::test]
async fn insufficient_stock_leaves_everything_pending() {
    let h = Harness::new();
    let widget = h.product("W-1", 5).await;
    let mut ctx = ExecContext::new();
    let submitted = h
        .ledger
        .requests
        .create_order(&mut ctx, None, order_request("SO-2", OrderDirection::Export, &[(widget.id, 10, "1")]))
        .await
        .unwrap();
    let audit_before = h.audit_actions().len();

    let err = h.ledger.approvals.approve(&mut ctx, submitted.approval.id, Uuid::new_v4()).await.unwrap_err();
    assert_matches!(err, LedgerError::InsufficientStock { have: 5, want: 10, .. });

    let state = h.db.snapshot();
    assert_eq!(h.stock_of(widget.id), 5);
    assert_eq!(state.orders[0].status, "PENDING_APPROVAL");
    assert_eq!(state.approval_requests[0].status, "PENDING");
    assert!(state.invoices.is_empty());
    assert!(state.inventory_transactions.is_empty());
    assert_eq!(state.audit_logs.len(), audit_before);
}

#[tokio::test]
async fn failure_on_a_later_line_undoes_earlier_lines() {
    let h = Harness::new();
    let a = h.product("A", 10).await;
    let b = h.product("B", 1).await;
    let c = h.product("C", 10).await;
    let mut ctx = ExecContext::new();
    let submitted = h
        .ledger
        .requests
        .create_order(
            &mut ctx,
            None,
            order_request("SO-3", OrderDirection::Export, &[(a.id, 2, "1"), (b.id, 5, "1"), (c.id, 2, "1")]),
        )
        .await
        .unwrap();

    let err = h.ledger.approvals.approve(&mut ctx, submitted.approval.id, Uuid::new_v4()).await.unwrap_err();
    assert_matches!(err, LedgerError::InsufficientStock { product_id, .. } if product_id == b.id);
    assert_eq!(h.stock_of(a.id), 10);
    assert_eq!(h.stock_of(b.id), 1);
    assert_eq!(h.stock_of(c.id), 10);
    assert!(h.db.snapshot().inventory_transactions.is_empty());
}

#[tokio::test]
async fn imports_add_stock_without_tax() {
    let h = Harness::new();
    let a = h.product("A", 0).await;
    let b = h.product("B", 4).await;
    let mut ctx = ExecContext::new();
    let submitted = h
        .ledger
        .requests
        .create_order(&mut ctx, None, order_request("PO-1", OrderDirection::Import, &[(a.id, 3, "2"), (b.id, 1, "0.5")]))
        .await
        .unwrap();

    let outcome = h.ledger.approvals.approve(&mut ctx, submitted.approval.id, Uuid::new_v4()).await.unwrap();
    let invoice = outcome.invoice.unwrap();
    assert_eq!(invoice.reference_type, "ORDER_IMPORT");
    assert_eq!(invoice.tax_amount, dec("0"));
    assert_eq!(invoice.total_amount, dec("6.5"));
    assert_eq!(h.stock_of(a.id), 3);
    assert_eq!(h.stock_of(b.id), 5);
}

#[tokio::test]
async fn rejecting_an_order_closes_it_without_touching_stock() {
    let h = Harness::new();
    let widget = h.product("W-1", 5).await;
    let approver = Uuid::new_v4();
    let mut ctx = ExecContext::new();
    let submitted = h
        .ledger
        .requests
        .create_order(&mut ctx, None, order_request("SO-4", OrderDirection::Export, &[(widget.id, 1, "1")]))
        .await
        .unwrap();

    let rejected = h
        .ledger
        .approvals
        .reject(&mut ctx, submitted.approval.id, approver, "customer cancelled".to_string())
        .await
        .unwrap();
    assert_eq!(rejected.status, "REJECTED");
    assert_eq!(rejected.rejection_reason.as_deref(), Some("customer cancelled"));

    let state = h.db.snapshot();
    assert_eq!(state.orders[0].status, "REJECTED");
    assert_eq!(h.stock_of(widget.id), 5);
    let last = state.audit_logs.last().unwrap();
    assert_eq!(last.action, "REJECT_REQUEST");
    assert_eq!(last.details["reason"], "customer cancelled");

    let err = h.ledger.approvals.approve(&mut ctx, submitted.approval.id, approver).await.unwrap_err();
    assert_matches!(err, LedgerError::AlreadyResolved { status: ApprovalStatus::Rejected, .. });
    let err = h
        .ledger
        .approvals
        .reject(&mut ctx, submitted.approval.id, approver, "again".to_string())
        .await
        .unwrap_err();
    assert_matches!(err, LedgerError::AlreadyResolved { .. });
}

#[tokio::test]
async fn audit_failure_aborts_the_approval() {
    let h = Harness::new();
    let widget = h.product("W-1", 5).await;
    let mut ctx = ExecContext::new();
    let submitted = h
        .ledger
        .requests
        .create_order(&mut ctx, None, order_request("SO-5", OrderDirection::Export, &[(widget.id, 2, "1")]))
        .await
        .unwrap();

    h.db.set_audit_failure(true);
    let err = h.ledger.approvals.approve(&mut ctx, submitted.approval.id, Uuid::new_v4()).await.unwrap_err();
    assert_matches!(err, LedgerError::Transient(_));
    let state = h.db.snapshot();
    assert_eq!(state.approval_requests[0].status, "PENDING");
    assert!(state.invoices.is_empty());
    assert_eq!(h.stock_of(widget.id), 5);

    h.db.set_audit_failure(false);
    let outcome = h.ledger.approvals.approve(&mut ctx, submitted.approval.id, Uuid::new_v4()).await.unwrap();
    assert_eq!(outcome.invoice.unwrap().invoice_no, "INV-20250101-00001");
    assert_eq!(h.stock_of(widget.id), 3);
}

#[tokio::test]
async fn audit_failure_aborts_request_creation() {
    let h = Harness::new();
    h.db.set_audit_failure(true);
    let mut ctx = ExecContext::new();
    let err = h
        .ledger
        .requests
        .create_product(
            &mut ctx,
            None,
            NewProductRequest {
                sku: "NEW-1".to_string(),
                name: "New".to_string(),
                price: dec("3"),
            },
        )
        .await
        .unwrap_err();
    assert_matches!(err, LedgerError::Transient(_));
    let state = h.db.snapshot();
    assert!(state.products.is_empty());
    assert!(state.approval_requests.is_empty());
}

#[tokio::test]
async fn product_requests_approve_without_an_invoice() {
    let h = Harness::new();
    let mut ctx = ExecContext::new();
    let new_product = NewProductRequest {
        sku: "NEW-1".to_string(),
        name: "New".to_string(),
        price: dec("3"),
    };
    let submitted = h.ledger.requests.create_product(&mut ctx, None, new_product.clone()).await.unwrap();
    assert_eq!(submitted.record.current_stock, 0);
    assert_eq!(submitted.approval.request_type, "CREATE_PRODUCT");

    let err = h.ledger.requests.create_product(&mut ctx, None, new_product).await.unwrap_err();
    assert_matches!(err, LedgerError::DuplicateReference(_));
    assert_eq!(h.audit_actions(), vec!["CREATE_PRODUCT", "CREATE_APPROVAL_REQUEST"]);

    let outcome = h.ledger.approvals.approve(&mut ctx, submitted.approval.id, Uuid::new_v4()).await.unwrap();
    assert!(outcome.invoice.is_none());
    assert!(h.db.snapshot().invoices.is_empty());
}

#[tokio::test]
async fn expense_approval_invoices_the_converted_amount() {
    let h = Harness::new();
    h.tax_rule(TaxType::Fct, "0.05").await;
    h.tax_rule(TaxType::VatIntl, "0.1").await;
    let mut ctx = ExecContext::new();
    let submitted = h
        .ledger
        .requests
        .create_expense(
            &mut ctx,
            None,
            NewExpenseRequest {
                currency: "EUR".to_string(),
                exchange_rate: dec("1.2"),
                original_amount: dec("1000"),
                is_foreign_vendor: true,
                fct_type: Some(FctType::Net),
                document_type: DocumentType::VatInvoice,
                vendor_tax_code: Some("DE123456789".to_string()),
                document_url: None,
                order_id: None,
                vendor_id: None,
                description: "cloud hosting".to_string(),
            },
        )
        .await
        .unwrap();
    let expense = &submitted.record;
    assert_eq!(expense.converted_amount_usd, dec("1200"));
    assert_eq!(expense.fct_amount, dec("60"));
    assert_eq!(expense.total_payable, dec("1050"));
    assert_eq!(expense.vat_amount, dec("120"));
    assert!(expense.is_deductible_expense);

    let outcome = h.ledger.approvals.approve(&mut ctx, submitted.approval.id, Uuid::new_v4()).await.unwrap();
    let invoice = outcome.invoice.unwrap();
    assert_eq!(invoice.reference_type, "EXPENSE");
    assert_eq!(invoice.reference_id, expense.id);
    assert_eq!(invoice.subtotal, dec("1200"));
    assert_eq!(invoice.tax_amount, dec("180"));
    assert_eq!(invoice.total_amount, dec("1380"));
    assert_eq!(invoice.note, "cloud hosting");
}

#[tokio::test]
async fn foreign_expense_without_an_fct_rate_is_refused() {
    let h = Harness::new();
    let mut ctx = ExecContext::new();
    let err = h
        .ledger
        .requests
        .create_expense(
            &mut ctx,
            None,
            NewExpenseRequest {
                currency: "EUR".to_string(),
                exchange_rate: dec("1.2"),
                original_amount: dec("10"),
                is_foreign_vendor: true,
                fct_type: Some(FctType::Gross),
                document_type: DocumentType::RetailReceipt,
                vendor_tax_code: None,
                document_url: None,
                order_id: None,
                vendor_id: None,
                description: String::new(),
            },
        )
        .await
        .unwrap_err();
    assert_matches!(err, LedgerError::NotFound(_));
    assert!(h.db.snapshot().expenses.is_empty());
}

#[tokio::test]
async fn orders_must_reference_existing_rows() {
    let h = Harness::new();
    let widget = h.product("W-1", 1).await;
    let mut ctx = ExecContext::new();

    let err = h
        .ledger
        .requests
        .create_order(&mut ctx, None, order_request("SO-6", OrderDirection::Export, &[(Uuid::new_v4(), 1, "1")]))
        .await
        .unwrap_err();
    assert_matches!(err, LedgerError::NotFound(_));

    let mut request = order_request("SO-6", OrderDirection::Export, &[(widget.id, 1, "1")]);
    request.tax_rule_id = Some(Uuid::new_v4().to_string());
    let err = h.ledger.requests.create_order(&mut ctx, None, request).await.unwrap_err();
    assert_matches!(err, LedgerError::NotFound(_));

    let ok = order_request("SO-6", OrderDirection::Export, &[(widget.id, 1, "1")]);
    h.ledger.requests.create_order(&mut ctx, None, ok.clone()).await.unwrap();
    let err = h.ledger.requests.create_order(&mut ctx, None, ok).await.unwrap_err();
    assert_matches!(err, LedgerError::DuplicateReference(_));
    assert_eq!(h.db.snapshot().orders.len(), 1);
}

#[tokio::test]
async fn untyped_requests_are_checked_before_filing() {
    let h = Harness::new();
    let widget = h.product("W-1", 1).await;
    let mut ctx = ExecContext::new();
    let approvals = &h.ledger.approvals;

    let err = approvals
        .create_approval_request(&mut ctx, "CREATE_INVOICE", &widget.id.to_string(), serde_json::json!({}), None)
        .await
        .unwrap_err();
    assert_matches!(err, LedgerError::Validation(_));

    let err = approvals
        .create_approval_request(&mut ctx, "CREATE_PRODUCT", "not-a-uuid", serde_json::json!({}), None)
        .await
        .unwrap_err();
    assert_matches!(err, LedgerError::InvalidReference(_));

    let err = approvals
        .create_approval_request(&mut ctx, "CREATE_ORDER", &widget.id.to_string(), serde_json::json!({}), None)
        .await
        .unwrap_err();
    assert_matches!(err, LedgerError::NotFound(_));

    let request = approvals
        .create_approval_request(&mut ctx, "CREATE_PRODUCT", &widget.id.to_string(), serde_json::json!({}), None)
        .await
        .unwrap();
    let pending = approvals
        .list_approval_requests(&mut ctx, Some(ApprovalStatus::Pending), PageRequest::default())
        .await
        .unwrap();
    assert_eq!(pending.total, 1);
    assert_eq!(pending.items[0].id, request.id);
    assert_matches!(
        approvals.get_approval_request(&mut ctx, Uuid::new_v4()).await,
        Err(LedgerError::NotFound(_))
    );
}

#[tokio::test]
async fn order_terms_survive_an_odd_sibling_field() {
    let h = Harness::new();
    let widget = h.product("W-1", 10).await;
    let vat = h.tax_rule(TaxType::VatInland, "0.1").await;
    let mut ctx = ExecContext::new();
    let order = h
        .ledger
        .requests
        .create_order(&mut ctx, None, order_request("SO-1", OrderDirection::Export, &[(widget.id, 3, "5")]))
        .await
        .unwrap()
        .record;

    // A client that sends fees as a JSON number instead of a string.
    let request = h
        .ledger
        .approvals
        .create_approval_request(
            &mut ctx,
            "CREATE_ORDER",
            &order.id.to_string(),
            json!({"order_code": "SO-1", "tax_rule_id": vat.id.to_string(), "side_fees": 2.5}),
            None,
        )
        .await
        .unwrap();
    let invoice = h
        .ledger
        .approvals
        .approve(&mut ctx, request.id, Uuid::new_v4())
        .await
        .unwrap()
        .invoice
        .unwrap();
    assert_eq!(invoice.tax_rule_id, Some(vat.id));
    assert_eq!(invoice.tax_amount, dec("1.5"));
    assert_eq!(invoice.side_fees, dec("2.5"));
    assert_eq!(invoice.total_amount, dec("19"));
}

#[tokio::test]
async fn unusable_order_terms_fail_the_approval() {
    let h = Harness::new();
    let widget = h.product("W-1", 10).await;
    let mut ctx = ExecContext::new();
    let order = h
        .ledger
        .requests
        .create_order(&mut ctx, None, order_request("SO-1", OrderDirection::Export, &[(widget.id, 3, "5")]))
        .await
        .unwrap()
        .record;
    let request = h
        .ledger
        .approvals
        .create_approval_request(&mut ctx, "CREATE_ORDER", &order.id.to_string(), json!({"side_fees": true}), None)
        .await
        .unwrap();

    let err = h.ledger.approvals.approve(&mut ctx, request.id, Uuid::new_v4()).await.unwrap_err();
    assert_matches!(err, LedgerError::Validation(_));
    let state = h.db.snapshot();
    assert!(state.invoices.is_empty());
    assert_eq!(state.orders[0].status, "PENDING_APPROVAL");
    assert_eq!(h.stock_of(widget.id), 10);
}

#[tokio::test]
async fn approval_applies_the_tax_rate_in_force_at_approval_time() {
    let h = Harness::new();
    let widget = h.product("W-1", 10).await;
    let mut vat = h.tax_rule(TaxType::VatInland, "0.1").await;
    let mut ctx = ExecContext::new();
    let mut request = order_request("SO-1", OrderDirection::Export, &[(widget.id, 3, "5")]);
    request.tax_rule_id = Some(vat.id.to_string());
    let submitted = h.ledger.requests.create_order(&mut ctx, None, request).await.unwrap();

    vat.rate = dec("0.2");
    h.db.connect().await.unwrap().update_tax_rule(&vat).await.unwrap();

    let invoice = h
        .ledger
        .approvals
        .approve(&mut ctx, submitted.approval.id, Uuid::new_v4())
        .await
        .unwrap()
        .invoice
        .unwrap();
    assert_eq!(invoice.tax_amount, dec("3"));
    assert_eq!(invoice.total_amount, dec("18"));
}

#[tokio::test]
async fn a_tax_rule_deleted_before_approval_blocks_it() {
    let h = Harness::new();
    let widget = h.product("W-1", 10).await;
    let vat = h.tax_rule(TaxType::VatInland, "0.1").await;
    let mut ctx = ExecContext::new();
    let mut request = order_request("SO-1", OrderDirection::Export, &[(widget.id, 3, "5")]);
    request.tax_rule_id = Some(vat.id.to_string());
    let submitted = h.ledger.requests.create_order(&mut ctx, None, request).await.unwrap();

    h.db.connect().await.unwrap().delete_tax_rule(vat.id).await.unwrap();

    let err = h.ledger.approvals.approve(&mut ctx, submitted.approval.id, Uuid::new_v4()).await.unwrap_err();
    assert_matches!(err, LedgerError::NotFound(_));
    let state = h.db.snapshot();
    assert_eq!(state.approval_requests[0].status, "PENDING");
    assert!(state.invoices.is_empty());
    assert!(state.inventory_transactions.is_empty());
    assert_eq!(h.stock_of(widget.id), 10);
}

#[tokio::test]
async fn repeated_lines_of_one_product_post_running_balances() {
    let h = Harness::new();
    let widget = h.product("W-1", 10).await;
    let mut ctx = ExecContext::new();
    let submitted = h
        .ledger
        .requests
        .create_order(
            &mut ctx,
            None,
            order_request("SO-1", OrderDirection::Export, &[(widget.id, 3, "1"), (widget.id, 4, "1")]),
        )
        .await
        .unwrap();

    h.ledger.approvals.approve(&mut ctx, submitted.approval.id, Uuid::new_v4()).await.unwrap();

    let entries = h.db.snapshot().inventory_transactions;
    let postings: Vec<_> = entries.iter().map(|e| (e.quantity_changed, e.stock_after)).collect();
    assert_eq!(postings, vec![(-3, 7), (-4, 3)]);
    assert_eq!(h.stock_of(widget.id), 3);
}

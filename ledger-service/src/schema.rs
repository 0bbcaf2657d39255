diesel::table! {
    products (id) {
        id -> Uuid,
        sku -> Varchar,
        name -> Varchar,
        current_stock -> Int4,
        price -> Numeric,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    orders (id) {
        id -> Uuid,
        order_code -> Varchar,
        order_type -> Varchar,
        status -> Varchar,
        note -> Text,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    order_items (id) {
        id -> Uuid,
        order_id -> Uuid,
        product_id -> Uuid,
        line_no -> Int4,
        quantity -> Int4,
        unit_price -> Numeric,
    }
}

diesel::table! {
    inventory_transactions (id) {
        id -> Uuid,
        product_id -> Uuid,
        order_id -> Nullable<Uuid>,
        transaction_type -> Varchar,
        quantity_changed -> Int4,
        stock_after -> Int4,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    expenses (id) {
        id -> Uuid,
        order_id -> Nullable<Uuid>,
        vendor_id -> Nullable<Uuid>,
        currency -> Varchar,
        exchange_rate -> Numeric,
        original_amount -> Numeric,
        converted_amount_usd -> Numeric,
        is_foreign_vendor -> Bool,
        fct_type -> Nullable<Varchar>,
        fct_rate -> Numeric,
        fct_amount -> Numeric,
        total_payable -> Numeric,
        vat_rate -> Numeric,
        vat_amount -> Numeric,
        document_type -> Varchar,
        vendor_tax_code -> Nullable<Varchar>,
        document_url -> Nullable<Text>,
        is_deductible_expense -> Bool,
        description -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    approval_requests (id) {
        id -> Uuid,
        request_type -> Varchar,
        reference_id -> Uuid,
        request_data -> Jsonb,
        status -> Varchar,
        requested_by -> Nullable<Uuid>,
        approved_by -> Nullable<Uuid>,
        approved_at -> Nullable<Timestamptz>,
        rejection_reason -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    invoices (id) {
        id -> Uuid,
        invoice_no -> Varchar,
        reference_type -> Varchar,
        reference_id -> Uuid,
        tax_rule_id -> Nullable<Uuid>,
        subtotal -> Numeric,
        tax_amount -> Numeric,
        side_fees -> Numeric,
        total_amount -> Numeric,
        approval_status -> Varchar,
        approved_by -> Nullable<Uuid>,
        approved_at -> Nullable<Timestamptz>,
        note -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    audit_logs (id) {
        id -> Uuid,
        user_id -> Nullable<Uuid>,
        action -> Varchar,
        entity_id -> Varchar,
        entity_name -> Nullable<Varchar>,
        details -> Jsonb,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    tax_rules (id) {
        id -> Uuid,
        tax_type -> Varchar,
        rate -> Numeric,
        effective_from -> Date,
        effective_to -> Nullable<Date>,
        description -> Text,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(order_items -> orders (order_id));
diesel::joinable!(order_items -> products (product_id));
diesel::joinable!(inventory_transactions -> products (product_id));

diesel::allow_tables_to_appear_in_same_query!(
    products,
    orders,
    order_items,
    inventory_transactions,
    expenses,
    approval_requests,
    invoices,
    audit_logs,
    tax_rules,
);

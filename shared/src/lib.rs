use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

pub mod snapshot;

pub use snapshot::*;

/// A status or type code read from storage or a request that matches no known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} code '{code}'")]
pub struct UnknownCode {
    pub kind: &'static str,
    pub code: String,
}

/// Declares an enum persisted as a fixed upper-case code.
macro_rules! coded_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $code:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $code)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $code),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownCode;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($code => Ok($name::$variant),)+
                    other => Err(UnknownCode { kind: $kind, code: other.to_string() }),
                }
            }
        }
    };
}

coded_enum!(
    /// What an approval request asks to realize.
    RequestType, "request type" {
        CreateOrder => "CREATE_ORDER",
        CreateProduct => "CREATE_PRODUCT",
        CreateExpense => "CREATE_EXPENSE",
    }
);

coded_enum!(
    ApprovalStatus, "approval status" {
        Pending => "PENDING",
        Approved => "APPROVED",
        Rejected => "REJECTED",
    }
);

coded_enum!(
    /// Stock direction of an order: imports add stock, exports remove it.
    OrderDirection, "order direction" {
        Import => "IMPORT",
        Export => "EXPORT",
    }
);

coded_enum!(
    OrderStatus, "order status" {
        PendingApproval => "PENDING_APPROVAL",
        Completed => "COMPLETED",
        Rejected => "REJECTED",
    }
);

coded_enum!(
    /// Direction of a single ledger entry.
    TxDirection, "inventory transaction direction" {
        In => "IN",
        Out => "OUT",
    }
);

coded_enum!(
    /// What an invoice was generated from.
    ReferenceType, "invoice reference type" {
        OrderImport => "ORDER_IMPORT",
        OrderExport => "ORDER_EXPORT",
        Expense => "EXPENSE",
    }
);

coded_enum!(
    TaxType, "tax type" {
        VatInland => "VAT_INLAND",
        VatIntl => "VAT_INTL",
        Fct => "FCT",
    }
);

coded_enum!(
    /// Foreign contractor tax basis: NET adds tax on top, GROSS extracts it from the amount.
    FctType, "FCT type" {
        Net => "NET",
        Gross => "GROSS",
    }
);

coded_enum!(
    DocumentType, "document type" {
        VatInvoice => "VAT_INVOICE",
        DirectInvoice => "DIRECT_INVOICE",
        RetailReceipt => "RETAIL_RECEIPT",
        None => "NONE",
    }
);

coded_enum!(
    /// Audit trail action codes.
    AuditAction, "audit action" {
        CreateProduct => "CREATE_PRODUCT",
        CreateOrderImport => "CREATE_ORDER_IMPORT",
        CreateOrderExport => "CREATE_ORDER_EXPORT",
        CreateExpense => "CREATE_EXPENSE",
        CreateApprovalRequest => "CREATE_APPROVAL_REQUEST",
        ApproveRequest => "APPROVE_REQUEST",
        RejectRequest => "REJECT_REQUEST",
        CreateInvoiceFromApproval => "CREATE_INVOICE_FROM_APPROVAL",
        ReadTaxRate => "READ_TAX_RATE",
    }
);

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

impl OrderDirection {
    /// Signed stock delta for a line of `quantity` units.
    pub fn signed(&self, quantity: i32) -> i32 {
        match self {
            OrderDirection::Import => quantity,
            OrderDirection::Export => -quantity,
        }
    }

    pub fn reference_type(&self) -> ReferenceType {
        match self {
            OrderDirection::Import => ReferenceType::OrderImport,
            OrderDirection::Export => ReferenceType::OrderExport,
        }
    }

    pub fn creation_action(&self) -> AuditAction {
        match self {
            OrderDirection::Import => AuditAction::CreateOrderImport,
            OrderDirection::Export => AuditAction::CreateOrderExport,
        }
    }
}

impl TxDirection {
    pub fn from_delta(delta: i32) -> Self {
        if delta < 0 {
            TxDirection::Out
        } else {
            TxDirection::In
        }
    }
}

/// Authenticated caller injected by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: Uuid,
    pub role: String,
}

/// Published after a committed stock adjustment. Delivery is best-effort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockChanged {
    pub product_id: Uuid,
    pub new_stock: i32,
    pub order_id: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
}

pub const DEFAULT_PAGE_LIMIT: i64 = 20;
pub const MAX_PAGE_LIMIT: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: i64,
    pub limit: i64,
}

impl PageRequest {
    /// Clamps out-of-range values: pages start at 1, limits default to 20 and cap at 100.
    pub fn new(page: i64, limit: i64) -> Self {
        let page = if page <= 0 { 1 } else { page };
        let limit = if limit <= 0 {
            DEFAULT_PAGE_LIMIT
        } else {
            limit.min(MAX_PAGE_LIMIT)
        };
        Self { page, limit }
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.limit
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, DEFAULT_PAGE_LIMIT)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, request: PageRequest) -> Self {
        Self {
            items,
            total,
            page: request.page,
            limit: request.limit,
        }
    }

    pub fn total_pages(&self) -> i64 {
        if self.limit <= 0 {
            return 0;
        }
        (self.total + self.limit - 1) / self.limit
    }
}

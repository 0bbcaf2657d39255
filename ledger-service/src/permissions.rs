//! Role permission lookups for the authorization layer. Never read inside a
//! unit of work.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ledger_shared::Principal;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{LedgerError, LedgerResult};

pub const ADMIN_ROLE: &str = "admin";

pub const APPROVALS_VIEW: &str = "approvals.view";
pub const APPROVALS_APPROVE: &str = "approvals.approve";
pub const AUDIT_VIEW: &str = "audit.view";
pub const INVENTORY_VIEW: &str = "inventory.view";

#[async_trait]
pub trait PermissionSource: Send + Sync {
    async fn permissions_for(&self, role: &str) -> LedgerResult<HashSet<String>>;
}

/// Fixed role table, e.g. parsed from `clerk=approvals.view;lead=approvals.view,approvals.approve`.
#[derive(Debug, Clone, Default)]
pub struct StaticPermissions {
    roles: HashMap<String, HashSet<String>>,
}

impl StaticPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, role: impl Into<String>, permissions: &[&str]) -> Self {
        self.roles
            .entry(role.into())
            .or_default()
            .extend(permissions.iter().map(|p| p.to_string()));
        self
    }

    pub fn parse(raw: &str) -> LedgerResult<Self> {
        let mut table = Self::new();
        for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (role, perms) = entry
                .split_once('=')
                .ok_or_else(|| LedgerError::Validation(format!("role entry '{}' has no '='", entry)))?;
            let perms: Vec<&str> = perms.split(',').map(str::trim).filter(|p| !p.is_empty()).collect();
            table = table.grant(role.trim(), &perms);
        }
        Ok(table)
    }
}

#[async_trait]
impl PermissionSource for StaticPermissions {
    async fn permissions_for(&self, role: &str) -> LedgerResult<HashSet<String>> {
        Ok(self.roles.get(role).cloned().unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    permissions: HashSet<String>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Clone)]
pub struct PermissionCache {
    source: Arc<dyn PermissionSource>,
    ttl: Duration,
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl PermissionCache {
    pub fn new(source: Arc<dyn PermissionSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn permissions(&self, role: &str) -> LedgerResult<HashSet<String>> {
        if let Some(entry) = self.entries.read().await.get(role) {
            if !entry.is_expired() {
                return Ok(entry.permissions.clone());
            }
        }

        let permissions = self.source.permissions_for(role).await?;
        debug!(role, count = permissions.len(), "loaded role permissions");
        self.entries.write().await.insert(
            role.to_string(),
            CacheEntry {
                permissions: permissions.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(permissions)
    }

    /// Call after a role's permissions change.
    pub async fn invalidate(&self, role: &str) {
        self.entries.write().await.remove(role);
    }

    pub async fn invalidate_all(&self) {
        self.entries.write().await.clear();
    }

    /// Admins pass every check.
    pub async fn authorize(&self, principal: &Principal, permission: &str) -> LedgerResult<()> {
        if principal.role == ADMIN_ROLE {
            return Ok(());
        }
        if self.permissions(&principal.role).await?.contains(permission) {
            return Ok(());
        }
        Err(LedgerError::Forbidden(format!(
            "role '{}' lacks permission '{}'",
            principal.role, permission
        )))
    }
}

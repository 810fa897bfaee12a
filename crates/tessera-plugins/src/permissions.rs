//! Permission grants
//!
//! The broker decides which requested permissions a plugin actually receives.
//! A real deployment can swap the fixed policy table for an interactive or
//! policy-file driven approval step without changing the registry contract.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::debug;

use crate::manifest::Permission;

/// Approval collaborator consulted on install and on restore.
///
/// Implementations must return a subset of `requested`.
#[async_trait]
pub trait PermissionBroker: Send + Sync {
    async fn resolve_grants(&self, requested: &BTreeSet<Permission>) -> BTreeSet<Permission>;
}

/// Fixed policy table: a permission is granted iff it is in the approved set.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    approved: BTreeSet<Permission>,
}

impl PolicyTable {
    /// Permissions granted without an approval step
    pub const AUTO_GRANTED: [Permission; 5] = [
        Permission::FileSystemRead,
        Permission::NetworkAccess,
        Permission::AiProviderAccess,
        Permission::InterPluginCommunication,
        Permission::DataStorage,
    ];

    /// Add operator pre-approved permissions on top of the auto-granted set
    pub fn with_approved(mut self, permissions: impl IntoIterator<Item = Permission>) -> Self {
        self.approved.extend(permissions);
        self
    }

    pub fn allows(&self, permission: Permission) -> bool {
        self.approved.contains(&permission)
    }

    /// Grant decision without going through the async trait
    pub fn grant(&self, requested: &BTreeSet<Permission>) -> BTreeSet<Permission> {
        requested
            .iter()
            .copied()
            .filter(|p| self.allows(*p))
            .collect()
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self {
            approved: Self::AUTO_GRANTED.into_iter().collect(),
        }
    }
}

#[async_trait]
impl PermissionBroker for PolicyTable {
    async fn resolve_grants(&self, requested: &BTreeSet<Permission>) -> BTreeSet<Permission> {
        let granted = self.grant(requested);
        debug!(
            requested = requested.len(),
            granted = granted.len(),
            "Resolved permission grants"
        );
        granted
    }
}

/// Permissions in `requested` that are missing from `granted`
pub fn missing(
    requested: &BTreeSet<Permission>,
    granted: &BTreeSet<Permission>,
) -> Vec<Permission> {
    requested.difference(granted).copied().collect()
}

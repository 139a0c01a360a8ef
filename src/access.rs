use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "kpi.read")]
    KpiRead,
    #[serde(rename = "kpi.write")]
    KpiWrite,
}

impl Permission {
    pub fn code(self) -> &'static str {
        match self {
            Permission::KpiRead => "kpi.read",
            Permission::KpiWrite => "kpi.write",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Tenant and the permission check result for one engine invocation.
///
/// The permission lookup itself belongs to the caller; the engine only
/// refuses to run when the grant it needs is absent.
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant_id: Uuid,
    granted: BTreeSet<Permission>,
}

impl TenantContext {
    pub fn new(tenant_id: Uuid, granted: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            tenant_id,
            granted: granted.into_iter().collect(),
        }
    }

    pub fn read_only(tenant_id: Uuid) -> Self {
        Self::new(tenant_id, [Permission::KpiRead])
    }

    pub fn read_write(tenant_id: Uuid) -> Self {
        Self::new(tenant_id, [Permission::KpiRead, Permission::KpiWrite])
    }

    pub fn allows(&self, permission: Permission) -> bool {
        self.granted.contains(&permission)
    }

    pub fn require(&self, permission: Permission) -> Result<()> {
        if self.allows(permission) {
            Ok(())
        } else {
            Err(EngineError::PermissionDenied {
                permission,
                tenant_id: self.tenant_id,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_context_rejects_writes() {
        let ctx = TenantContext::read_only(Uuid::new_v4());
        assert!(ctx.require(Permission::KpiRead).is_ok());
        assert!(matches!(
            ctx.require(Permission::KpiWrite),
            Err(EngineError::PermissionDenied {
                permission: Permission::KpiWrite,
                ..
            })
        ));
    }

    #[test]
    fn empty_grant_rejects_everything() {
        let ctx = TenantContext::new(Uuid::new_v4(), []);
        assert!(!ctx.allows(Permission::KpiRead));
        assert!(!ctx.allows(Permission::KpiWrite));
    }
}

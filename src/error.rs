use uuid::Uuid;

use crate::access::Permission;

/// Errors surfaced by the analytics engine.
///
/// Missing history, zero denominators and unmatched catalog lookups are not
/// errors; they show up as `None` values, `no_ref` flags or empty output.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("tenant {tenant_id} lacks permission {permission}")]
    PermissionDenied {
        permission: Permission,
        tenant_id: Uuid,
    },

    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("failed to fetch {source_name}: {reason}")]
    UpstreamFetch { source_name: String, reason: String },

    #[error("failed to persist {target}: {reason}")]
    Persist { target: String, reason: String },
}

impl EngineError {
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub fn upstream(source_name: impl Into<String>, reason: impl ToString) -> Self {
        Self::UpstreamFetch {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn persist(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::Persist {
            target: target.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

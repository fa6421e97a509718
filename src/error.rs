//! Caller-facing error type.
//!
//! Internal plumbing uses `anyhow`; these variants are the failures a caller
//! can act on. The HTTP layer maps each to a status code and a stable
//! machine-readable code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("analyst {analyst_id} is not authorized for workspace {workspace}")]
    InsufficientPermissions {
        analyst_id: String,
        workspace: String,
    },

    #[error("cross-tenant search requires cross-tenant audit logging to be active")]
    CrossTenantAuditInactive,

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HarnessError {
    pub fn code(&self) -> &'static str {
        match self {
            HarnessError::InsufficientPermissions { .. } => "INSUFFICIENT_PERMISSIONS",
            HarnessError::CrossTenantAuditInactive => "cross_tenant_audit_inactive",
            HarnessError::NotFound(_) => "not_found",
            HarnessError::InvalidInput(_) => "bad_request",
            HarnessError::Database(_) | HarnessError::Internal(_) => "internal",
        }
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;

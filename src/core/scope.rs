use serde::{Deserialize, Serialize};

/// Default tenant id substituted when a command omits one.
pub const LOCAL_TENANT: &str = "tenant-local";
/// Default user id substituted when a command omits one.
pub const LOCAL_USER: &str = "user-local";
/// Default workspace id substituted when a command omits one.
pub const LOCAL_WORKSPACE: &str = "workspace-local";

/// The multi-tenant partition key carried by every durable record.
///
/// Any relation between two records requires their triples to be equal;
/// violations surface as scope-mismatch errors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    /// Tenant identifier.
    pub tenant_id: String,

    /// User identifier.
    pub user_id: String,

    /// Workspace identifier.
    pub workspace_id: String,
}

impl Scope {
    /// Create a scope from explicit parts.
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        workspace_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            workspace_id: workspace_id.into(),
        }
    }

    /// The single-process default scope used when a client sends none.
    #[must_use]
    pub fn local() -> Self {
        Self::new(LOCAL_TENANT, LOCAL_USER, LOCAL_WORKSPACE)
    }

    /// Fill in any missing part from the local defaults.
    #[must_use]
    pub fn from_parts(
        tenant_id: Option<String>,
        user_id: Option<String>,
        workspace_id: Option<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.unwrap_or_else(|| LOCAL_TENANT.to_owned()),
            user_id: user_id.unwrap_or_else(|| LOCAL_USER.to_owned()),
            workspace_id: workspace_id.unwrap_or_else(|| LOCAL_WORKSPACE.to_owned()),
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_parts_substitutes_defaults() {
        let scope = Scope::from_parts(Some("tenant-a".into()), None, None);
        assert_eq!(scope.tenant_id, "tenant-a");
        assert_eq!(scope.user_id, LOCAL_USER);
        assert_eq!(scope.workspace_id, LOCAL_WORKSPACE);
    }
}

//! Role-based access control
//!
//! Three built-in roles; permissions are derived from the role at token
//! validation time and checked as guards before service invocation.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    VmRead,
    VmWrite,
    StorageRead,
    StorageWrite,
    NetworkRead,
    NetworkWrite,
    NodeRead,
    NodeWrite,
    TaskRead,
    AuditRead,
    UserManage,
}

/// Expand a role name into its permission set. Unknown roles get nothing.
pub fn role_permissions(role: &str) -> Vec<Permission> {
    use Permission::*;
    match role {
        "admin" => vec![
            VmRead, VmWrite, StorageRead, StorageWrite, NetworkRead, NetworkWrite, NodeRead,
            NodeWrite, TaskRead, AuditRead, UserManage,
        ],
        "operator" => vec![
            VmRead, VmWrite, StorageRead, StorageWrite, NetworkRead, NetworkWrite, NodeRead,
            TaskRead,
        ],
        "viewer" => vec![VmRead, StorageRead, NetworkRead, NodeRead, TaskRead],
        _ => Vec::new(),
    }
}

#[allow(dead_code)]
pub fn is_known_role(role: &str) -> bool {
    matches!(role, "admin" | "operator" | "viewer")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_has_user_manage() {
        assert!(role_permissions("admin").contains(&Permission::UserManage));
    }

    #[test]
    fn test_operator_cannot_manage_nodes_or_users() {
        let perms = role_permissions("operator");
        assert!(perms.contains(&Permission::VmWrite));
        assert!(!perms.contains(&Permission::NodeWrite));
        assert!(!perms.contains(&Permission::UserManage));
    }

    #[test]
    fn test_viewer_is_read_only() {
        let perms = role_permissions("viewer");
        assert!(perms.contains(&Permission::VmRead));
        assert!(!perms.iter().any(|p| matches!(
            p,
            Permission::VmWrite | Permission::StorageWrite | Permission::NetworkWrite
        )));
    }

    #[test]
    fn test_unknown_role_gets_nothing() {
        assert!(role_permissions("intern").is_empty());
        assert!(!is_known_role("intern"));
    }
}

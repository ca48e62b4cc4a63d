//! Roles, permissions and role priorities.
//!
//! The role → permission table is fixed at compile time. Priorities are only
//! used to break conflicts between authors under the role-precedence strategy.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A collaborator's role on a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Editor,
    Developer,
    Commenter,
    Viewer,
}

/// A single capability granted by a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    View,
    Edit,
    Comment,
    Export,
    ExportCode,
    Inspect,
    ManagePermissions,
    DeleteDocument,
    InviteUsers,
}

const OWNER: &[Permission] = &[
    Permission::View,
    Permission::Edit,
    Permission::Comment,
    Permission::Export,
    Permission::ExportCode,
    Permission::Inspect,
    Permission::ManagePermissions,
    Permission::DeleteDocument,
    Permission::InviteUsers,
];

const EDITOR: &[Permission] = &[
    Permission::View,
    Permission::Edit,
    Permission::Comment,
    Permission::Export,
    Permission::ExportCode,
    Permission::Inspect,
    Permission::InviteUsers,
];

const DEVELOPER: &[Permission] = &[
    Permission::View,
    Permission::Comment,
    Permission::Export,
    Permission::ExportCode,
    Permission::Inspect,
];

const COMMENTER: &[Permission] = &[Permission::View, Permission::Comment];

const VIEWER: &[Permission] = &[Permission::View];

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Owner,
        Role::Editor,
        Role::Developer,
        Role::Commenter,
        Role::Viewer,
    ];

    pub fn permissions(self) -> &'static [Permission] {
        match self {
            Role::Owner => OWNER,
            Role::Editor => EDITOR,
            Role::Developer => DEVELOPER,
            Role::Commenter => COMMENTER,
            Role::Viewer => VIEWER,
        }
    }

    pub fn has(self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }

    /// Tie-break weight for role-precedence conflict resolution.
    pub fn priority(self) -> u32 {
        match self {
            Role::Owner => 100,
            Role::Editor => 50,
            Role::Developer => 40,
            Role::Commenter => 20,
            Role::Viewer => 10,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Editor => "editor",
            Role::Developer => "developer",
            Role::Commenter => "commenter",
            Role::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Permission::View => "view",
            Permission::Edit => "edit",
            Permission::Comment => "comment",
            Permission::Export => "export",
            Permission::ExportCode => "export_code",
            Permission::Inspect => "inspect",
            Permission::ManagePermissions => "manage_permissions",
            Permission::DeleteDocument => "delete_document",
            Permission::InviteUsers => "invite_users",
        };
        f.write_str(name)
    }
}

/// Lookup of collaborators' roles, consulted when an author is not yet
/// known locally.
pub trait RoleSource: Send + Sync {
    fn role_of(&self, user_id: &str) -> Option<Role>;
}

impl<F> RoleSource for F
where
    F: Fn(&str) -> Option<Role> + Send + Sync,
{
    fn role_of(&self, user_id: &str) -> Option<Role> {
        self(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_role_source() {
        let roles: std::collections::HashMap<String, Role> =
            [("carol".to_string(), Role::Owner)].into_iter().collect();
        let source = move |user: &str| roles.get(user).copied();
        assert_eq!(source.role_of("carol"), Some(Role::Owner));
        assert_eq!(source.role_of("mallory"), None);
    }

    #[test]
    fn test_only_owner_and_editor_can_edit() {
        let editors: Vec<Role> = Role::ALL.into_iter().filter(|r| r.has(Permission::Edit)).collect();
        assert_eq!(editors, vec![Role::Owner, Role::Editor]);
    }

    #[test]
    fn test_owner_has_everything() {
        assert_eq!(Role::Owner.permissions().len(), 9);
        assert!(Role::Owner.has(Permission::DeleteDocument));
        assert!(!Role::Editor.has(Permission::DeleteDocument));
        assert!(!Role::Editor.has(Permission::ManagePermissions));
    }

    #[test]
    fn test_every_role_can_view() {
        assert!(Role::ALL.into_iter().all(|r| r.has(Permission::View)));
    }

    #[test]
    fn test_priorities_descend() {
        let priorities: Vec<u32> = Role::ALL.into_iter().map(Role::priority).collect();
        assert_eq!(priorities, vec![100, 50, 40, 20, 10]);
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&Role::Commenter).unwrap(), "\"commenter\"");
        assert_eq!(
            serde_json::to_string(&Permission::ExportCode).unwrap(),
            "\"export_code\""
        );
        assert_eq!(Permission::ExportCode.to_string(), "export_code");
    }
}

//! Role-based access control: permissions with wildcard matching and roles
//! with chained inheritance.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::principal::Principal;

/// `(resource, action, scope?)`. In a granted permission `"*"` matches
/// anything in that position and a missing scope matches any scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub resource: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl Permission {
    pub fn new(resource: impl Into<String>, action: impl Into<String>) -> Self {
        Permission {
            resource: resource.into(),
            action: action.into(),
            scope: None,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Does this granted permission satisfy `required`?
    pub fn matches(&self, required: &Permission) -> bool {
        let resource_ok = self.resource == "*" || self.resource == required.resource;
        let action_ok = self.action == "*" || self.action == required.action;
        let scope_ok = match (&self.scope, &required.scope) {
            (None, _) => true,
            (Some(granted), Some(required)) => granted == "*" || granted == required,
            (Some(_), None) => false,
        };
        resource_ok && action_ok && scope_ok
    }
}

/// A named permission set, optionally inheriting from a parent role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub permissions: Vec<Permission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Role {
            name: name.into(),
            permissions: Vec::new(),
            parent: None,
        }
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.push(permission);
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }
}

/// Directory of role definitions consulted by permission guards.
pub struct RoleRegistry {
    roles: RwLock<HashMap<String, Role>>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        RoleRegistry {
            roles: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, role: Role) {
        self.roles.write().unwrap().insert(role.name.clone(), role);
    }

    pub fn get(&self, name: &str) -> Option<Role> {
        self.roles.read().unwrap().get(name).cloned()
    }

    /// Own permissions plus everything inherited through the parent chain.
    /// Cycles terminate at the first revisited role.
    pub fn effective_permissions(&self, role_name: &str) -> Vec<Permission> {
        let roles = self.roles.read().unwrap();
        let mut permissions = Vec::new();
        let mut visited = HashSet::new();
        let mut cursor = Some(role_name.to_string());
        while let Some(name) = cursor {
            if !visited.insert(name.clone()) {
                break;
            }
            match roles.get(&name) {
                Some(role) => {
                    permissions.extend(role.permissions.iter().cloned());
                    cursor = role.parent.clone();
                }
                None => break,
            }
        }
        permissions
    }

    pub fn role_has_permission(&self, role_name: &str, required: &Permission) -> bool {
        self.effective_permissions(role_name)
            .iter()
            .any(|granted| granted.matches(required))
    }

    /// Does any of the principal's roles grant `required`?
    pub fn principal_has_permission(&self, principal: &Principal, required: &Permission) -> bool {
        principal
            .roles
            .iter()
            .any(|role| self.role_has_permission(role, required))
    }
}

impl Default for RoleRegistry {
    fn default() -> Self {
        RoleRegistry::new()
    }
}

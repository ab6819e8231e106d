use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// An authenticated identity: the subject of authorization checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub username: String,
    pub roles: Vec<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl Principal {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Principal {
            id: id.into(),
            username: username.into(),
            roles: Vec::new(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    /// Build a principal from validated JWT claims.
    ///
    /// Roles come from a top-level `roles` array or, failing that, from the
    /// Keycloak-style `realm_access.roles`. String-valued claims of common
    /// interest (`email`, `scope`) are kept as attributes.
    pub fn from_claims(claims: &serde_json::Value) -> Principal {
        let id = claims
            .get("sub")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let username = claims
            .get("preferred_username")
            .or_else(|| claims.get("username"))
            .and_then(|v| v.as_str())
            .unwrap_or(&id)
            .to_string();

        let roles = claims
            .get("roles")
            .or_else(|| claims.pointer("/realm_access/roles"))
            .and_then(|v| v.as_array())
            .map(|roles| {
                roles
                    .iter()
                    .filter_map(|r| r.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let mut attributes = HashMap::new();
        for key in ["email", "scope"] {
            if let Some(value) = claims.get(key).and_then(|v| v.as_str()) {
                attributes.insert(key.to_string(), value.to_string());
            }
        }

        Principal {
            id,
            username,
            roles,
            attributes,
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn has_any_role<'a>(&self, roles: impl IntoIterator<Item = &'a str>) -> bool {
        roles.into_iter().any(|r| self.has_role(r))
    }

    pub fn has_all_roles<'a>(&self, roles: impl IntoIterator<Item = &'a str>) -> bool {
        roles.into_iter().all(|r| self.has_role(r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_from_flat_claims() {
        let claims = serde_json::json!({
            "sub": "u-42",
            "preferred_username": "grace",
            "roles": ["user", "admin"],
            "email": "grace@example.com",
        });
        let principal = Principal::from_claims(&claims);
        assert_eq!(principal.id, "u-42");
        assert_eq!(principal.username, "grace");
        assert!(principal.has_role("admin"));
        assert_eq!(
            principal.attributes.get("email").map(String::as_str),
            Some("grace@example.com")
        );
    }

    #[test]
    fn falls_back_to_realm_access_roles() {
        let claims = serde_json::json!({
            "sub": "u-7",
            "realm_access": {"roles": ["viewer"]},
        });
        let principal = Principal::from_claims(&claims);
        assert_eq!(principal.username, "u-7");
        assert_eq!(principal.roles, vec!["viewer"]);
    }

    #[test]
    fn role_set_queries() {
        let principal = Principal::new("u", "u").with_role("user").with_role("ops");
        assert!(principal.has_any_role(["admin", "ops"]));
        assert!(!principal.has_all_roles(["admin", "ops"]));
        assert!(principal.has_all_roles(["user", "ops"]));
    }
}

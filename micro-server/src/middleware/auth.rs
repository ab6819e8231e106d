//! Authentication middleware and the RBAC guards.
//!
//! `jwt_auth` extracts a bearer token from the `Authorization` header, a
//! `token` cookie, or a `token` query parameter, verifies it, and stores
//! `"auth:principal"` and `"jwt_claims"` on the context. The guards read
//! the principal back: no principal means 401, an insufficient one 403.

use std::sync::Arc;

use async_trait::async_trait;
use micro_auth::{bearer_token, JwtValidator, Permission, Principal, RoleRegistry};
use micro_core::{headers, Context, MicroError};
use tracing::debug;

use super::{Middleware, Next};

/// Context key under which the authenticated principal is stored.
pub const PRINCIPAL_KEY: &str = "auth:principal";
/// Context key under which raw JWT claims are stored.
pub const CLAIMS_KEY: &str = "jwt_claims";

pub struct JwtAuthMiddleware {
    validator: Arc<JwtValidator>,
}

impl JwtAuthMiddleware {
    pub fn new(validator: Arc<JwtValidator>) -> Self {
        JwtAuthMiddleware { validator }
    }

    fn extract_token(ctx: &Context) -> Option<String> {
        if let Some(value) = ctx.request.header(headers::AUTHORIZATION) {
            return bearer_token(value).ok().map(str::to_string);
        }
        if let Some(cookies) = ctx.request.header(headers::COOKIE) {
            for cookie in cookies.split(';') {
                if let Some((name, value)) = cookie.trim().split_once('=') {
                    if name == "token" && !value.is_empty() {
                        return Some(value.to_string());
                    }
                }
            }
        }
        if let Some(query) = ctx.request.header(headers::QUERY) {
            for pair in query.split('&') {
                if let Some((name, value)) = pair.split_once('=') {
                    if name == "token" && !value.is_empty() {
                        return Some(value.to_string());
                    }
                }
            }
        }
        None
    }
}

#[async_trait]
impl Middleware for JwtAuthMiddleware {
    fn name(&self) -> &'static str {
        "jwt_auth"
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), MicroError> {
        let Some(token) = Self::extract_token(ctx) else {
            return Err(MicroError::Unauthorized("missing bearer token".into()));
        };
        let claims = self
            .validator
            .validate(&token)
            .map_err(|e| MicroError::Unauthorized(e.public_message().to_string()))?;
        let principal = Principal::from_claims(&claims);
        debug!(sub = %principal.id, "authenticated");
        ctx.set(PRINCIPAL_KEY, principal);
        ctx.set(CLAIMS_KEY, claims);
        next.run(ctx).await
    }
}

/// Require one (or all) of a set of roles.
pub struct RoleGuard {
    roles: Vec<String>,
    require_all: bool,
}

impl RoleGuard {
    pub fn any_of(roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        RoleGuard {
            roles: roles.into_iter().map(Into::into).collect(),
            require_all: false,
        }
    }

    pub fn all_of(roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        RoleGuard {
            roles: roles.into_iter().map(Into::into).collect(),
            require_all: true,
        }
    }
}

#[async_trait]
impl Middleware for RoleGuard {
    fn name(&self) -> &'static str {
        "role_guard"
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), MicroError> {
        let principal = ctx
            .get::<Principal>(PRINCIPAL_KEY)
            .ok_or_else(|| MicroError::Unauthorized("authentication required".into()))?;
        let roles = self.roles.iter().map(String::as_str);
        let allowed = if self.require_all {
            principal.has_all_roles(roles)
        } else {
            principal.has_any_role(roles)
        };
        if !allowed {
            return Err(MicroError::Forbidden("insufficient roles".into()));
        }
        next.run(ctx).await
    }
}

/// Require one (or all) of a set of permissions, resolved through the role
/// registry with inheritance.
pub struct PermissionGuard {
    permissions: Vec<Permission>,
    require_all: bool,
    registry: Arc<RoleRegistry>,
}

impl PermissionGuard {
    pub fn any_of(
        registry: Arc<RoleRegistry>,
        permissions: impl IntoIterator<Item = Permission>,
    ) -> Self {
        PermissionGuard {
            permissions: permissions.into_iter().collect(),
            require_all: false,
            registry,
        }
    }

    pub fn all_of(
        registry: Arc<RoleRegistry>,
        permissions: impl IntoIterator<Item = Permission>,
    ) -> Self {
        PermissionGuard {
            permissions: permissions.into_iter().collect(),
            require_all: true,
            registry,
        }
    }
}

#[async_trait]
impl Middleware for PermissionGuard {
    fn name(&self) -> &'static str {
        "permission_guard"
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), MicroError> {
        let principal = ctx
            .get::<Principal>(PRINCIPAL_KEY)
            .ok_or_else(|| MicroError::Unauthorized("authentication required".into()))?;
        let mut checks = self
            .permissions
            .iter()
            .map(|p| self.registry.principal_has_permission(principal, p));
        let allowed = if self.require_all {
            checks.all(|granted| granted)
        } else {
            checks.any(|granted| granted)
        };
        if !allowed {
            return Err(MicroError::Forbidden("insufficient permissions".into()));
        }
        next.run(ctx).await
    }
}

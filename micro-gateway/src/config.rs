use std::sync::Arc;
use std::time::Duration;

use micro_auth::JwtValidator;
use micro_core::RuntimeConfig;
use micro_server::middleware::{CorsConfig, RateLimitConfig};

use crate::router::Route;

/// Per-backend policy: which RPC methods the gateway may call, and default
/// call parameters.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub version: String,
    /// Empty means every method is exposed (minus `blocked_methods`).
    pub exposed_methods: Vec<String>,
    pub blocked_methods: Vec<String>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        ServiceConfig {
            name: name.into(),
            version: "*".to_string(),
            exposed_methods: Vec::new(),
            blocked_methods: Vec::new(),
            timeout: None,
            retries: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn expose(mut self, methods: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.exposed_methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn block(mut self, methods: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.blocked_methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// A method is callable iff it is exposed (or the allow-list is empty)
    /// and not blocked.
    pub fn method_allowed(&self, method: &str) -> bool {
        let exposed = self.exposed_methods.is_empty()
            || self.exposed_methods.iter().any(|m| m == method);
        let blocked = self.blocked_methods.iter().any(|m| m == method);
        exposed && !blocked
    }
}

/// Gateway assembly: bind address, backends, routes, and the edge policies
/// applied by the middleware chain.
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub title: String,
    pub version: String,
    pub services: Vec<ServiceConfig>,
    pub routes: Vec<Route>,
    pub cors: Option<CorsConfig>,
    pub rate_limit: Option<RateLimitConfig>,
    pub jwt: Option<Arc<JwtValidator>>,
    pub max_request_bytes: Option<usize>,
    pub default_timeout: Duration,
}

impl GatewayConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        GatewayConfig {
            host: host.into(),
            port,
            title: "micro gateway".to_string(),
            version: "0.1.0".to_string(),
            services: Vec::new(),
            routes: Vec::new(),
            cors: None,
            rate_limit: None,
            jwt: None,
            max_request_bytes: None,
            default_timeout: Duration::from_secs(10),
        }
    }

    /// Bind address from `GATEWAY_HOST` / `GATEWAY_PORT` (environment-first
    /// runtime configuration).
    pub fn from_runtime(config: &RuntimeConfig) -> Self {
        GatewayConfig::new(config.gateway_host.clone(), config.gateway_port)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn with_title(mut self, title: impl Into<String>, version: impl Into<String>) -> Self {
        self.title = title.into();
        self.version = version.into();
        self
    }

    pub fn with_service(mut self, service: ServiceConfig) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    pub fn with_cors(mut self, cors: CorsConfig) -> Self {
        self.cors = Some(cors);
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub fn with_jwt(mut self, validator: Arc<JwtValidator>) -> Self {
        self.jwt = Some(validator);
        self
    }

    pub fn with_max_request_bytes(mut self, max: usize) -> Self {
        self.max_request_bytes = Some(max);
        self
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposure_rule() {
        let open = ServiceConfig::new("catalog");
        assert!(open.method_allowed("list"));

        let listed = ServiceConfig::new("catalog").expose(["list", "get"]);
        assert!(listed.method_allowed("list"));
        assert!(!listed.method_allowed("delete"));

        let blocked = ServiceConfig::new("catalog").block(["purge"]);
        assert!(blocked.method_allowed("list"));
        assert!(!blocked.method_allowed("purge"));

        let both = ServiceConfig::new("catalog")
            .expose(["list", "purge"])
            .block(["purge"]);
        assert!(both.method_allowed("list"));
        assert!(!both.method_allowed("purge"));
    }

    #[test]
    fn address_formatting() {
        let config = GatewayConfig::new("0.0.0.0", 8080);
        assert_eq!(config.address(), "0.0.0.0:8080");
    }
}

use async_trait::async_trait;
use micro_core::{headers, Context, MicroError};

use super::{Middleware, Next};

/// CORS policy: origin allow-list with `*.domain` wildcards.
#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub allow_origins: Vec<String>,
    pub allow_methods: Vec<String>,
    pub allow_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        CorsConfig {
            allow_origins: vec!["*".to_string()],
            allow_methods: ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            allow_headers: vec!["content-type".to_string(), "authorization".to_string()],
            allow_credentials: false,
            max_age_secs: 600,
        }
    }
}

impl CorsConfig {
    fn origin_allowed(&self, origin: &str) -> bool {
        let host = origin
            .strip_prefix("https://")
            .or_else(|| origin.strip_prefix("http://"))
            .unwrap_or(origin);
        self.allow_origins.iter().any(|pattern| {
            if pattern == "*" || pattern == origin {
                return true;
            }
            match pattern.strip_prefix("*.") {
                Some(suffix) => host == suffix || host.ends_with(&format!(".{suffix}")),
                None => false,
            }
        })
    }
}

/// Writes preflight responses for `OPTIONS` and echoes allow headers on
/// simple requests.
pub struct CorsMiddleware {
    config: CorsConfig,
}

impl CorsMiddleware {
    pub fn new(config: CorsConfig) -> Self {
        CorsMiddleware { config }
    }

    fn allow_origin_value(&self, origin: &str) -> String {
        if self.config.allow_credentials || !self.config.allow_origins.contains(&"*".to_string())
        {
            origin.to_string()
        } else {
            "*".to_string()
        }
    }

    fn write_allow_headers(&self, ctx: &mut Context, origin: &str) {
        let allow_origin = self.allow_origin_value(origin);
        ctx.response
            .set_header("access-control-allow-origin", &allow_origin);
        if self.config.allow_credentials {
            ctx.response
                .set_header("access-control-allow-credentials", "true");
        }
    }
}

#[async_trait]
impl Middleware for CorsMiddleware {
    fn name(&self) -> &'static str {
        "cors"
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), MicroError> {
        let origin = ctx.request.header(headers::ORIGIN).map(str::to_string);
        let method = ctx
            .request
            .header(headers::HTTP_METHOD)
            .unwrap_or("POST")
            .to_string();

        if method.eq_ignore_ascii_case("OPTIONS") {
            // Preflight is answered here, never proxied.
            ctx.response.status = 204;
            ctx.response.body = bytes::Bytes::new();
            if let Some(origin) = origin.filter(|o| self.config.origin_allowed(o)) {
                self.write_allow_headers(ctx, &origin);
                ctx.response.set_header(
                    "access-control-allow-methods",
                    &self.config.allow_methods.join(", "),
                );
                ctx.response.set_header(
                    "access-control-allow-headers",
                    &self.config.allow_headers.join(", "),
                );
                ctx.response.set_header(
                    "access-control-max-age",
                    &self.config.max_age_secs.to_string(),
                );
            }
            return Ok(());
        }

        let result = next.run(ctx).await;
        if let Some(origin) = origin.filter(|o| self.config.origin_allowed(o)) {
            self.write_allow_headers(ctx, &origin);
        }
        result
    }
}

//! Per-service proxy: translates a gateway route hit into a backend RPC
//! call with the service's policies applied.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use micro_client::Client;
use micro_core::{headers, MicroError, TransportRequest, TransportResponse};

use crate::config::ServiceConfig;
use crate::router::Route;
use crate::transform;

/// Headers that describe the inbound hop and must not be forwarded.
const HOP_HEADERS: &[&str] = &[
    headers::HTTP_METHOD,
    headers::QUERY,
    headers::STREAM_ID,
    headers::CONTENT_LENGTH,
    "accept-encoding",
];

pub struct ServiceProxy {
    config: ServiceConfig,
    client: Arc<Client>,
    default_timeout: Duration,
}

impl ServiceProxy {
    pub fn new(config: ServiceConfig, client: Arc<Client>, default_timeout: Duration) -> Self {
        ServiceProxy {
            config,
            client,
            default_timeout,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Call one backend method with the service's exposure rule and call
    /// policies. Route-level timeout/retries override service-level ones.
    pub async fn call(
        &self,
        method: &str,
        inbound: &TransportRequest,
        timeout: Option<Duration>,
        retries: Option<u32>,
        body: Bytes,
    ) -> Result<TransportResponse, MicroError> {
        if !self.config.method_allowed(method) {
            return Err(MicroError::NotFound(format!(
                "method {method:?} is not exposed on service {:?}",
                self.config.name
            )));
        }

        let timeout = timeout
            .or(self.config.timeout)
            .unwrap_or(self.default_timeout);
        let retries = retries.or(self.config.retries).unwrap_or(0);

        let mut request = TransportRequest::new(self.config.name.clone(), method)
            .with_body(body)
            .with_content_type(inbound.content_type.clone())
            .with_timeout(timeout);
        for (name, value) in &inbound.headers {
            if HOP_HEADERS.contains(&name.as_str()) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                request.set_header(name.as_str(), value);
            }
        }

        self.client.call_with_retries(&request, retries).await
    }

    /// Call the route's backend method and run its response
    /// transformations.
    pub async fn call_route(
        &self,
        route: &Route,
        inbound: &TransportRequest,
        body: Bytes,
    ) -> Result<TransportResponse, MicroError> {
        let mut response = self
            .call(
                &route.service_method,
                inbound,
                route.timeout,
                route.retries,
                body,
            )
            .await?;

        if !route.transformations.is_empty() && response.status < 400 {
            if let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(&response.body) {
                transform::apply_all(&route.transformations, &mut value);
                response.body = Bytes::from(value.to_string());
            }
        }
        Ok(response)
    }
}

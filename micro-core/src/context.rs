use std::any::Any;
use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::message::{TransportRequest, TransportResponse};

/// Per-request scratch space.
///
/// Created by the server when an inbound request is decoded and dropped after
/// the response is written. The attribute map is the only channel between
/// middleware and handlers: the JWT middleware stores `"auth:principal"` and
/// `"jwt_claims"`, guards read them back.
pub struct Context {
    pub request: TransportRequest,
    pub response: TransportResponse,
    attributes: HashMap<String, Box<dyn Any + Send + Sync>>,
    cancel: CancellationToken,
}

impl Context {
    pub fn new(request: TransportRequest) -> Self {
        Context::build(request, CancellationToken::new())
    }

    /// Context whose cancellation follows `parent` (e.g. server shutdown)
    /// in addition to its own `cancel()`.
    pub fn with_parent(request: TransportRequest, parent: &CancellationToken) -> Self {
        Context::build(request, parent.child_token())
    }

    fn build(request: TransportRequest, cancel: CancellationToken) -> Self {
        let mut response = TransportResponse::ok();
        response.content_type = request.content_type.clone();
        Context {
            request,
            response,
            attributes: HashMap::new(),
            cancel,
        }
    }

    /// Store a typed attribute under `key`, replacing any previous value.
    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.attributes.insert(key.into(), Box::new(value));
    }

    /// Read a typed attribute. Returns `None` when absent or of another type.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.attributes.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    /// The request's cancellation signal. Cancellation is advisory; handlers
    /// are expected to check it cooperatively and abort cleanly.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

//! The dispatcher builds a [`Context`] from a decoded message, runs the
//! middleware chain into a handler, and encodes the context's response back
//! into a wire message. The `x-status-code` header always equals the
//! response status.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use micro_core::codec::CodecRegistry;
use micro_core::{headers, Context, Message, MicroError, TransportRequest};
use tokio_util::sync::CancellationToken;

use crate::handler::{raw_fn, Handler};
use crate::middleware::{Middleware, Next};

/// Map a semantic error onto a response: status, JSON body, and the error
/// slot.
pub fn apply_error(response: &mut micro_core::TransportResponse, err: MicroError) {
    response.status = err.status();
    response.body = Bytes::from(err.body().to_string());
    response.content_type = "application/json".to_string();
    response.error = Some(err);
}

/// Ordered middleware around a table of handlers.
pub struct Dispatcher {
    middleware: Vec<Arc<dyn Middleware>>,
    handlers: HashMap<String, Arc<dyn Handler>>,
    fallback: Arc<dyn Handler>,
    codecs: Arc<CodecRegistry>,
}

impl Dispatcher {
    pub fn new(codecs: Arc<CodecRegistry>) -> Self {
        Dispatcher {
            middleware: Vec::new(),
            handlers: HashMap::new(),
            fallback: raw_fn(|ctx| {
                Err(MicroError::NotFound(format!(
                    "no handler for endpoint {:?}",
                    ctx.request.endpoint
                )))
            }),
            codecs,
        }
    }

    /// Append a middleware. Order of calls is execution order.
    pub fn apply(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Register a handler under an endpoint name.
    pub fn handle(mut self, endpoint: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(endpoint.into(), handler);
        self
    }

    /// Handler for endpoints with no registered entry (404 by default).
    /// The gateway installs its router here.
    pub fn fallback(mut self, handler: Arc<dyn Handler>) -> Self {
        self.fallback = handler;
        self
    }

    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.codecs
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Run one inbound message through the chain and produce the response
    /// message.
    pub async fn dispatch(&self, msg: &Message) -> Message {
        self.dispatch_with_parent(msg, None).await
    }

    /// Like [`dispatch`](Self::dispatch), with the context's cancellation
    /// chained to `parent` (used for shutdown grace).
    pub async fn dispatch_with_parent(
        &self,
        msg: &Message,
        parent: Option<&CancellationToken>,
    ) -> Message {
        let request = TransportRequest::from_message(msg);
        let mut ctx = match parent {
            Some(parent) => Context::with_parent(request, parent),
            None => Context::new(request),
        };

        let handler = self
            .handlers
            .get(&ctx.request.endpoint)
            .unwrap_or(&self.fallback)
            .clone();
        let next = Next::new(&self.middleware, handler.as_ref());
        if let Err(err) = next.run(&mut ctx).await {
            // Reached only when the chain carries no error_handler.
            apply_error(&mut ctx.response, err);
        }

        encode_response(msg, ctx)
    }
}

fn encode_response(msg: &Message, ctx: Context) -> Message {
    let mut response = msg.response(ctx.response.status, ctx.response.body.clone());
    for (name, value) in &ctx.response.headers {
        if name.as_str() == headers::STATUS_CODE {
            continue;
        }
        if let Ok(value) = value.to_str() {
            response.set_header(name.as_str(), value);
        }
    }
    response.set_header(headers::CONTENT_TYPE, &ctx.response.content_type);
    response
}

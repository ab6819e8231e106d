//! Handler contract and the typed registration adapter.
//!
//! Services register a plain table of `endpoint -> handler`. Generated or
//! hand-written glue wraps a typed function with [`method_fn`], which
//! performs content negotiation against a [`CodecRegistry`] and bridges
//! payloads through the dynamic value tree.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use micro_core::codec::{Codec, CodecRegistry};
use micro_core::{headers, Context, MicroError};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A request handler: writes its outcome into `ctx.response` or returns a
/// semantic error for the error-handler middleware to map.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: &mut Context) -> Result<(), MicroError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&mut Context) -> Result<(), MicroError> + Send + Sync,
{
    async fn call(&self, ctx: &mut Context) -> Result<(), MicroError> {
        (self.0)(ctx)
    }
}

/// Wrap a synchronous closure operating directly on the context.
pub fn raw_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(&mut Context) -> Result<(), MicroError> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

struct MethodHandler<Req, Resp, F, Fut> {
    codecs: Arc<CodecRegistry>,
    f: F,
    _marker: std::marker::PhantomData<fn() -> (Req, Resp, Fut)>,
}

#[async_trait]
impl<Req, Resp, F, Fut> Handler for MethodHandler<Req, Resp, F, Fut>
where
    Req: DeserializeOwned + Send,
    Resp: Serialize + Send,
    F: Fn(Req) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Resp, MicroError>> + Send,
{
    async fn call(&self, ctx: &mut Context) -> Result<(), MicroError> {
        let accept = ctx.request.header(headers::ACCEPT).map(str::to_string);
        let content_type = match ctx.request.header(headers::CONTENT_TYPE) {
            Some(ct) => ct.to_string(),
            // No header: sniff the body, fall back to the declared default.
            None => self
                .codecs
                .sniff(&ctx.request.body)
                .map(|c| c.content_type().to_string())
                .unwrap_or_else(|| ctx.request.content_type.clone()),
        };
        let Some((request_codec, response_codec)) =
            self.codecs.negotiate(&content_type, accept.as_deref())
        else {
            unsupported_media_type(ctx, &content_type);
            return Ok(());
        };

        let request: Req = decode_request(request_codec.as_ref(), &ctx.request.body)?;
        let response = (self.f)(request).await?;

        let tree = serde_json::to_value(&response)
            .map_err(|e| MicroError::Internal(e.to_string()))?;
        let body = response_codec
            .marshal(&tree)
            .map_err(|e| MicroError::Internal(e.to_string()))?;
        ctx.response.status = 200;
        ctx.response.body = Bytes::from(body);
        ctx.response.content_type = response_codec.content_type().to_string();
        Ok(())
    }
}

/// Wrap a typed async function `Req -> Result<Resp>` with codec
/// negotiation.
pub fn method_fn<Req, Resp, F, Fut>(codecs: Arc<CodecRegistry>, f: F) -> Arc<dyn Handler>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, MicroError>> + Send + 'static,
{
    Arc::new(MethodHandler {
        codecs,
        f,
        _marker: std::marker::PhantomData,
    })
}

fn decode_request<Req: DeserializeOwned>(
    codec: &dyn Codec,
    body: &[u8],
) -> Result<Req, MicroError> {
    let tree = if body.is_empty() {
        serde_json::Value::Null
    } else {
        codec
            .unmarshal(body)
            .map_err(|e| MicroError::BadRequest(e.to_string()))?
    };
    serde_json::from_value(tree).map_err(|e| MicroError::BadRequest(e.to_string()))
}

/// 415 is outside the semantic error taxonomy; write it directly.
fn unsupported_media_type(ctx: &mut Context, content_type: &str) {
    let body = serde_json::json!({
        "error": format!("no codec registered for {content_type:?}"),
        "type": "UnsupportedMediaTypeError",
    });
    ctx.response.status = 415;
    ctx.response.body = Bytes::from(body.to_string());
    ctx.response.content_type = "application/json".to_string();
}

#[cfg(test)]
mod tests {
    use super::*;
    use micro_core::TransportRequest;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct HelloRequest {
        name: String,
    }

    fn hello_handler() -> Arc<dyn Handler> {
        method_fn(
            Arc::new(CodecRegistry::with_defaults()),
            |req: HelloRequest| async move { Ok(format!("Hello, {}!", req.name)) },
        )
    }

    fn json_request(body: &str) -> TransportRequest {
        let mut request = TransportRequest::new("hello", "hello")
            .with_body(Bytes::from(body.to_string()));
        request.set_header(headers::CONTENT_TYPE, "application/json");
        request
    }

    #[tokio::test]
    async fn typed_handler_round_trip() {
        let handler = hello_handler();
        let mut ctx = Context::new(json_request("{\"name\":\"World\"}"));
        handler.call(&mut ctx).await.unwrap();
        assert_eq!(ctx.response.status, 200);
        assert_eq!(&ctx.response.body[..], b"\"Hello, World!\"");
        assert_eq!(ctx.response.content_type, "application/json");
    }

    #[tokio::test]
    async fn accept_header_switches_response_codec() {
        let handler = hello_handler();
        let mut request = json_request("{\"name\":\"World\"}");
        request.set_header(headers::ACCEPT, "application/msgpack");
        let mut ctx = Context::new(request);
        handler.call(&mut ctx).await.unwrap();
        assert_eq!(ctx.response.content_type, "application/msgpack");
        let tree = rmp_serde::from_slice::<serde_json::Value>(&ctx.response.body).unwrap();
        assert_eq!(tree, serde_json::json!("Hello, World!"));
    }

    #[tokio::test]
    async fn unknown_content_type_is_415() {
        let handler = hello_handler();
        let mut request = TransportRequest::new("hello", "hello")
            .with_body(Bytes::from_static(b"<xml/>"));
        request.set_header(headers::CONTENT_TYPE, "application/xml");
        let mut ctx = Context::new(request);
        handler.call(&mut ctx).await.unwrap();
        assert_eq!(ctx.response.status, 415);
        let body: serde_json::Value = serde_json::from_slice(&ctx.response.body).unwrap();
        assert_eq!(body["type"], "UnsupportedMediaTypeError");
    }

    #[tokio::test]
    async fn missing_content_type_is_sniffed() {
        let handler = hello_handler();
        let request = TransportRequest::new("hello", "hello")
            .with_body(Bytes::from_static(b"{\"name\":\"Ada\"}"));
        let mut ctx = Context::new(request);
        handler.call(&mut ctx).await.unwrap();
        assert_eq!(ctx.response.status, 200);
        assert_eq!(&ctx.response.body[..], b"\"Hello, Ada!\"");
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let handler = hello_handler();
        let mut ctx = Context::new(json_request("{\"name\":"));
        let err = handler.call(&mut ctx).await.unwrap_err();
        assert_eq!(err.status(), 400);
    }
}

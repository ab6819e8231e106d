//! Header names used on the wire by every transport.
//!
//! All names are lowercase so they can be fed to `http::HeaderName` directly.

/// Authoritative status code on responses, numeric text.
pub const STATUS_CODE: &str = "x-status-code";
/// Message correlation id.
pub const MESSAGE_ID: &str = "x-message-id";
/// Message type (`request`, `response`, `event`, `error`).
pub const MESSAGE_TYPE: &str = "x-message-type";
/// Target service name.
pub const TARGET: &str = "x-micro-service";
/// Endpoint the message addresses, echoed on responses.
pub const ENDPOINT: &str = "x-micro-endpoint";
/// Caller timeout in milliseconds, informational.
pub const TIMEOUT: &str = "x-timeout";
/// Correlation id generated or propagated by the request_id middleware.
pub const REQUEST_ID: &str = "x-request-id";
/// HTTP/2 stream correlation, set by the transport on inbound streams.
pub const STREAM_ID: &str = "__stream_id";
/// HTTP method of the framed request; `POST` when absent.
pub const HTTP_METHOD: &str = "x-http-method";
/// Query string of the framed request path, without the `?`.
pub const QUERY: &str = "x-query";

pub const CONTENT_TYPE: &str = "content-type";
pub const CONTENT_LENGTH: &str = "content-length";
pub const ACCEPT: &str = "accept";
pub const AUTHORIZATION: &str = "authorization";
pub const COOKIE: &str = "cookie";
pub const ORIGIN: &str = "origin";

pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const RETRY_AFTER: &str = "retry-after";
pub const RESPONSE_TIME: &str = "x-response-time";

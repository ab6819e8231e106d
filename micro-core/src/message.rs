use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};
use uuid::Uuid;

use crate::error::MicroError;
use crate::headers;

/// Kind of a [`Message`] travelling over a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Request,
    Response,
    Event,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Event => "event",
            MessageType::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<MessageType> {
        match s {
            "request" => Some(MessageType::Request),
            "response" => Some(MessageType::Response),
            "event" => Some(MessageType::Event),
            "error" => Some(MessageType::Error),
            _ => None,
        }
    }
}

/// The unit every transport moves between peers.
///
/// `id` is assigned once and preserved across the message's lifetime so
/// responses can be correlated with their request. `headers` is the same
/// case-insensitive multimap end-to-end; transports must carry every
/// non-pseudo header and the body bytes byte-for-byte.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub msg_type: MessageType,
    pub target: String,
    pub endpoint: String,
    pub body: Bytes,
    pub headers: HeaderMap,
    pub timestamp: SystemTime,
}

impl Message {
    pub fn new(msg_type: MessageType, target: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Message {
            id: Uuid::new_v4().to_string(),
            msg_type,
            target: target.into(),
            endpoint: endpoint.into(),
            body: Bytes::new(),
            headers: HeaderMap::new(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn request(target: impl Into<String>, endpoint: impl Into<String>, body: Bytes) -> Self {
        let mut msg = Message::new(MessageType::Request, target, endpoint);
        msg.body = body;
        msg
    }

    pub fn event(target: impl Into<String>, endpoint: impl Into<String>, body: Bytes) -> Self {
        let mut msg = Message::new(MessageType::Event, target, endpoint);
        msg.body = body;
        msg
    }

    /// Build the response to this message: same id, same endpoint, status
    /// carried in the `x-status-code` header.
    pub fn response(&self, status: u16, body: Bytes) -> Message {
        let mut resp = Message {
            id: self.id.clone(),
            msg_type: MessageType::Response,
            target: self.target.clone(),
            endpoint: self.endpoint.clone(),
            body,
            headers: HeaderMap::new(),
            timestamp: SystemTime::now(),
        };
        resp.set_header(headers::STATUS_CODE, &status.to_string());
        if let Some(stream_id) = self.header(headers::STREAM_ID) {
            let stream_id = stream_id.to_string();
            resp.set_header(headers::STREAM_ID, &stream_id);
        }
        resp
    }

    /// Read a header as a string, first value wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Set a header, replacing existing values. Invalid names or values are
    /// dropped silently; wire headers are produced by this crate and are
    /// always valid.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::from_str(value)) {
            self.headers.insert(name, value);
        }
    }

    /// Status carried in `x-status-code`, if any.
    pub fn status(&self) -> Option<u16> {
        self.header(headers::STATUS_CODE).and_then(|v| v.parse().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(headers::CONTENT_TYPE)
    }
}

/// Request shape handed to the client and reconstructed by the dispatcher.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub service: String,
    pub endpoint: String,
    pub body: Bytes,
    pub headers: HeaderMap,
    pub content_type: String,
    pub timeout: Option<Duration>,
}

impl TransportRequest {
    pub fn new(service: impl Into<String>, endpoint: impl Into<String>) -> Self {
        TransportRequest {
            service: service.into(),
            endpoint: endpoint.into(),
            body: Bytes::new(),
            headers: HeaderMap::new(),
            content_type: "application/json".to_string(),
            timeout: None,
        }
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::from_str(value)) {
            self.headers.insert(name, value);
        }
    }

    /// Turn this request into a wire message addressed at its service.
    pub fn into_message(self) -> Message {
        let mut msg = Message::request(self.service, self.endpoint, self.body);
        msg.headers = self.headers;
        let content_type = self.content_type;
        msg.set_header(headers::CONTENT_TYPE, &content_type);
        if let Some(timeout) = self.timeout {
            msg.set_header(headers::TIMEOUT, &timeout.as_millis().to_string());
        }
        msg
    }

    /// Rebuild a request from a decoded inbound message.
    pub fn from_message(msg: &Message) -> Self {
        let content_type = msg
            .content_type()
            .unwrap_or("application/json")
            .to_string();
        let timeout = msg
            .header(headers::TIMEOUT)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis);
        TransportRequest {
            service: msg.target.clone(),
            endpoint: msg.endpoint.clone(),
            body: msg.body.clone(),
            headers: msg.headers.clone(),
            content_type,
            timeout,
        }
    }
}

/// Response shape produced by handlers and translated back by the client.
#[derive(Debug)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
    pub headers: HeaderMap,
    pub content_type: String,
    pub error: Option<MicroError>,
}

impl TransportResponse {
    pub fn new(status: u16) -> Self {
        TransportResponse {
            status,
            body: Bytes::new(),
            headers: HeaderMap::new(),
            content_type: "application/json".to_string(),
            error: None,
        }
    }

    pub fn ok() -> Self {
        TransportResponse::new(200)
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::from_str(value)) {
            self.headers.insert(name, value);
        }
    }

    /// Lift a wire response into the typed shape. The `x-status-code` header
    /// is authoritative; 5xx and 4xx statuses populate `error`.
    pub fn from_message(msg: &Message) -> Self {
        let status = msg.status().unwrap_or(200);
        let content_type = msg
            .content_type()
            .unwrap_or("application/json")
            .to_string();
        let error = if status >= 400 {
            let message = serde_json::from_slice::<serde_json::Value>(&msg.body)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
                .unwrap_or_else(|| format!("status {status}"));
            Some(MicroError::from_status(status, message))
        } else {
            None
        };
        TransportResponse {
            status,
            body: msg.body.clone(),
            headers: msg.headers.clone(),
            content_type,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_preserves_id_and_endpoint() {
        let req = Message::request("catalog", "list", Bytes::from_static(b"{}"));
        let resp = req.response(200, Bytes::new());
        assert_eq!(resp.id, req.id);
        assert_eq!(resp.endpoint, req.endpoint);
        assert_eq!(resp.msg_type, MessageType::Response);
        assert_eq!(resp.status(), Some(200));
    }

    #[test]
    fn headers_are_case_insensitive() {
        let mut msg = Message::new(MessageType::Request, "svc", "op");
        msg.set_header("X-Custom", "value");
        assert_eq!(msg.header("x-custom"), Some("value"));
    }

    #[test]
    fn request_round_trips_through_message() {
        let req = TransportRequest::new("orders", "list_recent")
            .with_body(Bytes::from_static(b"{\"n\":5}"))
            .with_timeout(Duration::from_millis(1500));
        let msg = req.clone().into_message();
        assert_eq!(msg.target, "orders");
        assert_eq!(msg.endpoint, "list_recent");
        assert_eq!(msg.header(crate::headers::TIMEOUT), Some("1500"));

        let rebuilt = TransportRequest::from_message(&msg);
        assert_eq!(rebuilt.service, "orders");
        assert_eq!(rebuilt.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(rebuilt.body, req.body);
    }

    #[test]
    fn error_status_lifts_into_error() {
        let req = Message::request("svc", "op", Bytes::new());
        let resp = req.response(503, Bytes::from_static(b"{\"error\":\"down\",\"type\":\"ServiceUnavailableError\"}"));
        let lifted = TransportResponse::from_message(&resp);
        assert_eq!(lifted.status, 503);
        let err = lifted.error.expect("error populated");
        assert_eq!(err.kind(), "ServiceUnavailableError");
        assert_eq!(err.message(), "down");
    }

    #[test]
    fn message_type_string_round_trip() {
        for t in [
            MessageType::Request,
            MessageType::Response,
            MessageType::Event,
            MessageType::Error,
        ] {
            assert_eq!(MessageType::parse(t.as_str()), Some(t));
        }
        assert_eq!(MessageType::parse("bogus"), None);
    }
}

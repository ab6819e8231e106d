//! TCP-framed HTTP/1 transport.
//!
//! One request and one response per socket cycle; the socket stays open and
//! can run further cycles, which is what the connection pool relies on.
//! Response status travels in `x-status-code` with the HTTP status line
//! mirroring it.

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use micro_core::{headers, Message, MessageType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::{DialOptions, Listener, Socket, Transport, TransportError};

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 96;

/// HTTP/1 framed transport over TCP.
pub struct HttpTransport;

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_string());
        Ok(Box::new(HttpListener {
            inner: Some(listener),
            addr,
        }))
    }

    async fn dial(&self, addr: &str, opts: DialOptions) -> Result<Box<dyn Socket>, TransportError> {
        let connect = TcpStream::connect(addr);
        let stream = match opts.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| TransportError::Timeout(format!("dialing {addr}")))??,
            None => connect.await?,
        };
        stream.set_nodelay(true).ok();
        Ok(Box::new(HttpSocket::new(stream, Role::Client, opts)))
    }
}

pub struct HttpListener {
    inner: Option<TcpListener>,
    addr: String,
}

#[async_trait]
impl Listener for HttpListener {
    fn addr(&self) -> String {
        self.addr.clone()
    }

    async fn accept(&mut self) -> Result<Box<dyn Socket>, TransportError> {
        let listener = self.inner.as_ref().ok_or(TransportError::NotConnected)?;
        let (stream, _) = listener.accept().await?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(HttpSocket::new(
            stream,
            Role::Server,
            DialOptions::default(),
        )))
    }

    async fn accept_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Box<dyn Socket>>, TransportError> {
        match tokio::time::timeout(timeout, self.accept()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.take();
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Role {
    /// Sends requests, receives responses.
    Client,
    /// Receives requests, sends responses.
    Server,
}

pub struct HttpSocket {
    stream: Option<TcpStream>,
    buf: BytesMut,
    role: Role,
    local: String,
    remote: String,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl HttpSocket {
    fn new(stream: TcpStream, role: Role, opts: DialOptions) -> Self {
        let local = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let remote = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        HttpSocket {
            stream: Some(stream),
            buf: BytesMut::with_capacity(4096),
            role,
            local,
            remote,
            read_timeout: opts.read_timeout,
            write_timeout: opts.write_timeout,
        }
    }

    async fn write_frame(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        let timeout = self.write_timeout;
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let write = async {
            stream.write_all(&frame).await?;
            stream.flush().await?;
            Ok::<_, TransportError>(())
        };
        match timeout {
            Some(timeout_dur) => tokio::time::timeout(timeout_dur, write)
                .await
                .map_err(|_| TransportError::Timeout("write".into()))?,
            None => write.await,
        }
    }

    /// Read until one full message has been framed out of the buffer.
    async fn read_message(&mut self) -> Result<Message, TransportError> {
        loop {
            if let Some(msg) = self.try_parse()? {
                return Ok(msg);
            }
            if self.buf.len() > MAX_HEAD_BYTES {
                return Err(TransportError::InvalidMessage("header section too large".into()));
            }
            let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
            let n = stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                self.stream.take();
                return if self.buf.is_empty() {
                    Err(TransportError::NotConnected)
                } else {
                    Err(TransportError::ConnectionReset("peer closed mid-message".into()))
                };
            }
        }
    }

    /// Attempt to frame one message from the buffered bytes.
    fn try_parse(&mut self) -> Result<Option<Message>, TransportError> {
        let head = match self.role {
            Role::Server => parse_request_head(&self.buf)?,
            Role::Client => parse_response_head(&self.buf)?,
        };
        let Some(head) = head else { return Ok(None) };
        if self.buf.len() < head.head_len + head.content_length {
            return Ok(None);
        }
        let _ = self.buf.split_to(head.head_len);
        let body = self.buf.split_to(head.content_length).freeze();
        Ok(Some(build_message(head, body)))
    }
}

#[async_trait]
impl Socket for HttpSocket {
    async fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        let frame = match msg.msg_type {
            MessageType::Request | MessageType::Event => encode_request(&msg),
            MessageType::Response | MessageType::Error => encode_response(&msg),
        };
        self.write_frame(frame).await
    }

    async fn recv(&mut self) -> Result<Message, TransportError> {
        match self.read_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.read_message()).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout("read".into())),
            },
            None => self.read_message().await,
        }
    }

    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Message>, TransportError> {
        match tokio::time::timeout(timeout, self.read_message()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    fn local_addr(&self) -> String {
        self.local.clone()
    }

    fn remote_addr(&self) -> String {
        self.remote.clone()
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.write_timeout = timeout;
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await.ok();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

struct ParsedHead {
    is_request: bool,
    status: u16,
    method: String,
    path: String,
    content_length: usize,
    head_len: usize,
    headers: Vec<(String, String)>,
}

fn parse_request_head(buf: &[u8]) -> Result<Option<ParsedHead>, TransportError> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut header_storage);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(head_len)) => {
            let headers = own_headers(req.headers)?;
            Ok(Some(ParsedHead {
                is_request: true,
                status: 0,
                method: req.method.unwrap_or("POST").to_string(),
                path: req.path.unwrap_or("/").to_string(),
                content_length: content_length(&headers)?,
                head_len,
                headers,
            }))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(TransportError::InvalidMessage(e.to_string())),
    }
}

fn parse_response_head(buf: &[u8]) -> Result<Option<ParsedHead>, TransportError> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut header_storage);
    match resp.parse(buf) {
        Ok(httparse::Status::Complete(head_len)) => {
            let headers = own_headers(resp.headers)?;
            Ok(Some(ParsedHead {
                is_request: false,
                status: resp.code.unwrap_or(200),
                method: String::new(),
                path: String::new(),
                content_length: content_length(&headers)?,
                head_len,
                headers,
            }))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(TransportError::InvalidMessage(e.to_string())),
    }
}

fn own_headers(parsed: &[httparse::Header<'_>]) -> Result<Vec<(String, String)>, TransportError> {
    parsed
        .iter()
        .map(|h| {
            let value = std::str::from_utf8(h.value)
                .map_err(|_| TransportError::InvalidMessage("non-utf8 header value".into()))?;
            Ok((h.name.to_ascii_lowercase(), value.to_string()))
        })
        .collect()
}

fn content_length(parsed: &[(String, String)]) -> Result<usize, TransportError> {
    for (name, value) in parsed {
        if name == headers::CONTENT_LENGTH {
            return value
                .trim()
                .parse()
                .map_err(|_| TransportError::InvalidMessage("bad content-length".into()));
        }
    }
    Ok(0)
}

fn build_message(head: ParsedHead, body: Bytes) -> Message {
    let mut msg = Message::new(
        if head.is_request {
            MessageType::Request
        } else {
            MessageType::Response
        },
        "",
        "",
    );
    msg.body = body;
    let mut id = None;
    let mut endpoint = if head.is_request {
        // Split the query off the path; it travels in its own header.
        let (path, query) = match head.path.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (head.path.as_str(), None),
        };
        msg.set_header(headers::HTTP_METHOD, &head.method);
        if let Some(query) = query {
            msg.set_header(headers::QUERY, query);
        }
        Some(path.trim_start_matches('/').to_string())
    } else {
        None
    };
    let mut status = if head.is_request { None } else { Some(head.status) };
    for (name, value) in head.headers {
        match name.as_str() {
            headers::MESSAGE_ID => id = Some(value),
            headers::MESSAGE_TYPE => {
                if let Some(t) = MessageType::parse(&value) {
                    msg.msg_type = t;
                }
            }
            headers::TARGET => msg.target = value,
            headers::ENDPOINT => endpoint = Some(value),
            headers::STATUS_CODE => {
                // Authoritative over the status line.
                if let Ok(code) = value.parse::<u16>() {
                    status = Some(code);
                }
                msg.set_header(headers::STATUS_CODE, &value);
            }
            headers::CONTENT_LENGTH | "host" => {}
            _ => msg.set_header(&name, &value),
        }
    }
    // Absent a wire id, the freshly generated one stands.
    if let Some(id) = id {
        msg.id = id;
    }
    if let Some(endpoint) = endpoint {
        msg.endpoint = endpoint;
    }
    if let Some(status) = status {
        msg.set_header(headers::STATUS_CODE, &status.to_string());
    }
    msg
}

fn encode_request(msg: &Message) -> Vec<u8> {
    let path = if msg.endpoint.starts_with('/') {
        msg.endpoint.clone()
    } else {
        format!("/{}", msg.endpoint)
    };
    // Any HTTP method is legal on the wire; POST unless the caller says
    // otherwise.
    let method = msg.header(headers::HTTP_METHOD).unwrap_or("POST").to_string();
    let mut head = String::with_capacity(256);
    let _ = write!(head, "{method} {path} HTTP/1.1\r\n");
    let _ = write!(head, "{}: {}\r\n", headers::MESSAGE_ID, msg.id);
    let _ = write!(head, "{}: {}\r\n", headers::MESSAGE_TYPE, msg.msg_type.as_str());
    if !msg.target.is_empty() {
        let _ = write!(head, "{}: {}\r\n", headers::TARGET, msg.target);
    }
    write_shared_headers(&mut head, msg);
    finish_frame(head, &msg.body)
}

fn encode_response(msg: &Message) -> Vec<u8> {
    let status = msg.status().unwrap_or(200);
    let reason = http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("OK");
    let mut head = String::with_capacity(256);
    let _ = write!(head, "HTTP/1.1 {status} {reason}\r\n");
    let _ = write!(head, "{}: {}\r\n", headers::STATUS_CODE, status);
    let _ = write!(head, "{}: {}\r\n", headers::MESSAGE_ID, msg.id);
    let _ = write!(head, "{}: {}\r\n", headers::MESSAGE_TYPE, msg.msg_type.as_str());
    if !msg.endpoint.is_empty() {
        let _ = write!(head, "{}: {}\r\n", headers::ENDPOINT, msg.endpoint);
    }
    write_shared_headers(&mut head, msg);
    finish_frame(head, &msg.body)
}

fn write_shared_headers(head: &mut String, msg: &Message) {
    let mut has_content_type = false;
    for (name, value) in &msg.headers {
        let name = name.as_str();
        if name == headers::CONTENT_LENGTH || name == "host" || name == headers::STATUS_CODE {
            continue;
        }
        if name == headers::CONTENT_TYPE {
            has_content_type = true;
        }
        if let Ok(value) = value.to_str() {
            let _ = write!(head, "{name}: {value}\r\n");
        }
    }
    if !has_content_type {
        let _ = write!(head, "content-type: application/json\r\n");
    }
}

fn finish_frame(mut head: String, body: &Bytes) -> Vec<u8> {
    let _ = write!(head, "content-length: {}\r\n\r\n", body.len());
    let mut frame = Vec::with_capacity(head.len() + body.len());
    frame.extend_from_slice(head.as_bytes());
    frame.extend_from_slice(body);
    frame
}

//! HTTP/2 transport over the `h2` crate, prior-knowledge (no upgrade).
//!
//! Sockets multiplex many streams. Each inbound stream becomes one message
//! carrying a `__stream_id` header; sending the matching response message
//! completes that stream. On the client side every request opens a new
//! stream and a reader task pumps completed responses into the socket's
//! receive channel, so responses arrive in completion order and correlate
//! by message id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use micro_core::{headers, Message, MessageType};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{DialOptions, Listener, Socket, Stream, Transport, TransportError};

/// HTTP/2 transport.
pub struct Http2Transport;

#[async_trait]
impl Transport for Http2Transport {
    fn name(&self) -> &'static str {
        "http2"
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_string());
        Ok(Box::new(Http2Listener {
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
        let local = stream.local_addr().map(|a| a.to_string()).unwrap_or_default();
        let (send_request, connection) = h2::client::handshake(stream)
            .await
            .map_err(h2_error)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "http2 client connection ended");
            }
        });
        let (tx, rx) = mpsc::channel(64);
        Ok(Box::new(Http2ClientSocket {
            send_request: Some(send_request),
            tx,
            rx,
            authority: addr.to_string(),
            local,
            read_timeout: opts.read_timeout,
            closed: false,
        }))
    }
}

pub struct Http2Listener {
    inner: Option<TcpListener>,
    addr: String,
}

#[async_trait]
impl Listener for Http2Listener {
    fn addr(&self) -> String {
        self.addr.clone()
    }

    async fn accept(&mut self) -> Result<Box<dyn Socket>, TransportError> {
        let listener = self.inner.as_ref().ok_or(TransportError::NotConnected)?;
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true).ok();
        let local = stream.local_addr().map(|a| a.to_string()).unwrap_or_default();
        let mut connection = h2::server::handshake(stream).await.map_err(h2_error)?;

        let (tx, rx) = mpsc::channel(64);
        let responders: Arc<Mutex<HashMap<u64, h2::server::SendResponse<Bytes>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let next_stream_id = Arc::new(AtomicU64::new(1));

        let task_responders = responders.clone();
        let task_next_id = next_stream_id.clone();
        let reader = tokio::spawn(async move {
            while let Some(accepted) = connection.accept().await {
                let (request, respond) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        debug!(error = %e, "http2 accept stream failed");
                        break;
                    }
                };
                let stream_id = task_next_id.fetch_add(1, Ordering::Relaxed);
                task_responders.lock().unwrap().insert(stream_id, respond);
                let tx = tx.clone();
                tokio::spawn(async move {
                    match read_request_message(request, stream_id).await {
                        Ok(msg) => {
                            tx.send(msg).await.ok();
                        }
                        Err(e) => debug!(error = %e, "http2 inbound stream failed"),
                    }
                });
            }
        });

        Ok(Box::new(Http2ServerSocket {
            rx,
            responders,
            reader: Some(reader),
            local,
            remote: peer.to_string(),
            read_timeout: None,
            closed: false,
        }))
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

async fn read_request_message(
    request: http::Request<h2::RecvStream>,
    stream_id: u64,
) -> Result<Message, TransportError> {
    let (parts, body) = request.into_parts();
    let body = read_body(body).await?;

    let mut msg = Message::new(MessageType::Request, "", "");
    msg.body = body;
    msg.endpoint = parts.uri.path().trim_start_matches('/').to_string();
    msg.set_header(headers::HTTP_METHOD, parts.method.as_str());
    if let Some(query) = parts.uri.query() {
        msg.set_header(headers::QUERY, query);
    }
    for (name, value) in &parts.headers {
        let Ok(value) = value.to_str() else { continue };
        match name.as_str() {
            headers::MESSAGE_ID => msg.id = value.to_string(),
            headers::MESSAGE_TYPE => {
                if let Some(t) = MessageType::parse(value) {
                    msg.msg_type = t;
                }
            }
            headers::TARGET => msg.target = value.to_string(),
            _ => msg.set_header(name.as_str(), value),
        }
    }
    msg.set_header(headers::STREAM_ID, &stream_id.to_string());
    Ok(msg)
}

async fn read_body(mut body: h2::RecvStream) -> Result<Bytes, TransportError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(h2_error)?;
        body.flow_control().release_capacity(chunk.len()).ok();
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Write `data` respecting stream capacity, closing the send half at the end.
async fn send_all(
    stream: &mut h2::SendStream<Bytes>,
    mut data: Bytes,
    end_of_stream: bool,
) -> Result<(), TransportError> {
    if data.is_empty() {
        if end_of_stream {
            stream.send_data(Bytes::new(), true).map_err(h2_error)?;
        }
        return Ok(());
    }
    while !data.is_empty() {
        stream.reserve_capacity(data.len());
        let capacity = futures_util::future::poll_fn(|cx| stream.poll_capacity(cx)).await;
        match capacity {
            None => return Err(TransportError::ConnectionReset("stream closed".into())),
            Some(Err(e)) => return Err(h2_error(e)),
            Some(Ok(0)) => continue,
            Some(Ok(n)) => {
                let chunk = data.split_to(n.min(data.len()));
                let eos = end_of_stream && data.is_empty();
                stream.send_data(chunk, eos).map_err(h2_error)?;
            }
        }
    }
    Ok(())
}

fn h2_error(err: h2::Error) -> TransportError {
    if err.is_reset() {
        TransportError::ConnectionReset(err.to_string())
    } else {
        TransportError::Internal(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Server socket
// ---------------------------------------------------------------------------

pub struct Http2ServerSocket {
    rx: mpsc::Receiver<Message>,
    responders: Arc<Mutex<HashMap<u64, h2::server::SendResponse<Bytes>>>>,
    reader: Option<tokio::task::JoinHandle<()>>,
    local: String,
    remote: String,
    read_timeout: Option<Duration>,
    closed: bool,
}

#[async_trait]
impl Socket for Http2ServerSocket {
    async fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::NotConnected);
        }
        let stream_id: u64 = msg
            .header(headers::STREAM_ID)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                TransportError::InvalidMessage("response missing __stream_id".into())
            })?;
        let respond = self
            .responders
            .lock()
            .unwrap()
            .remove(&stream_id)
            .ok_or_else(|| {
                TransportError::InvalidMessage(format!("unknown stream {stream_id}"))
            })?;
        send_response(respond, msg).await
    }

    async fn recv(&mut self) -> Result<Message, TransportError> {
        match self.read_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.rx.recv()).await {
                Ok(Some(msg)) => Ok(msg),
                Ok(None) => Err(TransportError::NotConnected),
                Err(_) => Err(TransportError::Timeout("read".into())),
            },
            None => self.rx.recv().await.ok_or(TransportError::NotConnected),
        }
    }

    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Message>, TransportError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(msg)) => Ok(Some(msg)),
            Ok(None) => Err(TransportError::NotConnected),
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

    fn set_write_timeout(&mut self, _timeout: Option<Duration>) {}

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.responders.lock().unwrap().clear();
        self.rx.close();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

async fn send_response(
    mut respond: h2::server::SendResponse<Bytes>,
    msg: Message,
) -> Result<(), TransportError> {
    let status = msg.status().unwrap_or(200);
    let mut builder = http::Response::builder()
        .status(http::StatusCode::from_u16(status).unwrap_or(http::StatusCode::OK))
        .header(headers::STATUS_CODE, status.to_string())
        .header(headers::MESSAGE_ID, msg.id.as_str())
        .header(headers::MESSAGE_TYPE, msg.msg_type.as_str());
    if !msg.endpoint.is_empty() {
        builder = builder.header(headers::ENDPOINT, msg.endpoint.as_str());
    }
    for (name, value) in &msg.headers {
        if name.as_str() == headers::STREAM_ID || name.as_str() == headers::STATUS_CODE {
            continue;
        }
        builder = builder.header(name, value);
    }
    let response = builder
        .body(())
        .map_err(|e| TransportError::Internal(e.to_string()))?;
    let body_empty = msg.body.is_empty();
    let mut stream = respond
        .send_response(response, body_empty)
        .map_err(h2_error)?;
    if !body_empty {
        send_all(&mut stream, msg.body, true).await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Client socket
// ---------------------------------------------------------------------------

pub struct Http2ClientSocket {
    send_request: Option<h2::client::SendRequest<Bytes>>,
    tx: mpsc::Sender<Result<Message, TransportError>>,
    rx: mpsc::Receiver<Result<Message, TransportError>>,
    authority: String,
    local: String,
    read_timeout: Option<Duration>,
    closed: bool,
}

impl Http2ClientSocket {
    fn build_request(&self, msg: &Message) -> Result<http::Request<()>, TransportError> {
        let path = if msg.endpoint.starts_with('/') {
            msg.endpoint.clone()
        } else {
            format!("/{}", msg.endpoint)
        };
        let method = msg
            .header(headers::HTTP_METHOD)
            .and_then(|m| m.parse::<http::Method>().ok())
            .unwrap_or(http::Method::POST);
        let mut builder = http::Request::builder()
            .method(method)
            .uri(format!("http://{}{}", self.authority, path))
            .header(headers::MESSAGE_ID, msg.id.as_str())
            .header(headers::MESSAGE_TYPE, msg.msg_type.as_str());
        if !msg.target.is_empty() {
            builder = builder.header(headers::TARGET, msg.target.as_str());
        }
        for (name, value) in &msg.headers {
            builder = builder.header(name, value);
        }
        builder
            .body(())
            .map_err(|e| TransportError::InvalidMessage(e.to_string()))
    }

    /// Open a raw bidirectional byte stream to `endpoint`.
    ///
    /// The send half is the request body (half-closed by `close_send`), the
    /// receive half is the response body, which the peer may keep writing
    /// after our half-close.
    pub async fn open_stream(&mut self, endpoint: &str) -> Result<Http2ByteStream, TransportError> {
        let send_request = self
            .send_request
            .as_ref()
            .ok_or(TransportError::NotConnected)?
            .clone();
        let mut send_request = send_request.ready().await.map_err(h2_error)?;
        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri(format!("http://{}/{}", self.authority, endpoint.trim_start_matches('/')))
            .body(())
            .map_err(|e| TransportError::InvalidMessage(e.to_string()))?;
        let (response, send_stream) = send_request
            .send_request(request, false)
            .map_err(h2_error)?;
        let recv = response.await.map_err(h2_error)?.into_body();
        Ok(Http2ByteStream {
            send: Some(send_stream),
            recv,
        })
    }
}

#[async_trait]
impl Socket for Http2ClientSocket {
    async fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::NotConnected);
        }
        let request = self.build_request(&msg)?;
        let send_request = self
            .send_request
            .as_ref()
            .ok_or(TransportError::NotConnected)?
            .clone();
        let mut send_request = send_request.ready().await.map_err(h2_error)?;
        let body_empty = msg.body.is_empty();
        let (response, mut send_stream) = send_request
            .send_request(request, body_empty)
            .map_err(h2_error)?;
        if !body_empty {
            send_all(&mut send_stream, msg.body.clone(), true).await?;
        }

        let tx = self.tx.clone();
        let request_id = msg.id.clone();
        tokio::spawn(async move {
            let result = read_response_message(response, request_id).await;
            tx.send(result).await.ok();
        });
        Ok(())
    }

    async fn recv(&mut self) -> Result<Message, TransportError> {
        match self.read_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.rx.recv()).await {
                Ok(Some(result)) => result,
                Ok(None) => Err(TransportError::NotConnected),
                Err(_) => Err(TransportError::Timeout("read".into())),
            },
            None => self.rx.recv().await.ok_or(TransportError::NotConnected)?,
        }
    }

    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Message>, TransportError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(result)) => result.map(Some),
            Ok(None) => Err(TransportError::NotConnected),
            Err(_) => Ok(None),
        }
    }

    fn local_addr(&self) -> String {
        self.local.clone()
    }

    fn remote_addr(&self) -> String {
        self.authority.clone()
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    fn set_write_timeout(&mut self, _timeout: Option<Duration>) {}

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        self.send_request.take();
        self.rx.close();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

async fn read_response_message(
    response: h2::client::ResponseFuture,
    request_id: String,
) -> Result<Message, TransportError> {
    let response = response.await.map_err(h2_error)?;
    let (parts, body) = response.into_parts();
    let body = read_body(body).await?;

    let mut msg = Message::new(MessageType::Response, "", "");
    msg.id = request_id;
    msg.body = body;
    let mut status = parts.status.as_u16();
    for (name, value) in &parts.headers {
        let Ok(value) = value.to_str() else { continue };
        match name.as_str() {
            headers::MESSAGE_ID => msg.id = value.to_string(),
            headers::MESSAGE_TYPE => {
                if let Some(t) = MessageType::parse(value) {
                    msg.msg_type = t;
                }
            }
            headers::ENDPOINT => msg.endpoint = value.to_string(),
            headers::STATUS_CODE => {
                if let Ok(code) = value.parse() {
                    status = code;
                }
            }
            _ => msg.set_header(name.as_str(), value),
        }
    }
    msg.set_header(headers::STATUS_CODE, &status.to_string());
    Ok(msg)
}

/// Bidirectional byte stream over one HTTP/2 stream.
pub struct Http2ByteStream {
    send: Option<h2::SendStream<Bytes>>,
    recv: h2::RecvStream,
}

#[async_trait]
impl Stream for Http2ByteStream {
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        let stream = self.send.as_mut().ok_or(TransportError::NotConnected)?;
        send_all(stream, data, false).await
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        match self.recv.data().await {
            Some(Ok(chunk)) => {
                self.recv.flow_control().release_capacity(chunk.len()).ok();
                Ok(Some(chunk))
            }
            Some(Err(e)) => Err(h2_error(e)),
            None => Ok(None),
        }
    }

    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Bytes>, TransportError> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Ok(None),
        }
    }

    async fn close_send(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.send.take() {
            stream.send_data(Bytes::new(), true).map_err(h2_error)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Transport;

    #[tokio::test]
    async fn multiplexed_request_response() {
        let transport = Http2Transport;
        let mut listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.addr();

        let server = tokio::spawn(async move {
            let mut socket = listener.accept().await.unwrap();
            // Answer two interleaved requests out of order.
            let first = socket.recv().await.unwrap();
            let second = socket.recv().await.unwrap();
            socket
                .send(second.response(200, second.body.clone()))
                .await
                .unwrap();
            socket
                .send(first.response(200, first.body.clone()))
                .await
                .unwrap();
        });

        let mut client = transport.dial(&addr, DialOptions::default()).await.unwrap();
        let req_a = Message::request("svc", "echo", Bytes::from_static(b"a"));
        let req_b = Message::request("svc", "echo", Bytes::from_static(b"b"));
        let (id_a, id_b) = (req_a.id.clone(), req_b.id.clone());
        client.send(req_a).await.unwrap();
        client.send(req_b).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let msg = client.recv().await.unwrap();
            seen.push((msg.id.clone(), msg.body.clone()));
        }
        seen.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(seen[0], (id_a, Bytes::from_static(b"a")));
        assert_eq!(seen[1], (id_b, Bytes::from_static(b"b")));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn inbound_messages_carry_stream_ids() {
        let transport = Http2Transport;
        let mut listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.addr();

        let server = tokio::spawn(async move {
            let mut socket = listener.accept().await.unwrap();
            let msg = socket.recv().await.unwrap();
            assert!(msg.header(headers::STREAM_ID).is_some());
            socket.send(msg.response(204, Bytes::new())).await.unwrap();
        });

        let mut client = transport.dial(&addr, DialOptions::default()).await.unwrap();
        client
            .send(Message::request("svc", "op", Bytes::new()))
            .await
            .unwrap();
        let reply = client.recv().await.unwrap();
        assert_eq!(reply.status(), Some(204));
        // Pseudo headers stay on the transport side.
        assert!(reply.header(headers::STREAM_ID).is_none());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn recv_timeout_is_absence() {
        let transport = Http2Transport;
        let mut listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.addr();
        let _server = tokio::spawn(async move {
            let mut socket = listener.accept().await.unwrap();
            // Hold the request open.
            let _msg = socket.recv().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut client = transport.dial(&addr, DialOptions::default()).await.unwrap();
        client
            .send(Message::request("svc", "op", Bytes::new()))
            .await
            .unwrap();
        let got = client.recv_timeout(Duration::from_millis(40)).await.unwrap();
        assert!(got.is_none());
    }
}

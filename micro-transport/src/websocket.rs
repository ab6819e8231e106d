//! WebSocket transport.
//!
//! After the upgrade every frame carries one envelope-encoded message: text
//! frames with a JSON envelope for JSON-family content, binary frames with a
//! MessagePack envelope otherwise. Request/response pairs correlate by
//! message id; `Event` messages are fire-and-forget.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use micro_core::{Message, MessageType};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsFrame;
use tokio_tungstenite::WebSocketStream;

use crate::{DialOptions, Listener, Socket, Transport, TransportError};

/// WebSocket transport over TCP.
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_string());
        Ok(Box::new(WebSocketListener {
            inner: Some(listener),
            addr,
        }))
    }

    async fn dial(&self, addr: &str, opts: DialOptions) -> Result<Box<dyn Socket>, TransportError> {
        let url = if addr.starts_with("ws://") || addr.starts_with("wss://") {
            addr.to_string()
        } else {
            format!("ws://{addr}")
        };
        let connect = tokio_tungstenite::connect_async(url);
        let (ws, _response) = match opts.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| TransportError::Timeout(format!("dialing {addr}")))?
                .map_err(ws_error)?,
            None => connect.await.map_err(ws_error)?,
        };
        Ok(Box::new(WsSocket {
            ws: Some(ws),
            local: String::new(),
            remote: addr.to_string(),
            read_timeout: opts.read_timeout,
        }))
    }
}

pub struct WebSocketListener {
    inner: Option<TcpListener>,
    addr: String,
}

#[async_trait]
impl Listener for WebSocketListener {
    fn addr(&self) -> String {
        self.addr.clone()
    }

    async fn accept(&mut self) -> Result<Box<dyn Socket>, TransportError> {
        let listener = self.inner.as_ref().ok_or(TransportError::NotConnected)?;
        let (stream, peer) = listener.accept().await?;
        let local = stream.local_addr().map(|a| a.to_string()).unwrap_or_default();
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(ws_error)?;
        Ok(Box::new(WsSocket {
            ws: Some(ws),
            local,
            remote: peer.to_string(),
            read_timeout: None,
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

/// Frame-per-message envelope. The body travels base64-encoded so the same
/// shape serializes through both serde back-ends.
#[derive(Serialize, Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    target: String,
    endpoint: String,
    headers: Vec<(String, String)>,
    body: String,
}

impl Envelope {
    fn from_message(msg: &Message) -> Self {
        Envelope {
            id: msg.id.clone(),
            kind: msg.msg_type.as_str().to_string(),
            target: msg.target.clone(),
            endpoint: msg.endpoint.clone(),
            headers: msg
                .headers
                .iter()
                .filter_map(|(k, v)| {
                    v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string()))
                })
                .collect(),
            body: BASE64.encode(&msg.body),
        }
    }

    fn into_message(self) -> Result<Message, TransportError> {
        let msg_type = MessageType::parse(&self.kind)
            .ok_or_else(|| TransportError::InvalidMessage(format!("bad message type {:?}", self.kind)))?;
        let mut msg = Message::new(msg_type, self.target, self.endpoint);
        msg.id = self.id;
        msg.body = Bytes::from(
            BASE64
                .decode(self.body.as_bytes())
                .map_err(|e| TransportError::InvalidMessage(e.to_string()))?,
        );
        for (name, value) in &self.headers {
            msg.set_header(name, value);
        }
        Ok(msg)
    }
}

fn encode_frame(msg: &Message) -> Result<WsFrame, TransportError> {
    let envelope = Envelope::from_message(msg);
    let json_family = msg
        .content_type()
        .map(|ct| ct.contains("json"))
        .unwrap_or(true);
    if json_family {
        let text = serde_json::to_string(&envelope)
            .map_err(|e| TransportError::InvalidMessage(e.to_string()))?;
        Ok(WsFrame::text(text))
    } else {
        let packed = rmp_serde::to_vec_named(&envelope)
            .map_err(|e| TransportError::InvalidMessage(e.to_string()))?;
        Ok(WsFrame::Binary(packed.into()))
    }
}

fn decode_frame(frame: &WsFrame) -> Result<Message, TransportError> {
    let envelope: Envelope = match frame {
        WsFrame::Text(text) => serde_json::from_str(text.as_str())
            .map_err(|e| TransportError::InvalidMessage(e.to_string()))?,
        WsFrame::Binary(bytes) => rmp_serde::from_slice(bytes)
            .map_err(|e| TransportError::InvalidMessage(e.to_string()))?,
        other => {
            return Err(TransportError::InvalidMessage(format!(
                "unexpected frame {other:?}"
            )))
        }
    };
    envelope.into_message()
}

pub struct WsSocket<S> {
    ws: Option<WebSocketStream<S>>,
    local: String,
    remote: String,
    read_timeout: Option<Duration>,
}

impl<S> WsSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Read data frames, replying to pings inline.
    async fn read_frame(&mut self) -> Result<Message, TransportError> {
        loop {
            let ws = self.ws.as_mut().ok_or(TransportError::NotConnected)?;
            match ws.next().await {
                Some(Ok(WsFrame::Ping(payload))) => {
                    ws.send(WsFrame::Pong(payload)).await.map_err(ws_error)?;
                }
                Some(Ok(WsFrame::Pong(_))) => {}
                Some(Ok(WsFrame::Close(_))) | None => {
                    self.ws.take();
                    return Err(TransportError::NotConnected);
                }
                Some(Ok(frame)) => return decode_frame(&frame),
                Some(Err(e)) => {
                    self.ws.take();
                    return Err(ws_error(e));
                }
            }
        }
    }
}

#[async_trait]
impl<S> Socket for WsSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        let frame = encode_frame(&msg)?;
        let ws = self.ws.as_mut().ok_or(TransportError::NotConnected)?;
        ws.send(frame).await.map_err(ws_error)
    }

    async fn recv(&mut self) -> Result<Message, TransportError> {
        match self.read_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.read_frame()).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout("read".into())),
            },
            None => self.read_frame().await,
        }
    }

    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Message>, TransportError> {
        match tokio::time::timeout(timeout, self.read_frame()).await {
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

    fn set_write_timeout(&mut self, _timeout: Option<Duration>) {}

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut ws) = self.ws.take() {
            ws.close(None).await.ok();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.ws.is_none()
    }
}

fn ws_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error;
    match err {
        Error::ConnectionClosed | Error::AlreadyClosed => TransportError::NotConnected,
        Error::Io(io) => io.into(),
        other => TransportError::Internal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Transport;
    use micro_core::headers;

    #[tokio::test]
    async fn text_frame_round_trip() {
        let transport = WebSocketTransport;
        let mut listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.addr();

        let server = tokio::spawn(async move {
            let mut socket = listener.accept().await.unwrap();
            let msg = socket.recv().await.unwrap();
            assert_eq!(msg.endpoint, "hello");
            assert_eq!(&msg.body[..], b"{\"name\":\"World\"}");
            socket
                .send(msg.response(200, Bytes::from_static(b"\"Hello, World!\"")))
                .await
                .unwrap();
        });

        let mut client = transport.dial(&addr, DialOptions::default()).await.unwrap();
        let mut req = Message::request("greeter", "hello", Bytes::from_static(b"{\"name\":\"World\"}"));
        req.set_header(headers::CONTENT_TYPE, "application/json");
        let id = req.id.clone();
        client.send(req).await.unwrap();

        let reply = client.recv().await.unwrap();
        assert_eq!(reply.id, id);
        assert_eq!(reply.status(), Some(200));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn binary_content_uses_binary_frames() {
        // Round-trip the envelope codec directly.
        let mut msg = Message::request("svc", "op", Bytes::from_static(&[0u8, 159, 146, 150]));
        msg.set_header(headers::CONTENT_TYPE, "application/msgpack");
        let frame = encode_frame(&msg).unwrap();
        assert!(matches!(frame, WsFrame::Binary(_)));
        let back = decode_frame(&frame).unwrap();
        assert_eq!(back.id, msg.id);
        assert_eq!(&back.body[..], &[0u8, 159, 146, 150]);
        assert_eq!(back.header(headers::CONTENT_TYPE), Some("application/msgpack"));
    }

    #[tokio::test]
    async fn event_frames_are_fire_and_forget() {
        let transport = WebSocketTransport;
        let mut listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.addr();

        let server = tokio::spawn(async move {
            let mut socket = listener.accept().await.unwrap();
            let msg = socket.recv().await.unwrap();
            assert_eq!(msg.msg_type, MessageType::Event);
            msg
        });

        let mut client = transport.dial(&addr, DialOptions::default()).await.unwrap();
        client
            .send(Message::event("svc", "created", Bytes::from_static(b"{}")))
            .await
            .unwrap();
        let delivered = server.await.unwrap();
        assert_eq!(delivered.endpoint, "created");
    }
}

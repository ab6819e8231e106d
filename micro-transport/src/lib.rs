//! Transport abstraction: a uniform listener/socket/message model with
//! pluggable wire implementations.
//!
//! All variants share the same framing rules: the on-wire encoding preserves
//! the message id, type, endpoint, every non-pseudo header, and the body
//! bytes exactly; response status travels in `x-status-code` when the
//! underlying protocol has no native status field.
//!
//! Within one socket, sends and receives are strictly ordered on each side;
//! concurrent senders on one socket are not supported (the `&mut self`
//! receivers encode that contract). Stream-capable transports multiplex
//! through [`Stream`]s instead.

mod error;
pub mod http1;
pub mod http2;
pub mod loopback;
pub mod websocket;

pub use error::TransportError;
pub use http1::HttpTransport;
pub use http2::Http2Transport;
pub use loopback::LoopbackTransport;
pub use websocket::WebSocketTransport;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use micro_core::Message;

/// Options applied when dialing an outbound socket.
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    /// Time allowed for the dial itself.
    pub connect_timeout: Option<Duration>,
}

/// A bidirectional message socket.
#[async_trait]
pub trait Socket: Send {
    /// Send one message. Concurrent senders must serialize externally.
    async fn send(&mut self, msg: Message) -> Result<(), TransportError>;

    /// Block until a message arrives or the socket closes.
    async fn recv(&mut self) -> Result<Message, TransportError>;

    /// Like [`recv`](Self::recv) but bounded: `Ok(None)` on timeout.
    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Message>, TransportError>;

    fn local_addr(&self) -> String;
    fn remote_addr(&self) -> String;

    fn set_read_timeout(&mut self, timeout: Option<Duration>);
    fn set_write_timeout(&mut self, timeout: Option<Duration>);

    /// Close the socket. Idempotent and safe to call from either side.
    async fn close(&mut self) -> Result<(), TransportError>;

    fn is_closed(&self) -> bool;
}

/// A bound acceptor producing inbound sockets.
#[async_trait]
pub trait Listener: Send {
    fn addr(&self) -> String;

    async fn accept(&mut self) -> Result<Box<dyn Socket>, TransportError>;

    /// Bounded accept: `Ok(None)` on timeout.
    async fn accept_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Box<dyn Socket>>, TransportError>;

    /// Close the listener. Idempotent.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// A transport implementation: a way of moving [`Message`]s between peers.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, TransportError>;

    async fn dial(&self, addr: &str, opts: DialOptions) -> Result<Box<dyn Socket>, TransportError>;
}

/// Optional capability on stream-capable transports: a bidirectional byte
/// stream with half-close.
#[async_trait]
pub trait Stream: Send {
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// `Ok(None)` once the peer has half-closed.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;

    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Bytes>, TransportError>;

    /// Half-close: no further sends, receives continue to drain.
    async fn close_send(&mut self) -> Result<(), TransportError>;
}

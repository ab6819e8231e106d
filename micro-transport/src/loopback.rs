//! In-process loopback transport.
//!
//! `listen("name")` registers an acceptor under `name`; `dial("name")` (or
//! `dial("loopback://name")`) hands the listener one half of a crossed
//! channel pair. No kernel sockets are involved, which makes this the
//! transport of choice for tests and single-process wiring.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use micro_core::Message;
use tokio::sync::mpsc;

use crate::{DialOptions, Listener, Socket, Stream, Transport, TransportError};

const CHANNEL_DEPTH: usize = 64;

/// In-process transport. All listeners and dialers must share one instance.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    acceptors: Arc<DashMap<String, mpsc::Sender<LoopbackSocket>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        LoopbackTransport::default()
    }
}

fn normalize(addr: &str) -> &str {
    addr.strip_prefix("loopback://").unwrap_or(addr)
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, TransportError> {
        let name = normalize(addr).to_string();
        if self.acceptors.contains_key(&name) {
            return Err(TransportError::Internal(format!(
                "loopback name {name:?} already bound"
            )));
        }
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        self.acceptors.insert(name.clone(), tx);
        Ok(Box::new(LoopbackListener {
            name,
            rx,
            acceptors: self.acceptors.clone(),
            closed: false,
        }))
    }

    async fn dial(&self, addr: &str, opts: DialOptions) -> Result<Box<dyn Socket>, TransportError> {
        let name = normalize(addr);
        let acceptor = self
            .acceptors
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                TransportError::ConnectionRefused(format!("no loopback listener {name:?}"))
            })?;

        let (client_tx, server_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (server_tx, client_rx) = mpsc::channel(CHANNEL_DEPTH);
        let server = LoopbackSocket {
            tx: Some(server_tx),
            rx: server_rx,
            local: format!("loopback://{name}"),
            remote: "loopback://client".to_string(),
            read_timeout: None,
        };
        let client = LoopbackSocket {
            tx: Some(client_tx),
            rx: client_rx,
            local: "loopback://client".to_string(),
            remote: format!("loopback://{name}"),
            read_timeout: opts.read_timeout,
        };
        acceptor.send(server).await.map_err(|_| {
            TransportError::ConnectionRefused(format!("loopback listener {name:?} closed"))
        })?;
        Ok(Box::new(client))
    }
}

pub struct LoopbackListener {
    name: String,
    rx: mpsc::Receiver<LoopbackSocket>,
    acceptors: Arc<DashMap<String, mpsc::Sender<LoopbackSocket>>>,
    closed: bool,
}

#[async_trait]
impl Listener for LoopbackListener {
    fn addr(&self) -> String {
        format!("loopback://{}", self.name)
    }

    async fn accept(&mut self) -> Result<Box<dyn Socket>, TransportError> {
        match self.rx.recv().await {
            Some(socket) => Ok(Box::new(socket)),
            None => Err(TransportError::NotConnected),
        }
    }

    async fn accept_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Box<dyn Socket>>, TransportError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(socket)) => Ok(Some(Box::new(socket))),
            Ok(None) => Err(TransportError::NotConnected),
            Err(_) => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            self.acceptors.remove(&self.name);
            self.rx.close();
        }
        Ok(())
    }
}

pub struct LoopbackSocket {
    tx: Option<mpsc::Sender<Message>>,
    rx: mpsc::Receiver<Message>,
    local: String,
    remote: String,
    read_timeout: Option<Duration>,
}

#[async_trait]
impl Socket for LoopbackSocket {
    async fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(msg)
            .await
            .map_err(|_| TransportError::ConnectionReset("peer closed".into()))
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
        self.tx.take();
        self.rx.close();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

/// In-process byte stream pair with half-close, the loopback counterpart of
/// the stream capability on stream-capable transports.
pub struct LoopbackStream {
    tx: Option<mpsc::Sender<Bytes>>,
    rx: mpsc::Receiver<Bytes>,
}

impl LoopbackStream {
    pub fn pair() -> (LoopbackStream, LoopbackStream) {
        let (a_tx, b_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (b_tx, a_rx) = mpsc::channel(CHANNEL_DEPTH);
        (
            LoopbackStream {
                tx: Some(a_tx),
                rx: a_rx,
            },
            LoopbackStream {
                tx: Some(b_tx),
                rx: b_rx,
            },
        )
    }
}

#[async_trait]
impl Stream for LoopbackStream {
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(data)
            .await
            .map_err(|_| TransportError::ConnectionReset("peer closed".into()))
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.rx.recv().await)
    }

    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Bytes>, TransportError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(data) => Ok(data),
            Err(_) => Ok(None),
        }
    }

    async fn close_send(&mut self) -> Result<(), TransportError> {
        self.tx.take();
        Ok(())
    }
}

//! In-process transport pair with fault injection.
//!
//! A [`MemoryTransport`] is the half handed to the engine or registry; the
//! matching [`MemoryPeer`] plays the remote end. Writes can be made to fail or
//! to stall forever, and a [`MemoryConnector`] can be taken offline to exercise
//! reconnect paths.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::message::Message;
use crate::transport::{Connector, SharedTransport, Transport, TransportError};

/// Local half of an in-memory connection.
pub struct MemoryTransport {
    id: String,
    inbound: Mutex<mpsc::UnboundedReceiver<Message>>,
    outbound: mpsc::UnboundedSender<Message>,
    closed: CancellationToken,
    fail_writes: AtomicBool,
    stall_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryTransport {
    /// Make every subsequent write fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Make every subsequent write hang forever (or stop hanging).
    pub fn stall_writes(&self, stall: bool) {
        self.stall_writes.store(stall, Ordering::Relaxed);
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Whether `close` was called or the peer disconnected.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read(&self) -> Result<Message, TransportError> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(TransportError::Closed),
            msg = inbound.recv() => msg.ok_or(TransportError::Closed),
        }
    }

    async fn write(&self, message: &Message) -> Result<(), TransportError> {
        if self.stall_writes.load(Ordering::Relaxed) {
            std::future::pending::<()>().await;
        }
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(TransportError::Io("injected write failure".into()));
        }
        self.outbound
            .send(message.clone())
            .map_err(|_| TransportError::Closed)?;
        let _ = self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

/// Remote half of an in-memory connection.
pub struct MemoryPeer {
    transport: Arc<MemoryTransport>,
    to_transport: mpsc::UnboundedSender<Message>,
    from_transport: mpsc::UnboundedReceiver<Message>,
}

impl MemoryPeer {
    /// Queue a frame for the local half to read.
    pub fn send(&self, message: impl Into<Message>) -> bool {
        self.to_transport.send(message.into()).is_ok()
    }

    /// Next frame the local half wrote.
    pub async fn recv(&mut self) -> Option<Message> {
        self.from_transport.recv().await
    }

    /// Next frame the local half wrote, without waiting.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.from_transport.try_recv().ok()
    }

    /// Sever the connection; the local half's pending and future reads fail.
    pub fn disconnect(&self) {
        self.transport.closed.cancel();
    }

    /// The local half, for fault injection.
    pub fn transport(&self) -> &Arc<MemoryTransport> {
        &self.transport
    }
}

/// Create a connected transport/peer pair.
pub fn pair(id: impl Into<String>) -> (Arc<MemoryTransport>, MemoryPeer) {
    let (to_transport, inbound) = mpsc::unbounded_channel();
    let (outbound, from_transport) = mpsc::unbounded_channel();
    let transport = Arc::new(MemoryTransport {
        id: id.into(),
        inbound: Mutex::new(inbound),
        outbound,
        closed: CancellationToken::new(),
        fail_writes: AtomicBool::new(false),
        stall_writes: AtomicBool::new(false),
        writes: AtomicUsize::new(0),
    });
    let peer = MemoryPeer {
        transport: transport.clone(),
        to_transport,
        from_transport,
    };
    (transport, peer)
}

/// Connector that hands out [`MemoryTransport`]s and delivers the peers to a
/// [`MemoryListener`].
pub struct MemoryConnector {
    target: String,
    online: AtomicBool,
    hang: AtomicBool,
    dials: AtomicUsize,
    accepted: mpsc::UnboundedSender<MemoryPeer>,
}

/// Receives the remote halves of connections dialed by a [`MemoryConnector`].
pub struct MemoryListener {
    rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryListener {
    /// Wait for the next dialed connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.rx.recv().await
    }

    /// Next dialed connection, without waiting.
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.rx.try_recv().ok()
    }
}

impl MemoryConnector {
    /// Create an online connector and its listener.
    pub fn new(target: impl Into<String>) -> (Arc<Self>, MemoryListener) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            target: target.into(),
            online: AtomicBool::new(true),
            hang: AtomicBool::new(false),
            dials: AtomicUsize::new(0),
            accepted,
        });
        (connector, MemoryListener { rx })
    }

    /// Refuse (`false`) or accept (`true`) new dials.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }

    /// Make new dials hang forever.
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::Relaxed);
    }

    /// Number of dial attempts so far.
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn target(&self) -> &str {
        &self.target
    }

    async fn connect(&self) -> Result<SharedTransport, TransportError> {
        let n = self.dials.fetch_add(1, Ordering::Relaxed) + 1;
        if self.hang.load(Ordering::Relaxed) {
            std::future::pending::<()>().await;
        }
        if !self.online.load(Ordering::Relaxed) {
            return Err(TransportError::Connect("connection refused".into()));
        }
        let (transport, peer) = pair(format!("{}#{n}", self.target));
        self.accepted
            .send(peer)
            .map_err(|_| TransportError::Connect("listener dropped".into()))?;
        Ok(transport)
    }
}

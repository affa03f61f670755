//! The client engine: one outbound connection, a send loop and a receive loop.
//!
//! The receive loop owns reconnection. It is the only task that drops the
//! current transport or dials a new one; the send loop just re-reads whatever
//! handle is current at each write attempt.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use k8mq_core::{
    Connector, CorrelationTable, Envelope, Message, QueError, ReadCallback, Registration, Result,
    SharedTransport, ShutdownCoordinator, TransportError, Waiter, sleep_or_cancel,
};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::transport::WsConnector;

/// Connection lifecycle as seen by callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    /// No transport; the receive loop will dial again.
    Disconnected,
    /// A dial cycle is in progress.
    Connecting,
    /// A transport is installed.
    Connected,
    /// `close` finished draining. Terminal.
    Closed,
}

struct Inner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    current: RwLock<Option<SharedTransport>>,
    state: watch::Sender<ClientState>,
    shutting_down: AtomicBool,
    outbound: mpsc::Sender<Envelope>,
    waiters: CorrelationTable,
    reader: Option<ReadCallback>,
    cancel: CancellationToken,
}

/// A reconnecting client for the k8mq broker.
///
/// Construct with [`QueClient::start`]; both loops run until
/// [`QueClient::close`].
pub struct QueClient {
    inner: Arc<Inner>,
    shutdown: ShutdownCoordinator,
}

impl QueClient {
    /// Validate `config` and start a client dialing the broker over WebSocket.
    ///
    /// Does not wait for the first connection; use
    /// [`wait_for_state`](Self::wait_for_state) for that.
    pub fn start(config: ClientConfig, reader: Option<ReadCallback>) -> Result<Self> {
        config.validate()?;
        let connector = Arc::new(WsConnector::new(config.dial_url()));
        Self::with_connector(config, connector, reader)
    }

    /// Start a client on a custom [`Connector`].
    pub fn with_connector(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        reader: Option<ReadCallback>,
    ) -> Result<Self> {
        config.validate()?;
        let (outbound, queue) = mpsc::channel(config.queue_capacity);
        let shutdown = ShutdownCoordinator::new();
        let inner = Arc::new(Inner {
            config,
            connector,
            current: RwLock::new(None),
            state: watch::Sender::new(ClientState::Disconnected),
            shutting_down: AtomicBool::new(false),
            outbound,
            waiters: CorrelationTable::new(),
            reader,
            cancel: shutdown.token(),
        });

        info!(target_url = %inner.connector.target(), "starting k8mq client");
        shutdown.track(tokio::spawn(receive_loop(inner.clone())));
        shutdown.track(tokio::spawn(send_loop(inner.clone(), queue)));
        Ok(Self { inner, shutdown })
    }

    /// Queue `message` for delivery to the broker.
    ///
    /// Suspends while the outbound queue is full. Write failures are retried
    /// and logged by the send loop, never returned here.
    pub async fn enqueue(&self, message: impl Into<Message>) -> Result<()> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(QueError::Closed("outbound queue"));
        }
        let envelope = Envelope::new(message.into());
        tokio::select! {
            sent = self.inner.outbound.send(envelope) => {
                sent.map_err(|_| QueError::Closed("outbound queue"))
            }
            () = self.inner.cancel.cancelled() => Err(QueError::Closed("outbound queue")),
        }
    }

    /// Route the next inbound message carrying `correlation_id` to `waiter`
    /// instead of the reader callback.
    pub fn register_one_time(&self, correlation_id: impl Into<String>, waiter: Waiter) -> Registration {
        self.inner.waiters.register(correlation_id, waiter)
    }

    /// Send `body` under `correlation_id` and wait up to `timeout` for a
    /// reply carrying the same id.
    ///
    /// The broker's own echo of the request is not mistaken for the reply.
    pub async fn request(
        &self,
        correlation_id: impl Into<String>,
        body: Value,
        timeout: Duration,
    ) -> Result<Message> {
        let correlation_id = correlation_id.into();
        if correlation_id.is_empty() {
            return Err(QueError::InvalidConfig(
                "correlation id must not be empty".into(),
            ));
        }
        let message = Message::correlated(correlation_id.clone(), body)?;
        let (tx, rx) = oneshot::channel();
        let _ = self
            .inner
            .waiters
            .register_request(correlation_id.clone(), tx, message.payload().clone());

        if let Err(e) = self.enqueue(message).await {
            let _ = self.inner.waiters.cancel(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(QueError::WaiterDropped { correlation_id }),
            Err(_) => {
                let _ = self.inner.waiters.cancel(&correlation_id);
                Err(QueError::timeout("correlated reply", timeout))
            }
        }
    }

    /// Fresh, time-ordered correlation id.
    pub fn new_correlation_id() -> String {
        uuid::Uuid::now_v7().to_string()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    /// Wait until the client reaches `target`.
    pub async fn wait_for_state(&self, target: ClientState, timeout: Duration) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|s| *s == target)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(QueError::Closed("client")),
            Err(_) => Err(QueError::timeout("client state", timeout)),
        }
    }

    /// Whether `close` has been called.
    pub fn is_closing(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Outstanding correlation waiters.
    pub fn pending_waiters(&self) -> usize {
        self.inner.waiters.len()
    }

    /// Stop both loops and release the connection.
    ///
    /// Messages already queued get one final write attempt each. When the
    /// loops do not finish within `timeout` this returns
    /// [`QueError::Timeout`]; they keep draining in the background and the
    /// transport is released once they do.
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        self.shutdown
            .graceful_shutdown_then("k8mq client", timeout, async move {
                let transport = inner.current.write().take();
                if let Some(transport) = transport {
                    transport.close().await;
                }
                inner.set_state(ClientState::Closed);
            })
            .await
    }
}

impl Inner {
    fn set_state(&self, next: ClientState) {
        let _ = self.state.send_if_modified(|state| {
            if *state == ClientState::Closed || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    fn current(&self) -> Option<SharedTransport> {
        self.current.read().clone()
    }

    fn install(&self, transport: SharedTransport) {
        let previous = self.current.write().replace(transport);
        drop(previous);
        self.set_state(ClientState::Connected);
    }

    /// Clear the slot, but only if it still holds `transport`.
    fn discard(&self, transport: &SharedTransport) {
        let mut current = self.current.write();
        if current
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, transport))
        {
            *current = None;
        }
    }

    /// One dial cycle. Returns whether a transport was installed.
    async fn connect(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.set_state(ClientState::Connecting);
        let backoff = self.config.connect_backoff();
        let target = self.connector.target();

        for attempt in 0..backoff.max_attempts() {
            let dialed = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return false,
                dialed = tokio::time::timeout(self.config.dial_timeout(), self.connector.connect()) => dialed,
            };
            match dialed {
                Ok(Ok(transport)) => {
                    info!(target_url = %target, id = %transport.id(), attempt, "connected to k8mq server");
                    self.install(transport);
                    return true;
                }
                Ok(Err(e)) => warn!(target_url = %target, attempt, error = %e, "dial failed"),
                Err(_) => warn!(
                    target_url = %target,
                    attempt,
                    timeout_ms = self.config.dial_timeout_ms,
                    "dial timed out"
                ),
            }
            if !sleep_or_cancel(backoff.delay(attempt), &self.cancel).await {
                return false;
            }
        }

        warn!(
            target_url = %target,
            attempts = backoff.max_attempts(),
            "remote k8mq server did not respond"
        );
        self.set_state(ClientState::Disconnected);
        false
    }

    fn dispatch(&self, message: Message) {
        let message = match message.correlation_id() {
            Some(id) => match self.waiters.fulfill(&id, message) {
                Ok(()) => return,
                Err(message) => message,
            },
            None => message,
        };
        match &self.reader {
            Some(reader) => reader(message),
            None => debug!(len = message.len(), "no reader configured, dropping message"),
        }
    }

    /// Try `envelope` up to `write_attempts` times against the current handle.
    async fn deliver(&self, envelope: &Envelope) -> bool {
        let backoff = self.config.write_backoff();
        for attempt in 0..backoff.max_attempts() {
            if let Some(transport) = self.current() {
                match transport.write(&envelope.message).await {
                    Ok(()) => return true,
                    Err(e) => debug!(id = %transport.id(), attempt, error = %e, "write failed"),
                }
            } else {
                debug!(attempt, "no connection for write");
            }
            let last = attempt + 1 == backoff.max_attempts();
            if last || !sleep_or_cancel(backoff.delay(attempt), &self.cancel).await {
                break;
            }
        }
        false
    }

    fn give_up(&self, envelope: Envelope) {
        let payload = String::from_utf8_lossy(envelope.message.as_bytes()).into_owned();
        if self.shutting_down.load(Ordering::SeqCst) {
            warn!(payload, "shutting down, dropping undelivered message");
            return;
        }
        if envelope.retries() >= 1 {
            error!(payload, retries = envelope.retries(), "couldn't write to the k8mq server, dropping message");
            return;
        }
        match self.outbound.try_send(envelope.requeued()) {
            Ok(()) => debug!("requeued undelivered message"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                error!(payload, "outbound queue full, dropping undelivered message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(payload, "outbound queue closed, dropping undelivered message");
            }
        }
    }
}

async fn receive_loop(inner: Arc<Inner>) {
    while !inner.cancel.is_cancelled() {
        let Some(transport) = inner.current() else {
            let _ = inner.connect().await;
            continue;
        };

        let read = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            read = transport.read() => read,
        };

        match read {
            Ok(message) => inner.dispatch(message),
            Err(e) => {
                if e == TransportError::Closed {
                    info!(id = %transport.id(), "connection closed, reconnecting");
                } else {
                    warn!(id = %transport.id(), error = %e, "read error, reconnecting");
                }
                inner.discard(&transport);
                transport.close().await;
                inner.set_state(ClientState::Disconnected);
            }
        }
    }
    debug!("receive loop stopped");
}

async fn send_loop(inner: Arc<Inner>, mut queue: mpsc::Receiver<Envelope>) {
    let mut closing = false;
    loop {
        let envelope = tokio::select! {
            biased;
            next = queue.recv() => next,
            () = inner.cancel.cancelled(), if !closing => {
                // Stop accepting; what is already buffered still drains.
                queue.close();
                closing = true;
                continue;
            }
        };
        let Some(envelope) = envelope else { break };
        if !inner.deliver(&envelope).await {
            inner.give_up(envelope);
        }
    }
    debug!("send loop stopped");
}

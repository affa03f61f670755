//! Connection registry and broadcaster.
//!
//! A single actor task owns the live connection list. Admissions and
//! broadcasts reach it through one bounded mailbox, so a connection admitted
//! after a broadcast was queued never receives that broadcast. Each broadcast
//! rebuilds the list: entries whose liveness ended, or whose write fails, are
//! dropped for good.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use k8mq_core::{Message, QueError, Result, SharedTransport, ShutdownCoordinator};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::{QUE_BROADCASTS_TOTAL, QUE_CONNECTIONS_ACTIVE, QUE_PRUNED_TOTAL};

/// One admitted connection.
struct Entry {
    transport: SharedTransport,
    /// Cancelled once the originating request is gone.
    liveness: CancellationToken,
}

enum Command {
    Admit(Entry),
    Broadcast(Message),
}

/// Handle to the registry actor.
pub struct Registry {
    mailbox: mpsc::Sender<Command>,
    live: Arc<AtomicUsize>,
    shutdown: ShutdownCoordinator,
}

impl Registry {
    /// Spawn the registry actor.
    ///
    /// `write_timeout` bounds each write to each connection; a write that
    /// runs over counts as failed.
    pub fn new(mailbox_capacity: usize, write_timeout: Duration) -> Self {
        let (mailbox, rx) = mpsc::channel(mailbox_capacity.max(1));
        let live = Arc::new(AtomicUsize::new(0));
        let shutdown = ShutdownCoordinator::new();
        let actor = Actor {
            rx,
            entries: Vec::new(),
            live: live.clone(),
            write_timeout,
            closing: shutdown.token(),
        };
        shutdown.track(tokio::spawn(actor.run()));
        Self {
            mailbox,
            live,
            shutdown,
        }
    }

    /// Queue a connection for admission.
    ///
    /// Once `liveness` is cancelled the connection is skipped and pruned on
    /// the next broadcast.
    pub async fn admit(&self, transport: SharedTransport, liveness: CancellationToken) -> Result<()> {
        self.send(Command::Admit(Entry {
            transport,
            liveness,
        }))
        .await
    }

    /// Queue `message` for every live connection.
    ///
    /// Fire-and-forget: per-recipient failures are logged and pruned, never
    /// returned.
    pub async fn broadcast(&self, message: impl Into<Message>) -> Result<()> {
        self.send(Command::Broadcast(message.into())).await
    }

    async fn send(&self, command: Command) -> Result<()> {
        if self.shutdown.is_shutting_down() {
            return Err(QueError::Closed("registry"));
        }
        let closing = self.shutdown.token();
        tokio::select! {
            sent = self.mailbox.send(command) => sent.map_err(|_| QueError::Closed("registry")),
            () = closing.cancelled() => Err(QueError::Closed("registry")),
        }
    }

    /// Connections in the live list after the last processed command.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_shutting_down()
    }

    /// Close the mailbox and let the actor drain what was already queued.
    ///
    /// The mailbox stays closed even when this times out.
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        self.shutdown.graceful_shutdown("que registry", timeout).await
    }
}

struct Actor {
    rx: mpsc::Receiver<Command>,
    entries: Vec<Entry>,
    live: Arc<AtomicUsize>,
    write_timeout: Duration,
    closing: CancellationToken,
}

impl Actor {
    async fn run(mut self) {
        let mut draining = false;
        loop {
            let command = tokio::select! {
                biased;
                next = self.rx.recv() => next,
                () = self.closing.cancelled(), if !draining => {
                    self.rx.close();
                    draining = true;
                    continue;
                }
            };
            match command {
                Some(Command::Admit(entry)) => self.admit(entry),
                Some(Command::Broadcast(message)) => self.broadcast(&message).await,
                None => break,
            }
        }
        info!(remaining = self.entries.len(), "que registry stopped");
    }

    fn admit(&mut self, entry: Entry) {
        if entry.liveness.is_cancelled() {
            debug!(id = %entry.transport.id(), "connection ended before admission");
            return;
        }
        debug!(id = %entry.transport.id(), "connection admitted");
        self.entries.push(entry);
        self.publish_count();
    }

    async fn broadcast(&mut self, message: &Message) {
        counter!(QUE_BROADCASTS_TOTAL).increment(1);
        let entries = std::mem::take(&mut self.entries);
        let write_timeout = self.write_timeout;
        let outcomes = join_all(entries.iter().map(|entry| async move {
            if entry.liveness.is_cancelled() {
                return false;
            }
            match tokio::time::timeout(write_timeout, entry.transport.write(message)).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!(id = %entry.transport.id(), error = %e, "client write failed, removing from que list");
                    false
                }
                Err(_) => {
                    warn!(
                        id = %entry.transport.id(),
                        timeout_ms = write_timeout.as_millis(),
                        "client write timed out, removing from que list"
                    );
                    false
                }
            }
        }))
        .await;

        let mut kept = Vec::with_capacity(entries.len());
        for (entry, ok) in entries.into_iter().zip(outcomes) {
            if ok {
                kept.push(entry);
            } else {
                counter!(QUE_PRUNED_TOTAL).increment(1);
                // Pruned for good; closing lets its handler return.
                let _ = tokio::time::timeout(write_timeout, entry.transport.close()).await;
            }
        }
        debug!(recipients = kept.len(), len = message.len(), "broadcast delivered");
        self.entries = kept;
        self.publish_count();
    }

    #[allow(clippy::cast_precision_loss)]
    fn publish_count(&self) {
        self.live.store(self.entries.len(), Ordering::Relaxed);
        gauge!(QUE_CONNECTIONS_ACTIVE).set(self.entries.len() as f64);
    }
}

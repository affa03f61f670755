//! One-shot reply routing keyed by correlation id.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::message::Message;

/// Delivery slot for a single correlated reply.
pub type Waiter = oneshot::Sender<Message>;

/// Outcome of [`CorrelationTable::register`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    /// Empty ids are never registered.
    Ignored,
    /// A new waiter was installed.
    Installed,
    /// An older waiter for the same id was dropped in favour of this one.
    Replaced,
}

struct Slot {
    waiter: Waiter,
    // The broker fans a request back out to its sender; the first frame
    // byte-identical to this is swallowed instead of fulfilling the waiter.
    echo: Option<Bytes>,
}

/// Maps correlation ids to one-shot waiters.
///
/// Registration can come from any task; matching happens on the client's
/// receive loop. Matching removes the waiter and delivers to it under the same
/// write lock, so one id is fulfilled at most once.
#[derive(Default)]
pub struct CorrelationTable {
    waiters: RwLock<HashMap<String, Slot>>,
}

impl CorrelationTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `waiter` under `correlation_id`.
    ///
    /// A second registration for the same id replaces the first. The displaced
    /// waiter is dropped, so its receiver resolves with a `RecvError` instead
    /// of hanging.
    pub fn register(&self, correlation_id: impl Into<String>, waiter: Waiter) -> Registration {
        self.install(correlation_id.into(), Slot { waiter, echo: None })
    }

    /// Like [`register`](Self::register), for a waiter whose own request
    /// `sent` will be echoed back before the reply arrives.
    pub fn register_request(
        &self,
        correlation_id: impl Into<String>,
        waiter: Waiter,
        sent: Bytes,
    ) -> Registration {
        self.install(
            correlation_id.into(),
            Slot {
                waiter,
                echo: Some(sent),
            },
        )
    }

    fn install(&self, correlation_id: String, slot: Slot) -> Registration {
        if correlation_id.is_empty() {
            return Registration::Ignored;
        }
        let previous = self.waiters.write().insert(correlation_id.clone(), slot);
        if previous.is_some() {
            warn!(correlation_id, "replacing existing waiter for correlation id");
            Registration::Replaced
        } else {
            Registration::Installed
        }
    }

    /// Deliver `message` to the waiter for `correlation_id` and remove it.
    ///
    /// `Ok` means the table consumed the message: it was delivered, or it was
    /// the echo of a request registered with
    /// [`register_request`](Self::register_request), in which case the waiter
    /// stays in place. Hands the message back when nobody is waiting, or when
    /// the waiter's receiver is already gone, so the caller can route it
    /// elsewhere.
    pub fn fulfill(&self, correlation_id: &str, message: Message) -> Result<(), Message> {
        let mut waiters = self.waiters.write();
        let Some(slot) = waiters.get_mut(correlation_id) else {
            return Err(message);
        };
        if slot.echo.as_ref() == Some(message.payload()) {
            slot.echo = None;
            debug!(correlation_id, "swallowed echo of own request");
            return Ok(());
        }
        let Some(slot) = waiters.remove(correlation_id) else {
            return Err(message);
        };
        slot.waiter.send(message).inspect_err(|_| {
            debug!(correlation_id, "waiter receiver dropped before delivery");
        })
    }

    /// Remove a waiter without delivering to it.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        self.waiters.write().remove(correlation_id).is_some()
    }

    /// Whether a waiter is registered for `correlation_id`.
    pub fn contains(&self, correlation_id: &str) -> bool {
        self.waiters.read().contains_key(correlation_id)
    }

    /// Number of outstanding waiters.
    pub fn len(&self) -> usize {
        self.waiters.read().len()
    }

    /// Whether no waiters are outstanding.
    pub fn is_empty(&self) -> bool {
        self.waiters.read().is_empty()
    }
}

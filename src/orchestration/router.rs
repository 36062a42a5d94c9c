//! Message Router between the coordinator and workers.
//!
//! Every participant owns one mailbox, an unbounded queue, so `send`
//! never blocks. Senders stamp messages through an [`Outbox`] with a
//! sequence number per `(sender, recipient)` stream, and the router
//! checks the stamp on the way through:
//!
//! - the next expected number is delivered as-is,
//! - a jump forward is delivered and reported as a gap,
//! - a stale or repeated number is dropped and reported,
//!
//! so a recipient always observes non-decreasing numbers per sender.

use crate::error::{Error, Result};
use crate::orchestration::WorkerId;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};

/// Endpoint of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum Address {
    Coordinator,
    Worker(WorkerId),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Coordinator => write!(f, "coordinator"),
            Address::Worker(id) => write!(f, "worker:{}", id.short()),
        }
    }
}

/// What a message asks for or reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Coordinator hands a task to a worker.
    Assign,
    Progress,
    /// Worker finished a task; payload carries the result.
    Result,
    /// Worker could not finish a task; payload carries the reason.
    Failure,
    RequestGuidance,
    Guidance,
    ShutdownRequest,
    ShutdownAck,
}

/// A routed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub from: Address,
    pub to: Address,
    pub kind: MessageKind,
    pub payload: Value,
    /// Monotonic per `(from, to)` stream, starting at 1. Zero means
    /// unstamped.
    pub sequence_number: u64,
    pub sent_at: DateTime<Utc>,
}

impl Message {
    /// Build an unstamped message.
    pub fn new(from: Address, to: Address, kind: MessageKind, payload: Value) -> Self {
        Self {
            from,
            to,
            kind,
            payload,
            sequence_number: 0,
            sent_at: Utc::now(),
        }
    }

    pub fn with_sequence(mut self, sequence_number: u64) -> Self {
        self.sequence_number = sequence_number;
        self
    }
}

/// Delivery anomalies surfaced to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    /// Numbers were skipped; the message after the gap was delivered.
    GapDetected {
        from: Address,
        to: Address,
        expected: u64,
        received: u64,
    },
    /// A stale or repeated number; the message was dropped.
    Dropped {
        from: Address,
        to: Address,
        last_delivered: u64,
        received: u64,
    },
}

/// Receiving end of one participant's queue.
///
/// Clones share the queue. Dropping a stream obtained from
/// [`Mailbox::stream`] leaves undelivered messages in place, so the
/// sequence can be restarted at any time.
#[derive(Clone)]
pub struct Mailbox {
    address: Address,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>>,
}

impl Mailbox {
    pub fn address(&self) -> Address {
        self.address
    }

    /// Wait for the next message. `None` once the router dropped the
    /// queue and it is drained.
    pub async fn recv(&self) -> Option<Message> {
        self.rx.lock().await.recv().await
    }

    /// Take a message if one is queued right now.
    pub fn try_recv(&self) -> Option<Message> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Lazy sequence of incoming messages.
    pub fn stream(&self) -> impl Stream<Item = Message> {
        stream::unfold(self.clone(), |mailbox| async move {
            mailbox.recv().await.map(|msg| (msg, mailbox))
        })
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox").field("address", &self.address).finish()
    }
}

#[derive(Default)]
struct RouterState {
    mailboxes: HashMap<Address, (mpsc::UnboundedSender<Message>, Mailbox)>,
    last_delivered: HashMap<(Address, Address), u64>,
    ack_waiters: HashMap<WorkerId, oneshot::Sender<Message>>,
}

/// Shared router handle.
#[derive(Clone)]
pub struct MessageRouter {
    state: Arc<Mutex<RouterState>>,
    events: mpsc::UnboundedSender<RouterEvent>,
}

impl MessageRouter {
    /// Create a router and the receiver for its delivery anomalies.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RouterEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::new(Mutex::new(RouterState::default())),
                events,
            },
            rx,
        )
    }

    /// Create (or replace) the mailbox for an address.
    pub fn register(&self, address: Address) -> Mailbox {
        let (tx, rx) = mpsc::unbounded_channel();
        let mailbox = Mailbox {
            address,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        };
        self.state
            .lock()
            .mailboxes
            .insert(address, (tx, mailbox.clone()));
        mailbox
    }

    /// Remove an address and forget its sequence streams.
    pub fn unregister(&self, address: Address) {
        let mut state = self.state.lock();
        state.mailboxes.remove(&address);
        state
            .last_delivered
            .retain(|(from, to), _| *from != address && *to != address);
        if let Address::Worker(id) = address {
            state.ack_waiters.remove(&id);
        }
    }

    pub fn is_registered(&self, address: Address) -> bool {
        self.state.lock().mailboxes.contains_key(&address)
    }

    /// Lazy sequence of messages addressed to `recipient`.
    pub fn receive(&self, recipient: Address) -> Result<impl Stream<Item = Message>> {
        let state = self.state.lock();
        let (_, mailbox) = state
            .mailboxes
            .get(&recipient)
            .ok_or(Error::UnknownRecipient(recipient))?;
        Ok(mailbox.stream())
    }

    /// Intercept the next `shutdown_ack` from a worker.
    ///
    /// The ack is handed to the returned receiver instead of the
    /// recipient's mailbox.
    pub fn expect_ack(&self, worker: WorkerId) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().ack_waiters.insert(worker, tx);
        rx
    }

    /// Enqueue a message for delivery. Never blocks.
    ///
    /// # Errors
    /// - `UnknownRecipient` if nothing is registered at `message.to`.
    /// - `ChannelClosed` if the recipient's queue was dropped.
    pub fn send(&self, message: Message) -> Result<()> {
        let mut state = self.state.lock();

        if message.kind == MessageKind::ShutdownAck {
            if let Address::Worker(worker) = message.from {
                if let Some(waiter) = state.ack_waiters.remove(&worker) {
                    let last = state
                        .last_delivered
                        .entry((message.from, message.to))
                        .or_insert(0);
                    *last = (*last).max(message.sequence_number);
                    let _ = waiter.send(message);
                    return Ok(());
                }
            }
        }

        let (tx, _) = state
            .mailboxes
            .get(&message.to)
            .ok_or(Error::UnknownRecipient(message.to))?;
        let tx = tx.clone();

        if message.sequence_number > 0 {
            let key = (message.from, message.to);
            let last = state.last_delivered.get(&key).copied().unwrap_or(0);
            let received = message.sequence_number;
            if received <= last {
                warn!(
                    from = %message.from,
                    to = %message.to,
                    last_delivered = last,
                    received,
                    "Dropping out-of-order message"
                );
                let _ = self.events.send(RouterEvent::Dropped {
                    from: message.from,
                    to: message.to,
                    last_delivered: last,
                    received,
                });
                return Ok(());
            }
            if received > last + 1 {
                warn!(
                    from = %message.from,
                    to = %message.to,
                    expected = last + 1,
                    received,
                    "Message sequence gap"
                );
                let _ = self.events.send(RouterEvent::GapDetected {
                    from: message.from,
                    to: message.to,
                    expected: last + 1,
                    received,
                });
            }
            state.last_delivered.insert(key, received);
        }

        trace!(
            from = %message.from,
            to = %message.to,
            kind = ?message.kind,
            seq = message.sequence_number,
            "Routing message"
        );
        let to = message.to;
        tx.send(message)
            .map_err(|_| Error::ChannelClosed(format!("mailbox for {}", to)))
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("mailboxes", &self.state.lock().mailboxes.len())
            .finish()
    }
}

/// Sending half for one participant: stamps sequence numbers.
#[derive(Clone)]
pub struct Outbox {
    from: Address,
    router: MessageRouter,
    next: Arc<Mutex<HashMap<Address, u64>>>,
}

impl Outbox {
    pub fn new(from: Address, router: MessageRouter) -> Self {
        Self {
            from,
            router,
            next: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn address(&self) -> Address {
        self.from
    }

    /// Stamp and send. Returns the sequence number used.
    pub fn send(&self, to: Address, kind: MessageKind, payload: Value) -> Result<u64> {
        let seq = {
            let mut next = self.next.lock();
            let counter = next.entry(to).or_insert(0);
            *counter += 1;
            *counter
        };
        self.router
            .send(Message::new(self.from, to, kind, payload).with_sequence(seq))?;
        Ok(seq)
    }
}

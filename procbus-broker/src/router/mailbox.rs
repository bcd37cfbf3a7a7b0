// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use tokio::sync::mpsc;

// Layer 3: Internal module imports
use crate::error::BrokerError;
use procbus_wire::Message;

/// Create a bounded per-target mailbox pair.
///
/// The sender side lives in the route table; the receiver side is drained
/// by the target's writer task.
///
/// # Example
///
/// ```rust
/// use procbus_broker::router::mailbox;
/// use procbus_wire::Message;
///
/// # tokio_test::block_on(async {
/// let (sender, mut mailbox) = mailbox("worker-1", 8);
/// sender.try_send(Message::event("e1", "broker", "worker-1", serde_json::Value::Null)).unwrap();
/// let msg = mailbox.recv().await.unwrap();
/// assert_eq!(msg.id, "e1");
/// # });
/// ```
pub fn mailbox(target: impl Into<String>, capacity: usize) -> (MailboxSender, Mailbox) {
    let target = target.into();
    let (tx, rx) = mpsc::channel(capacity);
    (
        MailboxSender {
            target: target.clone(),
            sender: tx,
            capacity,
        },
        Mailbox {
            target,
            receiver: rx,
            capacity,
        },
    )
}

/// Receiving half of a per-target mailbox, drained by the writer task.
#[derive(Debug)]
pub struct Mailbox {
    target: String,
    receiver: mpsc::Receiver<Message>,
    capacity: usize,
}

impl Mailbox {
    /// Await the next queued message.
    ///
    /// Returns `None` once the target is unregistered and the queue has
    /// drained, which is the writer task's signal to exit.
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// The target this mailbox belongs to.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Sending half of a per-target mailbox, held by the route table.
#[derive(Debug, Clone)]
pub struct MailboxSender {
    target: String,
    sender: mpsc::Sender<Message>,
    capacity: usize,
}

impl MailboxSender {
    /// Enqueue without blocking.
    ///
    /// The routing fast path must never stall behind a slow target, so a
    /// full mailbox is an error, not a wait.
    pub fn try_send(&self, msg: Message) -> Result<(), BrokerError> {
        self.sender.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BrokerError::MailboxFull {
                target: self.target.clone(),
            },
            mpsc::error::TrySendError::Closed(_) => BrokerError::NoRoute {
                target: self.target.clone(),
            },
        })
    }

    /// The target this sender feeds.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

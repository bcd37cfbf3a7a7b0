//! Target routing table with wait-free lookup.

// Layer 1: Standard library imports
use std::sync::atomic::{AtomicU64, Ordering};

// Layer 2: Third-party crate imports
use dashmap::DashMap;
use tracing::{debug, warn};

// Layer 3: Internal module imports
use super::mailbox::MailboxSender;
use crate::error::BrokerError;
use procbus_wire::Message;

/// Result of one routing attempt.
///
/// `Route` never blocks and never creates mailboxes implicitly; both
/// failure cases are reported to the caller and counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Message handed to the target's mailbox
    Delivered,
    /// No mailbox registered for the target
    NoRoute,
    /// Target mailbox was at capacity
    Full,
}

impl RouteOutcome {
    /// Returns `true` for [`RouteOutcome::Delivered`].
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Maps target ids to mailbox senders.
///
/// Registration is single-writer per target; the lookup path is a
/// concurrent-map read, so routing continues unstalled while targets come
/// and go. Each registered mailbox is owned exclusively by its target's
/// writer task.
///
/// # Example
///
/// ```rust
/// use procbus_broker::router::{mailbox, RouteOutcome, Router};
/// use procbus_wire::Message;
///
/// let router = Router::new();
/// let (sender, _mailbox) = mailbox("w1", 8);
/// router.register_route("w1", sender).unwrap();
///
/// let msg = Message::event("e1", "broker", "w1", serde_json::Value::Null);
/// assert_eq!(router.route(msg, "broker"), RouteOutcome::Delivered);
///
/// let ghost = Message::event("e2", "broker", "ghost", serde_json::Value::Null);
/// assert_eq!(router.route(ghost, "broker"), RouteOutcome::NoRoute);
/// ```
#[derive(Debug, Default)]
pub struct Router {
    routes: DashMap<String, MailboxSender>,
    delivered: AtomicU64,
    no_route: AtomicU64,
    full: AtomicU64,
}

impl Router {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mailbox for `target`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::DuplicateId`] if the target already has a
    /// route; restart flows must unregister first.
    pub fn register_route(
        &self,
        target: impl Into<String>,
        sender: MailboxSender,
    ) -> Result<(), BrokerError> {
        let target = target.into();
        match self.routes.entry(target.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(BrokerError::DuplicateId { id: target })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!(target = %target, "route registered");
                slot.insert(sender);
                Ok(())
            }
        }
    }

    /// Remove the route for `target`, if any.
    ///
    /// The mailbox sender is dropped, which lets the target's writer task
    /// drain and exit.
    pub fn unregister_route(&self, target: &str) -> bool {
        let removed = self.routes.remove(target).is_some();
        if removed {
            debug!(target = %target, "route unregistered");
        }
        removed
    }

    /// Returns `true` if `target` currently has a route.
    pub fn has_route(&self, target: &str) -> bool {
        self.routes.contains_key(target)
    }

    /// Number of registered routes.
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Ids of all registered targets.
    pub fn targets(&self) -> Vec<String> {
        self.routes.iter().map(|e| e.key().clone()).collect()
    }

    /// Route `msg` to its target's mailbox.
    ///
    /// Never blocks. A missing target or a full mailbox is returned to the
    /// caller and counted; no mailbox is created implicitly.
    pub fn route(&self, msg: Message, source: &str) -> RouteOutcome {
        let Some(sender) = self.routes.get(&msg.target).map(|e| e.value().clone()) else {
            warn!(source = %source, target = %msg.target, id = %msg.id, "no route to target");
            self.no_route.fetch_add(1, Ordering::Relaxed);
            return RouteOutcome::NoRoute;
        };

        match sender.try_send(msg) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                RouteOutcome::Delivered
            }
            Err(BrokerError::MailboxFull { target }) => {
                warn!(source = %source, target = %target, "target mailbox full");
                self.full.fetch_add(1, Ordering::Relaxed);
                RouteOutcome::Full
            }
            Err(_) => {
                // Sender raced with an unregister; the route is gone.
                self.no_route.fetch_add(1, Ordering::Relaxed);
                RouteOutcome::NoRoute
            }
        }
    }

    /// Messages delivered to a mailbox.
    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Routing attempts that found no target.
    pub fn no_route_count(&self) -> u64 {
        self.no_route.load(Ordering::Relaxed)
    }

    /// Routing attempts that hit a full mailbox.
    pub fn full_count(&self) -> u64 {
        self.full.load(Ordering::Relaxed)
    }
}

//! Message routing and correlation.
//!
//! The router owns one bounded [`Mailbox`] per registered target and routes
//! messages to them without ever blocking the caller: the lookup is
//! wait-free and delivery uses a non-blocking send, so a congested target
//! surfaces as [`RouteOutcome::Full`] instead of stalling the pipeline.
//!
//! The correlation engine ties responses back to their originating
//! requests. Correlation ids combine a per-process seed with a monotonic
//! counter, so they are unique across concurrent generators for the
//! broker's lifetime. Pending entries carry a deadline; a background
//! sweeper signals `Timeout` to overdue sinks exactly once, and shutdown
//! signals `Canceled` to whatever is left.
//!
//! # Components
//!
//! - [`Mailbox`] / [`MailboxSender`] - per-target bounded FIFO
//! - [`Router`] - target registration and wait-free dispatch
//! - [`CorrelationTable`] - pending-request tracking with deadlines

pub mod correlation;
pub mod mailbox;
pub mod routes;

pub use correlation::{CompleteResult, CorrelationOutcome, CorrelationTable};
pub use mailbox::{mailbox, Mailbox, MailboxSender};
pub use routes::{RouteOutcome, Router};

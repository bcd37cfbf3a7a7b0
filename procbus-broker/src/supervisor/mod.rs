//! Child process supervision.
//!
//! The supervisor spawns children, wires the two extra RPC handle slots on
//! the RPC variants, tracks lifecycle status, enforces restart budgets, and
//! bridges each RPC child into the message pipeline: a per-child reader
//! task feeds the child's outbound frames into the optimizer, and a
//! per-child writer task drains the child's mailbox onto its inbound
//! handle.
//!
//! # Components
//!
//! - [`ProcessDescriptor`] / [`ProcessStatus`] / [`RestartConfig`] - child
//!   identity, lifecycle state, and restart policy
//! - [`Supervisor`] - spawn, kill, list, shutdown, restart loops

pub mod descriptor;
pub mod spawner;

#[allow(clippy::module_inception)]
pub mod supervisor;

pub use descriptor::{ProcessDescriptor, ProcessStatus, RestartConfig};
pub use spawner::HandleSlots;
pub use supervisor::{Supervisor, SupervisorConfig};

//! # procbus-child - Child-Side RPC Endpoint
//!
//! The library a supervised child links to speak with the broker over its
//! two inherited descriptor slots (defaults: 3 inbound, 4 outbound).
//!
//! A child MUST probe the slots before doing any work and exit with code
//! 254 if either is invalid; the broker treats that exit code as
//! `InvalidRPCHandle`. [`ChildEndpoint::inherit_or_exit`] implements the
//! whole contract.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use procbus_child::ChildEndpoint;
//! use procbus_wire::rpc::{self, method, PermitParams};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Probes slots 3/4, exits 254 on failure.
//!     let mut endpoint = ChildEndpoint::inherit_or_exit("worker-1");
//!
//!     let payload = rpc::call(method::REQUEST_PERMITS, PermitParams {
//!         provider_id: "worker-1".into(),
//!         permit_count: 2,
//!     }).unwrap();
//!
//!     let response = endpoint
//!         .request("broker", payload, Duration::from_secs(5))
//!         .await
//!         .unwrap();
//!     println!("granted: {}", response.payload["granted"]);
//! }
//! ```

#[cfg(unix)]
pub mod endpoint;
pub mod error;

#[cfg(unix)]
pub use endpoint::{ChildEndpoint, EndpointSlots};
pub use error::EndpointError;

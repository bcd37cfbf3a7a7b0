//! Broker facade and configuration.
//!
//! The facade owns every subsystem - supervisor, router, correlation
//! table, optimizer, permit manager, metrics - and implements the
//! broker-addressed method table that workers dispatch into.
//!
//! # Components
//!
//! - [`BrokerConfig`] - every tuning knob, with defaults, a builder, and
//!   `from_env`
//! - [`Broker`] - the assembled daemon core

pub mod broker;
pub mod config;

pub use broker::Broker;
pub use config::BrokerConfig;

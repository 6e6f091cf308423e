//! # Masterchef Core
//!
//! Control-plane building blocks for the Masterchef configuration manager.
//!
//! ## Overview
//!
//! - **Event log**: append-only, hash-chained ring buffer with bounded
//!   subscriber channels ([`events`])
//! - **Admission**: composable veto gates consulted before every enqueue
//!   ([`admission`])
//! - **Queue**: three-priority FIFO with idempotency, worker pool and
//!   cooperative cancellation ([`queue`])
//! - **Runner**: resource-graph executor invoked by queue workers ([`runner`])
//! - **Scheduler**, **rule engine** and **trigger ingress** that all funnel
//!   back into the queue ([`scheduler`], [`rules`], [`triggers`])
//! - **Locks and leases**: keyed execution locks and heartbeated run leases
//!   ([`locks`], [`leases`])
//! - **Query facade**: predicate evaluation over every registered store
//!   ([`query`])
//!
//! [`control::ControlPlane`] owns one instance of each and is what the HTTP
//! layer holds on to.

#![allow(missing_docs)]

pub mod admission;
pub mod clock;
pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod leases;
pub mod locks;
pub mod query;
pub mod queue;
pub mod rules;
pub mod runner;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod triggers;

pub use control::{ControlPlane, ControlPlaneBuilder};
pub use error::{ControlError, ErrorKind, Result};

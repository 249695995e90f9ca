//! # ION Container - capability container runtime
//!
//! Hosts typed processes and wires them to a broker-based messaging layer:
//! - Process supervision with a PENDING → RUNNING → TERMINATING → TERMINATED lifecycle
//! - RPC with conversation tracking, deadlines and structured error replies
//! - Publish/subscribe streams with topic wildcards
//! - An ordered interceptor pipeline on every message, in both directions
//! - Governance: cached access policy and per-operation preconditions
//!
//! ## Architecture
//!
//! ```text
//!   spawn / terminate
//!          │
//!          ▼
//!   ┌─────────────┐      ┌──────────────────┐
//!   │ Supervisor  │─────→│ Process registry │
//!   └──────┬──────┘      └──────────────────┘
//!          │ wires
//!          ▼
//!   ┌─────────────┐      ┌──────────────────┐
//!   │ Endpoints   │─────→│ Interceptors     │──→ Governance controller
//!   │ rpc, pubsub │      │ (per direction)  │    (policy cache, preconditions)
//!   └──────┬──────┘      └──────────────────┘
//!          ▼
//!   Transport (broker)
//! ```
//!
//! Each process runs on one control task, so its handlers execute one at a
//! time; concurrency comes from running many processes.

#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod container;
pub mod endpoint;
pub mod envelope;
pub mod governance;
pub mod interceptor;
pub mod transport;
pub mod types;

pub mod observability;

pub use container::{Container, ContainerBuilder};
pub use types::{Config, Error, Result};

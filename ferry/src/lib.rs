//! In-process pub/sub driver with receiver-driven image rejection.
//!
//! A [`Driver`](driver::Driver) runs a single conductor thread. Clients
//! connect through a [`DriverConnector`](driver::DriverConnector), add
//! publications and subscriptions, and may reject images they no longer want.
//! Rejection fans a bounded error frame out to every client publishing to the
//! rejected image.

pub mod channel;
pub mod client;
pub mod config;
pub mod counters;
pub mod driver;
pub mod error_log;
pub mod net;
pub mod queue;
pub mod timing;
pub mod trace;

pub use client::{Client, ClientError, PublicationErrorFrame, PublicationErrorFrameHandler};
pub use config::{ClientConfig, DriverConfig};
pub use counters::{SystemCounter, SystemCounters};
pub use driver::commands::{ErrorCode, NULL_VALUE};
pub use driver::{Driver, DriverConnector, DriverError};
pub use trace::init_tracing;

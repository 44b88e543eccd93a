//! # weather-worker
//!
//! Background worker for the `local_weather` queue.
//!
//! Connects to an AMQP broker, declares a durable queue, and processes
//! deliveries one at a time with manual acknowledgment. Stops on request
//! by draining in-flight work within a bounded grace period.

pub mod broker;
pub mod config;
pub mod error;
pub mod model;
pub mod processor;
pub mod retry;
pub mod signal;
pub mod telemetry;
pub mod worker;

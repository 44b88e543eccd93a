//! Worker engine: lifecycle control and the consume loop.

mod consume;
pub mod control;

pub use control::{Worker, WorkerBuilder, WorkerSettings};

//! Per-delivery processing.
//!
//! The worker treats payloads as opaque bytes and hands them to a
//! [`Processor`]. Returning `Ok` means the delivery may be acknowledged.

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, payload: &[u8]) -> Result<()>;
}

/// Stands in for real work: waits a fixed delay and leaves the payload
/// untouched. Never fails.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedWork {
    delay: Duration,
}

impl SimulatedWork {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for SimulatedWork {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl Processor for SimulatedWork {
    async fn process(&self, _payload: &[u8]) -> Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(())
    }
}

//! Artificial reply delay, used to imitate slow links.

use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Latency(Duration);

impl Latency {
    pub fn new(delay: Duration) -> Self {
        Latency(delay)
    }

    pub fn delay(&self) -> Duration {
        self.0
    }

    /// Sleep for the configured delay. A zero delay returns immediately
    /// without yielding to the scheduler.
    pub async fn inject(&self) {
        if !self.0.is_zero() {
            tokio::time::sleep(self.0).await;
        }
    }
}

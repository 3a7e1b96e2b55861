//! Metrics backends. The [`crate::Metrics`] trait itself lives in the crate root; this module
//! holds concrete implementations and their registration.
//!
//! If no `metrics:` block is configured, [`NoOpMetrics`] is used as a zero-overhead default.
use async_trait::async_trait;

use crate::{Closer, Error, Metrics};

pub(crate) fn register_plugins() -> Result<(), Error> {
    Ok(())
}

/// Discards every recorded metric. Used when no `metrics:` block is configured.
#[derive(Debug, Default)]
pub struct NoOpMetrics;

impl NoOpMetrics {
    /// Creates a new no-op metrics instance.
    pub fn new() -> Self {
        Self
    }
}

impl Closer for NoOpMetrics {}

#[async_trait]
impl Metrics for NoOpMetrics {
    async fn record(&self, _name: &str, _value: u64, _labels: &[(&str, &str)]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_metrics_accepts_any_record() {
        let m = NoOpMetrics::new();
        m.record("items.total", 1, &[("resource", "file:///a")]).await;
    }
}

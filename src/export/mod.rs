//! Destinations for finished lag batches.

pub mod prometheus;
pub mod remote_write;

use crate::error::{LagError, Result};
use crate::metrics::types::LagBatch;
use std::sync::Arc;
use std::time::Instant;

/// Receives each group's records once the group's computation has completed.
#[async_trait::async_trait]
pub trait MetricSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn emit(&self, batch: &LagBatch) -> Result<()>;

    /// Called once after every group task of the cycle started at
    /// `started_at` has reached a terminal state.
    async fn finish_cycle(&self, _started_at: Instant) {}
}

/// Delivers to every inner sink. One sink failing does not keep the batch
/// from the others.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn MetricSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn MetricSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait::async_trait]
impl MetricSink for FanoutSink {
    fn name(&self) -> &'static str {
        "fanout"
    }

    async fn emit(&self, batch: &LagBatch) -> Result<()> {
        let results =
            futures::future::join_all(self.sinks.iter().map(|sink| sink.emit(batch))).await;

        let failed: Vec<String> = self
            .sinks
            .iter()
            .zip(results)
            .filter_map(|(sink, result)| result.err().map(|e| format!("{}: {e}", sink.name())))
            .collect();

        if failed.is_empty() {
            Ok(())
        } else {
            Err(LagError::Delivery(failed.join("; ")))
        }
    }

    async fn finish_cycle(&self, started_at: Instant) {
        futures::future::join_all(self.sinks.iter().map(|sink| sink.finish_cycle(started_at)))
            .await;
    }
}

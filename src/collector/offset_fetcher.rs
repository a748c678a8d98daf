use crate::cluster::CallBudget;
use crate::collector::lag_calculator::partition_lag;
use crate::error::{LagError, Result};
use crate::kafka::{ClusterClient, OffsetTracker, TopicPartition};
use tracing::trace;

/// Newest offset of a partition and the group's committed offset on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetPair {
    pub newest: i64,
    /// `None` when the group has never committed this partition.
    pub committed: Option<i64>,
}

impl OffsetPair {
    pub fn lag(&self) -> i64 {
        partition_lag(self.newest, self.committed)
    }
}

/// Fetch both offsets of `tp` concurrently, each as its own budgeted call.
///
/// Any failure is reported with the group and partition it belongs to.
pub async fn fetch_offset_pair(
    client: &dyn ClusterClient,
    tracker: &dyn OffsetTracker,
    group_id: &str,
    tp: &TopicPartition,
    budget: &CallBudget,
) -> Result<OffsetPair> {
    let newest = budget.call("newest offset", client.fetch_newest_offset(tp));
    let committed = budget.call("committed offset", tracker.committed_offset(tp));

    let (newest, committed) =
        tokio::try_join!(newest, committed).map_err(|source| LagError::PartitionOffsets {
            group: group_id.to_string(),
            topic: tp.topic.clone(),
            partition: tp.partition,
            source: Box::new(source),
        })?;

    trace!(
        group = group_id,
        topic = %tp.topic,
        partition = tp.partition,
        newest = newest,
        committed = ?committed,
        "Fetched offset pair"
    );

    Ok(OffsetPair { newest, committed })
}

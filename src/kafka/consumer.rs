use crate::error::{LagError, Result};
use crate::kafka::{OffsetTracker, TopicPartition};
use rdkafka::Offset;
use rdkafka::TopicPartitionList;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, trace};

/// Committed-offset reader bound to one consumer group.
///
/// Backed by a consumer configured with the group's `group.id` that never
/// subscribes, so it reads the group's commits without joining the group.
/// Every partition read uses its own one-entry partition list, freed as soon
/// as the read returns. The group consumer itself is destroyed on a blocking
/// thread when the tracker is dropped, so closing many trackers does not stall
/// the runtime.
pub struct GroupOffsetTracker {
    group_id: String,
    consumer: Option<Arc<BaseConsumer>>,
    timeout: Duration,
}

impl GroupOffsetTracker {
    pub fn new(base: &ClientConfig, group_id: &str, timeout: Duration) -> Result<Self> {
        let consumer: BaseConsumer = base
            .clone()
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .create()
            .map_err(LagError::Kafka)?;

        debug!(group = group_id, "Opened offset tracker");

        Ok(Self {
            group_id: group_id.to_string(),
            consumer: Some(Arc::new(consumer)),
            timeout,
        })
    }
}

#[async_trait::async_trait]
impl OffsetTracker for GroupOffsetTracker {
    #[instrument(
        skip(self),
        fields(group = %self.group_id, topic = %tp.topic, partition = tp.partition)
    )]
    async fn committed_offset(&self, tp: &TopicPartition) -> Result<Option<i64>> {
        let Some(consumer) = self.consumer.as_ref().map(Arc::clone) else {
            // Only reachable after drop has started.
            return Err(LagError::Task("offset tracker already released".to_string()));
        };
        let timeout = self.timeout;
        let tp = tp.clone();

        let offset = tokio::task::spawn_blocking(move || {
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition(&tp.topic, tp.partition);

            let committed = consumer.committed_offsets(tpl, timeout)?;
            let Some(elem) = committed.find_partition(&tp.topic, tp.partition) else {
                return Ok(None);
            };
            elem.error()?;
            Ok::<_, rdkafka::error::KafkaError>(committed_value(elem.offset()))
        })
        .await?
        .map_err(LagError::Kafka)?;

        trace!(committed = ?offset, "Read committed offset");
        Ok(offset)
    }
}

/// A concrete non-negative offset is a commit; `Invalid` and the logical
/// offsets mean the group has not committed this partition.
fn committed_value(offset: Offset) -> Option<i64> {
    match offset {
        Offset::Offset(n) if n >= 0 => Some(n),
        _ => None,
    }
}

impl Drop for GroupOffsetTracker {
    fn drop(&mut self) {
        let Some(consumer) = self.consumer.take() else {
            return;
        };
        // rd_kafka_destroy blocks until the client has shut down.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || drop(consumer));
            }
            Err(_) => drop(consumer),
        }
        debug!(group = %self.group_id, "Released offset tracker");
    }
}

impl std::fmt::Debug for GroupOffsetTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupOffsetTracker")
            .field("group", &self.group_id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

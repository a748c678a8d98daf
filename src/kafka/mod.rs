//! Broker access for the lag engine.
//!
//! The engine only talks to a cluster through [`ClusterClient`], which keeps
//! the group and offset logic independent of librdkafka and lets tests script
//! broker behaviour.

pub mod assignment;
pub mod client;
pub mod consumer;
#[cfg(test)]
pub mod mock;

pub use client::RdKafkaConnector;

use crate::config::ClusterConfig;
use crate::error::Result;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

/// A consumer group member as reported by the group coordinator.
/// `assignment` holds the raw consumer-protocol payload; `None` while the
/// member is still rebalancing.
#[derive(Debug, Clone)]
pub struct GroupMember {
    pub member_id: String,
    pub assignment: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct GroupDescription {
    pub group_id: String,
    pub state: String,
    pub members: Vec<GroupMember>,
}

/// A live connection to one cluster. Shared read-only by every group task of a
/// cycle; dropping the last handle closes the connection.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    fn cluster_name(&self) -> &str;

    async fn list_consumer_groups(&self) -> Result<Vec<String>>;

    async fn describe_consumer_group(&self, group_id: &str) -> Result<GroupDescription>;

    /// Log end offset ("newest") of a partition.
    async fn fetch_newest_offset(&self, tp: &TopicPartition) -> Result<i64>;

    /// Open an offset tracker scoped to `group_id`. The tracker is released when dropped.
    async fn open_offset_tracker(&self, group_id: &str) -> Result<Box<dyn OffsetTracker>>;
}

/// Reads a single group's committed offsets.
#[async_trait::async_trait]
pub trait OffsetTracker: Send + Sync {
    /// Committed offset for `tp`, or `None` if the group never committed one.
    async fn committed_offset(&self, tp: &TopicPartition) -> Result<Option<i64>>;
}

/// Opens cluster connections at the start of a cycle.
#[async_trait::async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, config: &ClusterConfig) -> Result<Arc<dyn ClusterClient>>;
}

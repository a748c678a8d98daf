use crate::config::ClusterConfig;
use crate::error::{LagError, Result};
use crate::kafka::consumer::GroupOffsetTracker;
use crate::kafka::{
    ClusterClient, ClusterConnector, GroupDescription, GroupMember, OffsetTracker, TopicPartition,
};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// librdkafka-backed connection to one cluster.
pub struct KafkaClient {
    cluster_name: String,
    client_config: ClientConfig,
    consumer: Arc<BaseConsumer>,
    timeout: Duration,
}

impl KafkaClient {
    pub fn new(config: &ClusterConfig, timeout: Duration) -> Result<Self> {
        let mut client_config = ClientConfig::new();
        for (key, value) in config.client_properties() {
            client_config.set(key, value);
        }

        let consumer: BaseConsumer = client_config
            .clone()
            .set(
                "group.id",
                format!("kafka-lag-monitor-internal-{}", config.name),
            )
            .set("enable.auto.commit", "false")
            .create()
            .map_err(LagError::Kafka)?;

        Ok(Self {
            cluster_name: config.name.clone(),
            client_config,
            consumer: Arc::new(consumer),
            timeout,
        })
    }

    /// Fetch cluster metadata to prove the brokers are reachable and the
    /// credentials are accepted.
    #[instrument(skip(self), fields(cluster = %self.cluster_name))]
    pub async fn probe(&self) -> Result<()> {
        let consumer = Arc::clone(&self.consumer);
        let timeout = self.timeout;
        let brokers = tokio::task::spawn_blocking(move || {
            consumer
                .fetch_metadata(None, timeout)
                .map(|m| m.brokers().len())
        })
        .await?
        .map_err(LagError::Kafka)?;

        debug!(brokers = brokers, "Connected to cluster");
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClusterClient for KafkaClient {
    fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    #[instrument(skip(self), fields(cluster = %self.cluster_name))]
    async fn list_consumer_groups(&self) -> Result<Vec<String>> {
        let consumer = Arc::clone(&self.consumer);
        let timeout = self.timeout;
        let groups = tokio::task::spawn_blocking(move || {
            consumer.fetch_group_list(None, timeout).map(|list| {
                list.groups()
                    .iter()
                    .map(|g| g.name().to_string())
                    .collect::<Vec<_>>()
            })
        })
        .await?
        .map_err(LagError::Kafka)?;

        debug!(count = groups.len(), "Listed consumer groups");
        Ok(groups)
    }

    #[instrument(skip(self), fields(cluster = %self.cluster_name))]
    async fn describe_consumer_group(&self, group_id: &str) -> Result<GroupDescription> {
        let consumer = Arc::clone(&self.consumer);
        let timeout = self.timeout;
        let group = group_id.to_string();

        let description = tokio::task::spawn_blocking(move || {
            let group_list = consumer.fetch_group_list(Some(group.as_str()), timeout)?;

            let description = group_list
                .groups()
                .iter()
                .find(|g| g.name() == group)
                .map_or_else(
                    || GroupDescription {
                        group_id: group.clone(),
                        state: "Dead".to_string(),
                        members: Vec::new(),
                    },
                    |g| GroupDescription {
                        group_id: g.name().to_string(),
                        state: g.state().to_string(),
                        members: g
                            .members()
                            .iter()
                            .map(|m| GroupMember {
                                member_id: m.id().to_string(),
                                assignment: m.assignment().map(<[u8]>::to_vec),
                            })
                            .collect(),
                    },
                );

            Ok::<_, rdkafka::error::KafkaError>(description)
        })
        .await?
        .map_err(LagError::Kafka)?;

        debug!(
            state = %description.state,
            members = description.members.len(),
            "Described consumer group"
        );
        Ok(description)
    }

    #[instrument(
        skip(self),
        fields(cluster = %self.cluster_name, topic = %tp.topic, partition = tp.partition)
    )]
    async fn fetch_newest_offset(&self, tp: &TopicPartition) -> Result<i64> {
        let consumer = Arc::clone(&self.consumer);
        let timeout = self.timeout;
        let tp = tp.clone();

        let (_low, high) = tokio::task::spawn_blocking(move || {
            consumer.fetch_watermarks(&tp.topic, tp.partition, timeout)
        })
        .await?
        .map_err(LagError::Kafka)?;

        Ok(high)
    }

    async fn open_offset_tracker(&self, group_id: &str) -> Result<Box<dyn OffsetTracker>> {
        let tracker = GroupOffsetTracker::new(&self.client_config, group_id, self.timeout)?;
        Ok(Box::new(tracker))
    }
}

impl std::fmt::Debug for KafkaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaClient")
            .field("cluster", &self.cluster_name)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Builds a [`KafkaClient`] per cluster and probes it before handing it out.
#[derive(Debug, Clone)]
pub struct RdKafkaConnector {
    timeout: Duration,
}

impl RdKafkaConnector {
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait::async_trait]
impl ClusterConnector for RdKafkaConnector {
    async fn connect(&self, config: &ClusterConfig) -> Result<Arc<dyn ClusterClient>> {
        let client = KafkaClient::new(config, self.timeout)?;
        client.probe().await?;
        Ok(Arc::new(client))
    }
}

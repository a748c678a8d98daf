//! Scripted in-memory cluster used by engine tests.

use crate::config::ClusterConfig;
use crate::error::{LagError, Result};
use crate::kafka::assignment::tests::encode_assignment;
use crate::kafka::{
    ClusterClient, ClusterConnector, GroupDescription, GroupMember, OffsetTracker, TopicPartition,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Hooks named `hang_*` make the call never return; `fail_*` make it error.
#[derive(Debug, Default)]
pub struct MockCluster {
    pub name: String,
    pub groups: Vec<GroupDescription>,
    pub newest: HashMap<TopicPartition, i64>,
    /// (group, partition) -> committed offset; missing means never committed.
    pub committed: HashMap<(String, TopicPartition), i64>,
    pub fail_list_groups: bool,
    pub hang_list_groups: bool,
    pub fail_describe: HashSet<String>,
    pub hang_describe: HashSet<String>,
    pub panic_describe: HashSet<String>,
    pub fail_newest: HashSet<TopicPartition>,
    pub hang_newest: HashSet<TopicPartition>,
    pub hang_committed: HashSet<TopicPartition>,
    pub hang_open_tracker: HashSet<String>,
    pub open_trackers: Arc<AtomicUsize>,
    pub opened_trackers: Arc<AtomicUsize>,
}

impl MockCluster {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Add a group whose members own the given assignments. `None` models a
    /// member that has not finished rebalancing.
    pub fn with_group(
        mut self,
        group_id: &str,
        members: Vec<Option<Vec<(&str, Vec<i32>)>>>,
    ) -> Self {
        let members = members
            .into_iter()
            .enumerate()
            .map(|(i, topics)| GroupMember {
                member_id: format!("{group_id}-member-{i}"),
                assignment: topics.map(|topics| {
                    let topics: Vec<(&str, &[i32])> =
                        topics.iter().map(|(t, p)| (*t, p.as_slice())).collect();
                    encode_assignment(&topics, None)
                }),
            })
            .collect();

        self.groups.push(GroupDescription {
            group_id: group_id.to_string(),
            state: "Stable".to_string(),
            members,
        });
        self
    }

    /// Add a group with one member carrying a raw (possibly corrupt) payload.
    pub fn with_raw_group(mut self, group_id: &str, payload: Vec<u8>) -> Self {
        self.groups.push(GroupDescription {
            group_id: group_id.to_string(),
            state: "Stable".to_string(),
            members: vec![GroupMember {
                member_id: format!("{group_id}-member-0"),
                assignment: Some(payload),
            }],
        });
        self
    }

    pub fn with_newest(mut self, topic: &str, partition: i32, offset: i64) -> Self {
        self.newest
            .insert(TopicPartition::new(topic, partition), offset);
        self
    }

    pub fn with_committed(mut self, group: &str, topic: &str, partition: i32, offset: i64) -> Self {
        self.committed.insert(
            (group.to_string(), TopicPartition::new(topic, partition)),
            offset,
        );
        self
    }
}

async fn hang() {
    std::future::pending::<()>().await;
}

#[async_trait::async_trait]
impl ClusterClient for MockCluster {
    fn cluster_name(&self) -> &str {
        &self.name
    }

    async fn list_consumer_groups(&self) -> Result<Vec<String>> {
        if self.hang_list_groups {
            hang().await;
        }
        if self.fail_list_groups {
            return Err(LagError::Task("ListGroups: broker transport failure".to_string()));
        }
        Ok(self.groups.iter().map(|g| g.group_id.clone()).collect())
    }

    async fn describe_consumer_group(&self, group_id: &str) -> Result<GroupDescription> {
        if self.hang_describe.contains(group_id) {
            hang().await;
        }
        assert!(
            !self.panic_describe.contains(group_id),
            "scripted panic describing {group_id}"
        );
        if self.fail_describe.contains(group_id) {
            return Err(LagError::Task(format!("describe {group_id} failed")));
        }
        self.groups
            .iter()
            .find(|g| g.group_id == group_id)
            .cloned()
            .ok_or_else(|| LagError::Task(format!("unknown group {group_id}")))
    }

    async fn fetch_newest_offset(&self, tp: &TopicPartition) -> Result<i64> {
        if self.hang_newest.contains(tp) {
            hang().await;
        }
        if self.fail_newest.contains(tp) {
            return Err(LagError::Task(format!(
                "leader unavailable for {}/{}",
                tp.topic, tp.partition
            )));
        }
        self.newest.get(tp).copied().ok_or_else(|| {
            LagError::Task(format!("unknown partition {}/{}", tp.topic, tp.partition))
        })
    }

    async fn open_offset_tracker(&self, group_id: &str) -> Result<Box<dyn OffsetTracker>> {
        if self.hang_open_tracker.contains(group_id) {
            hang().await;
        }
        self.open_trackers.fetch_add(1, Ordering::SeqCst);
        self.opened_trackers.fetch_add(1, Ordering::SeqCst);
        let committed = self
            .committed
            .iter()
            .filter(|((g, _), _)| g == group_id)
            .map(|((_, tp), offset)| (tp.clone(), *offset))
            .collect();
        Ok(Box::new(MockTracker {
            committed,
            hang: self.hang_committed.clone(),
            open: Arc::clone(&self.open_trackers),
        }))
    }
}

struct MockTracker {
    committed: HashMap<TopicPartition, i64>,
    hang: HashSet<TopicPartition>,
    open: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl OffsetTracker for MockTracker {
    async fn committed_offset(&self, tp: &TopicPartition) -> Result<Option<i64>> {
        if self.hang.contains(tp) {
            hang().await;
        }
        Ok(self.committed.get(tp).copied())
    }
}

impl Drop for MockTracker {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Hands out pre-built clusters by name; unknown names fail to connect.
#[derive(Default)]
pub struct MockConnector {
    clusters: HashMap<String, Arc<MockCluster>>,
    hang: HashSet<String>,
}

impl MockConnector {
    pub fn new(clusters: Vec<MockCluster>) -> Self {
        Self {
            clusters: clusters
                .into_iter()
                .map(|c| (c.name.clone(), Arc::new(c)))
                .collect(),
            hang: HashSet::new(),
        }
    }

    /// Connecting to `name` never completes.
    pub fn hang_connect(mut self, name: &str) -> Self {
        self.hang.insert(name.to_string());
        self
    }

    pub fn cluster(&self, name: &str) -> Arc<MockCluster> {
        Arc::clone(&self.clusters[name])
    }
}

#[async_trait::async_trait]
impl ClusterConnector for MockConnector {
    async fn connect(&self, config: &ClusterConfig) -> Result<Arc<dyn ClusterClient>> {
        if self.hang.contains(&config.name) {
            hang().await;
        }
        self.clusters
            .get(&config.name)
            .map(|c| Arc::clone(c) as Arc<dyn ClusterClient>)
            .ok_or_else(|| {
                LagError::Task(format!(
                    "connection refused by {}",
                    config.brokers.join(",")
                ))
            })
    }
}

/// A resolved cluster config pointing at a mock cluster.
pub fn cluster_config(name: &str) -> ClusterConfig {
    ClusterConfig {
        name: name.to_string(),
        brokers: vec![format!("{name}:9092")],
        version: "2.8.0".parse().unwrap(),
        auth: None,
        tls: false,
        consumer_properties: HashMap::new(),
        filters: crate::config::CompiledFilters::default(),
    }
}

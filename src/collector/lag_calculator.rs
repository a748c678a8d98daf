use crate::cluster::CallBudget;
use crate::collector::offset_fetcher::fetch_offset_pair;
use crate::error::{LagError, Result};
use crate::kafka::{ClusterClient, TopicPartition};
use crate::metrics::types::MetricRecord;
use futures::{FutureExt, StreamExt, TryStreamExt};
use std::collections::HashMap;
use tracing::debug;

/// Partition reads in flight per group.
const MAX_CONCURRENT_PARTITION_FETCHES: usize = 16;

/// Committed offset used for lag: an unset commit counts as fully caught up.
pub fn effective_committed(newest: i64, committed: Option<i64>) -> i64 {
    committed.unwrap_or(newest)
}

/// `newest - effective_committed`. Not clamped: a commit that raced past an
/// earlier newest-offset read shows up as a small negative value.
pub fn partition_lag(newest: i64, committed: Option<i64>) -> i64 {
    newest.saturating_sub(effective_committed(newest, committed))
}

/// Per-topic lag of one group on one cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicLag {
    by_topic: HashMap<String, i64>,
}

impl TopicLag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accumulate(&mut self, topic: &str, lag: i64) {
        match self.by_topic.get_mut(topic) {
            Some(total) => *total = total.saturating_add(lag),
            None => {
                self.by_topic.insert(topic.to_string(), lag);
            }
        }
    }

    #[cfg(test)]
    pub fn get(&self, topic: &str) -> Option<i64> {
        self.by_topic.get(topic).copied()
    }

    pub fn len(&self) -> usize {
        self.by_topic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_topic.is_empty()
    }

    /// One record per topic the group touched, ordered by topic.
    pub fn into_records(self, cluster: &str, group: &str) -> Vec<MetricRecord> {
        let mut records: Vec<MetricRecord> = self
            .by_topic
            .into_iter()
            .map(|(topic, lag)| MetricRecord::new(cluster, group, topic, lag))
            .collect();
        records.sort();
        records
    }
}

/// Fold the lag of every entry in `partitions` into per-topic sums. An
/// entry listed twice is counted twice.
///
/// The group's offset tracker lives exactly as long as this call; it is
/// released on every return path. The first partition that fails aborts the
/// group, since a partial sum would under-report its lag.
pub async fn compute_group_lag(
    client: &dyn ClusterClient,
    group_id: &str,
    partitions: &[TopicPartition],
    budget: &CallBudget,
) -> Result<TopicLag> {
    if partitions.is_empty() {
        return Ok(TopicLag::new());
    }

    let lease = budget.open_tracker(client, group_id).await?;
    let tracker = lease.tracker();

    let fetches = partitions.iter().cloned().map(move |tp| {
        async move {
            let pair = fetch_offset_pair(client, tracker, group_id, &tp, budget).await?;
            Ok::<_, LagError>((tp.topic, pair.lag()))
        }
        .boxed()
    });

    let topic_lag = futures::stream::iter(fetches)
        .buffer_unordered(MAX_CONCURRENT_PARTITION_FETCHES)
        .try_fold(TopicLag::new(), |mut acc, (topic, lag)| async move {
            acc.accumulate(&topic, lag);
            Ok(acc)
        })
        .await?;

    debug!(
        group = group_id,
        partitions = partitions.len(),
        topics = topic_lag.len(),
        "Computed group lag"
    );
    Ok(topic_lag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::CallLimits;
    use crate::kafka::mock::MockCluster;
    use crate::test_strategies::strategies::{arb_newest_and_committed, arb_partition_lags};
    use proptest::prelude::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn budget() -> CallBudget {
        CallBudget::new(CallLimits::new(Duration::from_secs(5), 8, 4))
    }

    #[test]
    fn test_partition_lag_rules() {
        assert_eq!(partition_lag(100, Some(90)), 10);
        assert_eq!(partition_lag(100, Some(100)), 0);
        assert_eq!(partition_lag(100, None), 0);
        assert_eq!(partition_lag(0, None), 0);
    }

    #[test]
    fn test_commit_ahead_of_newest_is_not_clamped() {
        assert_eq!(partition_lag(95, Some(100)), -5);

        let mut lag = TopicLag::new();
        lag.accumulate("orders", 10);
        lag.accumulate("orders", -5);
        assert_eq!(lag.get("orders"), Some(5));

        let mut lag = TopicLag::new();
        lag.accumulate("orders", -3);
        assert_eq!(lag.get("orders"), Some(-3));
    }

    #[test]
    fn test_topics_with_zero_lag_still_produce_records() {
        let mut lag = TopicLag::new();
        lag.accumulate("orders", 0);
        lag.accumulate("audit", 4);

        let records = lag.into_records("prod", "g1");
        assert_eq!(
            records,
            vec![
                MetricRecord::new("prod", "g1", "audit", 4),
                MetricRecord::new("prod", "g1", "orders", 0),
            ]
        );
    }

    #[test]
    fn test_empty_topic_lag_produces_no_records() {
        assert!(TopicLag::new().into_records("prod", "g1").is_empty());
    }

    #[tokio::test]
    async fn test_group_lag_with_unset_commit() {
        let cluster = MockCluster::new("prod")
            .with_newest("topic-a", 0, 100)
            .with_newest("topic-a", 1, 50)
            .with_committed("g1", "topic-a", 0, 90);
        let partitions = vec![
            TopicPartition::new("topic-a", 0),
            TopicPartition::new("topic-a", 1),
        ];

        let lag = compute_group_lag(&cluster, "g1", &partitions, &budget())
            .await
            .unwrap();

        assert_eq!(lag.get("topic-a"), Some(10));
        assert_eq!(lag.len(), 1);
    }

    #[tokio::test]
    async fn test_tracker_is_released_after_failure() {
        let mut cluster = MockCluster::new("prod")
            .with_newest("orders", 0, 10)
            .with_committed("g1", "orders", 0, 5);
        cluster.fail_newest.insert(TopicPartition::new("orders", 1));
        let partitions = vec![
            TopicPartition::new("orders", 0),
            TopicPartition::new("orders", 1),
        ];

        let err = compute_group_lag(&cluster, "g1", &partitions, &budget())
            .await
            .unwrap_err();

        assert!(matches!(err, LagError::PartitionOffsets { partition: 1, .. }));
        assert_eq!(cluster.opened_trackers.load(Ordering::SeqCst), 1);
        assert_eq!(cluster.open_trackers.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_partition_owned_twice_is_summed_twice() {
        let cluster = MockCluster::new("prod")
            .with_newest("orders", 0, 100)
            .with_committed("g1", "orders", 0, 90);
        let partitions = vec![TopicPartition::new("orders", 0), TopicPartition::new("orders", 0)];

        let lag = compute_group_lag(&cluster, "g1", &partitions, &budget())
            .await
            .unwrap();

        assert_eq!(lag.get("orders"), Some(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_tracker_open_times_out() {
        let mut cluster = MockCluster::new("prod").with_newest("orders", 0, 10);
        cluster.hang_open_tracker.insert("g1".to_string());

        let err = compute_group_lag(&cluster, "g1", &[TopicPartition::new("orders", 0)], &budget())
            .await
            .unwrap_err();

        assert!(matches!(err, LagError::Timeout(_)));
        assert!(err.to_string().contains("open offset tracker"));
        assert_eq!(cluster.open_trackers.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_partitions_opens_no_tracker() {
        let cluster = MockCluster::new("prod");
        let lag = compute_group_lag(&cluster, "g1", &[], &budget())
            .await
            .unwrap();

        assert!(lag.is_empty());
        assert_eq!(cluster.opened_trackers.load(Ordering::SeqCst), 0);
    }

    proptest! {
        #[test]
        fn prop_lag_is_newest_minus_committed((newest, committed) in arb_newest_and_committed()) {
            prop_assert_eq!(partition_lag(newest, Some(committed)), newest - committed);
            prop_assert!(partition_lag(newest, Some(committed)) >= 0);
        }

        #[test]
        fn prop_unset_commit_is_zero_lag(newest in 0i64..i64::MAX) {
            prop_assert_eq!(partition_lag(newest, None), 0);
        }

        /// Summation order does not change the topic totals.
        #[test]
        fn prop_accumulate_is_order_independent(
            (entries, shuffled) in arb_partition_lags().prop_flat_map(|entries| {
                let shuffled = Just(entries.clone()).prop_shuffle();
                (Just(entries), shuffled)
            })
        ) {
            let mut forward = TopicLag::new();
            for (topic, lag) in &entries {
                forward.accumulate(topic, *lag);
            }
            let mut permuted = TopicLag::new();
            for (topic, lag) in &shuffled {
                permuted.accumulate(topic, *lag);
            }
            prop_assert_eq!(forward, permuted);
        }
    }
}

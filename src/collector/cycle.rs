use crate::cluster::{CallBudget, CallLimits, ClusterConnections, ConnectedCluster};
use crate::collector::assignment_resolver::resolve_partitions;
use crate::collector::group_enumerator::list_groups;
use crate::collector::lag_calculator::compute_group_lag;
use crate::config::ClusterConfig;
use crate::error::Result;
use crate::export::MetricSink;
use crate::kafka::{ClusterClient, ClusterConnector};
use crate::metrics::types::{LagBatch, MetricRecord};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

/// Lifecycle of one (cluster, group) unit of work within a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupTaskState {
    Pending,
    Running,
    Completed { records: usize },
    Failed(String),
}

impl GroupTaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupOutcome {
    pub cluster: String,
    pub group: String,
    pub state: GroupTaskState,
}

/// What a cycle did. Records are ordered by cluster, group and topic.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub clusters_connected: usize,
    /// Connected and enumerated, so its groups were attempted.
    pub clusters_measured: usize,
    pub clusters_skipped: Vec<String>,
    pub groups: Vec<GroupOutcome>,
    pub records: Vec<MetricRecord>,
    pub elapsed: Duration,
}

impl CycleReport {
    pub fn groups_completed(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| matches!(g.state, GroupTaskState::Completed { .. }))
            .count()
    }

    pub fn groups_failed(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| matches!(g.state, GroupTaskState::Failed(_)))
            .count()
    }

    pub fn measured_any_cluster(&self) -> bool {
        self.clusters_measured > 0
    }
}

/// Runs measurement cycles against whatever clusters it is handed.
pub struct CycleRunner {
    connector: Arc<dyn ClusterConnector>,
    sink: Arc<dyn MetricSink>,
    limits: CallLimits,
}

impl CycleRunner {
    pub fn new(
        connector: Arc<dyn ClusterConnector>,
        sink: Arc<dyn MetricSink>,
        limits: CallLimits,
    ) -> Self {
        Self {
            connector,
            sink,
            limits,
        }
    }

    /// Measure every group of every cluster once.
    ///
    /// Connections are opened at the start and released before this returns.
    /// Every group runs as its own task; a group that fails contributes no
    /// records and does not affect any other group. Broker calls of one
    /// cluster share that cluster's call budget.
    #[instrument(skip_all, fields(clusters = clusters.len()))]
    pub async fn run_cycle(&self, clusters: Vec<ClusterConfig>) -> CycleReport {
        let started_at = Instant::now();

        let connections =
            ClusterConnections::open(self.connector.as_ref(), clusters, self.limits).await;
        let mut report = CycleReport {
            clusters_connected: connections.connected().len(),
            clusters_skipped: connections.skipped().to_vec(),
            ..CycleReport::default()
        };

        let enumerated = futures::future::join_all(
            connections
                .connected()
                .iter()
                .map(|cluster| self.enumerate(cluster)),
        )
        .await;

        let mut tasks: JoinSet<GroupTaskResult> = JoinSet::new();
        let mut states: HashMap<tokio::task::Id, GroupOutcome> = HashMap::new();

        for (cluster, groups) in connections.connected().iter().zip(enumerated) {
            let Some(groups) = groups else {
                report.clusters_skipped.push(cluster.config.name.clone());
                continue;
            };
            report.clusters_measured += 1;

            for group in groups {
                let mut outcome = GroupOutcome {
                    cluster: cluster.config.name.clone(),
                    group: group.clone(),
                    state: GroupTaskState::Pending,
                };

                let handle = tasks.spawn(run_group(
                    Arc::clone(&cluster.client),
                    Arc::clone(&cluster.config),
                    cluster.budget.clone(),
                    group,
                    Arc::clone(&self.sink),
                    started_at,
                ));
                outcome.state = GroupTaskState::Running;
                states.insert(handle.id(), outcome);
            }
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, state) = match joined {
                Ok((id, Ok(records))) => {
                    let state = GroupTaskState::Completed {
                        records: records.len(),
                    };
                    report.records.extend(records);
                    (id, state)
                }
                Ok((id, Err(e))) => (id, GroupTaskState::Failed(e.to_string())),
                Err(e) => (
                    e.id(),
                    GroupTaskState::Failed(format!("group task aborted: {e}")),
                ),
            };

            if let Some(mut outcome) = states.remove(&id) {
                if let GroupTaskState::Failed(reason) = &state {
                    warn!(
                        cluster = %outcome.cluster,
                        group = %outcome.group,
                        error = %reason,
                        "Group lag computation failed"
                    );
                }
                outcome.state = state;
                report.groups.push(outcome);
            }
        }

        drop(connections);

        self.sink.finish_cycle(started_at).await;

        report.records.sort();
        report
            .groups
            .sort_by(|a, b| (&a.cluster, &a.group).cmp(&(&b.cluster, &b.group)));
        report.elapsed = started_at.elapsed();

        info!(
            clusters_connected = report.clusters_connected,
            clusters_skipped = report.clusters_skipped.len(),
            groups_completed = report.groups_completed(),
            groups_failed = report.groups_failed(),
            records = report.records.len(),
            elapsed_ms = report.elapsed.as_millis(),
            "Cycle finished"
        );
        report
    }

    async fn enumerate(&self, cluster: &ConnectedCluster) -> Option<Vec<String>> {
        match list_groups(
            cluster.client.as_ref(),
            &cluster.config.filters,
            &cluster.budget,
        )
        .await
        {
            Ok(groups) => Some(groups),
            Err(e) => {
                warn!(
                    cluster = %cluster.config.name,
                    error = %e,
                    "Failed to list consumer groups, skipping cluster this cycle"
                );
                None
            }
        }
    }
}

type GroupTaskResult = Result<Vec<MetricRecord>>;

/// Resolve, measure and emit one group. A delivery failure is logged and
/// does not fail the group.
#[instrument(
    skip(client, config, budget, sink, cycle_started),
    fields(cluster = %config.name)
)]
async fn run_group(
    client: Arc<dyn ClusterClient>,
    config: Arc<ClusterConfig>,
    budget: CallBudget,
    group: String,
    sink: Arc<dyn MetricSink>,
    cycle_started: Instant,
) -> GroupTaskResult {
    let partitions =
        resolve_partitions(client.as_ref(), &group, &config.filters, &budget).await?;
    let topic_lag = compute_group_lag(client.as_ref(), &group, &partitions, &budget).await?;

    let records = topic_lag.into_records(&config.name, &group);
    let batch = LagBatch::new(config.name.as_str(), group.as_str(), records, cycle_started);

    if let Err(e) = sink.emit(&batch).await {
        warn!(group = %group, error = %e, "Failed to deliver lag records");
    }

    Ok(batch.records)
}

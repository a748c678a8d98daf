use crate::cluster::budget::{CallBudget, CallLimits};
use crate::config::ClusterConfig;
use crate::error::{Result, with_timeout};
use crate::kafka::{ClusterClient, ClusterConnector};
use std::sync::Arc;
use tracing::{info, warn};

/// A cluster that connected for the current cycle.
pub struct ConnectedCluster {
    pub config: Arc<ClusterConfig>,
    pub client: Arc<dyn ClusterClient>,
    pub budget: CallBudget,
}

/// Connections opened for one cycle, keyed by cluster name. Dropping the set
/// releases every connection whose group tasks have finished.
pub struct ClusterConnections {
    connected: Vec<ConnectedCluster>,
    skipped: Vec<String>,
}

impl ClusterConnections {
    /// Connect to every cluster concurrently. A cluster that fails to connect
    /// is logged and left out; the others are unaffected.
    pub async fn open(
        connector: &dyn ClusterConnector,
        configs: Vec<ClusterConfig>,
        limits: CallLimits,
    ) -> Self {
        let attempts = configs.into_iter().map(|config| async move {
            let result: Result<Arc<dyn ClusterClient>> =
                with_timeout(limits.timeout, "connect", connector.connect(&config)).await;
            (config, result)
        });

        let mut connected = Vec::new();
        let mut skipped = Vec::new();
        for (config, result) in futures::future::join_all(attempts).await {
            match result {
                Ok(client) => {
                    info!(
                        cluster = %config.name,
                        brokers = ?config.brokers,
                        "Connected to cluster"
                    );
                    connected.push(ConnectedCluster {
                        config: Arc::new(config),
                        client,
                        budget: CallBudget::new(limits),
                    });
                }
                Err(e) => {
                    warn!(
                        cluster = %config.name,
                        error = %e,
                        "Failed to connect, skipping cluster this cycle"
                    );
                    skipped.push(config.name);
                }
            }
        }

        Self { connected, skipped }
    }

    pub fn connected(&self) -> &[ConnectedCluster] {
        &self.connected
    }

    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<&ConnectedCluster> {
        self.connected.iter().find(|c| c.config.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LagError;
    use crate::kafka::mock::{MockCluster, MockConnector, cluster_config};
    use std::time::Duration;

    fn limits() -> CallLimits {
        CallLimits::new(Duration::from_secs(1), 8, 4)
    }

    #[tokio::test]
    async fn test_failed_cluster_is_skipped_others_connect() {
        let connector = MockConnector::new(vec![MockCluster::new("cluster-x")]);

        let connections = ClusterConnections::open(
            &connector,
            vec![cluster_config("cluster-x"), cluster_config("cluster-y")],
            limits(),
        )
        .await;

        assert_eq!(connections.connected().len(), 1);
        assert!(connections.get("cluster-x").is_some());
        assert_eq!(connections.skipped(), ["cluster-y".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_connect_times_out_and_is_skipped() {
        let connector = MockConnector::new(vec![
            MockCluster::new("cluster-x"),
            MockCluster::new("cluster-y"),
        ])
        .hang_connect("cluster-y");

        let connections = ClusterConnections::open(
            &connector,
            vec![cluster_config("cluster-x"), cluster_config("cluster-y")],
            limits(),
        )
        .await;

        assert!(connections.get("cluster-x").is_some());
        assert_eq!(connections.skipped(), ["cluster-y".to_string()]);

        let err = with_timeout(
            Duration::from_secs(1),
            "connect",
            connector.connect(&cluster_config("cluster-y")),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, LagError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_dropping_connections_releases_clients() {
        let connector = MockConnector::new(vec![MockCluster::new("cluster-x")]);
        let handle = connector.cluster("cluster-x");
        assert_eq!(Arc::strong_count(&handle), 2);

        let connections =
            ClusterConnections::open(&connector, vec![cluster_config("cluster-x")], limits())
                .await;
        assert_eq!(Arc::strong_count(&handle), 3);

        drop(connections);
        assert_eq!(Arc::strong_count(&handle), 2);
    }
}

use crate::cluster::CallBudget;
use crate::config::CompiledFilters;
use crate::error::Result;
use crate::kafka::ClusterClient;
use tracing::debug;

/// Consumer groups registered on the cluster that pass `filters`, sorted and
/// without duplicates. A failed listing is an error for the whole cluster; a
/// partial list is never returned.
pub async fn list_groups(
    client: &dyn ClusterClient,
    filters: &CompiledFilters,
    budget: &CallBudget,
) -> Result<Vec<String>> {
    let mut all_groups = budget
        .call("ListGroups", client.list_consumer_groups())
        .await?;
    let total = all_groups.len();

    all_groups.retain(|g| filters.matches_group(g));
    all_groups.sort();
    all_groups.dedup();

    debug!(
        cluster = client.cluster_name(),
        total_groups = total,
        filtered_groups = all_groups.len(),
        "Enumerated consumer groups"
    );
    Ok(all_groups)
}

use crate::cluster::CallBudget;
use crate::config::CompiledFilters;
use crate::error::{LagError, Result};
use crate::kafka::assignment::decode_member_assignment;
use crate::kafka::{ClusterClient, GroupDescription, TopicPartition};
use tracing::debug;

/// Describe `group_id` and return the partitions its members own.
pub async fn resolve_partitions(
    client: &dyn ClusterClient,
    group_id: &str,
    filters: &CompiledFilters,
    budget: &CallBudget,
) -> Result<Vec<TopicPartition>> {
    let description = budget
        .call("DescribeGroup", client.describe_consumer_group(group_id))
        .await?;

    assigned_partitions(&description, filters)
}

/// One entry per (member, partition) ownership, restricted to topics that
/// pass `filters` and sorted. A partition reported by two members appears
/// twice and is summed twice.
///
/// Members without an assignment are mid-rebalance and contribute nothing.
/// A payload that fails to decode fails the whole group.
pub fn assigned_partitions(
    description: &GroupDescription,
    filters: &CompiledFilters,
) -> Result<Vec<TopicPartition>> {
    let mut partitions = Vec::new();

    for member in &description.members {
        let assignment =
            decode_member_assignment(member.assignment.as_deref()).map_err(|e| match e {
                LagError::Decode(detail) => LagError::Decode(format!(
                    "group '{}' member '{}': {detail}",
                    description.group_id, member.member_id
                )),
                other => other,
            })?;

        let Some(assignment) = assignment else {
            debug!(
                group = %description.group_id,
                member = %member.member_id,
                "Member has no assignment yet, skipping"
            );
            continue;
        };

        for (topic, assigned) in assignment {
            if !filters.matches_topic(&topic) {
                continue;
            }
            partitions.extend(
                assigned
                    .into_iter()
                    .map(|partition| TopicPartition::new(topic.clone(), partition)),
            );
        }
    }

    partitions.sort();
    Ok(partitions)
}

use crate::error::Result;
use crate::export::MetricSink;
use crate::metrics::types::{LagBatch, MetricRecord};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

struct GroupEntry {
    records: Vec<MetricRecord>,
    cycle_started: Instant,
}

/// Latest lag records per (cluster, group), served on `/metrics`.
///
/// Groups that a cycle did not refresh are evicted when that cycle finishes,
/// so a group whose measurement failed drops out of the exposition instead of
/// repeating its previous value. When cycles overlap, records from an older
/// cycle never replace those of a newer one.
pub struct MetricsRegistry {
    groups: DashMap<(String, String), GroupEntry>,
    healthy: AtomicBool,
    last_cycle_duration_ms: AtomicU64,
    cycles_finished: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            groups: DashMap::new(),
            healthy: AtomicBool::new(true),
            last_cycle_duration_ms: AtomicU64::new(0),
            cycles_finished: AtomicU64::new(0),
        }
    }

    /// Store the group's records unless a newer cycle already did. Returns
    /// whether the batch was applied.
    pub fn update_group(&self, batch: &LagBatch) -> bool {
        let entry = GroupEntry {
            records: batch.records.clone(),
            cycle_started: batch.cycle_started,
        };

        match self.groups.entry((batch.cluster.clone(), batch.group.clone())) {
            Entry::Occupied(mut existing) => {
                if existing.get().cycle_started > batch.cycle_started {
                    debug!(
                        cluster = %batch.cluster,
                        group = %batch.group,
                        "Ignoring records from an older cycle"
                    );
                    return false;
                }
                existing.insert(entry);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
        true
    }

    /// Drop every group last measured by a cycle that started before
    /// `started_at`. Returns how many were removed.
    pub fn evict_stale(&self, started_at: Instant) -> usize {
        let before = self.groups.len();
        self.groups.retain(|_, entry| entry.cycle_started >= started_at);
        before - self.groups.len()
    }

    /// All records, ordered by cluster, group and topic.
    pub fn records(&self) -> Vec<MetricRecord> {
        let mut records: Vec<MetricRecord> = self
            .groups
            .iter()
            .flat_map(|entry| entry.value().records.clone())
            .collect();
        records.sort();
        records
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// True once a cycle has run to completion.
    pub fn is_ready(&self) -> bool {
        self.cycles_finished.load(Ordering::SeqCst) > 0
    }

    pub fn record_cycle_duration(&self, duration: Duration) {
        #[allow(clippy::cast_possible_truncation)]
        self.last_cycle_duration_ms
            .store(duration.as_millis() as u64, Ordering::SeqCst);
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn cycle_duration_seconds(&self) -> f64 {
        self.last_cycle_duration_ms.load(Ordering::SeqCst) as f64 / 1000.0
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MetricSink for MetricsRegistry {
    fn name(&self) -> &'static str {
        "registry"
    }

    async fn emit(&self, batch: &LagBatch) -> Result<()> {
        self.update_group(batch);
        Ok(())
    }

    async fn finish_cycle(&self, started_at: Instant) {
        let evicted = self.evict_stale(started_at);
        self.cycles_finished.fetch_add(1, Ordering::SeqCst);
        if evicted > 0 {
            debug!(evicted = evicted, "Evicted groups not refreshed this cycle");
        }
    }
}

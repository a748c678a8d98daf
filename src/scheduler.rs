use crate::collector::{CycleReport, CycleRunner};
use crate::config::{ClusterConfig, OverlapPolicy};
use crate::metrics::registry::MetricsRegistry;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

/// Consecutive cycles without a measured cluster before `/health` fails.
const UNHEALTHY_AFTER_CYCLES: u32 = 3;

/// How long in-flight cycles get to finish after shutdown is requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Supplies the clusters for each cycle.
pub trait ClusterSource: Send + Sync {
    fn clusters(&self) -> Vec<ClusterConfig>;
}

impl ClusterSource for crate::config::ConfigSource {
    fn clusters(&self) -> Vec<ClusterConfig> {
        crate::config::ConfigSource::clusters(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started,
    /// Waiting for the running cycle to finish (`serialize`).
    Queued,
    /// Dropped because the cycle limit was reached, or under `serialize`
    /// because a cycle is already queued.
    Skipped,
}

struct CycleContext {
    runner: CycleRunner,
    source: Arc<dyn ClusterSource>,
    registry: Arc<MetricsRegistry>,
    consecutive_unmeasured: AtomicU32,
}

impl CycleContext {
    async fn run(&self, _permit: OwnedSemaphorePermit) -> CycleReport {
        let source = Arc::clone(&self.source);
        let clusters = match tokio::task::spawn_blocking(move || source.clusters()).await {
            Ok(clusters) => clusters,
            Err(e) => {
                error!(error = %e, "Failed to load cluster configuration");
                Vec::new()
            }
        };

        let report = self.runner.run_cycle(clusters).await;
        self.registry.record_cycle_duration(report.elapsed);
        self.record_health(&report);
        report
    }

    fn record_health(&self, report: &CycleReport) {
        if report.measured_any_cluster() {
            self.consecutive_unmeasured.store(0, Ordering::SeqCst);
            self.registry.set_healthy(true);
            return;
        }

        let misses = self.consecutive_unmeasured.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(consecutive = misses, "No cluster could be measured this cycle");
        if misses >= UNHEALTHY_AFTER_CYCLES {
            self.registry.set_healthy(false);
        }
    }
}

/// Fires a cycle every `poll_interval` and applies the overlap policy when a
/// tick arrives while earlier cycles are still running. At most one cycle
/// waits behind the running one.
pub struct Scheduler {
    ctx: Arc<CycleContext>,
    policy: OverlapPolicy,
    permits: Arc<Semaphore>,
    queued: Arc<AtomicBool>,
    poll_interval: Duration,
    in_flight: Mutex<JoinSet<()>>,
}

impl Scheduler {
    pub fn new(
        runner: CycleRunner,
        source: Arc<dyn ClusterSource>,
        registry: Arc<MetricsRegistry>,
        policy: OverlapPolicy,
        max_concurrent_cycles: usize,
        poll_interval: Duration,
    ) -> Self {
        let limit = match policy {
            OverlapPolicy::Skip | OverlapPolicy::Serialize => 1,
            OverlapPolicy::Concurrent => max_concurrent_cycles.max(1),
        };

        Self {
            ctx: Arc::new(CycleContext {
                runner,
                source,
                registry,
                consecutive_unmeasured: AtomicU32::new(0),
            }),
            policy,
            permits: Arc::new(Semaphore::new(limit)),
            queued: Arc::new(AtomicBool::new(false)),
            poll_interval,
            in_flight: Mutex::new(JoinSet::new()),
        }
    }

    /// Launch a cycle without waiting for it.
    pub fn trigger(&self) -> TriggerOutcome {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        while in_flight.try_join_next().is_some() {}

        let ctx = Arc::clone(&self.ctx);
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => {
                in_flight.spawn(async move {
                    ctx.run(permit).await;
                });
                TriggerOutcome::Started
            }
            Err(_)
                if self.policy == OverlapPolicy::Serialize
                    && !self.queued.swap(true, Ordering::SeqCst) =>
            {
                let permits = Arc::clone(&self.permits);
                let queued = Arc::clone(&self.queued);
                in_flight.spawn(async move {
                    let permit = permits.acquire_owned().await;
                    queued.store(false, Ordering::SeqCst);
                    if let Ok(permit) = permit {
                        ctx.run(permit).await;
                    }
                });
                debug!("Previous cycle still running, queued this one behind it");
                TriggerOutcome::Queued
            }
            Err(_) => {
                warn!(
                    policy = ?self.policy,
                    running = in_flight.len(),
                    "Previous cycle still running, skipping this trigger"
                );
                TriggerOutcome::Skipped
            }
        }
    }

    /// Tick until shutdown, then give running cycles a grace period.
    #[instrument(skip_all, fields(poll_interval = ?self.poll_interval, policy = ?self.policy))]
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("Starting scheduler");

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.trigger();
                }
                _ = shutdown.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        self.drain(SHUTDOWN_GRACE).await;
        info!("Scheduler stopped");
    }

    /// Wait up to `grace` for in-flight cycles, aborting whatever is left.
    async fn drain(&self, grace: Duration) {
        let mut in_flight = std::mem::take(
            &mut *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if in_flight.is_empty() {
            return;
        }

        let waiting = in_flight.len();
        let finished = tokio::time::timeout(grace, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;

        match finished {
            Ok(()) => info!(cycles = waiting, "In-flight cycles finished"),
            Err(_) => {
                error!(
                    remaining = in_flight.len(),
                    "Timeout waiting for in-flight cycles, aborting them"
                );
                in_flight.shutdown().await;
            }
        }
    }

    pub fn running_cycles(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
